mod ack;
mod ccb;
mod frame;
mod wmo;

pub use ack::*;
pub use ccb::*;
pub use frame::*;
pub use wmo::*;

/// Leading message header: 8-digit size plus a 2-char type tag.
pub const MSG_HDR_LEN: usize = 10;
/// Product header: SOH, CRCRLF, 5-digit seqno, 10-digit queue time, CRCRLF.
pub const PROD_HDR_LEN: usize = 22;
/// Bytes on the wire before the payload starts.
pub const HDR_LEN: usize = MSG_HDR_LEN + PROD_HDR_LEN;
/// Ack frame: 5-digit seqno plus a single code byte.
pub const ACK_LEN: usize = 6;

/// Sequence numbers wrap modulo `MAX_PROD_SEQNO + 1`.
pub const MAX_PROD_SEQNO: u32 = 99_999;
/// `msg_size` is carried in 8 ASCII digits.
pub const MAX_MSG_SIZE: u64 = 99_999_999;
/// Largest payload a single frame can declare.
pub const MAX_PROD_SIZE: u64 = MAX_MSG_SIZE - PROD_HDR_LEN as u64;

fn dec_field(buf: &[u8]) -> Option<u64> {
    let mut val: u64 = 0;
    for &b in buf {
        if !b.is_ascii_digit() {
            return None;
        }
        val = val * 10 + (b - b'0') as u64;
    }
    Some(val)
}
