use std::io::{Cursor, Write};

use crate::Error;

use super::{dec_field, HDR_LEN, MAX_MSG_SIZE, MAX_PROD_SEQNO, MAX_PROD_SIZE, PROD_HDR_LEN};

/*
Every product travels in one frame:

    byte  0..8    zero-padded decimal msg_size (= PROD_HDR_LEN + payload)
    byte  8..10   type tag, "BI" / "AN" / "FX"
    byte 10       0x01 (SOH)
    byte 11..14   \r\r\n
    byte 14..19   zero-padded decimal sequence number
    byte 19..29   zero-padded decimal epoch queue time
    byte 29..32   \r\r\n
    byte 32..     payload

All numbers are ASCII decimal; the separators are literal. The full frame is
10 + msg_size bytes long.
*/

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Binary,
    Announce,
    Fax,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub msg_type: MsgType,
    pub seqno: u32,
    /// Payload bytes following the header.
    pub size: u64,
    /// Epoch seconds at which the sender queued the product.
    pub queue_time: u64,
}

/// Format the 32-byte frame header. The sender always tags frames `BI`.
pub fn format_header(seqno: u32, size: u64, queue_time: u64) -> Result<[u8; HDR_LEN], Error> {
    if size == 0 || size > MAX_PROD_SIZE {
        return Err(Error::SizeOutOfRange(size));
    }
    if seqno > MAX_PROD_SEQNO {
        return Err(Error::SeqnoOutOfRange(seqno));
    }

    let mut buf = [0u8; HDR_LEN];
    let mut cur = Cursor::new(&mut buf[..]);
    write!(
        cur,
        "{:08}BI\x01\r\r\n{:05}{:010}\r\r\n",
        size + PROD_HDR_LEN as u64,
        seqno,
        queue_time % 10_000_000_000
    )?;
    Ok(buf)
}

/// Parse a frame header. Any deviation from the literal layout is rejected.
pub fn parse_header(buf: &[u8]) -> Result<FrameHeader, Error> {
    if buf.len() < HDR_LEN {
        return Err(Error::BadHeader);
    }

    let msg_size = dec_field(&buf[0..8]).ok_or(Error::BadHeader)?;
    if msg_size <= PROD_HDR_LEN as u64 || msg_size > MAX_MSG_SIZE {
        return Err(Error::SizeOutOfRange(msg_size));
    }

    let msg_type = match &buf[8..10] {
        b"BI" => MsgType::Binary,
        b"AN" => MsgType::Announce,
        b"FX" => MsgType::Fax,
        _ => return Err(Error::BadHeader),
    };

    if buf[10] != 0x01 || &buf[11..14] != b"\r\r\n" || &buf[29..32] != b"\r\r\n" {
        return Err(Error::BadHeader);
    }

    let seqno = dec_field(&buf[14..19]).ok_or(Error::BadHeader)? as u32;
    let queue_time = dec_field(&buf[19..29]).ok_or(Error::BadHeader)?;

    Ok(FrameHeader {
        msg_type,
        seqno,
        size: msg_size - PROD_HDR_LEN as u64,
        queue_time,
    })
}
