use std::io::{Cursor, Write};

use crate::Error;

use super::{dec_field, ACK_LEN, MAX_PROD_SEQNO};

/// Outcome code carried in the last byte of an ack frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    /// `'K'` — product stored, sender may release it.
    Ok,
    /// `'F'` — product refused for good; no retransmission.
    Fail,
    /// `'R'` — transient receiver failure; retransmit the product.
    Retransmit,
}

impl AckCode {
    fn to_byte(self) -> u8 {
        match self {
            AckCode::Ok => b'K',
            AckCode::Fail => b'F',
            AckCode::Retransmit => b'R',
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'K' => Some(AckCode::Ok),
            b'F' => Some(AckCode::Fail),
            b'R' => Some(AckCode::Retransmit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub seqno: u32,
    pub code: AckCode,
}

pub fn format_ack(seqno: u32, code: AckCode) -> Result<[u8; ACK_LEN], Error> {
    if seqno > MAX_PROD_SEQNO {
        return Err(Error::SeqnoOutOfRange(seqno));
    }

    let mut buf = [0u8; ACK_LEN];
    let mut cur = Cursor::new(&mut buf[..]);
    write!(cur, "{seqno:05}")?;
    buf[5] = code.to_byte();
    Ok(buf)
}

pub fn parse_ack(buf: &[u8]) -> Result<Ack, Error> {
    if buf.len() < ACK_LEN {
        return Err(Error::BadAck);
    }

    let seqno = dec_field(&buf[0..5]).ok_or(Error::BadAck)? as u32;
    let code = AckCode::from_byte(buf[5]).ok_or(Error::BadAck)?;

    Ok(Ack { seqno, code })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn round_trip() {
        for seqno in [0, 1, 99_999] {
            for code in [AckCode::Ok, AckCode::Fail, AckCode::Retransmit] {
                let buf = format_ack(seqno, code).unwrap();
                assert_eq!(parse_ack(&buf).unwrap(), Ack { seqno, code });
            }
        }
    }

    #[test]
    fn literal_form() {
        assert_eq!(&format_ack(0, AckCode::Ok).unwrap()[..], b"00000K");
        assert_eq!(&format_ack(123, AckCode::Retransmit).unwrap()[..], b"00123R");
    }

    #[test]
    fn bad_code_rejected() {
        assert!(matches!(parse_ack(b"00000X"), Err(Error::BadAck)));
        assert!(matches!(parse_ack(b"0000K"), Err(Error::BadAck)));
        assert!(matches!(parse_ack(b"0a000K"), Err(Error::BadAck)));
    }

    #[test]
    fn seqno_bound_enforced() {
        assert!(format_ack(MAX_PROD_SEQNO, AckCode::Fail).is_ok());
        assert!(format_ack(MAX_PROD_SEQNO + 1, AckCode::Fail).is_err());
    }
}
