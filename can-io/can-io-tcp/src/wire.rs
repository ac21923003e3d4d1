//! Wire format for CAN frames on a stream socket.
//!
//! Every message is a 5-byte header (`type` byte, little-endian `u32` body
//! length) followed by the body. The only message type both sides of the
//! bridge must understand is [`MSG_FRAME`]; unknown types are skipped so the
//! protocol can grow.
//!
//! A frame body is `flags`, little-endian `u32` identifier, `dlc`, then
//! `dlc` data bytes.

use can_io_interface::{CanFrame, ExtendedId, Frame, Id, StandardId, id_to_raw};

/// A CAN frame in either direction.
pub const MSG_FRAME: u8 = 2;

/// Bytes before the body of any message.
pub const MSG_HDR_LEN: usize = 5;
/// Bytes of a frame body before the data.
pub const FRAME_HDR_LEN: usize = 6;
/// Upper bound on any message body accepted from the peer.
pub const MAX_BODY_LEN: usize = 256;

const FLAG_EXTENDED: u8 = 1 << 1;

/// Encode a message header.
pub fn encode_header(msg_type: u8, body_len: usize) -> [u8; MSG_HDR_LEN] {
    let mut header = [0u8; MSG_HDR_LEN];
    header[0] = msg_type;
    header[1..5].copy_from_slice(&(body_len as u32).to_le_bytes());
    header
}

/// Decode a message header into `(type, body_len)`.
pub fn decode_header(header: &[u8; MSG_HDR_LEN]) -> Result<(u8, usize), &'static str> {
    let len = u32::from_le_bytes(header[1..5].try_into().expect("header slice is 4 bytes")) as usize;
    if len > MAX_BODY_LEN {
        return Err("message body exceeds limit");
    }
    Ok((header[0], len))
}

/// Encode a frame body into `out`, returning the used length.
pub fn encode_frame(out: &mut [u8; FRAME_HDR_LEN + 8], frame: &CanFrame) -> usize {
    let mut flags = 0u8;
    if frame.is_extended() {
        flags |= FLAG_EXTENDED;
    }
    out[0] = flags;
    out[1..5].copy_from_slice(&id_to_raw(frame.id()).to_le_bytes());
    out[5] = frame.data().len() as u8;
    out[FRAME_HDR_LEN..FRAME_HDR_LEN + frame.data().len()].copy_from_slice(frame.data());
    FRAME_HDR_LEN + frame.data().len()
}

/// Decode a frame body.
pub fn decode_frame(body: &[u8]) -> Result<CanFrame, &'static str> {
    if body.len() < FRAME_HDR_LEN {
        return Err("frame body too short");
    }
    let flags = body[0];
    let id_raw = u32::from_le_bytes(body[1..5].try_into().expect("id slice is 4 bytes"));
    let dlc = body[5] as usize;
    if dlc == 0 || dlc > 8 || body.len() != FRAME_HDR_LEN + dlc {
        return Err("invalid dlc");
    }

    let id = if flags & FLAG_EXTENDED != 0 {
        Id::Extended(ExtendedId::new(id_raw).ok_or("invalid extended id")?)
    } else {
        let raw = u16::try_from(id_raw).map_err(|_| "invalid standard id")?;
        Id::Standard(StandardId::new(raw).ok_or("invalid standard id")?)
    };
    CanFrame::new(id, &body[FRAME_HDR_LEN..]).ok_or("invalid frame")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u32, data: &[u8]) -> CanFrame {
        CanFrame::new(can_io_interface::id_from_raw(id, None).unwrap(), data).unwrap()
    }

    #[test]
    fn frame_round_trip() {
        let original = frame(0x123, &[1, 2, 3, 4]);
        let mut buf = [0u8; FRAME_HDR_LEN + 8];
        let used = encode_frame(&mut buf, &original);
        assert_eq!(used, FRAME_HDR_LEN + 4);
        let decoded = decode_frame(&buf[..used]).unwrap();
        assert_eq!(decoded.id(), original.id());
        assert_eq!(decoded.data(), original.data());
    }

    #[test]
    fn extended_ids_round_trip() {
        let original = frame(0x18DA_F101, &[0xAA]);
        let mut buf = [0u8; FRAME_HDR_LEN + 8];
        let used = encode_frame(&mut buf, &original);
        let decoded = decode_frame(&buf[..used]).unwrap();
        assert_eq!(decoded.id(), original.id());
        assert!(decoded.is_extended());
    }

    #[test]
    fn header_round_trip() {
        let header = encode_header(MSG_FRAME, 14);
        assert_eq!(decode_header(&header).unwrap(), (MSG_FRAME, 14));
    }

    #[test]
    fn oversized_body_is_rejected() {
        let header = encode_header(MSG_FRAME, MAX_BODY_LEN + 1);
        assert!(decode_header(&header).is_err());
    }

    #[test]
    fn malformed_bodies_are_rejected() {
        // Truncated header.
        assert!(decode_frame(&[0, 0, 0]).is_err());
        // dlc does not match the body length.
        assert!(decode_frame(&[0, 0x23, 0x01, 0, 0, 4, 1, 2]).is_err());
        // Zero dlc.
        assert!(decode_frame(&[0, 0x23, 0x01, 0, 0, 0]).is_err());
        // Standard-width id out of range.
        assert!(decode_frame(&[0, 0xFF, 0xFF, 0xFF, 0x1F, 1, 9]).is_err());
    }
}
