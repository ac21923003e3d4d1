//! Encode and decode ISO-TP protocol control information.
//!
//! Classic CAN only: every PDU fits in 8 data bytes and First Frame lengths
//! use the 12-bit encoding. The CAN FD escape encodings (SF_DL byte, 32-bit
//! FF_DL) are treated as malformed.

use std::time::Duration;

use can_io_interface::{CanFrame, Frame, Id};

use crate::errors::TransferError;

/// Largest payload a single ISO-TP message can carry (12-bit First Frame length).
pub const MAX_PAYLOAD_LEN: usize = 4095;
/// Application bytes in a Single Frame.
pub const MAX_SF_PAYLOAD: usize = 7;
/// Application bytes in a First Frame.
pub const FF_PAYLOAD: usize = 6;
/// Application bytes in a Consecutive Frame.
pub const MAX_CF_PAYLOAD: usize = 7;

/// Flow control status nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    /// Clear to send more consecutive frames.
    ClearToSend,
    /// Hold off and await another flow control frame.
    Wait,
    /// Receiver cannot take the announced payload; abort.
    Overflow,
}

/// Parsed ISO-TP Protocol Data Unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu<'a> {
    /// Complete payload in one frame.
    SingleFrame { data: &'a [u8] },
    /// Start of a segmented transfer: total length plus the first six bytes.
    FirstFrame { len: u16, data: &'a [u8] },
    /// Continuation carrying a 4-bit sequence number.
    ConsecutiveFrame { sn: u8, data: &'a [u8] },
    /// Receiver feedback regulating the sender.
    FlowControl {
        status: FlowStatus,
        /// Consecutive frames allowed per block (0 = unlimited).
        block_size: u8,
        /// STmin in its raw wire encoding.
        st_min: u8,
    },
}

/// Build the CAN frame for a PDU, padding to 8 bytes when configured.
pub fn encode(id: Id, pdu: &Pdu<'_>, padding: Option<u8>) -> Result<CanFrame, TransferError> {
    let mut buf = [0u8; 8];
    let used = match pdu {
        Pdu::SingleFrame { data } => {
            if data.is_empty() || data.len() > MAX_SF_PAYLOAD {
                return Err(TransferError::Protocol);
            }
            buf[0] = data.len() as u8;
            buf[1..1 + data.len()].copy_from_slice(data);
            1 + data.len()
        }
        Pdu::FirstFrame { len, data } => {
            if usize::from(*len) <= MAX_SF_PAYLOAD
                || usize::from(*len) > MAX_PAYLOAD_LEN
                || data.len() != FF_PAYLOAD
            {
                return Err(TransferError::Protocol);
            }
            buf[0] = 0x10 | ((*len >> 8) as u8 & 0x0F);
            buf[1] = (*len & 0xFF) as u8;
            buf[2..8].copy_from_slice(data);
            8
        }
        Pdu::ConsecutiveFrame { sn, data } => {
            if data.is_empty() || data.len() > MAX_CF_PAYLOAD {
                return Err(TransferError::Protocol);
            }
            buf[0] = 0x20 | (sn & 0x0F);
            buf[1..1 + data.len()].copy_from_slice(data);
            1 + data.len()
        }
        Pdu::FlowControl {
            status,
            block_size,
            st_min,
        } => {
            let nibble = match status {
                FlowStatus::ClearToSend => 0x0,
                FlowStatus::Wait => 0x1,
                FlowStatus::Overflow => 0x2,
            };
            buf[0] = 0x30 | nibble;
            buf[1] = *block_size;
            buf[2] = *st_min;
            3
        }
    };

    let used = match padding {
        Some(pad) => {
            for b in buf[used..].iter_mut() {
                *b = pad;
            }
            8
        }
        None => used,
    };

    CanFrame::new(id, &buf[..used]).ok_or(TransferError::Protocol)
}

/// Decode raw CAN data into a PDU view.
///
/// Padding bytes beyond the declared content survive in the returned slices
/// for CF/FF; the receive machine copies only what the transfer still needs.
/// A frame whose data is shorter than its PCI demands is malformed.
pub fn decode(data: &[u8]) -> Result<Pdu<'_>, TransferError> {
    let pci = *data.first().ok_or(TransferError::Protocol)?;
    match pci >> 4 {
        0x0 => {
            let len = (pci & 0x0F) as usize;
            if len == 0 || len > MAX_SF_PAYLOAD || data.len() < 1 + len {
                return Err(TransferError::Protocol);
            }
            Ok(Pdu::SingleFrame {
                data: &data[1..1 + len],
            })
        }
        0x1 => {
            // A First Frame always occupies the full 8 data bytes.
            if data.len() < 8 {
                return Err(TransferError::Protocol);
            }
            let len = (((pci & 0x0F) as u16) << 8) | data[1] as u16;
            if usize::from(len) <= MAX_SF_PAYLOAD {
                // Covers len == 0, the CAN FD 32-bit length escape.
                return Err(TransferError::Protocol);
            }
            Ok(Pdu::FirstFrame {
                len,
                data: &data[2..8],
            })
        }
        0x2 => {
            if data.len() < 2 {
                return Err(TransferError::Protocol);
            }
            Ok(Pdu::ConsecutiveFrame {
                sn: pci & 0x0F,
                data: &data[1..],
            })
        }
        0x3 => {
            if data.len() < 3 {
                return Err(TransferError::Protocol);
            }
            let status = match pci & 0x0F {
                0x0 => FlowStatus::ClearToSend,
                0x1 => FlowStatus::Wait,
                0x2 => FlowStatus::Overflow,
                _ => return Err(TransferError::Protocol),
            };
            Ok(Pdu::FlowControl {
                status,
                block_size: data[1],
                st_min: data[2],
            })
        }
        _ => Err(TransferError::Protocol),
    }
}

/// Decode an STmin byte into the gap the sender must honor.
///
/// Reserved values decode to 127 ms, the most conservative bound the
/// millisecond range allows.
pub fn st_min_to_duration(raw: u8) -> Duration {
    match raw {
        0x00..=0x7F => Duration::from_millis(raw as u64),
        0xF1..=0xF9 => Duration::from_micros((raw as u64 - 0xF0) * 100),
        _ => Duration::from_millis(127),
    }
}

/// Encode a Duration into an STmin byte, clamping to the supported range.
pub fn duration_to_st_min(duration: Duration) -> u8 {
    let micros = duration.as_micros();
    if micros == 0 {
        return 0;
    }
    if (100..=900).contains(&micros) && micros.is_multiple_of(100) {
        return 0xF0 + (micros / 100) as u8;
    }
    let millis = duration.as_millis();
    if millis <= 0x7F { millis as u8 } else { 0x7F }
}

#[cfg(test)]
mod tests {
    use super::*;
    use can_io_interface::StandardId;

    fn sid(id: u16) -> Id {
        Id::Standard(StandardId::new(id).unwrap())
    }

    #[test]
    fn encode_and_decode_single_frame() {
        let frame = encode(
            sid(0x123),
            &Pdu::SingleFrame {
                data: &[0xAA, 0xBB, 0xCC],
            },
            None,
        )
        .unwrap();
        assert_eq!(frame.data(), &[0x03, 0xAA, 0xBB, 0xCC]);
        match decode(frame.data()).unwrap() {
            Pdu::SingleFrame { data } => assert_eq!(data, &[0xAA, 0xBB, 0xCC]),
            other => panic!("wrong PDU decoded: {other:?}"),
        }
    }

    #[test]
    fn padding_fills_to_eight_bytes() {
        let frame = encode(sid(0x100), &Pdu::SingleFrame { data: b"hi" }, Some(0xCC)).unwrap();
        assert_eq!(
            frame.data(),
            &[0x02, 0x68, 0x69, 0xCC, 0xCC, 0xCC, 0xCC, 0xCC]
        );
    }

    #[test]
    fn encode_and_decode_first_and_consecutive() {
        let payload: Vec<u8> = (0..20).collect();
        let ff = encode(
            sid(0x201),
            &Pdu::FirstFrame {
                len: payload.len() as u16,
                data: &payload[..6],
            },
            None,
        )
        .unwrap();
        assert_eq!(&ff.data()[..2], &[0x10, 0x14]);
        match decode(ff.data()).unwrap() {
            Pdu::FirstFrame { len, data } => {
                assert_eq!(len, 20);
                assert_eq!(data, &payload[..6]);
            }
            other => panic!("unexpected PDU: {other:?}"),
        }

        let cf = encode(
            sid(0x201),
            &Pdu::ConsecutiveFrame {
                sn: 1,
                data: &payload[6..13],
            },
            None,
        )
        .unwrap();
        match decode(cf.data()).unwrap() {
            Pdu::ConsecutiveFrame { sn, data } => {
                assert_eq!(sn, 1);
                assert_eq!(data, &payload[6..13]);
            }
            other => panic!("unexpected PDU: {other:?}"),
        }
    }

    #[test]
    fn flow_control_round_trip() {
        let frame = encode(
            sid(0x333),
            &Pdu::FlowControl {
                status: FlowStatus::ClearToSend,
                block_size: 4,
                st_min: 10,
            },
            None,
        )
        .unwrap();
        assert_eq!(frame.data(), &[0x30, 0x04, 0x0A]);
        match decode(frame.data()).unwrap() {
            Pdu::FlowControl {
                status,
                block_size,
                st_min,
            } => {
                assert_eq!(status, FlowStatus::ClearToSend);
                assert_eq!(block_size, 4);
                assert_eq!(st_min, 10);
            }
            other => panic!("unexpected PDU: {other:?}"),
        }
    }

    #[test]
    fn short_first_frame_lengths_are_malformed() {
        // Declared length of 7 would have fit in a Single Frame.
        assert!(decode(&[0x10, 0x07, 1, 2, 3, 4, 5, 6]).is_err());
        // The FD 32-bit escape (FF_DL = 0) is out of scope.
        assert!(decode(&[0x10, 0x00, 1, 2, 3, 4, 5, 6]).is_err());
        // Truncated First Frame.
        assert!(decode(&[0x10, 0x14, 1, 2]).is_err());
    }

    #[test]
    fn truncated_frames_are_malformed() {
        // SF claiming 5 bytes but carrying 2.
        assert!(decode(&[0x05, 1, 2]).is_err());
        // SF with zero length (FD escape).
        assert!(decode(&[0x00]).is_err());
        // CF with no data, FC with no parameters.
        assert!(decode(&[0x21]).is_err());
        assert!(decode(&[0x30, 0x00]).is_err());
        // Reserved flow status.
        assert!(decode(&[0x33, 0x00, 0x00]).is_err());
        assert!(decode(&[]).is_err());
    }

    #[test]
    fn st_min_conversions() {
        assert_eq!(st_min_to_duration(0x00), Duration::ZERO);
        assert_eq!(st_min_to_duration(0x7F), Duration::from_millis(127));
        assert_eq!(st_min_to_duration(0xF1), Duration::from_micros(100));
        assert_eq!(st_min_to_duration(0xF9), Duration::from_micros(900));
        // Reserved encodings fall back to the conservative bound.
        assert_eq!(st_min_to_duration(0x80), Duration::from_millis(127));
        assert_eq!(st_min_to_duration(0xF0), Duration::from_millis(127));
        assert_eq!(st_min_to_duration(0xFF), Duration::from_millis(127));

        assert_eq!(duration_to_st_min(Duration::ZERO), 0);
        assert_eq!(duration_to_st_min(Duration::from_millis(10)), 0x0A);
        assert_eq!(duration_to_st_min(Duration::from_micros(300)), 0xF3);
        assert_eq!(duration_to_st_min(Duration::from_secs(9)), 0x7F);
    }
}
