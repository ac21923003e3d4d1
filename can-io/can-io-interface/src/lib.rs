//! Shared CAN frame type and adapter traits for the `isotp-net` workspace.
//!
//! An ISO-TP network runs on top of any source of classic CAN frames: a
//! kernel SocketCAN socket, an in-process virtual bus, or a TCP bridge that
//! forwards frames from a remote gateway. This crate defines the seam those
//! backends implement so the transport core can treat them uniformly:
//!
//! - [`CanFrame`]: an owned classic CAN 2.0 data frame (up to 8 data bytes)
//!   carrying an optional monotonic receive timestamp.
//! - [`AsyncTxFrameIo`] / [`AsyncRxFrameIo`]: the async send/receive halves.
//! - [`SplitTxRx`]: splitting a driver into independently-owned halves.
//! - [`LinkError`]: the error vocabulary every backend maps into.

#![allow(async_fn_in_trait)]

use std::future::Future;
use std::io;
use std::time::Instant;

use thiserror::Error;

pub use embedded_can::{ExtendedId, Frame, Id, StandardId};

/// Maximum data length of a classic CAN frame.
pub const MAX_DATA_LEN: usize = 8;

/// An owned classic CAN 2.0 data frame.
///
/// Remote frames are not modelled; ISO-TP never uses them and the transport
/// core drops them at the adapter boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanFrame {
    id: Id,
    data: [u8; MAX_DATA_LEN],
    dlc: u8,
    timestamp: Option<Instant>,
}

impl CanFrame {
    /// Returns the CAN identifier for this frame.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Monotonic instant at which the adapter received this frame.
    ///
    /// `None` for locally constructed frames that have not been on the bus.
    pub fn timestamp(&self) -> Option<Instant> {
        self.timestamp
    }

    /// Attach a receive timestamp. Adapters call this on every inbound frame.
    pub fn with_timestamp(mut self, at: Instant) -> Self {
        self.timestamp = Some(at);
        self
    }

    /// Whether the identifier is 29-bit.
    pub fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }
}

impl Frame for CanFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        if data.is_empty() || data.len() > MAX_DATA_LEN {
            return None;
        }
        let mut buf = [0u8; MAX_DATA_LEN];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            id: id.into(),
            data: buf,
            dlc: data.len() as u8,
            timestamp: None,
        })
    }

    fn new_remote(_id: impl Into<Id>, _dlc: usize) -> Option<Self> {
        // Remote transmission requests are not supported on this bus model.
        None
    }

    fn is_extended(&self) -> bool {
        CanFrame::is_extended(self)
    }

    fn is_remote_frame(&self) -> bool {
        false
    }

    fn id(&self) -> Id {
        self.id
    }

    fn dlc(&self) -> usize {
        self.dlc as usize
    }

    fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }
}

/// Build an [`Id`] from a raw identifier value.
///
/// With `extended = None` the width is derived from the value: identifiers
/// that do not fit in 11 bits become 29-bit. Forcing `Some(false)` on a value
/// above `0x7FF` yields `None`.
pub fn id_from_raw(raw: u32, extended: Option<bool>) -> Option<Id> {
    let wide = extended.unwrap_or(raw > StandardId::MAX.as_raw() as u32);
    if wide {
        ExtendedId::new(raw).map(Id::Extended)
    } else {
        u16::try_from(raw)
            .ok()
            .and_then(StandardId::new)
            .map(Id::Standard)
    }
}

/// Raw identifier value of an [`Id`], without the width flag.
pub fn id_to_raw(id: Id) -> u32 {
    match id {
        Id::Standard(id) => id.as_raw() as u32,
        Id::Extended(id) => id.as_raw(),
    }
}

/// Errors surfaced by CAN frame adapters.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The backend cannot accept the frame right now; retry later.
    #[error("operation would block")]
    WouldBlock,
    /// The backend reported a bus or I/O failure.
    #[error("CAN bus error: {0}")]
    Bus(#[from] io::Error),
    /// The backend has been shut down.
    #[error("link closed")]
    Closed,
}

impl LinkError {
    /// Map an I/O error, folding `WouldBlock` into the dedicated variant.
    pub fn from_io(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::WouldBlock {
            LinkError::WouldBlock
        } else {
            LinkError::Bus(err)
        }
    }
}

/// Transmit half of a CAN adapter.
pub trait AsyncTxFrameIo {
    /// Queue one frame for transmission.
    fn send(&mut self, frame: &CanFrame) -> impl Future<Output = Result<(), LinkError>> + Send;
}

/// Receive half of a CAN adapter.
pub trait AsyncRxFrameIo {
    /// Next inbound frame, stamped with a monotonic receive time.
    fn recv(&mut self) -> impl Future<Output = Result<CanFrame, LinkError>> + Send;
}

/// A CAN driver that can be split into independently-owned halves.
pub trait SplitTxRx {
    type Tx: AsyncTxFrameIo;
    type Rx: AsyncRxFrameIo;

    fn split(self) -> (Self::Tx, Self::Rx);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_bounds() {
        assert!(CanFrame::new(StandardId::new(0x123).unwrap(), &[]).is_none());
        assert!(CanFrame::new(StandardId::new(0x123).unwrap(), &[0u8; 9]).is_none());
        let frame = CanFrame::new(StandardId::new(0x123).unwrap(), &[1, 2, 3]).unwrap();
        assert_eq!(frame.dlc(), 3);
        assert_eq!(frame.data(), &[1, 2, 3]);
        assert!(frame.timestamp().is_none());
    }

    #[test]
    fn remote_frames_are_rejected() {
        assert!(CanFrame::new_remote(StandardId::new(0x7F).unwrap(), 4).is_none());
    }

    #[test]
    fn id_width_auto_detection() {
        assert_eq!(
            id_from_raw(0x7FF, None),
            Some(Id::Standard(StandardId::new(0x7FF).unwrap()))
        );
        assert_eq!(
            id_from_raw(0x800, None),
            Some(Id::Extended(ExtendedId::new(0x800).unwrap()))
        );
        // Forcing 29-bit keeps small values extended.
        assert_eq!(
            id_from_raw(0x100, Some(true)),
            Some(Id::Extended(ExtendedId::new(0x100).unwrap()))
        );
        // Forcing 11-bit on an oversized value fails.
        assert_eq!(id_from_raw(0x800, Some(false)), None);
        assert_eq!(id_from_raw(0x2000_0000, None), None);
    }

    #[test]
    fn raw_round_trip() {
        let id = id_from_raw(0x18DA_F101, None).unwrap();
        assert_eq!(id_to_raw(id), 0x18DA_F101);
    }
}
