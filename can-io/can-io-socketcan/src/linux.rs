use std::io;
use std::sync::Arc;
use std::time::Instant;

use can_io_interface::{AsyncRxFrameIo, AsyncTxFrameIo, CanFrame, Frame, LinkError, SplitTxRx};
use log::trace;
use socketcan::tokio::CanSocket;
use socketcan::{CanFrame as RawFrame, SocketOptions};

fn bus_error(err: io::Error) -> LinkError {
    LinkError::Bus(err)
}

/// SocketCAN adapter backed by a tokio socket.
///
/// The socket is shared between the split halves; the kernel serializes
/// concurrent reads and writes on a raw CAN socket.
#[derive(Debug)]
pub struct SocketCan {
    inner: Arc<CanSocket>,
}

impl SocketCan {
    /// Open a SocketCAN interface by name (e.g. `"can0"`).
    pub fn open(iface: &str) -> Result<Self, socketcan::Error> {
        Ok(Self {
            inner: Arc::new(CanSocket::open(iface)?),
        })
    }

    /// Toggle reception of frames this socket sent itself.
    ///
    /// This is the `receive_own_messages` driver option: required for
    /// loopback setups where a connection's tx and rx identifiers are the
    /// same socket's.
    pub fn set_receive_own_messages(&self, on: bool) -> Result<(), socketcan::Error> {
        self.inner.set_recv_own_msgs(on).map_err(socketcan::Error::from)
    }

    /// Borrow the inner socket for driver-specific configuration.
    pub fn as_inner(&self) -> &CanSocket {
        &self.inner
    }
}

impl SplitTxRx for SocketCan {
    type Tx = SocketCanTx;
    type Rx = SocketCanRx;

    fn split(self) -> (SocketCanTx, SocketCanRx) {
        let rx = SocketCanRx {
            inner: Arc::clone(&self.inner),
        };
        (SocketCanTx { inner: self.inner }, rx)
    }
}

/// Transmit half of a [`SocketCan`] adapter.
#[derive(Debug)]
pub struct SocketCanTx {
    inner: Arc<CanSocket>,
}

impl AsyncTxFrameIo for SocketCanTx {
    async fn send(&mut self, frame: &CanFrame) -> Result<(), LinkError> {
        let raw = RawFrame::new(frame.id(), frame.data())
            .ok_or_else(|| LinkError::Bus(io::Error::new(io::ErrorKind::InvalidInput, "bad frame")))?;
        self.inner.write_frame(raw).await.map_err(bus_error)
    }
}

/// Receive half of a [`SocketCan`] adapter.
#[derive(Debug)]
pub struct SocketCanRx {
    inner: Arc<CanSocket>,
}

impl AsyncRxFrameIo for SocketCanRx {
    async fn recv(&mut self) -> Result<CanFrame, LinkError> {
        loop {
            let raw = self.inner.read_frame().await.map_err(bus_error)?;
            match raw {
                RawFrame::Error(frame) => {
                    return Err(LinkError::Bus(io::Error::other(frame.into_error())));
                }
                RawFrame::Remote(_) => {
                    // ISO-TP never uses remote frames; skip them.
                    trace!("ignoring remote frame");
                    continue;
                }
                RawFrame::Data(ref data) => {
                    let frame = CanFrame::new(data.id(), data.data())
                        .ok_or(LinkError::Bus(io::Error::other("empty CAN frame")))?;
                    return Ok(frame.with_timestamp(Instant::now()));
                }
            }
        }
    }
}
