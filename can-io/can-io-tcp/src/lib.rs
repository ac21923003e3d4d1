//! TCP bridge adapter: CAN frames over a stream socket.
//!
//! Connects to a gateway that forwards frames between a TCP socket and a
//! physical CAN bus, letting an ISO-TP network run on a machine with no CAN
//! hardware of its own. Frames travel in both directions using the small
//! length-prefixed format in [`wire`].

use std::io;
use std::time::Instant;

use can_io_interface::{AsyncRxFrameIo, AsyncTxFrameIo, CanFrame, LinkError, SplitTxRx};
use log::trace;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

pub mod wire;

/// A CAN adapter backed by a TCP connection to a frame gateway.
#[derive(Debug)]
pub struct TcpBridge {
    stream: TcpStream,
}

impl TcpBridge {
    /// Connect to a gateway, e.g. `"gateway.local:2323"`.
    pub async fn connect(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        // Frames are tiny and latency-sensitive.
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Wrap an already-connected stream (e.g. from a listener in tests).
    pub fn from_stream(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl SplitTxRx for TcpBridge {
    type Tx = TcpBridgeTx;
    type Rx = TcpBridgeRx;

    fn split(self) -> (TcpBridgeTx, TcpBridgeRx) {
        let (read, write) = self.stream.into_split();
        (TcpBridgeTx { write }, TcpBridgeRx { read })
    }
}

/// Transmit half of a [`TcpBridge`].
#[derive(Debug)]
pub struct TcpBridgeTx {
    write: OwnedWriteHalf,
}

impl AsyncTxFrameIo for TcpBridgeTx {
    async fn send(&mut self, frame: &CanFrame) -> Result<(), LinkError> {
        let mut body = [0u8; wire::FRAME_HDR_LEN + 8];
        let used = wire::encode_frame(&mut body, frame);
        let header = wire::encode_header(wire::MSG_FRAME, used);
        self.write
            .write_all(&header)
            .await
            .map_err(LinkError::from_io)?;
        self.write
            .write_all(&body[..used])
            .await
            .map_err(LinkError::from_io)?;
        Ok(())
    }
}

/// Receive half of a [`TcpBridge`].
#[derive(Debug)]
pub struct TcpBridgeRx {
    read: OwnedReadHalf,
}

impl AsyncRxFrameIo for TcpBridgeRx {
    async fn recv(&mut self) -> Result<CanFrame, LinkError> {
        loop {
            let mut header = [0u8; wire::MSG_HDR_LEN];
            read_exact_or_closed(&mut self.read, &mut header).await?;
            let (msg_type, body_len) = wire::decode_header(&header)
                .map_err(|msg| LinkError::Bus(invalid_data(msg)))?;

            let mut body = vec![0u8; body_len];
            read_exact_or_closed(&mut self.read, &mut body).await?;

            if msg_type != wire::MSG_FRAME {
                trace!("skipping unknown bridge message type {msg_type}");
                continue;
            }
            let frame = wire::decode_frame(&body).map_err(|msg| LinkError::Bus(invalid_data(msg)))?;
            return Ok(frame.with_timestamp(Instant::now()));
        }
    }
}

async fn read_exact_or_closed(read: &mut OwnedReadHalf, buf: &mut [u8]) -> Result<(), LinkError> {
    match read.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(LinkError::Closed),
        Err(err) => Err(LinkError::Bus(err)),
    }
}

fn invalid_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_owned())
}
