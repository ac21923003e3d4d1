//! Kernel `CAN_ISOTP` socket implementation.

use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use embedded_can::Id;
use socket2::{Domain, Protocol, Socket, Type};
use socketcan::CanAddr;
use thiserror::Error;
use tokio::io::unix::AsyncFd;

/// Kernel ISO-TP socket errors.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the OS.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Invalid configuration passed to the constructor.
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

/// Flow-control profile the kernel advertises to remote senders.
#[derive(Debug, Clone, Copy)]
pub struct FlowControlOptions {
    /// Block size (0 = unlimited).
    pub block_size: u8,
    /// Minimum separation time between consecutive frames.
    pub st_min: Duration,
    /// Maximum WAIT frames before the kernel gives up on a transfer.
    pub wftmax: u8,
}

impl Default for FlowControlOptions {
    fn default() -> Self {
        Self {
            block_size: 0,
            st_min: Duration::ZERO,
            wftmax: 0,
        }
    }
}

/// Kernel ISO-TP socket configuration.
#[derive(Debug, Clone)]
pub struct KernelOptions {
    /// Largest payload accepted into the receive buffer.
    pub max_rx_payload: usize,
    /// Flow-control profile for inbound transfers.
    pub flow_control: FlowControlOptions,
    /// Padding byte for transmitted frames.
    pub tx_padding: Option<u8>,
    /// Expected padding byte on received frames.
    pub rx_padding: Option<u8>,
    /// Frame transmit time hint (N_As/N_Ar) for the kernel.
    pub frame_txtime: Option<Duration>,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            max_rx_payload: 4095,
            flow_control: FlowControlOptions::default(),
            tx_padding: None,
            rx_padding: None,
            frame_txtime: None,
        }
    }
}

/// One kernel-offloaded ISO-TP connection: whole payloads in, whole payloads out.
#[derive(Debug)]
pub struct KernelIsoTp {
    fd: OwnedFd,
    rx_buf: Vec<u8>,
}

impl KernelIsoTp {
    /// Open a kernel ISO-TP socket on `iface` with a fixed identifier pair.
    pub fn open(
        iface: &str,
        rx_id: Id,
        tx_id: Id,
        options: &KernelOptions,
    ) -> Result<Self, Error> {
        if options.max_rx_payload == 0 || options.max_rx_payload > 4095 {
            return Err(Error::InvalidConfig("max_rx_payload must be 1..=4095"));
        }

        let socket = Socket::new(
            Domain::from(libc::AF_CAN),
            Type::DGRAM,
            Some(Protocol::from(libc::CAN_ISOTP)),
        )?;
        socket.set_nonblocking(true)?;

        // All ISO-TP socket options must be applied before binding.
        apply_kernel_options(socket.as_raw_fd(), options)?;

        let addr = CanAddr::from_iface_isotp(iface, rx_id, tx_id).map_err(Error::Io)?;
        socket.bind(&addr.into_sock_addr())?;

        let fd = unsafe { OwnedFd::from_raw_fd(socket.into_raw_fd()) };
        Ok(Self {
            fd,
            rx_buf: vec![0u8; options.max_rx_payload],
        })
    }

    /// Blocking send of one whole payload, bounded by `timeout`.
    pub fn send(&self, payload: &[u8], timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_send(payload)? {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Io(io::Error::from(io::ErrorKind::TimedOut)));
            }
            let ready = poll_fd(self.fd.as_raw_fd(), libc::POLLOUT, deadline - now)?;
            if !ready {
                return Err(Error::Io(io::Error::from(io::ErrorKind::TimedOut)));
            }
        }
    }

    /// Blocking receive of the next whole payload; `None` when `timeout`
    /// elapses first.
    pub fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(payload) = self.try_recv()? {
                return Ok(Some(payload));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let ready = poll_fd(self.fd.as_raw_fd(), libc::POLLIN, deadline - now)?;
            if !ready {
                return Ok(None);
            }
        }
    }

    /// Non-blocking send attempt; `false` means the socket would block.
    pub fn try_send(&self, payload: &[u8]) -> Result<bool, Error> {
        loop {
            let sent = unsafe {
                libc::send(
                    self.fd.as_raw_fd(),
                    payload.as_ptr().cast(),
                    payload.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if sent >= 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(false),
                _ => return Err(Error::Io(err)),
            }
        }
    }

    /// Non-blocking receive attempt; `None` means nothing is queued.
    pub fn try_recv(&mut self) -> Result<Option<Vec<u8>>, Error> {
        loop {
            let read = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    self.rx_buf.as_mut_ptr().cast(),
                    self.rx_buf.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if read > 0 {
                return Ok(Some(self.rx_buf[..read as usize].to_vec()));
            }
            if read == 0 {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "iso-tp socket returned 0 bytes",
                )));
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(None),
                _ => return Err(Error::Io(err)),
            }
        }
    }
}

impl AsRawFd for KernelIsoTp {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Tokio-native async wrapper around [`KernelIsoTp`].
///
/// Uses non-blocking syscalls plus readiness from `AsyncFd`, so kernel
/// ISO-TP sockets integrate into an async runtime without blocked threads.
#[derive(Debug)]
pub struct AsyncKernelIsoTp {
    io: AsyncFd<KernelIsoTp>,
}

impl AsyncKernelIsoTp {
    /// Open a kernel ISO-TP socket and register it with the runtime.
    pub fn open(
        iface: &str,
        rx_id: Id,
        tx_id: Id,
        options: &KernelOptions,
    ) -> Result<Self, Error> {
        let inner = KernelIsoTp::open(iface, rx_id, tx_id, options)?;
        Ok(Self {
            io: AsyncFd::new(inner).map_err(Error::Io)?,
        })
    }

    /// Send one whole payload.
    pub async fn send(&self, payload: &[u8]) -> Result<(), Error> {
        loop {
            if self.io.get_ref().try_send(payload)? {
                return Ok(());
            }
            let mut guard = self.io.writable().await.map_err(Error::Io)?;
            guard.clear_ready();
        }
    }

    /// Receive the next whole payload.
    pub async fn recv(&mut self) -> Result<Vec<u8>, Error> {
        loop {
            if let Some(payload) = self.io.get_mut().try_recv()? {
                return Ok(payload);
            }
            let mut guard = self.io.readable().await.map_err(Error::Io)?;
            guard.clear_ready();
        }
    }

    /// Unwrap into the blocking endpoint.
    pub fn into_inner(self) -> KernelIsoTp {
        self.io.into_inner()
    }
}

fn poll_fd(fd: RawFd, events: i16, timeout: Duration) -> Result<bool, Error> {
    let mut fds = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    loop {
        let res = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
        if res >= 0 {
            return Ok(res > 0);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(Error::Io(err));
    }
}

fn duration_to_nanos_u32(d: Duration) -> u32 {
    d.as_nanos().min(u32::MAX as u128) as u32
}

fn duration_to_isotp_stmin(duration: Duration) -> u8 {
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

fn apply_kernel_options(fd: RawFd, options: &KernelOptions) -> Result<(), Error> {
    let base = build_can_isotp_options(options);
    setsockopt(fd, CAN_ISOTP_OPTS, &base)?;

    let fc = can_isotp_fc_options {
        bs: options.flow_control.block_size,
        stmin: duration_to_isotp_stmin(options.flow_control.st_min),
        wftmax: options.flow_control.wftmax,
    };
    setsockopt(fd, CAN_ISOTP_RECV_FC, &fc)?;
    Ok(())
}

fn setsockopt<T>(fd: RawFd, opt: i32, value: &T) -> Result<(), Error> {
    let res = unsafe {
        libc::setsockopt(
            fd,
            SOL_CAN_ISOTP,
            opt,
            (value as *const T).cast(),
            size_of::<T>() as libc::socklen_t,
        )
    };
    if res < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}

fn build_can_isotp_options(opts: &KernelOptions) -> can_isotp_options {
    let mut flags = 0u32;
    if opts.tx_padding.is_some() {
        flags |= flags::CAN_ISOTP_TX_PADDING;
    }
    if opts.rx_padding.is_some() {
        flags |= flags::CAN_ISOTP_RX_PADDING;
    }

    can_isotp_options {
        flags,
        frame_txtime: opts.frame_txtime.map(duration_to_nanos_u32).unwrap_or(0),
        ext_address: 0,
        txpad_content: opts.tx_padding.unwrap_or(0),
        rxpad_content: opts.rx_padding.unwrap_or(0),
        rx_ext_address: 0,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct can_isotp_options {
    flags: u32,
    frame_txtime: u32,
    ext_address: u8,
    txpad_content: u8,
    rxpad_content: u8,
    rx_ext_address: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct can_isotp_fc_options {
    bs: u8,
    stmin: u8,
    wftmax: u8,
}

const SOL_CAN_ISOTP: i32 = libc::SOL_CAN_BASE + libc::CAN_ISOTP;
const CAN_ISOTP_OPTS: i32 = 1;
const CAN_ISOTP_RECV_FC: i32 = 2;

/// Kernel ISO-TP flag constants.
pub mod flags {
    /// Enable CAN frame padding on the TX path.
    pub const CAN_ISOTP_TX_PADDING: u32 = 0x0004;
    /// Enable CAN frame padding on the RX path.
    pub const CAN_ISOTP_RX_PADDING: u32 = 0x0008;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_struct_layouts() {
        assert_eq!(size_of::<can_isotp_options>(), 12);
        assert_eq!(size_of::<can_isotp_fc_options>(), 3);
    }

    #[test]
    fn stmin_encoding_matches_wire_format() {
        assert_eq!(duration_to_isotp_stmin(Duration::ZERO), 0x00);
        assert_eq!(duration_to_isotp_stmin(Duration::from_millis(10)), 0x0A);
        assert_eq!(duration_to_isotp_stmin(Duration::from_micros(400)), 0xF4);
        assert_eq!(duration_to_isotp_stmin(Duration::from_secs(5)), 0x7F);
    }

    #[test]
    fn duration_to_nanos_clamps() {
        let huge = Duration::from_secs(u32::MAX as u64 + 42);
        assert_eq!(duration_to_nanos_u32(huge), u32::MAX);
    }

    #[test]
    fn padding_options_set_kernel_flags() {
        let opts = KernelOptions {
            tx_padding: Some(0xAA),
            rx_padding: Some(0xBB),
            ..KernelOptions::default()
        };
        let c = build_can_isotp_options(&opts);
        assert_eq!(c.txpad_content, 0xAA);
        assert_eq!(c.rxpad_content, 0xBB);
        assert!(c.flags & flags::CAN_ISOTP_TX_PADDING != 0);
        assert!(c.flags & flags::CAN_ISOTP_RX_PADDING != 0);
    }

}
