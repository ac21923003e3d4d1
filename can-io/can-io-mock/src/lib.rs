//! In-process virtual CAN bus.
//!
//! [`VirtualBus`] is a broadcast hub: every frame transmitted by one attached
//! port is delivered, in transmit order, to every other port (and back to the
//! sender itself when loopback is enabled, mirroring a real interface's
//! `receive_own_messages` option). It stands in for a physical bus in tests,
//! examples and benchmarks.
//!
//! ```no_run
//! use can_io_mock::VirtualBus;
//!
//! let bus = VirtualBus::new();
//! let a = bus.attach();
//! let b = bus.attach();
//! // frames sent on `a` arrive on `b` and vice versa
//! # let _ = (a, b);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use can_io_interface::{AsyncRxFrameIo, AsyncTxFrameIo, CanFrame, LinkError, SplitTxRx};
use tokio::sync::mpsc;

#[derive(Default)]
struct Hub {
    ports: Vec<PortSlot>,
}

struct PortSlot {
    port: u64,
    queue: mpsc::UnboundedSender<CanFrame>,
    receive_own: bool,
}

/// A shared in-process CAN bus.
#[derive(Clone, Default)]
pub struct VirtualBus {
    hub: Arc<Mutex<Hub>>,
    next_port: Arc<AtomicU64>,
}

impl VirtualBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new port. The port does not receive its own transmissions.
    pub fn attach(&self) -> VirtualPort {
        self.attach_inner(false)
    }

    /// Attach a port that also receives the frames it transmits itself.
    pub fn attach_with_loopback(&self) -> VirtualPort {
        self.attach_inner(true)
    }

    fn attach_inner(&self, receive_own: bool) -> VirtualPort {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        self.hub.lock().unwrap().ports.push(PortSlot {
            port,
            queue: queue_tx,
            receive_own,
        });
        VirtualPort {
            tx: VirtualTx {
                port,
                hub: Arc::clone(&self.hub),
            },
            rx: VirtualRx { queue: queue_rx },
        }
    }
}

/// One attachment to a [`VirtualBus`].
pub struct VirtualPort {
    tx: VirtualTx,
    rx: VirtualRx,
}

impl SplitTxRx for VirtualPort {
    type Tx = VirtualTx;
    type Rx = VirtualRx;

    fn split(self) -> (VirtualTx, VirtualRx) {
        (self.tx, self.rx)
    }
}

impl AsyncTxFrameIo for VirtualPort {
    async fn send(&mut self, frame: &CanFrame) -> Result<(), LinkError> {
        self.tx.send(frame).await
    }
}

impl AsyncRxFrameIo for VirtualPort {
    async fn recv(&mut self) -> Result<CanFrame, LinkError> {
        self.rx.recv().await
    }
}

/// Transmit half of a virtual port.
pub struct VirtualTx {
    port: u64,
    hub: Arc<Mutex<Hub>>,
}

impl VirtualTx {
    fn broadcast(&self, frame: &CanFrame) {
        let stamped = frame.with_timestamp(Instant::now());
        let mut hub = self.hub.lock().unwrap();
        // Detached receivers are pruned as they are discovered.
        hub.ports.retain(|slot| {
            if slot.port == self.port && !slot.receive_own {
                return true;
            }
            slot.queue.send(stamped).is_ok()
        });
    }
}

impl AsyncTxFrameIo for VirtualTx {
    async fn send(&mut self, frame: &CanFrame) -> Result<(), LinkError> {
        self.broadcast(frame);
        Ok(())
    }
}

impl Drop for VirtualTx {
    fn drop(&mut self) {
        let mut hub = self.hub.lock().unwrap();
        hub.ports.retain(|slot| slot.port != self.port);
    }
}

/// Receive half of a virtual port.
pub struct VirtualRx {
    queue: mpsc::UnboundedReceiver<CanFrame>,
}

impl VirtualRx {
    /// Non-blocking receive, used by synchronous test harnesses.
    pub fn try_recv(&mut self) -> Result<CanFrame, LinkError> {
        self.queue.try_recv().map_err(|err| match err {
            mpsc::error::TryRecvError::Empty => LinkError::WouldBlock,
            mpsc::error::TryRecvError::Disconnected => LinkError::Closed,
        })
    }
}

impl AsyncRxFrameIo for VirtualRx {
    async fn recv(&mut self) -> Result<CanFrame, LinkError> {
        self.queue.recv().await.ok_or(LinkError::Closed)
    }
}
