//! One ISO-TP connection: an immutable descriptor plus two independent
//! half-duplex machines sharing it.
//!
//! The network task owns every `Connection` and calls into it with decoded
//! frames, timer expiries and queued writes. Each call returns the CAN frames
//! to put on the wire; the connection itself never touches the adapter, so
//! all I/O stays serialized in the network task.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use can_io_interface::{CanFrame, Id, LinkError};
use log::{debug, trace, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::config::ConnectionOptions;
use crate::errors::{NetworkError, TransferError};
use crate::pdu::{self, FlowStatus, MAX_PAYLOAD_LEN, MAX_SF_PAYLOAD, Pdu};
use crate::rx::{RxMachine, RxOutcome};
use crate::timer::{TimerHandle, TimerQueue};
use crate::tx::{CfProgress, TxSession, TxState};

/// Routing key for a connection: identifier width plus raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnKey {
    extended: bool,
    raw: u32,
}

impl From<Id> for ConnKey {
    fn from(id: Id) -> Self {
        Self {
            extended: matches!(id, Id::Extended(_)),
            raw: can_io_interface::id_to_raw(id),
        }
    }
}

/// Per-connection timer discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// Waiting for a Flow Control frame after FF or a block.
    NBs,
    /// Waiting for the next Consecutive Frame while reassembling.
    NCr,
    /// STmin gap before the next Consecutive Frame we send.
    Pace,
    /// Re-evaluate a transfer we stalled with a WAIT frame.
    WaitRetry,
}

pub(crate) type Timers = TimerQueue<(ConnKey, TimerKind)>;

/// Events flowing from the network task to a connection's surfaces.
#[derive(Debug)]
pub(crate) enum ConnEvent {
    /// One complete reassembled payload.
    Payload(Vec<u8>),
    /// A per-message failure; the connection is still usable.
    Failed(TransferError),
    /// The network died underneath the connection.
    Lost(LinkError),
}

/// Receiving side of a connection's event stream.
///
/// Delivery is never lossy: the queue is unbounded, and the backlog count of
/// events handed over but not yet consumed is what stalls remote senders
/// once the application falls behind.
#[derive(Debug)]
pub(crate) struct ConnEvents {
    rx: mpsc::UnboundedReceiver<ConnEvent>,
    backlog: Arc<AtomicUsize>,
}

impl ConnEvents {
    pub(crate) async fn recv(&mut self) -> Option<ConnEvent> {
        let event = self.rx.recv().await;
        if event.is_some() {
            self.backlog.fetch_sub(1, Ordering::AcqRel);
        }
        event
    }
}

/// Which half an outbound frame belongs to, for send-failure attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameOrigin {
    /// SF, FF or CF of the current outbound payload.
    Transfer,
    /// Flow Control emitted by the receive half.
    FlowControl,
}

/// A frame the network task must transmit.
pub(crate) struct Outbound {
    pub(crate) frame: CanFrame,
    pub(crate) origin: FrameOrigin,
    /// Acknowledged once the adapter accepts the frame. Set only on the
    /// final frame of a payload.
    pub(crate) completes: Option<oneshot::Sender<Result<(), NetworkError>>>,
}

impl Outbound {
    fn new(frame: CanFrame, origin: FrameOrigin) -> Self {
        Self {
            frame,
            origin,
            completes: None,
        }
    }
}

struct PendingWrite {
    payload: Vec<u8>,
    done: Option<oneshot::Sender<Result<(), NetworkError>>>,
}

pub(crate) struct Connection {
    key: ConnKey,
    tx_id: Id,
    opts: ConnectionOptions,

    tx_state: TxState,
    write_q: VecDeque<PendingWrite>,
    /// Acknowledgement for the payload currently in flight.
    current_done: Option<oneshot::Sender<Result<(), NetworkError>>>,

    rx: RxMachine,
    events: mpsc::UnboundedSender<ConnEvent>,
    /// Events handed to the surfaces but not yet consumed; new inbound
    /// transfers are stalled while this sits at `recv_queue_depth` or above.
    backlog: Arc<AtomicUsize>,

    nbs: Option<TimerHandle>,
    ncr: Option<TimerHandle>,
    pace: Option<TimerHandle>,
    wait_retry: Option<TimerHandle>,
}

fn cancel(timers: &mut Timers, slot: &mut Option<TimerHandle>) {
    if let Some(handle) = slot.take() {
        timers.cancel(handle);
    }
}

impl Connection {
    pub(crate) fn new(key: ConnKey, tx_id: Id, opts: ConnectionOptions) -> (Self, ConnEvents) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));
        let conn = Self {
            key,
            tx_id,
            opts,
            tx_state: TxState::Idle,
            write_q: VecDeque::new(),
            current_done: None,
            rx: RxMachine::new(),
            events,
            backlog: Arc::clone(&backlog),
            nbs: None,
            ncr: None,
            pace: None,
            wait_retry: None,
        };
        let events = ConnEvents {
            rx: events_rx,
            backlog,
        };
        (conn, events)
    }

    pub(crate) fn opts(&self) -> &ConnectionOptions {
        &self.opts
    }

    // ---- inbound frames ------------------------------------------------

    pub(crate) fn handle_frame(
        &mut self,
        data: &[u8],
        now: Instant,
        timers: &mut Timers,
    ) -> Vec<Outbound> {
        let pdu = match pdu::decode(data) {
            Ok(pdu) => pdu,
            Err(_) => {
                debug!("dropping malformed frame on {:?}", self.key);
                return Vec::new();
            }
        };

        match pdu {
            Pdu::SingleFrame { data } => {
                cancel(timers, &mut self.ncr);
                cancel(timers, &mut self.wait_retry);
                let payload = self.rx.on_single(data);
                self.deliver(ConnEvent::Payload(payload));
                Vec::new()
            }
            Pdu::FirstFrame { len, data } => {
                cancel(timers, &mut self.ncr);
                cancel(timers, &mut self.wait_retry);
                let stall = self.is_stalled();
                let outcome = self.rx.on_first(&self.opts, len, data, stall);
                self.apply_rx_outcome(outcome, now, timers)
            }
            Pdu::ConsecutiveFrame { sn, data } => {
                match self.rx.on_consecutive(&self.opts, sn, data) {
                    Ok(RxOutcome::None) => {
                        if self.rx.is_assembling() {
                            self.restart_ncr(now, timers);
                        }
                        Vec::new()
                    }
                    Ok(outcome) => self.apply_rx_outcome(outcome, now, timers),
                    Err(err) => {
                        cancel(timers, &mut self.ncr);
                        cancel(timers, &mut self.wait_retry);
                        warn!("inbound transfer aborted on {:?}: {err}", self.key);
                        self.deliver(ConnEvent::Failed(err));
                        Vec::new()
                    }
                }
            }
            Pdu::FlowControl {
                status,
                block_size,
                st_min,
            } => self.on_flow_control(status, block_size, st_min, now, timers),
        }
    }

    fn apply_rx_outcome(
        &mut self,
        outcome: RxOutcome,
        now: Instant,
        timers: &mut Timers,
    ) -> Vec<Outbound> {
        match outcome {
            RxOutcome::None => Vec::new(),
            RxOutcome::Completed(payload) => {
                cancel(timers, &mut self.ncr);
                cancel(timers, &mut self.wait_retry);
                self.deliver(ConnEvent::Payload(payload));
                Vec::new()
            }
            RxOutcome::FlowControl(status) => {
                let fc = pdu::encode(
                    self.tx_id,
                    &Pdu::FlowControl {
                        status,
                        block_size: self.opts.block_size,
                        st_min: pdu::duration_to_st_min(self.opts.st_min),
                    },
                    self.opts.padding,
                );
                let frame = match fc {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!("failed to encode flow control: {err}");
                        return Vec::new();
                    }
                };
                match status {
                    FlowStatus::ClearToSend => self.restart_ncr(now, timers),
                    FlowStatus::Wait => {
                        self.wait_retry = Some(
                            timers.schedule(now + self.opts.n_br, (self.key, TimerKind::WaitRetry)),
                        );
                    }
                    FlowStatus::Overflow => {
                        warn!("refusing inbound transfer on {:?}: no room", self.key);
                    }
                }
                vec![Outbound::new(frame, FrameOrigin::FlowControl)]
            }
        }
    }

    fn on_flow_control(
        &mut self,
        status: FlowStatus,
        block_size: u8,
        st_min: u8,
        now: Instant,
        timers: &mut Timers,
    ) -> Vec<Outbound> {
        match std::mem::replace(&mut self.tx_state, TxState::Idle) {
            TxState::WaitingForFc(mut session) => {
                cancel(timers, &mut self.nbs);
                match status {
                    FlowStatus::ClearToSend => {
                        trace!(
                            "clear to send on {:?}: bs={block_size} st_min={st_min:#04x}",
                            self.key
                        );
                        session.apply_cts(block_size, st_min);
                        self.tx_state = TxState::Sending(session);
                        self.emit_cf(now, timers)
                    }
                    FlowStatus::Wait => {
                        session.wait_count = session.wait_count.saturating_add(1);
                        if session.wait_count > self.opts.wait_ceiling {
                            self.abort_tx(TransferError::FlowControlWaitOverflow, now, timers)
                        } else {
                            // The peer is holding us off; give it a fresh N_Bs.
                            self.nbs = Some(
                                timers.schedule(now + self.opts.n_bs, (self.key, TimerKind::NBs)),
                            );
                            self.tx_state = TxState::WaitingForFc(session);
                            Vec::new()
                        }
                    }
                    FlowStatus::Overflow => {
                        self.abort_tx(TransferError::PeerBufferOverflow, now, timers)
                    }
                }
            }
            other => {
                // FC while idle or mid-block transmission is stale.
                trace!("dropping stale flow control on {:?}", self.key);
                self.tx_state = other;
                Vec::new()
            }
        }
    }

    // ---- outbound writes -----------------------------------------------

    pub(crate) fn push_write(
        &mut self,
        payload: Vec<u8>,
        done: Option<oneshot::Sender<Result<(), NetworkError>>>,
        now: Instant,
        timers: &mut Timers,
    ) -> Vec<Outbound> {
        if payload.is_empty() {
            ack(done, Err(TransferError::Protocol.into()));
            return Vec::new();
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            ack(done, Err(TransferError::PayloadTooLarge.into()));
            return Vec::new();
        }

        self.write_q.push_back(PendingWrite { payload, done });
        if self.tx_state.is_idle() {
            self.start_next_write(now, timers)
        } else {
            Vec::new()
        }
    }

    fn start_next_write(&mut self, now: Instant, timers: &mut Timers) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Some(write) = self.write_q.pop_front() {
            if write.payload.len() <= MAX_SF_PAYLOAD {
                match pdu::encode(
                    self.tx_id,
                    &Pdu::SingleFrame {
                        data: &write.payload,
                    },
                    self.opts.padding,
                ) {
                    Ok(frame) => {
                        let mut outbound = Outbound::new(frame, FrameOrigin::Transfer);
                        outbound.completes = write.done;
                        out.push(outbound);
                        // Single frames finish on transmission; keep draining.
                        continue;
                    }
                    Err(err) => {
                        ack(write.done, Err(err.into()));
                        continue;
                    }
                }
            }

            let mut session = TxSession::new(write.payload);
            match session.first_frame(self.tx_id, self.opts.padding) {
                Ok(frame) => {
                    out.push(Outbound::new(frame, FrameOrigin::Transfer));
                    self.current_done = write.done;
                    self.nbs =
                        Some(timers.schedule(now + self.opts.n_bs, (self.key, TimerKind::NBs)));
                    self.tx_state = TxState::WaitingForFc(session);
                    break;
                }
                Err(err) => {
                    ack(write.done, Err(err.into()));
                    continue;
                }
            }
        }
        out
    }

    fn emit_cf(&mut self, now: Instant, timers: &mut Timers) -> Vec<Outbound> {
        let TxState::Sending(mut session) = std::mem::replace(&mut self.tx_state, TxState::Idle)
        else {
            return Vec::new();
        };

        let (frame, progress) = match session.next_cf(self.tx_id, self.opts.padding) {
            Ok(step) => step,
            Err(err) => return self.abort_tx(err, now, timers),
        };

        let mut outbound = Outbound::new(frame, FrameOrigin::Transfer);
        let mut out = Vec::new();
        match progress {
            CfProgress::Done => {
                outbound.completes = self.current_done.take();
                out.push(outbound);
                debug!("transfer complete on {:?}", self.key);
                out.extend(self.start_next_write(now, timers));
            }
            CfProgress::BlockDone => {
                out.push(outbound);
                self.nbs = Some(timers.schedule(now + self.opts.n_bs, (self.key, TimerKind::NBs)));
                self.tx_state = TxState::WaitingForFc(session);
            }
            CfProgress::More => {
                out.push(outbound);
                let gap = session.pace();
                self.pace = Some(timers.schedule(now + gap, (self.key, TimerKind::Pace)));
                self.tx_state = TxState::Sending(session);
            }
        }
        out
    }

    fn abort_tx(&mut self, err: TransferError, now: Instant, timers: &mut Timers) -> Vec<Outbound> {
        warn!("outbound transfer aborted on {:?}: {err}", self.key);
        cancel(timers, &mut self.nbs);
        cancel(timers, &mut self.pace);
        self.tx_state = TxState::Idle;
        ack(self.current_done.take(), Err(err.into()));
        // Per-message aborts never close the connection; keep the queue moving.
        self.start_next_write(now, timers)
    }

    // ---- timers --------------------------------------------------------

    pub(crate) fn handle_timer(
        &mut self,
        kind: TimerKind,
        now: Instant,
        timers: &mut Timers,
    ) -> Vec<Outbound> {
        match kind {
            TimerKind::NBs => {
                self.nbs = None;
                if matches!(self.tx_state, TxState::WaitingForFc(_)) {
                    self.abort_tx(TransferError::FlowControlTimeout, now, timers)
                } else {
                    Vec::new()
                }
            }
            TimerKind::NCr => {
                self.ncr = None;
                if self.rx.is_assembling() {
                    self.rx.reset();
                    warn!("inbound transfer timed out on {:?}", self.key);
                    self.deliver(ConnEvent::Failed(TransferError::ReassemblyTimeout));
                }
                Vec::new()
            }
            TimerKind::Pace => {
                self.pace = None;
                self.emit_cf(now, timers)
            }
            TimerKind::WaitRetry => {
                self.wait_retry = None;
                let stall = self.is_stalled();
                match self.rx.on_wait_retry(&self.opts, stall) {
                    Some(outcome) => self.apply_rx_outcome(outcome, now, timers),
                    None => Vec::new(),
                }
            }
        }
    }

    /// The adapter refused or timed out on one of our frames.
    pub(crate) fn on_send_failed(
        &mut self,
        origin: FrameOrigin,
        now: Instant,
        timers: &mut Timers,
    ) -> Vec<Outbound> {
        match origin {
            FrameOrigin::Transfer => {
                // The completing frame's acknowledgement (if any) has already
                // been failed by the network task.
                self.abort_tx(TransferError::TransmitTimeout, now, timers)
            }
            FrameOrigin::FlowControl => {
                cancel(timers, &mut self.ncr);
                cancel(timers, &mut self.wait_retry);
                if self.rx.is_assembling() {
                    self.rx.reset();
                    self.deliver(ConnEvent::Failed(TransferError::TransmitTimeout));
                }
                Vec::new()
            }
        }
    }

    // ---- lifecycle -----------------------------------------------------

    /// Tear the connection down, failing every pending operation.
    pub(crate) fn close(&mut self, reason: Option<LinkError>, timers: &mut Timers) {
        cancel(timers, &mut self.nbs);
        cancel(timers, &mut self.pace);
        cancel(timers, &mut self.ncr);
        cancel(timers, &mut self.wait_retry);
        self.tx_state = TxState::Idle;
        self.rx.reset();
        ack(self.current_done.take(), Err(NetworkError::ConnectionClosed));
        for write in self.write_q.drain(..) {
            ack(write.done, Err(NetworkError::ConnectionClosed));
        }
        if let Some(err) = reason {
            self.deliver(ConnEvent::Lost(err));
        }
    }

    // ---- helpers -------------------------------------------------------

    /// Whether the application has fallen far enough behind that new inbound
    /// transfers should be held off.
    fn is_stalled(&self) -> bool {
        self.backlog.load(Ordering::Acquire) >= self.opts.recv_queue_depth
    }

    fn deliver(&mut self, event: ConnEvent) {
        // Count before sending so the consumer's decrement can never race
        // the count below zero.
        self.backlog.fetch_add(1, Ordering::AcqRel);
        if self.events.send(event).is_err() {
            self.backlog.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn restart_ncr(&mut self, now: Instant, timers: &mut Timers) {
        cancel(timers, &mut self.ncr);
        self.ncr = Some(timers.schedule(now + self.opts.n_cr, (self.key, TimerKind::NCr)));
    }
}

fn ack(done: Option<oneshot::Sender<Result<(), NetworkError>>>, result: Result<(), NetworkError>) {
    if let Some(done) = done {
        let _ = done.send(result);
    }
}
