//! The network demultiplexer.
//!
//! [`Network::open`] splits the CAN adapter in two. The receive half goes to
//! a dedicated reader task whose only job is to hand timestamped frames to
//! the event loop over a queue; the transmit half is owned by the event loop
//! itself. The loop is the single place where connection state is touched:
//! it multiplexes inbound frames (routed by receive identifier), application
//! commands and timer expiries over one `select!`, so no locking is needed
//! anywhere in the protocol engine.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use can_io_interface::{
    AsyncRxFrameIo, AsyncTxFrameIo, CanFrame, Frame, Id, LinkError, SplitTxRx, id_from_raw,
};
use log::{debug, error, trace, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ConnectionOptions;
use crate::connection::{ConnEvents, ConnKey, Connection, FrameOrigin, Outbound, Timers};
use crate::errors::{NetworkError, TransferError};
use crate::pdu::{self, MAX_SF_PAYLOAD, Pdu};
use crate::protocol::{IsoTpProtocol, IsoTpTransport, spawn_protocol_pump};
use crate::stream::{IsoTpReader, IsoTpWriter};
use crate::timer::TimerQueue;

const COMMAND_QUEUE_DEPTH: usize = 32;
const FRAME_QUEUE_DEPTH: usize = 64;

pub(crate) enum Command {
    Connect {
        tx_id: Id,
        rx_id: Id,
        opts: ConnectionOptions,
        reply: oneshot::Sender<Result<ConnParts, NetworkError>>,
    },
    Write {
        key: ConnKey,
        payload: Vec<u8>,
        done: Option<oneshot::Sender<Result<(), NetworkError>>>,
    },
    CloseConnection {
        key: ConnKey,
    },
    Datagram {
        id: Id,
        payload: Vec<u8>,
        done: oneshot::Sender<Result<(), NetworkError>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

pub(crate) struct ConnParts {
    pub(crate) key: ConnKey,
    pub(crate) events: ConnEvents,
}

/// Closes the connection when the last application handle goes away.
#[derive(Debug)]
pub(crate) struct ConnGuard {
    cmd: mpsc::Sender<Command>,
    key: ConnKey,
}

impl ConnGuard {
    pub(crate) fn cmd(&self) -> &mpsc::Sender<Command> {
        &self.cmd
    }

    pub(crate) fn key(&self) -> ConnKey {
        self.key
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        let _ = self.cmd.try_send(Command::CloseConnection { key: self.key });
    }
}

/// Handle to a running ISO-TP network.
///
/// Dropping the handle (or calling [`Network::close`]) tears down every
/// connection and stops the background tasks.
pub struct Network {
    cmd: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl Network {
    /// Take ownership of a CAN adapter and start the network tasks.
    pub fn open<D>(adapter: D) -> Self
    where
        D: SplitTxRx,
        D::Tx: Send + 'static,
        D::Rx: Send + 'static,
    {
        let (adapter_tx, mut adapter_rx) = adapter.split();
        let (frames_tx, frames_rx) = mpsc::channel::<Result<CanFrame, LinkError>>(FRAME_QUEUE_DEPTH);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);

        // The reader's only job is to hand frames to the event loop.
        tokio::spawn(async move {
            loop {
                match adapter_rx.recv().await {
                    Ok(frame) => {
                        if frames_tx.send(Ok(frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = frames_tx.send(Err(err)).await;
                        break;
                    }
                }
            }
        });

        let event_loop = EventLoop {
            tx: adapter_tx,
            connections: HashMap::new(),
            timers: TimerQueue::new(),
            outq: VecDeque::new(),
        };
        let task = tokio::spawn(event_loop.run(frames_rx, cmd_rx));

        Self { cmd: cmd_tx, task }
    }

    /// Open a connection exposed as a pull-style reader/writer pair.
    pub async fn open_connection(
        &self,
        tx_id: u32,
        rx_id: u32,
        opts: ConnectionOptions,
    ) -> Result<(IsoTpReader, IsoTpWriter), NetworkError> {
        let (parts, guard) = self.connect(tx_id, rx_id, opts).await?;
        Ok(crate::stream::pair(parts, guard))
    }

    /// Open a connection driven by push-style protocol callbacks.
    ///
    /// The returned protocol instance is shared with the pump task that
    /// invokes its callbacks; lock it to inspect accumulated state from the
    /// caller's side.
    pub async fn create_connection<P, F>(
        &self,
        factory: F,
        tx_id: u32,
        rx_id: u32,
        opts: ConnectionOptions,
    ) -> Result<(IsoTpTransport, Arc<Mutex<P>>), NetworkError>
    where
        P: IsoTpProtocol + Send + 'static,
        F: FnOnce() -> P,
    {
        let (parts, guard) = self.connect(tx_id, rx_id, opts).await?;
        let protocol = Arc::new(Mutex::new(factory()));
        let transport = IsoTpTransport::new(Arc::clone(&guard));
        protocol
            .lock()
            .expect("fresh protocol lock")
            .connection_made(transport.clone());
        spawn_protocol_pump(parts.events, Arc::clone(&protocol));
        Ok((transport, protocol))
    }

    /// Fire a payload of at most 7 bytes as one Single Frame, without a
    /// connection.
    pub async fn send_datagram(&self, tx_id: u32, payload: &[u8]) -> Result<(), NetworkError> {
        if payload.is_empty() || payload.len() > MAX_SF_PAYLOAD {
            return Err(TransferError::Protocol.into());
        }
        let id = id_from_raw(tx_id, None).ok_or(NetworkError::InvalidConfig("tx id out of range"))?;
        let (done, wait) = oneshot::channel();
        self.cmd
            .send(Command::Datagram {
                id,
                payload: payload.to_vec(),
                done,
            })
            .await
            .map_err(|_| NetworkError::ConnectionClosed)?;
        wait.await.map_err(|_| NetworkError::ConnectionClosed)?
    }

    /// Shut the network down, tearing down every connection.
    pub async fn close(self) {
        let (done, wait) = oneshot::channel();
        if self.cmd.send(Command::Shutdown { done }).await.is_ok() {
            let _ = wait.await;
        }
        let _ = self.task.await;
    }

    async fn connect(
        &self,
        tx_id: u32,
        rx_id: u32,
        opts: ConnectionOptions,
    ) -> Result<(ConnParts, Arc<ConnGuard>), NetworkError> {
        opts.validate().map_err(NetworkError::InvalidConfig)?;
        let tx = id_from_raw(tx_id, opts.extended_id)
            .ok_or(NetworkError::InvalidConfig("tx id out of range"))?;
        let rx = id_from_raw(rx_id, opts.extended_id)
            .ok_or(NetworkError::InvalidConfig("rx id out of range"))?;

        let (reply, wait) = oneshot::channel();
        self.cmd
            .send(Command::Connect {
                tx_id: tx,
                rx_id: rx,
                opts,
                reply,
            })
            .await
            .map_err(|_| NetworkError::ConnectionClosed)?;
        let parts = wait.await.map_err(|_| NetworkError::ConnectionClosed)??;
        let guard = Arc::new(ConnGuard {
            cmd: self.cmd.clone(),
            key: parts.key,
        });
        Ok((parts, guard))
    }
}

fn clone_link(err: &LinkError) -> LinkError {
    match err {
        LinkError::WouldBlock => LinkError::WouldBlock,
        LinkError::Closed => LinkError::Closed,
        LinkError::Bus(io_err) => LinkError::Bus(io::Error::new(io_err.kind(), io_err.to_string())),
    }
}

struct EventLoop<Tx> {
    tx: Tx,
    connections: HashMap<ConnKey, Connection>,
    timers: Timers,
    outq: VecDeque<(Option<ConnKey>, Outbound)>,
}

impl<Tx: AsyncTxFrameIo> EventLoop<Tx> {
    async fn run(
        mut self,
        mut frames: mpsc::Receiver<Result<CanFrame, LinkError>>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        loop {
            let deadline = self.timers.next_deadline();
            let wake = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(Ok(frame)) => {
                        self.on_frame(frame);
                        if self.flush().await.is_err() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        error!("CAN adapter failed: {err}");
                        self.teardown(Some(err));
                        break;
                    }
                    None => {
                        self.teardown(Some(LinkError::Closed));
                        break;
                    }
                },
                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        let shutdown = self.on_command(cmd);
                        if self.flush().await.is_err() || shutdown {
                            break;
                        }
                    }
                    // Every handle is gone; nothing can reach us any more.
                    None => {
                        self.teardown(None);
                        break;
                    }
                },
                _ = tokio::time::sleep_until(wake), if deadline.is_some() => {
                    self.on_timers();
                    if self.flush().await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    fn on_frame(&mut self, frame: CanFrame) {
        let key = ConnKey::from(frame.id());
        let now = Instant::now();
        match self.connections.get_mut(&key) {
            Some(conn) => {
                let out = conn.handle_frame(frame.data(), now, &mut self.timers);
                self.enqueue(Some(key), out);
            }
            None => trace!("no connection bound for {:?}; frame dropped", frame.id()),
        }
    }

    fn on_command(&mut self, cmd: Command) -> bool {
        let now = Instant::now();
        match cmd {
            Command::Connect {
                tx_id,
                rx_id,
                opts,
                reply,
            } => {
                let key = ConnKey::from(rx_id);
                if self.connections.contains_key(&key) {
                    let _ = reply.send(Err(NetworkError::DuplicateRxId));
                    return false;
                }
                let (conn, events) = Connection::new(key, tx_id, opts);
                self.connections.insert(key, conn);
                debug!("connection bound: rx {rx_id:?} -> tx {tx_id:?}");
                let _ = reply.send(Ok(ConnParts { key, events }));
            }
            Command::Write { key, payload, done } => match self.connections.get_mut(&key) {
                Some(conn) => {
                    let out = conn.push_write(payload, done, now, &mut self.timers);
                    self.enqueue(Some(key), out);
                }
                None => {
                    if let Some(done) = done {
                        let _ = done.send(Err(NetworkError::ConnectionClosed));
                    }
                }
            },
            Command::CloseConnection { key } => {
                if let Some(mut conn) = self.connections.remove(&key) {
                    conn.close(None, &mut self.timers);
                    debug!("connection unbound: {key:?}");
                }
            }
            Command::Datagram { id, payload, done } => {
                match pdu::encode(id, &Pdu::SingleFrame { data: &payload }, None) {
                    Ok(frame) => {
                        let outbound = Outbound {
                            frame,
                            origin: FrameOrigin::Transfer,
                            completes: Some(done),
                        };
                        self.outq.push_back((None, outbound));
                    }
                    Err(err) => {
                        let _ = done.send(Err(err.into()));
                    }
                }
            }
            Command::Shutdown { done } => {
                self.teardown(None);
                let _ = done.send(());
                return true;
            }
        }
        false
    }

    fn on_timers(&mut self) {
        let now = Instant::now();
        while let Some((key, kind)) = self.timers.pop_expired(now) {
            if let Some(conn) = self.connections.get_mut(&key) {
                let out = conn.handle_timer(kind, now, &mut self.timers);
                self.enqueue(Some(key), out);
            }
        }
    }

    fn enqueue(&mut self, key: Option<ConnKey>, out: Vec<Outbound>) {
        for outbound in out {
            self.outq.push_back((key, outbound));
        }
    }

    /// Transmit everything the state machines produced, serialized and in
    /// order. A backend that reports `WouldBlock` is retried until its N_As
    /// budget runs out; bus errors are fatal for the whole network.
    async fn flush(&mut self) -> Result<(), ()> {
        while let Some((key, mut outbound)) = self.outq.pop_front() {
            let n_as = key
                .and_then(|k| self.connections.get(&k))
                .map(|conn| conn.opts().n_as)
                .unwrap_or(Duration::from_millis(1000));
            let deadline = Instant::now() + n_as;

            let sent = loop {
                match tokio::time::timeout_at(deadline, self.tx.send(&outbound.frame)).await {
                    Ok(Ok(())) => break Ok(()),
                    Ok(Err(LinkError::WouldBlock)) => {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        if Instant::now() >= deadline {
                            break Err(None);
                        }
                    }
                    Ok(Err(err)) => break Err(Some(err)),
                    Err(_) => break Err(None),
                }
            };

            match sent {
                Ok(()) => {
                    if let Some(done) = outbound.completes.take() {
                        let _ = done.send(Ok(()));
                    }
                }
                Err(Some(err)) => {
                    error!("CAN adapter failed while sending: {err}");
                    if let Some(done) = outbound.completes.take() {
                        let _ = done.send(Err(NetworkError::Adapter(clone_link(&err))));
                    }
                    self.teardown(Some(err));
                    return Err(());
                }
                Err(None) => {
                    warn!("adapter did not accept frame within N_As");
                    if let Some(done) = outbound.completes.take() {
                        let _ = done.send(Err(TransferError::TransmitTimeout.into()));
                    }
                    if let Some(key) = key {
                        let now = Instant::now();
                        if let Some(conn) = self.connections.get_mut(&key) {
                            let more = conn.on_send_failed(outbound.origin, now, &mut self.timers);
                            self.enqueue(Some(key), more);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn teardown(&mut self, reason: Option<LinkError>) {
        for (_, mut conn) in self.connections.drain() {
            let per_conn = reason.as_ref().map(clone_link);
            conn.close(per_conn, &mut self.timers);
        }
        // Unsent frames die with the network.
        for (_, outbound) in self.outq.drain(..) {
            if let Some(done) = outbound.completes {
                let _ = done.send(Err(NetworkError::ConnectionClosed));
            }
        }
    }
}
