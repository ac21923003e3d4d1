//! Pull-style view of a connection.
//!
//! [`IsoTpReader`] yields whole reassembled payloads; [`IsoTpWriter`]
//! enqueues payloads and can await their transmission. Message boundaries
//! are preserved: one `read` returns exactly one ISO-TP message.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::connection::{ConnEvent, ConnEvents};
use crate::errors::NetworkError;
use crate::network::{Command, ConnGuard, ConnParts};

pub(crate) fn pair(parts: ConnParts, guard: Arc<ConnGuard>) -> (IsoTpReader, IsoTpWriter) {
    (
        IsoTpReader {
            events: parts.events,
            _guard: Arc::clone(&guard),
        },
        IsoTpWriter {
            guard,
            pending: Vec::new(),
        },
    )
}

/// Receiving end of a connection.
#[derive(Debug)]
pub struct IsoTpReader {
    events: ConnEvents,
    _guard: Arc<ConnGuard>,
}

impl IsoTpReader {
    /// Wait for the next complete payload.
    ///
    /// `max` is advisory: a payload larger than `max` is still returned
    /// whole, never split, so message boundaries survive.
    ///
    /// Per-message failures on the receive side (sequence mismatch,
    /// reassembly timeout) surface as errors here without closing the
    /// connection; the following `read` observes the next message.
    pub async fn read(&mut self, max: usize) -> Result<Vec<u8>, NetworkError> {
        let _ = max;
        match self.events.recv().await {
            Some(ConnEvent::Payload(payload)) => Ok(payload),
            Some(ConnEvent::Failed(err)) => Err(err.into()),
            Some(ConnEvent::Lost(err)) => Err(NetworkError::Adapter(err)),
            None => Err(NetworkError::ConnectionClosed),
        }
    }
}

/// Sending end of a connection.
#[derive(Debug)]
pub struct IsoTpWriter {
    guard: Arc<ConnGuard>,
    pending: Vec<oneshot::Receiver<Result<(), NetworkError>>>,
}

impl IsoTpWriter {
    /// Enqueue one payload as one ISO-TP message.
    ///
    /// Payloads on the same connection transmit in submission order, one in
    /// flight at a time. This suspends only while the network task's command
    /// queue is full; await [`IsoTpWriter::drain`] for transmission itself.
    pub async fn write(&mut self, payload: &[u8]) -> Result<(), NetworkError> {
        let (done, wait) = oneshot::channel();
        self.guard
            .cmd()
            .send(Command::Write {
                key: self.guard.key(),
                payload: payload.to_vec(),
                done: Some(done),
            })
            .await
            .map_err(|_| NetworkError::ConnectionClosed)?;
        self.pending.push(wait);
        Ok(())
    }

    /// Wait until every enqueued payload has been transmitted.
    ///
    /// Returns the first failure among them, if any; later payloads still
    /// ran their course (a per-message abort does not stop the queue).
    pub async fn drain(&mut self) -> Result<(), NetworkError> {
        let mut first_err = None;
        for wait in self.pending.drain(..) {
            let result = match wait.await {
                Ok(result) => result,
                Err(_) => Err(NetworkError::ConnectionClosed),
            };
            if let Err(err) = result
                && first_err.is_none()
            {
                first_err = Some(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Close the connection, failing any still-queued writes.
    pub async fn close(self) {
        let _ = self
            .guard
            .cmd()
            .send(Command::CloseConnection {
                key: self.guard.key(),
            })
            .await;
    }
}
