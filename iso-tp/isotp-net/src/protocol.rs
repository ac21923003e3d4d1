//! Push-style view of a connection.
//!
//! An [`IsoTpProtocol`] receives whole payloads through callbacks, driven by
//! a pump task that consumes the same event stream the pull-style reader
//! would. The two views are interchangeable; pick whichever fits the
//! application.

use std::sync::{Arc, Mutex};

use log::warn;

use crate::connection::{ConnEvent, ConnEvents};
use crate::errors::{NetworkError, TransferError};
use crate::network::{Command, ConnGuard};

/// Callbacks for one connection.
pub trait IsoTpProtocol {
    /// Invoked once, before any payload is delivered.
    fn connection_made(&mut self, _transport: IsoTpTransport) {}

    /// One complete reassembled ISO-TP message.
    fn data_received(&mut self, payload: &[u8]);

    /// A per-message failure. The connection survives; the next inbound
    /// First Frame starts a fresh exchange.
    fn transfer_error(&mut self, error: TransferError) {
        warn!("transfer failed: {error}");
    }

    /// The connection is gone. `reason` is `None` for an orderly close.
    fn connection_lost(&mut self, _reason: Option<NetworkError>) {}
}

/// Write handle for a push-style connection.
#[derive(Clone)]
pub struct IsoTpTransport {
    guard: Arc<ConnGuard>,
}

impl IsoTpTransport {
    pub(crate) fn new(guard: Arc<ConnGuard>) -> Self {
        Self { guard }
    }

    /// Enqueue one payload as one ISO-TP message.
    ///
    /// Fire-and-forget, like the callback style itself: transmission
    /// failures are logged by the connection rather than returned here.
    pub async fn write(&self, payload: &[u8]) -> Result<(), NetworkError> {
        self.guard
            .cmd()
            .send(Command::Write {
                key: self.guard.key(),
                payload: payload.to_vec(),
                done: None,
            })
            .await
            .map_err(|_| NetworkError::ConnectionClosed)
    }

    /// Close the connection.
    pub async fn close(&self) {
        let _ = self
            .guard
            .cmd()
            .send(Command::CloseConnection {
                key: self.guard.key(),
            })
            .await;
    }
}

pub(crate) fn spawn_protocol_pump<P>(mut events: ConnEvents, protocol: Arc<Mutex<P>>)
where
    P: IsoTpProtocol + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let event = events.recv().await;
            let Ok(mut protocol) = protocol.lock() else {
                // A callback panicked earlier; nothing sane left to do.
                return;
            };
            match event {
                Some(ConnEvent::Payload(payload)) => protocol.data_received(&payload),
                Some(ConnEvent::Failed(err)) => protocol.transfer_error(err),
                Some(ConnEvent::Lost(err)) => {
                    protocol.connection_lost(Some(NetworkError::Adapter(err)));
                    return;
                }
                None => {
                    protocol.connection_lost(None);
                    return;
                }
            }
        }
    });
}
