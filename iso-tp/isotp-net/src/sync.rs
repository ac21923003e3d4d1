//! Blocking facade for synchronous environments.
//!
//! [`SyncNetwork`] runs the async network on a dedicated background thread
//! and exposes plain blocking calls. Intended for scripts, test rigs and
//! other code without an async runtime of its own; do not use it from inside
//! one (the blocking calls would panic, by tokio's own rules).

use std::io;
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;

use can_io_interface::SplitTxRx;
use tokio::runtime;
use tokio::sync::oneshot;

use crate::config::ConnectionOptions;
use crate::errors::NetworkError;
use crate::network::Network;
use crate::stream::{IsoTpReader, IsoTpWriter};

/// An ISO-TP network driven from synchronous code.
pub struct SyncNetwork {
    handle: runtime::Handle,
    network: Option<Network>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SyncNetwork {
    /// Start the runtime thread and open the network on it.
    pub fn open<D>(adapter: D) -> io::Result<Self>
    where
        D: SplitTxRx,
        D::Tx: Send + 'static,
        D::Rx: Send + 'static,
    {
        let (handle_tx, handle_rx) = std_mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let thread = thread::Builder::new()
            .name("isotp-net-sync".into())
            .spawn(move || {
                let rt = match runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(err) => {
                        let _ = handle_tx.send(Err(err));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(rt.handle().clone()));
                // Park here driving timers and IO until close().
                rt.block_on(async {
                    let _ = shutdown_rx.await;
                });
            })?;
        let handle = handle_rx
            .recv()
            .map_err(|_| io::Error::other("sync runtime thread died during startup"))??;

        let network = {
            let _guard = handle.enter();
            Network::open(adapter)
        };

        Ok(Self {
            handle,
            network: Some(network),
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Open a connection usable with blocking `send`/`recv` calls.
    pub fn create_sync_connection(
        &self,
        tx_id: u32,
        rx_id: u32,
        opts: ConnectionOptions,
    ) -> Result<SyncConnection, NetworkError> {
        let network = self.network.as_ref().ok_or(NetworkError::ConnectionClosed)?;
        let (reader, writer) = self
            .handle
            .block_on(network.open_connection(tx_id, rx_id, opts))?;
        Ok(SyncConnection {
            handle: self.handle.clone(),
            reader,
            writer,
        })
    }

    /// Shut the network down and stop the runtime thread.
    pub fn close(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if let Some(network) = self.network.take() {
            self.handle.block_on(network.close());
        }
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SyncNetwork {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

/// Blocking handle to one connection.
pub struct SyncConnection {
    handle: runtime::Handle,
    reader: IsoTpReader,
    writer: IsoTpWriter,
}

impl SyncConnection {
    /// Enqueue one payload as one ISO-TP message.
    pub fn send(&mut self, payload: &[u8]) -> Result<(), NetworkError> {
        self.handle.block_on(self.writer.write(payload))
    }

    /// Block until every payload enqueued so far has been transmitted.
    pub fn flush(&mut self) -> Result<(), NetworkError> {
        self.handle.block_on(self.writer.drain())
    }

    /// Wait for the next payload; `Ok(None)` when `timeout` elapses first.
    pub fn recv(&mut self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>, NetworkError> {
        let reader = &mut self.reader;
        match timeout {
            Some(timeout) => self.handle.block_on(async {
                match tokio::time::timeout(timeout, reader.read(usize::MAX)).await {
                    Ok(result) => result.map(Some),
                    Err(_) => Ok(None),
                }
            }),
            None => self.handle.block_on(reader.read(usize::MAX)).map(Some),
        }
    }
}
