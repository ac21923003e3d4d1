//! `isotp-net`: ISO-TP (ISO 15765-2) connections multiplexed over one CAN channel.
//!
//! ISO-TP carries payloads of up to 4095 bytes over classic CAN by
//! segmenting messages into:
//! - a **Single Frame** (small payloads),
//! - a **First Frame** + multiple **Consecutive Frames** (larger payloads), and
//! - **Flow Control** frames to regulate pacing and batching.
//!
//! This crate runs many independent ISO-TP connections on a single CAN
//! adapter. A [`Network`] owns the adapter and routes inbound frames by
//! receive identifier to per-connection state machines; each connection is a
//! byte-message duplex channel to the application, exposed two equivalent
//! ways:
//!
//! - **pull**: [`Network::open_connection`] yields an [`IsoTpReader`] /
//!   [`IsoTpWriter`] pair; `read` returns whole messages, `drain` awaits
//!   transmission.
//! - **push**: [`Network::create_connection`] drives an [`IsoTpProtocol`]
//!   implementation through callbacks.
//!
//! All protocol state lives on one task, so connections never contend on
//! locks; timers (N_As, N_Bs, N_Cr, STmin pacing) are dispatched from the
//! same task. Synchronous code can use [`SyncNetwork`] instead, which runs
//! that task on a background thread.
//!
//! Adapters come from the `can-io-*` crates: SocketCAN, a TCP frame bridge,
//! or an in-process virtual bus for tests. On Linux the kernel's own ISO-TP
//! implementation can replace this entire engine; see the `isotp-kernel`
//! crate for that path.
//!
//! # Quick start
//!
//! ```no_run
//! use can_io_mock::VirtualBus;
//! use isotp_net::{ConnectionOptions, Network};
//!
//! # async fn example() -> Result<(), isotp_net::NetworkError> {
//! let bus = VirtualBus::new();
//! let network = Network::open(bus.attach());
//!
//! let (mut reader, mut writer) = network
//!     .open_connection(0x123, 0x456, ConnectionOptions::default())
//!     .await?;
//!
//! writer.write(b"hello there, this spans several frames").await?;
//! writer.drain().await?;
//!
//! let reply = reader.read(4095).await?;
//! println!("peer said: {reply:?}");
//! # Ok(()) }
//! ```
//!
//! Addressing is "normal" ISO-TP addressing: one CAN identifier pair per
//! connection. Extended and mixed addressing (an address byte inside the
//! payload) are out of scope, as are remote frames and CAN FD framing.

pub mod config;
pub mod errors;
pub mod pdu;
pub mod protocol;
pub mod stream;
pub mod sync;

mod connection;
mod network;
mod rx;
mod timer;
mod tx;

pub use can_io_interface::{CanFrame, LinkError};
pub use config::ConnectionOptions;
pub use errors::{NetworkError, TransferError};
pub use network::Network;
pub use protocol::{IsoTpProtocol, IsoTpTransport};
pub use stream::{IsoTpReader, IsoTpWriter};
pub use sync::{SyncConnection, SyncNetwork};
