//! Transport-layer error types.

use can_io_interface::LinkError;
use thiserror::Error;

/// Failures scoped to a single ISO-TP message.
///
/// None of these close the connection: the next inbound First Frame or the
/// next queued `write` starts a fresh exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransferError {
    /// Malformed protocol control information or impossible framing.
    #[error("malformed protocol control information")]
    Protocol,
    /// A Consecutive Frame arrived with the wrong sequence number.
    #[error("consecutive frame sequence mismatch (expected {expected}, got {got})")]
    Sequence { expected: u8, got: u8 },
    /// No Flow Control frame arrived within N_Bs.
    #[error("timed out waiting for flow control (N_Bs)")]
    FlowControlTimeout,
    /// No Consecutive Frame arrived within N_Cr.
    #[error("timed out waiting for consecutive frame (N_Cr)")]
    ReassemblyTimeout,
    /// The peer kept answering WAIT beyond the local ceiling.
    #[error("peer sent too many wait frames")]
    FlowControlWaitOverflow,
    /// The peer answered a First Frame with FC.OVFLW.
    #[error("peer reported buffer overflow")]
    PeerBufferOverflow,
    /// The adapter did not accept an outbound frame within N_As.
    #[error("adapter did not accept frame within N_As")]
    TransmitTimeout,
    /// The payload does not fit the 12-bit First Frame length.
    #[error("payload exceeds {} bytes", crate::pdu::MAX_PAYLOAD_LEN)]
    PayloadTooLarge,
}

/// Failures that terminate an operation, a connection or the whole network.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The connection (or the network behind it) has been torn down.
    #[error("connection closed")]
    ConnectionClosed,
    /// `create_connection` with an rx id that is already bound.
    #[error("rx id already bound to a connection")]
    DuplicateRxId,
    /// Connection options or identifiers rejected up front.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// A per-message transfer failure surfaced through a read or write.
    #[error(transparent)]
    Transfer(#[from] TransferError),
    /// The CAN adapter failed; fatal for the entire network.
    #[error("CAN adapter failure: {0}")]
    Adapter(#[from] LinkError),
}
