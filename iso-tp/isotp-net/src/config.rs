//! Per-connection configuration.

use std::time::Duration;

/// Options for one ISO-TP connection.
///
/// The flow-control fields (`block_size`, `st_min`, `wftmax`) describe the
/// profile *this* endpoint advertises to remote senders; the parameters the
/// peer advertises to us arrive at runtime in its Flow Control frames.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Pad every transmitted frame to 8 bytes with this value.
    pub padding: Option<u8>,
    /// Force 29-bit (`Some(true)`) or 11-bit (`Some(false)`) identifiers.
    /// `None` derives the width from the raw id value (≥ 0x800 means 29-bit).
    pub extended_id: Option<bool>,
    /// Block size advertised in the Flow Control frames we send (0 = unlimited).
    pub block_size: u8,
    /// Minimum separation time advertised in the Flow Control frames we send.
    pub st_min: Duration,
    /// Maximum WAIT frames we emit before abandoning an inbound transfer.
    pub wftmax: u8,
    /// WAIT frames tolerated from the peer before an outbound transfer aborts.
    pub wait_ceiling: u8,
    /// Deadline for the adapter to accept an outbound frame (N_As).
    pub n_as: Duration,
    /// Deadline for a Flow Control frame after a First Frame or block (N_Bs).
    pub n_bs: Duration,
    /// Re-evaluation period while we stall a sender with WAIT frames (N_Br).
    pub n_br: Duration,
    /// Deadline for the next Consecutive Frame while reassembling (N_Cr).
    pub n_cr: Duration,
    /// Delivered-but-unread payloads tolerated before new inbound transfers
    /// are stalled with WAIT/OVFLW. Delivery itself is never lossy.
    pub recv_queue_depth: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            padding: None,
            extended_id: None,
            block_size: 0,
            st_min: Duration::ZERO,
            wftmax: 0,
            wait_ceiling: 10,
            n_as: Duration::from_millis(1000),
            n_bs: Duration::from_millis(1000),
            n_br: Duration::from_millis(500),
            n_cr: Duration::from_millis(1000),
            recv_queue_depth: 8,
        }
    }
}

impl ConnectionOptions {
    /// Reject configurations the protocol engine cannot run with.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.recv_queue_depth == 0 {
            return Err("recv_queue_depth must be at least 1");
        }
        if self.n_as.is_zero() || self.n_bs.is_zero() || self.n_cr.is_zero() {
            return Err("protocol timers must be non-zero");
        }
        if self.n_br.is_zero() {
            return Err("wait re-evaluation period must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_validate() {
        assert!(ConnectionOptions::default().validate().is_ok());
    }

    #[test]
    fn zero_timers_are_rejected() {
        let opts = ConnectionOptions {
            n_bs: Duration::ZERO,
            ..ConnectionOptions::default()
        };
        assert!(opts.validate().is_err());

        let opts = ConnectionOptions {
            recv_queue_depth: 0,
            ..ConnectionOptions::default()
        };
        assert!(opts.validate().is_err());
    }
}
