//! Receive-side reassembly and flow-control decisions.

use log::debug;

use crate::config::ConnectionOptions;
use crate::errors::TransferError;
use crate::pdu::FlowStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    Idle,
    Assembling,
}

/// What the connection must do after feeding a frame to the receive half.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RxOutcome {
    /// Nothing to send; keep waiting.
    None,
    /// Emit a Flow Control frame with this status. `ClearToSend` (re)arms
    /// N_Cr; `Wait` schedules a re-evaluation; `Overflow` ends the transfer.
    FlowControl(FlowStatus),
    /// A full payload has been reassembled.
    Completed(Vec<u8>),
}

/// Receive half of a connection: at most one partial payload at a time.
pub(crate) struct RxMachine {
    state: RxState,
    buf: Vec<u8>,
    expected_len: usize,
    next_sn: u8,
    block_count: u8,
    wait_sent: u8,
}

impl RxMachine {
    pub(crate) fn new() -> Self {
        Self {
            state: RxState::Idle,
            buf: Vec::new(),
            expected_len: 0,
            next_sn: 0,
            block_count: 0,
            wait_sent: 0,
        }
    }

    pub(crate) fn is_assembling(&self) -> bool {
        self.state == RxState::Assembling
    }

    /// Abandon any partial payload and return to idle.
    pub(crate) fn reset(&mut self) {
        self.state = RxState::Idle;
        self.buf = Vec::new();
        self.expected_len = 0;
        self.next_sn = 0;
        self.block_count = 0;
        self.wait_sent = 0;
    }

    /// A Single Frame always completes immediately; a partial reassembly in
    /// progress is superseded.
    pub(crate) fn on_single(&mut self, data: &[u8]) -> Vec<u8> {
        if self.is_assembling() {
            debug!("single frame supersedes partial reassembly");
            self.reset();
        }
        data.to_vec()
    }

    /// Start a new reassembly from a First Frame.
    ///
    /// `stall` tells the machine whether the application side can take
    /// another payload right now; it drives the CTS/WAIT/OVFLW decision.
    pub(crate) fn on_first(
        &mut self,
        opts: &ConnectionOptions,
        len: u16,
        data: &[u8],
        stall: bool,
    ) -> RxOutcome {
        if self.is_assembling() {
            debug!("first frame supersedes partial reassembly");
        }
        self.reset();

        let len = usize::from(len);
        let mut buf = Vec::with_capacity(len);
        buf.extend_from_slice(&data[..data.len().min(len)]);
        self.buf = buf;
        self.expected_len = len;
        self.next_sn = 1;
        self.state = RxState::Assembling;

        RxOutcome::FlowControl(self.decide_fc(opts, stall))
    }

    /// Feed one Consecutive Frame.
    ///
    /// A CF while idle is stale traffic and is dropped without comment; a
    /// sequence mismatch aborts the transfer.
    pub(crate) fn on_consecutive(
        &mut self,
        opts: &ConnectionOptions,
        sn: u8,
        data: &[u8],
    ) -> Result<RxOutcome, TransferError> {
        if !self.is_assembling() {
            return Ok(RxOutcome::None);
        }
        if sn != self.next_sn {
            let expected = self.next_sn;
            self.reset();
            return Err(TransferError::Sequence { expected, got: sn });
        }

        let remaining = self.expected_len - self.buf.len();
        let chunk = data.len().min(remaining);
        self.buf.extend_from_slice(&data[..chunk]);
        self.next_sn = (self.next_sn + 1) & 0x0F;
        self.block_count += 1;

        if self.buf.len() >= self.expected_len {
            let payload = std::mem::take(&mut self.buf);
            self.reset();
            return Ok(RxOutcome::Completed(payload));
        }

        if opts.block_size > 0 && self.block_count == opts.block_size {
            self.block_count = 0;
            // A transfer accepted at its First Frame runs to completion;
            // block boundaries always clear the sender to continue.
            return Ok(RxOutcome::FlowControl(FlowStatus::ClearToSend));
        }

        Ok(RxOutcome::None)
    }

    /// Re-evaluate a stalled transfer (the N_Br tick after a WAIT).
    pub(crate) fn on_wait_retry(
        &mut self,
        opts: &ConnectionOptions,
        stall: bool,
    ) -> Option<RxOutcome> {
        if !self.is_assembling() {
            return None;
        }
        Some(RxOutcome::FlowControl(self.decide_fc(opts, stall)))
    }

    fn decide_fc(&mut self, opts: &ConnectionOptions, stall: bool) -> FlowStatus {
        if !stall {
            FlowStatus::ClearToSend
        } else if self.wait_sent < opts.wftmax {
            self.wait_sent += 1;
            FlowStatus::Wait
        } else {
            // Out of WAIT budget: refuse the transfer.
            self.reset();
            FlowStatus::Overflow
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(block_size: u8, wftmax: u8) -> ConnectionOptions {
        ConnectionOptions {
            block_size,
            wftmax,
            ..ConnectionOptions::default()
        }
    }

    #[test]
    fn single_frame_completes_immediately() {
        let mut rx = RxMachine::new();
        assert_eq!(rx.on_single(&[1, 2, 3]), vec![1, 2, 3]);
        assert!(!rx.is_assembling());
    }

    #[test]
    fn segmented_transfer_reassembles() {
        let mut rx = RxMachine::new();
        let opts = opts(0, 0);
        let payload: Vec<u8> = (0..20).collect();

        let fc = rx.on_first(&opts, 20, &payload[..6], false);
        assert_eq!(fc, RxOutcome::FlowControl(FlowStatus::ClearToSend));
        assert!(rx.is_assembling());

        assert_eq!(
            rx.on_consecutive(&opts, 1, &payload[6..13]).unwrap(),
            RxOutcome::None
        );
        match rx.on_consecutive(&opts, 2, &payload[13..]).unwrap() {
            RxOutcome::Completed(got) => assert_eq!(got, payload),
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(!rx.is_assembling());
    }

    #[test]
    fn padding_past_declared_length_is_dropped() {
        let mut rx = RxMachine::new();
        let opts = opts(0, 0);
        rx.on_first(&opts, 10, &[0, 1, 2, 3, 4, 5], false);
        // 7 data bytes offered, only 4 still needed; the rest is padding.
        match rx
            .on_consecutive(&opts, 1, &[6, 7, 8, 9, 0xCC, 0xCC, 0xCC])
            .unwrap()
        {
            RxOutcome::Completed(got) => {
                assert_eq!(got, (0..10).collect::<Vec<u8>>());
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn sequence_mismatch_aborts_to_idle() {
        let mut rx = RxMachine::new();
        let opts = opts(0, 0);
        rx.on_first(&opts, 10, &[0, 1, 2, 3, 4, 5], false);
        let err = rx.on_consecutive(&opts, 3, &[9; 4]).unwrap_err();
        assert_eq!(err, TransferError::Sequence { expected: 1, got: 3 });
        assert!(!rx.is_assembling());
    }

    #[test]
    fn stale_consecutive_frame_is_ignored() {
        let mut rx = RxMachine::new();
        let opts = opts(0, 0);
        assert_eq!(
            rx.on_consecutive(&opts, 1, &[1, 2, 3]).unwrap(),
            RxOutcome::None
        );
    }

    #[test]
    fn sequence_numbers_wrap_at_sixteen() {
        let mut rx = RxMachine::new();
        let opts = opts(0, 0);
        // 6 + 17 * 7 = 125 bytes: the 16th CF wraps back to sn 0.
        let payload: Vec<u8> = (0..125u8).collect();
        rx.on_first(&opts, 125, &payload[..6], false);
        let mut offset = 6;
        let mut sn = 1u8;
        while offset < 125 {
            let end = (offset + 7).min(125);
            let outcome = rx
                .on_consecutive(&opts, sn, &payload[offset..end])
                .unwrap();
            offset = end;
            sn = (sn + 1) & 0x0F;
            if offset == 125 {
                assert!(matches!(outcome, RxOutcome::Completed(got) if got == payload));
            } else {
                assert_eq!(outcome, RxOutcome::None);
            }
        }
    }

    #[test]
    fn block_boundary_requests_new_flow_control() {
        let mut rx = RxMachine::new();
        let opts = opts(2, 0);
        let payload: Vec<u8> = (0..30).collect();
        rx.on_first(&opts, 30, &payload[..6], false);
        assert_eq!(
            rx.on_consecutive(&opts, 1, &payload[6..13]).unwrap(),
            RxOutcome::None
        );
        assert_eq!(
            rx.on_consecutive(&opts, 2, &payload[13..20]).unwrap(),
            RxOutcome::FlowControl(FlowStatus::ClearToSend)
        );
    }

    #[test]
    fn new_first_frame_restarts_assembly() {
        let mut rx = RxMachine::new();
        let opts = opts(0, 0);
        rx.on_first(&opts, 100, &[1; 6], false);
        // The second FF supersedes the unfinished transfer.
        rx.on_first(&opts, 10, &[0, 1, 2, 3, 4, 5], false);
        match rx.on_consecutive(&opts, 1, &[6, 7, 8, 9]).unwrap() {
            RxOutcome::Completed(got) => assert_eq!(got, (0..10).collect::<Vec<u8>>()),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn stalled_receiver_spends_wait_budget_then_overflows() {
        let mut rx = RxMachine::new();
        let opts = opts(0, 2);
        assert_eq!(
            rx.on_first(&opts, 20, &[0; 6], true),
            RxOutcome::FlowControl(FlowStatus::Wait)
        );
        assert_eq!(
            rx.on_wait_retry(&opts, true),
            Some(RxOutcome::FlowControl(FlowStatus::Wait))
        );
        // Budget exhausted: refuse and abandon.
        assert_eq!(
            rx.on_wait_retry(&opts, true),
            Some(RxOutcome::FlowControl(FlowStatus::Overflow))
        );
        assert!(!rx.is_assembling());
    }

    #[test]
    fn stalled_receiver_without_wait_budget_overflows_immediately() {
        let mut rx = RxMachine::new();
        let opts = opts(0, 0);
        assert_eq!(
            rx.on_first(&opts, 20, &[0; 6], true),
            RxOutcome::FlowControl(FlowStatus::Overflow)
        );
        assert!(!rx.is_assembling());
    }

    #[test]
    fn unstalled_retry_clears_to_send() {
        let mut rx = RxMachine::new();
        let opts = opts(0, 5);
        rx.on_first(&opts, 20, &[0; 6], true);
        assert_eq!(
            rx.on_wait_retry(&opts, false),
            Some(RxOutcome::FlowControl(FlowStatus::ClearToSend))
        );
        assert!(rx.is_assembling());
    }
}
