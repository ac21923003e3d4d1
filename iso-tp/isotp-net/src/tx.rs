//! Transmit-side state machine.

use std::time::Duration;

use can_io_interface::{CanFrame, Id};

use crate::errors::TransferError;
use crate::pdu::{self, FF_PAYLOAD, MAX_CF_PAYLOAD, Pdu};

/// Progress after emitting one Consecutive Frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CfProgress {
    /// Whole payload transmitted.
    Done,
    /// Block exhausted; await the next Flow Control before continuing.
    BlockDone,
    /// More Consecutive Frames to go.
    More,
}

/// Bookkeeping for one in-flight segmented transfer.
pub(crate) struct TxSession {
    payload: Vec<u8>,
    offset: usize,
    next_sn: u8,
    bs_peer: u8,
    block_remaining: u8,
    st_min_peer: Duration,
    /// WAIT frames received from the peer during this transfer.
    pub(crate) wait_count: u8,
}

impl TxSession {
    pub(crate) fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            offset: 0,
            next_sn: 1,
            bs_peer: 0,
            block_remaining: 0,
            st_min_peer: Duration::ZERO,
            wait_count: 0,
        }
    }

    /// Build the First Frame and advance past its six payload bytes.
    pub(crate) fn first_frame(
        &mut self,
        tx_id: Id,
        padding: Option<u8>,
    ) -> Result<CanFrame, TransferError> {
        let frame = pdu::encode(
            tx_id,
            &Pdu::FirstFrame {
                len: self.payload.len() as u16,
                data: &self.payload[..FF_PAYLOAD],
            },
            padding,
        )?;
        self.offset = FF_PAYLOAD;
        Ok(frame)
    }

    /// Adopt the peer's Flow Control parameters after a CTS.
    pub(crate) fn apply_cts(&mut self, block_size: u8, st_min_raw: u8) {
        self.wait_count = 0;
        self.bs_peer = block_size;
        self.block_remaining = block_size;
        self.st_min_peer = pdu::st_min_to_duration(st_min_raw);
    }

    /// Gap the peer mandates between Consecutive Frames.
    pub(crate) fn pace(&self) -> Duration {
        self.st_min_peer
    }

    /// Build the next Consecutive Frame and advance the cursor.
    pub(crate) fn next_cf(
        &mut self,
        tx_id: Id,
        padding: Option<u8>,
    ) -> Result<(CanFrame, CfProgress), TransferError> {
        let remaining = self.payload.len() - self.offset;
        let chunk = remaining.min(MAX_CF_PAYLOAD);
        let frame = pdu::encode(
            tx_id,
            &Pdu::ConsecutiveFrame {
                sn: self.next_sn,
                data: &self.payload[self.offset..self.offset + chunk],
            },
            padding,
        )?;
        self.offset += chunk;
        self.next_sn = (self.next_sn + 1) & 0x0F;

        if self.offset >= self.payload.len() {
            return Ok((frame, CfProgress::Done));
        }
        if self.bs_peer > 0 {
            self.block_remaining -= 1;
            if self.block_remaining == 0 {
                self.block_remaining = self.bs_peer;
                return Ok((frame, CfProgress::BlockDone));
            }
        }
        Ok((frame, CfProgress::More))
    }
}

/// Transmit half of a connection.
///
/// `WaitingForFc` covers both the wait after the First Frame and the wait at
/// each block boundary; the session cursor distinguishes the two.
pub(crate) enum TxState {
    Idle,
    WaitingForFc(TxSession),
    Sending(TxSession),
}

impl TxState {
    pub(crate) fn is_idle(&self) -> bool {
        matches!(self, TxState::Idle)
    }
}
