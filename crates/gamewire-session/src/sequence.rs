//! Ordered-delivery overlay: outbound stamping, inbound gap detection and
//! the retransmission buffer that makes a session resumable.
//!
//! Sequences start at 1; an ack of 0 means nothing has been received.

use std::collections::VecDeque;

use gamewire_frame::{Body, SequencedMessage};

use crate::error::SessionError;

/// What to do with an inbound sequenced message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    /// Next in order; deliver it.
    Deliver,
    /// Already delivered once; drop it.
    Duplicate,
}

#[derive(Debug)]
pub struct SequenceState {
    enabled: bool,
    next_sequence: u64,
    received: u64,
    peer_acked: u64,
    last_ack_sent: u64,
    unacked: VecDeque<SequencedMessage>,
    max_unacked: usize,
}

impl SequenceState {
    pub fn new(enabled: bool, max_unacked: usize) -> Self {
        Self {
            enabled,
            next_sequence: 1,
            received: 0,
            peer_acked: 0,
            last_ack_sent: 0,
            unacked: VecDeque::new(),
            max_unacked,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Sequence the next stamped message will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Highest sequence stamped so far.
    pub fn highest_sent(&self) -> u64 {
        self.next_sequence - 1
    }

    /// Highest contiguous sequence received from the peer.
    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn peer_acked(&self) -> u64 {
        self.peer_acked
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    /// Acks received but not yet reported back to the peer.
    pub fn ack_backlog(&self) -> u64 {
        self.received.saturating_sub(self.last_ack_sent)
    }

    /// Record that `ack` went out on the wire.
    pub fn ack_sent(&mut self, ack: u64) {
        self.last_ack_sent = self.last_ack_sent.max(ack);
    }

    /// Seed the receive side from the peer's initial sequence.
    pub fn start_receiving_at(&mut self, peer_next_sequence: u64) {
        self.received = peer_next_sequence.saturating_sub(1);
        self.last_ack_sent = self.received;
    }

    /// Stamp an outbound body with the next sequence and the current ack.
    ///
    /// With ordering disabled every message carries sequence 0 and nothing is
    /// retained.
    pub fn stamp(&mut self, body: Body) -> Result<SequencedMessage, SessionError> {
        if !self.enabled {
            return Ok(SequencedMessage {
                sequence: 0,
                ack: 0,
                body,
            });
        }
        if self.unacked.len() >= self.max_unacked {
            return Err(SessionError::CapacityExceeded(format!(
                "{} messages awaiting acknowledgement",
                self.unacked.len()
            )));
        }
        let message = SequencedMessage {
            sequence: self.next_sequence,
            ack: self.received,
            body,
        };
        self.next_sequence += 1;
        self.last_ack_sent = self.received;
        self.unacked.push_back(message.clone());
        Ok(message)
    }

    /// Classify an inbound sequence. A gap means traffic was lost.
    pub fn on_receive(&mut self, sequence: u64) -> Result<Receipt, SessionError> {
        if !self.enabled {
            return Ok(Receipt::Deliver);
        }
        if sequence <= self.received {
            return Ok(Receipt::Duplicate);
        }
        if sequence != self.received + 1 {
            return Err(SessionError::Protocol(format!(
                "sequence gap: expected {}, got {sequence}",
                self.received + 1
            )));
        }
        self.received = sequence;
        Ok(Receipt::Deliver)
    }

    /// Apply a peer acknowledgement, pruning the retransmission buffer.
    /// Returns how many messages were released.
    pub fn on_ack(&mut self, ack: u64) -> Result<usize, SessionError> {
        if !self.enabled {
            return Ok(0);
        }
        if ack > self.highest_sent() {
            return Err(SessionError::Protocol(format!(
                "ack {ack} exceeds highest sent sequence {}",
                self.highest_sent()
            )));
        }
        if ack <= self.peer_acked {
            return Ok(0);
        }
        self.peer_acked = ack;
        let before = self.unacked.len();
        while self
            .unacked
            .front()
            .is_some_and(|message| message.sequence <= ack)
        {
            self.unacked.pop_front();
        }
        Ok(before - self.unacked.len())
    }

    /// Everything the peer has not acknowledged, restamped with the current
    /// ack, in sequence order.
    pub fn retransmit(&mut self) -> Vec<SequencedMessage> {
        let ack = self.received;
        self.last_ack_sent = ack;
        self.unacked
            .iter()
            .map(|message| SequencedMessage {
                sequence: message.sequence,
                ack,
                body: message.body.clone(),
            })
            .collect()
    }
}
