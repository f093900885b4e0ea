use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::ProtocolConfig;
use crate::messaging::message::{Message, MessageKind, Sequence};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SessionState {
    Idle,
    AwaitingAck,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum InboundVerdict {
    /// apply the message's side effects, then ACK it
    Fresh,
    /// a retransmission of the previous message: ACK it again, but do nothing else
    Duplicate,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AckOutcome {
    /// late, duplicate or unexpected ACK
    Ignored,
    Completed {
        acked: Message,
        /// the queued message that was started as a consequence, to be transmitted by the caller
        next: Option<Message>,
    },
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TimerOutcome {
    Nothing,
    Retransmit(Message),
    /// The retry budget is used up, the peer is presumed dead. The session is reset to `Idle`
    ///  with an empty queue.
    Exhausted,
}

/// Stop-and-wait ARQ towards a single remote peer.
///
/// The session does no I/O and owns no timer task. It returns the messages that need to be
///  transmitted, and the owning event loop polls [ReliableSession::deadline] and calls
///  [ReliableSession::on_timer] when it has passed. Since a deadline is part of the session's
///  state, cancelling it (e.g. on ACK) cannot race with a timer callback.
#[derive(Debug)]
pub struct ReliableSession {
    peer_addr: SocketAddr,
    retransmit_interval: Duration,
    max_retries: u32,

    state: SessionState,
    last_sequence_sent: Sequence,
    last_sequence_received: Option<Sequence>,
    in_flight: Option<Message>,
    queue: VecDeque<Message>,
    retries_left: u32,
    retransmit_deadline: Option<Instant>,
}

impl ReliableSession {
    pub fn new(peer_addr: SocketAddr, config: &ProtocolConfig) -> ReliableSession {
        ReliableSession {
            peer_addr,
            retransmit_interval: config.retransmit_interval,
            max_retries: config.max_retries,
            state: SessionState::Idle,
            last_sequence_sent: Sequence::Zero,
            last_sequence_received: None,
            in_flight: None,
            queue: VecDeque::new(),
            retries_left: 0,
            retransmit_deadline: None,
        }
    }

    /// For a session that is created in response to an inbound message: that message counts as
    ///  received, so its retransmissions are recognized as duplicates
    pub fn with_last_received(mut self, sequence: Sequence) -> ReliableSession {
        self.last_sequence_received = Some(sequence);
        self
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.retransmit_deadline
    }

    pub fn in_flight_kind(&self) -> Option<MessageKind> {
        self.in_flight.as_ref().map(|m| m.kind())
    }

    pub fn num_queued(&self) -> usize {
        self.queue.len()
    }

    /// Returns the message to transmit now (with its sequence assigned), or `None` if the
    ///  message was queued behind the one in flight
    #[must_use]
    pub fn send(&mut self, msg: Message, now: Instant) -> Option<Message> {
        match self.state {
            SessionState::Idle => Some(self.start(msg, now)),
            SessionState::AwaitingAck => {
                trace!(peer = ?self.peer_addr, kind = ?msg.kind(), "awaiting ACK - queueing message");
                self.queue.push_back(msg);
                None
            }
        }
    }

    fn start(&mut self, mut msg: Message, now: Instant) -> Message {
        let sequence = self.last_sequence_sent.flipped();
        self.last_sequence_sent = sequence;
        msg.sequence = sequence;

        self.state = SessionState::AwaitingAck;
        self.in_flight = Some(msg.clone());
        self.retries_left = self.max_retries;
        self.retransmit_deadline = Some(now + self.retransmit_interval);
        msg
    }

    pub fn on_ack(&mut self, sequence: Sequence, kind: MessageKind, now: Instant) -> AckOutcome {
        match &self.in_flight {
            Some(in_flight) if in_flight.sequence == sequence && in_flight.kind() == kind => self.complete(now),
            _ => {
                debug!(peer = ?self.peer_addr, ?sequence, ?kind, "ignoring ACK that does not match the message in flight");
                AckOutcome::Ignored
            }
        }
    }

    /// Some replies implicitly acknowledge the request they answer
    pub fn complete_implicitly(&mut self, kind: MessageKind, now: Instant) -> AckOutcome {
        if self.in_flight_kind() == Some(kind) {
            trace!(peer = ?self.peer_addr, ?kind, "message acknowledged implicitly");
            self.complete(now)
        }
        else {
            AckOutcome::Ignored
        }
    }

    fn complete(&mut self, now: Instant) -> AckOutcome {
        self.state = SessionState::Idle;
        self.retransmit_deadline = None;
        let acked = match self.in_flight.take() {
            Some(msg) => msg,
            None => return AckOutcome::Ignored,
        };

        let next = self.queue.pop_front()
            .map(|msg| self.start(msg, now));
        AckOutcome::Completed { acked, next }
    }

    pub fn on_inbound(&mut self, sequence: Sequence) -> InboundVerdict {
        if self.last_sequence_received == Some(sequence) {
            debug!(peer = ?self.peer_addr, ?sequence, "duplicate message");
            return InboundVerdict::Duplicate;
        }
        self.last_sequence_received = Some(sequence);
        InboundVerdict::Fresh
    }

    pub fn on_timer(&mut self, now: Instant) -> TimerOutcome {
        match self.retransmit_deadline {
            Some(deadline) if deadline <= now => {}
            _ => return TimerOutcome::Nothing,
        }

        if self.retries_left == 0 {
            debug!(peer = ?self.peer_addr, kind = ?self.in_flight_kind(), "retry budget exhausted");
            self.state = SessionState::Idle;
            self.in_flight = None;
            self.queue.clear();
            self.retransmit_deadline = None;
            return TimerOutcome::Exhausted;
        }

        match &self.in_flight {
            Some(msg) => {
                self.retries_left -= 1;
                self.retransmit_deadline = Some(now + self.retransmit_interval);
                trace!(peer = ?self.peer_addr, kind = ?msg.kind(), retries_left = self.retries_left, "retransmitting");
                TimerOutcome::Retransmit(msg.clone())
            }
            None => {
                self.retransmit_deadline = None;
                TimerOutcome::Nothing
            }
        }
    }
}
