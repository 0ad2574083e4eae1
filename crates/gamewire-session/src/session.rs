use std::fmt;
use std::time::Instant;

use bytes::Bytes;
use gamewire_frame::{FrameConfig, FrameWriter, Message, SequencedMessage};
use gamewire_loop::Promise;
use gamewire_transport::WireStream;

use crate::error::{Result, SessionError};
use crate::pipeline::Pipeline;
use crate::runtime::SessionHandle;
use crate::sequence::SequenceState;

/// Session lifecycle. Monotonic except that a resume moves an initiator's
/// session back to `Connecting` until the new link is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Inactive,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

/// Which side of the handshake this end played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn name(self) -> &'static str {
        match self {
            Self::Initiator => "initiator",
            Self::Responder => "responder",
        }
    }
}

/// Read-only description of a session, handed to handlers and listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Loop-local numeric id.
    pub local_id: u64,
    /// Responder-assigned id; empty until the first handshake completes.
    pub session_id: String,
    /// The initiator's identity.
    pub identity: String,
    pub role: Role,
    /// Remote end of the current link, for logs.
    pub peer: String,
}

impl fmt::Display for SessionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.session_id.is_empty() {
            write!(f, "{}#{}", self.identity, self.local_id)
        } else {
            write!(f, "{}#{}", self.identity, self.session_id)
        }
    }
}

/// Point-in-time view of a session, for operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub info: SessionInfo,
    pub state: SessionState,
    pub attempt: u32,
    /// Sequence the next outbound message will carry (0 when unordered).
    pub next_sequence: u64,
    /// Highest inbound sequence delivered.
    pub received: u64,
    /// Highest outbound sequence the peer acknowledged.
    pub peer_acked: u64,
    pub unacked: usize,
    pub pending_calls: usize,
    pub handlers: Vec<String>,
}

/// One connected stream carrying a session. The matching reader thread
/// tags everything it reads with `id`.
pub(crate) struct Link {
    pub(crate) id: u64,
    writer: FrameWriter<WireStream>,
    peer: String,
}

impl Link {
    pub(crate) fn new(id: u64, stream: WireStream, config: FrameConfig) -> Self {
        let peer = stream.peer_label();
        Self {
            id,
            writer: FrameWriter::with_config(stream, config),
            peer,
        }
    }

    pub(crate) fn peer(&self) -> &str {
        &self.peer
    }

    pub(crate) fn feed(&mut self, message: &Message) -> Result<()> {
        self.writer.feed(message).map_err(SessionError::from)
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.writer.pending_bytes() > 0
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(SessionError::from)
    }

    /// Send one message immediately.
    pub(crate) fn send(&mut self, message: &Message) -> Result<()> {
        self.writer.send(message).map_err(SessionError::from)
    }

    /// Shut the stream down, which also ends the reader thread.
    pub(crate) fn close(&self) {
        if let Err(err) = self.writer.get_ref().shutdown() {
            tracing::debug!(link = self.id, error = %err, "link shutdown failed");
        }
    }
}

/// Loop-confined session state.
pub(crate) struct Session {
    pub(crate) info: SessionInfo,
    pub(crate) state: SessionState,
    pub(crate) attempt: u32,
    pub(crate) link: Option<Link>,
    /// The previous link of an initiator that is resuming; closed once the
    /// new link is accepted.
    pub(crate) retired: Option<Link>,
    pub(crate) pipeline: Pipeline,
    pub(crate) sequence: SequenceState,
    /// Traffic written while not active, when ordering is disabled.
    pub(crate) held: Vec<SequencedMessage>,
    pub(crate) last_read: Instant,
    pub(crate) last_write: Instant,
    pub(crate) connecting_since: Instant,
    pub(crate) token: Bytes,
    pub(crate) connect: Option<Promise<SessionHandle, SessionError>>,
    pub(crate) was_active: bool,
}

impl Session {
    pub(crate) fn new(info: SessionInfo, sequence: SequenceState, link: Link) -> Self {
        let now = Instant::now();
        Self {
            info,
            state: SessionState::Connecting,
            attempt: 1,
            link: Some(link),
            retired: None,
            pipeline: Pipeline::new(),
            sequence,
            held: Vec::new(),
            last_read: now,
            last_write: now,
            connecting_since: now,
            token: Bytes::new(),
            connect: None,
            was_active: false,
        }
    }

    /// Queue a message on the current link. Flushed by the loop's
    /// housekeeping pass.
    pub(crate) fn feed(&mut self, message: &Message) -> Result<()> {
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| SessionError::SessionClosed("no link".to_string()))?;
        link.feed(message)?;
        if let Some(ack) = message.ack() {
            self.sequence.ack_sent(ack);
        }
        self.last_write = Instant::now();
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        match self.link.as_mut() {
            Some(link) if link.has_pending() => link.flush(),
            _ => Ok(()),
        }
    }

    /// Put a new link in place, returning the one it replaced.
    pub(crate) fn replace_link(&mut self, link: Link) -> Option<Link> {
        self.info.peer = link.peer().to_string();
        self.link.replace(link)
    }

    /// Close every link this session still holds.
    pub(crate) fn close_links(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
        if let Some(link) = self.retired.take() {
            link.close();
        }
    }

    pub(crate) fn link_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.link
            .iter()
            .chain(self.retired.iter())
            .map(|link| link.id)
    }
}
