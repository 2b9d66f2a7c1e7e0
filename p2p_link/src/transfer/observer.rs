//! Event delivery from a session worker to whoever is watching it.
//!
//! All events of a session travel through one unbounded queue, so their
//! relative order is exactly the order they were produced in and the worker
//! never waits on a consumer. Only log-class events (free text and per-chunk
//! progress) count against a backlog limit: once that many are queued and
//! unread, further log events are dropped until the consumer catches up.
//! State and result events are never dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

use super::payload::Artifact;
use super::session::SessionState;
use crate::error::TransferError;

/// One observable step of a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Entered `Connecting` or `Transferring`.
    StateChanged(SessionState),
    /// Receiver bound its listener to this address.
    Listening(SocketAddr),
    /// Human-readable diagnostic line.
    Log(String),
    /// One chunk moved.
    Progress {
        chunk_len: usize,
        bytes_transferred: u64,
    },
    /// Entered `Success`.
    Succeeded(Artifact),
    /// Entered `Failed`.
    Failed(TransferError),
}

impl SessionEvent {
    /// Log-class events may be dropped under backpressure.
    pub fn is_droppable(&self) -> bool {
        matches!(self, SessionEvent::Log(_) | SessionEvent::Progress { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::Succeeded(_) | SessionEvent::Failed(_))
    }

    /// The state this event moves the session into, if it is a transition.
    pub fn state(&self) -> Option<SessionState> {
        match self {
            SessionEvent::StateChanged(state) => Some(*state),
            SessionEvent::Succeeded(_) => Some(SessionState::Success),
            SessionEvent::Failed(_) => Some(SessionState::Failed),
            _ => None,
        }
    }
}

/// Worker side of the channel.
pub(crate) struct EventSender {
    tx: mpsc::UnboundedSender<SessionEvent>,
    backlog: Arc<AtomicUsize>,
    limit: usize,
    dropped: u64,
}

/// Consumer side of the channel, handed out by
/// [`SessionHandle::subscribe`](super::SessionHandle::subscribe).
pub struct SessionEvents {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    backlog: Arc<AtomicUsize>,
}

pub(crate) fn channel(log_backlog: usize) -> (EventSender, SessionEvents) {
    let (tx, rx) = mpsc::unbounded_channel();
    let backlog = Arc::new(AtomicUsize::new(0));
    (
        EventSender {
            tx,
            backlog: backlog.clone(),
            limit: log_backlog,
            dropped: 0,
        },
        SessionEvents { rx, backlog },
    )
}

impl EventSender {
    /// Queue an event. Returns false if it was dropped or nobody is listening.
    pub(crate) fn emit(&mut self, event: SessionEvent) -> bool {
        let droppable = event.is_droppable();

        if droppable {
            let limit = self.limit;
            let reserved = self
                .backlog
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |queued| {
                    (queued < limit).then_some(queued + 1)
                })
                .is_ok();
            if !reserved {
                self.dropped += 1;
                if self.dropped == 1 {
                    tracing::debug!("Observer backlog full ({}), dropping log events", limit);
                }
                return false;
            }
            if self.dropped > 0 {
                tracing::debug!("Observer caught up after {} dropped log events", self.dropped);
                self.dropped = 0;
            }
        }

        if self.tx.send(event).is_err() {
            // Consumer went away; release the slot we reserved.
            if droppable {
                self.backlog.fetch_sub(1, Ordering::SeqCst);
            }
            return false;
        }
        true
    }
}

impl SessionEvents {
    /// Next event, or `None` once the session is over and the queue drained.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        let event = self.rx.recv().await?;
        self.release(&event);
        Some(event)
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        let event = self.rx.try_recv().ok()?;
        self.release(&event);
        Some(event)
    }

    /// Receive events until the terminal one, returning everything seen.
    pub async fn collect_until_terminal(&mut self) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        while let Some(event) = self.recv().await {
            let done = event.is_terminal();
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    }

    fn release(&self, event: &SessionEvent) {
        if event.is_droppable() {
            self.backlog.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
