//! Session lifecycle: state machine, shared status, handle and single-flight guards.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, OnceLock};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::observer::{self, EventSender, SessionEvent, SessionEvents};
use super::payload::Artifact;
use crate::error::{Result, TransferError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Connecting,
    Transferring,
    Success,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Success | SessionState::Failed)
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, Failed)
                | (Connecting, Transferring)
                | (Connecting, Failed)
                | (Transferring, Success)
                | (Transferring, Failed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Sender,
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => f.write_str("sender"),
            Role::Receiver => f.write_str("receiver"),
        }
    }
}

/// Status readable from both the worker and the handle.
struct SessionShared {
    id: Uuid,
    role: Role,
    state: watch::Sender<SessionState>,
    bytes_transferred: AtomicU64,
    started_at: SystemTime,
    ended_at: OnceLock<SystemTime>,
}

/// Worker-side view of a session. Only the worker moves the state machine.
pub(crate) struct SessionDriver {
    shared: Arc<SessionShared>,
    events: EventSender,
    cancel: CancellationToken,
}

/// Handle parts waiting for the worker task to be spawned.
pub(crate) struct PendingHandle {
    shared: Arc<SessionShared>,
    events: SessionEvents,
    cancel: CancellationToken,
}

pub(crate) fn create(role: Role, log_backlog: usize) -> (SessionDriver, PendingHandle) {
    let (state, _) = watch::channel(SessionState::Idle);
    let shared = Arc::new(SessionShared {
        id: Uuid::new_v4(),
        role,
        state,
        bytes_transferred: AtomicU64::new(0),
        started_at: SystemTime::now(),
        ended_at: OnceLock::new(),
    });
    let (sender, events) = observer::channel(log_backlog);
    let cancel = CancellationToken::new();

    (
        SessionDriver {
            shared: shared.clone(),
            events: sender,
            cancel: cancel.clone(),
        },
        PendingHandle {
            shared,
            events,
            cancel,
        },
    )
}

impl SessionDriver {
    pub(crate) fn id(&self) -> Uuid {
        self.shared.id
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Enter a non-terminal state and announce it.
    pub(crate) fn transition(&mut self, next: SessionState) {
        debug_assert!(!next.is_terminal(), "terminal states go through finish()");
        if self.advance(next) {
            self.events.emit(SessionEvent::StateChanged(next));
        }
    }

    pub(crate) fn log(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(session = %self.shared.id, role = %self.shared.role, "{}", message);
        self.events.emit(SessionEvent::Log(message));
    }

    pub(crate) fn listening(&mut self, addr: SocketAddr) {
        tracing::info!(session = %self.shared.id, "Listening on {}", addr);
        self.events.emit(SessionEvent::Listening(addr));
    }

    /// Count a chunk that has fully gone through and report it.
    pub(crate) fn record_chunk(&mut self, chunk_len: usize) -> u64 {
        let total = self
            .shared
            .bytes_transferred
            .fetch_add(chunk_len as u64, Ordering::SeqCst)
            + chunk_len as u64;
        tracing::debug!(session = %self.shared.id, "Chunk of {} bytes, {} total", chunk_len, total);
        self.events.emit(SessionEvent::Progress {
            chunk_len,
            bytes_transferred: total,
        });
        total
    }

    pub(crate) fn bytes_transferred(&self) -> u64 {
        self.shared.bytes_transferred.load(Ordering::SeqCst)
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.shared.started_at.elapsed().unwrap_or_default()
    }

    /// Enter the terminal state matching `result` and deliver the final event.
    ///
    /// Callers release every socket and guard before calling this.
    pub(crate) fn finish(mut self, result: Result<Artifact>) -> Result<Artifact> {
        let _ = self.shared.ended_at.set(SystemTime::now());
        match &result {
            Ok(artifact) => {
                tracing::info!(session = %self.shared.id, role = %self.shared.role, "Transfer succeeded: {}", artifact);
                if self.advance(SessionState::Success) {
                    self.events.emit(SessionEvent::Succeeded(artifact.clone()));
                }
            }
            Err(e) => {
                tracing::warn!(session = %self.shared.id, role = %self.shared.role, kind = %e.kind(), "Transfer failed: {}", e);
                if self.advance(SessionState::Failed) {
                    self.events.emit(SessionEvent::Failed(e.clone()));
                }
            }
        }
        result
    }

    fn advance(&self, next: SessionState) -> bool {
        let advanced = self.shared.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if !advanced {
            tracing::warn!(
                session = %self.shared.id,
                "Ignoring invalid transition {} -> {}",
                *self.shared.state.borrow(),
                next
            );
        }
        advanced
    }
}

impl PendingHandle {
    pub(crate) fn attach(self, task: JoinHandle<Result<Artifact>>) -> SessionHandle {
        SessionHandle {
            shared: self.shared,
            events: Some(self.events),
            cancel: self.cancel,
            task,
        }
    }
}

/// Caller-side view of one running session.
///
/// Dropping the handle does not stop the session; call [`cancel`](Self::cancel).
pub struct SessionHandle {
    shared: Arc<SessionShared>,
    events: Option<SessionEvents>,
    cancel: CancellationToken,
    task: JoinHandle<Result<Artifact>>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Receiver that tracks the current state; useful for `wait_for`.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.shared.bytes_transferred.load(Ordering::SeqCst)
    }

    pub fn started_at(&self) -> SystemTime {
        self.shared.started_at
    }

    pub fn ended_at(&self) -> Option<SystemTime> {
        self.shared.ended_at.get().copied()
    }

    /// Take the event stream. Only the first call returns it.
    pub fn subscribe(&mut self) -> Option<SessionEvents> {
        self.events.take()
    }

    /// Abort the session. Pending connect/accept/read/write calls are
    /// abandoned and their sockets closed; the session ends `Failed(Cancelled)`
    /// unless it already finished.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the session to end and return its outcome.
    pub async fn wait(self) -> Result<Artifact> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(TransferError::Io(Arc::new(std::io::Error::other(e)))),
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("state", &self.state())
            .field("bytes_transferred", &self.bytes_transferred())
            .finish()
    }
}

/// One in-flight session per role per caller.
#[derive(Debug, Clone, Default)]
pub(crate) struct FlightSlot {
    busy: Arc<AtomicBool>,
}

impl FlightSlot {
    pub(crate) fn try_acquire(&self) -> Option<FlightGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        Some(FlightGuard {
            busy: self.busy.clone(),
            port: None,
        })
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

/// Held by a session worker for its whole life. Releases the slot (and any
/// claimed port) on drop.
#[derive(Debug)]
pub(crate) struct FlightGuard {
    busy: Arc<AtomicBool>,
    port: Option<PortClaim>,
}

impl FlightGuard {
    pub(crate) fn with_port(mut self, claim: PortClaim) -> Self {
        self.port = Some(claim);
        self
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.port.take();
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// Listening ports held by receiver sessions anywhere in this process.
static CLAIMED_PORTS: LazyLock<Mutex<HashSet<u16>>> = LazyLock::new(Default::default);

/// Exclusive claim on a listening port. Port 0 (ephemeral) is never contended.
#[derive(Debug)]
pub(crate) struct PortClaim {
    port: u16,
}

impl PortClaim {
    pub(crate) fn try_claim(port: u16) -> Option<Self> {
        if port == 0 {
            return Some(Self { port });
        }
        let mut claimed = CLAIMED_PORTS.lock().unwrap_or_else(|e| e.into_inner());
        claimed.insert(port).then_some(Self { port })
    }
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        if self.port != 0 {
            let mut claimed = CLAIMED_PORTS.lock().unwrap_or_else(|e| e.into_inner());
            claimed.remove(&self.port);
        }
    }
}
