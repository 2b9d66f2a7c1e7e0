//! Failure taxonomy for transfer sessions.
//!
//! Every failure a session can hit is mapped to exactly one [`TransferError`]
//! at the point where it happens. The error travels both in the terminal
//! [`SessionEvent::Failed`](crate::transfer::SessionEvent::Failed) event and out of
//! [`SessionHandle::wait`](crate::transfer::SessionHandle::wait), so it is `Clone`:
//! underlying io causes are kept behind an `Arc`.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A specialized `Result` type for transfer operations.
pub type Result<T> = std::result::Result<T, TransferError>;

/// Coarse classification of a failure, stable across causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The socket could not connect (sender) or bind (receiver).
    ConnectError,
    /// The connect or accept deadline passed.
    Timeout,
    /// The metadata record could not be parsed.
    MalformedHandshake,
    /// The peer closed the stream before the handshake completed.
    TransportClosed,
    /// A read or write failed mid-transfer.
    IoError,
    /// The caller aborted the session.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::ConnectError => "CONNECT_ERROR",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::MalformedHandshake => "MALFORMED_HANDSHAKE",
            ErrorKind::TransportClosed => "TRANSPORT_CLOSED",
            ErrorKind::IoError => "IO_ERROR",
            ErrorKind::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Which blocking step a timeout applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    Connect,
    Accept,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutPhase::Connect => f.write_str("connect"),
            TimeoutPhase::Accept => f.write_str("accept"),
        }
    }
}

/// Terminal failure of a transfer session.
#[derive(Error, Debug, Clone)]
pub enum TransferError {
    /// Outgoing connection refused or unreachable.
    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: Arc<io::Error>,
    },

    /// Listening socket could not be set up.
    #[error("cannot listen on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("{phase} timed out after {}s", .after.as_secs())]
    Timeout {
        phase: TimeoutPhase,
        after: Duration,
    },

    #[error("malformed handshake: {0}")]
    MalformedHandshake(String),

    #[error("peer closed the connection before the handshake completed")]
    TransportClosed,

    #[error("transfer i/o failed: {0}")]
    Io(#[source] Arc<io::Error>),

    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Connect { .. } | TransferError::Bind { .. } => ErrorKind::ConnectError,
            TransferError::Timeout { .. } => ErrorKind::Timeout,
            TransferError::MalformedHandshake(_) => ErrorKind::MalformedHandshake,
            TransferError::TransportClosed => ErrorKind::TransportClosed,
            TransferError::Io(_) => ErrorKind::IoError,
            TransferError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub(crate) fn connect(addr: SocketAddr, source: io::Error) -> Self {
        TransferError::Connect {
            addr,
            source: Arc::new(source),
        }
    }

    pub(crate) fn bind(port: u16, source: io::Error) -> Self {
        TransferError::Bind {
            port,
            source: Arc::new(source),
        }
    }
}

impl From<io::Error> for TransferError {
    fn from(err: io::Error) -> Self {
        TransferError::Io(Arc::new(err))
    }
}
