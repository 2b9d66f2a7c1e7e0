//! Single-payload transfer over a direct TCP connection.
//!
//! This module provides:
//! - The handshake codec (length-prefixed JSON metadata, then raw payload)
//! - Sender and receiver sessions, one tokio task each
//! - The session state machine and its observer channel
//! - Payload sources and destination sinks

pub mod constants;
pub mod observer;
pub mod payload;
pub mod protocol;
pub(crate) mod receiver;
pub(crate) mod sender;
pub mod session;
pub mod utils;

// Re-export public API
pub use constants::TRANSFER_PORT;
pub use observer::{SessionEvent, SessionEvents};
pub use payload::{Artifact, DownloadDirSinks, PayloadSource, SinkFactory, SinkTarget};
pub use protocol::{decode_metadata, encode_metadata};
pub use session::{Role, SessionHandle, SessionState};
