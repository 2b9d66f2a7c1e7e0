use std::time::Duration;

/// Default TCP port for transfers
pub const TRANSFER_PORT: u16 = 8988;

/// Chunk size for payload reads/writes (100KB)
pub const DEFAULT_CHUNK_SIZE: usize = 100 * 1024;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on the handshake record body (64KB)
pub const MAX_METADATA_SIZE: usize = 64 * 1024;

/// Undelivered log events tolerated per session before new ones are dropped
pub const DEFAULT_LOG_BACKLOG: usize = 1024;

/// Maximum length of a destination file name, in bytes
pub const MAX_FILENAME_LENGTH: usize = 255;
