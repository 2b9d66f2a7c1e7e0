use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::transfer::constants::{
    DEFAULT_ACCEPT_TIMEOUT, DEFAULT_CHUNK_SIZE, DEFAULT_CONNECT_TIMEOUT, DEFAULT_LOG_BACKLOG,
    TRANSFER_PORT,
};

const DOWNLOAD_DIR_NAME: &str = "p2p_link";

const ENV_PORT: &str = "P2P_LINK_PORT";
const ENV_CONNECT_TIMEOUT: &str = "P2P_LINK_CONNECT_TIMEOUT";
const ENV_ACCEPT_TIMEOUT: &str = "P2P_LINK_ACCEPT_TIMEOUT";
const ENV_CHUNK_SIZE: &str = "P2P_LINK_CHUNK_SIZE";
const ENV_DOWNLOAD_DIR: &str = "P2P_LINK_DOWNLOAD_DIR";
const ENV_PARTIAL_OUTPUT: &str = "P2P_LINK_PARTIAL_OUTPUT";

/// What happens to a destination file when a receive fails half-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartialOutput {
    /// Leave the truncated file on disk.
    #[default]
    Keep,
    /// Delete the truncated file.
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Well-known port the receiver listens on and the sender dials.
    pub port: u16,
    pub connect_timeout: Duration,
    pub accept_timeout: Duration,
    /// Bytes moved per read/write step.
    pub chunk_size: usize,
    /// Undelivered log events tolerated before new ones are dropped.
    pub log_backlog: usize,
    /// Where received files land by default.
    pub download_dir: PathBuf,
    pub partial_output: PartialOutput,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            port: TRANSFER_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            log_backlog: DEFAULT_LOG_BACKLOG,
            download_dir: get_download_dir(),
            partial_output: PartialOutput::Keep,
        }
    }
}

impl TransferConfig {
    /// Defaults, then `.env`, then process environment.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Apply `P2P_LINK_*` overrides looked up through `lookup`.
    ///
    /// Values that fail to parse are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = parse_var(&lookup, ENV_PORT) {
            self.port = port;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_CONNECT_TIMEOUT) {
            self.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_ACCEPT_TIMEOUT) {
            self.accept_timeout = Duration::from_secs(secs);
        }
        if let Some(size) = parse_var::<usize>(&lookup, ENV_CHUNK_SIZE) {
            self.chunk_size = size.max(1);
        }
        if let Some(dir) = lookup(ENV_DOWNLOAD_DIR).filter(|d| !d.trim().is_empty()) {
            self.download_dir = PathBuf::from(dir);
        }
        if let Some(policy) = lookup(ENV_PARTIAL_OUTPUT) {
            match policy.trim().to_ascii_lowercase().as_str() {
                "keep" => self.partial_output = PartialOutput::Keep,
                "remove" => self.partial_output = PartialOutput::Remove,
                other => tracing::warn!("Ignoring {}={:?}: expected keep or remove", ENV_PARTIAL_OUTPUT, other),
            }
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring unparsable {}={:?}", key, raw);
            None
        }
    }
}

/// Default download directory: `~/p2p_link`, or `./p2p_link` without a home.
pub fn get_download_dir() -> PathBuf {
    UserDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DOWNLOAD_DIR_NAME)
}
