use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

pub mod config;
pub mod error;
pub mod transfer;

pub use config::{PartialOutput, TransferConfig};
pub use error::{ErrorKind, Result, TransferError};
pub use transfer::{
    Artifact, DownloadDirSinks, PayloadSource, Role, SessionEvent, SessionEvents, SessionHandle,
    SessionState, SinkFactory, SinkTarget,
};

use transfer::session::{FlightSlot, PortClaim};
use transfer::{receiver, sender};

/// How the receiver should interpret the bytes after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PayloadKind {
    File,
    Text,
}

/// Handshake record sent ahead of the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMetadata {
    /// Destination file name for `File`; a label for `Text`.
    pub name: String,
    pub kind: PayloadKind,
}

impl TransferMetadata {
    pub fn new(name: impl Into<String>, kind: PayloadKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn file(name: impl Into<String>) -> Self {
        Self::new(name, PayloadKind::File)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, PayloadKind::Text)
    }

    /// `File` metadata named after the last component of `path`.
    pub fn for_path(path: &Path) -> Option<Self> {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(Self::file)
    }
}

impl fmt::Display for TransferMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            PayloadKind::File => "file",
            PayloadKind::Text => "text",
        };
        write!(f, "{} '{}'", kind, self.name)
    }
}

/// Entry point for one caller: at most one sender and one receiver session
/// in flight at a time.
///
/// Start requests made while a session of the same role is running are
/// ignored and return `None`. Sessions run on the ambient tokio runtime.
#[derive(Debug, Clone)]
pub struct TransferService {
    config: Arc<TransferConfig>,
    sender_slot: FlightSlot,
    receiver_slot: FlightSlot,
}

impl TransferService {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config: Arc::new(config),
            sender_slot: FlightSlot::default(),
            receiver_slot: FlightSlot::default(),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Send to `address` on the configured port.
    pub fn send(
        &self,
        address: IpAddr,
        metadata: TransferMetadata,
        source: PayloadSource,
    ) -> Option<SessionHandle> {
        self.send_to(address, self.config.port, metadata, source)
    }

    pub fn send_to(
        &self,
        address: IpAddr,
        port: u16,
        metadata: TransferMetadata,
        source: PayloadSource,
    ) -> Option<SessionHandle> {
        let Some(guard) = self.sender_slot.try_acquire() else {
            tracing::debug!("Send to {} ignored: a send is already in flight", address);
            return None;
        };
        let target_addr = SocketAddr::new(address, port);
        tracing::info!("Starting send of {} to {}", metadata, target_addr);
        Some(sender::start(
            self.config.clone(),
            guard,
            target_addr,
            metadata,
            source,
        ))
    }

    /// Listen on the configured port.
    pub fn listen<S: SinkFactory>(&self, sinks: S) -> Option<SessionHandle> {
        self.listen_on(self.config.port, sinks)
    }

    /// Listen on `port`; 0 picks an ephemeral port, reported by
    /// [`SessionEvent::Listening`].
    pub fn listen_on<S: SinkFactory>(&self, port: u16, sinks: S) -> Option<SessionHandle> {
        let Some(guard) = self.receiver_slot.try_acquire() else {
            tracing::debug!("Listen on {} ignored: a receive is already in flight", port);
            return None;
        };
        let Some(claim) = PortClaim::try_claim(port) else {
            tracing::debug!("Listen on {} ignored: port held by another receiver", port);
            return None;
        };
        tracing::info!("Starting receiver on port {}", port);
        Some(receiver::start(
            self.config.clone(),
            guard.with_port(claim),
            port,
            sinks,
        ))
    }

    pub fn is_sending(&self) -> bool {
        self.sender_slot.is_busy()
    }

    pub fn is_receiving(&self) -> bool {
        self.receiver_slot.is_busy()
    }
}

//Command from UI to Core
#[derive(Debug, Clone)]
pub enum AppCommand {
    /// Send a file to the peer at `target_ip`
    SendFile { target_ip: String, file: PathBuf },
    /// Send a short string to the peer at `target_ip`
    SendText {
        target_ip: String,
        name: String,
        text: String,
    },
    /// Wait for one incoming transfer
    StartListener,
    CancelSend,
    CancelReceive,
}

//Report from Core to UI
#[derive(Debug, Clone)]
pub enum AppEvent {
    Status(String),
    Session { role: Role, event: SessionEvent },
    Error(String),
}

/// Drive a [`TransferService`] from a command channel until it closes.
pub async fn run_backend(
    config: TransferConfig,
    mut cmd_rx: mpsc::Receiver<AppCommand>,
    event_tx: mpsc::Sender<AppEvent>,
) {
    let service = TransferService::new(config);
    let mut sending: Option<SessionHandle> = None;
    let mut receiving: Option<SessionHandle> = None;

    let _ = event_tx
        .send(AppEvent::Status(format!(
            "Transfer port {}, downloads in {}",
            service.config().port,
            service.config().download_dir.display()
        )))
        .await;

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            AppCommand::SendFile { target_ip, file } => {
                if service.is_sending() {
                    continue;
                }
                let prepared = match parse_target(&target_ip) {
                    Ok(addr) => prepare_file(&file).await.map(|(m, s)| (addr, m, s)),
                    Err(e) => Err(e),
                };
                match prepared {
                    Ok((addr, metadata, source)) => {
                        if let Some(handle) = service.send(addr, metadata, source) {
                            sending = Some(forward_events(handle, &event_tx));
                        }
                    }
                    Err(e) => {
                        let _ = event_tx.send(AppEvent::Error(format!("{:#}", e))).await;
                    }
                }
            }
            AppCommand::SendText {
                target_ip,
                name,
                text,
            } => match parse_target(&target_ip) {
                Ok(addr) => {
                    let metadata = TransferMetadata::text(name);
                    if let Some(handle) = service.send(addr, metadata, PayloadSource::text(text)) {
                        sending = Some(forward_events(handle, &event_tx));
                    }
                }
                Err(e) => {
                    let _ = event_tx.send(AppEvent::Error(format!("{:#}", e))).await;
                }
            },
            AppCommand::StartListener => {
                let sinks = DownloadDirSinks::new(service.config().download_dir.clone());
                if let Some(handle) = service.listen(sinks) {
                    receiving = Some(forward_events(handle, &event_tx));
                }
            }
            AppCommand::CancelSend => {
                if let Some(handle) = &sending {
                    handle.cancel();
                }
            }
            AppCommand::CancelReceive => {
                if let Some(handle) = &receiving {
                    handle.cancel();
                }
            }
        }
    }

    // UI went away: don't leave sockets open behind it.
    for handle in sending.iter().chain(receiving.iter()) {
        handle.cancel();
    }
}

fn parse_target(target_ip: &str) -> anyhow::Result<IpAddr> {
    target_ip
        .trim()
        .parse()
        .with_context(|| format!("Invalid address '{}'", target_ip))
}

async fn prepare_file(path: &Path) -> anyhow::Result<(TransferMetadata, PayloadSource)> {
    let metadata = TransferMetadata::for_path(path)
        .ok_or_else(|| anyhow!("Invalid file name: {}", path.display()))?;
    let source = PayloadSource::open_file(path)
        .await
        .with_context(|| format!("Cannot open {}", path.display()))?;
    Ok((metadata, source))
}

/// Pump a session's events into the UI channel on a separate task, so a slow
/// UI only ever delays the pump, never the transfer.
fn forward_events(mut handle: SessionHandle, event_tx: &mpsc::Sender<AppEvent>) -> SessionHandle {
    if let Some(mut events) = handle.subscribe() {
        let role = handle.role();
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if event_tx.send(AppEvent::Session { role, event }).await.is_err() {
                    break;
                }
            }
        });
    }
    handle
}
