use crate::TransferMetadata;
use crate::config::TransferConfig;
use crate::error::{Result, TimeoutPhase, TransferError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use super::payload::{Artifact, PayloadSource};
use super::protocol::send_metadata;
use super::session::{self, FlightGuard, Role, SessionDriver, SessionHandle, SessionState};
use super::utils::{format_transfer_speed, read_chunk};

/// Spawn a sender session. The caller has already won the sender slot.
pub(crate) fn start(
    config: Arc<TransferConfig>,
    guard: FlightGuard,
    target_addr: SocketAddr,
    metadata: TransferMetadata,
    source: PayloadSource,
) -> SessionHandle {
    let (mut driver, pending) = session::create(Role::Sender, config.log_backlog);
    let cancel = driver.cancel_token();

    let task = tokio::spawn(async move {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            r = send_payload(&mut driver, &config, target_addr, &metadata, source) => r,
        };
        // Socket is gone with the future above; free the slot before reporting.
        drop(guard);
        driver.finish(result)
    });

    pending.attach(task)
}

/// Connect, send the handshake and stream the payload until the source is exhausted.
async fn send_payload(
    driver: &mut SessionDriver,
    config: &TransferConfig,
    target_addr: SocketAddr,
    metadata: &TransferMetadata,
    mut source: PayloadSource,
) -> Result<Artifact> {
    driver.transition(SessionState::Connecting);
    driver.log(format!(
        "Connecting to {}, giving up after {}s",
        target_addr,
        config.connect_timeout.as_secs()
    ));

    let mut stream = match tokio::time::timeout(
        config.connect_timeout,
        TcpStream::connect(target_addr),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(TransferError::connect(target_addr, e)),
        Err(_) => {
            return Err(TransferError::Timeout {
                phase: TimeoutPhase::Connect,
                after: config.connect_timeout,
            });
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(session = %driver.id(), "Could not set TCP_NODELAY: {}", e);
    }

    driver.transition(SessionState::Transferring);
    driver.log(format!(
        "Connected, sending {} ({} bytes)",
        metadata,
        source.len()
    ));

    send_metadata(&mut stream, metadata).await?;

    let mut buffer = vec![0u8; config.chunk_size.max(1)];
    loop {
        let n = read_chunk(source.reader(), &mut buffer).await?;
        if n == 0 {
            break;
        }
        stream.write_all(&buffer[..n]).await?;
        driver.record_chunk(n);
        if n < buffer.len() {
            break;
        }
    }

    stream.flush().await?;
    stream.shutdown().await?;

    let sent = driver.bytes_transferred();
    if sent != source.len() {
        tracing::warn!(
            session = %driver.id(),
            "Source yielded {} bytes but announced {}",
            sent,
            source.len()
        );
    }
    driver.log(format!(
        "Sent {} bytes ({})",
        sent,
        format_transfer_speed(sent, driver.elapsed())
    ));

    Ok(Artifact::Sent {
        name: metadata.name.clone(),
    })
}
