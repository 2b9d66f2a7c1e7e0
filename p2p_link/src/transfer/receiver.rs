use crate::config::TransferConfig;
use crate::error::{Result, TimeoutPhase, TransferError};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket};

use super::payload::{Artifact, Sink, SinkFactory, SinkTarget, discard_partial};
use super::protocol::decode_metadata;
use super::session::{self, FlightGuard, Role, SessionDriver, SessionHandle, SessionState};
use super::utils::{format_transfer_speed, read_chunk};

/// Spawn a receiver session. The caller has already won the receiver slot
/// and claimed `port`.
pub(crate) fn start<S>(
    config: Arc<TransferConfig>,
    guard: FlightGuard,
    port: u16,
    sinks: S,
) -> SessionHandle
where
    S: SinkFactory,
{
    let (mut driver, pending) = session::create(Role::Receiver, config.log_backlog);
    let cancel = driver.cancel_token();

    let task = tokio::spawn(async move {
        let mut partial: Option<PathBuf> = None;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            r = receive_payload(&mut driver, &config, port, &sinks, &mut partial) => r,
        };

        if result.is_err() {
            if let Some(path) = partial {
                discard_partial(&path, config.partial_output).await;
            }
        }
        drop(guard);
        driver.finish(result)
    });

    pending.attach(task)
}

/// Bind with address reuse; a listener that cannot be set up is a connect error.
fn bind_listener(port: u16) -> Result<TcpListener> {
    let bind = |e| TransferError::bind(port, e);
    let socket = TcpSocket::new_v4().map_err(bind)?;
    socket.set_reuseaddr(true).map_err(bind)?;
    socket
        .bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
        .map_err(bind)?;
    socket.listen(1).map_err(bind)
}

/// Accept one peer, read its handshake and copy the payload into a sink.
async fn receive_payload<S>(
    driver: &mut SessionDriver,
    config: &TransferConfig,
    port: u16,
    sinks: &S,
    partial: &mut Option<PathBuf>,
) -> Result<Artifact>
where
    S: SinkFactory,
{
    driver.transition(SessionState::Connecting);

    let listener = bind_listener(port)?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| TransferError::bind(port, e))?;
    driver.listening(local_addr);
    driver.log(format!(
        "Waiting for a peer on {}, giving up after {}s",
        local_addr,
        config.accept_timeout.as_secs()
    ));

    let accepted = tokio::time::timeout(config.accept_timeout, listener.accept()).await;
    // One connection per session: stop listening whatever happened.
    drop(listener);
    let (mut stream, peer_addr) = match accepted {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => return Err(TransferError::bind(port, e)),
        Err(_) => {
            return Err(TransferError::Timeout {
                phase: TimeoutPhase::Accept,
                after: config.accept_timeout,
            });
        }
    };

    driver.transition(SessionState::Transferring);
    driver.log(format!("Peer connected from {}", peer_addr));

    let metadata = decode_metadata(&mut stream).await?;
    let target = sinks.target_for(&metadata)?;
    if let SinkTarget::File(path) = &target {
        driver.log(format!("Receiving {} into {}", metadata, path.display()));
        *partial = Some(path.clone());
    } else {
        driver.log(format!("Receiving {}", metadata));
    }

    let mut sink = Sink::open(target).await?;
    let mut buffer = vec![0u8; config.chunk_size.max(1)];
    loop {
        let n = read_chunk(&mut stream, &mut buffer).await?;
        if n == 0 {
            break;
        }
        sink.write_chunk(&buffer[..n]).await?;
        driver.record_chunk(n);
        if n < buffer.len() {
            break;
        }
    }

    let artifact = sink.finalize().await?;
    let received = driver.bytes_transferred();
    driver.log(format!(
        "Received {} bytes from {} ({})",
        received,
        peer_addr,
        format_transfer_speed(received, driver.elapsed())
    ));
    Ok(artifact)
}
