//! Loopback transfers between a sender and a receiver session.

use anyhow::Result;
use p2p_link::{
    Artifact, DownloadDirSinks, PayloadSource, SessionEvent, SessionEvents, SessionState,
    SinkTarget, TransferConfig, TransferMetadata, TransferService,
};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::time::timeout;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Read events until the receiver reports its bound address.
async fn wait_listening(events: &mut SessionEvents, seen: &mut Vec<SessionEvent>) -> SocketAddr {
    loop {
        let event = timeout(TEST_TIMEOUT, events.recv())
            .await
            .expect("Timed out waiting for listener")
            .expect("Receiver ended before listening");
        let addr = match &event {
            SessionEvent::Listening(addr) => Some(*addr),
            _ => None,
        };
        seen.push(event);
        if let Some(addr) = addr {
            return addr;
        }
    }
}

fn progress_counts(events: &[SessionEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Progress {
                bytes_transferred, ..
            } => Some(*bytes_transferred),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_text_round_trip() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let config = TransferConfig::default().with_download_dir(dir.path());
    let receiver = TransferService::new(config.clone());
    let sender = TransferService::new(config);

    let mut rx_handle = receiver
        .listen_on(0, DownloadDirSinks::new(dir.path()))
        .expect("Receiver should start");
    let mut rx_events = rx_handle.subscribe().expect("First subscribe");
    assert!(rx_handle.subscribe().is_none());

    let mut rx_seen = Vec::new();
    let port = wait_listening(&mut rx_events, &mut rx_seen).await.port();

    let mut tx_handle = sender
        .send_to(
            LOCALHOST,
            port,
            TransferMetadata::text("report.txt"),
            PayloadSource::text("hello world"),
        )
        .expect("Sender should start");
    let mut tx_events = tx_handle.subscribe().expect("First subscribe");

    let tx_seen = timeout(TEST_TIMEOUT, tx_events.collect_until_terminal()).await?;
    rx_seen.extend(timeout(TEST_TIMEOUT, rx_events.collect_until_terminal()).await?);

    assert_eq!(rx_handle.bytes_transferred(), 11);
    assert_eq!(tx_handle.bytes_transferred(), 11);

    let rx_states: Vec<_> = rx_seen.iter().filter_map(SessionEvent::state).collect();
    assert_eq!(
        rx_states,
        vec![
            SessionState::Connecting,
            SessionState::Transferring,
            SessionState::Success
        ]
    );
    let tx_states: Vec<_> = tx_seen.iter().filter_map(SessionEvent::state).collect();
    assert_eq!(tx_states, rx_states);

    match rx_seen.last() {
        Some(SessionEvent::Succeeded(Artifact::Text(text))) => assert_eq!(text, "hello world"),
        other => panic!("Expected text artifact, got {:?}", other),
    }
    assert_eq!(progress_counts(&rx_seen), vec![11]);

    let sent = timeout(TEST_TIMEOUT, tx_handle.wait()).await??;
    assert_eq!(
        sent,
        Artifact::Sent {
            name: "report.txt".to_string()
        }
    );

    assert!(rx_handle.ended_at().is_some());
    assert!(rx_handle.ended_at() >= Some(rx_handle.started_at()));
    let received = timeout(TEST_TIMEOUT, rx_handle.wait()).await??;
    assert_eq!(received, Artifact::Text("hello world".to_string()));

    // Text never touches the download directory.
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_file_round_trip_in_chunks() -> Result<()> {
    init_tracing();
    let src_dir = tempfile::tempdir()?;
    let dst_dir = tempfile::tempdir()?;

    let payload: Vec<u8> = (0..256_000u32).map(|i| (i % 251) as u8).collect();
    let src_path = src_dir.path().join("photo.jpg");
    tokio::fs::write(&src_path, &payload).await?;

    let config = TransferConfig::default();
    assert_eq!(config.chunk_size, 100 * 1024);
    let receiver = TransferService::new(config.clone());
    let sender = TransferService::new(config);

    let mut rx_handle = receiver
        .listen_on(0, DownloadDirSinks::new(dst_dir.path()))
        .expect("Receiver should start");
    let mut rx_events = rx_handle.subscribe().unwrap();
    let mut rx_seen = Vec::new();
    let port = wait_listening(&mut rx_events, &mut rx_seen).await.port();

    let source = PayloadSource::open_file(&src_path).await?;
    assert_eq!(source.len(), 256_000);
    let metadata = TransferMetadata::for_path(&src_path).expect("File name");
    let mut tx_handle = sender
        .send_to(LOCALHOST, port, metadata, source)
        .expect("Sender should start");
    let mut tx_events = tx_handle.subscribe().unwrap();

    let tx_seen = timeout(TEST_TIMEOUT, tx_events.collect_until_terminal()).await?;
    rx_seen.extend(timeout(TEST_TIMEOUT, rx_events.collect_until_terminal()).await?);

    assert_eq!(progress_counts(&tx_seen), vec![102_400, 204_800, 256_000]);
    assert_eq!(progress_counts(&rx_seen), vec![102_400, 204_800, 256_000]);

    let received = timeout(TEST_TIMEOUT, rx_handle.wait()).await??;
    let expected_path = dst_dir.path().join("photo.jpg");
    assert_eq!(received, Artifact::File(expected_path.clone()));

    let written = tokio::fs::read(&expected_path).await?;
    assert_eq!(written.len(), 256_000);
    assert_eq!(written, payload);

    timeout(TEST_TIMEOUT, tx_handle.wait()).await??;
    Ok(())
}

#[tokio::test]
async fn test_empty_payload() -> Result<()> {
    init_tracing();
    let service = TransferService::new(TransferConfig::default());
    let mut rx_handle = service
        .listen_on(0, |_: &TransferMetadata| -> io::Result<SinkTarget> {
            Ok(SinkTarget::Text)
        })
        .unwrap();
    let mut rx_events = rx_handle.subscribe().unwrap();
    let port = wait_listening(&mut rx_events, &mut Vec::new()).await.port();

    let tx_handle = service
        .send_to(LOCALHOST, port, TransferMetadata::text("blank"), PayloadSource::text(""))
        .unwrap();

    timeout(TEST_TIMEOUT, tx_handle.wait()).await??;
    let rx_seen = timeout(TEST_TIMEOUT, rx_events.collect_until_terminal()).await?;
    assert!(progress_counts(&rx_seen).is_empty());
    assert_eq!(
        timeout(TEST_TIMEOUT, rx_handle.wait()).await??,
        Artifact::Text(String::new())
    );
    Ok(())
}

#[tokio::test]
async fn test_peer_file_name_is_sanitized() -> Result<()> {
    init_tracing();
    let outer = tempfile::tempdir()?;
    let inbox = outer.path().join("inbox");
    let service = TransferService::new(TransferConfig::default());

    let mut rx_handle = service
        .listen_on(0, DownloadDirSinks::new(&inbox))
        .unwrap();
    let mut rx_events = rx_handle.subscribe().unwrap();
    let port = wait_listening(&mut rx_events, &mut Vec::new()).await.port();

    let tx_handle = service
        .send_to(
            LOCALHOST,
            port,
            TransferMetadata::file("../escape.txt"),
            PayloadSource::from_bytes(b"contained".to_vec()),
        )
        .unwrap();
    timeout(TEST_TIMEOUT, tx_handle.wait()).await??;

    let received = timeout(TEST_TIMEOUT, rx_handle.wait()).await??;
    assert_eq!(received, Artifact::File(inbox.join("escape.txt")));
    assert!(!outer.path().join("escape.txt").exists());
    assert_eq!(tokio::fs::read(inbox.join("escape.txt")).await?, b"contained");
    Ok(())
}

#[tokio::test]
async fn test_custom_sink_factory() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let target = dir.path().join("fixed-name.bin");
    let sink_path = target.clone();
    let service = TransferService::new(TransferConfig::default());

    let mut rx_handle = service
        .listen_on(0, move |_: &TransferMetadata| -> io::Result<SinkTarget> {
            Ok(SinkTarget::File(sink_path.clone()))
        })
        .unwrap();
    let mut rx_events = rx_handle.subscribe().unwrap();
    let port = wait_listening(&mut rx_events, &mut Vec::new()).await.port();

    let tx_handle = service
        .send_to(
            LOCALHOST,
            port,
            TransferMetadata::file("whatever.dat"),
            PayloadSource::from_bytes(vec![42u8; 1000]),
        )
        .unwrap();
    timeout(TEST_TIMEOUT, tx_handle.wait()).await??;

    assert_eq!(
        timeout(TEST_TIMEOUT, rx_handle.wait()).await??,
        Artifact::File(target.clone())
    );
    assert_eq!(tokio::fs::read(&target).await?, vec![42u8; 1000]);
    Ok(())
}
