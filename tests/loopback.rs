use anyhow::{anyhow, Result};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::time::{sleep, Instant};
use warp_node::networking::{RemoteStatus, ResolvedService, TransferStatus};
use warp_node::{Engine, EngineEvent, EventReceiver, Settings};

const ALPHA: &str = "ALPHA-000001";
const BETA: &str = "BETA-000002";

struct Node {
    engine: Arc<Engine>,
    events: EventReceiver,
    dir: TempDir,
}

impl Node {
    fn download_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("downloads")
    }
}

fn node(id: &str) -> Result<Node> {
    let dir = tempdir()?;
    let mut settings = Settings {
        download_dir: dir.path().join("downloads"),
        data_dir: dir.path().join("data"),
        identifier: Some(id.to_string()),
        port: 0,
        enable_discovery: false,
        ..Settings::default()
    };
    settings.timings.duplex_retry_delay = Duration::from_millis(100);
    settings.timings.certificate_backoff = Duration::from_millis(50);
    settings.timings.certificate_timeout = Duration::from_millis(500);
    settings.timings.ping_timeout = Duration::from_secs(2);

    let (engine, events) = Engine::new(settings)?;
    Ok(Node { engine, events, dir })
}

fn service(id: &str, engine: &Engine) -> Result<ResolvedService> {
    Ok(ResolvedService {
        id: id.to_string(),
        address: "127.0.0.1".parse()?,
        port: engine.port().ok_or_else(|| anyhow!("{} is not running", id))?,
        hostname: Some(id.to_lowercase()),
    })
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(15);
    while !condition() {
        if Instant::now() > deadline {
            return Err(anyhow!("Timed out waiting for {}", what));
        }
        sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

fn is_connected(engine: &Engine, id: &str) -> bool {
    engine
        .remote(id)
        .map_or(false, |r| r.status() == RemoteStatus::Connected)
}

fn drain(events: &mut EventReceiver) -> Vec<EngineEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

async fn connected_pair() -> Result<(Node, Node)> {
    let alpha = node(ALPHA)?;
    let beta = node(BETA)?;
    alpha.engine.start().await?;
    beta.engine.start().await?;

    // Stand-in for mDNS: each side resolves the other
    beta.engine.on_service_resolved(service(ALPHA, &alpha.engine)?);
    alpha.engine.on_service_resolved(service(BETA, &beta.engine)?);

    wait_until("connection", || {
        is_connected(&alpha.engine, BETA) && is_connected(&beta.engine, ALPHA)
    })
    .await?;
    Ok((alpha, beta))
}

fn write_tree(root: &Path) -> Result<()> {
    fs::create_dir_all(root.join("photos/2024"))?;
    fs::create_dir_all(root.join("empty"))?;
    fs::write(root.join("readme.md"), b"# hello")?;
    fs::write(root.join("photos/2024/big.bin"), vec![42u8; 1024 * 1024 + 17])?;
    fs::write(root.join("photos/cover.txt"), b"")?;
    Ok(())
}

#[tokio::test]
async fn test_remote_connects_through_duplex() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let (mut alpha, mut beta) = connected_pair().await?;

    let mut statuses: Vec<RemoteStatus> = Vec::new();
    for event in drain(&mut beta.events) {
        if let EngineEvent::RemoteStatusChanged { remote_id, status } = event {
            if remote_id == ALPHA && statuses.last() != Some(&status) {
                statuses.push(status);
            }
        }
    }
    assert_eq!(
        statuses,
        vec![
            RemoteStatus::Connecting,
            RemoteStatus::AwaitingDuplex,
            RemoteStatus::Connected
        ]
    );

    // Names are fetched right after the connection comes up
    let remote = beta.engine.remote(ALPHA).unwrap();
    let expected = alpha.engine.context().local.display_name.clone();
    wait_until("remote info", || remote.info().display_name == expected).await?;

    drain(&mut alpha.events);
    alpha.engine.stop().await;
    beta.engine.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_directory_round_trip() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let (alpha, mut beta) = connected_pair().await?;
    let source = tempdir()?;
    let root = source.path().join("album");
    write_tree(&root)?;
    drain(&mut beta.events);

    let start_time = alpha.engine.send_files(BETA, vec![root.clone()]).await?;

    wait_until("offer", || {
        beta.engine
            .remote(ALPHA)
            .and_then(|r| r.transfer(start_time))
            .is_some()
    })
    .await?;
    let incoming = beta.engine.remote(ALPHA).unwrap().transfer(start_time).unwrap();
    assert_eq!(incoming.status(), TransferStatus::WaitingPermission);
    assert_eq!(incoming.summary().single_name, "album");
    assert!(drain(&mut beta.events)
        .iter()
        .any(|e| matches!(e, EngineEvent::IncomingTransfer { start_time: t, .. } if *t == start_time)));

    beta.engine.accept_transfer(ALPHA, start_time)?;
    wait_until("transfer", || incoming.status().is_terminal()).await?;
    assert_eq!(incoming.status(), TransferStatus::Finished);

    let received = beta.download_dir().join("album");
    assert_eq!(fs::read(received.join("readme.md"))?, b"# hello");
    assert_eq!(
        fs::read(received.join("photos/2024/big.bin"))?,
        fs::read(root.join("photos/2024/big.bin"))?
    );
    assert_eq!(fs::read(received.join("photos/cover.txt"))?.len(), 0);
    assert!(received.join("empty").is_dir());

    let outgoing = alpha.engine.remote(BETA).unwrap().transfer(start_time).unwrap();
    wait_until("sender", || outgoing.status().is_terminal()).await?;
    assert_eq!(outgoing.status(), TransferStatus::Finished);

    alpha.engine.stop().await;
    beta.engine.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_declined_offer_reaches_sender() -> Result<()> {
    let (alpha, beta) = connected_pair().await?;
    let source = tempdir()?;
    let file = source.path().join("note.txt");
    fs::write(&file, b"not wanted")?;

    let start_time = alpha.engine.send_files(BETA, vec![file]).await?;
    wait_until("offer", || {
        beta.engine
            .remote(ALPHA)
            .and_then(|r| r.transfer(start_time))
            .is_some()
    })
    .await?;

    beta.engine.decline_transfer(ALPHA, start_time).await?;
    let outgoing = alpha.engine.remote(BETA).unwrap().transfer(start_time).unwrap();
    wait_until("decline", || outgoing.status() == TransferStatus::Declined).await?;
    assert!(!beta.download_dir().join("note.txt").exists());

    alpha.engine.stop().await;
    beta.engine.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_failed_ping_disconnects_and_fails_transfers() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let (alpha, beta) = connected_pair().await?;
    let source = tempdir()?;
    let file = source.path().join("pending.txt");
    fs::write(&file, b"never accepted")?;
    let start_time = alpha.engine.send_files(BETA, vec![file]).await?;

    beta.engine.stop().await;
    alpha.engine.ping_remotes();
    let remote = alpha.engine.remote(BETA).unwrap();
    wait_until("disconnect", || remote.status() == RemoteStatus::Disconnected).await?;

    let outgoing = remote.transfer(start_time).unwrap();
    assert_eq!(outgoing.status(), TransferStatus::Failed);
    assert!(!outgoing.errors().is_empty());

    // Only connected remotes are pinged, so nothing moves afterwards
    alpha.engine.ping_remotes();
    remote.ping().await;
    assert_eq!(remote.status(), RemoteStatus::Disconnected);

    alpha.engine.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_duplex_check_reconnects_disconnected_remote() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let (alpha, mut beta) = connected_pair().await?;
    let alpha_view = beta.engine.remote(ALPHA).unwrap();
    let beta_view = alpha.engine.remote(BETA).unwrap();
    alpha_view.disconnect().await;
    beta_view.disconnect().await;
    drain(&mut beta.events);

    // Only ALPHA reconnects; BETA follows because ALPHA asked about duplex
    alpha.engine.spawn_connect(beta_view);
    wait_until("reconnection", || {
        is_connected(&alpha.engine, BETA) && is_connected(&beta.engine, ALPHA)
    })
    .await?;

    assert!(drain(&mut beta.events).iter().any(|e| matches!(
        e,
        EngineEvent::RemoteStatusChanged { remote_id, status: RemoteStatus::Connecting } if remote_id == ALPHA
    )));

    alpha.engine.stop().await;
    beta.engine.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_receiver_write_failure_fails_sender() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let (alpha, beta) = connected_pair().await?;
    let source = tempdir()?;
    let file = source.path().join("large.bin");
    fs::write(&file, vec![5u8; 16 * 1024 * 1024])?;

    // Nothing can be created below a regular file
    fs::write(beta.download_dir(), b"in the way")?;

    let start_time = alpha.engine.send_files(BETA, vec![file]).await?;
    wait_until("offer", || {
        beta.engine
            .remote(ALPHA)
            .and_then(|r| r.transfer(start_time))
            .is_some()
    })
    .await?;
    beta.engine.accept_transfer(ALPHA, start_time)?;

    let incoming = beta.engine.remote(ALPHA).unwrap().transfer(start_time).unwrap();
    let outgoing = alpha.engine.remote(BETA).unwrap().transfer(start_time).unwrap();
    wait_until("receiver failure", || incoming.status().is_terminal()).await?;
    wait_until("sender failure", || outgoing.status().is_terminal()).await?;

    assert_eq!(incoming.status(), TransferStatus::Failed);
    assert_eq!(incoming.errors().len(), 1);
    assert_eq!(outgoing.status(), TransferStatus::Failed);
    assert!(outgoing
        .errors()
        .iter()
        .any(|e| e.contains("stopped because of an error")));

    alpha.engine.stop().await;
    beta.engine.stop().await;
    Ok(())
}
