use anyhow::{anyhow, Context as _, Result};
use futures_util::StreamExt;
use log::{debug, error, info, trace, warn};
use std::future::Future;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tonic::transport::Channel;
use tonic::{Code, Status};

use super::bootstrap::{self, FetchPolicy};
use super::communication::connect_channel;
use super::communication::warp::warp_client::WarpClient;
use super::communication::warp::{LookupName, StopInfo, TransferOpRequest};
use super::discovery::ResolvedService;
use super::file_transfer::{now_millis, ChunkOutcome, Transfer, TransferDirection, TransferStatus};
use crate::engine::Context;
use crate::events::EngineEvent;

/// Offers refused for a start time clash before giving up
const OFFER_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteStatus {
    Disconnected,
    Connecting,
    AwaitingDuplex,
    Connected,
    Error,
}

/// Result of repeatedly asking a peer whether it has a connection back to us
#[derive(Debug)]
pub enum DuplexOutcome {
    Established,
    /// Every attempt answered "not yet"
    Exhausted,
    /// The channel itself failed
    Failed(Status),
}

/// Ask `check` up to `attempts` times, `delay` apart. A transport error ends
/// the wait immediately.
pub async fn wait_for_duplex<F, Fut>(attempts: u32, delay: Duration, mut check: F) -> DuplexOutcome
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<bool, Status>>,
{
    for attempt in 1..=attempts {
        match check(attempt).await {
            Ok(true) => return DuplexOutcome::Established,
            Ok(false) => {
                debug!("No duplex yet, attempt {}/{}", attempt, attempts);
                if attempt < attempts {
                    sleep(delay).await;
                }
            }
            Err(status) => return DuplexOutcome::Failed(status),
        }
    }
    DuplexOutcome::Exhausted
}

/// Snapshot of a remote for display
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteInfo {
    pub id: String,
    pub address: IpAddr,
    pub port: u16,
    pub hostname: String,
    pub display_name: String,
    pub user_name: String,
    pub status: RemoteStatus,
    pub service_available: bool,
    pub has_avatar: bool,
}

struct RemoteState {
    address: IpAddr,
    port: u16,
    hostname: String,
    display_name: String,
    user_name: String,
    avatar: Option<Vec<u8>>,
    status: RemoteStatus,
    service_available: bool,
    client: Option<WarpClient<Channel>>,
    transfers: Vec<Arc<Transfer>>,
    last_start_time: u64,
}

/// A peer found through discovery and our connection to it
pub struct Remote {
    ctx: Arc<Context>,
    id: String,
    state: Mutex<RemoteState>,
}

impl Remote {
    pub fn new(ctx: Arc<Context>, service: &ResolvedService) -> Arc<Self> {
        let hostname = service.hostname.clone().unwrap_or_default();
        Arc::new(Self {
            ctx,
            id: service.id.clone(),
            state: Mutex::new(RemoteState {
                address: service.address,
                port: service.port,
                display_name: hostname.clone(),
                hostname,
                user_name: String::new(),
                avatar: None,
                status: RemoteStatus::Disconnected,
                service_available: true,
                client: None,
                transfers: Vec::new(),
                last_start_time: 0,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> RemoteStatus {
        self.state().status
    }

    pub fn info(&self) -> RemoteInfo {
        let state = self.state();
        RemoteInfo {
            id: self.id.clone(),
            address: state.address,
            port: state.port,
            hostname: state.hostname.clone(),
            display_name: state.display_name.clone(),
            user_name: state.user_name.clone(),
            status: state.status,
            service_available: state.service_available,
            has_avatar: state.avatar.is_some(),
        }
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lookup_name(&self) -> LookupName {
        LookupName {
            id: self.ctx.local.id.clone(),
            readable_name: self.ctx.local.hostname.clone(),
        }
    }

    fn client(&self) -> Result<WarpClient<Channel>> {
        self.state()
            .client
            .clone()
            .ok_or_else(|| anyhow!("Not connected to {}", self.id))
    }

    /// The service was (re)resolved. Returns whether a reconnect is due.
    pub fn update_service(&self, service: &ResolvedService) -> bool {
        let mut state = self.state();
        state.address = service.address;
        state.port = service.port;
        if let Some(hostname) = &service.hostname {
            state.hostname = hostname.clone();
        }
        state.service_available = true;
        matches!(state.status, RemoteStatus::Disconnected | RemoteStatus::Error)
    }

    /// The peer announced its shutdown. History stays.
    pub fn mark_unavailable(&self) {
        self.state().service_available = false;
    }

    async fn set_status(&self, next: RemoteStatus) {
        let in_flight = {
            let mut state = self.state();
            if state.status == next {
                return;
            }
            let previous = state.status;
            state.status = next;
            if !matches!(next, RemoteStatus::AwaitingDuplex | RemoteStatus::Connected) {
                state.client = None;
            }
            debug!("Remote {} {:?} -> {:?}", self.id, previous, next);

            if previous == RemoteStatus::Connected {
                state
                    .transfers
                    .iter()
                    .filter(|t| !t.status().is_terminal())
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            }
        };

        self.ctx.events.emit(EngineEvent::RemoteStatusChanged {
            remote_id: self.id.clone(),
            status: next,
        });

        for transfer in in_flight {
            transfer.fail("Connection to the remote was lost").await;
        }
    }

    /// Claim the remote for a connection attempt
    fn begin_connect(&self) -> bool {
        {
            let mut state = self.state();
            if !matches!(state.status, RemoteStatus::Disconnected | RemoteStatus::Error) {
                trace!("Remote {} already {:?}, not connecting", self.id, state.status);
                return false;
            }
            state.status = RemoteStatus::Connecting;
        }
        self.ctx.events.emit(EngineEvent::RemoteStatusChanged {
            remote_id: self.id.clone(),
            status: RemoteStatus::Connecting,
        });
        true
    }

    /// Bootstrap trust, open the channel and wait for duplex. Failures end
    /// in ERROR; calling again retries.
    pub async fn connect(&self) {
        if !self.begin_connect() {
            return;
        }
        info!("Connecting to {}", self.id);

        if let Err(e) = self.establish().await {
            error!("Connection to {} failed: {:#}", self.id, e);
            self.set_status(RemoteStatus::Error).await;
        }
    }

    async fn establish(&self) -> Result<()> {
        let (address, port) = {
            let state = self.state();
            (state.address, state.port)
        };
        let timings = &self.ctx.settings.timings;

        let policy = FetchPolicy {
            attempts: timings.certificate_attempts,
            backoff: timings.certificate_backoff,
            receive_timeout: timings.certificate_timeout,
        };
        bootstrap::receive_certificate(address, port, &self.id, &self.ctx.certs, policy).await?;

        let certificate = self.ctx.certs.remote_certificate(&self.id)?;
        let client = WarpClient::new(connect_channel(address, port, certificate)?);
        self.state().client = Some(client.clone());
        self.set_status(RemoteStatus::AwaitingDuplex).await;

        let lookup = self.lookup_name();
        let outcome = wait_for_duplex(timings.duplex_attempts, timings.duplex_retry_delay, |_| {
            let mut client = client.clone();
            let lookup = lookup.clone();
            async move {
                client
                    .check_duplex_connection(lookup)
                    .await
                    .map(|r| r.into_inner().response)
            }
        })
        .await;

        match outcome {
            DuplexOutcome::Established => {}
            DuplexOutcome::Exhausted => {
                return Err(anyhow!("No duplex connection after {} attempts", timings.duplex_attempts))
            }
            DuplexOutcome::Failed(status) => return Err(anyhow!("Duplex check failed: {}", status.message())),
        }

        // Disconnected while we were waiting
        if self.status() != RemoteStatus::AwaitingDuplex {
            return Ok(());
        }
        self.set_status(RemoteStatus::Connected).await;
        info!("Connected to {}", self.id);

        self.fetch_info(client).await;
        Ok(())
    }

    async fn fetch_info(&self, mut client: WarpClient<Channel>) {
        match client.get_remote_machine_info(self.lookup_name()).await {
            Ok(response) => {
                let info = response.into_inner();
                let mut state = self.state();
                state.display_name = info.display_name;
                state.user_name = info.user_name;
            }
            Err(status) => warn!("Could not get info from {}: {}", self.id, status.message()),
        }

        match self.fetch_avatar(&mut client).await {
            Ok(avatar) if !avatar.is_empty() => self.state().avatar = Some(avatar),
            Ok(_) => {}
            Err(e) => debug!("No avatar from {}: {:#}", self.id, e),
        }

        self.ctx.events.emit(EngineEvent::RemoteStatusChanged {
            remote_id: self.id.clone(),
            status: self.status(),
        });
    }

    async fn fetch_avatar(&self, client: &mut WarpClient<Channel>) -> Result<Vec<u8>> {
        let mut stream = client.get_remote_machine_avatar(self.lookup_name()).await?.into_inner();
        let mut avatar = Vec::new();
        while let Some(piece) = stream.next().await {
            avatar.extend_from_slice(&piece?.avatar_chunk);
        }
        Ok(avatar)
    }

    /// Liveness probe. Any failure drops the remote to DISCONNECTED.
    pub async fn ping(&self) {
        if self.status() != RemoteStatus::Connected {
            return;
        }
        let Ok(mut client) = self.client() else {
            return;
        };

        let deadline = self.ctx.settings.timings.ping_timeout;
        let reason = match timeout(deadline, client.ping(self.lookup_name())).await {
            Ok(Ok(_)) => {
                trace!("Ping to {} ok", self.id);
                return;
            }
            Ok(Err(status)) => status.message().to_string(),
            Err(_) => "timed out".to_string(),
        };
        warn!("Ping to {} failed ({}), disconnecting", self.id, reason);
        self.set_status(RemoteStatus::Disconnected).await;
    }

    pub async fn disconnect(&self) {
        if matches!(self.status(), RemoteStatus::Connected | RemoteStatus::AwaitingDuplex) {
            info!("Disconnecting from {}", self.id);
            self.set_status(RemoteStatus::Disconnected).await;
        }
    }

    /* ---------- transfers ---------- */

    pub fn transfers(&self) -> Vec<Arc<Transfer>> {
        self.state().transfers.clone()
    }

    pub fn transfer(&self, start_time: u64) -> Option<Arc<Transfer>> {
        self.state()
            .transfers
            .iter()
            .find(|t| t.start_time() == start_time)
            .cloned()
    }

    fn transfer_in(&self, start_time: u64, direction: TransferDirection) -> Option<Arc<Transfer>> {
        self.state()
            .transfers
            .iter()
            .find(|t| t.start_time() == start_time && t.direction() == direction)
            .cloned()
    }

    /// Outgoing transfer the peer refers to by our start time
    pub fn outgoing_transfer(&self, start_time: u64) -> Option<Arc<Transfer>> {
        self.transfer_in(start_time, TransferDirection::Send)
    }

    pub(crate) fn add_transfer(&self, transfer: Arc<Transfer>) {
        self.state().transfers.push(transfer);
        self.ctx.events.emit(EngineEvent::TransferListChanged {
            remote_id: self.id.clone(),
        });
    }

    /// Start time for a new outgoing transfer, unique among this remote's
    /// transfers
    fn reserve_start_time(&self) -> u64 {
        let mut state = self.state();
        let mut candidate = now_millis().max(state.last_start_time + 1);
        while state.transfers.iter().any(|t| t.start_time() == candidate) {
            candidate += 1;
        }
        state.last_start_time = candidate;
        candidate
    }

    /// Offer `paths` to the peer. Returns the start time identifying the
    /// transfer.
    pub async fn send_files(&self, paths: Vec<PathBuf>) -> Result<u64> {
        if self.status() != RemoteStatus::Connected {
            return Err(anyhow!("Remote {} is not connected", self.id));
        }
        let mut client = self.client()?;

        let start_time = self.reserve_start_time();
        let ctx = self.ctx.clone();
        let remote_id = self.id.clone();
        let transfer = tokio::task::spawn_blocking(move || Transfer::prepare_send(ctx, &remote_id, &paths, start_time))
            .await
            .context("File listing task failed")??;
        let mut transfer = Arc::new(transfer);
        self.add_transfer(transfer.clone());

        info!(
            "Offering {} entries ({} bytes) to {}",
            transfer.summary().file_count,
            transfer.summary().total_size,
            self.id
        );
        for attempt in 1..=OFFER_ATTEMPTS {
            match client.process_transfer_op_request(transfer.offer_request()).await {
                Ok(_) => return Ok(transfer.start_time()),
                // The peer already has a transfer with us under this start time
                Err(status) if status.code() == Code::AlreadyExists && attempt < OFFER_ATTEMPTS => {
                    debug!("Start time {} taken on {}, restamping", transfer.start_time(), self.id);
                    let restamped = Arc::new(transfer.restamp(self.reserve_start_time()));
                    self.replace_transfer(&transfer, restamped.clone());
                    transfer = restamped;
                }
                Err(status) => {
                    let reason = format!("Offer was not delivered: {}", status.message());
                    transfer.fail(&reason).await;
                    return Err(anyhow!(reason));
                }
            }
        }
        Err(anyhow!("Offer to {} was never delivered", self.id))
    }

    fn replace_transfer(&self, old: &Arc<Transfer>, new: Arc<Transfer>) {
        {
            let mut state = self.state();
            state.transfers.retain(|t| !Arc::ptr_eq(t, old));
            state.transfers.push(new);
        }
        self.ctx.events.emit(EngineEvent::TransferListChanged {
            remote_id: self.id.clone(),
        });
    }

    /// The peer offered us a transfer. A start time already used by one of
    /// our own transfers with this peer is refused so the peer restamps.
    pub fn on_transfer_offer(self: &Arc<Self>, request: &TransferOpRequest) -> Result<(), Status> {
        let transfer = Arc::new(
            Transfer::from_offer(self.ctx.clone(), request)
                .map_err(|e| Status::invalid_argument(format!("{:#}", e)))?,
        );
        if let Some(existing) = self.transfer(transfer.start_time()) {
            if existing.direction() == TransferDirection::Receive {
                debug!("Ignoring repeated offer {} from {}", transfer.start_time(), self.id);
                return Ok(());
            }
            warn!("Offer {} from {} collides with our own transfer", transfer.start_time(), self.id);
            return Err(Status::already_exists(format!(
                "Start time {} is already in use",
                transfer.start_time()
            )));
        }

        transfer.prepare_receive();
        self.add_transfer(transfer.clone());
        info!(
            "Incoming transfer {} from {}: {} entries, {} bytes",
            transfer.start_time(),
            self.id,
            transfer.summary().file_count,
            transfer.summary().total_size
        );
        self.ctx.events.emit(EngineEvent::IncomingTransfer {
            remote_id: self.id.clone(),
            start_time: transfer.start_time(),
        });

        if self.ctx.settings.auto_accept {
            if self.status() == RemoteStatus::Connected {
                self.spawn_receive(transfer);
            } else {
                info!(
                    "Not auto-accepting {} while {} is {:?}",
                    transfer.start_time(),
                    self.id,
                    self.status()
                );
            }
        }
        Ok(())
    }

    pub fn accept_transfer(self: &Arc<Self>, start_time: u64) -> Result<()> {
        let transfer = self
            .transfer_in(start_time, TransferDirection::Receive)
            .ok_or_else(|| anyhow!("No incoming transfer {} from {}", start_time, self.id))?;
        if self.status() != RemoteStatus::Connected {
            return Err(anyhow!("Remote {} is not connected", self.id));
        }
        if transfer.status() != TransferStatus::WaitingPermission {
            return Err(anyhow!("Transfer {} is {:?}", start_time, transfer.status()));
        }
        self.spawn_receive(transfer);
        Ok(())
    }

    fn spawn_receive(self: &Arc<Self>, transfer: Arc<Transfer>) {
        let remote = self.clone();
        tokio::spawn(async move { remote.receive_transfer(transfer).await });
    }

    /// Pull the chunk stream of an accepted transfer until it ends
    async fn receive_transfer(&self, transfer: Arc<Transfer>) {
        if self.status() != RemoteStatus::Connected {
            warn!("Remote {} went away before transfer {} started", self.id, transfer.start_time());
            return;
        }
        if !transfer.start_receiving() {
            return;
        }
        let mut client = match self.client() {
            Ok(client) => client,
            Err(e) => {
                transfer.fail(&format!("{:#}", e)).await;
                return;
            }
        };

        let mut stream = match client.start_transfer(transfer.op_info()).await {
            Ok(response) => response.into_inner(),
            Err(status) => {
                transfer
                    .fail(&format!("Sender refused to start: {}", status.message()))
                    .await;
                return;
            }
        };

        loop {
            match stream.next().await {
                Some(Ok(chunk)) => match transfer.receive_chunk(chunk).await {
                    ChunkOutcome::Continue => {}
                    ChunkOutcome::Ended => return,
                    ChunkOutcome::Failed => {
                        self.send_stop(&transfer, true).await;
                        return;
                    }
                },
                None => {
                    transfer.finish_receive().await;
                    return;
                }
                Some(Err(status)) => {
                    if !transfer.status().is_terminal() {
                        transfer
                            .fail(&format!("Transfer stream failed: {}", status.message()))
                            .await;
                    }
                    return;
                }
            }
        }
    }

    /// Refuse an incoming offer
    pub async fn decline_transfer(&self, start_time: u64) -> Result<()> {
        let transfer = self
            .transfer_in(start_time, TransferDirection::Receive)
            .ok_or_else(|| anyhow!("No incoming transfer {} from {}", start_time, self.id))?;
        self.withdraw(transfer).await
    }

    /// Take back an outgoing offer the peer hasn't accepted yet
    pub async fn cancel_offer(&self, start_time: u64) -> Result<()> {
        let transfer = self
            .outgoing_transfer(start_time)
            .ok_or_else(|| anyhow!("No outgoing transfer {} to {}", start_time, self.id))?;
        self.withdraw(transfer).await
    }

    async fn withdraw(&self, transfer: Arc<Transfer>) -> Result<()> {
        if !transfer.make_declined() {
            return Err(anyhow!(
                "Transfer {} can't be declined while {:?}",
                transfer.start_time(),
                transfer.status()
            ));
        }
        let mut client = self.client()?;
        client
            .cancel_transfer_op_request(transfer.op_info())
            .await
            .map_err(|status| anyhow!("Peer did not get the cancellation: {}", status.message()))?;
        Ok(())
    }

    /// Abort a transfer on both ends
    pub async fn stop_transfer(&self, start_time: u64, error: bool) -> Result<()> {
        let transfer = self
            .transfer(start_time)
            .ok_or_else(|| anyhow!("No transfer {} with {}", start_time, self.id))?;
        if transfer.status().is_terminal() {
            return Err(anyhow!("Transfer {} already ended", start_time));
        }
        self.send_stop(&transfer, error).await;
        transfer.on_stopped(error).await;
        Ok(())
    }

    async fn send_stop(&self, transfer: &Transfer, error: bool) {
        let Ok(mut client) = self.client() else {
            return;
        };
        let request = StopInfo {
            info: Some(transfer.op_info()),
            error,
        };
        if let Err(status) = client.stop_transfer(request).await {
            warn!("Could not tell {} to stop: {}", self.id, status.message());
        }
    }

    /// Drop every transfer that reached a terminal state
    pub fn clear_finished_transfers(&self) {
        self.state().transfers.retain(|t| !t.status().is_terminal());
        self.ctx.events.emit(EngineEvent::TransferListChanged {
            remote_id: self.id.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::events::EventReceiver;
    use crate::networking::communication::warp::OpInfo;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::{tempdir, TempDir};
    use tokio::net::UdpSocket;

    fn context(auto_accept: bool) -> Result<(Arc<Context>, EventReceiver, TempDir)> {
        let dir = tempdir()?;
        let mut settings = Settings {
            download_dir: dir.path().join("downloads"),
            data_dir: dir.path().join("data"),
            auto_accept,
            identifier: Some("BETA-000002".to_string()),
            ..Settings::default()
        };
        settings.timings.certificate_attempts = 2;
        settings.timings.certificate_backoff = Duration::from_millis(10);
        settings.timings.certificate_timeout = Duration::from_millis(100);
        let (ctx, events) = Context::new(settings)?;
        Ok((ctx, events, dir))
    }

    fn service(port: u16) -> ResolvedService {
        ResolvedService {
            id: "ALPHA-000001".to_string(),
            address: "127.0.0.1".parse().unwrap(),
            port,
            hostname: Some("alpha".to_string()),
        }
    }

    fn offer(timestamp: u64) -> TransferOpRequest {
        TransferOpRequest {
            info: Some(OpInfo {
                ident: "ALPHA-000001".to_string(),
                timestamp,
                readable_name: "alpha".to_string(),
            }),
            size: 3,
            count: 1,
            name_if_single: "a.txt".to_string(),
            ..Default::default()
        }
    }

    fn drain(events: &mut EventReceiver) -> Vec<EngineEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    #[tokio::test]
    async fn test_duplex_established_on_second_attempt() {
        let calls = AtomicU32::new(0);
        let outcome = wait_for_duplex(10, Duration::from_millis(1), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(attempt == 2) }
        })
        .await;
        assert!(matches!(outcome, DuplexOutcome::Established));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_duplex_exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let outcome = wait_for_duplex(10, Duration::from_millis(1), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(false) }
        })
        .await;
        assert!(matches!(outcome, DuplexOutcome::Exhausted));
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_duplex_transport_error_aborts() {
        let calls = AtomicU32::new(0);
        let outcome = wait_for_duplex(10, Duration::from_millis(1), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 3 {
                    Err(Status::unavailable("connection refused"))
                } else {
                    Ok(false)
                }
            }
        })
        .await;
        assert!(matches!(outcome, DuplexOutcome::Failed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_bootstrap_ends_in_error() -> Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();
        let (ctx, mut events, _dir) = context(false)?;
        let silent = UdpSocket::bind("127.0.0.1:0").await?;
        let remote = Remote::new(ctx, &service(silent.local_addr()?.port()));

        remote.connect().await;
        assert_eq!(remote.status(), RemoteStatus::Error);

        let statuses: Vec<_> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::RemoteStatusChanged { status, .. } => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![RemoteStatus::Connecting, RemoteStatus::Error]);

        // Error may be retried
        assert!(remote.begin_connect());
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_is_not_reentrant() -> Result<()> {
        let (ctx, _events, _dir) = context(false)?;
        let remote = Remote::new(ctx, &service(42000));
        assert!(remote.begin_connect());
        assert!(!remote.begin_connect());
        Ok(())
    }

    #[tokio::test]
    async fn test_leaving_connected_fails_transfers() -> Result<()> {
        let (ctx, _events, _dir) = context(false)?;
        let remote = Remote::new(ctx, &service(42000));
        remote.set_status(RemoteStatus::Connected).await;
        remote.on_transfer_offer(&offer(10))?;
        remote.on_transfer_offer(&offer(11))?;
        remote.transfer(11).unwrap().make_declined();

        remote.set_status(RemoteStatus::Disconnected).await;
        assert_eq!(remote.transfer(10).unwrap().status(), TransferStatus::Failed);
        assert_eq!(remote.transfer(11).unwrap().status(), TransferStatus::Declined);
        Ok(())
    }

    #[tokio::test]
    async fn test_offer_waits_for_permission() -> Result<()> {
        let (ctx, mut events, _dir) = context(false)?;
        let remote = Remote::new(ctx, &service(42000));

        remote.on_transfer_offer(&offer(77))?;
        remote.on_transfer_offer(&offer(77))?;
        assert_eq!(remote.transfers().len(), 1);
        assert_eq!(remote.transfer(77).unwrap().status(), TransferStatus::WaitingPermission);

        let incoming = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, EngineEvent::IncomingTransfer { start_time: 77, .. }))
            .count();
        assert_eq!(incoming, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_send_requires_connection() -> Result<()> {
        let (ctx, _events, dir) = context(false)?;
        let remote = Remote::new(ctx, &service(42000));
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"abc")?;

        assert!(remote.send_files(vec![file]).await.is_err());
        assert!(remote.transfers().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_start_times_are_unique() -> Result<()> {
        let (ctx, _events, _dir) = context(false)?;
        let remote = Remote::new(ctx, &service(42000));
        let now = now_millis();
        remote.on_transfer_offer(&offer(now + 1))?;

        let first = remote.reserve_start_time();
        let second = remote.reserve_start_time();
        let third = remote.reserve_start_time();
        assert!(first < second && second < third);
        assert_ne!(first, now + 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_clear_finished_keeps_active() -> Result<()> {
        let (ctx, _events, _dir) = context(false)?;
        let remote = Remote::new(ctx, &service(42000));
        remote.on_transfer_offer(&offer(1))?;
        remote.on_transfer_offer(&offer(2))?;
        remote.transfer(1).unwrap().make_declined();

        remote.clear_finished_transfers();
        let left: Vec<u64> = remote.transfers().iter().map(|t| t.start_time()).collect();
        assert_eq!(left, vec![2]);
        Ok(())
    }

    #[tokio::test]
    async fn test_update_service_requests_reconnect() -> Result<()> {
        let (ctx, _events, _dir) = context(false)?;
        let remote = Remote::new(ctx, &service(42000));
        remote.mark_unavailable();
        assert!(!remote.info().service_available);

        let mut moved = service(42001);
        moved.address = "127.0.0.2".parse()?;
        assert!(remote.update_service(&moved));
        let info = remote.info();
        assert!(info.service_available);
        assert_eq!(info.port, 42001);
        assert_eq!(info.address, moved.address);

        remote.set_status(RemoteStatus::Connected).await;
        assert!(!remote.update_service(&moved));
        Ok(())
    }

    #[tokio::test]
    async fn test_accept_requires_connection() -> Result<()> {
        let (ctx, _events, _dir) = context(false)?;
        let remote = Remote::new(ctx, &service(42000));
        remote.on_transfer_offer(&offer(500))?;

        assert!(remote.accept_transfer(500).is_err());
        let transfer = remote.transfer(500).unwrap();
        assert_eq!(transfer.status(), TransferStatus::WaitingPermission);
        assert!(transfer.errors().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_auto_accept_waits_for_duplex() -> Result<()> {
        let (ctx, _events, _dir) = context(true)?;
        let remote = Remote::new(ctx, &service(42000));
        remote.set_status(RemoteStatus::AwaitingDuplex).await;

        remote.on_transfer_offer(&offer(501))?;
        tokio::task::yield_now().await;
        assert_eq!(remote.transfer(501).unwrap().status(), TransferStatus::WaitingPermission);
        Ok(())
    }
}
