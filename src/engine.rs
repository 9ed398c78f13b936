use anyhow::{anyhow, Context as _, Result};
use log::{debug, info};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::events::{EngineEvent, EventReceiver, EventSink};
use crate::networking::bootstrap::CertificateResponder;
use crate::networking::certificate::CertificateStore;
use crate::networking::communication::start_grpc_server;
use crate::networking::discovery::{DiscoveryEngine, DiscoveryEvent, LocalService, ResolvedService};
use crate::networking::interface::select_interface;
use crate::networking::remote::{Remote, RemoteStatus};

const CERTIFICATE_DIR: &str = "certificates";

/// Supplies the picture peers get when they ask for our avatar
pub trait AvatarSource: Send + Sync {
    fn avatar(&self) -> Result<Option<Vec<u8>>>;
}

/// Avatar read from an image file on every request
pub struct FileAvatar {
    path: PathBuf,
}

impl FileAvatar {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl AvatarSource for FileAvatar {
    fn avatar(&self) -> Result<Option<Vec<u8>>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path).with_context(|| format!("Failed to read {}", self.path.display()))?;
        Ok(Some(bytes))
    }
}

/// Who we are on the network
#[derive(Debug, Clone)]
pub struct LocalInfo {
    pub id: String,
    pub hostname: String,
    pub display_name: String,
    pub user_name: String,
}

/// Everything remotes and transfers need from the engine
pub struct Context {
    pub settings: Settings,
    pub local: LocalInfo,
    pub certs: CertificateStore,
    pub events: EventSink,
    pub avatar: Option<Arc<dyn AvatarSource>>,
}

impl Context {
    pub fn new(settings: Settings) -> Result<(Arc<Self>, EventReceiver)> {
        let avatar = settings
            .avatar_path
            .clone()
            .map(|path| Arc::new(FileAvatar::new(path)) as Arc<dyn AvatarSource>);
        Self::build(settings, avatar)
    }

    fn build(settings: Settings, avatar: Option<Arc<dyn AvatarSource>>) -> Result<(Arc<Self>, EventReceiver)> {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        let id = settings.resolve_identifier(&hostname)?;
        let user_name = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "user".to_string());
        let display_name = settings.display_name.clone().unwrap_or_else(|| user_name.clone());

        let certs = CertificateStore::open(&settings.data_dir.join(CERTIFICATE_DIR))?;
        let (events, receiver) = EventSink::channel();

        let ctx = Self {
            settings,
            local: LocalInfo {
                id,
                hostname,
                display_name,
                user_name,
            },
            certs,
            events,
            avatar,
        };
        Ok((Arc::new(ctx), receiver))
    }
}

/// Network side of a started engine
struct Running {
    port: u16,
    discovery: Option<Arc<DiscoveryEngine>>,
    responder: CertificateResponder,
    server_shutdown: oneshot::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns the remotes map and the long-running network services
pub struct Engine {
    ctx: Arc<Context>,
    remotes: Mutex<HashMap<String, Arc<Remote>>>,
    running: Mutex<Option<Running>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Engine {
    pub fn new(settings: Settings) -> Result<(Arc<Self>, EventReceiver)> {
        let (ctx, events) = Context::new(settings)?;
        Ok((Self::from_context(ctx), events))
    }

    /// Like `new`, with the avatar coming from the embedding application
    pub fn with_avatar(settings: Settings, avatar: Arc<dyn AvatarSource>) -> Result<(Arc<Self>, EventReceiver)> {
        let (ctx, events) = Context::build(settings, Some(avatar))?;
        Ok((Self::from_context(ctx), events))
    }

    fn from_context(ctx: Arc<Context>) -> Arc<Self> {
        info!("Local identifier is {}", ctx.local.id);
        Arc::new(Self {
            ctx,
            remotes: Mutex::new(HashMap::new()),
            running: Mutex::new(None),
        })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn local_id(&self) -> &str {
        &self.ctx.local.id
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Port the server and responder actually listen on
    pub fn port(&self) -> Option<u16> {
        lock(&self.running).as_ref().map(|r| r.port)
    }

    /// Bind the server and the certificate responder, then announce ourselves
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_running() {
            return Err(anyhow!("Engine is already running"));
        }
        let settings = &self.ctx.settings;

        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], settings.port)))
            .await
            .with_context(|| format!("Failed to bind TCP port {}", settings.port))?;
        let port = listener.local_addr()?.port();
        let responder = CertificateResponder::start(port, self.ctx.certs.local_certificate_der()).await?;

        let (server_shutdown, shutdown_rx) = oneshot::channel();
        let mut tasks = vec![start_grpc_server(self.clone(), listener, shutdown_rx)?];
        tasks.push(tokio::spawn(ping_loop(
            Arc::downgrade(self),
            settings.timings.ping_interval,
        )));

        let discovery = if settings.enable_discovery {
            match self.start_discovery(port).await {
                Ok((discovery, pump)) => {
                    tasks.push(pump);
                    Some(discovery)
                }
                Err(e) => {
                    let _ = server_shutdown.send(());
                    for task in tasks.iter().skip(1) {
                        task.abort();
                    }
                    return Err(e.context("Failed to start discovery"));
                }
            }
        } else {
            debug!("Discovery disabled");
            None
        };

        *lock(&self.running) = Some(Running {
            port,
            discovery,
            responder,
            server_shutdown,
            tasks,
        });
        info!("Engine started on port {}", port);
        self.ctx.events.emit(EngineEvent::ServerStatusChanged { running: true });
        Ok(())
    }

    async fn start_discovery(self: &Arc<Self>, port: u16) -> Result<(Arc<DiscoveryEngine>, JoinHandle<()>)> {
        let settings = &self.ctx.settings;
        let interface = select_interface(settings.network_interface.as_deref())?;
        let local = LocalService {
            id: self.ctx.local.id.clone(),
            hostname: self.ctx.local.hostname.clone(),
            address: interface.ip,
            port,
        };
        // Answers are only filtered by subnet when the user picked an interface
        let filter = settings.network_interface.as_ref().map(|_| interface);

        let (tx, rx) = mpsc::unbounded_channel();
        let discovery = DiscoveryEngine::new(&settings.group_code, local, filter, tx)?;
        let pump = tokio::spawn(discovery_pump(Arc::downgrade(self), rx));
        discovery.start().await?;
        Ok((discovery, pump))
    }

    /// Withdraw from the network and drop every connection
    pub async fn stop(&self) {
        let Some(running) = lock(&self.running).take() else {
            return;
        };
        if let Some(discovery) = &running.discovery {
            discovery.stop();
        }
        running.responder.stop();
        let _ = running.server_shutdown.send(());
        // The server task winds down by itself after the signal
        for task in running.tasks.iter().skip(1) {
            task.abort();
        }

        for remote in self.remotes() {
            remote.disconnect().await;
        }
        info!("Engine stopped");
        self.ctx.events.emit(EngineEvent::ServerStatusChanged { running: false });
    }

    fn discovery(&self) -> Result<Arc<DiscoveryEngine>> {
        lock(&self.running)
            .as_ref()
            .and_then(|r| r.discovery.clone())
            .ok_or_else(|| anyhow!("Discovery is not running"))
    }

    /// Query the network for peers again
    pub fn rescan(&self) -> Result<()> {
        info!("Rescanning for remotes");
        self.discovery()?.query()
    }

    /// Publish our real record again
    pub fn reannounce(&self) -> Result<()> {
        self.discovery()?.reannounce()
    }

    pub fn remotes(&self) -> Vec<Arc<Remote>> {
        lock(&self.remotes).values().cloned().collect()
    }

    pub fn remote(&self, id: &str) -> Option<Arc<Remote>> {
        lock(&self.remotes).get(id).cloned()
    }

    /// Insert a remote for `service` unless one with that identifier exists.
    /// Returns the remote and whether it was created.
    fn insert_remote(&self, service: &ResolvedService) -> (Arc<Remote>, bool) {
        match lock(&self.remotes).entry(service.id.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => (entry.insert(Remote::new(self.ctx.clone(), service)).clone(), true),
        }
    }

    /// Track `service` without connecting to it
    pub fn add_remote(&self, service: ResolvedService) -> Arc<Remote> {
        let (remote, created) = self.insert_remote(&service);
        if created {
            self.ctx.events.emit(EngineEvent::RemoteListChanged);
        } else {
            remote.update_service(&service);
        }
        remote
    }

    /// A peer record resolved: create the remote or refresh the known one
    pub fn on_service_resolved(&self, service: ResolvedService) {
        if service.id == self.ctx.local.id {
            return;
        }
        let (remote, created) = self.insert_remote(&service);
        let connect = if created {
            info!("New remote {} at {}:{}", service.id, service.address, service.port);
            true
        } else {
            debug!("Remote {} resolved again", service.id);
            remote.update_service(&service)
        };

        self.ctx.events.emit(EngineEvent::RemoteListChanged);
        if connect {
            self.spawn_connect(remote);
        }
    }

    /// A peer announced its shutdown
    pub fn on_service_lost(&self, id: &str) {
        match self.remote(id) {
            Some(remote) => {
                info!("Remote {} went away", id);
                remote.mark_unavailable();
                self.ctx.events.emit(EngineEvent::RemoteListChanged);
            }
            None => debug!("Unknown remote {} went away", id),
        }
    }

    pub fn spawn_connect(&self, remote: Arc<Remote>) {
        tokio::spawn(async move { remote.connect().await });
    }

    /// Probe every connected remote once
    pub fn ping_remotes(&self) {
        for remote in self.remotes() {
            if remote.status() == RemoteStatus::Connected {
                tokio::spawn(async move { remote.ping().await });
            }
        }
    }

    fn known_remote(&self, id: &str) -> Result<Arc<Remote>> {
        self.remote(id).ok_or_else(|| anyhow!("Unknown remote {}", id))
    }

    pub async fn send_files(&self, remote_id: &str, paths: Vec<PathBuf>) -> Result<u64> {
        self.known_remote(remote_id)?.send_files(paths).await
    }

    pub fn accept_transfer(&self, remote_id: &str, start_time: u64) -> Result<()> {
        self.known_remote(remote_id)?.accept_transfer(start_time)
    }

    pub async fn decline_transfer(&self, remote_id: &str, start_time: u64) -> Result<()> {
        self.known_remote(remote_id)?.decline_transfer(start_time).await
    }

    pub async fn cancel_offer(&self, remote_id: &str, start_time: u64) -> Result<()> {
        self.known_remote(remote_id)?.cancel_offer(start_time).await
    }

    pub async fn stop_transfer(&self, remote_id: &str, start_time: u64) -> Result<()> {
        self.known_remote(remote_id)?.stop_transfer(start_time, false).await
    }

    pub fn clear_finished_transfers(&self) {
        for remote in self.remotes() {
            remote.clear_finished_transfers();
        }
    }
}

async fn discovery_pump(engine: Weak<Engine>, mut events: mpsc::UnboundedReceiver<DiscoveryEvent>) {
    while let Some(event) = events.recv().await {
        let Some(engine) = engine.upgrade() else {
            break;
        };
        match event {
            DiscoveryEvent::Resolved(service) => engine.on_service_resolved(service),
            DiscoveryEvent::Lost(id) => engine.on_service_lost(&id),
        }
    }
    debug!("Discovery event pump finished");
}

async fn ping_loop(engine: Weak<Engine>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match engine.upgrade() {
            Some(engine) => engine.ping_remotes(),
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn engine() -> Result<(Arc<Engine>, EventReceiver, TempDir)> {
        let dir = tempdir()?;
        let settings = Settings {
            download_dir: dir.path().join("downloads"),
            data_dir: dir.path().join("data"),
            identifier: Some("BETA-000002".to_string()),
            port: 0,
            enable_discovery: false,
            ..Settings::default()
        };
        let (engine, events) = Engine::new(settings)?;
        Ok((engine, events, dir))
    }

    fn alpha(port: u16) -> ResolvedService {
        ResolvedService {
            id: "ALPHA-000001".to_string(),
            address: "127.0.0.1".parse().unwrap(),
            port,
            hostname: Some("alpha".to_string()),
        }
    }

    #[tokio::test]
    async fn test_concurrent_resolution_creates_one_remote() -> Result<()> {
        let (engine, _events, _dir) = engine()?;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move { engine.add_remote(alpha(42000)) }));
        }
        let mut remotes = Vec::new();
        for handle in handles {
            remotes.push(handle.await?);
        }

        assert_eq!(engine.remotes().len(), 1);
        assert!(remotes.iter().all(|r| Arc::ptr_eq(r, &remotes[0])));
        Ok(())
    }

    #[tokio::test]
    async fn test_own_record_is_ignored() -> Result<()> {
        let (engine, _events, _dir) = engine()?;
        let mut own = alpha(42000);
        own.id = "BETA-000002".to_string();
        engine.on_service_resolved(own);
        assert!(engine.remotes().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_lost_service_keeps_remote() -> Result<()> {
        let (engine, mut events, _dir) = engine()?;
        engine.add_remote(alpha(42000));
        engine.on_service_lost("ALPHA-000001");

        let remote = engine.remote("ALPHA-000001").unwrap();
        assert!(!remote.info().service_available);

        let mut list_changes = 0;
        while let Ok(event) = events.try_recv() {
            if event == EngineEvent::RemoteListChanged {
                list_changes += 1;
            }
        }
        assert_eq!(list_changes, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_start_and_stop() -> Result<()> {
        let _ = env_logger::builder().is_test(true).try_init();
        let (engine, mut events, _dir) = engine()?;

        engine.start().await?;
        assert!(engine.is_running());
        assert!(engine.port().unwrap_or_default() > 0);
        assert!(engine.start().await.is_err());
        assert!(engine.rescan().is_err());

        engine.stop().await;
        assert!(!engine.is_running());

        let mut running = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::ServerStatusChanged { running: r } = event {
                running.push(r);
            }
        }
        assert_eq!(running, vec![true, false]);
        Ok(())
    }

    #[test]
    fn test_file_avatar_missing_is_none() -> Result<()> {
        let dir = tempdir()?;
        let avatar = FileAvatar::new(dir.path().join("face.png"));
        assert!(avatar.avatar()?.is_none());

        fs::write(dir.path().join("face.png"), b"png")?;
        assert_eq!(avatar.avatar()?, Some(b"png".to_vec()));
        Ok(())
    }
}
