use anyhow::{anyhow, Result};
use log::{debug, error, info, trace, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::interface::NetworkInterface;
use crate::config::DEFAULT_GROUP_CODE;

const BROWSE_RESTART_DELAY: Duration = Duration::from_secs(1);
const FLUSH_SETTLE_DELAY: Duration = Duration::from_millis(500);

pub const TXT_HOSTNAME: &str = "hostname";
pub const TXT_TYPE: &str = "type";

/// Service type for a group code. Only peers sharing the code browse the
/// same type and therefore ever see each other.
pub fn service_type(group_code: &str) -> String {
    if group_code.is_empty() || group_code == DEFAULT_GROUP_CODE {
        return "_warpinator._tcp.local.".to_string();
    }
    let digest = Sha256::digest(group_code.as_bytes());
    let tag: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();
    format!("_wp-{}._tcp.local.", tag)
}

/// Whether a published record is the short-lived cache flush or the real one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Flush,
    Real,
}

impl RecordType {
    fn as_str(self) -> &'static str {
        match self {
            RecordType::Flush => "flush",
            RecordType::Real => "real",
        }
    }
}

/// What this node advertises about itself
#[derive(Debug, Clone)]
pub struct LocalService {
    pub id: String,
    pub hostname: String,
    pub address: Ipv4Addr,
    pub port: u16,
}

/// One multicast answer, split by record kind
#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    /// SRV: instance `name` lives on `target:port`
    Service { name: String, target: String, port: u16 },
    /// A: `host` resolves to `address`
    Address { host: String, address: IpAddr },
    /// TXT: `key=value` entries of instance `name`
    Text { name: String, entries: Vec<String> },
}

/// A peer record that has both an address and text metadata
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedService {
    pub id: String,
    pub address: IpAddr,
    pub port: u16,
    pub hostname: Option<String>,
}

/// Raised towards the engine
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    Resolved(ResolvedService),
    Lost(String),
}

#[derive(Debug, Default)]
struct ServiceRecord {
    full_name: String,
    hostname: Option<String>,
    address: Option<IpAddr>,
    port: u16,
    txt: Option<HashMap<String, String>>,
    resolved: bool,
}

impl ServiceRecord {
    fn id(&self) -> &str {
        self.full_name.split('.').next().unwrap_or_default()
    }
}

/// Discovery cache keyed by canonical service name. Answers for the same
/// record may arrive in any order and any number of times.
#[derive(Debug)]
pub struct ServiceCache {
    local_id: String,
    records: HashMap<String, ServiceRecord>,
    hosts: HashMap<String, IpAddr>,
}

fn canonical(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with('.') {
        lower
    } else {
        format!("{}.", lower)
    }
}

impl ServiceCache {
    pub fn new(local_id: &str) -> Self {
        Self {
            local_id: local_id.to_string(),
            records: HashMap::new(),
            hosts: HashMap::new(),
        }
    }

    /// An instance name was seen before any of its records
    pub fn service_seen(&mut self, full_name: &str) {
        self.records
            .entry(canonical(full_name))
            .or_insert_with(|| ServiceRecord {
                full_name: full_name.to_string(),
                ..Default::default()
            });
    }

    /// Apply a batch of answers and return the records that became resolved
    pub fn apply(&mut self, answers: &[Answer]) -> Vec<ResolvedService> {
        for answer in answers {
            if let Answer::Service { name, target, port } = answer {
                let known_address = self.hosts.get(&canonical(target)).copied();
                let record = self.record_mut(name);
                let target = Some(target.clone());
                if record.hostname != target || record.port != *port {
                    record.resolved = false;
                }
                record.hostname = target;
                record.port = *port;
                if let Some(addr) = known_address {
                    if record.address != Some(addr) {
                        record.resolved = false;
                    }
                    record.address = Some(addr);
                }
            }
        }

        for answer in answers {
            if let Answer::Address { host, address } = answer {
                let host = canonical(host);
                self.hosts.insert(host.clone(), *address);
                for record in self.records.values_mut() {
                    let matches = record.hostname.as_deref().map(canonical).as_deref() == Some(host.as_str());
                    if matches && record.address != Some(*address) {
                        record.address = Some(*address);
                        record.resolved = false;
                    }
                }
            }
        }

        for answer in answers {
            if let Answer::Text { name, entries } = answer {
                let txt = parse_txt(entries);
                let record = self.record_mut(name);
                if record.txt.as_ref() != Some(&txt) {
                    record.txt = Some(txt);
                    record.resolved = false;
                }
            }
        }

        let mut resolved = Vec::new();
        for record in self.records.values_mut() {
            if record.resolved {
                continue;
            }
            let (Some(address), Some(txt)) = (record.address, record.txt.as_ref()) else {
                continue;
            };

            let id = record.id().to_string();
            if id == self.local_id {
                trace!("Ignoring our own advertisement");
                record.resolved = true;
                continue;
            }
            if txt.get(TXT_TYPE).map(String::as_str) == Some(RecordType::Flush.as_str()) {
                trace!("Ignoring flush registration of {}", id);
                continue;
            }

            record.resolved = true;
            resolved.push(ResolvedService {
                id,
                address,
                port: record.port,
                hostname: txt.get(TXT_HOSTNAME).cloned(),
            });
        }
        resolved
    }

    /// The instance said goodbye. Returns its identifier if it was known.
    pub fn shutdown(&mut self, full_name: &str) -> Option<String> {
        self.records
            .remove(&canonical(full_name))
            .map(|record| record.id().to_string())
    }

    fn record_mut(&mut self, name: &str) -> &mut ServiceRecord {
        self.records
            .entry(canonical(name))
            .or_insert_with(|| ServiceRecord {
                full_name: name.to_string(),
                ..Default::default()
            })
    }
}

fn parse_txt(entries: &[String]) -> HashMap<String, String> {
    entries
        .iter()
        .filter_map(|entry| {
            let (key, value) = entry.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Split a resolved mDNS service back into its SRV, A and TXT answers.
/// When an interface is selected only addresses on its subnet are kept.
fn answers_from_service_info(info: &ServiceInfo, interface: Option<&NetworkInterface>) -> Vec<Answer> {
    let name = info.get_fullname().to_string();
    let host = info.get_hostname().to_string();

    let mut answers = vec![Answer::Service {
        name: name.clone(),
        target: host.clone(),
        port: info.get_port(),
    }];

    let address = info
        .get_addresses()
        .iter()
        .map(|a| IpAddr::from(*a))
        .filter(|a| a.is_ipv4())
        .find(|a| interface.map_or(true, |iface| iface.contains(a)));
    if let Some(address) = address {
        answers.push(Answer::Address { host, address });
    }

    let entries = info
        .get_properties()
        .iter()
        .filter_map(|prop| {
            let value = String::from_utf8(prop.val()?.to_vec()).ok()?;
            Some(format!("{}={}", prop.key(), value))
        })
        .collect();
    answers.push(Answer::Text { name, entries });

    answers
}

/// Advertises this node and turns mDNS answers into discovery events
pub struct DiscoveryEngine {
    mdns: ServiceDaemon,
    service_type: String,
    local: LocalService,
    interface: Option<NetworkInterface>,
    cache: Arc<Mutex<ServiceCache>>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    registered: Mutex<Option<String>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    generation: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
}

impl DiscoveryEngine {
    pub fn new(
        group_code: &str,
        local: LocalService,
        interface: Option<NetworkInterface>,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Result<Arc<Self>> {
        let mdns = ServiceDaemon::new()?;
        let cache = Arc::new(Mutex::new(ServiceCache::new(&local.id)));

        Ok(Arc::new(Self {
            mdns,
            service_type: service_type(group_code),
            local,
            interface,
            cache,
            events,
            registered: Mutex::new(None),
            listener: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
        }))
    }

    /// Start listening, then publish a flush record followed by the real one
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!(
            "Starting discovery of {} as {} on {}:{}",
            self.service_type, self.local.id, self.local.address, self.local.port
        );

        self.query()?;
        self.advertise(RecordType::Flush)?;
        sleep(FLUSH_SETTLE_DELAY).await;
        self.advertise(RecordType::Real)?;
        Ok(())
    }

    /// Publish our service, host, address and text records
    pub fn advertise(&self, record_type: RecordType) -> Result<()> {
        let mut properties = HashMap::new();
        properties.insert(TXT_HOSTNAME.to_string(), self.local.hostname.clone());
        properties.insert(TXT_TYPE.to_string(), record_type.as_str().to_string());

        let host_name = format!("{}.local.", self.local.id);
        let service_info = ServiceInfo::new(
            &self.service_type,
            &self.local.id,
            &host_name,
            &self.local.address.to_string(),
            self.local.port,
            properties,
        )?;

        let fullname = service_info.get_fullname().to_string();
        self.mdns.register(service_info)?;
        debug!("Advertised {} record {}", record_type.as_str(), fullname);
        *lock(&self.registered) = Some(fullname);
        Ok(())
    }

    /// Announce the real record again
    pub fn reannounce(&self) -> Result<()> {
        self.advertise(RecordType::Real)
    }

    /// Send a fresh query. Replaces the previous listener, since the daemon
    /// hands out a new receiver per browse.
    pub fn query(self: &Arc<Self>) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(anyhow!("Discovery is not running"));
        }
        let receiver = self.mdns.browse(&self.service_type)?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Browsing for {} (generation {})", self.service_type, generation);

        let this = self.clone();
        let handle = tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                this.handle_event(event);
            }
            // The channel closes when we browse again or the daemon stops
            if this.running.load(Ordering::SeqCst) && this.generation.load(Ordering::SeqCst) == generation {
                warn!("mDNS browse channel closed unexpectedly, restarting");
                sleep(BROWSE_RESTART_DELAY).await;
                if let Err(e) = this.query() {
                    error!("Failed to restart mDNS browse: {}", e);
                }
            }
        });

        if let Some(old) = lock(&self.listener).replace(handle) {
            old.abort();
        }
        Ok(())
    }

    fn handle_event(&self, event: ServiceEvent) {
        match event {
            ServiceEvent::ServiceFound(_, fullname) => {
                trace!("Service found: {}", fullname);
                lock(&self.cache).service_seen(&fullname);
            }
            ServiceEvent::ServiceResolved(info) => {
                let answers = answers_from_service_info(&info, self.interface.as_ref());
                let resolved = lock(&self.cache).apply(&answers);
                for service in resolved {
                    debug!("Resolved {} at {}:{}", service.id, service.address, service.port);
                    let _ = self.events.send(DiscoveryEvent::Resolved(service));
                }
            }
            ServiceEvent::ServiceRemoved(_, fullname) => {
                debug!("Service lost: {}", fullname);
                if let Some(id) = lock(&self.cache).shutdown(&fullname) {
                    let _ = self.events.send(DiscoveryEvent::Lost(id));
                }
            }
            _ => {}
        }
    }

    /// Unadvertise and leave the multicast group
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(fullname) = lock(&self.registered).take() {
            if let Err(e) = self.mdns.unregister(&fullname) {
                warn!("Failed to unregister service: {}", e);
            }
        }
        if let Err(e) = self.mdns.stop_browse(&self.service_type) {
            debug!("Failed to stop browsing: {}", e);
        }
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
        if let Err(e) = self.mdns.shutdown() {
            warn!("Failed to shut down mDNS daemon: {}", e);
        }
        info!("Discovery stopped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL: &str = "BETA-000002";
    const NAME: &str = "ALPHA-000001._warpinator._tcp.local.";

    fn srv(port: u16) -> Answer {
        Answer::Service {
            name: NAME.to_string(),
            target: "ALPHA-000001.local.".to_string(),
            port,
        }
    }

    fn a(addr: [u8; 4]) -> Answer {
        Answer::Address {
            host: "ALPHA-000001.local.".to_string(),
            address: IpAddr::from(addr),
        }
    }

    fn txt(kind: &str) -> Answer {
        Answer::Text {
            name: NAME.to_string(),
            entries: vec!["hostname=alpha".to_string(), format!("type={}", kind)],
        }
    }

    #[test]
    fn test_service_type_depends_on_group_code() {
        assert_eq!(service_type(DEFAULT_GROUP_CODE), "_warpinator._tcp.local.");
        let custom = service_type("office");
        assert!(custom.starts_with("_wp-") && custom.ends_with("._tcp.local."));
        assert_eq!(custom, service_type("office"));
        assert_ne!(custom, service_type("home"));
        // Service names are limited to 15 characters
        let label = custom.trim_start_matches('_').split('.').next().unwrap();
        assert!(label.len() <= 15);
    }

    #[test]
    fn test_resolves_once_address_and_text_are_known() {
        let mut cache = ServiceCache::new(LOCAL);
        assert!(cache.apply(&[srv(42000)]).is_empty());
        assert!(cache.apply(&[a([192, 168, 1, 10])]).is_empty());

        let resolved = cache.apply(&[txt("real")]);
        assert_eq!(
            resolved,
            vec![ResolvedService {
                id: "ALPHA-000001".to_string(),
                address: IpAddr::from([192, 168, 1, 10]),
                port: 42000,
                hostname: Some("alpha".to_string()),
            }]
        );
    }

    #[test]
    fn test_address_seen_before_service_record() {
        let mut cache = ServiceCache::new(LOCAL);
        assert!(cache.apply(&[a([10, 0, 0, 5])]).is_empty());
        let resolved = cache.apply(&[txt("real"), srv(42000)]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].address, IpAddr::from([10, 0, 0, 5]));
    }

    #[test]
    fn test_repeated_answers_are_idempotent() {
        let mut cache = ServiceCache::new(LOCAL);
        let batch = [srv(42000), a([192, 168, 1, 10]), txt("real")];
        assert_eq!(cache.apply(&batch).len(), 1);
        assert!(cache.apply(&batch).is_empty());
        assert!(cache.apply(&batch).is_empty());
    }

    #[test]
    fn test_changed_record_resolves_again() {
        let mut cache = ServiceCache::new(LOCAL);
        cache.apply(&[srv(42000), a([192, 168, 1, 10]), txt("real")]);

        let resolved = cache.apply(&[a([192, 168, 1, 11])]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].address, IpAddr::from([192, 168, 1, 11]));
    }

    #[test]
    fn test_own_record_is_ignored() {
        let mut cache = ServiceCache::new("ALPHA-000001");
        assert!(cache.apply(&[srv(42000), a([192, 168, 1, 10]), txt("real")]).is_empty());
        assert!(cache.apply(&[txt("real")]).is_empty());
    }

    #[test]
    fn test_flush_record_is_never_promoted() {
        let mut cache = ServiceCache::new(LOCAL);
        assert!(cache.apply(&[srv(42000), a([192, 168, 1, 10]), txt("flush")]).is_empty());
        assert!(cache.apply(&[txt("flush")]).is_empty());
        // The real registration that follows is promoted
        assert_eq!(cache.apply(&[txt("real")]).len(), 1);
    }

    #[test]
    fn test_shutdown_returns_identifier() {
        let mut cache = ServiceCache::new(LOCAL);
        cache.apply(&[srv(42000), a([192, 168, 1, 10]), txt("real")]);
        assert_eq!(cache.shutdown(NAME), Some("ALPHA-000001".to_string()));
        assert_eq!(cache.shutdown(NAME), None);
        assert_eq!(cache.shutdown("ghost._warpinator._tcp.local."), None);
    }

    #[test]
    fn test_malformed_text_entries_are_skipped() {
        let parsed = parse_txt(&["hostname=alpha".to_string(), "garbage".to_string(), "k=v=w".to_string()]);
        assert_eq!(parsed.get("hostname").map(String::as_str), Some("alpha"));
        assert_eq!(parsed.get("k").map(String::as_str), Some("v=w"));
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn test_concurrent_resolution_yields_one_promotion() {
        let cache = Arc::new(Mutex::new(ServiceCache::new(LOCAL)));
        let batch = vec![srv(42000), a([192, 168, 1, 10]), txt("real")];

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let batch = batch.clone();
                std::thread::spawn(move || lock(&cache).apply(&batch).len())
            })
            .collect();

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 1);
    }
}
