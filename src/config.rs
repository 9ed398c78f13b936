use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_PORT: u16 = 42000;
pub const DEFAULT_GROUP_CODE: &str = "Warpinator";
const APP_DIR_NAME: &str = "warp-node";
const IDENTIFIER_FILE: &str = "identifier";

/// Settings supplied by the embedding application
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Where received files are written
    pub download_dir: PathBuf,
    /// Where the identity certificate, trusted peer certificates and identifier live
    pub data_dir: PathBuf,
    /// Overwrite existing files instead of creating `name (n).ext` copies
    pub allow_overwrite: bool,
    /// Start receiving offered transfers without asking
    pub auto_accept: bool,
    /// Name of the network interface to use, `None` for the best available one
    pub network_interface: Option<String>,
    /// Port for the gRPC server and the certificate responder
    pub port: u16,
    /// Shared code scoping the discovery service type
    pub group_code: String,
    /// Stable identifier of this installation, generated on first run when empty
    pub identifier: Option<String>,
    /// Display name shown to peers, defaults to the user name
    pub display_name: Option<String>,
    /// Picture served to peers asking for our avatar
    pub avatar_path: Option<PathBuf>,
    /// Advertise and browse over mDNS. Without it remotes are only added by hand.
    pub enable_discovery: bool,
    #[serde(skip)]
    pub timings: ProtocolTimings,
}

impl Default for Settings {
    fn default() -> Self {
        let download_dir = dirs::download_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(env::temp_dir)
            .join(APP_DIR_NAME);
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(env::temp_dir)
            .join(APP_DIR_NAME);

        Self {
            download_dir,
            data_dir,
            allow_overwrite: false,
            auto_accept: false,
            network_interface: None,
            port: DEFAULT_PORT,
            group_code: DEFAULT_GROUP_CODE.to_string(),
            identifier: None,
            display_name: None,
            avatar_path: None,
            enable_discovery: true,
            timings: ProtocolTimings::default(),
        }
    }
}

impl Settings {
    /// Build settings from `WARP_*` environment variables, optionally layered
    /// over the JSON file named by `WARP_SETTINGS_FILE`
    pub fn from_env() -> Result<Self> {
        let mut settings = match env::var("WARP_SETTINGS_FILE") {
            Ok(path) => Self::load(Path::new(&path))?,
            Err(_) => Self::default(),
        };

        if let Ok(dir) = env::var("WARP_DOWNLOAD_DIR") {
            settings.download_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = env::var("WARP_DATA_DIR") {
            settings.data_dir = PathBuf::from(dir);
        }
        if let Some(port) = env::var("WARP_PORT").ok().and_then(|p| p.parse().ok()) {
            settings.port = port;
        }
        if let Ok(code) = env::var("WARP_GROUP_CODE") {
            if !code.is_empty() {
                settings.group_code = code;
            }
        }
        if let Ok(iface) = env::var("WARP_INTERFACE") {
            settings.network_interface = Some(iface).filter(|i| !i.is_empty());
        }
        if let Some(flag) = env_flag("WARP_AUTO_ACCEPT") {
            settings.auto_accept = flag;
        }
        if let Some(flag) = env_flag("WARP_ALLOW_OVERWRITE") {
            settings.allow_overwrite = flag;
        }
        if let Ok(name) = env::var("WARP_DISPLAY_NAME") {
            settings.display_name = Some(name).filter(|n| !n.is_empty());
        }
        if let Some(flag) = env_flag("WARP_DISCOVERY") {
            settings.enable_discovery = flag;
        }
        if let Ok(path) = env::var("WARP_AVATAR") {
            settings.avatar_path = Some(PathBuf::from(path));
        }

        Ok(settings)
    }

    /// Load settings from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        let settings = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))?;
        debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Return the configured identifier, or the one persisted in the data
    /// directory, generating and persisting a new one on first run
    pub fn resolve_identifier(&self, hostname: &str) -> Result<String> {
        if let Some(id) = self.identifier.as_ref().filter(|id| !id.is_empty()) {
            return Ok(id.clone());
        }

        let path = self.data_dir.join(IDENTIFIER_FILE);
        if let Ok(existing) = fs::read_to_string(&path) {
            let existing = existing.trim();
            if !existing.is_empty() {
                return Ok(existing.to_string());
            }
            warn!("Identifier file {} is empty, generating a new one", path.display());
        }

        let id = generate_identifier(hostname);
        fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("Failed to create data directory {}", self.data_dir.display()))?;
        fs::write(&path, &id)
            .with_context(|| format!("Failed to persist identifier to {}", path.display()))?;
        info!("Generated identifier {}", id);
        Ok(id)
    }
}

/// Protocol constants. Tests shorten them, nothing else should need to.
#[derive(Debug, Clone)]
pub struct ProtocolTimings {
    pub duplex_attempts: u32,
    pub duplex_retry_delay: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub certificate_attempts: u32,
    pub certificate_backoff: Duration,
    pub certificate_timeout: Duration,
}

impl Default for ProtocolTimings {
    fn default() -> Self {
        Self {
            duplex_attempts: 10,
            duplex_retry_delay: Duration::from_secs(3),
            ping_interval: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(10),
            certificate_attempts: 3,
            certificate_backoff: Duration::from_secs(1),
            certificate_timeout: Duration::from_secs(5),
        }
    }
}

/// `HOSTNAME-XXXXXX` with six random hex digits. The identifier becomes an
/// mDNS instance label, so only the first label of the hostname is used.
pub fn generate_identifier(hostname: &str) -> String {
    let host = hostname.split('.').next().filter(|h| !h.is_empty()).unwrap_or("NODE");
    let suffix = Uuid::new_v4().as_u128() & 0xFF_FFFF;
    format!("{}-{:06X}", host.to_uppercase(), suffix)
}

fn env_flag(name: &str) -> Option<bool> {
    let value = env::var(name).ok()?;
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!("Ignoring unrecognised value '{}' for {}", value, name);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_generate_identifier_format() {
        let id = generate_identifier("alpha");
        let (host, suffix) = id.rsplit_once('-').unwrap();
        assert_eq!(host, "ALPHA");
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));

        assert!(generate_identifier("gamma.lan").starts_with("GAMMA-"));
    }

    #[test]
    fn test_identifier_is_stable_across_runs() -> Result<()> {
        let dir = tempdir()?;
        let settings = Settings {
            data_dir: dir.path().to_path_buf(),
            ..Settings::default()
        };

        let first = settings.resolve_identifier("beta")?;
        let second = settings.resolve_identifier("beta")?;
        assert_eq!(first, second);
        assert!(first.starts_with("BETA-"));
        Ok(())
    }

    #[test]
    fn test_configured_identifier_wins() -> Result<()> {
        let dir = tempdir()?;
        let settings = Settings {
            data_dir: dir.path().to_path_buf(),
            identifier: Some("ALPHA-000001".to_string()),
            ..Settings::default()
        };
        assert_eq!(settings.resolve_identifier("beta")?, "ALPHA-000001");
        assert!(!dir.path().join(IDENTIFIER_FILE).exists());
        Ok(())
    }

    #[test]
    fn test_load_partial_settings_file() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "port": 4300, "auto_accept": true }"#)?;

        let settings = Settings::load(&path)?;
        assert_eq!(settings.port, 4300);
        assert!(settings.auto_accept);
        assert!(!settings.allow_overwrite);
        assert_eq!(settings.group_code, DEFAULT_GROUP_CODE);
        assert_eq!(settings.timings.duplex_attempts, 10);
        Ok(())
    }
}
