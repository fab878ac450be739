use std::path::Path;

use anyhow::{anyhow, Context, Result};
use droidmitm_bridge::{BridgeConfig, ClientKind};
use droidmitm_certs::{DownloadOptions, DEFAULT_CERT_FILE, DEFAULT_CERT_URL_PATH};
use droidmitm_core::{STAGING_DIR, SYSTEM_CA_STORE, USER_CA_STORE};
use serde::Deserialize;
use tracing::debug;

pub const DEFAULT_CONFIG_FILE: &str = "droidmitm.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    pub bridge: Option<BridgeSection>,
    pub cert: Option<CertSection>,
    pub stores: Option<StoreSection>,
    pub mcp: Option<McpSection>,
    pub console: Option<ConsoleSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSection {
    pub client: Option<String>,
    pub adb_binary: Option<String>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CertSection {
    pub default_file: Option<String>,
    pub url_path: Option<String>,
    pub download_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    pub user: Option<String>,
    pub system: Option<String>,
    pub staging: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct McpSection {
    pub tool_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleSection {
    pub color: Option<bool>,
}

/// Remote directories the certificate commands work with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub user: String,
    pub system: String,
    pub staging: String,
}

impl Default for StorePaths {
    fn default() -> Self {
        Self {
            user: USER_CA_STORE.to_string(),
            system: SYSTEM_CA_STORE.to_string(),
            staging: STAGING_DIR.to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let cfg = toml::from_str::<Self>(&raw).context("failed to parse TOML config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// A missing file is not an error: every setting has a default.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    fn validate(&self) -> Result<()> {
        self.bridge_client_kind()?;
        if let Some(bridge) = &self.bridge {
            if let Some(binary) = &bridge.adb_binary {
                if binary.trim().is_empty() {
                    return Err(anyhow!("bridge.adb_binary must not be empty when set"));
                }
            }
            if bridge.server_port == Some(0) {
                return Err(anyhow!("bridge.server_port must be greater than 0"));
            }
            if bridge.timeout_seconds == Some(0) {
                return Err(anyhow!("bridge.timeout_seconds must be greater than 0"));
            }
        }
        if let Some(cert) = &self.cert {
            if cert.download_timeout_seconds == Some(0) {
                return Err(anyhow!("cert.download_timeout_seconds must be greater than 0"));
            }
        }
        if let Some(stores) = &self.stores {
            for (key, value) in [
                ("stores.user", &stores.user),
                ("stores.system", &stores.system),
                ("stores.staging", &stores.staging),
            ] {
                if let Some(path) = value {
                    if !path.starts_with('/') {
                        return Err(anyhow!("{key} must be an absolute device path"));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn bridge_client_kind(&self) -> Result<ClientKind> {
        let raw = self
            .bridge
            .as_ref()
            .and_then(|bridge| bridge.client.as_deref())
            .unwrap_or("auto");
        ClientKind::parse(raw).context("bridge.client must be one of: auto, server, binary")
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        let defaults = BridgeConfig::default();
        let Some(bridge) = &self.bridge else {
            return defaults;
        };
        BridgeConfig {
            adb_binary: bridge.adb_binary.clone().unwrap_or(defaults.adb_binary),
            server_host: bridge.server_host.clone().unwrap_or(defaults.server_host),
            server_port: bridge.server_port.unwrap_or(defaults.server_port),
            timeout_secs: bridge.timeout_seconds.unwrap_or(defaults.timeout_secs),
        }
    }

    pub fn cert_default_file(&self) -> String {
        self.cert
            .as_ref()
            .and_then(|cert| cert.default_file.clone())
            .unwrap_or_else(|| DEFAULT_CERT_FILE.to_string())
    }

    pub fn download_options(&self) -> DownloadOptions {
        let defaults = DownloadOptions::default();
        DownloadOptions {
            url_path: self
                .cert
                .as_ref()
                .and_then(|cert| cert.url_path.clone())
                .unwrap_or_else(|| DEFAULT_CERT_URL_PATH.to_string()),
            timeout_secs: self
                .cert
                .as_ref()
                .and_then(|cert| cert.download_timeout_seconds)
                .unwrap_or(defaults.timeout_secs),
        }
    }

    pub fn store_paths(&self) -> StorePaths {
        let defaults = StorePaths::default();
        let Some(stores) = &self.stores else {
            return defaults;
        };
        StorePaths {
            user: stores.user.clone().unwrap_or(defaults.user),
            system: stores.system.clone().unwrap_or(defaults.system),
            staging: stores.staging.clone().unwrap_or(defaults.staging),
        }
    }

    pub fn mcp_tool_timeout_seconds(&self) -> u64 {
        self.mcp
            .as_ref()
            .and_then(|mcp| mcp.tool_timeout_seconds)
            .unwrap_or(120)
    }

    pub fn color_enabled(&self) -> bool {
        self.console
            .as_ref()
            .and_then(|console| console.color)
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let raw = r#"
        [bridge]
        client = "binary"
        adb_binary = "/opt/platform-tools/adb"
        server_port = 5038
        timeout_seconds = 15

        [cert]
        default_file = "burp.der"
        url_path = "/cert.der"
        download_timeout_seconds = 5

        [stores]
        user = "/data/misc/user/10/cacerts-added"

        [mcp]
        tool_timeout_seconds = 30

        [console]
        color = false
        "#;
        let cfg = toml::from_str::<AppConfig>(raw).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.bridge_client_kind().unwrap(), ClientKind::Binary);
        let bridge = cfg.bridge_config();
        assert_eq!(bridge.adb_binary, "/opt/platform-tools/adb");
        assert_eq!(bridge.server_host, "127.0.0.1");
        assert_eq!(bridge.server_port, 5038);
        assert_eq!(cfg.cert_default_file(), "burp.der");
        assert_eq!(cfg.download_options().timeout_secs, 5);
        assert_eq!(cfg.download_options().url_path, "/cert.der");
        let stores = cfg.store_paths();
        assert_eq!(stores.user, "/data/misc/user/10/cacerts-added");
        assert_eq!(stores.system, SYSTEM_CA_STORE);
        assert_eq!(cfg.mcp_tool_timeout_seconds(), 30);
        assert!(!cfg.color_enabled());
    }

    #[test]
    fn defaults_apply_without_sections() {
        let cfg = toml::from_str::<AppConfig>("").unwrap();
        assert_eq!(cfg.bridge_client_kind().unwrap(), ClientKind::Auto);
        assert_eq!(cfg.bridge_config().adb_binary, "adb");
        assert_eq!(cfg.bridge_config().server_port, 5037);
        assert_eq!(cfg.cert_default_file(), DEFAULT_CERT_FILE);
        assert_eq!(cfg.download_options().timeout_secs, 10);
        assert_eq!(cfg.store_paths(), StorePaths::default());
        assert!(cfg.color_enabled());
    }

    #[test]
    fn rejects_unknown_client_kind() {
        let cfg = toml::from_str::<AppConfig>("[bridge]\nclient = \"usb\"\n").unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:#}").contains("bridge.client must be one of"));
    }

    #[test]
    fn rejects_relative_store_path() {
        let cfg = toml::from_str::<AppConfig>("[stores]\nsystem = \"etc/cacerts\"\n").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AppConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert!(cfg.bridge.is_none());
    }

    #[test]
    fn loads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "[mcp]\ntool_timeout_seconds = 9\n").unwrap();
        let cfg = AppConfig::load_or_default(&path).unwrap();
        assert_eq!(cfg.mcp_tool_timeout_seconds(), 9);
    }
}
