use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const USER_CA_STORE: &str = "/data/misc/user/0/cacerts-added";
pub const SYSTEM_CA_STORE: &str = "/system/etc/security/cacerts";
pub const STAGING_DIR: &str = "/data/local/tmp";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceState {
    Device,
    Offline,
    Unauthorized,
    Other(String),
}

impl DeviceState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Device => "device",
            Self::Offline => "offline",
            Self::Unauthorized => "unauthorized",
            Self::Other(raw) => raw.as_str(),
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "device" => Self::Device,
            "offline" => Self::Offline,
            "unauthorized" => Self::Unauthorized,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceProps {
    pub brand: String,
    pub model: String,
    pub sdk: String,
    pub release: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub serial: String,
    pub state: DeviceState,
    pub props: DeviceProps,
}

impl Device {
    pub fn new(serial: impl Into<String>, state: DeviceState) -> Self {
        Self {
            serial: serial.into(),
            state,
            props: DeviceProps::default(),
        }
    }

    /// Only devices in the `device` state accept shell and sync requests.
    pub fn is_ready(&self) -> bool {
        self.state == DeviceState::Device
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl HostOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("adb binary '{0}' is not installed or not in your PATH")]
    BridgeBinaryMissing(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("certificate parse error: {0}")]
    CertificateParse(String),
    #[error("remote command failed ({command}): {detail}")]
    RemoteCommand { command: String, detail: String },
    #[error("device selection aborted: {0}")]
    SelectionAborted(String),
}

impl BridgeError {
    pub fn no_device_connected() -> Self {
        Self::DeviceUnavailable("no devices connected".to_string())
    }

    pub fn remote(command: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::RemoteCommand {
            command: command.into(),
            detail: detail.into(),
        }
    }
}

/// Finds the first `BridgeError` anywhere in an anyhow context chain.
pub fn bridge_error(err: &anyhow::Error) -> Option<&BridgeError> {
    err.chain().find_map(|cause| cause.downcast_ref::<BridgeError>())
}

pub fn is_bridge_binary_missing(err: &anyhow::Error) -> bool {
    matches!(bridge_error(err), Some(BridgeError::BridgeBinaryMissing(_)))
}

#[async_trait]
pub trait DeviceClient: Send + Sync {
    fn name(&self) -> &'static str;
    async fn list_devices(&self) -> Result<Vec<Device>>;
    async fn shell(&self, serial: &str, command: &str) -> Result<String>;
    async fn push(&self, serial: &str, local: &Path, remote: &str) -> Result<()>;
    /// Attaches a network device (`host:port`); returns the daemon's reply.
    async fn connect(&self, target: &str) -> Result<String>;
}

/// Wraps a command in `su -c '<command>'` for execution as root.
pub fn su(command: &str) -> String {
    format!("su -c {}", shell_words::quote(command))
}

/// Parses the `serial<TAB>state` listing shared by `adb devices` and the
/// `host:devices` service. Header and daemon chatter lines are skipped.
pub fn parse_device_list(text: &str) -> Vec<Device> {
    text.lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty()
                || trimmed.starts_with("List of devices")
                || trimmed.starts_with('*')
            {
                return None;
            }
            let mut parts = trimmed.split_whitespace();
            let serial = parts.next()?;
            let state = parts.next()?;
            Some(Device::new(serial, DeviceState::parse(state)))
        })
        .collect()
}

async fn getprop(client: &dyn DeviceClient, serial: &str, key: &str) -> Result<String> {
    client
        .shell(serial, &format!("getprop {key}"))
        .await
        .map(|value| value.trim().to_string())
        .with_context(|| format!("failed to read {key} from {serial}"))
}

/// Fills `Device::props` from `getprop` for every ready device.
pub async fn describe_devices(client: &dyn DeviceClient, devices: &mut [Device]) -> Result<()> {
    for device in devices.iter_mut().filter(|d| d.is_ready()) {
        let serial = device.serial.as_str();
        let props = DeviceProps {
            brand: getprop(client, serial, "ro.product.brand").await?,
            model: getprop(client, serial, "ro.product.model").await?,
            sdk: getprop(client, serial, "ro.build.version.sdk").await?,
            release: getprop(client, serial, "ro.build.version.release").await?,
        };
        device.props = props;
        debug!(serial = %device.serial, model = %device.props.model, "described device");
    }
    Ok(())
}

/// Lists devices through `client` and describes the ready ones.
pub async fn enumerate_devices(client: &dyn DeviceClient) -> Result<Vec<Device>> {
    let mut devices = client.list_devices().await?;
    describe_devices(client, &mut devices).await?;
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct PropsClient {
        props: HashMap<&'static str, &'static str>,
    }

    #[async_trait]
    impl DeviceClient for PropsClient {
        fn name(&self) -> &'static str {
            "props"
        }

        async fn list_devices(&self) -> Result<Vec<Device>> {
            Ok(vec![
                Device::new("emulator-5554", DeviceState::Device),
                Device::new("R58M123", DeviceState::Unauthorized),
            ])
        }

        async fn shell(&self, _serial: &str, command: &str) -> Result<String> {
            let key = command.trim_start_matches("getprop ");
            Ok(format!("{}\n", self.props.get(key).copied().unwrap_or_default()))
        }

        async fn push(&self, _serial: &str, _local: &Path, _remote: &str) -> Result<()> {
            Ok(())
        }

        async fn connect(&self, target: &str) -> Result<String> {
            Ok(format!("connected to {target}"))
        }
    }

    #[test]
    fn parses_adb_devices_output() {
        let raw = "* daemon not running; starting now at tcp:5037\n\
                   * daemon started successfully\n\
                   List of devices attached\n\
                   emulator-5554\tdevice\n\
                   192.168.1.20:5555\toffline\n\
                   R58M123\tunauthorized\n\n";
        let devices = parse_device_list(raw);
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].serial, "emulator-5554");
        assert!(devices[0].is_ready());
        assert_eq!(devices[1].state, DeviceState::Offline);
        assert_eq!(devices[2].state.as_str(), "unauthorized");
    }

    #[test]
    fn su_quotes_the_whole_command() {
        assert_eq!(
            su("settings get global http_proxy"),
            "su -c 'settings get global http_proxy'"
        );
        assert_eq!(su("id"), "su -c id");
    }

    #[test]
    fn finds_bridge_errors_through_context() {
        let err = anyhow::Error::new(BridgeError::BridgeBinaryMissing("adb".to_string()))
            .context("failed to list devices");
        assert!(is_bridge_binary_missing(&err));

        let other = anyhow::Error::new(BridgeError::no_device_connected());
        assert!(!is_bridge_binary_missing(&other));
        assert!(matches!(
            bridge_error(&other),
            Some(BridgeError::DeviceUnavailable(_))
        ));
    }

    #[test]
    fn combined_output_joins_streams() {
        let out = HostOutput {
            stdout: "connected to 10.0.0.2:5555".to_string(),
            stderr: "warning".to_string(),
            exit_code: 0,
        };
        assert!(out.success());
        assert_eq!(out.combined(), "connected to 10.0.0.2:5555\nwarning");
    }

    #[tokio::test]
    async fn enumerate_describes_only_ready_devices() {
        let client = PropsClient {
            props: HashMap::from([
                ("ro.product.brand", "google"),
                ("ro.product.model", "Pixel 6"),
                ("ro.build.version.sdk", "33"),
                ("ro.build.version.release", "13"),
            ]),
        };
        let devices = enumerate_devices(&client).await.unwrap();
        assert_eq!(devices[0].props.brand, "google");
        assert_eq!(devices[0].props.model, "Pixel 6");
        assert_eq!(devices[0].props.sdk, "33");
        assert_eq!(devices[1].props, DeviceProps::default());
    }
}
