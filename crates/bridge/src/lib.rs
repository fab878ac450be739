use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use droidmitm_core::{parse_device_list, BridgeError, Device, DeviceClient, HostOutput};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::Command;
use thiserror::Error;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

const SYNC_CHUNK_SIZE: usize = 64 * 1024;
const PUSH_FILE_MODE: u32 = 0o100644;

/// Marks a server failure that happened before the request reached the
/// device, so retrying on another client cannot run it twice.
#[derive(Debug, Error)]
#[error("request was not sent to the adb server")]
pub struct RequestNotSent;

pub fn is_request_not_sent(err: &anyhow::Error) -> bool {
    err.is::<RequestNotSent>()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Auto,
    Server,
    Binary,
}

impl ClientKind {
    pub fn parse(value: &str) -> Result<Self> {
        Self::from_str(value)
    }
}

impl FromStr for ClientKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "auto" => Ok(Self::Auto),
            "server" => Ok(Self::Server),
            "binary" => Ok(Self::Binary),
            _ => Err(anyhow!("unsupported bridge client: {value}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub adb_binary: String,
    pub server_host: String,
    pub server_port: u16,
    pub timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            adb_binary: "adb".to_string(),
            server_host: "127.0.0.1".to_string(),
            server_port: 5037,
            timeout_secs: 30,
        }
    }
}

pub fn build_client(kind: ClientKind, config: BridgeConfig) -> Box<dyn DeviceClient> {
    match kind {
        ClientKind::Auto => Box::new(FallbackClient::new(
            Box::new(AdbServerClient::new(&config)),
            Box::new(AdbBinaryClient::new(&config)),
        )),
        ClientKind::Server => Box::new(AdbServerClient::new(&config)),
        ClientKind::Binary => Box::new(AdbBinaryClient::new(&config)),
    }
}

/// Resolves the bridge binary on `PATH` (or checks an explicit path).
pub fn locate_binary(binary: &str) -> Result<PathBuf> {
    which::which(binary).map_err(|_| BridgeError::BridgeBinaryMissing(binary.to_string()).into())
}

/// Runs the local bridge binary with `args`, not scoped to any device.
pub async fn run_host_command(binary: &str, args: &[String], timeout_secs: u64) -> Result<HostOutput> {
    let path = locate_binary(binary)?;
    debug!("running {} {}", path.display(), shell_words::join(args));
    run_process(&path, args, timeout_secs).await
}

async fn run_process(binary: &Path, args: &[String], timeout_secs: u64) -> Result<HostOutput> {
    let mut command = Command::new(binary);
    command.args(args).kill_on_drop(true);

    let output = timeout(Duration::from_secs(timeout_secs.max(1)), command.output()).await;
    match output {
        Ok(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(BridgeError::BridgeBinaryMissing(binary.display().to_string()).into())
        }
        Ok(result) => {
            let output =
                result.with_context(|| format!("failed to launch process '{}'", binary.display()))?;
            Ok(HostOutput {
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                exit_code: output.status.code().unwrap_or(-1),
            })
        }
        Err(_) => Ok(HostOutput {
            stdout: String::new(),
            stderr: "process timed out".to_string(),
            exit_code: 124,
        }),
    }
}

/// Drives the `adb` executable as a subprocess.
pub struct AdbBinaryClient {
    binary: String,
    timeout_secs: u64,
}

impl AdbBinaryClient {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            binary: config.adb_binary.clone(),
            timeout_secs: config.timeout_secs,
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<HostOutput> {
        run_host_command(&self.binary, &args, self.timeout_secs).await
    }
}

#[async_trait]
impl DeviceClient for AdbBinaryClient {
    fn name(&self) -> &'static str {
        "adb-binary"
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        let output = self.run(vec!["devices".to_string()]).await?;
        if !output.success() {
            return Err(BridgeError::remote("adb devices", output.stderr.trim()).into());
        }
        Ok(parse_device_list(&output.stdout))
    }

    async fn shell(&self, serial: &str, command: &str) -> Result<String> {
        let args = vec![
            "-s".to_string(),
            serial.to_string(),
            "shell".to_string(),
            command.to_string(),
        ];
        let output = self.run(args).await?;
        let stderr = output.stderr.trim();
        // adb's own failures (`error: device offline`, timeouts) never reach
        // the device; device-side stderr is returned as text.
        if !output.success()
            && output.stdout.trim().is_empty()
            && (output.exit_code == 124 || stderr.starts_with("error:"))
        {
            return Err(BridgeError::remote(command, stderr).into());
        }
        if !stderr.is_empty() {
            debug!(serial, command, stderr = %stderr, "shell wrote to stderr");
        }
        Ok(output.combined())
    }

    async fn push(&self, serial: &str, local: &Path, remote: &str) -> Result<()> {
        let args = vec![
            "-s".to_string(),
            serial.to_string(),
            "push".to_string(),
            local.display().to_string(),
            remote.to_string(),
        ];
        let output = self.run(args).await?;
        if !output.success() {
            return Err(BridgeError::remote(
                format!("adb push {}", local.display()),
                output.combined().trim().to_string(),
            )
            .into());
        }
        Ok(())
    }

    async fn connect(&self, target: &str) -> Result<String> {
        let output = self
            .run(vec!["connect".to_string(), target.to_string()])
            .await?;
        Ok(output.combined().trim().to_string())
    }
}

/// Talks to the adb daemon's smart-socket protocol directly.
pub struct AdbServerClient {
    addr: String,
    timeout: Duration,
}

impl AdbServerClient {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            addr: format!("{}:{}", config.server_host, config.server_port),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }
    }

    async fn open(&self) -> Result<TcpStream> {
        let stream = match timeout(self.timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("failed to connect to adb server {}", self.addr))
                    .context(RequestNotSent))
            }
            Err(_) => {
                return Err(anyhow!("timed out connecting to adb server {}", self.addr)
                    .context(RequestNotSent))
            }
        };
        Ok(stream)
    }

    /// Opens a connection already switched to `serial`'s transport.
    async fn transport(&self, serial: &str) -> Result<TcpStream> {
        let mut stream = self.open().await?;
        let switched = async {
            send_request(&mut stream, &format!("host:transport:{serial}")).await?;
            read_status(&mut stream).await
        }
        .await;
        switched
            .with_context(|| format!("failed to switch transport to {serial}"))
            .map_err(|err| err.context(RequestNotSent))?;
        Ok(stream)
    }

    async fn with_timeout<T>(
        &self,
        what: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        timeout(self.timeout, fut)
            .await
            .map_err(|_| anyhow!("adb server request '{what}' timed out"))?
    }
}

#[async_trait]
impl DeviceClient for AdbServerClient {
    fn name(&self) -> &'static str {
        "adb-server"
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        self.with_timeout("host:devices", async {
            let mut stream = self.open().await?;
            send_request(&mut stream, "host:devices").await?;
            read_status(&mut stream).await?;
            let payload = read_length_prefixed(&mut stream).await?;
            Ok(parse_device_list(&payload))
        })
        .await
    }

    async fn shell(&self, serial: &str, command: &str) -> Result<String> {
        self.with_timeout("shell", async {
            let mut stream = self.transport(serial).await?;
            send_request(&mut stream, &format!("shell:{command}")).await?;
            read_status(&mut stream)
                .await
                .map_err(|err| BridgeError::remote(command, format!("{err:#}")))?;
            let mut raw = Vec::new();
            stream
                .read_to_end(&mut raw)
                .await
                .context("failed to read shell output")?;
            Ok(String::from_utf8_lossy(&raw).replace("\r\n", "\n"))
        })
        .await
    }

    async fn push(&self, serial: &str, local: &Path, remote: &str) -> Result<()> {
        let contents = tokio::fs::read(local)
            .await
            .with_context(|| format!("failed to read {}", local.display()))?;
        self.with_timeout("sync:SEND", async {
            let mut stream = self.transport(serial).await?;
            send_request(&mut stream, "sync:").await?;
            read_status(&mut stream).await?;
            sync_send(&mut stream, remote, &contents).await?;
            Ok(())
        })
        .await
        .with_context(|| format!("failed to push {} to {remote}", local.display()))
    }

    async fn connect(&self, target: &str) -> Result<String> {
        self.with_timeout("host:connect", async {
            let mut stream = self.open().await?;
            send_request(&mut stream, &format!("host:connect:{target}")).await?;
            read_status(&mut stream).await?;
            read_length_prefixed(&mut stream).await
        })
        .await
    }
}

async fn send_request(stream: &mut TcpStream, request: &str) -> Result<()> {
    let header = format!("{:04x}", request.len());
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_status(stream: &mut TcpStream) -> Result<()> {
    let mut status = [0_u8; 4];
    stream
        .read_exact(&mut status)
        .await
        .context("failed to read adb status")?;
    match &status {
        b"OKAY" => Ok(()),
        b"FAIL" => {
            let message = read_length_prefixed(stream).await.unwrap_or_default();
            Err(anyhow!("adb server FAIL: {message}"))
        }
        other => Err(anyhow!(
            "unexpected adb status: {}",
            String::from_utf8_lossy(other)
        )),
    }
}

async fn read_length_prefixed(stream: &mut TcpStream) -> Result<String> {
    let mut len_buf = [0_u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = usize::from_str_radix(&String::from_utf8_lossy(&len_buf), 16)
        .context("invalid adb length prefix")?;
    let mut payload = vec![0_u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(String::from_utf8_lossy(&payload).to_string())
}

async fn write_sync_packet(stream: &mut TcpStream, id: &[u8; 4], body: &[u8]) -> Result<()> {
    stream.write_all(id).await?;
    stream.write_all(&(body.len() as u32).to_le_bytes()).await?;
    stream.write_all(body).await?;
    Ok(())
}

async fn sync_send(stream: &mut TcpStream, remote: &str, contents: &[u8]) -> Result<()> {
    let target = format!("{remote},{PUSH_FILE_MODE}");
    write_sync_packet(stream, b"SEND", target.as_bytes()).await?;
    for chunk in contents.chunks(SYNC_CHUNK_SIZE) {
        write_sync_packet(stream, b"DATA", chunk).await?;
    }
    let mtime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default();
    stream.write_all(b"DONE").await?;
    stream.write_all(&mtime.to_le_bytes()).await?;
    stream.flush().await?;

    let mut id = [0_u8; 4];
    stream.read_exact(&mut id).await?;
    let mut len_buf = [0_u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    match &id {
        b"OKAY" => {
            let _ = write_sync_packet(stream, b"QUIT", &[]).await;
            Ok(())
        }
        b"FAIL" => {
            let mut message = vec![0_u8; len];
            stream.read_exact(&mut message).await?;
            Err(BridgeError::remote(
                format!("sync SEND {remote}"),
                String::from_utf8_lossy(&message).to_string(),
            )
            .into())
        }
        other => Err(anyhow!(
            "unexpected sync response: {}",
            String::from_utf8_lossy(other)
        )),
    }
}

/// Tries `primary` first and retries each call on `fallback` when it fails.
pub struct FallbackClient {
    primary: Box<dyn DeviceClient>,
    fallback: Box<dyn DeviceClient>,
}

impl FallbackClient {
    pub fn new(primary: Box<dyn DeviceClient>, fallback: Box<dyn DeviceClient>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl DeviceClient for FallbackClient {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        match self.primary.list_devices().await {
            Ok(devices) => Ok(devices),
            Err(primary_err) => {
                warn!(
                    "{} failed to list devices, trying {}: {primary_err:#}",
                    self.primary.name(),
                    self.fallback.name()
                );
                self.fallback.list_devices().await
            }
        }
    }

    /// Only retried when the primary never delivered the command; a shell
    /// command such as `reboot` must not run twice.
    async fn shell(&self, serial: &str, command: &str) -> Result<String> {
        match self.primary.shell(serial, command).await {
            Ok(output) => Ok(output),
            Err(primary_err) if !is_request_not_sent(&primary_err) => Err(primary_err),
            Err(primary_err) => {
                warn!(
                    "{} shell failed, trying {}: {primary_err:#}",
                    self.primary.name(),
                    self.fallback.name()
                );
                self.fallback.shell(serial, command).await
            }
        }
    }

    async fn push(&self, serial: &str, local: &Path, remote: &str) -> Result<()> {
        match self.primary.push(serial, local, remote).await {
            Ok(()) => Ok(()),
            Err(primary_err) => {
                warn!(
                    "{} push failed, trying {}: {primary_err:#}",
                    self.primary.name(),
                    self.fallback.name()
                );
                self.fallback.push(serial, local, remote).await
            }
        }
    }

    async fn connect(&self, target: &str) -> Result<String> {
        match self.primary.connect(target).await {
            Ok(reply) => Ok(reply),
            Err(primary_err) => {
                warn!(
                    "{} connect failed, trying {}: {primary_err:#}",
                    self.primary.name(),
                    self.fallback.name()
                );
                self.fallback.connect(target).await
            }
        }
    }
}
