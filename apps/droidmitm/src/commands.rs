use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use droidmitm_certs::{download_certificate, load_certificate_file, CertificateInfo};
use droidmitm_core::{enumerate_devices, su, Device, DeviceClient};
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::console::Palette;
use crate::install::{check_store, install_certificate, StoreCheck};
use crate::registry::{ArgMap, CommandHandler};
use crate::selector::{choose_device, describe, pick_serial, Selection};

const DEFAULT_CONNECT_PORT: u16 = 5555;
const DEFAULT_PROXY_PORT: u16 = 8080;

/// Everything a command needs: config, the device client and the terminal.
pub struct CommandContext {
    pub config: AppConfig,
    pub client: Box<dyn DeviceClient>,
    pub palette: Palette,
    pub serial: Option<String>,
    input: Box<dyn BufRead + Send + Sync>,
    out: Box<dyn Write + Send + Sync>,
}

impl CommandContext {
    pub fn new(
        config: AppConfig,
        client: Box<dyn DeviceClient>,
        palette: Palette,
        serial: Option<String>,
        input: Box<dyn BufRead + Send + Sync>,
        out: Box<dyn Write + Send + Sync>,
    ) -> Self {
        Self {
            config,
            client,
            palette,
            serial,
            input,
            out,
        }
    }

    pub fn stdio(
        config: AppConfig,
        client: Box<dyn DeviceClient>,
        palette: Palette,
        serial: Option<String>,
    ) -> Self {
        Self::new(
            config,
            client,
            palette,
            serial,
            Box::new(BufReader::new(io::stdin())),
            Box::new(io::stdout()),
        )
    }

    pub fn say(&mut self, line: impl AsRef<str>) -> Result<()> {
        writeln!(self.out, "{}", line.as_ref())?;
        Ok(())
    }

    /// Prompts for one line. `None` means input is closed.
    pub fn ask(&mut self, prompt: &str) -> Result<Option<String>> {
        write!(self.out, "{prompt}")?;
        self.out.flush()?;
        let mut line = String::new();
        let read = self
            .input
            .read_line(&mut line)
            .context("failed to read from stdin")?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }

    /// `None` means the user picked Exit.
    pub async fn select_device(&mut self) -> Result<Option<Device>> {
        let devices = enumerate_devices(self.client.as_ref()).await?;
        if let Some(serial) = self.serial.clone() {
            return pick_serial(devices, &serial).map(Some);
        }
        match choose_device(devices, &mut *self.input, &mut *self.out, self.palette)? {
            Selection::Device(device) => {
                debug!(serial = %device.serial, "selected device");
                Ok(Some(device))
            }
            Selection::Exit => Ok(None),
        }
    }

    async fn device_shell(&self, device: &Device, command: &str) -> Result<String> {
        self.client
            .shell(&device.serial, command)
            .await
            .with_context(|| format!("`{command}` failed on {}", device.serial))
    }
}

fn arg<'a>(args: &'a ArgMap, name: &str) -> Option<&'a str> {
    args.get(name)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn required_arg<'a>(args: &'a ArgMap, name: &str) -> Result<&'a str> {
    arg(args, name).ok_or_else(|| anyhow!("missing required argument: {name}"))
}

fn port_arg(args: &ArgMap, default: u16) -> Result<u16> {
    match arg(args, "port") {
        Some(raw) => raw
            .parse::<u16>()
            .map_err(|_| anyhow!("invalid port '{raw}'")),
        None => Ok(default),
    }
}

/// Hosts end up inside `su -c` strings, so only address characters pass.
fn checked_host(host: &str) -> Result<&str> {
    let valid = host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']'));
    if !valid {
        return Err(anyhow!("invalid host '{host}'"));
    }
    Ok(host)
}

/// Store file names are interpolated the same way; no separators or quoting.
fn checked_file_name(name: &str) -> Result<&str> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !valid {
        return Err(anyhow!("invalid certificate file name '{name}'"));
    }
    Ok(name)
}

/// Downloads from `host:port` when both are given, otherwise reads the file
/// named by `path_key` (or the configured default).
async fn load_certificate(
    ctx: &mut CommandContext,
    args: &ArgMap,
    path_key: &str,
) -> Result<CertificateInfo> {
    let palette = ctx.palette;
    match (arg(args, "host"), arg(args, "port")) {
        (Some(host), Some(_)) => {
            let port = port_arg(args, 0)?;
            ctx.say(palette.warn(format!("[+] Download cert from {host}:{port}")))?;
            let cert = download_certificate(host, port, &ctx.config.download_options())
                .await
                .context("problem while downloading the certificate, check host and port")?;
            ctx.say(palette.ok("Certificate downloaded successfully"))?;
            Ok(cert)
        }
        (None, None) => {
            let path = arg(args, path_key)
                .map(str::to_string)
                .unwrap_or_else(|| ctx.config.cert_default_file());
            ctx.say(palette.warn(format!("[+] Using certificate {path}")))?;
            load_certificate_file(Path::new(&path))
        }
        _ => Err(anyhow!("--host and --port must be given together")),
    }
}

pub struct DevicesCommand;

#[async_trait]
impl CommandHandler for DevicesCommand {
    async fn run(&self, ctx: &mut CommandContext, _args: &ArgMap) -> Result<()> {
        let palette = ctx.palette;
        let devices = enumerate_devices(ctx.client.as_ref()).await?;
        if devices.is_empty() {
            ctx.say(palette.warn("No devices connected"))?;
            return Ok(());
        }
        ctx.say(palette.ok(format!("[+] {} device(s) attached", devices.len())))?;
        for (index, device) in devices.iter().enumerate() {
            let line = format!("[{index}] {}", describe(device));
            if device.is_ready() {
                ctx.say(palette.info(line))?;
            } else {
                ctx.say(palette.warn(line))?;
            }
        }
        Ok(())
    }
}

pub struct ConnectCommand;

#[async_trait]
impl CommandHandler for ConnectCommand {
    async fn run(&self, ctx: &mut CommandContext, args: &ArgMap) -> Result<()> {
        let palette = ctx.palette;
        let host = checked_host(required_arg(args, "host")?)?;
        let port = port_arg(args, DEFAULT_CONNECT_PORT)?;
        let target = format!("{host}:{port}");

        ctx.say(palette.warn(format!("[+] Attempting to connect to {target}...")))?;
        let reply = ctx.client.connect(&target).await?;
        if !reply.is_empty() {
            ctx.say(&reply)?;
        }
        ctx.say(palette.ok("[+] Connection attempt completed."))?;
        ctx.say(palette.info(
            "[INFO] Use 'droidmitm devices' to verify the connection.",
        ))?;
        Ok(())
    }
}

pub fn parse_packages(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .map(str::to_string)
        .collect()
}

pub struct PackagesCommand;

#[async_trait]
impl CommandHandler for PackagesCommand {
    async fn run(&self, ctx: &mut CommandContext, args: &ArgMap) -> Result<()> {
        let palette = ctx.palette;
        let Some(device) = ctx.select_device().await? else {
            return Ok(());
        };
        let output = ctx.device_shell(&device, "pm list packages").await?;
        let filter = arg(args, "filter").map(str::to_ascii_lowercase);
        let packages: Vec<String> = parse_packages(&output)
            .into_iter()
            .filter(|package| {
                filter
                    .as_deref()
                    .map_or(true, |needle| package.to_ascii_lowercase().contains(needle))
            })
            .collect();
        if packages.is_empty() {
            ctx.say(palette.warn("No packages matched"))?;
            return Ok(());
        }
        for (index, package) in packages.iter().enumerate() {
            ctx.say(palette.ok(format!("[{}] {package}", index + 1)))?;
        }
        Ok(())
    }
}

pub struct ProxyGetCommand;

#[async_trait]
impl CommandHandler for ProxyGetCommand {
    async fn run(&self, ctx: &mut CommandContext, _args: &ArgMap) -> Result<()> {
        let palette = ctx.palette;
        let Some(device) = ctx.select_device().await? else {
            return Ok(());
        };
        let output = ctx
            .device_shell(&device, &su("settings get global http_proxy"))
            .await?;
        ctx.say(palette.ok(format!("[+] Get Proxy:\n{}", output.trim())))
    }
}

pub struct ProxySetCommand;

#[async_trait]
impl CommandHandler for ProxySetCommand {
    async fn run(&self, ctx: &mut CommandContext, args: &ArgMap) -> Result<()> {
        let palette = ctx.palette;
        let host = checked_host(required_arg(args, "host")?)?;
        let port = port_arg(args, DEFAULT_PROXY_PORT)?;
        let Some(device) = ctx.select_device().await? else {
            return Ok(());
        };
        let output = ctx
            .device_shell(
                &device,
                &su(&format!("settings put global http_proxy {host}:{port}")),
            )
            .await?;
        info!(serial = %device.serial, "proxy set to {host}:{port}");
        ctx.say(palette.ok(format!("[+] Set Proxy {host}:{port}\n{}", output.trim())))
    }
}

pub struct ProxyUnsetCommand;

#[async_trait]
impl CommandHandler for ProxyUnsetCommand {
    async fn run(&self, ctx: &mut CommandContext, _args: &ArgMap) -> Result<()> {
        let palette = ctx.palette;
        let Some(device) = ctx.select_device().await? else {
            return Ok(());
        };
        let output = ctx
            .device_shell(&device, &su("settings put global http_proxy :0"))
            .await?;
        ctx.say(palette.ok(format!("[+] Unset Proxy\n{}", output.trim())))
    }
}

pub struct CheckCertCommand;

#[async_trait]
impl CommandHandler for CheckCertCommand {
    async fn run(&self, ctx: &mut CommandContext, args: &ArgMap) -> Result<()> {
        let palette = ctx.palette;
        let cert = load_certificate(ctx, args, "file").await?;
        let file_name = match arg(args, "name") {
            Some(name) => checked_file_name(name)?.to_string(),
            None => cert.file_name(),
        };
        let Some(device) = ctx.select_device().await? else {
            return Ok(());
        };

        ctx.say(format!("Checking certificates on device {}...", device.serial))?;
        ctx.say(format!("Subject: {}", cert.subject))?;
        let accepted = cert.accepted_digests();
        ctx.say(format!("MD5 of the provided certificate: {}", accepted[0]))?;

        let stores = ctx.config.store_paths();
        for (label, store) in [("user", &stores.user), ("system", &stores.system)] {
            ctx.say(format!("\nChecking {label} store..."))?;
            let check = check_store(
                ctx.client.as_ref(),
                &device.serial,
                store,
                &file_name,
                &accepted,
            )
            .await;
            let message = check.message(label, &file_name);
            match &check {
                StoreCheck::Match(_) => ctx.say(palette.ok(message))?,
                StoreCheck::DigestMismatch(found) => {
                    ctx.say(palette.warn(message))?;
                    ctx.say(format!("MD5 on device: {found}"))?;
                }
                _ => ctx.say(palette.warn(message))?,
            }
        }
        Ok(())
    }
}

pub struct InstallCertCommand;

#[async_trait]
impl CommandHandler for InstallCertCommand {
    async fn run(&self, ctx: &mut CommandContext, args: &ArgMap) -> Result<()> {
        let palette = ctx.palette;
        let cert = load_certificate(ctx, args, "path").await?;
        ctx.say(palette.info(format!("Subject: {}", cert.subject)))?;
        ctx.say(palette.ok(format!("Created {}", cert.file_name())))?;

        let Some(device) = ctx.select_device().await? else {
            return Ok(());
        };
        let stores = ctx.config.store_paths();
        let report =
            install_certificate(ctx.client.as_ref(), &device.serial, &cert, &stores).await?;
        ctx.say(palette.ok(format!(
            "[+] Pushed {} to {}",
            report.file_name, report.staged_path
        )))?;
        ctx.say(palette.ok(format!("[+] Installed {}", report.installed_path)))?;

        let reboot = if arg(args, "reboot").is_some_and(|v| v.eq_ignore_ascii_case("true")) {
            true
        } else {
            let answer = ctx.ask(&palette.warn(
                "Please reboot the device to apply the changes. Type Y or N: ",
            ))?;
            answer.is_some_and(|answer| answer.eq_ignore_ascii_case("y"))
        };
        if reboot {
            ctx.device_shell(&device, "reboot").await?;
            ctx.say(palette.ok("Certificate installed successfully!"))?;
        } else {
            ctx.say(palette.warn("Reboot and check!"))?;
        }
        Ok(())
    }
}

/// PIDs of `frida` processes in `ps -A` output (second column).
pub fn frida_pids(ps_output: &str) -> Vec<u32> {
    ps_output
        .lines()
        .filter(|line| line.contains("frida") && !line.contains("grep"))
        .filter_map(|line| line.split_whitespace().nth(1)?.parse::<u32>().ok())
        .collect()
}

pub struct KlfridaCommand;

#[async_trait]
impl CommandHandler for KlfridaCommand {
    async fn run(&self, ctx: &mut CommandContext, args: &ArgMap) -> Result<()> {
        let palette = ctx.palette;
        let Some(device) = ctx.select_device().await? else {
            return Ok(());
        };

        let ps = ctx.device_shell(&device, &su("ps -A | grep frida")).await?;
        let pids = frida_pids(&ps);
        if pids.is_empty() {
            ctx.say("\tfrida server is not running")?;
        }
        for pid in pids {
            ctx.say(palette.warn(format!("pid = {pid}")))?;
            ctx.device_shell(&device, &su(&format!("kill -9 {pid}")))
                .await?;
            ctx.say(palette.ok("Frida server stopped"))?;
        }

        let staging = ctx.config.store_paths().staging;
        let listing = ctx
            .device_shell(&device, &su(&format!("ls {staging}/frida-server-*")))
            .await?;
        let binaries: Vec<String> = listing
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.contains("No such file"))
            .map(str::to_string)
            .collect();
        if binaries.is_empty() {
            ctx.say(palette.error("Frida server not found!"))?;
            return Ok(());
        }
        for (index, binary) in binaries.iter().enumerate() {
            ctx.say(palette.warn(format!("\t[{index}]. {binary}")))?;
        }

        let choice = match arg(args, "version") {
            Some(version) => Some(version.to_string()),
            None => ctx.ask(&palette.warn("Please select the version to run: "))?,
        };
        let chosen = choice
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .and_then(|index| binaries.get(index).cloned());
        match chosen {
            Some(binary) => {
                ctx.say(palette.warn(format!("Running {binary}...")))?;
                ctx.device_shell(&device, &su(&format!("nohup {binary} >/dev/null 2>&1 &")))
                    .await?;
                ctx.say(palette.ok("Frida server started"))?;
            }
            None => ctx.say(palette.warn("Manual run frida server!"))?,
        }
        Ok(())
    }
}

pub struct RebootCommand;

#[async_trait]
impl CommandHandler for RebootCommand {
    async fn run(&self, ctx: &mut CommandContext, _args: &ArgMap) -> Result<()> {
        let palette = ctx.palette;
        let Some(device) = ctx.select_device().await? else {
            return Ok(());
        };
        ctx.device_shell(&device, "reboot").await?;
        ctx.say(palette.ok(format!("[+] Rebooting {}", device.serial)))
    }
}

pub struct HashCommand;

#[async_trait]
impl CommandHandler for HashCommand {
    async fn run(&self, ctx: &mut CommandContext, args: &ArgMap) -> Result<()> {
        let palette = ctx.palette;
        let path = arg(args, "file")
            .map(str::to_string)
            .unwrap_or_else(|| ctx.config.cert_default_file());
        let cert = load_certificate_file(Path::new(&path))?;
        ctx.say(format!("Subject: {}", cert.subject))?;
        ctx.say(format!("Issuer: {}", cert.issuer))?;
        ctx.say(palette.ok(format!("Subject hash: {}", cert.hash_name)))?;
        ctx.say(palette.ok(format!("File name: {}", cert.file_name())))
    }
}
