mod cli;
mod commands;
mod config;
mod console;
mod install;
mod mcp;
mod registry;
mod selector;
#[cfg(test)]
mod testing;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use droidmitm_bridge::build_client;
use droidmitm_core::{bridge_error, BridgeError};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use cli::{invocation, Cli};
use commands::CommandContext;
use config::{AppConfig, DEFAULT_CONFIG_FILE};
use console::Palette;
use registry::Registry;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("Error: {err:#}");
        if let Some(hint) = remediation_hint(&err) {
            eprintln!("Fix: {hint}");
        }
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    load_dotenv_file(Path::new(".env"));

    let (config_path, explicit) = resolve_config_path(cli.config.clone());
    let cfg = if explicit {
        AppConfig::load(&config_path)?
    } else {
        AppConfig::load_or_default(&config_path)?
    };
    debug!("using config {}", config_path.display());

    let Some((name, args)) = invocation(cli.command) else {
        // `mcp serve-stdio` is the only non-registry command.
        let forwarded = config_path.exists().then_some(config_path.as_path());
        let runner = mcp::ToolRunner::current(&cfg, forwarded)?;
        return mcp::serve_stdio(runner).await;
    };

    let palette = Palette::new(
        !cli.no_color && cfg.color_enabled() && std::io::stdout().is_terminal(),
    );
    let serial = cli
        .serial
        .or_else(|| std::env::var("ANDROID_SERIAL").ok())
        .filter(|serial| !serial.trim().is_empty());
    let client = build_client(cfg.bridge_client_kind()?, cfg.bridge_config());
    info!("dispatching {name} via {}", client.name());

    let registry = Registry::build();
    let entry = registry.get(name)?;
    let mut ctx = CommandContext::stdio(cfg, client, palette, serial);
    entry.handler.run(&mut ctx, &args).await
}

/// `--config`, then `$DROIDMITM_CONFIG`, then `droidmitm.toml`. The flag
/// reports whether the path was asked for explicitly.
fn resolve_config_path(from_cli: Option<PathBuf>) -> (PathBuf, bool) {
    if let Some(path) = from_cli {
        return (path, true);
    }
    match std::env::var("DROIDMITM_CONFIG") {
        Ok(path) if !path.trim().is_empty() => (PathBuf::from(path), true),
        _ => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    }
}

fn load_dotenv_file(path: &Path) {
    match dotenvy::from_path(path) {
        Ok(_) => debug!("loaded environment file {}", path.display()),
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("failed to load environment file {}: {err}", path.display()),
    }
}

fn remediation_hint(err: &anyhow::Error) -> Option<String> {
    if let Some(kind) = bridge_error(err) {
        return match kind {
            BridgeError::BridgeBinaryMissing(_) => Some(
                "install Android platform-tools or set bridge.adb_binary in droidmitm.toml"
                    .to_string(),
            ),
            BridgeError::DeviceUnavailable(_) => Some(
                "attach a device with USB debugging enabled, or run `droidmitm connect -H <ip>`"
                    .to_string(),
            ),
            BridgeError::Network(_) => Some(
                "check that the proxy is listening and serves its CA at http://<host>:<port>/cert"
                    .to_string(),
            ),
            BridgeError::CertificateParse(_) => {
                Some("export the CA certificate in DER or PEM format and retry".to_string())
            }
            BridgeError::RemoteCommand { .. } => {
                Some("make sure the device is rooted and `su` is granted to the shell".to_string())
            }
            BridgeError::SelectionAborted(_) => {
                Some("pass --serial <serial> (or set ANDROID_SERIAL) when stdin is not a terminal".to_string())
            }
        };
    }
    let text = format!("{err:#}").to_ascii_lowercase();
    if text.contains("failed to read certificate") {
        return Some("pass the certificate path with -p/-F or download it with -H/-P".to_string());
    }
    if text.contains("config") {
        return Some(format!("check {DEFAULT_CONFIG_FILE} or the file given with --config"));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hints_follow_error_kind() {
        let err = anyhow::Error::new(BridgeError::BridgeBinaryMissing("adb".to_string()))
            .context("failed to list devices");
        assert!(remediation_hint(&err)
            .unwrap()
            .contains("platform-tools"));

        let err = anyhow::anyhow!("failed to read certificate toancert.der");
        assert!(remediation_hint(&err).unwrap().contains("-p/-F"));

        assert!(remediation_hint(&anyhow::anyhow!("something else")).is_none());
    }

    #[test]
    fn explicit_config_path_wins() {
        let (path, explicit) = resolve_config_path(Some(PathBuf::from("/etc/droidmitm.toml")));
        assert_eq!(path, PathBuf::from("/etc/droidmitm.toml"));
        assert!(explicit);
    }
}
