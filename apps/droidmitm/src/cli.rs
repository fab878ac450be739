use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::registry::ArgMap;

#[derive(Parser)]
#[command(name = "droidmitm")]
#[command(about = "droidmitm: prepare Android devices for traffic interception")]
pub(crate) struct Cli {
    /// Config file (default droidmitm.toml, or $DROIDMITM_CONFIG)
    #[arg(long, global = true)]
    pub(crate) config: Option<PathBuf>,

    /// Device serial; skips the selection prompt (falls back to $ANDROID_SERIAL)
    #[arg(long, global = true)]
    pub(crate) serial: Option<String>,

    #[arg(long, global = true, default_value_t = false)]
    pub(crate) no_color: bool,

    #[arg(short, long, global = true, default_value_t = false)]
    pub(crate) verbose: bool,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// List all connected devices
    Devices,
    /// Connect to a device via ADB WiFi
    Connect {
        #[arg(short = 'H', long)]
        host: String,
        #[arg(short = 'P', long, default_value_t = 5555)]
        port: u16,
    },
    /// List installed packages
    Packages {
        #[arg(long)]
        filter: Option<String>,
    },
    /// Manage the global HTTP proxy
    Proxy {
        #[command(subcommand)]
        command: ProxyCommands,
    },
    /// Check device certificate stores with md5sum
    #[command(name = "check_cert")]
    CheckCert {
        #[arg(short = 'H', long)]
        host: Option<String>,
        #[arg(short = 'P', long)]
        port: Option<u16>,
        #[arg(short = 'F', long)]
        file: Option<PathBuf>,
        /// File name to look for instead of <hash>.0
        #[arg(long)]
        name: Option<String>,
    },
    /// Install a CA certificate from a file or a proxy's /cert endpoint
    #[command(name = "install_cert")]
    InstallCert {
        #[arg(short = 'H', long)]
        host: Option<String>,
        #[arg(short = 'P', long)]
        port: Option<u16>,
        #[arg(short = 'p', long)]
        path: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        reboot: bool,
    },
    /// Kill and list frida servers
    Klfrida {
        /// Index of the frida-server binary to start
        #[arg(long)]
        version: Option<usize>,
    },
    /// Reboot the device
    Reboot,
    /// Print the subject hash name of a certificate
    Hash {
        #[arg(short = 'F', long)]
        file: Option<PathBuf>,
    },
    Mcp {
        #[command(subcommand)]
        command: McpCommands,
    },
}

#[derive(Subcommand)]
pub(crate) enum ProxyCommands {
    Get,
    Set {
        #[arg(short = 'H', long)]
        host: String,
        #[arg(short = 'P', long, default_value_t = 8080)]
        port: u16,
    },
    Unset,
}

#[derive(Subcommand)]
pub(crate) enum McpCommands {
    ServeStdio,
}

fn put(args: &mut ArgMap, key: &str, value: Option<String>) {
    if let Some(value) = value {
        args.insert(key.to_string(), value);
    }
}

fn path_string(path: Option<PathBuf>) -> Option<String> {
    path.map(|path| path.display().to_string())
}

/// Registry name plus flattened arguments; `None` for `mcp` subcommands.
pub(crate) fn invocation(command: Commands) -> Option<(&'static str, ArgMap)> {
    let mut args = ArgMap::new();
    let name = match command {
        Commands::Devices => "devices",
        Commands::Connect { host, port } => {
            put(&mut args, "host", Some(host));
            put(&mut args, "port", Some(port.to_string()));
            "connect"
        }
        Commands::Packages { filter } => {
            put(&mut args, "filter", filter);
            "packages"
        }
        Commands::Proxy { command } => match command {
            ProxyCommands::Get => "proxy get",
            ProxyCommands::Set { host, port } => {
                put(&mut args, "host", Some(host));
                put(&mut args, "port", Some(port.to_string()));
                "proxy set"
            }
            ProxyCommands::Unset => "proxy unset",
        },
        Commands::CheckCert {
            host,
            port,
            file,
            name,
        } => {
            put(&mut args, "host", host);
            put(&mut args, "port", port.map(|port| port.to_string()));
            put(&mut args, "file", path_string(file));
            put(&mut args, "name", name);
            "check_cert"
        }
        Commands::InstallCert {
            host,
            port,
            path,
            reboot,
        } => {
            put(&mut args, "host", host);
            put(&mut args, "port", port.map(|port| port.to_string()));
            put(&mut args, "path", path_string(path));
            put(&mut args, "reboot", Some(reboot.to_string()));
            "install_cert"
        }
        Commands::Klfrida { version } => {
            put(&mut args, "version", version.map(|v| v.to_string()));
            "klfrida"
        }
        Commands::Reboot => "reboot",
        Commands::Hash { file } => {
            put(&mut args, "file", path_string(file));
            "hash"
        }
        Commands::Mcp {
            command: McpCommands::ServeStdio,
        } => return None,
    };
    Some((name, args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    fn parse(argv: &[&str]) -> Cli {
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn flattens_proxy_set_with_default_port() {
        let cli = parse(&["droidmitm", "proxy", "set", "-H", "192.168.1.10"]);
        let (name, args) = invocation(cli.command).unwrap();
        assert_eq!(name, "proxy set");
        assert_eq!(args["host"], "192.168.1.10");
        assert_eq!(args["port"], "8080");
    }

    #[test]
    fn global_flags_work_after_subcommand() {
        let cli = parse(&["droidmitm", "reboot", "--serial", "emulator-5554", "--no-color"]);
        assert_eq!(cli.serial.as_deref(), Some("emulator-5554"));
        assert!(cli.no_color);
    }

    #[test]
    fn underscore_command_names_parse() {
        let cli = parse(&["droidmitm", "install_cert", "-p", "burp.der", "--reboot"]);
        let (name, args) = invocation(cli.command).unwrap();
        assert_eq!(name, "install_cert");
        assert_eq!(args["path"], "burp.der");
        assert_eq!(args["reboot"], "true");

        let cli = parse(&["droidmitm", "check_cert", "-H", "10.0.0.5", "-P", "8080"]);
        let (_, args) = invocation(cli.command).unwrap();
        assert!(!args.contains_key("file"));
        assert_eq!(args["port"], "8080");
    }

    #[test]
    fn mcp_is_not_a_registry_command() {
        let cli = parse(&["droidmitm", "mcp", "serve-stdio"]);
        assert!(invocation(cli.command).is_none());
    }

    #[test]
    fn every_cli_command_maps_to_registry_entry() {
        let registry = Registry::build();
        for argv in [
            vec!["droidmitm", "devices"],
            vec!["droidmitm", "connect", "-H", "10.0.0.2"],
            vec!["droidmitm", "packages"],
            vec!["droidmitm", "proxy", "get"],
            vec!["droidmitm", "proxy", "unset"],
            vec!["droidmitm", "klfrida", "--version", "1"],
            vec!["droidmitm", "reboot"],
            vec!["droidmitm", "hash"],
        ] {
            let (name, _) = invocation(parse(&argv).command).unwrap();
            assert!(registry.get(name).is_ok(), "no registry entry for {name}");
        }
    }

    #[test]
    fn connect_requires_host() {
        assert!(Cli::try_parse_from(["droidmitm", "connect"]).is_err());
    }
}
