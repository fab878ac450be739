use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::commands::{
    CheckCertCommand, CommandContext, ConnectCommand, DevicesCommand, HashCommand,
    InstallCertCommand, KlfridaCommand, PackagesCommand, ProxyGetCommand, ProxySetCommand,
    ProxyUnsetCommand, RebootCommand,
};

/// Flattened command arguments keyed by parameter name.
pub type ArgMap = BTreeMap<String, String>;

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn run(&self, ctx: &mut CommandContext, args: &ArgMap) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Flag,
}

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub flag: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub description: &'static str,
}

const fn param(
    name: &'static str,
    flag: &'static str,
    kind: ParamKind,
    required: bool,
    description: &'static str,
) -> ParamSpec {
    ParamSpec {
        name,
        flag,
        kind,
        required,
        description,
    }
}

pub struct CommandEntry {
    pub name: &'static str,
    pub cli_path: &'static [&'static str],
    pub tool_name: &'static str,
    pub summary: &'static str,
    pub device_scoped: bool,
    pub params: &'static [ParamSpec],
    pub handler: Box<dyn CommandHandler>,
}

impl CommandEntry {
    pub fn input_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for spec in self.params {
            let kind = match spec.kind {
                ParamKind::String => "string",
                ParamKind::Integer => "integer",
                ParamKind::Flag => "boolean",
            };
            properties.insert(
                spec.name.to_string(),
                json!({ "type": kind, "description": spec.description }),
            );
            if spec.required {
                required.push(Value::String(spec.name.to_string()));
            }
        }
        if self.device_scoped {
            properties.insert(
                "serial".to_string(),
                json!({
                    "type": "string",
                    "description": "Device serial; required when more than one device is attached",
                }),
            );
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Rebuilds the CLI argv (after global flags) from a flattened map.
    pub fn cli_args(&self, args: &ArgMap) -> Result<Vec<String>> {
        let mut argv: Vec<String> = self.cli_path.iter().map(|part| part.to_string()).collect();
        for spec in self.params {
            let value = args
                .get(spec.name)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty());
            match (value, spec.kind) {
                (None, _) if spec.required => {
                    return Err(anyhow!("missing required argument: {}", spec.name));
                }
                (None, _) => {}
                (Some(value), ParamKind::Flag) => {
                    if value.eq_ignore_ascii_case("true") {
                        argv.push(spec.flag.to_string());
                    }
                }
                (Some(value), ParamKind::Integer) => {
                    value
                        .parse::<u64>()
                        .map_err(|_| anyhow!("argument '{}' must be an integer", spec.name))?;
                    argv.push(spec.flag.to_string());
                    argv.push(value.to_string());
                }
                (Some(value), ParamKind::String) => {
                    argv.push(spec.flag.to_string());
                    argv.push(value.to_string());
                }
            }
        }
        Ok(argv)
    }
}

const HOST_PORT_CONNECT: &[ParamSpec] = &[
    param("host", "-H", ParamKind::String, true, "Device IP or hostname"),
    param("port", "-P", ParamKind::Integer, false, "ADB TCP port (default 5555)"),
];

const PACKAGES_PARAMS: &[ParamSpec] = &[param(
    "filter",
    "--filter",
    ParamKind::String,
    false,
    "Only list packages containing this text",
)];

const PROXY_SET_PARAMS: &[ParamSpec] = &[
    param("host", "-H", ParamKind::String, true, "Proxy host"),
    param("port", "-P", ParamKind::Integer, false, "Proxy port (default 8080)"),
];

const CHECK_CERT_PARAMS: &[ParamSpec] = &[
    param("host", "-H", ParamKind::String, false, "Host serving the certificate at /cert"),
    param("port", "-P", ParamKind::Integer, false, "Port of the certificate server"),
    param("file", "-F", ParamKind::String, false, "Local certificate file"),
    param("name", "--name", ParamKind::String, false, "File name to look for in the stores"),
];

const INSTALL_CERT_PARAMS: &[ParamSpec] = &[
    param("host", "-H", ParamKind::String, false, "Host serving the certificate at /cert"),
    param("port", "-P", ParamKind::Integer, false, "Port of the certificate server"),
    param("path", "-p", ParamKind::String, false, "Local certificate file (default toancert.der)"),
    param("reboot", "--reboot", ParamKind::Flag, false, "Reboot without asking"),
];

const KLFRIDA_PARAMS: &[ParamSpec] = &[param(
    "version",
    "--version",
    ParamKind::Integer,
    false,
    "Index of the frida-server binary to start",
)];

const HASH_PARAMS: &[ParamSpec] = &[param(
    "file",
    "-F",
    ParamKind::String,
    false,
    "Certificate file (default toancert.der)",
)];

pub struct Registry {
    entries: Vec<CommandEntry>,
}

impl Registry {
    pub fn build() -> Self {
        let entries = vec![
            CommandEntry {
                name: "devices",
                cli_path: &["devices"],
                tool_name: "adb_devices",
                summary: "List attached devices with brand, model and Android version",
                device_scoped: false,
                params: &[],
                handler: Box::new(DevicesCommand),
            },
            CommandEntry {
                name: "connect",
                cli_path: &["connect"],
                tool_name: "adb_connect",
                summary: "Connect to a device over ADB WiFi",
                device_scoped: false,
                params: HOST_PORT_CONNECT,
                handler: Box::new(ConnectCommand),
            },
            CommandEntry {
                name: "packages",
                cli_path: &["packages"],
                tool_name: "list_packages",
                summary: "List installed packages",
                device_scoped: true,
                params: PACKAGES_PARAMS,
                handler: Box::new(PackagesCommand),
            },
            CommandEntry {
                name: "proxy get",
                cli_path: &["proxy", "get"],
                tool_name: "proxy_get",
                summary: "Show the global HTTP proxy",
                device_scoped: true,
                params: &[],
                handler: Box::new(ProxyGetCommand),
            },
            CommandEntry {
                name: "proxy set",
                cli_path: &["proxy", "set"],
                tool_name: "proxy_set",
                summary: "Set the global HTTP proxy",
                device_scoped: true,
                params: PROXY_SET_PARAMS,
                handler: Box::new(ProxySetCommand),
            },
            CommandEntry {
                name: "proxy unset",
                cli_path: &["proxy", "unset"],
                tool_name: "proxy_unset",
                summary: "Clear the global HTTP proxy",
                device_scoped: true,
                params: &[],
                handler: Box::new(ProxyUnsetCommand),
            },
            CommandEntry {
                name: "check_cert",
                cli_path: &["check_cert"],
                tool_name: "check_certificate",
                summary: "Compare a certificate with the copies in the user and system stores",
                device_scoped: true,
                params: CHECK_CERT_PARAMS,
                handler: Box::new(CheckCertCommand),
            },
            CommandEntry {
                name: "install_cert",
                cli_path: &["install_cert"],
                tool_name: "install_certificate",
                summary: "Install a CA certificate into the user store",
                device_scoped: true,
                params: INSTALL_CERT_PARAMS,
                handler: Box::new(InstallCertCommand),
            },
            CommandEntry {
                name: "klfrida",
                cli_path: &["klfrida"],
                tool_name: "frida_kill_list",
                summary: "Kill the running frida-server and start another one",
                device_scoped: true,
                params: KLFRIDA_PARAMS,
                handler: Box::new(KlfridaCommand),
            },
            CommandEntry {
                name: "reboot",
                cli_path: &["reboot"],
                tool_name: "reboot_device",
                summary: "Reboot the device",
                device_scoped: true,
                params: &[],
                handler: Box::new(RebootCommand),
            },
            CommandEntry {
                name: "hash",
                cli_path: &["hash"],
                tool_name: "cert_hash",
                summary: "Print the subject hash file name of a local certificate",
                device_scoped: false,
                params: HASH_PARAMS,
                handler: Box::new(HashCommand),
            },
        ];
        Self { entries }
    }

    pub fn entries(&self) -> &[CommandEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Result<&CommandEntry> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| anyhow!("unknown command: {name}"))
    }

    pub fn by_tool(&self, tool_name: &str) -> Option<&CommandEntry> {
        self.entries
            .iter()
            .find(|entry| entry.tool_name == tool_name)
    }
}
