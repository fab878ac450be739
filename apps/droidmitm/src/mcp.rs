use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::registry::{ArgMap, CommandEntry, Registry};

const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
const SERVER_NAME: &str = "droidmitm";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    ContentLength,
    Newline,
}

/// How tool calls reach the CLI: this executable plus the global flags it
/// was started with.
pub(crate) struct ToolRunner {
    pub(crate) executable: PathBuf,
    pub(crate) config_path: Option<PathBuf>,
    pub(crate) timeout_seconds: u64,
}

impl ToolRunner {
    pub(crate) fn current(cfg: &AppConfig, config_path: Option<&Path>) -> Result<Self> {
        Ok(Self {
            executable: std::env::current_exe().context("failed to locate current executable")?,
            config_path: config_path.map(Path::to_path_buf),
            timeout_seconds: cfg.mcp_tool_timeout_seconds(),
        })
    }

    fn argv(&self, entry: &CommandEntry, args: &ArgMap) -> Result<Vec<String>> {
        let mut argv = vec!["--no-color".to_string()];
        if let Some(path) = &self.config_path {
            argv.push("--config".to_string());
            argv.push(path.display().to_string());
        }
        if entry.device_scoped {
            if let Some(serial) = args.get("serial").filter(|s| !s.trim().is_empty()) {
                argv.push("--serial".to_string());
                argv.push(serial.trim().to_string());
            }
        }
        argv.extend(entry.cli_args(args)?);
        Ok(argv)
    }

    async fn run(&self, argv: &[String]) -> Result<(bool, String)> {
        debug!("running tool: {} {}", self.executable.display(), shell_words::join(argv));
        let mut command = Command::new(&self.executable);
        command
            .args(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let output = tokio::time::timeout(
            Duration::from_secs(self.timeout_seconds.max(1)),
            command.output(),
        )
        .await
        .map_err(|_| anyhow!("tool timed out after {}s", self.timeout_seconds.max(1)))?
        .context("failed to run tool subprocess")?;

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        Ok((output.status.success(), text.trim_end().to_string()))
    }
}

pub(crate) async fn serve_stdio(runner: ToolRunner) -> Result<()> {
    let registry = Registry::build();
    let mut reader = BufReader::new(tokio::io::stdin());
    let mut writer = tokio::io::stdout();
    info!("mcp server listening on stdio");
    serve(&registry, &runner, &mut reader, &mut writer).await
}

async fn serve<R, W>(registry: &Registry, runner: &ToolRunner, reader: &mut R, writer: &mut W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some((framing, body)) = read_message(reader).await? {
        let response = match serde_json::from_slice::<Value>(&body) {
            Ok(message) => handle_message(registry, runner, &message).await,
            Err(err) => Some(error_response(
                Value::Null,
                -32700,
                &format!("parse error: {err}"),
            )),
        };
        if let Some(response) = response {
            write_message(writer, framing, &response).await?;
        }
    }
    debug!("mcp client closed stdin");
    Ok(())
}

async fn read_message<R>(reader: &mut R) -> Result<Option<(Framing, Vec<u8>)>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .await
            .context("failed to read from stdin")?;
        if read == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some((name, value)) = trimmed.split_once(':') else {
            return Ok(Some((Framing::Newline, trimmed.as_bytes().to_vec())));
        };
        if !name.trim().eq_ignore_ascii_case("content-length") {
            return Ok(Some((Framing::Newline, trimmed.as_bytes().to_vec())));
        }

        let len = value
            .trim()
            .parse::<usize>()
            .with_context(|| format!("invalid Content-Length header: {trimmed}"))?;
        loop {
            let mut header = String::new();
            let read = reader.read_line(&mut header).await?;
            if read == 0 || header.trim().is_empty() {
                break;
            }
        }
        let mut body = vec![0_u8; len];
        reader
            .read_exact(&mut body)
            .await
            .context("failed to read message body")?;
        return Ok(Some((Framing::ContentLength, body)));
    }
}

async fn write_message<W>(writer: &mut W, framing: Framing, payload: &Value) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(payload).context("failed to encode mcp response")?;
    match framing {
        Framing::ContentLength => {
            let header = format!("Content-Length: {}\r\n\r\n", body.len());
            writer.write_all(header.as_bytes()).await?;
            writer.write_all(&body).await?;
        }
        Framing::Newline => {
            writer.write_all(&body).await?;
            writer.write_all(b"\n").await?;
        }
    }
    writer.flush().await?;
    Ok(())
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

fn tool_result(text: String, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error,
    })
}

async fn handle_message(registry: &Registry, runner: &ToolRunner, message: &Value) -> Option<Value> {
    let method = message.get("method").and_then(Value::as_str).unwrap_or_default();
    // Requests carry an id; notifications get no reply.
    let id = message.get("id").cloned()?;

    let result = match method {
        "initialize" => json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") },
        }),
        "ping" => json!({}),
        "tools/list" => list_tools(registry),
        "tools/call" => {
            let params = message.get("params").cloned().unwrap_or(Value::Null);
            call_tool(registry, runner, &params).await
        }
        other => {
            return Some(error_response(
                id,
                -32601,
                &format!("method not found: {other}"),
            ))
        }
    };
    Some(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
}

fn list_tools(registry: &Registry) -> Value {
    let tools: Vec<Value> = registry
        .entries()
        .iter()
        .map(|entry| {
            json!({
                "name": entry.tool_name,
                "description": entry.summary,
                "inputSchema": entry.input_schema(),
            })
        })
        .collect();
    json!({ "tools": tools })
}

/// JSON arguments flattened to strings, the shape the CLI registry takes.
fn flatten_arguments(arguments: Option<&Map<String, Value>>) -> ArgMap {
    let mut args = ArgMap::new();
    for (key, value) in arguments.into_iter().flatten() {
        let text = match value {
            Value::Null => continue,
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        args.insert(key.clone(), text);
    }
    args
}

async fn call_tool(registry: &Registry, runner: &ToolRunner, params: &Value) -> Value {
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return tool_result("missing tool name".to_string(), true);
    };
    let Some(entry) = registry.by_tool(name) else {
        return tool_result(format!("unknown tool: {name}"), true);
    };
    let args = flatten_arguments(params.get("arguments").and_then(Value::as_object));
    let argv = match runner.argv(entry, &args) {
        Ok(argv) => argv,
        Err(err) => return tool_result(format!("{err:#}"), true),
    };
    match runner.run(&argv).await {
        Ok((success, text)) => tool_result(text, !success),
        Err(err) => {
            warn!("tool {name} failed: {err:#}");
            tool_result(format!("{err:#}"), true)
        }
    }
}
