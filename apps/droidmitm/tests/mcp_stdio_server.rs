use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde_json::{json, Value};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../crates/certs/testdata")
        .join(name)
}

fn write_config(dir: &Path) -> PathBuf {
    let path = dir.join("droidmitm.toml");
    std::fs::write(
        &path,
        "[bridge]\nclient = \"binary\"\nadb_binary = \"droidmitm-missing-adb\"\n\n[mcp]\ntool_timeout_seconds = 30\n",
    )
    .expect("failed to write config");
    path
}

fn write_framed_message(stdin: &mut std::process::ChildStdin, payload: &Value) {
    let body = serde_json::to_vec(payload).expect("failed to encode mcp payload");
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    stdin
        .write_all(header.as_bytes())
        .expect("failed to write header");
    stdin.write_all(&body).expect("failed to write body");
    stdin.flush().expect("failed to flush stdin");
}

fn read_framed_message(stdout: &mut BufReader<std::process::ChildStdout>) -> Value {
    let mut first_line = String::new();
    loop {
        first_line.clear();
        stdout
            .read_line(&mut first_line)
            .expect("failed to read mcp header line");
        assert!(!first_line.is_empty(), "unexpected EOF while reading header");
        if first_line.to_ascii_lowercase().starts_with("content-length:") {
            break;
        }
    }
    let (_, value) = first_line
        .trim_end_matches(&['\r', '\n'][..])
        .split_once(':')
        .expect("invalid mcp header");
    let len = value
        .trim()
        .parse::<usize>()
        .expect("invalid Content-Length value");

    loop {
        let mut line = String::new();
        stdout
            .read_line(&mut line)
            .expect("failed to read mcp header terminator");
        if line.trim().is_empty() {
            break;
        }
    }

    let mut body = vec![0_u8; len];
    stdout
        .read_exact(&mut body)
        .expect("failed to read mcp body");
    serde_json::from_slice(&body).expect("invalid JSON payload")
}

fn call(
    stdin: &mut std::process::ChildStdin,
    stdout: &mut BufReader<std::process::ChildStdout>,
    id: u64,
    name: &str,
    arguments: Value,
) -> Value {
    write_framed_message(
        stdin,
        &json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": { "name": name, "arguments": arguments }
        }),
    );
    let response = read_framed_message(stdout);
    assert_eq!(response["id"], json!(id));
    response["result"].clone()
}

#[test]
fn mcp_stdio_server_lists_and_calls_tools() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let config_path = write_config(dir.path());

    let mut child = Command::new(env!("CARGO_BIN_EXE_droidmitm"))
        .arg("--config")
        .arg(&config_path)
        .args(["mcp", "serve-stdio"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn droidmitm mcp server");

    let mut stdin = child.stdin.take().expect("missing stdin");
    let stdout = child.stdout.take().expect("missing stdout");
    let mut stdout = BufReader::new(stdout);

    write_framed_message(
        &mut stdin,
        &json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": { "name": "test-client", "version": "0.1.0" }
            }
        }),
    );
    let init_response = read_framed_message(&mut stdout);
    assert_eq!(init_response["id"], json!(1));
    assert_eq!(
        init_response["result"]["serverInfo"]["name"],
        json!("droidmitm")
    );

    write_framed_message(
        &mut stdin,
        &json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized",
            "params": {}
        }),
    );

    write_framed_message(
        &mut stdin,
        &json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/list",
            "params": {}
        }),
    );
    let list_response = read_framed_message(&mut stdout);
    assert_eq!(list_response["id"], json!(2));
    let tools = list_response["result"]["tools"]
        .as_array()
        .expect("tools/list result.tools must be array");
    assert_eq!(tools.len(), 11, "unexpected tool list: {list_response}");
    assert!(
        tools
            .iter()
            .any(|entry| entry.get("name") == Some(&json!("install_certificate"))),
        "expected install_certificate in tools/list response: {list_response}"
    );

    let missing = call(&mut stdin, &mut stdout, 3, "adb_connect", json!({}));
    assert_eq!(missing["isError"], json!(true));
    assert_eq!(
        missing["content"][0]["text"],
        json!("missing required argument: host")
    );

    let hash = call(
        &mut stdin,
        &mut stdout,
        4,
        "cert_hash",
        json!({ "file": fixture("proxy-ca.der").display().to_string() }),
    );
    assert_eq!(hash["isError"], json!(false), "cert_hash failed: {hash}");
    let text = hash["content"][0]["text"].as_str().unwrap_or_default();
    assert!(text.contains("31bd0ced.0"), "unexpected cert_hash output: {text}");

    let devices = call(&mut stdin, &mut stdout, 5, "adb_devices", json!({}));
    assert_eq!(devices["isError"], json!(true));
    let text = devices["content"][0]["text"].as_str().unwrap_or_default();
    assert!(
        text.contains("not installed or not in your PATH"),
        "unexpected adb_devices output: {text}"
    );

    let _ = child.kill();
    let _ = child.wait();
}
