use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use droidmitm_core::{Device, DeviceClient, DeviceState};

use crate::commands::CommandContext;
use crate::config::AppConfig;
use crate::console::Palette;

#[derive(Default)]
struct FakeState {
    responses: Vec<(String, String)>,
    commands: Vec<String>,
    pushes: Vec<(String, Vec<u8>)>,
    connects: Vec<String>,
}

/// Scripted device: shell commands answer with the first response whose key
/// prefixes the command, or an empty string.
#[derive(Clone)]
pub struct FakeDevice {
    serial: String,
    state: Arc<Mutex<FakeState>>,
}

impl FakeDevice {
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            state: Arc::new(Mutex::new(FakeState::default())),
        }
    }

    pub fn respond(&self, prefix: &str, output: &str) {
        self.state
            .lock()
            .unwrap()
            .responses
            .push((prefix.to_string(), output.to_string()));
    }

    pub fn commands(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|command| !command.starts_with("getprop "))
            .cloned()
            .collect()
    }

    pub fn pushes(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().unwrap().pushes.clone()
    }

    pub fn connects(&self) -> Vec<String> {
        self.state.lock().unwrap().connects.clone()
    }
}

#[async_trait]
impl DeviceClient for FakeDevice {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn list_devices(&self) -> Result<Vec<Device>> {
        Ok(vec![Device::new(self.serial.clone(), DeviceState::Device)])
    }

    async fn shell(&self, _serial: &str, command: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.commands.push(command.to_string());
        let output = state
            .responses
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default();
        Ok(output)
    }

    async fn push(&self, _serial: &str, local: &Path, remote: &str) -> Result<()> {
        let contents = std::fs::read(local).context("fake push could not read local file")?;
        self.state
            .lock()
            .unwrap()
            .pushes
            .push((remote.to_string(), contents));
        Ok(())
    }

    async fn connect(&self, target: &str) -> Result<String> {
        self.state.lock().unwrap().connects.push(target.to_string());
        Ok(format!("connected to {target}"))
    }
}

#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub fn context(device: &FakeDevice, input: &str) -> (CommandContext, SharedBuf) {
    let out = SharedBuf::default();
    let ctx = CommandContext::new(
        AppConfig::default(),
        Box::new(device.clone()),
        Palette::plain(),
        None,
        Box::new(Cursor::new(input.as_bytes().to_vec())),
        Box::new(out.clone()),
    );
    (ctx, out)
}
