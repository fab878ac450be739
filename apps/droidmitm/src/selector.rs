use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use droidmitm_core::{BridgeError, Device};

use crate::console::Palette;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Device(Device),
    Exit,
}

pub fn describe(device: &Device) -> String {
    if !device.is_ready() {
        return format!("{} ({})", device.serial, device.state.as_str());
    }
    let props = &device.props;
    format!(
        "{} - {} {} (Android {}, SDK {})",
        device.serial, props.brand, props.model, props.release, props.sdk
    )
}

/// Finds a preselected serial among the attached devices.
pub fn pick_serial(devices: Vec<Device>, serial: &str) -> Result<Device> {
    devices
        .into_iter()
        .find(|device| device.serial == serial && device.is_ready())
        .ok_or_else(|| {
            BridgeError::DeviceUnavailable(format!("device {serial} is not attached or not ready"))
                .into()
        })
}

/// Prompts until a valid index is entered. Index `N` (one past the last
/// device) is the Exit entry.
pub fn choose_device<R, W>(
    devices: Vec<Device>,
    input: &mut R,
    out: &mut W,
    palette: Palette,
) -> Result<Selection>
where
    R: BufRead + ?Sized,
    W: Write + ?Sized,
{
    if devices.is_empty() {
        return Err(BridgeError::no_device_connected().into());
    }
    let (ready, skipped): (Vec<Device>, Vec<Device>) =
        devices.into_iter().partition(Device::is_ready);
    if ready.is_empty() {
        let states = skipped.iter().map(describe).collect::<Vec<_>>().join(", ");
        return Err(BridgeError::DeviceUnavailable(format!("no device is ready: {states}")).into());
    }

    for device in &skipped {
        writeln!(out, "{}", palette.warn(format!("    {} skipped", describe(device))))?;
    }

    let exit_index = ready.len();
    loop {
        for (index, device) in ready.iter().enumerate() {
            writeln!(out, "{}", palette.info(format!("[{index}] {}", describe(device))))?;
        }
        writeln!(out, "{}", palette.info(format!("[{exit_index}] Exit")))?;
        write!(out, "{}", palette.warn("Select a device: "))?;
        out.flush()?;

        let mut line = String::new();
        let read = input
            .read_line(&mut line)
            .context("failed to read device selection")?;
        if read == 0 {
            return Err(BridgeError::SelectionAborted(
                "input closed before a device was chosen".to_string(),
            )
            .into());
        }

        match line.trim().parse::<usize>() {
            Ok(index) if index < exit_index => {
                return Ok(Selection::Device(ready[index].clone()));
            }
            Ok(index) if index == exit_index => return Ok(Selection::Exit),
            _ => {
                writeln!(
                    out,
                    "{}",
                    palette.error(format!(
                        "Invalid choice '{}'. Enter a number between 0 and {exit_index}.",
                        line.trim()
                    ))
                )?;
            }
        }
    }
}
