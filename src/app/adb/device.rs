use std::sync::OnceLock;

use regex::Regex;

use crate::app::adb::bridge::DeviceBridge;
use crate::app::adb::parse::parse_adb_devices;
use crate::app::error::AppError;
use crate::app::models::{DeviceHandle, DeviceKind};

fn emulator_serial_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^emulator-\d+$").expect("valid emulator regex"))
}

pub fn classify_serial(serial: &str) -> DeviceKind {
    if emulator_serial_re().is_match(serial.trim()) {
        DeviceKind::Emulator
    } else {
        DeviceKind::Physical
    }
}

/// First device in the `device` state, or `None` when nothing is ready.
pub fn locate(bridge: &dyn DeviceBridge, trace_id: &str) -> Result<Option<DeviceHandle>, AppError> {
    let output = bridge.list_devices(trace_id)?;
    Ok(parse_adb_devices(&output)
        .into_iter()
        .find(|summary| summary.is_ready())
        .map(|summary| DeviceHandle {
            kind: classify_serial(&summary.serial),
            identifier: summary.serial,
        }))
}
