use crate::app::models::DeviceSummary;

pub const READY_STATE: &str = "device";

/// Parses `adb devices -l` into serial and state; the trailing `key:value` details are
/// ignored. Daemon chatter (`* daemon started *`) and the header are skipped.
pub fn parse_adb_devices(output: &str) -> Vec<DeviceSummary> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with('*'))
        .filter(|line| !line.to_lowercase().contains("list of devices"))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 {
                return None;
            }
            Some(DeviceSummary {
                serial: tokens[0].to_string(),
                state: tokens[1].to_string(),
            })
        })
        .collect()
}

impl DeviceSummary {
    pub fn is_ready(&self) -> bool {
        self.state == READY_STATE
    }
}
