use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::app::adb::locator::{normalize_command_path, resolve_program};
use crate::app::error::AppError;

pub const CONFIG_PATH_ENV: &str = "APK_AUTOTEST_CONFIG_PATH";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolSettings {
    pub adb_path: String,
    pub aapt_path: String,
    pub command_timeout_secs: u64,
    pub install_timeout_secs: u64,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            adb_path: "adb".to_string(),
            aapt_path: "aapt".to_string(),
            command_timeout_secs: 30,
            install_timeout_secs: 180,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApkInstallSettings {
    pub replace_existing: bool,
    pub allow_downgrade: bool,
    pub grant_permissions: bool,
    pub allow_test_packages: bool,
}

impl Default for ApkInstallSettings {
    fn default() -> Self {
        Self {
            replace_existing: true,
            allow_downgrade: false,
            grant_permissions: false,
            allow_test_packages: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutomationSettings {
    pub endpoint_url: String,
    pub request_timeout_secs: u64,
    pub launch_settle_ms: u64,
    pub new_command_timeout_secs: u64,
    pub log_channel: String,
}

impl Default for AutomationSettings {
    fn default() -> Self {
        Self {
            endpoint_url: "http://127.0.0.1:4723".to_string(),
            request_timeout_secs: 120,
            launch_settle_ms: 3000,
            new_command_timeout_secs: 120,
            log_channel: "logcat".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CheckSettings {
    pub min_page_source_len: usize,
    pub crash_markers: Vec<String>,
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self {
            min_page_source_len: 50,
            crash_markers: vec!["FATAL".to_string(), "ANR".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchSettings {
    pub workers: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self { workers: 2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageSettings {
    pub data_dir: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("apk_autotest");
        Self {
            data_dir: data_dir.to_string_lossy().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub max_upload_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            max_upload_bytes: 512 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub tools: ToolSettings,
    #[serde(default)]
    pub apk_install: ApkInstallSettings,
    #[serde(default)]
    pub automation: AutomationSettings,
    #[serde(default)]
    pub checks: CheckSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl AppConfig {
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir)
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir().join("uploads")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir().join("reports")
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("reports.db")
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".apk_autotest_config.json")
}

/// Loads the config file, applies environment overrides and clamps bad values.
pub fn load_config(trace_id: &str) -> Result<AppConfig, AppError> {
    let config = load_config_from_path(&config_path(), trace_id)?;
    Ok(validate_config(apply_env_overrides(config, |key| {
        std::env::var(key).ok()
    })))
}

pub fn load_config_from_path(path: &Path, trace_id: &str) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), trace_id))?;
    let config: AppConfig = serde_json::from_str(&raw)
        .map_err(|err| AppError::validation(format!("Failed to parse config: {err}"), trace_id))?;
    Ok(validate_config(config))
}

fn apply_env_overrides(
    mut config: AppConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> AppConfig {
    let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
    if let Some(port) = get("PORT").and_then(|value| value.trim().parse::<u16>().ok()) {
        config.server.port = port;
    }
    if let Some(adb) = get("APK_AUTOTEST_ADB_PATH") {
        config.tools.adb_path = adb;
    }
    if let Some(aapt) = get("APK_AUTOTEST_AAPT_PATH") {
        config.tools.aapt_path = aapt;
    }
    if let Some(url) = get("APK_AUTOTEST_AUTOMATION_URL") {
        config.automation.endpoint_url = url;
    }
    if let Some(dir) = get("APK_AUTOTEST_DATA_DIR") {
        config.storage.data_dir = dir;
    }
    config
}

fn validate_config(mut config: AppConfig) -> AppConfig {
    config.tools.adb_path = resolve_program(&config.tools.adb_path, "adb");
    config.tools.aapt_path = resolve_program(&config.tools.aapt_path, "aapt");
    if config.tools.command_timeout_secs == 0 {
        config.tools.command_timeout_secs = 30;
    }
    if config.tools.install_timeout_secs < config.tools.command_timeout_secs {
        config.tools.install_timeout_secs = config.tools.command_timeout_secs.max(180);
    }

    let endpoint = normalize_command_path(&config.automation.endpoint_url);
    config.automation.endpoint_url = if endpoint.is_empty() {
        AutomationSettings::default().endpoint_url
    } else {
        endpoint.trim_end_matches('/').to_string()
    };
    if config.automation.request_timeout_secs == 0 {
        config.automation.request_timeout_secs = 120;
    }
    if config.automation.launch_settle_ms > 60_000 {
        config.automation.launch_settle_ms = 3000;
    }
    if config.automation.log_channel.trim().is_empty() {
        config.automation.log_channel = "logcat".to_string();
    }

    config
        .checks
        .crash_markers
        .retain(|marker| !marker.trim().is_empty());
    if config.checks.crash_markers.is_empty() {
        config.checks.crash_markers = CheckSettings::default().crash_markers;
    }

    config.dispatch.workers = config.dispatch.workers.clamp(1, 16);

    if config.storage.data_dir.trim().is_empty() {
        config.storage = StorageSettings::default();
    }
    if config.server.max_upload_bytes == 0 {
        config.server.max_upload_bytes = ServerSettings::default().max_upload_bytes;
    }
    if config.logging.level.trim().is_empty() {
        config.logging.level = "info".to_string();
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().expect("tmp");
        let config =
            load_config_from_path(&dir.path().join("absent.json"), "trace").expect("config");
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.automation.endpoint_url, "http://127.0.0.1:4723");
        assert_eq!(config.checks.min_page_source_len, 50);
    }

    #[test]
    fn partial_file_keeps_section_defaults() {
        let dir = TempDir::new().expect("tmp");
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            serde_json::json!({
                "tools": { "adb_path": "  \"/opt/sdk/platform-tools/adb\" " },
                "dispatch": { "workers": 4 }
            })
            .to_string(),
        )
        .expect("write config");

        let config = load_config_from_path(&path, "trace").expect("config");
        assert_eq!(config.tools.adb_path, "/opt/sdk/platform-tools/adb");
        assert_eq!(config.tools.aapt_path, "aapt");
        assert_eq!(config.dispatch.workers, 4);
        assert_eq!(config.apk_install, ApkInstallSettings::default());
    }

    #[test]
    fn rejects_malformed_json() {
        let dir = TempDir::new().expect("tmp");
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").expect("write config");
        let err = load_config_from_path(&path, "trace-cfg").expect_err("should fail");
        assert_eq!(err.code, "ERR_VALIDATION");
        assert_eq!(err.trace_id, "trace-cfg");
    }

    #[test]
    fn clamps_invalid_values() {
        let mut config = AppConfig::default();
        config.tools.adb_path = "   ".to_string();
        config.tools.command_timeout_secs = 0;
        config.automation.endpoint_url = "http://10.0.0.5:4723/".to_string();
        config.automation.log_channel = String::new();
        config.checks.crash_markers = vec![" ".to_string()];
        config.dispatch.workers = 0;
        config.server.max_upload_bytes = 0;

        let validated = validate_config(config);
        assert_eq!(validated.tools.adb_path, "adb");
        assert_eq!(validated.tools.command_timeout_secs, 30);
        assert_eq!(validated.automation.endpoint_url, "http://10.0.0.5:4723");
        assert_eq!(validated.automation.log_channel, "logcat");
        assert_eq!(validated.checks.crash_markers, vec!["FATAL", "ANR"]);
        assert_eq!(validated.dispatch.workers, 1);
        assert!(validated.server.max_upload_bytes > 0);
    }

    #[test]
    fn applies_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PORT", "8080"),
            ("APK_AUTOTEST_AAPT_PATH", "/sdk/build-tools/34.0.0/aapt"),
            ("APK_AUTOTEST_AUTOMATION_URL", "http://appium:4723"),
            ("APK_AUTOTEST_DATA_DIR", "  "),
        ]);
        let config = apply_env_overrides(AppConfig::default(), |key| {
            env.get(key).map(|value| value.to_string())
        });
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.tools.aapt_path, "/sdk/build-tools/34.0.0/aapt");
        assert_eq!(config.automation.endpoint_url, "http://appium:4723");
        assert_eq!(config.storage, StorageSettings::default());
    }
}
