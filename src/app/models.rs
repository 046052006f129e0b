use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSummary {
    pub serial: String,
    pub state: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceKind {
    Emulator,
    Physical,
}

impl DeviceKind {
    pub fn label(&self) -> &'static str {
        match self {
            DeviceKind::Emulator => "Emulator",
            DeviceKind::Physical => "Real Device",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceHandle {
    pub identifier: String,
    pub kind: DeviceKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppDescriptor {
    pub package_id: String,
    pub entry_activity: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApkInstallErrorCode {
    Success,
    InstallFailedAlreadyExists,
    InstallFailedUpdateIncompatible,
    InstallFailedDuplicatePackage,
    InstallFailedOlderSdk,
    InstallFailedNewerSdk,
    InstallFailedVersionDowngrade,
    InstallFailedInsufficientStorage,
    InstallFailedMediaUnavailable,
    InstallFailedUserRestricted,
    InstallFailedVerificationFailure,
    InstallParseFailedNotApk,
    InstallParseFailedBadManifest,
    InstallParseFailedNoCertificates,
    InstallParseFailedInconsistentCertificates,
    InstallFailedInvalidApk,
    InstallFailedAborted,
    InstallFailedNoMatchingAbis,
    InstallFailedTestOnly,
    UnknownError,
}

const INSTALL_FAILURES: &[(ApkInstallErrorCode, &str, &str)] = &[
    (
        ApkInstallErrorCode::InstallFailedAlreadyExists,
        "INSTALL_FAILED_ALREADY_EXISTS",
        "App already installed with different signature",
    ),
    (
        ApkInstallErrorCode::InstallFailedUpdateIncompatible,
        "INSTALL_FAILED_UPDATE_INCOMPATIBLE",
        "Update incompatible with existing installation",
    ),
    (
        ApkInstallErrorCode::InstallFailedDuplicatePackage,
        "INSTALL_FAILED_DUPLICATE_PACKAGE",
        "Package already exists on device",
    ),
    (
        ApkInstallErrorCode::InstallFailedOlderSdk,
        "INSTALL_FAILED_OLDER_SDK",
        "Device Android version too old for this APK",
    ),
    (
        ApkInstallErrorCode::InstallFailedNewerSdk,
        "INSTALL_FAILED_NEWER_SDK",
        "APK requires older Android version",
    ),
    (
        ApkInstallErrorCode::InstallFailedVersionDowngrade,
        "INSTALL_FAILED_VERSION_DOWNGRADE",
        "Cannot downgrade; enable allow_downgrade or uninstall first",
    ),
    (
        ApkInstallErrorCode::InstallFailedInsufficientStorage,
        "INSTALL_FAILED_INSUFFICIENT_STORAGE",
        "Not enough storage space on device",
    ),
    (
        ApkInstallErrorCode::InstallFailedMediaUnavailable,
        "INSTALL_FAILED_MEDIA_UNAVAILABLE",
        "Storage media not available",
    ),
    (
        ApkInstallErrorCode::InstallFailedUserRestricted,
        "INSTALL_FAILED_USER_RESTRICTED",
        "User restricted from installing apps",
    ),
    (
        ApkInstallErrorCode::InstallFailedVerificationFailure,
        "INSTALL_FAILED_VERIFICATION_FAILURE",
        "Package verification failed",
    ),
    (
        ApkInstallErrorCode::InstallParseFailedNotApk,
        "INSTALL_PARSE_FAILED_NOT_APK",
        "File is not a valid APK",
    ),
    (
        ApkInstallErrorCode::InstallParseFailedBadManifest,
        "INSTALL_PARSE_FAILED_BAD_MANIFEST",
        "Invalid AndroidManifest.xml in APK",
    ),
    (
        ApkInstallErrorCode::InstallParseFailedNoCertificates,
        "INSTALL_PARSE_FAILED_NO_CERTIFICATES",
        "APK is not signed",
    ),
    (
        ApkInstallErrorCode::InstallParseFailedInconsistentCertificates,
        "INSTALL_PARSE_FAILED_INCONSISTENT_CERTIFICATES",
        "APK certificates are inconsistent",
    ),
    (
        ApkInstallErrorCode::InstallFailedInvalidApk,
        "INSTALL_FAILED_INVALID_APK",
        "APK file is corrupted or invalid",
    ),
    (
        ApkInstallErrorCode::InstallFailedAborted,
        "INSTALL_FAILED_ABORTED",
        "Installation was aborted",
    ),
    (
        ApkInstallErrorCode::InstallFailedNoMatchingAbis,
        "INSTALL_FAILED_NO_MATCHING_ABIS",
        "APK not compatible with device CPU architecture",
    ),
    (
        ApkInstallErrorCode::InstallFailedTestOnly,
        "INSTALL_FAILED_TEST_ONLY",
        "Test-only APK; enable allow_test_packages to install",
    ),
];

/// Markers adb prints for any rejected install, including codes missing from the table.
const FAILURE_MARKERS: &[&str] = &["Failure [", "INSTALL_FAILED_", "INSTALL_PARSE_FAILED_"];

impl ApkInstallErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            ApkInstallErrorCode::Success => "SUCCESS",
            ApkInstallErrorCode::UnknownError => "UNKNOWN_ERROR",
            other => INSTALL_FAILURES
                .iter()
                .find(|(code, _, _)| code == other)
                .map(|(_, name, _)| *name)
                .unwrap_or("UNKNOWN_ERROR"),
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ApkInstallErrorCode::Success => "Installation successful",
            ApkInstallErrorCode::UnknownError => "Unknown installation error",
            other => INSTALL_FAILURES
                .iter()
                .find(|(code, _, _)| code == other)
                .map(|(_, _, description)| *description)
                .unwrap_or("Unknown installation error"),
        }
    }

    /// Failure markers win over `Success`, which must stand on its own line.
    pub fn from_output(output: &str) -> Self {
        if let Some((code, _, _)) = INSTALL_FAILURES
            .iter()
            .find(|(_, name, _)| output.contains(name))
        {
            return *code;
        }
        if FAILURE_MARKERS.iter().any(|marker| output.contains(marker)) {
            return ApkInstallErrorCode::UnknownError;
        }
        if output.lines().any(|line| line.trim() == "Success") {
            return ApkInstallErrorCode::Success;
        }
        ApkInstallErrorCode::UnknownError
    }

    pub fn is_success(&self) -> bool {
        *self == ApkInstallErrorCode::Success
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Passed,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    NotFound,
    Incomplete,
    Rejected,
    ToolFailure,
    SessionFailure,
    CheckFailed,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepFailure {
    pub step: String,
    pub kind: FailureKind,
    pub cause: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepOutcome {
    pub name: String,
    pub status: StepStatus,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StepFailure>,
}

impl StepOutcome {
    pub fn passed(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: StepStatus::Passed,
            detail: detail.into(),
            artifact: None,
            failure: None,
        }
    }

    pub fn failed(name: &str, kind: FailureKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            name: name.to_string(),
            status: StepStatus::Failed,
            failure: Some(StepFailure {
                step: name.to_string(),
                kind,
                cause: detail.clone(),
            }),
            detail,
            artifact: None,
        }
    }

    pub fn with_artifact(mut self, path: impl Into<String>) -> Self {
        self.artifact = Some(path.into());
        self
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    Running,
    Passed,
    Failed,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Running => "RUNNING",
            ReportStatus::Passed => "PASSED",
            ReportStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RUNNING" => Some(ReportStatus::Running),
            "PASSED" => Some(ReportStatus::Passed),
            "FAILED" => Some(ReportStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

impl ReportSummary {
    pub fn from_steps(steps: &[StepOutcome]) -> Self {
        let failed = steps.iter().filter(|step| step.is_failed()).count();
        Self {
            total: steps.len(),
            passed: steps.len() - failed,
            failed,
        }
    }

    pub fn status(&self) -> ReportStatus {
        if self.failed == 0 {
            ReportStatus::Passed
        } else {
            ReportStatus::Failed
        }
    }
}

/// Everything one pipeline run produced; written back into the report in a single update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    pub steps: Vec<StepOutcome>,
    pub device: Option<DeviceHandle>,
    pub app: Option<AppDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Report {
    pub id: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    pub status: ReportStatus,
    pub source_filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<AppDescriptor>,
    pub summary: ReportSummary,
    pub steps: Vec<StepOutcome>,
}

impl Report {
    pub fn running(id: &str, source_filename: &str, created_at: String) -> Self {
        Self {
            id: id.to_string(),
            created_at,
            finished_at: None,
            status: ReportStatus::Running,
            source_filename: source_filename.to_string(),
            device: None,
            app: None,
            summary: ReportSummary::default(),
            steps: Vec::new(),
        }
    }

    /// Terminal form of this record; status is derived from the step outcomes only.
    pub fn completed(&self, result: RunResult, finished_at: String) -> Self {
        let summary = ReportSummary::from_steps(&result.steps);
        Self {
            id: self.id.clone(),
            created_at: self.created_at.clone(),
            finished_at: Some(finished_at),
            status: summary.status(),
            source_filename: self.source_filename.clone(),
            device: result.device,
            app: result.app,
            summary,
            steps: result.steps,
        }
    }

    pub fn list_item(&self) -> ReportListItem {
        ReportListItem {
            id: self.id.clone(),
            status: self.status,
            created_at: self.created_at.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportListItem {
    pub id: String,
    pub status: ReportStatus,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_apk_error_code() {
        let output = "Failure [INSTALL_FAILED_VERSION_DOWNGRADE]";
        let code = ApkInstallErrorCode::from_output(output);
        assert_eq!(code, ApkInstallErrorCode::InstallFailedVersionDowngrade);
        assert_eq!(code.code(), "INSTALL_FAILED_VERSION_DOWNGRADE");
    }

    #[test]
    fn success_requires_success_marker() {
        assert!(ApkInstallErrorCode::from_output("Performing Streamed Install\nSuccess\n").is_success());
        assert_eq!(
            ApkInstallErrorCode::from_output(""),
            ApkInstallErrorCode::UnknownError
        );
        assert_eq!(
            ApkInstallErrorCode::from_output("adb: device offline"),
            ApkInstallErrorCode::UnknownError
        );
    }

    #[test]
    fn unlisted_failure_is_not_success_even_with_success_in_path() {
        let output = "Performing Streamed Install\n\
adb: failed to install /srv/success-builds/uploads/ab12cd34.apk: \
Failure [INSTALL_FAILED_MISSING_SPLIT: Missing split for com.example]";
        let code = ApkInstallErrorCode::from_output(output);
        assert!(!code.is_success());
        assert_eq!(code, ApkInstallErrorCode::UnknownError);

        let lowercase = ApkInstallErrorCode::from_output("installed to /data/success.apk");
        assert!(!lowercase.is_success());
    }

    #[test]
    fn restored_codes_are_classified() {
        assert_eq!(
            ApkInstallErrorCode::from_output("Failure [INSTALL_FAILED_MEDIA_UNAVAILABLE]"),
            ApkInstallErrorCode::InstallFailedMediaUnavailable
        );
        let code = ApkInstallErrorCode::from_output(
            "Failure [INSTALL_PARSE_FAILED_INCONSISTENT_CERTIFICATES: mismatch]",
        );
        assert_eq!(code, ApkInstallErrorCode::InstallParseFailedInconsistentCertificates);
        assert_eq!(code.code(), "INSTALL_PARSE_FAILED_INCONSISTENT_CERTIFICATES");
    }

    #[test]
    fn summary_counts_failed_steps() {
        let steps = vec![
            StepOutcome::passed("Device Detection", "Emulator found: emulator-5554"),
            StepOutcome::passed("Install", "APK installed on Emulator"),
            StepOutcome::failed("Read App Info", FailureKind::Incomplete, "no activity"),
        ];
        let summary = ReportSummary::from_steps(&steps);
        assert_eq!(summary, ReportSummary { total: 3, passed: 2, failed: 1 });
        assert_eq!(summary.status(), ReportStatus::Failed);
        assert_eq!(ReportSummary::default().status(), ReportStatus::Passed);
    }

    #[test]
    fn completed_report_keeps_identity() {
        let running = Report::running("ab12cd34", "app.apk", "2026-01-01T00:00:00Z".to_string());
        let done = running.completed(
            RunResult {
                steps: vec![StepOutcome::passed("Device Detection", "ok")],
                ..RunResult::default()
            },
            "2026-01-01T00:01:00Z".to_string(),
        );
        assert_eq!(done.id, "ab12cd34");
        assert_eq!(done.created_at, running.created_at);
        assert_eq!(done.status, ReportStatus::Passed);
        assert_eq!(done.summary.total, done.steps.len());
    }

    #[test]
    fn step_failure_serializes_structured_cause() {
        let step = StepOutcome::failed("Install", FailureKind::Rejected, "INSTALL_FAILED_OLDER_SDK");
        let value = serde_json::to_value(&step).expect("json");
        assert_eq!(value["status"], "FAILED");
        assert_eq!(value["failure"]["kind"], "REJECTED");
        assert_eq!(value["failure"]["step"], "Install");
        assert!(value.get("artifact").is_none());
    }
}
