use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::app::error::AppError;

pub const DEFAULT_FLAVOR: &str = "default_flavor";
pub const CONFIG_PATH_ENV: &str = "INSTRUMENTAL_RUNNER_CONFIG";

const DEFAULT_BRIDGE_READY_TIMEOUT_SECS: u64 = 30;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 600;
const DEFAULT_INSTALL_TIMEOUT_SECS: u64 = 180;
const DEFAULT_MAX_CRASH_RETRIES: u32 = 1;
const MAX_CRASH_RETRIES_LIMIT: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    pub android_sdk_path: Option<String>,
    pub adb_path: Option<String>,
    pub build_root: String,
    pub flavor_name: Option<String>,
    pub application_id: Option<String>,
    pub instrumental_package: Option<String>,
    pub instrumental_runner: Option<String>,
    pub application_apk: Option<String>,
    pub test_apk: Option<String>,
    pub instrumentation_args: BTreeMap<String, String>,
    pub annotations: Vec<String>,
    pub granted_permissions: Vec<String>,
    pub coverage_enabled: bool,
    pub coverage_remote_path: String,
    pub screenshots_remote_dir: Option<String>,
    pub html_reports_enabled: bool,
    pub uninstall_after_run: bool,
    pub clear_data_before_run: bool,
    pub disable_animations: bool,
    pub results_dir: Option<String>,
    pub reports_dir: Option<String>,
    pub coverage_dir: Option<String>,
    pub bridge_ready_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub install_timeout_secs: u64,
    pub max_crash_retries: u32,
    pub max_parallel_devices: usize,
    pub shard_by_device_type: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            android_sdk_path: None,
            adb_path: None,
            build_root: "build".to_string(),
            flavor_name: None,
            application_id: None,
            instrumental_package: None,
            instrumental_runner: None,
            application_apk: None,
            test_apk: None,
            instrumentation_args: BTreeMap::new(),
            annotations: Vec::new(),
            granted_permissions: Vec::new(),
            coverage_enabled: false,
            coverage_remote_path: "/data/local/tmp/coverage.ec".to_string(),
            screenshots_remote_dir: None,
            html_reports_enabled: true,
            uninstall_after_run: true,
            clear_data_before_run: false,
            disable_animations: false,
            results_dir: None,
            reports_dir: None,
            coverage_dir: None,
            bridge_ready_timeout_secs: DEFAULT_BRIDGE_READY_TIMEOUT_SECS,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            install_timeout_secs: DEFAULT_INSTALL_TIMEOUT_SECS,
            max_crash_retries: DEFAULT_MAX_CRASH_RETRIES,
            max_parallel_devices: 0,
            shard_by_device_type: false,
        }
    }
}

/// Identifiers the instrumentation command cannot be built without.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestTarget {
    pub application_id: String,
    pub instrumental_package: String,
    pub instrumental_runner: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Results,
    Reports,
    Coverage,
}

impl OutputKind {
    fn dir_name(self) -> &'static str {
        match self {
            OutputKind::Results => "results",
            OutputKind::Reports => "reports",
            OutputKind::Coverage => "coverage",
        }
    }
}

impl RunConfig {
    pub fn flavor(&self) -> &str {
        self.flavor_name
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_FLAVOR)
    }

    /// Configured override, or `<build_root>/outputs/<kind>/androidTest/<flavor>`.
    pub fn output_dir(&self, kind: OutputKind) -> PathBuf {
        let explicit = match kind {
            OutputKind::Results => self.results_dir.as_deref(),
            OutputKind::Reports => self.reports_dir.as_deref(),
            OutputKind::Coverage => self.coverage_dir.as_deref(),
        };
        if let Some(dir) = explicit.map(str::trim).filter(|value| !value.is_empty()) {
            return PathBuf::from(dir);
        }
        PathBuf::from(&self.build_root)
            .join("outputs")
            .join(kind.dir_name())
            .join("androidTest")
            .join(self.flavor())
    }

    pub fn require_identifiers(&self, trace_id: &str) -> Result<TestTarget, AppError> {
        Ok(TestTarget {
            application_id: required(&self.application_id, "application_id", trace_id)?,
            instrumental_package: required(
                &self.instrumental_package,
                "instrumental_package",
                trace_id,
            )?,
            instrumental_runner: required(
                &self.instrumental_runner,
                "instrumental_runner",
                trace_id,
            )?,
        })
    }
}

fn required(value: &Option<String>, field: &str, trace_id: &str) -> Result<String, AppError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::configuration(format!("{field} is required"), trace_id))
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    PathBuf::from("instrumental-tests.json")
}

pub fn load_config(trace_id: &str) -> Result<RunConfig, AppError> {
    load_config_from_path(&config_path(), trace_id)
}

pub fn load_config_from_path(path: &Path, trace_id: &str) -> Result<RunConfig, AppError> {
    if !path.exists() {
        return Ok(RunConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::io(format!("Failed to read config: {err}"), trace_id))?;
    let config: RunConfig = serde_json::from_str(&raw).map_err(|err| {
        AppError::configuration(format!("Failed to parse config: {err}"), trace_id)
    })?;
    Ok(validate_config(config))
}

pub fn validate_config(mut config: RunConfig) -> RunConfig {
    if config.bridge_ready_timeout_secs == 0 {
        config.bridge_ready_timeout_secs = DEFAULT_BRIDGE_READY_TIMEOUT_SECS;
    }
    if config.command_timeout_secs == 0 {
        config.command_timeout_secs = DEFAULT_COMMAND_TIMEOUT_SECS;
    }
    if config.install_timeout_secs == 0 {
        config.install_timeout_secs = DEFAULT_INSTALL_TIMEOUT_SECS;
    }
    if config.max_crash_retries > MAX_CRASH_RETRIES_LIMIT {
        config.max_crash_retries = MAX_CRASH_RETRIES_LIMIT;
    }
    if config.build_root.trim().is_empty() {
        config.build_root = "build".to_string();
    }
    if config.coverage_remote_path.trim().is_empty() {
        config.coverage_remote_path = RunConfig::default().coverage_remote_path;
    }
    config.annotations.retain(|annotation| !annotation.trim().is_empty());
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_output_dirs_follow_convention() {
        let config = RunConfig {
            build_root: "/work/app/build".to_string(),
            ..RunConfig::default()
        };
        assert_eq!(
            config.output_dir(OutputKind::Results),
            PathBuf::from("/work/app/build/outputs/results/androidTest/default_flavor")
        );
        assert_eq!(
            config.output_dir(OutputKind::Reports),
            PathBuf::from("/work/app/build/outputs/reports/androidTest/default_flavor")
        );
        assert_eq!(
            config.output_dir(OutputKind::Coverage),
            PathBuf::from("/work/app/build/outputs/coverage/androidTest/default_flavor")
        );
    }

    #[test]
    fn explicit_dirs_and_flavor_override_defaults() {
        let config = RunConfig {
            build_root: "/b".to_string(),
            flavor_name: Some("staging".to_string()),
            reports_dir: Some("/custom/reports".to_string()),
            ..RunConfig::default()
        };
        assert_eq!(config.output_dir(OutputKind::Reports), PathBuf::from("/custom/reports"));
        assert_eq!(
            config.output_dir(OutputKind::Results),
            PathBuf::from("/b/outputs/results/androidTest/staging")
        );
    }

    #[test]
    fn require_identifiers_names_missing_setting() {
        let config = RunConfig {
            application_id: Some("com.example.app".to_string()),
            instrumental_package: Some("  ".to_string()),
            ..RunConfig::default()
        };
        let err = config.require_identifiers("trace").unwrap_err();
        assert!(err.is_configuration());
        assert!(err.error.contains("instrumental_package"));
    }

    #[test]
    fn parses_partial_json_with_defaults() {
        let dir = tempfile::tempdir().expect("tmp");
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"application_id": "com.example", "max_crash_retries": 99, "command_timeout_secs": 0}"#,
        )
        .expect("write");
        let config = load_config_from_path(&path, "trace").expect("load");
        assert_eq!(config.application_id.as_deref(), Some("com.example"));
        assert_eq!(config.max_crash_retries, 5);
        assert_eq!(config.command_timeout_secs, 600);
        assert!(config.html_reports_enabled);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_config_from_path(Path::new("/definitely/not/here.json"), "trace")
            .expect("defaults");
        assert_eq!(config, RunConfig::default());
    }

    #[test]
    fn invalid_json_is_configuration_error() {
        let dir = tempfile::tempdir().expect("tmp");
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").expect("write");
        let err = load_config_from_path(&path, "trace").unwrap_err();
        assert!(err.is_configuration());
    }
}
