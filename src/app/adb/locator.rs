use std::path::{Path, PathBuf};

use crate::app::config::RunConfig;

pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    if let Some(inner) = trimmed
        .strip_prefix('"')
        .and_then(|candidate| candidate.strip_suffix('"'))
    {
        return inner.trim().to_string();
    }
    if let Some(inner) = trimmed
        .strip_prefix('\'')
        .and_then(|candidate| candidate.strip_suffix('\''))
    {
        return inner.trim().to_string();
    }
    trimmed.to_string()
}

/// Configured SDK path, then `ANDROID_HOME`, then `ANDROID_SDK_ROOT`, then the
/// Android Studio default under the home directory.
pub fn resolve_sdk_path(configured: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = configured.map(normalize_command_path).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    for key in ["ANDROID_HOME", "ANDROID_SDK_ROOT"] {
        if let Ok(value) = std::env::var(key) {
            let normalized = normalize_command_path(&value);
            if !normalized.is_empty() {
                return Some(PathBuf::from(normalized));
            }
        }
    }
    let home = dirs::home_dir()?;
    let candidate = if cfg!(target_os = "macos") {
        home.join("Library").join("Android").join("sdk")
    } else {
        home.join("Android").join("Sdk")
    };
    candidate.is_dir().then_some(candidate)
}

fn adb_file_name() -> &'static str {
    if cfg!(windows) {
        "adb.exe"
    } else {
        "adb"
    }
}

pub fn resolve_adb_program(config: &RunConfig) -> String {
    if let Some(explicit) = config
        .adb_path
        .as_deref()
        .map(normalize_command_path)
        .filter(|value| !value.is_empty())
    {
        return explicit;
    }
    if let Some(sdk) = resolve_sdk_path(config.android_sdk_path.as_deref()) {
        let candidate = sdk.join("platform-tools").join(adb_file_name());
        if candidate.is_file() {
            return candidate.to_string_lossy().to_string();
        }
    }
    "adb".to_string()
}

pub fn validate_adb_program(program: &str) -> Result<(), String> {
    if program.trim().is_empty() {
        return Err("ADB command is empty".to_string());
    }
    if program == "adb" {
        return Ok(());
    }
    let path = Path::new(program);
    if path.is_dir() {
        return Err("ADB path must point to an executable file".to_string());
    }
    if !path.exists() {
        return Err("ADB executable not found at the configured path".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_wrapping_quotes() {
        assert_eq!(
            normalize_command_path("  \"/opt/android/platform-tools/adb\"  "),
            "/opt/android/platform-tools/adb"
        );
        assert_eq!(
            normalize_command_path("  '/opt/android/platform-tools/adb'  "),
            "/opt/android/platform-tools/adb"
        );
    }

    #[test]
    fn explicit_adb_path_wins() {
        let config = RunConfig {
            adb_path: Some("'/tools/adb'".to_string()),
            android_sdk_path: Some("/ignored".to_string()),
            ..RunConfig::default()
        };
        assert_eq!(resolve_adb_program(&config), "/tools/adb");
    }

    #[test]
    fn uses_platform_tools_inside_sdk() {
        let sdk = tempfile::tempdir().expect("tmp");
        let tools = sdk.path().join("platform-tools");
        std::fs::create_dir_all(&tools).expect("mkdir");
        std::fs::write(tools.join(adb_file_name()), b"").expect("touch");
        let config = RunConfig {
            android_sdk_path: Some(sdk.path().to_string_lossy().to_string()),
            ..RunConfig::default()
        };
        assert_eq!(
            resolve_adb_program(&config),
            tools.join(adb_file_name()).to_string_lossy()
        );
    }

    #[test]
    fn falls_back_to_path_lookup_when_sdk_has_no_adb() {
        let sdk = tempfile::tempdir().expect("tmp");
        let config = RunConfig {
            android_sdk_path: Some(sdk.path().to_string_lossy().to_string()),
            ..RunConfig::default()
        };
        assert_eq!(resolve_adb_program(&config), "adb");
    }

    #[test]
    fn validates_nonexistent_path() {
        let err = validate_adb_program("/this/path/should/not/exist/adb").unwrap_err();
        assert!(err.to_lowercase().contains("not found"));
    }
}
