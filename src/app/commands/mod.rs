use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::app::adb::paths::{validate_artifact_name, validate_device_path};
use crate::app::config::{RunConfig, TestTarget};
use crate::app::context::{ArtifactDir, TestRunnerContext};
use crate::app::error::AppError;
use crate::app::models::Device;
use crate::app::sharding::ShardPlan;

pub const COVERAGE_FILE_NAME: &str = "coverage.ec";
pub const SCREENSHOTS_DIR_NAME: &str = "screenshots";
const SHELL_TIMEOUT: Duration = Duration::from_secs(30);
const ANIMATION_SCALE_SETTINGS: [&str; 3] = [
    "window_animation_scale",
    "transition_animation_scale",
    "animator_duration_scale",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentationCommand {
    pub test_package: String,
    pub runner: String,
    pub args: BTreeMap<String, String>,
}

impl InstrumentationCommand {
    pub fn component(&self) -> String {
        format!("{}/{}", self.test_package, self.runner)
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "shell".to_string(),
            "am".to_string(),
            "instrument".to_string(),
            "-r".to_string(),
            "-w".to_string(),
        ];
        for (key, value) in &self.args {
            args.push("-e".to_string());
            args.push(shell_quote(key));
            args.push(shell_quote(value));
        }
        args.push(self.component());
        args
    }
}

/// One unit of work bound to a single device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    Install {
        apk_path: PathBuf,
    },
    Shell {
        label: String,
        args: Vec<String>,
    },
    Instrument(InstrumentationCommand),
    /// Pulls `remote_path` to `name` inside the device's `dest` directory.
    Pull {
        remote_path: String,
        dest: ArtifactDir,
        name: String,
    },
    Uninstall {
        package: String,
    },
}

impl DeviceCommand {
    pub fn grant_permission(package: &str, permission: &str) -> Self {
        DeviceCommand::Shell {
            label: format!("grant {permission}"),
            args: vec![
                "pm".to_string(),
                "grant".to_string(),
                package.to_string(),
                permission.to_string(),
            ],
        }
    }

    pub fn clear_data(package: &str) -> Self {
        DeviceCommand::Shell {
            label: format!("clear {package}"),
            args: vec!["pm".to_string(), "clear".to_string(), package.to_string()],
        }
    }

    pub fn set_global_setting(name: &str, value: &str) -> Self {
        DeviceCommand::Shell {
            label: format!("settings {name}={value}"),
            args: vec![
                "settings".to_string(),
                "put".to_string(),
                "global".to_string(),
                name.to_string(),
                value.to_string(),
            ],
        }
    }

    pub fn label(&self) -> String {
        match self {
            DeviceCommand::Install { apk_path } => format!("install {}", apk_path.display()),
            DeviceCommand::Shell { label, .. } => label.clone(),
            DeviceCommand::Instrument(command) => format!("instrument {}", command.component()),
            DeviceCommand::Pull { remote_path, .. } => format!("pull {remote_path}"),
            DeviceCommand::Uninstall { package } => format!("uninstall {package}"),
        }
    }

    /// Failures of cleanup commands are logged but do not fail the device.
    pub fn is_cleanup(&self) -> bool {
        matches!(self, DeviceCommand::Uninstall { .. })
    }

    pub fn timeout(&self, config: &RunConfig) -> Duration {
        match self {
            DeviceCommand::Install { .. } => Duration::from_secs(config.install_timeout_secs),
            DeviceCommand::Instrument(_) => Duration::from_secs(config.command_timeout_secs),
            DeviceCommand::Pull { .. } => Duration::from_secs(config.install_timeout_secs),
            DeviceCommand::Shell { .. } | DeviceCommand::Uninstall { .. } => SHELL_TIMEOUT,
        }
    }

    /// Bridge arguments; `local_target` is the resolved destination for pulls.
    pub fn bridge_args(&self, local_target: Option<&Path>) -> Vec<String> {
        match self {
            DeviceCommand::Install { apk_path } => vec![
                "install".to_string(),
                "-r".to_string(),
                "-t".to_string(),
                apk_path.to_string_lossy().to_string(),
            ],
            DeviceCommand::Shell { args, .. } => {
                let mut full = vec!["shell".to_string()];
                full.extend(args.iter().map(|arg| shell_quote(arg)));
                full
            }
            DeviceCommand::Instrument(command) => command.to_args(),
            DeviceCommand::Pull { remote_path, .. } => {
                let mut full = vec!["pull".to_string(), remote_path.clone()];
                if let Some(target) = local_target {
                    full.push(target.to_string_lossy().to_string());
                }
                full
            }
            DeviceCommand::Uninstall { package } => {
                vec!["uninstall".to_string(), package.clone()]
            }
        }
    }

    pub fn validate(&self, trace_id: &str) -> Result<(), AppError> {
        match self {
            DeviceCommand::Pull {
                remote_path, name, ..
            } => {
                validate_device_path(remote_path)
                    .map_err(|message| AppError::configuration(message, trace_id))?;
                validate_artifact_name(name)
                    .map_err(|message| AppError::configuration(message, trace_id))
            }
            DeviceCommand::Install { apk_path } if !apk_path.is_file() => Err(
                AppError::configuration(format!("APK not found: {}", apk_path.display()), trace_id),
            ),
            _ => Ok(()),
        }
    }
}

/// Quotes a value for the device shell that `adb shell` hands the joined
/// arguments to.
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || "-_./:=,@%+".contains(ch));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

pub trait InstrumentationArgsProvider: Send + Sync {
    fn provide_args(
        &self,
        device: &Device,
        context: &TestRunnerContext,
    ) -> Result<BTreeMap<String, String>, AppError>;
}

/// Configured runner arguments, annotation filter, shard arguments, and
/// coverage flags.
pub struct DefaultInstrumentationArgsProvider {
    plan: ShardPlan,
}

impl DefaultInstrumentationArgsProvider {
    pub fn new(plan: ShardPlan) -> Self {
        Self { plan }
    }
}

impl InstrumentationArgsProvider for DefaultInstrumentationArgsProvider {
    fn provide_args(
        &self,
        device: &Device,
        context: &TestRunnerContext,
    ) -> Result<BTreeMap<String, String>, AppError> {
        let config = &context.config;
        let mut args = config.instrumentation_args.clone();
        if !config.annotations.is_empty() {
            args.insert("annotation".to_string(), config.annotations.join(","));
        }
        let shard = self.plan.for_serial(&device.serial).ok_or_else(|| {
            AppError::configuration(
                format!("No shard assigned to device {}", device.serial),
                &context.trace_id,
            )
        })?;
        args.extend(shard.to_instrumentation_args());
        if config.coverage_enabled {
            args.insert("coverage".to_string(), "true".to_string());
            args.insert("coverageFile".to_string(), config.coverage_remote_path.clone());
        }
        Ok(args)
    }
}

/// Everything a command sequence is built from for one device.
pub struct CommandRequest<'a> {
    pub project_name: &'a str,
    pub device: &'a Device,
    pub context: &'a TestRunnerContext,
    pub target: &'a TestTarget,
    pub instrumentation_args: BTreeMap<String, String>,
}

impl CommandRequest<'_> {
    pub fn instrumentation(&self) -> InstrumentationCommand {
        InstrumentationCommand {
            test_package: self.target.instrumental_package.clone(),
            runner: self.target.instrumental_runner.clone(),
            args: self.instrumentation_args.clone(),
        }
    }
}

/// Custom command sequence for runs filtered by a test annotation.
pub trait CommandsForAnnotation: Send + Sync {
    fn commands_for(&self, request: &CommandRequest<'_>) -> Result<Vec<DeviceCommand>, AppError>;
}

#[derive(Clone, Default)]
pub struct AnnotationCommandRegistry {
    providers: BTreeMap<String, Arc<dyn CommandsForAnnotation>>,
}

impl AnnotationCommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `annotation` matches either the full name or the simple class name of
    /// a configured annotation.
    pub fn register(&mut self, annotation: impl Into<String>, provider: Arc<dyn CommandsForAnnotation>) {
        self.providers.insert(annotation.into(), provider);
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// First configured annotation, in configured order, with a provider.
    pub fn find(&self, annotations: &[String]) -> Option<(&str, &Arc<dyn CommandsForAnnotation>)> {
        annotations.iter().find_map(|configured| {
            let simple = configured.rsplit('.').next().unwrap_or(configured);
            self.providers
                .get_key_value(configured.as_str())
                .or_else(|| self.providers.get_key_value(simple))
                .map(|(name, provider)| (name.as_str(), provider))
        })
    }
}

pub trait CommandProvider: Send + Sync {
    fn provide_commands(
        &self,
        device: &Device,
        context: &TestRunnerContext,
    ) -> Result<Vec<DeviceCommand>, AppError>;
}

pub struct DefaultCommandProvider {
    project_name: String,
    args_provider: Arc<dyn InstrumentationArgsProvider>,
    annotation_commands: AnnotationCommandRegistry,
}

impl DefaultCommandProvider {
    pub fn new(
        project_name: impl Into<String>,
        args_provider: Arc<dyn InstrumentationArgsProvider>,
        annotation_commands: AnnotationCommandRegistry,
    ) -> Self {
        Self {
            project_name: project_name.into(),
            args_provider,
            annotation_commands,
        }
    }
}

impl CommandProvider for DefaultCommandProvider {
    fn provide_commands(
        &self,
        device: &Device,
        context: &TestRunnerContext,
    ) -> Result<Vec<DeviceCommand>, AppError> {
        let target = context.config.require_identifiers(&context.trace_id)?;
        let instrumentation_args = self.args_provider.provide_args(device, context)?;
        let request = CommandRequest {
            project_name: &self.project_name,
            device,
            context,
            target: &target,
            instrumentation_args,
        };
        let commands = match self.annotation_commands.find(&context.config.annotations) {
            Some((annotation, provider)) => {
                debug!(
                    trace_id = %context.trace_id,
                    serial = %device.serial,
                    project = %self.project_name,
                    annotation = %annotation,
                    "using annotation command sequence"
                );
                provider.commands_for(&request)?
            }
            None => default_sequence(&request),
        };
        for command in &commands {
            command.validate(&context.trace_id)?;
        }
        Ok(commands)
    }
}

/// install, grant, prepare, instrument, pull artifacts, uninstall.
pub fn default_sequence(request: &CommandRequest<'_>) -> Vec<DeviceCommand> {
    let config = &request.context.config;
    let target = request.target;
    let mut commands = Vec::new();

    for apk in [&config.application_apk, &config.test_apk].into_iter().flatten() {
        if !apk.trim().is_empty() {
            commands.push(DeviceCommand::Install {
                apk_path: PathBuf::from(apk.trim()),
            });
        }
    }
    for permission in &config.granted_permissions {
        commands.push(DeviceCommand::grant_permission(&target.application_id, permission));
    }
    if config.clear_data_before_run {
        commands.push(DeviceCommand::clear_data(&target.application_id));
    }
    if config.disable_animations {
        for setting in ANIMATION_SCALE_SETTINGS {
            commands.push(DeviceCommand::set_global_setting(setting, "0"));
        }
    }

    commands.push(DeviceCommand::Instrument(request.instrumentation()));

    if config.coverage_enabled {
        commands.push(DeviceCommand::Pull {
            remote_path: config.coverage_remote_path.clone(),
            dest: ArtifactDir::Coverage,
            name: COVERAGE_FILE_NAME.to_string(),
        });
    }
    if let Some(remote_dir) = config
        .screenshots_remote_dir
        .as_deref()
        .map(str::trim)
        .filter(|dir| !dir.is_empty())
    {
        commands.push(DeviceCommand::Pull {
            remote_path: remote_dir.to_string(),
            dest: ArtifactDir::Results,
            name: SCREENSHOTS_DIR_NAME.to_string(),
        });
    }
    if config.uninstall_after_run {
        commands.push(DeviceCommand::Uninstall {
            package: target.instrumental_package.clone(),
        });
        commands.push(DeviceCommand::Uninstall {
            package: target.application_id.clone(),
        });
    }
    commands
}

#[cfg(test)]
mod tests;
