use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::app::adb::DeviceBridge;
use crate::app::classifier::{DefaultDeviceTypeClassifier, DeviceTypeClassifier};
use crate::app::commands::{
    AnnotationCommandRegistry, CommandProvider, CommandsForAnnotation, DefaultCommandProvider,
    DefaultInstrumentationArgsProvider, InstrumentationArgsProvider,
};
use crate::app::config::{OutputKind, RunConfig};
use crate::app::context::{Environment, ProcessCrashHandler, TestRunnerContext};
use crate::app::device_runner::{DeviceCommandsRunner, RunSummary};
use crate::app::error::AppError;
use crate::app::fs::clean_directory;
use crate::app::models::Device;
use crate::app::report::{clickable_file_url, HtmlReportRenderer, ReportArtifact, ReportRenderer};
use crate::app::scheduler::TaskScheduler;
use crate::app::sharding::{ShardArguments, ShardArgumentsBuilder, ShardPlan, ShardPolicy};

pub const DEFAULT_PROJECT_NAME: &str = "android";

/// What a finished run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub trace_id: String,
    pub shards: Vec<ShardArguments>,
    pub summary: RunSummary,
    pub screenshots: HashMap<String, String>,
    pub report: Option<ReportArtifact>,
}

/// Entry point for one instrumentation run: discovers devices, shards the
/// suite across them, dispatches every device's commands and renders the report.
pub struct InstrumentationTask {
    trace_id: String,
    config: Arc<RunConfig>,
    bridge: Arc<dyn DeviceBridge>,
    project_name: String,
    classifier: Arc<dyn DeviceTypeClassifier>,
    shard_policy: ShardPolicy,
    args_provider: Option<Arc<dyn InstrumentationArgsProvider>>,
    command_provider: Option<Arc<dyn CommandProvider>>,
    annotation_commands: AnnotationCommandRegistry,
    crash_handler: Option<Arc<dyn ProcessCrashHandler>>,
    report_renderer: Arc<dyn ReportRenderer>,
    /// Shared by every dispatch of this task so a device is driven by one run at a time.
    scheduler: Arc<TaskScheduler>,
}

impl InstrumentationTask {
    pub fn new(config: RunConfig, bridge: Arc<dyn DeviceBridge>) -> Self {
        let shard_policy = if config.shard_by_device_type {
            ShardPolicy::PerDeviceType
        } else {
            ShardPolicy::Uniform
        };
        let scheduler = Arc::new(TaskScheduler::for_devices(config.max_parallel_devices));
        Self {
            trace_id: uuid::Uuid::new_v4().to_string(),
            config: Arc::new(config),
            bridge,
            project_name: DEFAULT_PROJECT_NAME.to_string(),
            classifier: Arc::new(DefaultDeviceTypeClassifier),
            shard_policy,
            args_provider: None,
            command_provider: None,
            annotation_commands: AnnotationCommandRegistry::new(),
            crash_handler: None,
            report_renderer: Arc::new(HtmlReportRenderer),
            scheduler,
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_project_name(mut self, project_name: impl Into<String>) -> Self {
        self.project_name = project_name.into();
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn DeviceTypeClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_shard_policy(mut self, policy: ShardPolicy) -> Self {
        self.shard_policy = policy;
        self
    }

    /// Replaces the shard-aware default. The provider then owns sharding.
    pub fn with_args_provider(mut self, provider: Arc<dyn InstrumentationArgsProvider>) -> Self {
        self.args_provider = Some(provider);
        self
    }

    /// Replaces the whole per-device command list builder.
    pub fn with_command_provider(mut self, provider: Arc<dyn CommandProvider>) -> Self {
        self.command_provider = Some(provider);
        self
    }

    pub fn with_annotation_commands(mut self, registry: AnnotationCommandRegistry) -> Self {
        self.annotation_commands = registry;
        self
    }

    pub fn register_annotation_commands(
        &mut self,
        annotation: impl Into<String>,
        provider: Arc<dyn CommandsForAnnotation>,
    ) {
        self.annotation_commands.register(annotation, provider);
    }

    pub fn with_crash_handler(mut self, handler: Arc<dyn ProcessCrashHandler>) -> Self {
        self.crash_handler = Some(handler);
        self
    }

    pub fn with_report_renderer(mut self, renderer: Arc<dyn ReportRenderer>) -> Self {
        self.report_renderer = renderer;
        self
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn results_dir(&self) -> PathBuf {
        self.config.output_dir(OutputKind::Results)
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.config.output_dir(OutputKind::Reports)
    }

    pub fn coverage_dir(&self) -> PathBuf {
        self.config.output_dir(OutputKind::Coverage)
    }

    pub fn environment(&self) -> Environment {
        Environment::new(self.results_dir(), self.reports_dir(), self.coverage_dir())
    }

    /// A fresh context for one run, carrying the configured crash handler.
    pub fn new_context(&self) -> TestRunnerContext {
        let mut context = TestRunnerContext::new(self.trace_id.clone(), self.config.clone(), self.environment());
        if let Some(handler) = &self.crash_handler {
            context.set_process_crash_handler(handler.clone());
        }
        context
    }

    /// Starts the bridge, waits for it and returns the online devices.
    pub fn discover_devices(&self, restart: bool) -> Result<Vec<Device>, AppError> {
        let trace_id = self.trace_id.as_str();
        self.bridge.init_if_needed(restart, trace_id)?;
        self.bridge.wait_for_ready(
            Duration::from_secs(self.config.bridge_ready_timeout_secs),
            trace_id,
        )?;
        let devices = self.bridge.list_devices(trace_id)?;
        let (online, skipped): (Vec<_>, Vec<_>) = devices.into_iter().partition(Device::is_online);
        for device in &skipped {
            warn!(trace_id = %trace_id, serial = %device.serial, state = ?device.state, "skipping device that is not online");
        }
        Ok(online)
    }

    pub fn plan_shards(&self, devices: &[Device]) -> Result<Vec<ShardArguments>, AppError> {
        ShardArgumentsBuilder::new(self.classifier.clone(), self.shard_policy).build(devices, &self.trace_id)
    }

    /// Dispatches `devices` and returns the logical AND of their outcomes.
    pub fn execute(&self, devices: &[Device], context: &TestRunnerContext) -> Result<bool, AppError> {
        self.config.require_identifiers(&self.trace_id)?;
        let plan = ShardPlan::new(self.plan_shards(devices)?);
        Ok(self.dispatch(devices, context, plan)?.success())
    }

    fn dispatch(
        &self,
        devices: &[Device],
        context: &TestRunnerContext,
        plan: ShardPlan,
    ) -> Result<RunSummary, AppError> {
        let command_provider = match &self.command_provider {
            Some(provider) => provider.clone(),
            None => {
                let args_provider = match &self.args_provider {
                    Some(provider) => provider.clone(),
                    None => Arc::new(DefaultInstrumentationArgsProvider::new(plan)),
                };
                Arc::new(DefaultCommandProvider::new(
                    self.project_name.clone(),
                    args_provider,
                    self.annotation_commands.clone(),
                ))
            }
        };
        DeviceCommandsRunner::with_scheduler(self.bridge.clone(), command_provider, self.scheduler.clone())
            .run_detailed(devices, context)
    }

    pub fn run(&self, restart: bool) -> Result<RunReport, AppError> {
        let trace_id = self.trace_id.as_str();
        self.config.require_identifiers(trace_id)?;

        let devices = self.discover_devices(restart)?;
        let shards = self.plan_shards(&devices)?;
        for shard in &shards {
            info!(
                trace_id = %trace_id,
                serial = %shard.serial,
                device_type = shard.device_type.as_str(),
                shard_index = shard.shard_index,
                shard_count = shard.shard_count,
                "planned shard"
            );
        }

        let environment = self.environment();
        for dir in [
            &environment.results_dir,
            &environment.reports_dir,
            &environment.coverage_dir,
        ] {
            clean_directory(dir, trace_id)?;
        }

        let context = self.new_context();
        let outcome = self.dispatch(&devices, &context, ShardPlan::new(shards.clone()));
        let screenshots = context.screenshot_relations();

        let report = if self.config.html_reports_enabled {
            match self.report_renderer.generate(
                &environment.results_dir,
                &environment.reports_dir,
                &screenshots,
                trace_id,
            ) {
                Ok(artifact) => Some(artifact),
                Err(err) => {
                    warn!(trace_id = %trace_id, error = %err, "failed to generate report");
                    None
                }
            }
        } else {
            None
        };

        let summary = outcome?;
        if !summary.success() {
            let location = report
                .as_ref()
                .map(ReportArtifact::url)
                .unwrap_or_else(|| clickable_file_url(&environment.results_dir));
            return Err(AppError::test_failure(
                format!("There were failing tests. See the report at: {location}"),
                trace_id,
            ));
        }

        let counts = summary.counts();
        info!(
            trace_id = %trace_id,
            devices = summary.outcomes.len(),
            tests = counts.total,
            passed = counts.passed,
            "instrumentation run passed"
        );
        Ok(RunReport {
            trace_id: self.trace_id.clone(),
            shards,
            summary,
            screenshots,
            report,
        })
    }
}
