use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::app::adb::runner::ProcessResult;
use crate::app::adb::DeviceBridge;
use crate::app::commands::{CommandProvider, DeviceCommand};
use crate::app::context::{ArtifactDir, CrashDecision, CrashReport, TestRunnerContext};
use crate::app::error::AppError;
use crate::app::instrumentation::{InstrumentationOutput, TestCaseResult, TestCounts, TestStatus};
use crate::app::models::Device;
use crate::app::report::{write_device_results, DeviceResults, RESULTS_FILE_NAME};
use crate::app::scheduler::{lock_device, TaskScheduler};
use crate::app::sharding::ensure_distinct_devices;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRunState {
    Idle,
    Dispatching,
    Executing,
    Completed,
    Crashed,
    Recovering,
    Failed,
}

impl DeviceRunState {
    pub fn can_transition_to(self, next: DeviceRunState) -> bool {
        use DeviceRunState::*;
        matches!(
            (self, next),
            (Idle, Dispatching)
                | (Dispatching, Executing)
                | (Dispatching, Failed)
                | (Executing, Completed)
                | (Executing, Crashed)
                | (Executing, Failed)
                | (Crashed, Recovering)
                | (Crashed, Failed)
                | (Recovering, Executing)
                | (Recovering, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DeviceRunState::Completed | DeviceRunState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunOutcome {
    pub serial: String,
    pub success: bool,
    pub final_state: DeviceRunState,
    pub diagnostics: Vec<String>,
    pub crashes: u32,
    pub counts: TestCounts,
    pub duration_ms: u64,
}

impl RunOutcome {
    fn worker_panicked(device: &Device) -> Self {
        Self {
            serial: device.serial.clone(),
            success: false,
            final_state: DeviceRunState::Failed,
            diagnostics: vec!["device worker panicked".to_string()],
            crashes: 0,
            counts: TestCounts::default(),
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RunSummary {
    pub outcomes: Vec<RunOutcome>,
}

impl RunSummary {
    /// Logical AND over every dispatched device.
    pub fn success(&self) -> bool {
        self.outcomes.iter().all(|outcome| outcome.success)
    }

    pub fn outcome(&self, serial: &str) -> Option<&RunOutcome> {
        self.outcomes.iter().find(|outcome| outcome.serial == serial)
    }

    pub fn failed_serials(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|outcome| !outcome.success)
            .map(|outcome| outcome.serial.as_str())
            .collect()
    }

    pub fn counts(&self) -> TestCounts {
        let mut counts = TestCounts::default();
        for outcome in &self.outcomes {
            counts.add(&outcome.counts);
        }
        counts
    }
}

enum CommandStatus {
    Succeeded,
    /// Recorded against the device; later commands still run.
    Failed(String),
    CleanupFailed(String),
    Crashed(CrashReport),
    /// The process never started; the device's remaining commands are skipped.
    LaunchFailed(AppError),
}

pub struct DeviceCommandsRunner {
    bridge: Arc<dyn DeviceBridge>,
    command_provider: Arc<dyn CommandProvider>,
    scheduler: Arc<TaskScheduler>,
}

impl DeviceCommandsRunner {
    /// `max_parallel_devices == 0` runs every device at once.
    pub fn new(
        bridge: Arc<dyn DeviceBridge>,
        command_provider: Arc<dyn CommandProvider>,
        max_parallel_devices: usize,
    ) -> Self {
        Self::with_scheduler(
            bridge,
            command_provider,
            Arc::new(TaskScheduler::for_devices(max_parallel_devices)),
        )
    }

    /// Runners sharing a scheduler never drive the same device at once.
    pub fn with_scheduler(
        bridge: Arc<dyn DeviceBridge>,
        command_provider: Arc<dyn CommandProvider>,
        scheduler: Arc<TaskScheduler>,
    ) -> Self {
        Self {
            bridge,
            command_provider,
            scheduler,
        }
    }

    pub fn run_commands(&self, devices: &[Device], context: &TestRunnerContext) -> Result<bool, AppError> {
        Ok(self.run_detailed(devices, context)?.success())
    }

    pub fn run_detailed(
        &self,
        devices: &[Device],
        context: &TestRunnerContext,
    ) -> Result<RunSummary, AppError> {
        if devices.is_empty() {
            return Err(AppError::configuration(
                "No devices to run instrumentation commands on",
                &context.trace_id,
            ));
        }
        ensure_distinct_devices(devices, &context.trace_id)?;
        info!(trace_id = %context.trace_id, devices = devices.len(), "dispatching device commands");

        let outcomes = std::thread::scope(|scope| {
            let handles = devices
                .iter()
                .map(|device| scope.spawn(move || self.run_device(device, context)))
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .zip(devices)
                .map(|(handle, device)| {
                    handle.join().unwrap_or_else(|_| {
                        warn!(trace_id = %context.trace_id, serial = %device.serial, "device worker panicked");
                        RunOutcome::worker_panicked(device)
                    })
                })
                .collect::<Vec<_>>()
        });

        let summary = RunSummary { outcomes };
        info!(
            trace_id = %context.trace_id,
            success = summary.success(),
            failed = ?summary.failed_serials(),
            "device commands finished"
        );
        Ok(summary)
    }

    fn run_device(&self, device: &Device, context: &TestRunnerContext) -> RunOutcome {
        let mut run = DeviceRun::new(device, context);
        run.transition(DeviceRunState::Dispatching);

        let _permit = self.scheduler.acquire_global();
        let lock = self.scheduler.device_lock(&device.serial);
        let _device_guard = lock_device(&lock);

        match self.command_provider.provide_commands(device, context) {
            Ok(commands) => {
                run.transition(DeviceRunState::Executing);
                self.execute_all(&mut run, &commands);
            }
            Err(err) => {
                warn!(trace_id = %context.trace_id, serial = %device.serial, error = %err, "failed to build device commands");
                run.fail(err.to_string());
                run.transition(DeviceRunState::Failed);
            }
        }
        run.finish()
    }

    fn execute_all(&self, run: &mut DeviceRun<'_>, commands: &[DeviceCommand]) {
        let max_retries = run.context.config.max_crash_retries;
        for command in commands {
            let mut retries = 0u32;
            loop {
                match self.execute_command(run, command) {
                    CommandStatus::Succeeded => break,
                    CommandStatus::Failed(message) => {
                        run.fail(message);
                        break;
                    }
                    CommandStatus::CleanupFailed(message) => {
                        warn!(
                            trace_id = %run.context.trace_id,
                            serial = %run.device.serial,
                            command = %command.label(),
                            message = %message,
                            "cleanup command failed"
                        );
                        break;
                    }
                    CommandStatus::LaunchFailed(err) => {
                        run.fail(format!("{}: {}", command.label(), err));
                        run.transition(DeviceRunState::Failed);
                        return;
                    }
                    CommandStatus::Crashed(report) => {
                        run.crashes += 1;
                        run.transition(DeviceRunState::Crashed);
                        warn!(
                            trace_id = %run.context.trace_id,
                            serial = %run.device.serial,
                            attempt = report.attempt,
                            message = %report.message,
                            "test process crashed"
                        );
                        let decision = run
                            .context
                            .crash_handler()
                            .map(|handler| handler.on_process_crashed(run.device, &report));
                        match decision {
                            Some(CrashDecision::Abandon) => {
                                run.fail(format!("{}: process crashed, device abandoned", command.label()));
                                run.transition(DeviceRunState::Failed);
                                return;
                            }
                            Some(CrashDecision::Retry) if retries < max_retries => {
                                retries += 1;
                                run.transition(DeviceRunState::Recovering);
                                run.transition(DeviceRunState::Executing);
                                continue;
                            }
                            Some(CrashDecision::Retry) => {
                                run.fail(format!(
                                    "{}: process crashed, retry limit of {max_retries} reached",
                                    command.label()
                                ));
                            }
                            None => {
                                run.fail(format!("{}: process crashed: {}", command.label(), report.message));
                            }
                        }
                        run.transition(DeviceRunState::Recovering);
                        run.transition(DeviceRunState::Executing);
                        break;
                    }
                }
            }
            run.commit_attempt();
        }
    }

    fn execute_command(&self, run: &mut DeviceRun<'_>, command: &DeviceCommand) -> CommandStatus {
        let context = run.context;
        let device = run.device;
        let local_target = match command {
            DeviceCommand::Pull { dest, name, .. } => {
                let dir = context.environment.device_dir(*dest, &device.serial);
                if let Err(err) = fs::create_dir_all(&dir) {
                    return CommandStatus::Failed(format!("Failed to create {}: {err}", dir.display()));
                }
                Some(dir.join(name))
            }
            _ => None,
        };
        let args = command.bridge_args(local_target.as_deref());
        debug!(trace_id = %context.trace_id, serial = %device.serial, command = %command.label(), "executing");

        let result = self
            .bridge
            .execute(device, &args, command.timeout(&context.config), &context.trace_id);

        match command {
            DeviceCommand::Instrument(_) => run.handle_instrumentation(command, result),
            _ if command.is_cleanup() => match result {
                Ok(output) if output.is_success() && !output.primary_output().contains("Failure") => {
                    CommandStatus::Succeeded
                }
                Ok(output) => CommandStatus::CleanupFailed(output.primary_output().trim().to_string()),
                Err(err) => CommandStatus::CleanupFailed(err.to_string()),
            },
            DeviceCommand::Install { .. } => match result {
                Ok(output) if output.is_success() && output.primary_output().contains("Success") => {
                    CommandStatus::Succeeded
                }
                Ok(output) => CommandStatus::Failed(format!(
                    "{} failed: {}",
                    command.label(),
                    output.primary_output().trim()
                )),
                Err(err) => CommandStatus::LaunchFailed(err),
            },
            _ => match result {
                Ok(output) if output.is_success() => CommandStatus::Succeeded,
                Ok(output) => CommandStatus::Failed(format!(
                    "{} failed with exit code {:?}: {}",
                    command.label(),
                    output.exit_code,
                    output.primary_output().trim()
                )),
                Err(err) => CommandStatus::LaunchFailed(err),
            },
        }
    }
}

/// Per-device state owned by one worker thread.
struct DeviceRun<'a> {
    device: &'a Device,
    context: &'a TestRunnerContext,
    state: DeviceRunState,
    success: bool,
    diagnostics: Vec<String>,
    crashes: u32,
    tests: Vec<TestCaseResult>,
    /// Results of the latest attempt of the current command; a retry replaces them.
    attempt_tests: Vec<TestCaseResult>,
    attempt_screenshots: Vec<(String, String)>,
    instrument_runs: u32,
    started: Instant,
}

impl<'a> DeviceRun<'a> {
    fn new(device: &'a Device, context: &'a TestRunnerContext) -> Self {
        Self {
            device,
            context,
            state: DeviceRunState::Idle,
            success: true,
            diagnostics: Vec::new(),
            crashes: 0,
            tests: Vec::new(),
            attempt_tests: Vec::new(),
            attempt_screenshots: Vec::new(),
            instrument_runs: 0,
            started: Instant::now(),
        }
    }

    fn transition(&mut self, next: DeviceRunState) {
        if !self.state.can_transition_to(next) {
            warn!(
                trace_id = %self.context.trace_id,
                serial = %self.device.serial,
                from = ?self.state,
                to = ?next,
                "ignoring illegal device state transition"
            );
            return;
        }
        debug!(
            trace_id = %self.context.trace_id,
            serial = %self.device.serial,
            from = ?self.state,
            to = ?next,
            "device state"
        );
        self.state = next;
    }

    fn fail(&mut self, message: impl Into<String>) {
        self.success = false;
        self.diagnostics.push(message.into());
    }

    fn commit_attempt(&mut self) {
        self.tests.append(&mut self.attempt_tests);
        for (screenshot, test_id) in self.attempt_screenshots.drain(..) {
            self.context.record_screenshot(screenshot, test_id);
        }
    }

    fn results_dir(&self) -> PathBuf {
        self.context
            .environment
            .device_dir(ArtifactDir::Results, &self.device.serial)
    }

    fn handle_instrumentation(
        &mut self,
        command: &DeviceCommand,
        result: Result<ProcessResult, AppError>,
    ) -> CommandStatus {
        self.instrument_runs += 1;
        let attempt = self.crashes + 1;
        let output = match result {
            Ok(output) => output,
            Err(err) if err.is_timeout() => {
                return CommandStatus::Crashed(CrashReport {
                    attempt,
                    command: command.label(),
                    message: err.error,
                    test_id: None,
                })
            }
            Err(err) => return CommandStatus::LaunchFailed(err),
        };

        let dir = self.results_dir();
        let raw_path = dir.join(format!("instrumentation-{}.txt", self.instrument_runs));
        if let Err(err) = fs::create_dir_all(&dir).and_then(|_| fs::write(&raw_path, &output.stdout)) {
            warn!(
                trace_id = %self.context.trace_id,
                serial = %self.device.serial,
                error = %err,
                "failed to write instrumentation output"
            );
        }

        let parsed = InstrumentationOutput::parse(&output.stdout);
        self.attempt_screenshots = parsed.screenshots.clone();
        let crashed = output.terminated_by_signal() || parsed.process_crashed();
        let running_test = parsed
            .tests
            .iter()
            .rev()
            .find(|test| test.status == TestStatus::Incomplete)
            .map(TestCaseResult::id);
        self.attempt_tests = parsed.tests.clone();

        if crashed {
            let message = if output.terminated_by_signal() {
                "instrumentation process was killed".to_string()
            } else {
                parsed.crash_message()
            };
            for test in self
                .attempt_tests
                .iter_mut()
                .filter(|test| test.status == TestStatus::Incomplete)
            {
                test.status = TestStatus::Error;
                test.stack = Some(message.clone());
            }
            return CommandStatus::Crashed(CrashReport {
                attempt,
                command: command.label(),
                message,
                test_id: running_test,
            });
        }
        if parsed.completed_successfully() {
            CommandStatus::Succeeded
        } else {
            CommandStatus::Failed(parsed.failure_summary())
        }
    }

    fn finish(mut self) -> RunOutcome {
        self.commit_attempt();
        if !self.state.is_terminal() {
            let next = if self.success {
                DeviceRunState::Completed
            } else {
                DeviceRunState::Failed
            };
            self.transition(next);
        }
        let counts = TestCounts::from_tests(&self.tests);
        let results = DeviceResults {
            serial: self.device.serial.clone(),
            model: self.device.model.clone(),
            success: self.success,
            final_state: self.state,
            crashes: self.crashes,
            diagnostics: self.diagnostics.clone(),
            counts: counts.clone(),
            tests: std::mem::take(&mut self.tests),
            finished_at: Utc::now().to_rfc3339(),
        };
        let results_path = self.results_dir().join(RESULTS_FILE_NAME);
        if let Err(err) = write_device_results(&results_path, &results, &self.context.trace_id) {
            warn!(trace_id = %self.context.trace_id, serial = %self.device.serial, error = %err, "failed to write results");
            self.fail(err.to_string());
        }
        info!(
            trace_id = %self.context.trace_id,
            serial = %self.device.serial,
            state = ?self.state,
            success = self.success,
            tests = counts.total,
            failed = counts.failed,
            "device run finished"
        );
        RunOutcome {
            serial: self.device.serial.clone(),
            success: self.success,
            final_state: self.state,
            diagnostics: self.diagnostics,
            crashes: self.crashes,
            counts,
            duration_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}
