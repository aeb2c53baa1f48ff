use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::app::adb::paths::sanitize_filename_component;
use crate::app::config::RunConfig;
use crate::app::models::Device;

/// Output areas a device run may write into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactDir {
    Results,
    Coverage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub results_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub coverage_dir: PathBuf,
}

impl Environment {
    pub fn new(results_dir: PathBuf, reports_dir: PathBuf, coverage_dir: PathBuf) -> Self {
        Self {
            results_dir,
            reports_dir,
            coverage_dir,
        }
    }

    /// The only directory a device's commands may write `dir` artifacts to.
    pub fn device_dir(&self, dir: ArtifactDir, serial: &str) -> PathBuf {
        let device = sanitize_filename_component(serial);
        match dir {
            ArtifactDir::Results => self.results_dir.join(device),
            ArtifactDir::Coverage => self.coverage_dir.join(device),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashDecision {
    Retry,
    Abandon,
}

#[derive(Debug, Clone)]
pub struct CrashReport {
    /// 1-based count of crashes on this device so far.
    pub attempt: u32,
    pub command: String,
    pub message: String,
    /// Test that was running when the process died, if known.
    pub test_id: Option<String>,
}

/// Decides what to do after the test process on a device crashed.
pub trait ProcessCrashHandler: Send + Sync {
    fn on_process_crashed(&self, device: &Device, report: &CrashReport) -> CrashDecision;
}

/// Run-scoped state shared by every device worker.
pub struct TestRunnerContext {
    pub trace_id: String,
    pub config: Arc<RunConfig>,
    pub environment: Environment,
    screenshot_relations: Mutex<HashMap<String, String>>,
    crash_handler: Option<Arc<dyn ProcessCrashHandler>>,
}

impl TestRunnerContext {
    pub fn new(trace_id: impl Into<String>, config: Arc<RunConfig>, environment: Environment) -> Self {
        Self {
            trace_id: trace_id.into(),
            config,
            environment,
            screenshot_relations: Mutex::new(HashMap::new()),
            crash_handler: None,
        }
    }

    pub fn set_process_crash_handler(&mut self, handler: Arc<dyn ProcessCrashHandler>) {
        self.crash_handler = Some(handler);
    }

    pub fn crash_handler(&self) -> Option<&Arc<dyn ProcessCrashHandler>> {
        self.crash_handler.as_ref()
    }

    pub fn record_screenshot(&self, screenshot: impl Into<String>, test_id: impl Into<String>) {
        let screenshot = screenshot.into();
        let test_id = test_id.into();
        match self.screenshot_relations.lock() {
            Ok(mut guard) => {
                guard.insert(screenshot, test_id);
            }
            Err(poisoned) => {
                warn!(trace_id = %self.trace_id, "screenshot relations lock poisoned");
                poisoned.into_inner().insert(screenshot, test_id);
            }
        }
    }

    pub fn screenshot_relations(&self) -> HashMap<String, String> {
        match self.screenshot_relations.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
