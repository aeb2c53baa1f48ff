use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use crate::app::adb::runner::ProcessResult;
use crate::app::adb::DeviceBridge;
use crate::app::error::AppError;
use crate::app::models::Device;

pub fn instrumentation_pass() -> ProcessResult {
    ProcessResult::success(
        "INSTRUMENTATION_STATUS: class=com.example.LoginTest
INSTRUMENTATION_STATUS: test=opensScreen
INSTRUMENTATION_STATUS_CODE: 1
INSTRUMENTATION_STATUS: class=com.example.LoginTest
INSTRUMENTATION_STATUS: test=opensScreen
INSTRUMENTATION_STATUS_CODE: 0
INSTRUMENTATION_RESULT: stream=
OK (1 test)
INSTRUMENTATION_CODE: -1
",
    )
}

pub fn instrumentation_failure() -> ProcessResult {
    ProcessResult::success(
        "INSTRUMENTATION_STATUS: class=com.example.LoginTest
INSTRUMENTATION_STATUS: test=rejectsBadPassword
INSTRUMENTATION_STATUS_CODE: 1
INSTRUMENTATION_STATUS: class=com.example.LoginTest
INSTRUMENTATION_STATUS: stack=java.lang.AssertionError: expected error
INSTRUMENTATION_STATUS: test=rejectsBadPassword
INSTRUMENTATION_STATUS_CODE: -2
INSTRUMENTATION_RESULT: stream=
FAILURES!!!
INSTRUMENTATION_CODE: -1
",
    )
}

pub fn instrumentation_crash() -> ProcessResult {
    ProcessResult::success(
        "INSTRUMENTATION_STATUS: class=com.example.LoginTest
INSTRUMENTATION_STATUS: test=opensScreen
INSTRUMENTATION_STATUS_CODE: 1
INSTRUMENTATION_RESULT: shortMsg=Process crashed.
INSTRUMENTATION_CODE: 0
",
    )
}

#[derive(Default)]
struct Script {
    instrumentation: HashMap<String, VecDeque<ProcessResult>>,
    launch_failures: HashSet<String>,
    uninstall_failures: HashSet<String>,
}

/// Scripted bridge: every serial answers install and uninstall with
/// `Success`, instrumentation with a passing run unless scripted, and
/// pulls by writing a file at the local target.
pub struct FakeBridge {
    devices: Vec<Device>,
    script: Mutex<Script>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
    ready: bool,
}

impl FakeBridge {
    pub fn with_devices(serials: &[&str]) -> Self {
        Self::from_devices(serials.iter().map(|serial| Device::new(*serial)).collect())
    }

    pub fn from_devices(devices: Vec<Device>) -> Self {
        Self {
            devices,
            script: Mutex::new(Script::default()),
            calls: Mutex::new(Vec::new()),
            ready: true,
        }
    }

    pub fn unreachable() -> Self {
        Self {
            ready: false,
            ..Self::from_devices(Vec::new())
        }
    }

    pub fn devices(&self) -> Vec<Device> {
        self.devices.clone()
    }

    /// Queues instrumentation results for `serial`, consumed one per run.
    pub fn script_instrumentation(&self, serial: &str, results: Vec<ProcessResult>) {
        self.script
            .lock()
            .expect("script lock")
            .instrumentation
            .entry(serial.to_string())
            .or_default()
            .extend(results);
    }

    /// Every command on `serial` fails to launch.
    pub fn fail_launch(&self, serial: &str) {
        self.script
            .lock()
            .expect("script lock")
            .launch_failures
            .insert(serial.to_string());
    }

    pub fn fail_uninstall(&self, serial: &str) {
        self.script
            .lock()
            .expect("script lock")
            .uninstall_failures
            .insert(serial.to_string());
    }

    pub fn calls_for(&self, serial: &str) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|(call_serial, _)| call_serial == serial)
            .map(|(_, args)| args.clone())
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }
}

impl DeviceBridge for FakeBridge {
    fn init_if_needed(&self, _restart: bool, _trace_id: &str) -> Result<(), AppError> {
        Ok(())
    }

    fn wait_for_ready(&self, _timeout: Duration, trace_id: &str) -> Result<(), AppError> {
        if self.ready {
            Ok(())
        } else {
            Err(AppError::bridge_unavailable("fake bridge is down", trace_id))
        }
    }

    fn list_devices(&self, _trace_id: &str) -> Result<Vec<Device>, AppError> {
        Ok(self.devices.clone())
    }

    fn execute(
        &self,
        device: &Device,
        args: &[String],
        _timeout: Duration,
        trace_id: &str,
    ) -> Result<ProcessResult, AppError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((device.serial.clone(), args.to_vec()));

        let mut script = self.script.lock().expect("script lock");
        if script.launch_failures.contains(&device.serial) {
            return Err(AppError::command_execution("Failed to launch adb", trace_id));
        }
        match args.first().map(String::as_str) {
            Some("install") => Ok(ProcessResult::success("Performing Streamed Install\nSuccess\n")),
            Some("uninstall") if script.uninstall_failures.contains(&device.serial) => Ok(ProcessResult {
                stdout: "Failure [DELETE_FAILED_INTERNAL_ERROR]\n".to_string(),
                stderr: String::new(),
                exit_code: Some(1),
            }),
            Some("uninstall") => Ok(ProcessResult::success("Success\n")),
            Some("pull") => {
                if let Some(target) = args.get(2) {
                    std::fs::write(Path::new(target), b"pulled")
                        .map_err(|err| AppError::io(err.to_string(), trace_id))?;
                }
                Ok(ProcessResult::success("1 file pulled\n"))
            }
            Some("shell") if args.get(2).map(String::as_str) == Some("instrument") => Ok(script
                .instrumentation
                .get_mut(&device.serial)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(instrumentation_pass)),
            _ => Ok(ProcessResult::success("")),
        }
    }
}
