use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::app::adb::locator::{resolve_adb_program, validate_adb_program};
use crate::app::adb::parse::{
    build_device_properties, parse_adb_devices, parse_getprop_map, parse_wm_size,
};
use crate::app::adb::runner::{run_command_with_timeout, ProcessResult};
use crate::app::adb::DeviceBridge;
use crate::app::config::RunConfig;
use crate::app::error::{AppError, ERR_COMMAND_EXECUTION};
use crate::app::models::Device;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const BACKOFF_START_MS: u64 = 200;
const BACKOFF_MAX_MS: u64 = 2_000;

pub struct AdbBridge {
    program: String,
    started: AtomicBool,
}

impl AdbBridge {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            started: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &RunConfig, trace_id: &str) -> Result<Self, AppError> {
        let program = resolve_adb_program(config);
        validate_adb_program(&program)
            .map_err(|message| AppError::configuration(message, trace_id))?;
        info!(trace_id = %trace_id, adb = %program, "resolved adb program");
        Ok(Self::new(program))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn run(&self, args: &[&str], timeout: Duration, trace_id: &str) -> Result<ProcessResult, AppError> {
        let args = args.iter().map(|arg| arg.to_string()).collect::<Vec<_>>();
        run_command_with_timeout(&self.program, &args, timeout, trace_id)
    }

    fn shell(&self, serial: &str, args: &[&str], trace_id: &str) -> Result<ProcessResult, AppError> {
        let mut full = vec!["-s", serial, "shell"];
        full.extend_from_slice(args);
        self.run(&full, PROBE_TIMEOUT, trace_id)
    }

    fn load_properties(&self, device: &mut Device, trace_id: &str) {
        match self.shell(&device.serial, &["getprop"], trace_id) {
            Ok(output) if output.is_success() => {
                let map = parse_getprop_map(&output.stdout);
                device.properties = build_device_properties(&map);
                if device.model.is_none() {
                    device.model = map.get("ro.product.model").cloned();
                }
            }
            Ok(output) => warn!(
                trace_id = %trace_id,
                serial = %device.serial,
                exit_code = ?output.exit_code,
                "getprop failed; device properties unknown"
            ),
            Err(err) => warn!(
                trace_id = %trace_id,
                serial = %device.serial,
                error = %err,
                "getprop failed; device properties unknown"
            ),
        }
        if let Ok(output) = self.shell(&device.serial, &["wm", "size"], trace_id) {
            device.properties.screen_size = parse_wm_size(&output.stdout);
        }
    }
}

impl DeviceBridge for AdbBridge {
    fn init_if_needed(&self, restart: bool, trace_id: &str) -> Result<(), AppError> {
        if restart {
            info!(trace_id = %trace_id, "restarting adb server");
            if let Err(err) = self.run(&["kill-server"], PROBE_TIMEOUT, trace_id) {
                warn!(trace_id = %trace_id, error = %err, "adb kill-server failed");
            }
            self.started.store(false, Ordering::SeqCst);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let output = match self.run(&["start-server"], PROBE_TIMEOUT, trace_id) {
            Ok(output) => output,
            Err(err) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(AppError::bridge_unavailable(
                    format!("Failed to start adb server: {}", err.error),
                    trace_id,
                ));
            }
        };
        if !output.is_success() {
            self.started.store(false, Ordering::SeqCst);
            return Err(AppError::bridge_unavailable(
                format!("adb start-server failed: {}", output.primary_output().trim()),
                trace_id,
            ));
        }
        Ok(())
    }

    fn wait_for_ready(&self, timeout: Duration, trace_id: &str) -> Result<(), AppError> {
        let start = Instant::now();
        let mut backoff_ms = BACKOFF_START_MS;
        loop {
            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(AppError::bridge_unavailable(
                    format!("adb was not ready within {}s", timeout.as_secs()),
                    trace_id,
                ));
            }
            match self.run(&["devices"], remaining.min(PROBE_TIMEOUT), trace_id) {
                Ok(output) if output.is_success() => {
                    debug!(trace_id = %trace_id, elapsed_ms = start.elapsed().as_millis() as u64, "adb ready");
                    return Ok(());
                }
                Ok(output) => {
                    debug!(trace_id = %trace_id, exit_code = ?output.exit_code, "adb not ready yet");
                }
                Err(err) if err.code == ERR_COMMAND_EXECUTION => {
                    return Err(AppError::bridge_unavailable(err.error, trace_id));
                }
                Err(err) => {
                    debug!(trace_id = %trace_id, error = %err, "adb probe failed");
                }
            }
            let sleep_for = Duration::from_millis(backoff_ms).min(timeout.saturating_sub(start.elapsed()));
            std::thread::sleep(sleep_for);
            backoff_ms = (backoff_ms * 2).min(BACKOFF_MAX_MS);
        }
    }

    fn list_devices(&self, trace_id: &str) -> Result<Vec<Device>, AppError> {
        let output = self
            .run(&["devices", "-l"], PROBE_TIMEOUT, trace_id)
            .map_err(|err| AppError::bridge_unavailable(err.error, trace_id))?;
        if !output.is_success() {
            return Err(AppError::bridge_unavailable(
                format!("adb devices failed: {}", output.primary_output().trim()),
                trace_id,
            ));
        }
        let mut devices = parse_adb_devices(&output.stdout);
        for device in devices.iter_mut().filter(|device| device.is_online()) {
            self.load_properties(device, trace_id);
        }
        Ok(devices)
    }

    fn execute(
        &self,
        device: &Device,
        args: &[String],
        timeout: Duration,
        trace_id: &str,
    ) -> Result<ProcessResult, AppError> {
        let mut full = Vec::with_capacity(args.len() + 2);
        full.push("-s".to_string());
        full.push(device.serial.clone());
        full.extend(args.iter().cloned());
        run_command_with_timeout(&self.program, &full, timeout, trace_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_rejects_missing_adb_binary() {
        let config = RunConfig {
            adb_path: Some("/no/such/dir/adb".to_string()),
            ..RunConfig::default()
        };
        let err = AdbBridge::from_config(&config, "trace").err().expect("error");
        assert!(err.is_configuration());
    }

    #[test]
    fn wait_for_ready_fails_fast_when_adb_cannot_launch() {
        let bridge = AdbBridge::new("/no/such/dir/adb");
        let err = bridge
            .wait_for_ready(Duration::from_secs(5), "trace")
            .unwrap_err();
        assert_eq!(err.code, crate::app::error::ERR_BRIDGE_UNAVAILABLE);
    }

    #[cfg(unix)]
    #[test]
    fn wait_for_ready_is_bounded_by_timeout() {
        // `false` accepts any arguments and always exits 1.
        let bridge = AdbBridge::new("false");
        let start = Instant::now();
        let err = bridge
            .wait_for_ready(Duration::from_millis(600), "trace")
            .unwrap_err();
        assert_eq!(err.code, crate::app::error::ERR_BRIDGE_UNAVAILABLE);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
