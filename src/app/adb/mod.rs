pub mod bridge;
#[cfg(test)]
pub mod fake;
pub mod locator;
pub mod parse;
pub mod paths;
pub mod runner;

use std::time::Duration;

use crate::app::error::AppError;
use crate::app::models::Device;
use crate::app::adb::runner::ProcessResult;

/// Device communication seam. `AdbBridge` talks to the adb daemon; tests use
/// a scripted bridge.
pub trait DeviceBridge: Send + Sync {
    /// Starts the daemon once per bridge; `restart` forces a kill and restart.
    fn init_if_needed(&self, restart: bool, trace_id: &str) -> Result<(), AppError>;

    /// Blocks until the daemon answers or `timeout` elapses.
    fn wait_for_ready(&self, timeout: Duration, trace_id: &str) -> Result<(), AppError>;

    fn list_devices(&self, trace_id: &str) -> Result<Vec<Device>, AppError>;

    /// Runs one device command. `Err` means the process could not be launched
    /// or did not finish in time; a non-zero exit is still `Ok`.
    fn execute(
        &self,
        device: &Device,
        args: &[String],
        timeout: Duration,
        trace_id: &str,
    ) -> Result<ProcessResult, AppError>;
}
