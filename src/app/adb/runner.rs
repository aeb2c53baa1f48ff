use std::io::Read;
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::app::error::AppError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessResult {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
}

impl ProcessResult {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn terminated_by_signal(&self) -> bool {
        self.exit_code.is_none()
    }

    /// stdout, or stderr when stdout is blank.
    pub fn primary_output(&self) -> &str {
        if self.stdout.trim().is_empty() {
            &self.stderr
        } else {
            &self.stdout
        }
    }
}

pub fn run_command_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
    trace_id: &str,
) -> Result<ProcessResult, AppError> {
    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| {
            AppError::command_execution(format!("Failed to spawn {program}: {err}"), trace_id)
        })?;

    // Drain both pipes while waiting; a chatty child blocks once the pipe buffer fills.
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stdout", trace_id))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stderr", trace_id))?;

    let stdout_handle = spawn_drain(stdout);
    let stderr_handle = spawn_drain(stderr);

    let start = Instant::now();
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_handle.join();
                    let _ = stderr_handle.join();
                    return Err(AppError::timeout(
                        format!("Command timed out after {}s", timeout.as_secs()),
                        trace_id,
                    ));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(AppError::system(
                    format!("Failed to poll command: {err}"),
                    trace_id,
                ));
            }
        }
    };

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(ProcessResult {
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        exit_code,
    })
}

fn spawn_drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buffer = Vec::<u8>::new();
        let mut temp = [0u8; 4096];
        loop {
            match reader.read(&mut temp) {
                Ok(0) => break,
                Ok(count) => buffer.extend_from_slice(&temp[..count]),
                Err(_) => break,
            }
        }
        buffer
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[test]
    fn run_command_with_timeout_does_not_deadlock_on_large_stdout() {
        let output = run_command_with_timeout(
            "sh",
            &sh("i=0; while [ $i -lt 100000 ]; do echo 1234567890; i=$((i+1)); done"),
            Duration::from_secs(10),
            "test-trace-large-output",
        )
        .expect("expected large-output command to complete without timing out");

        assert_eq!(output.exit_code, Some(0));
        assert!(output.stdout.len() >= 1_000_000);
    }

    #[test]
    fn times_out_and_kills_child() {
        let err = run_command_with_timeout("sh", &sh("sleep 5"), Duration::from_millis(200), "t")
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn reports_signal_termination_as_missing_exit_code() {
        let output =
            run_command_with_timeout("sh", &sh("kill -9 $$"), Duration::from_secs(5), "t")
                .expect("completed");
        assert!(output.terminated_by_signal());
    }

    #[test]
    fn spawn_failure_is_command_execution_error() {
        let err = run_command_with_timeout(
            "/no/such/program/anywhere",
            &[],
            Duration::from_secs(1),
            "t",
        )
        .unwrap_err();
        assert_eq!(err.code, crate::app::error::ERR_COMMAND_EXECUTION);
    }
}
