use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
}

pub const ERR_CONFIGURATION: &str = "ERR_CONFIGURATION";
pub const ERR_BRIDGE_UNAVAILABLE: &str = "ERR_BRIDGE_UNAVAILABLE";
pub const ERR_COMMAND_EXECUTION: &str = "ERR_COMMAND_EXECUTION";
pub const ERR_TIMEOUT: &str = "ERR_TIMEOUT";
pub const ERR_IO: &str = "ERR_IO";
pub const ERR_TEST_FAILURE: &str = "ERR_TEST_FAILURE";
pub const ERR_SYSTEM: &str = "ERR_SYSTEM";

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
        }
    }

    /// Missing or invalid settings. Fatal before dispatch.
    pub fn configuration(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_CONFIGURATION, message, trace_id)
    }

    pub fn bridge_unavailable(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_BRIDGE_UNAVAILABLE, message, trace_id)
    }

    /// A device command whose process could not be launched at all.
    pub fn command_execution(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_COMMAND_EXECUTION, message, trace_id)
    }

    pub fn timeout(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_TIMEOUT, message, trace_id)
    }

    pub fn io(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_IO, message, trace_id)
    }

    pub fn test_failure(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_TEST_FAILURE, message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_SYSTEM, message, trace_id)
    }

    pub fn is_configuration(&self) -> bool {
        self.code == ERR_CONFIGURATION
    }

    pub fn is_timeout(&self) -> bool {
        self.code == ERR_TIMEOUT
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}
