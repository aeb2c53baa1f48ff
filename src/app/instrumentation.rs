//! Parser for `am instrument -r -w` raw output.
//!
//! Raw mode prints one `INSTRUMENTATION_STATUS: key=value` line per bundle
//! entry followed by `INSTRUMENTATION_STATUS_CODE: n`. Values such as `stack`
//! continue over the following lines until the next `INSTRUMENTATION_` line.
//! The run ends with `INSTRUMENTATION_RESULT:` entries and
//! `INSTRUMENTATION_CODE:`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

const STATUS_PREFIX: &str = "INSTRUMENTATION_STATUS: ";
const STATUS_CODE_PREFIX: &str = "INSTRUMENTATION_STATUS_CODE: ";
const RESULT_PREFIX: &str = "INSTRUMENTATION_RESULT: ";
const CODE_PREFIX: &str = "INSTRUMENTATION_CODE: ";
const FAILED_PREFIX: &str = "INSTRUMENTATION_FAILED: ";
const ABORTED_PREFIX: &str = "INSTRUMENTATION_ABORTED: ";

/// `Activity.RESULT_OK`, reported when the runner finished normally.
const RUN_CODE_OK: i32 = -1;
const PROCESS_CRASHED_MSG: &str = "Process crashed";

pub const SCREENSHOT_STATUS_KEY: &str = "screenshot";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    Error,
    Ignored,
    AssumptionFailed,
    /// Started but never reported an end status.
    Incomplete,
}

impl TestStatus {
    fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(TestStatus::Passed),
            -1 => Some(TestStatus::Error),
            -2 => Some(TestStatus::Failed),
            -3 => Some(TestStatus::Ignored),
            -4 => Some(TestStatus::AssumptionFailed),
            _ => None,
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, TestStatus::Failed | TestStatus::Error | TestStatus::Incomplete)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Error => "error",
            TestStatus::Ignored => "ignored",
            TestStatus::AssumptionFailed => "assumption_failed",
            TestStatus::Incomplete => "incomplete",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestCaseResult {
    pub class_name: String,
    pub test_name: String,
    pub status: TestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl TestCaseResult {
    pub fn id(&self) -> String {
        test_id(&self.class_name, &self.test_name)
    }
}

pub fn test_id(class_name: &str, test_name: &str) -> String {
    format!("{class_name}#{test_name}")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestCounts {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub ignored: usize,
}

impl TestCounts {
    pub fn from_tests(tests: &[TestCaseResult]) -> Self {
        let mut counts = TestCounts {
            total: tests.len(),
            ..TestCounts::default()
        };
        for test in tests {
            match test.status {
                TestStatus::Passed => counts.passed += 1,
                TestStatus::Ignored | TestStatus::AssumptionFailed => counts.ignored += 1,
                _ => counts.failed += 1,
            }
        }
        counts
    }

    pub fn add(&mut self, other: &TestCounts) {
        self.total += other.total;
        self.passed += other.passed;
        self.failed += other.failed;
        self.ignored += other.ignored;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentationOutput {
    pub tests: Vec<TestCaseResult>,
    pub result: BTreeMap<String, String>,
    pub run_code: Option<i32>,
    pub run_failure: Option<String>,
    /// `(screenshot, test id)` pairs from the `screenshot` status key.
    pub screenshots: Vec<(String, String)>,
}

#[derive(Clone, Copy)]
enum Section {
    Status,
    Result,
    Failure,
}

impl InstrumentationOutput {
    pub fn parse(output: &str) -> Self {
        let mut parsed = InstrumentationOutput::default();
        let mut status: BTreeMap<String, String> = BTreeMap::new();
        let mut last: Option<(Section, String)> = None;

        for raw_line in output.lines() {
            let line = raw_line.trim_end_matches('\r');
            if let Some(rest) = line.strip_prefix(STATUS_PREFIX) {
                let (key, value) = split_entry(rest);
                status.insert(key.clone(), value);
                last = Some((Section::Status, key));
            } else if let Some(rest) = line.strip_prefix(STATUS_CODE_PREFIX) {
                if let Ok(code) = rest.trim().parse::<i32>() {
                    parsed.apply_status(code, std::mem::take(&mut status));
                }
                status.clear();
                last = None;
            } else if let Some(rest) = line.strip_prefix(RESULT_PREFIX) {
                let (key, value) = split_entry(rest);
                parsed.result.insert(key.clone(), value);
                last = Some((Section::Result, key));
            } else if let Some(rest) = line.strip_prefix(CODE_PREFIX) {
                parsed.run_code = rest.trim().parse().ok();
                last = None;
            } else if let Some(rest) = line
                .strip_prefix(FAILED_PREFIX)
                .or_else(|| line.strip_prefix(ABORTED_PREFIX))
            {
                parsed.run_failure = Some(rest.trim().to_string());
                last = Some((Section::Failure, String::new()));
            } else if let Some((section, key)) = &last {
                let target = match section {
                    Section::Status => status.get_mut(key),
                    Section::Result => parsed.result.get_mut(key),
                    Section::Failure => parsed.run_failure.as_mut(),
                };
                if let Some(value) = target {
                    value.push('\n');
                    value.push_str(line);
                }
            }
        }
        parsed
    }

    fn apply_status(&mut self, code: i32, status: BTreeMap<String, String>) {
        let (Some(class_name), Some(test_name)) = (status.get("class"), status.get("test")) else {
            return;
        };
        let id = test_id(class_name, test_name);
        if let Some(screenshot) = status
            .get(SCREENSHOT_STATUS_KEY)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
        {
            self.screenshots.push((screenshot.to_string(), id.clone()));
        }

        if code == 1 {
            self.tests.push(TestCaseResult {
                class_name: class_name.clone(),
                test_name: test_name.clone(),
                status: TestStatus::Incomplete,
                stack: None,
            });
            return;
        }
        let Some(result_status) = TestStatus::from_code(code) else {
            return;
        };
        let stack = status
            .get("stack")
            .map(|value| value.trim_end().to_string())
            .filter(|value| !value.is_empty());
        let started = self
            .tests
            .iter_mut()
            .rev()
            .find(|test| test.status == TestStatus::Incomplete && test.id() == id);
        match started {
            Some(test) => {
                test.status = result_status;
                test.stack = stack;
            }
            None => self.tests.push(TestCaseResult {
                class_name: class_name.clone(),
                test_name: test_name.clone(),
                status: result_status,
                stack,
            }),
        }
    }

    /// The runner process died: the result bundle says so, or the output ended
    /// without the final `INSTRUMENTATION_CODE` line.
    pub fn process_crashed(&self) -> bool {
        let crash_reported = self
            .result
            .get("shortMsg")
            .map(|msg| msg.contains(PROCESS_CRASHED_MSG))
            .unwrap_or(false);
        crash_reported || (self.run_code.is_none() && self.run_failure.is_none())
    }

    pub fn crash_message(&self) -> String {
        self.result
            .get("longMsg")
            .or_else(|| self.result.get("shortMsg"))
            .cloned()
            .unwrap_or_else(|| "instrumentation output ended without a result code".to_string())
    }

    pub fn completed_successfully(&self) -> bool {
        self.run_failure.is_none()
            && self.run_code == Some(RUN_CODE_OK)
            && !self.tests.iter().any(|test| test.status.is_failure())
    }

    pub fn failure_summary(&self) -> String {
        if let Some(failure) = &self.run_failure {
            return format!("instrumentation failed: {}", failure.lines().next().unwrap_or(""));
        }
        let failed = self
            .tests
            .iter()
            .filter(|test| test.status.is_failure())
            .map(TestCaseResult::id)
            .collect::<Vec<_>>();
        if failed.is_empty() {
            format!("instrumentation finished with code {:?}", self.run_code)
        } else {
            format!("{} failing test(s): {}", failed.len(), failed.join(", "))
        }
    }

    pub fn counts(&self) -> TestCounts {
        TestCounts::from_tests(&self.tests)
    }
}

fn split_entry(rest: &str) -> (String, String) {
    match rest.split_once('=') {
        Some((key, value)) => (key.trim().to_string(), value.to_string()),
        None => (rest.trim().to_string(), String::new()),
    }
}
