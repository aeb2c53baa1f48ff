use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::app::adb::paths::sanitize_filename_component;
use crate::app::commands::SCREENSHOTS_DIR_NAME;
use crate::app::device_runner::DeviceRunState;
use crate::app::error::AppError;
use crate::app::instrumentation::{TestCaseResult, TestCounts};

pub const RESULTS_FILE_NAME: &str = "results.json";
pub const REPORT_INDEX_FILE_NAME: &str = "index.html";

/// Contents of `results/<serial>/results.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceResults {
    pub serial: String,
    pub model: Option<String>,
    pub success: bool,
    pub final_state: DeviceRunState,
    pub crashes: u32,
    pub diagnostics: Vec<String>,
    pub counts: TestCounts,
    pub tests: Vec<TestCaseResult>,
    pub finished_at: String,
}

pub fn write_device_results(path: &Path, results: &DeviceResults, trace_id: &str) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| AppError::io(format!("Failed to create {}: {err}", parent.display()), trace_id))?;
    }
    let json = serde_json::to_string_pretty(results)
        .map_err(|err| AppError::system(format!("Failed to serialize results: {err}"), trace_id))?;
    fs::write(path, json).map_err(|err| AppError::io(format!("Failed to write {}: {err}", path.display()), trace_id))
}

/// Reads every device's results file under `results_dir`, ordered by serial.
/// Unreadable files are skipped with a warning.
pub fn read_device_results(results_dir: &Path, trace_id: &str) -> Result<Vec<DeviceResults>, AppError> {
    if !results_dir.exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(results_dir)
        .map_err(|err| AppError::io(format!("Failed to read {}: {err}", results_dir.display()), trace_id))?;
    let mut all = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path().join(RESULTS_FILE_NAME);
        if !path.is_file() {
            continue;
        }
        let parsed = fs::read_to_string(&path)
            .map_err(|err| err.to_string())
            .and_then(|raw| serde_json::from_str::<DeviceResults>(&raw).map_err(|err| err.to_string()));
        match parsed {
            Ok(results) => all.push(results),
            Err(err) => warn!(trace_id = %trace_id, path = %path.display(), error = %err, "skipping results file"),
        }
    }
    all.sort_by(|a, b| a.serial.cmp(&b.serial));
    Ok(all)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportArtifact {
    pub index_path: PathBuf,
}

impl ReportArtifact {
    pub fn url(&self) -> String {
        clickable_file_url(&self.index_path)
    }
}

pub trait ReportRenderer: Send + Sync {
    /// `screenshots` maps screenshot file names to the id of the test that took them.
    fn generate(
        &self,
        results_dir: &Path,
        reports_dir: &Path,
        screenshots: &HashMap<String, String>,
        trace_id: &str,
    ) -> Result<ReportArtifact, AppError>;
}

#[derive(Debug, Clone, Default)]
pub struct HtmlReportRenderer;

impl ReportRenderer for HtmlReportRenderer {
    fn generate(
        &self,
        results_dir: &Path,
        reports_dir: &Path,
        screenshots: &HashMap<String, String>,
        trace_id: &str,
    ) -> Result<ReportArtifact, AppError> {
        let devices = read_device_results(results_dir, trace_id)?;
        let html = render_report_html(&devices, results_dir, screenshots);
        fs::create_dir_all(reports_dir)
            .map_err(|err| AppError::io(format!("Failed to create {}: {err}", reports_dir.display()), trace_id))?;
        let index_path = reports_dir.join(REPORT_INDEX_FILE_NAME);
        fs::write(&index_path, html)
            .map_err(|err| AppError::io(format!("Failed to write {}: {err}", index_path.display()), trace_id))?;
        info!(trace_id = %trace_id, devices = devices.len(), path = %index_path.display(), "report generated");
        Ok(ReportArtifact { index_path })
    }
}

pub fn clickable_file_url(path: &Path) -> String {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|dir| dir.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let display = absolute.to_string_lossy().replace('\\', "/").replace(' ', "%20");
    if display.starts_with('/') {
        format!("file://{display}")
    } else {
        format!("file:///{display}")
    }
}

fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

fn screenshots_by_test(screenshots: &HashMap<String, String>) -> HashMap<&str, Vec<&str>> {
    let mut by_test: HashMap<&str, Vec<&str>> = HashMap::new();
    for (screenshot, test_id) in screenshots {
        by_test.entry(test_id.as_str()).or_default().push(screenshot.as_str());
    }
    for shots in by_test.values_mut() {
        shots.sort_unstable();
    }
    by_test
}

pub fn render_report_html(
    devices: &[DeviceResults],
    results_dir: &Path,
    screenshots: &HashMap<String, String>,
) -> String {
    let mut totals = TestCounts::default();
    for device in devices {
        totals.add(&device.counts);
    }
    let failed_devices = devices.iter().filter(|device| !device.success).count();
    let by_test = screenshots_by_test(screenshots);

    let mut output = String::new();
    output.push_str("<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">");
    output.push_str("<title>Instrumentation test report</title>");
    output.push_str(
        "<style>body{font-family:sans-serif;margin:24px}table{border-collapse:collapse;width:100%}\
td,th{border:1px solid #ddd;padding:4px 8px;text-align:left}\
.passed{color:#1b7f3b}.failed,.error{color:#b3261e}.ignored,.assumption_failed{color:#7a7a7a}\
.incomplete{color:#c77700}pre{white-space:pre-wrap;margin:0}</style>",
    );
    output.push_str("</head><body>\n<h1>Instrumentation test report</h1>\n");
    output.push_str(&format!(
        "<p class=\"summary\">{} device(s), {} failed. {} test(s): {} passed, {} failed, {} ignored.</p>\n",
        devices.len(),
        failed_devices,
        totals.total,
        totals.passed,
        totals.failed,
        totals.ignored
    ));
    output.push_str(&format!(
        "<p class=\"generated\">Generated {}</p>\n",
        escape_html(&Utc::now().to_rfc3339())
    ));

    for device in devices {
        let title = match &device.model {
            Some(model) => format!("{} ({model})", device.serial),
            None => device.serial.clone(),
        };
        let status = if device.success { "passed" } else { "failed" };
        output.push_str(&format!(
            "<section class=\"device\">\n<h2>{} <span class=\"{status}\">{status}</span></h2>\n",
            escape_html(&title)
        ));
        if device.crashes > 0 {
            output.push_str(&format!("<p>Test process crashed {} time(s).</p>\n", device.crashes));
        }
        if !device.diagnostics.is_empty() {
            output.push_str("<ul class=\"diagnostics\">\n");
            for line in &device.diagnostics {
                output.push_str(&format!("<li>{}</li>\n", escape_html(line)));
            }
            output.push_str("</ul>\n");
        }

        output.push_str("<table>\n<tr><th>Test</th><th>Status</th><th>Details</th></tr>\n");
        let shots_dir = results_dir
            .join(sanitize_filename_component(&device.serial))
            .join(SCREENSHOTS_DIR_NAME);
        for test in &device.tests {
            let id = test.id();
            let status = test.status.as_str();
            output.push_str(&format!(
                "<tr><td>{}</td><td class=\"{status}\">{status}</td><td>",
                escape_html(&id)
            ));
            if let Some(stack) = &test.stack {
                output.push_str(&format!("<pre>{}</pre>", escape_html(stack)));
            }
            if let Some(shots) = by_test.get(id.as_str()) {
                for shot in shots {
                    output.push_str(&format!(
                        "<a class=\"screenshot\" href=\"{}\">{}</a> ",
                        escape_html(&clickable_file_url(&shots_dir.join(shot))),
                        escape_html(shot)
                    ));
                }
            }
            output.push_str("</td></tr>\n");
        }
        output.push_str("</table>\n</section>\n");
    }
    output.push_str("</body></html>\n");
    output
}
