//! Scripted browser tests against a running preview.
//!
//! A scenario is a list of declarative steps. It is rendered into a
//! Playwright (Node) script that runs the steps in order and prints:
//!
//! ```text
//! STEP_PASSED:<i>
//! STEP_FAILED:<i>:<message>
//! ALL_STEPS_PASSED
//! ```
//!
//! The markers in stdout are the only channel back; exit codes are only
//! used to tell a crash from a clean run.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::TestError;
use crate::process::{run_with_timeout, tool_available, RunError};

/// Results kept per project
const MAX_RESULTS: usize = 20;
const DEFAULT_WAIT_MS: u64 = 5000;
const SCREENSHOT_DIR: &str = "test-screenshots";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum TestStep {
    Navigate {
        url: String,
    },
    Click {
        selector: String,
    },
    Fill {
        selector: String,
        value: String,
    },
    WaitFor {
        selector: String,
        /// Milliseconds
        #[serde(default)]
        timeout: Option<u64>,
    },
    Screenshot {
        name: String,
    },
    /// Passes when the selector is visible
    Assert {
        selector: String,
    },
}

impl TestStep {
    fn describe(&self) -> String {
        match self {
            TestStep::Navigate { url } => format!("navigate {}", url),
            TestStep::Click { selector } => format!("click {}", selector),
            TestStep::Fill { selector, .. } => format!("fill {}", selector),
            TestStep::WaitFor { selector, .. } => format!("wait for {}", selector),
            TestStep::Screenshot { name } => format!("screenshot {}", name),
            TestStep::Assert { selector } => format!("assert visible {}", selector),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestScenario {
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<TestStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub index: usize,
    pub description: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Passed,
    Failed,
    /// The run itself broke: timeout or runner failure
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub status: RunStatus,
    pub steps: Vec<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Render the Playwright program for `steps`.
pub fn generate_script(base_url: &str, steps: &[TestStep]) -> String {
    let mut body = String::new();
    for (i, step) in steps.iter().enumerate() {
        body.push_str(&format!("    current = {};\n", i));
        body.push_str(&format!("    {}\n", step_code(step)));
        body.push_str(&format!("    console.log('STEP_PASSED:{}');\n", i));
    }

    format!(
        r#"const {{ chromium }} = require('playwright');
const fs = require('fs');

(async () => {{
  const baseUrl = {base};
  fs.mkdirSync({shots}, {{ recursive: true }});
  const browser = await chromium.launch({{ headless: true }});
  const page = await browser.newPage();
  let current = -1;
  try {{
{body}    console.log('ALL_STEPS_PASSED');
  }} catch (err) {{
    const message = String((err && err.message) || err).split('\n')[0];
    console.log('STEP_FAILED:' + current + ':' + message);
    process.exitCode = 1;
  }} finally {{
    await browser.close();
  }}
}})();
"#,
        base = js(base_url),
        shots = js(SCREENSHOT_DIR),
        body = body,
    )
}

fn step_code(step: &TestStep) -> String {
    match step {
        TestStep::Navigate { url } => {
            format!("await page.goto(new URL({}, baseUrl).toString());", js(url))
        }
        TestStep::Click { selector } => format!("await page.click({});", js(selector)),
        TestStep::Fill { selector, value } => {
            format!("await page.fill({}, {});", js(selector), js(value))
        }
        TestStep::WaitFor { selector, timeout } => format!(
            "await page.waitForSelector({}, {{ timeout: {} }});",
            js(selector),
            timeout.unwrap_or(DEFAULT_WAIT_MS)
        ),
        TestStep::Screenshot { name } => {
            let file = format!("{}/{}.png", SCREENSHOT_DIR, sanitize_name(name));
            format!("await page.screenshot({{ path: {} }});", js(&file))
        }
        TestStep::Assert { selector } => format!(
            "await page.locator({}).first().waitFor({{ state: 'visible', timeout: {} }});",
            js(selector),
            DEFAULT_WAIT_MS
        ),
    }
}

/// A JSON string literal is a valid JS string literal.
fn js(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "screenshot".to_string()
    } else {
        cleaned
    }
}

/// Build per-step results from runner output. Every step gets a result:
/// steps after the first failure are skipped, and a run that stopped
/// without a failure marker fails at the first unconfirmed step.
pub fn parse_results(stdout: &str, steps: &[TestStep]) -> (Vec<StepResult>, RunStatus) {
    parse_markers(stdout, steps, "Step did not report a result")
}

/// `unreported` explains the first unconfirmed step when no failure
/// marker names one.
fn parse_markers(stdout: &str, steps: &[TestStep], unreported: &str) -> (Vec<StepResult>, RunStatus) {
    let mut passed = vec![false; steps.len()];
    let mut failure: Option<(usize, String)> = None;
    let mut all_passed = false;

    for line in stdout.lines().map(str::trim) {
        if line == "ALL_STEPS_PASSED" {
            all_passed = true;
        } else if let Some(rest) = line.strip_prefix("STEP_PASSED:") {
            if let Some(flag) = rest.parse::<usize>().ok().and_then(|i| passed.get_mut(i)) {
                *flag = true;
            }
        } else if let Some(rest) = line.strip_prefix("STEP_FAILED:") {
            let (index, message) = rest.split_once(':').unwrap_or((rest, ""));
            if failure.is_none() {
                let index = index.parse::<usize>().unwrap_or(0);
                failure = Some((index, message.to_string()));
            }
        }
    }

    let failed_at = match &failure {
        Some((i, _)) => Some(*i),
        None => passed.iter().position(|p| !p),
    };

    let results: Vec<StepResult> = steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let (status, error) = match failed_at {
                Some(f) if i == f => {
                    let message = match &failure {
                        Some((_, m)) if !m.is_empty() => m.clone(),
                        _ => unreported.to_string(),
                    };
                    (StepStatus::Failed, Some(message))
                }
                Some(f) if i > f => (StepStatus::Skipped, None),
                _ if passed[i] => (StepStatus::Passed, None),
                _ => (StepStatus::Skipped, None),
            };
            StepResult {
                index: i,
                description: step.describe(),
                status,
                error,
            }
        })
        .collect();

    let ok = all_passed && failure.is_none() && results.iter().all(|r| r.status == StepStatus::Passed);
    (results, if ok { RunStatus::Passed } else { RunStatus::Failed })
}

/// Runner stdout, and whether the run was cut short.
enum Execution {
    Finished(String),
    TimedOut(String),
}

pub struct TestDriver {
    timeout: Duration,
    npx: String,
    node: String,
    results: DashMap<String, VecDeque<TestResult>>,
}

impl TestDriver {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            npx: "npx".to_string(),
            node: "node".to_string(),
            results: DashMap::new(),
        }
    }

    #[cfg(test)]
    fn with_runners(mut self, npx: &str, node: &str) -> Self {
        self.npx = npx.to_string();
        self.node = node.to_string();
        self
    }

    /// Run `scenario` against `base_url`. The script is written into
    /// `work_dir` (so it resolves that project's `playwright`) and removed
    /// afterwards. Every run is recorded, including failed ones.
    pub async fn run(
        &self,
        project_id: &str,
        work_dir: &Path,
        base_url: &str,
        scenario: TestScenario,
    ) -> Result<TestResult, TestError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let name = scenario
            .name
            .clone()
            .unwrap_or_else(|| format!("{} steps", scenario.steps.len()));
        info!("Running test '{}' for {} against {}", name, project_id, base_url);

        let outcome = self.execute(work_dir, base_url, &scenario.steps).await;

        let mut result = TestResult {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            name,
            status: RunStatus::Error,
            steps: Vec::new(),
            error: None,
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
        };
        let outcome = match outcome {
            Ok(Execution::Finished(stdout)) => {
                let (steps, status) = parse_results(&stdout, &scenario.steps);
                result.steps = steps;
                result.status = status;
                Ok(())
            }
            Ok(Execution::TimedOut(stdout)) => {
                // Steps that reported before the kill keep their result
                let hung = format!("Step timed out after {:?}", self.timeout);
                let (steps, _) = parse_markers(&stdout, &scenario.steps, &hung);
                result.steps = steps;
                let err = TestError::TestTimeout(self.timeout);
                result.error = Some(err.to_string());
                Err(err)
            }
            Err(e) => {
                result.steps = scenario
                    .steps
                    .iter()
                    .enumerate()
                    .map(|(index, step)| StepResult {
                        index,
                        description: step.describe(),
                        status: StepStatus::Skipped,
                        error: None,
                    })
                    .collect();
                result.error = Some(e.to_string());
                Err(e)
            }
        };
        info!("Test '{}' for {}: {:?}", result.name, project_id, result.status);
        self.record(result.clone());

        outcome.map(|()| result)
    }

    /// Most recent first.
    pub fn results(&self, project_id: &str) -> Vec<TestResult> {
        self.results
            .get(project_id)
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn record(&self, result: TestResult) {
        let mut list = self.results.entry(result.project_id.clone()).or_default();
        list.push_front(result);
        list.truncate(MAX_RESULTS);
    }

    async fn execute(&self, work_dir: &Path, base_url: &str, steps: &[TestStep]) -> Result<Execution, TestError> {
        let mut script = tempfile::Builder::new()
            .prefix(".kiln-test-")
            .suffix(".cjs")
            .tempfile_in(work_dir)?;
        script.write_all(generate_script(base_url, steps).as_bytes())?;
        script.flush()?;

        let mut cmd = if tool_available(&self.npx).await {
            let mut c = Command::new(&self.npx);
            c.args(["--yes", "-p", "playwright", "node"]);
            c
        } else {
            warn!("{} not available, running test script with {}", self.npx, self.node);
            Command::new(&self.node)
        };
        cmd.arg(script.path()).current_dir(work_dir);

        // `script` is dropped (and deleted) on every return below
        let output = match run_with_timeout(cmd, self.timeout).await {
            Ok(output) => output,
            Err(RunError::Timeout { stdout, .. }) => {
                warn!("Test runner killed after {:?}", self.timeout);
                return Ok(Execution::TimedOut(String::from_utf8_lossy(&stdout).into_owned()));
            }
            Err(RunError::Io(e)) => return Err(TestError::TestExecutionError(e.to_string())),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let has_markers = stdout.contains("STEP_PASSED:") || stdout.contains("STEP_FAILED:") || stdout.contains("ALL_STEPS_PASSED");
        if !output.status.success() && !has_markers {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("no output");
            return Err(TestError::TestExecutionError(format!("{}: {}", output.status, detail.trim())));
        }
        Ok(Execution::Finished(stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps() -> Vec<TestStep> {
        vec![
            TestStep::Navigate { url: "/".to_string() },
            TestStep::Fill {
                selector: "#name".to_string(),
                value: "it's \"quoted\"".to_string(),
            },
            TestStep::Click {
                selector: "button[type=submit]".to_string(),
            },
            TestStep::Assert {
                selector: ".done".to_string(),
            },
        ]
    }

    #[test]
    fn steps_deserialize_from_action_tag() {
        let scenario: TestScenario = serde_json::from_str(
            r##"{"name":"smoke","steps":[
                {"action":"navigate","url":"/about"},
                {"action":"waitFor","selector":"#app","timeout":2000},
                {"action":"screenshot","name":"home page"}
            ]}"##,
        )
        .unwrap();
        assert_eq!(scenario.steps.len(), 3);
        assert_eq!(
            scenario.steps[1],
            TestStep::WaitFor {
                selector: "#app".to_string(),
                timeout: Some(2000)
            }
        );
    }

    #[test]
    fn script_runs_steps_in_order_with_markers() {
        let script = generate_script("http://localhost:5200", &steps());
        assert!(script.contains("require('playwright')"));
        assert!(script.contains(r#"const baseUrl = "http://localhost:5200";"#));
        assert!(script.contains(r##"await page.fill("#name", "it's \"quoted\"");"##));
        let first = script.find("STEP_PASSED:0").unwrap();
        let last = script.find("STEP_PASSED:3").unwrap();
        assert!(first < last);
        assert!(last < script.find("ALL_STEPS_PASSED").unwrap());
        assert!(script.contains("'STEP_FAILED:' + current"));
    }

    #[test]
    fn screenshot_names_are_sanitized() {
        let code = step_code(&TestStep::Screenshot {
            name: "../home page".to_string(),
        });
        assert!(code.contains("test-screenshots/___home_page.png"));
    }

    #[test]
    fn full_pass_requires_every_marker() {
        let out = "STEP_PASSED:0\nSTEP_PASSED:1\nSTEP_PASSED:2\nSTEP_PASSED:3\nALL_STEPS_PASSED\n";
        let (results, status) = parse_results(out, &steps());
        assert_eq!(status, RunStatus::Passed);
        assert!(results.iter().all(|r| r.status == StepStatus::Passed));
    }

    #[test]
    fn failure_marks_rest_skipped() {
        let out = "STEP_PASSED:0\nSTEP_FAILED:1:Timeout 5000ms exceeded: waiting for #name\n";
        let (results, status) = parse_results(out, &steps());
        assert_eq!(status, RunStatus::Failed);
        let statuses: Vec<StepStatus> = results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![StepStatus::Passed, StepStatus::Failed, StepStatus::Skipped, StepStatus::Skipped]
        );
        assert_eq!(
            results[1].error.as_deref(),
            Some("Timeout 5000ms exceeded: waiting for #name")
        );
    }

    #[test]
    fn silent_stop_fails_first_unconfirmed_step() {
        let (results, status) = parse_results("STEP_PASSED:0\n", &steps());
        assert_eq!(status, RunStatus::Failed);
        assert_eq!(results[1].status, StepStatus::Failed);
        assert_eq!(results[1].error.as_deref(), Some("Step did not report a result"));
        assert_eq!(results[3].status, StepStatus::Skipped);
    }

    #[cfg(unix)]
    fn fake_node(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-node");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    #[cfg(unix)]
    fn leftover_scripts(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(".kiln-test-"))
            .count()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn falls_back_to_node_and_records_result() {
        let dir = tempfile::tempdir().unwrap();
        let node = fake_node(
            dir.path(),
            r#"grep -q "ALL_STEPS_PASSED" "$1" || exit 9
echo STEP_PASSED:0
echo STEP_FAILED:1:locator not found
exit 1"#,
        );
        let driver = TestDriver::new(Duration::from_secs(10)).with_runners("/nonexistent/npx", &node);
        let scenario = TestScenario {
            name: Some("signup".to_string()),
            steps: steps(),
        };

        let result = driver
            .run("p", dir.path(), "http://localhost:5200", scenario)
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.steps[1].status, StepStatus::Failed);
        assert_eq!(result.steps[2].status, StepStatus::Skipped);
        assert_eq!(leftover_scripts(dir.path()), 0);

        let history = driver.results("p");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].name, "signup");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_runner_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let node = fake_node(dir.path(), "sleep 30");
        let driver = TestDriver::new(Duration::from_millis(300)).with_runners("/nonexistent/npx", &node);

        let err = driver
            .run(
                "p",
                dir.path(),
                "http://localhost:5200",
                TestScenario {
                    name: None,
                    steps: steps(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TestError::TestTimeout(_)));
        assert_eq!(leftover_scripts(dir.path()), 0);

        let recorded = &driver.results("p")[0];
        assert_eq!(recorded.status, RunStatus::Error);
        assert!(recorded.error.as_ref().unwrap().contains("killed"));
        assert_eq!(recorded.steps[0].status, StepStatus::Failed);
        assert!(recorded.steps[1..].iter().all(|s| s.status == StepStatus::Skipped));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_pins_the_hung_step_and_keeps_earlier_passes() {
        let dir = tempfile::tempdir().unwrap();
        let node = fake_node(dir.path(), "echo STEP_PASSED:0
echo STEP_PASSED:1
sleep 30");
        let driver = TestDriver::new(Duration::from_millis(800)).with_runners("/nonexistent/npx", &node);

        let err = driver
            .run(
                "p",
                dir.path(),
                "http://localhost:5200",
                TestScenario {
                    name: Some("stuck".to_string()),
                    steps: steps(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TestError::TestTimeout(_)));

        let recorded = &driver.results("p")[0];
        assert_eq!(recorded.status, RunStatus::Error);
        let statuses: Vec<StepStatus> = recorded.steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![StepStatus::Passed, StepStatus::Passed, StepStatus::Failed, StepStatus::Skipped]
        );
        assert!(recorded.steps[2].error.as_ref().unwrap().contains("timed out after 800ms"));
        assert_eq!(leftover_scripts(dir.path()), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn crash_without_markers_is_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let node = fake_node(dir.path(), "echo \"Cannot find module 'playwright'\" >&2\nexit 1");
        let driver = TestDriver::new(Duration::from_secs(10)).with_runners("/nonexistent/npx", &node);

        let err = driver
            .run(
                "p",
                dir.path(),
                "http://localhost:5200",
                TestScenario {
                    name: None,
                    steps: steps(),
                },
            )
            .await
            .unwrap_err();
        match err {
            TestError::TestExecutionError(msg) => assert!(msg.contains("Cannot find module")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn history_is_capped_latest_first() {
        let dir = tempfile::tempdir().unwrap();
        let node = fake_node(dir.path(), "echo STEP_PASSED:0\necho ALL_STEPS_PASSED");
        let driver = TestDriver::new(Duration::from_secs(10)).with_runners("/nonexistent/npx", &node);
        for i in 0..(MAX_RESULTS + 2) {
            let scenario = TestScenario {
                name: Some(format!("run-{}", i)),
                steps: vec![TestStep::Navigate { url: "/".to_string() }],
            };
            let result = driver.run("p", dir.path(), "http://localhost:5200", scenario).await.unwrap();
            assert_eq!(result.status, RunStatus::Passed);
        }
        let history = driver.results("p");
        assert_eq!(history.len(), MAX_RESULTS);
        assert_eq!(history[0].name, format!("run-{}", MAX_RESULTS + 1));
        assert!(driver.results("other").is_empty());
    }
}
