//! Error types for each component.
//!
//! Line-level parse failures are deliberately absent: malformed agent
//! output is logged and skipped, never surfaced.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Project not found: {0}")]
    NotFound(String),

    #[error("Invalid project: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum AgentError {
    /// Project directory is missing; nothing was spawned.
    #[error("Invalid project directory: {}", .0.display())]
    InvalidProject(PathBuf),

    #[error("Failed to spawn agent CLI: {0}")]
    Spawn(String),

    #[error("Agent session IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("A response is already streaming for project {0}")]
    ConcurrentStreamRejected(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Agent(#[from] AgentError),
}

#[derive(Error, Debug)]
pub enum PreviewError {
    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("No free port in range {start}-{end}")]
    NoPortAvailable { start: u16, end: u16 },

    #[error("Dependency install failed in {}: {reason}", .dir.display())]
    DependencyInstallError { dir: PathBuf, reason: String },

    #[error("{label} server did not accept connections on port {port} within {}s", .timeout.as_secs())]
    ServerStartTimeout {
        label: String,
        port: u16,
        timeout: Duration,
    },

    #[error("{label} server exited before becoming ready ({status}){}", format_output(.output))]
    ProcessExited {
        label: String,
        status: String,
        output: Vec<String>,
    },

    #[error("Failed to spawn {label} server: {reason}")]
    Spawn { label: String, reason: String },

    #[error("Backend failed: {0}")]
    Backend(Box<PreviewError>),

    /// A stop arrived while the start was still in progress.
    #[error("Preview start for {0} was cancelled")]
    StartCancelled(String),
}

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Cannot watch {}: directory does not exist", .0.display())]
    MissingRoot(PathBuf),

    #[error("File watcher error: {0}")]
    Notify(#[from] notify::Error),
}

#[derive(Error, Debug)]
pub enum TestError {
    #[error("Test run exceeded {}s and was killed", .0.as_secs())]
    TestTimeout(Duration),

    #[error("Test execution failed: {0}")]
    TestExecutionError(String),

    #[error("Test IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_output(lines: &[String]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!(": {}", lines.join(" | "))
    }
}
