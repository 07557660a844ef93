//! Runtime configuration.
//!
//! Everything is read from the environment once at startup; the listener
//! ports can additionally be overridden from the command line.

use std::path::PathBuf;
use std::time::Duration;

/// Default UI port (static assets)
pub const DEFAULT_UI_PORT: u16 = 4850;
/// Default API port (REST + SSE)
pub const DEFAULT_API_PORT: u16 = 4851;

/// Number of prior turns replayed into a fresh agent session
pub const HISTORY_TURNS: usize = 10;
/// Per-turn character cap when replaying history
pub const HISTORY_CHAR_CAP: usize = 500;

#[derive(Debug, Clone)]
pub struct Config {
    pub ui_port: u16,
    pub api_port: u16,
    /// Root for project records and transcripts: ~/.kiln
    pub data_dir: PathBuf,
    /// Parent directory for newly created projects: ~/kiln-projects
    pub projects_dir: PathBuf,
    /// Static web UI served on the UI port
    pub static_dir: PathBuf,
    pub agent: AgentConfig,
    pub preview: PreviewConfig,
    pub watch_debounce: Duration,
    pub test_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// AI CLI binary name or path
    pub cli: String,
    /// Run the CLI under `script` so it sees a terminal and flushes per line
    pub pty_wrapper: bool,
    /// Grace period between SIGTERM and SIGKILL on cancel
    pub kill_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct PreviewConfig {
    /// Package manager used for installs and `run dev`
    pub npm: String,
    /// Python interpreter for FastAPI backends
    pub python: String,
    pub port_start: u16,
    pub port_end: u16,
    pub install_timeout: Duration,
    pub start_timeout: Duration,
    pub kill_grace: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cli: "claude".to_string(),
            pty_wrapper: true,
            kill_grace: Duration::from_secs(5),
        }
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            npm: "npm".to_string(),
            python: "python3".to_string(),
            port_start: 5200,
            port_end: 5299,
            install_timeout: Duration::from_secs(60),
            start_timeout: Duration::from_secs(30),
            kill_grace: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Build configuration from `KILN_*` environment variables.
    pub fn from_env() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));

        let data_dir = env_path("KILN_DATA_DIR").unwrap_or_else(|| home.join(".kiln"));
        let projects_dir =
            env_path("KILN_PROJECTS_DIR").unwrap_or_else(|| home.join("kiln-projects"));
        let static_dir = env_path("KILN_STATIC_DIR").unwrap_or_else(|| PathBuf::from("static"));

        let mut agent = AgentConfig::default();
        if let Ok(cli) = std::env::var("KILN_CLAUDE_CLI") {
            if !cli.trim().is_empty() {
                agent.cli = cli;
            }
        }
        if let Ok(flag) = std::env::var("KILN_PTY_WRAPPER") {
            agent.pty_wrapper = !matches!(flag.as_str(), "0" | "false" | "off");
        }

        let mut preview = PreviewConfig::default();
        if let Ok(npm) = std::env::var("KILN_NPM") {
            if !npm.trim().is_empty() {
                preview.npm = npm;
            }
        }
        if let Ok(python) = std::env::var("KILN_PYTHON") {
            if !python.trim().is_empty() {
                preview.python = python;
            }
        }
        if let Some(start) = env_parse::<u16>("KILN_PREVIEW_PORT_START") {
            preview.port_start = start;
        }
        if let Some(end) = env_parse::<u16>("KILN_PREVIEW_PORT_END") {
            preview.port_end = end;
        }
        if preview.port_end < preview.port_start {
            tracing::warn!(
                "Preview port range {}-{} is empty, falling back to defaults",
                preview.port_start,
                preview.port_end
            );
            let defaults = PreviewConfig::default();
            preview.port_start = defaults.port_start;
            preview.port_end = defaults.port_end;
        }

        Self {
            ui_port: env_parse("PORT").unwrap_or(DEFAULT_UI_PORT),
            api_port: env_parse("KILN_API_PORT").unwrap_or(DEFAULT_API_PORT),
            data_dir,
            projects_dir,
            static_dir,
            agent,
            preview,
            watch_debounce: Duration::from_millis(300),
            test_timeout: Duration::from_secs(60),
        }
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
