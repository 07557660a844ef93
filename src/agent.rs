//! # Agent Session Engine
//!
//! Runs one Claude CLI invocation per conversation turn and exposes its
//! `stream-json` output as an ordered stream of [`AgentEvent`]s.
//!
//! ## Invocation
//!
//! ```text
//! script -q -e -f -c "claude -p \"$(cat /tmp/kiln-prompt-XXXX.txt)\" \
//!     [--resume <token>] [--tools Read,Glob,...] \
//!     --output-format stream-json --verbose --dangerously-skip-permissions" /dev/null
//! ```
//!
//! - The prompt travels through a private temp file so arbitrary text never
//!   has to survive shell escaping. The file is owned by the session task and
//!   removed when the task ends, whatever the outcome.
//! - `script` gives the CLI a pseudo-terminal so output arrives line by line
//!   instead of in 4K blocks.
//! - Live sessions are registered by session id so a different request can
//!   cancel them.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::process::{isolate_process_group, shell_quote, terminate_child};
use crate::protocol::{parse_line, AgentEvent, LineBuffer, ParsedLine};

/// Non-mutating tools allowed in ask mode
pub const ASK_MODE_TOOLS: &[&str] = &["Read", "Glob", "Grep", "LS", "WebFetch", "WebSearch"];

const PERMISSION_BYPASS_FLAG: &str = "--dangerously-skip-permissions";

/// Stderr lines kept for error reports
const STDERR_TAIL: usize = 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    /// Read-only: the agent may inspect but not modify the project
    Ask,
    #[default]
    Build,
}

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub project_dir: PathBuf,
    pub prompt: String,
    /// Our id for this turn, used for cancellation
    pub session_id: String,
    /// External session to continue, if any
    pub resume_token: Option<String>,
    pub mode: ChatMode,
}

pub type EventStream = Pin<Box<dyn Stream<Item = AgentEvent> + Send>>;

/// Something that can run an agent turn. The CLI is the only production
/// implementation; tests script their own.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Start a turn. The stream ends after the last event; a failed turn
    /// ends with [`AgentEvent::Error`].
    async fn invoke(&self, req: InvokeRequest) -> Result<EventStream, AgentError>;

    /// Terminate a live session. Returns false if it is not running.
    fn cancel(&self, session_id: &str) -> bool;

    fn is_running(&self, session_id: &str) -> bool;
}

/// Drives the Claude CLI.
pub struct ClaudeCli {
    config: AgentConfig,
    live: Arc<DashMap<String, oneshot::Sender<()>>>,
    temp_dir: Option<PathBuf>,
}

impl ClaudeCli {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            live: Arc::new(DashMap::new()),
            temp_dir: None,
        }
    }

    /// Write prompt files under `dir` instead of the system temp dir.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Shell command line for one invocation.
    pub fn shell_command(&self, prompt_file: &Path, resume_token: Option<&str>, mode: ChatMode) -> String {
        let mut parts = vec![
            shell_quote(&self.config.cli),
            "-p".to_string(),
            format!("\"$(cat {})\"", shell_quote(&prompt_file.to_string_lossy())),
        ];
        if let Some(token) = resume_token {
            parts.push("--resume".to_string());
            parts.push(shell_quote(token));
        }
        if mode == ChatMode::Ask {
            parts.push("--tools".to_string());
            parts.push(shell_quote(&ASK_MODE_TOOLS.join(",")));
        }
        parts.extend([
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            PERMISSION_BYPASS_FLAG.to_string(),
        ]);
        parts.join(" ")
    }

    fn build_command(&self, shell: &str, cwd: &Path) -> Command {
        let mut cmd = if self.config.pty_wrapper {
            let mut c = Command::new("script");
            if cfg!(target_os = "macos") {
                c.args(["-q", "/dev/null", "sh", "-c", shell]);
            } else {
                c.args(["-q", "-e", "-f", "-c", shell, "/dev/null"]);
            }
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", shell]);
            c
        };
        cmd.current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        isolate_process_group(&mut cmd);
        cmd
    }

    fn write_prompt(&self, prompt: &str) -> Result<tempfile::NamedTempFile, AgentError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("kiln-prompt-").suffix(".txt");
        let mut file = match &self.temp_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(prompt.as_bytes())?;
        file.flush()?;
        Ok(file)
    }
}

#[async_trait]
impl AgentRunner for ClaudeCli {
    async fn invoke(&self, req: InvokeRequest) -> Result<EventStream, AgentError> {
        if !req.project_dir.is_dir() {
            return Err(AgentError::InvalidProject(req.project_dir));
        }

        let prompt_file = self.write_prompt(&req.prompt)?;
        let shell = self.shell_command(prompt_file.path(), req.resume_token.as_deref(), req.mode);
        debug!("Agent command for {}: {}", req.session_id, shell);

        // prompt_file drops (and is deleted) on this error path
        let mut child = self
            .build_command(&shell, &req.project_dir)
            .spawn()
            .map_err(|e| AgentError::Spawn(format!("{}: {}", self.config.cli, e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Spawn("stdout not captured".to_string()))?;

        let stderr_tail = Arc::new(Mutex::new(Vec::new()));
        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            let sid = req.session_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[agent {} stderr] {}", sid, line);
                    let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                    if tail.len() == STDERR_TAIL {
                        tail.remove(0);
                    }
                    tail.push(line);
                }
            });
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.live.insert(req.session_id.clone(), cancel_tx);
        info!(
            "Agent session {} started (pid {:?}, resume: {}, mode: {:?})",
            req.session_id,
            child.id(),
            req.resume_token.is_some(),
            req.mode
        );

        let (tx, rx) = mpsc::channel(256);
        let session = RunningSession {
            session_id: req.session_id,
            child,
            stdout,
            stderr_tail,
            prompt_file,
            cancel_rx,
            tx,
            live: self.live.clone(),
            grace: self.config.kill_grace,
        };
        tokio::spawn(session.run());

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    fn cancel(&self, session_id: &str) -> bool {
        match self.live.remove(session_id) {
            Some((_, cancel_tx)) => {
                info!("Cancelling agent session {}", session_id);
                // The session may have exited between remove and send
                cancel_tx.send(()).is_ok()
            }
            None => false,
        }
    }

    fn is_running(&self, session_id: &str) -> bool {
        self.live.contains_key(session_id)
    }
}

/// State owned by the task driving one CLI process.
struct RunningSession {
    session_id: String,
    child: Child,
    stdout: ChildStdout,
    stderr_tail: Arc<Mutex<Vec<String>>>,
    prompt_file: tempfile::NamedTempFile,
    cancel_rx: oneshot::Receiver<()>,
    tx: mpsc::Sender<AgentEvent>,
    live: Arc<DashMap<String, oneshot::Sender<()>>>,
    grace: Duration,
}

impl RunningSession {
    async fn run(mut self) {
        let mut buffer = LineBuffer::new();
        let mut chunk = [0u8; 8192];
        let mut cancelled = false;
        let mut consumer_gone = false;

        loop {
            tokio::select! {
                read = self.stdout.read(&mut chunk) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        for line in buffer.push(&chunk[..n]) {
                            if !self.emit_line(&line).await {
                                consumer_gone = true;
                            }
                        }
                        if consumer_gone {
                            warn!("Agent session {} has no consumer, stopping", self.session_id);
                            terminate_child(&mut self.child, self.grace).await;
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Agent session {} stdout read failed: {}", self.session_id, e);
                        break;
                    }
                },
                _ = &mut self.cancel_rx => {
                    cancelled = true;
                    terminate_child(&mut self.child, self.grace).await;
                    break;
                }
            }
        }

        if let Some(rest) = buffer.finish() {
            match parse_line(&rest) {
                ParsedLine::Events(events) => {
                    for event in events {
                        let _ = self.tx.send(event).await;
                    }
                }
                other => debug!("Discarding trailing partial line: {:?}", other),
            }
        }

        let outcome = if cancelled {
            Err("Agent session cancelled".to_string())
        } else {
            tokio::select! {
                status = self.child.wait() => match status {
                    Ok(s) if s.success() => Ok(()),
                    Ok(s) => Err(self.exit_message(s.code())),
                    Err(e) => Err(format!("Failed waiting for agent process: {}", e)),
                },
                _ = &mut self.cancel_rx => {
                    terminate_child(&mut self.child, self.grace).await;
                    Err("Agent session cancelled".to_string())
                }
            }
        };

        self.live.remove(&self.session_id);

        match outcome {
            Ok(()) => info!("Agent session {} completed", self.session_id),
            Err(message) => {
                warn!("Agent session {} failed: {}", self.session_id, message);
                let _ = self.tx.send(AgentEvent::Error { message }).await;
            }
        }

        debug!("Removing prompt file {}", self.prompt_file.path().display());
        drop(self.prompt_file);
    }

    /// Forward the events of one line. Returns false once nobody listens.
    async fn emit_line(&self, line: &str) -> bool {
        match parse_line(line) {
            ParsedLine::Events(events) => {
                for event in events {
                    if self.tx.send(event).await.is_err() {
                        return false;
                    }
                }
            }
            ParsedLine::Unrecognized(kind) => debug!("Skipping {} record", kind),
            ParsedLine::Malformed(reason) => warn!("Skipping unparseable agent output: {}", reason),
            ParsedLine::Blank => {}
        }
        true
    }

    fn exit_message(&self, code: Option<i32>) -> String {
        let code = code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string());
        let tail = self.stderr_tail.lock().unwrap_or_else(|e| e.into_inner());
        if tail.is_empty() {
            format!("Claude CLI exited with code {}", code)
        } else {
            format!("Claude CLI exited with code {}: {}", code, tail.join("\n"))
        }
    }
}
