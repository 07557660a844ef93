//! Child process primitives shared by the agent engine, preview manager
//! and test driver.
//!
//! Every child is started in its own process group so that termination
//! reaches the whole tree (`npm run dev` -> vite, `script` -> claude).

use std::collections::VecDeque;
use std::process::{ExitStatus, Output, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lines of output retained per managed process
const OUTPUT_RING_SIZE: usize = 200;

/// A long-running child with line-buffered stdout/stderr capture.
pub struct ManagedProcess {
    label: String,
    child: Child,
    pid: Option<u32>,
    output: Arc<Mutex<VecDeque<String>>>,
}

impl ManagedProcess {
    /// Spawn `command`, capturing both output streams line by line.
    pub fn spawn(label: impl Into<String>, mut command: Command) -> std::io::Result<Self> {
        let label = label.into();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        isolate_process_group(&mut command);

        let mut child = command.spawn()?;
        let pid = child.id();
        let output = Arc::new(Mutex::new(VecDeque::with_capacity(OUTPUT_RING_SIZE)));

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(capture_lines(label.clone(), stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(capture_lines(label.clone(), stderr, output.clone()));
        }

        info!("Started {} (pid {:?})", label, pid);
        Ok(Self {
            label,
            child,
            pid,
            output,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking liveness check. Returns the exit status once exited.
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    #[cfg(test)]
    pub fn is_running(&mut self) -> bool {
        self.exit_status().is_none()
    }

    /// The last `n` captured output lines, oldest first.
    pub fn recent_output(&self, n: usize) -> Vec<String> {
        let buf = self.output.lock().unwrap_or_else(|e| e.into_inner());
        let skip = buf.len().saturating_sub(n);
        buf.iter().skip(skip).cloned().collect()
    }

    #[cfg(test)]
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// SIGTERM the process group, escalating to SIGKILL after `grace`.
    pub async fn terminate(&mut self, grace: Duration) {
        info!("Stopping {} (pid {:?})", self.label, self.pid);
        terminate_child(&mut self.child, grace).await;
    }
}

async fn capture_lines<R>(label: String, reader: R, output: Arc<Mutex<VecDeque<String>>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("[{}] {}", label, line);
        let mut buf = output.lock().unwrap_or_else(|e| e.into_inner());
        if buf.len() == OUTPUT_RING_SIZE {
            buf.pop_front();
        }
        buf.push_back(line);
    }
}

/// Put the child in a new process group whose id equals its pid.
pub fn isolate_process_group(command: &mut Command) {
    #[cfg(unix)]
    command.process_group(0);
    #[cfg(not(unix))]
    let _ = command;
}

/// Gracefully terminate `child` and everything in its process group.
///
/// Sends SIGTERM, waits up to `grace` for the child to exit, then sends
/// SIGKILL and reaps it. Safe to call on an already-exited child.
pub async fn terminate_child(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped
        return;
    };

    signal_group(pid, Signal::Term);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!("pid {} exited after SIGTERM: {}", pid, status),
        Ok(Err(e)) => warn!("Failed waiting for pid {}: {}", pid, e),
        Err(_) => {
            warn!("pid {} ignored SIGTERM for {:?}, killing", pid, grace);
            signal_group(pid, Signal::Kill);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill pid {}: {}", pid, e);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let pid = pid as libc::pid_t;
    // Negative pid addresses the whole group; fall back to the single pid
    // for children that were not started in their own group.
    let rc = unsafe { libc::kill(-pid, sig) };
    if rc != 0 {
        unsafe {
            libc::kill(pid, sig);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: Signal) {}

/// Whether a pid still refers to a live process.
#[cfg(all(test, unix))]
pub fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[derive(Debug)]
pub enum RunError {
    /// Carries whatever the command printed before it was killed.
    Timeout { stdout: Vec<u8>, stderr: Vec<u8> },
    Io(std::io::Error),
}

/// Bound on reading the pipes dry once the child has exited.
const PIPE_DRAIN: Duration = Duration::from_secs(2);

/// Accumulates one output pipe in the background.
struct PipeCollector {
    buf: Arc<Mutex<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl PipeCollector {
    fn start<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let task = pipe.map(|mut pipe| {
            let buf = buf.clone();
            tokio::spawn(async move {
                let mut chunk = [0u8; 4096];
                loop {
                    match pipe.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.lock().unwrap_or_else(|e| e.into_inner()).extend_from_slice(&chunk[..n]),
                    }
                }
            })
        });
        Self { buf, task }
    }

    /// Everything read so far, waiting briefly for the pipe to close.
    async fn finish(self) -> Vec<u8> {
        if let Some(mut task) = self.task {
            if tokio::time::timeout(PIPE_DRAIN, &mut task).await.is_err() {
                // A detached grandchild still holds the pipe open
                task.abort();
            }
        }
        let mut buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *buf)
    }
}

/// Run `command` to completion, killing its process group on timeout.
pub async fn run_with_timeout(mut command: Command, timeout: Duration) -> Result<Output, RunError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    isolate_process_group(&mut command);

    let mut child = command.spawn().map_err(RunError::Io)?;
    let pid = child.id();
    let stdout = PipeCollector::start(child.stdout.take());
    let stderr = PipeCollector::start(child.stderr.take());

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => {
            let status = status.map_err(RunError::Io)?;
            Ok(Output {
                status,
                stdout: stdout.finish().await,
                stderr: stderr.finish().await,
            })
        }
        Err(_) => {
            if let Some(pid) = pid {
                signal_group(pid, Signal::Kill);
            }
            if let Err(e) = child.kill().await {
                warn!("Failed to kill timed out pid {:?}: {}", pid, e);
            }
            Err(RunError::Timeout {
                stdout: stdout.finish().await,
                stderr: stderr.finish().await,
            })
        }
    }
}

/// Whether `<name> --version` runs successfully.
pub async fn tool_available(name: &str) -> bool {
    Command::new(name)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Quote `s` for inclusion in a POSIX shell command line.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_leaves_plain_words_alone() {
        assert_eq!(shell_quote("--output-format"), "--output-format");
        assert_eq!(shell_quote("/tmp/prompt.txt"), "/tmp/prompt.txt");
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
    }

    #[tokio::test]
    async fn captures_output_lines() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo one; echo two >&2; echo three"]);
        let mut proc = ManagedProcess::spawn("echo", cmd).unwrap();
        proc.wait().await.unwrap();
        // Readers may lag the exit slightly
        for _ in 0..50 {
            if proc.recent_output(10).len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let mut lines = proc.recent_output(10);
        lines.sort();
        assert_eq!(lines, vec!["one", "three", "two"]);
    }

    #[tokio::test]
    async fn terminate_stops_sleeping_child() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let mut proc = ManagedProcess::spawn("sleeper", cmd).unwrap();
        let pid = proc.pid().unwrap();
        assert!(proc.is_running());
        proc.terminate(Duration::from_secs(2)).await;
        assert!(!proc.is_running());
        assert!(!pid_alive(pid));
    }

    #[tokio::test]
    async fn terminate_escalates_when_sigterm_is_ignored() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "trap '' TERM; while true; do sleep 1; done"]);
        let mut proc = ManagedProcess::spawn("stubborn", cmd).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        proc.terminate(Duration::from_millis(300)).await;
        assert!(!proc.is_running());
    }

    #[tokio::test]
    async fn run_with_timeout_kills_slow_commands() {
        let mut cmd = Command::new("sleep");
        cmd.arg("10");
        let res = run_with_timeout(cmd, Duration::from_millis(200)).await;
        assert!(matches!(res, Err(RunError::Timeout { .. })));
    }

    #[tokio::test]
    async fn run_with_timeout_keeps_output_printed_before_the_deadline() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo first; echo oops >&2; sleep 10"]);
        match run_with_timeout(cmd, Duration::from_millis(500)).await {
            Err(RunError::Timeout { stdout, stderr }) => {
                assert_eq!(String::from_utf8_lossy(&stdout).trim(), "first");
                assert_eq!(String::from_utf8_lossy(&stderr).trim(), "oops");
            }
            other => panic!("expected timeout, got {:?}", other.map(|o| o.status)),
        }
    }

    #[tokio::test]
    async fn run_with_timeout_returns_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo ok; exit 3"]);
        let out = run_with_timeout(cmd, Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "ok");
    }
}
