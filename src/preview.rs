//! # Preview Process Manager
//!
//! Runs the dev server(s) for a project so the UI can show it live.
//!
//! Lifecycle per project: `stopped -> starting -> running`, with `error`
//! reachable from `starting` (and from `running` if a server dies).
//!
//! Fullstack projects run two servers. The backend is started and probed
//! first; the frontend is only spawned once the backend accepts
//! connections, and receives its URL via `VITE_API_URL`. If the frontend
//! then fails, the backend is torn down before the error is returned.
//!
//! Starts are tagged with a generation number. `stop` removes the record,
//! so a start that finishes afterwards sees a different (or no) generation
//! and tears down whatever it spawned.
//!
//! Viewers hold a [`ConnectionGuard`]; when the last one goes away the
//! preview is stopped.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::PreviewConfig;
use crate::error::PreviewError;
use crate::ports::PortAllocator;
use crate::process::{run_with_timeout, ManagedProcess, RunError};
use crate::store::{BackendFramework, Project, ProjectStore};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
/// Output lines attached to start failures
const FAILURE_OUTPUT_LINES: usize = 10;
/// Marks the last successful `pip install`
const PIP_STAMP: &str = ".kiln-pip-installed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewState {
    Stopped,
    Starting,
    Running,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRole {
    Frontend,
    Backend,
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerRole::Frontend => write!(f, "frontend"),
            ServerRole::Backend => write!(f, "backend"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewStatus {
    pub project_id: String,
    pub status: PreviewState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frontend_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub connections: usize,
}

/// Result of the advisory pre-start inspection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessReport {
    pub ready: bool,
    pub issues: Vec<String>,
}

/// Decides when a spawned server is accepting requests.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn is_ready(&self, role: ServerRole, port: u16) -> bool;
}

/// Ready once the port accepts a TCP connection on localhost.
pub struct TcpProbe;

#[async_trait]
impl ReadinessProbe for TcpProbe {
    async fn is_ready(&self, _role: ServerRole, port: u16) -> bool {
        matches!(
            tokio::time::timeout(
                PROBE_CONNECT_TIMEOUT,
                tokio::net::TcpStream::connect(("127.0.0.1", port))
            )
            .await,
            Ok(Ok(_))
        )
    }
}

struct Server {
    process: ManagedProcess,
    port: u16,
}

struct Servers {
    frontend: Server,
    backend: Option<Server>,
}

struct PreviewInstance {
    state: PreviewState,
    generation: u64,
    servers: Option<Servers>,
    error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Toolchain {
    Npm,
    Pip,
}

pub struct PreviewManager {
    config: PreviewConfig,
    store: Arc<dyn ProjectStore>,
    ports: PortAllocator,
    probe: Arc<dyn ReadinessProbe>,
    instances: DashMap<String, PreviewInstance>,
    connections: DashMap<String, usize>,
    generation: AtomicU64,
}

impl PreviewManager {
    pub fn new(config: PreviewConfig, store: Arc<dyn ProjectStore>) -> Self {
        Self::with_probe(config, store, Arc::new(TcpProbe))
    }

    pub fn with_probe(config: PreviewConfig, store: Arc<dyn ProjectStore>, probe: Arc<dyn ReadinessProbe>) -> Self {
        let ports = PortAllocator::new(config.port_start, config.port_end);
        Self {
            config,
            store,
            ports,
            probe,
            instances: DashMap::new(),
            connections: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// Start the project's preview, or report the one already running or
    /// starting.
    pub async fn start(&self, project_id: &str) -> Result<PreviewStatus, PreviewError> {
        let project = self
            .store
            .find_project(project_id)
            .map_err(|_| PreviewError::ProjectNotFound(project_id.to_string()))?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let leftovers = match self.instances.entry(project_id.to_string()) {
            Entry::Occupied(mut entry) => match entry.get().state {
                PreviewState::Running | PreviewState::Starting => {
                    debug!("Preview for {} already {:?}", project_id, entry.get().state);
                    return Ok(self.snapshot(project_id, Some(entry.get())));
                }
                PreviewState::Stopped | PreviewState::Error => {
                    let instance = entry.get_mut();
                    instance.state = PreviewState::Starting;
                    instance.generation = generation;
                    instance.error = None;
                    instance.servers.take()
                }
            },
            Entry::Vacant(slot) => {
                slot.insert(PreviewInstance {
                    state: PreviewState::Starting,
                    generation,
                    servers: None,
                    error: None,
                });
                None
            }
        };
        if let Some(servers) = leftovers {
            self.teardown(servers).await;
        }

        info!("Starting preview for {} (generation {})", project_id, generation);
        let result = self.launch(&project, generation).await;

        let mut launched = None;
        match result {
            Ok(servers) => {
                launched = Some(servers);
                if let Some(mut instance) = self.instances.get_mut(project_id) {
                    if instance.generation == generation {
                        instance.state = PreviewState::Running;
                        instance.servers = launched.take();
                    }
                }
            }
            Err(PreviewError::StartCancelled(_)) => {}
            Err(e) => {
                error!("Preview start for {} failed: {}", project_id, e);
                if let Some(mut instance) = self.instances.get_mut(project_id) {
                    if instance.generation == generation {
                        instance.state = PreviewState::Error;
                        instance.error = Some(e.to_string());
                        return Err(e);
                    }
                }
            }
        }

        if let Some(servers) = launched {
            info!("Preview for {} was stopped while starting", project_id);
            self.teardown(servers).await;
        }

        let status = self.status(project_id);
        if status.status == PreviewState::Running {
            info!(
                "Preview for {} running on port {:?} (backend {:?})",
                project_id, status.frontend_port, status.backend_port
            );
        }
        Ok(status)
    }

    /// Stop every server for the project. Stopping a stopped project is a
    /// no-op.
    pub async fn stop(&self, project_id: &str) -> PreviewStatus {
        if let Some((_, instance)) = self.instances.remove(project_id) {
            info!("Stopping preview for {}", project_id);
            if let Some(servers) = instance.servers {
                self.teardown(servers).await;
            }
        }
        self.snapshot(project_id, None)
    }

    /// Current state, noticing servers that died since the last look.
    pub fn status(&self, project_id: &str) -> PreviewStatus {
        match self.instances.get_mut(project_id) {
            Some(mut instance) => {
                refresh(project_id, &mut instance);
                self.snapshot(project_id, Some(&instance))
            }
            None => self.snapshot(project_id, None),
        }
    }

    /// Inspect the project layout without spawning anything.
    pub fn check_project_ready(&self, project_id: &str) -> Result<ReadinessReport, PreviewError> {
        let project = self
            .store
            .find_project(project_id)
            .map_err(|_| PreviewError::ProjectNotFound(project_id.to_string()))?;

        let mut issues = Vec::new();
        check_npm_project(&frontend_dir(&project.path), "frontend", &mut issues);
        if project.is_fullstack() {
            let backend = project.path.join("backend");
            match project.backend_framework.unwrap_or(BackendFramework::Node) {
                BackendFramework::Node => check_npm_project(&backend, "backend", &mut issues),
                BackendFramework::Python => {
                    if !backend.join("requirements.txt").is_file() {
                        issues.push("backend: requirements.txt is missing".to_string());
                    }
                    if !backend.join("main.py").is_file() {
                        issues.push("backend: main.py is missing".to_string());
                    }
                }
            }
        }
        Ok(ReadinessReport {
            ready: issues.is_empty(),
            issues,
        })
    }

    pub fn register_connection(&self, project_id: &str) -> usize {
        let mut count = self.connections.entry(project_id.to_string()).or_insert(0);
        *count += 1;
        debug!("Preview viewers for {}: {}", project_id, *count);
        *count
    }

    /// Drop one viewer; the preview stops when none remain.
    pub async fn unregister_connection(&self, project_id: &str) {
        let remaining = match self.connections.entry(project_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let n = entry.get().saturating_sub(1);
                if n == 0 {
                    entry.remove();
                } else {
                    *entry.get_mut() = n;
                }
                n
            }
            Entry::Vacant(_) => {
                warn!("Unbalanced viewer disconnect for {}", project_id);
                return;
            }
        };
        debug!("Preview viewers for {}: {}", project_id, remaining);

        if remaining == 0 {
            self.stop_if_unwatched(project_id).await;
        }
    }

    /// Stop the preview unless a viewer has registered since the count hit
    /// zero. The check and the removal happen under the instance lock, so a
    /// viewer that registers afterwards finds the preview stopped and starts
    /// it again.
    async fn stop_if_unwatched(&self, project_id: &str) {
        let removed = self
            .instances
            .remove_if(project_id, |_, _| !self.connections.contains_key(project_id));
        let Some((_, instance)) = removed else {
            return;
        };
        info!("Last viewer left {}, stopping preview", project_id);
        if let Some(servers) = instance.servers {
            self.teardown(servers).await;
        }
    }

    /// Register a viewer for as long as the guard lives.
    pub fn connect(self: &Arc<Self>, project_id: &str) -> ConnectionGuard {
        self.register_connection(project_id);
        ConnectionGuard {
            manager: self.clone(),
            project_id: project_id.to_string(),
        }
    }

    /// Stop every preview. Used on shutdown.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        if ids.is_empty() {
            return;
        }
        info!("Stopping {} preview(s)", ids.len());
        futures::future::join_all(ids.iter().map(|id| self.stop(id))).await;
    }

    fn snapshot(&self, project_id: &str, instance: Option<&PreviewInstance>) -> PreviewStatus {
        let connections = self.connections.get(project_id).map(|c| *c).unwrap_or(0);
        let mut status = PreviewStatus {
            project_id: project_id.to_string(),
            status: PreviewState::Stopped,
            url: None,
            frontend_port: None,
            backend_port: None,
            backend_url: None,
            error: None,
            connections,
        };
        if let Some(instance) = instance {
            status.status = instance.state;
            status.error = instance.error.clone();
            if let Some(servers) = &instance.servers {
                status.frontend_port = Some(servers.frontend.port);
                status.url = Some(local_url(servers.frontend.port));
                if let Some(backend) = &servers.backend {
                    status.backend_port = Some(backend.port);
                    status.backend_url = Some(local_url(backend.port));
                }
            }
        }
        status
    }

    fn is_current(&self, project_id: &str, generation: u64) -> bool {
        self.instances
            .get(project_id)
            .map(|i| i.generation == generation)
            .unwrap_or(false)
    }

    /// Bring up all servers for the project, or nothing.
    async fn launch(&self, project: &Project, generation: u64) -> Result<Servers, PreviewError> {
        let frontend_dir = frontend_dir(&project.path);

        if !project.is_fullstack() {
            let frontend = self
                .start_server(project, generation, ServerRole::Frontend, &frontend_dir, None)
                .await?;
            return Ok(Servers {
                frontend,
                backend: None,
            });
        }

        let backend_dir = project.path.join("backend");
        if !backend_dir.is_dir() {
            return Err(PreviewError::Backend(Box::new(PreviewError::Spawn {
                label: ServerRole::Backend.to_string(),
                reason: format!("{} does not exist", backend_dir.display()),
            })));
        }
        let mut backend = self
            .start_server(project, generation, ServerRole::Backend, &backend_dir, None)
            .await
            .map_err(|e| match e {
                PreviewError::StartCancelled(_) => e,
                other => PreviewError::Backend(Box::new(other)),
            })?;

        let backend_url = local_url(backend.port);
        match self
            .start_server(project, generation, ServerRole::Frontend, &frontend_dir, Some(&backend_url))
            .await
        {
            Ok(frontend) => Ok(Servers {
                frontend,
                backend: Some(backend),
            }),
            Err(e) => {
                warn!("Frontend for {} failed, stopping backend", project.id);
                backend.process.terminate(self.config.kill_grace).await;
                self.ports.release(backend.port);
                Err(e)
            }
        }
    }

    /// Allocate a port, install dependencies, spawn and wait for readiness.
    /// Nothing is left running or reserved on failure.
    async fn start_server(
        &self,
        project: &Project,
        generation: u64,
        role: ServerRole,
        dir: &Path,
        backend_url: Option<&str>,
    ) -> Result<Server, PreviewError> {
        let port = self.ports.allocate()?;
        match self.spawn_ready(project, generation, role, dir, port, backend_url).await {
            Ok(process) => Ok(Server { process, port }),
            Err(e) => {
                self.ports.release(port);
                Err(e)
            }
        }
    }

    async fn spawn_ready(
        &self,
        project: &Project,
        generation: u64,
        role: ServerRole,
        dir: &Path,
        port: u16,
        backend_url: Option<&str>,
    ) -> Result<ManagedProcess, PreviewError> {
        let framework = match role {
            ServerRole::Frontend => BackendFramework::Node,
            ServerRole::Backend => project.backend_framework.unwrap_or(BackendFramework::Node),
        };
        let toolchain = match framework {
            BackendFramework::Node => Toolchain::Npm,
            BackendFramework::Python => Toolchain::Pip,
        };
        self.install_dependencies(dir, toolchain).await?;
        if role == ServerRole::Frontend {
            clear_build_cache(dir);
        }
        if !self.is_current(&project.id, generation) {
            return Err(PreviewError::StartCancelled(project.id.clone()));
        }

        let command = match role {
            ServerRole::Frontend => self.frontend_command(dir, port, backend_url),
            ServerRole::Backend => self.backend_command(dir, framework, port),
        };
        let label = format!("{} {}", project.id, role);
        let mut process = ManagedProcess::spawn(label, command).map_err(|e| PreviewError::Spawn {
            label: role.to_string(),
            reason: e.to_string(),
        })?;

        if let Err(e) = self.wait_ready(&project.id, generation, role, port, &mut process).await {
            process.terminate(self.config.kill_grace).await;
            return Err(e);
        }
        Ok(process)
    }

    async fn wait_ready(
        &self,
        project_id: &str,
        generation: u64,
        role: ServerRole,
        port: u16,
        process: &mut ManagedProcess,
    ) -> Result<(), PreviewError> {
        let deadline = Instant::now() + self.config.start_timeout;
        loop {
            if let Some(status) = process.exit_status() {
                return Err(PreviewError::ProcessExited {
                    label: role.to_string(),
                    status: status.to_string(),
                    output: process.recent_output(FAILURE_OUTPUT_LINES),
                });
            }
            if !self.is_current(project_id, generation) {
                return Err(PreviewError::StartCancelled(project_id.to_string()));
            }
            if self.probe.is_ready(role, port).await {
                info!("{} for {} ready on port {} (pid {:?})", role, project_id, port, process.pid());
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(PreviewError::ServerStartTimeout {
                    label: role.to_string(),
                    port,
                    timeout: self.config.start_timeout,
                });
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    fn frontend_command(&self, dir: &Path, port: u16, backend_url: Option<&str>) -> Command {
        let mut cmd = Command::new(&self.config.npm);
        cmd.args(["run", "dev", "--", "--port"])
            .arg(port.to_string())
            .args(["--host", "127.0.0.1"])
            .current_dir(dir)
            .env("PORT", port.to_string())
            .env("BROWSER", "none");
        if let Some(url) = backend_url {
            cmd.env("VITE_API_URL", url).env("API_URL", url);
        }
        cmd
    }

    fn backend_command(&self, dir: &Path, framework: BackendFramework, port: u16) -> Command {
        let mut cmd = match framework {
            BackendFramework::Node => {
                let mut c = Command::new(&self.config.npm);
                c.args(["run", "dev"]);
                c
            }
            BackendFramework::Python => {
                let mut c = Command::new(&self.config.python);
                c.args(["-m", "uvicorn", "main:app", "--host", "127.0.0.1", "--port"])
                    .arg(port.to_string())
                    .arg("--reload");
                c
            }
        };
        cmd.current_dir(dir).env("PORT", port.to_string());
        cmd
    }

    async fn install_dependencies(&self, dir: &Path, toolchain: Toolchain) -> Result<(), PreviewError> {
        let mut stamp = None;
        let mut cmd = match toolchain {
            Toolchain::Npm => {
                if !dir.join("package.json").is_file() || dir.join("node_modules").is_dir() {
                    return Ok(());
                }
                let mut c = Command::new(&self.config.npm);
                c.arg("install");
                c
            }
            Toolchain::Pip => {
                let requirements = dir.join("requirements.txt");
                let marker = dir.join(PIP_STAMP);
                if !requirements.is_file() || !is_newer(&requirements, &marker) {
                    return Ok(());
                }
                stamp = Some(marker);
                let mut c = Command::new(&self.config.python);
                c.args(["-m", "pip", "install", "-r", "requirements.txt"]);
                c
            }
        };
        cmd.current_dir(dir);

        info!("Installing {:?} dependencies in {}", toolchain, dir.display());
        let started = Instant::now();
        let install_error = |reason: String| PreviewError::DependencyInstallError {
            dir: dir.to_path_buf(),
            reason,
        };
        let output = run_with_timeout(cmd, self.config.install_timeout)
            .await
            .map_err(|e| match e {
                RunError::Timeout { .. } => install_error(format!(
                    "timed out after {}s",
                    self.config.install_timeout.as_secs()
                )),
                RunError::Io(e) => install_error(e.to_string()),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: Vec<&str> = stderr.lines().collect();
            let tail = lines[lines.len().saturating_sub(5)..].join(" | ");
            return Err(install_error(format!("{}: {}", output.status, tail)));
        }
        if let Some(marker) = stamp {
            if let Err(e) = std::fs::write(&marker, b"") {
                warn!("Failed to write {}: {}", marker.display(), e);
            }
        }
        info!("Dependencies installed in {} ({:?})", dir.display(), started.elapsed());
        Ok(())
    }

    async fn teardown(&self, servers: Servers) {
        let Servers { frontend, backend } = servers;
        let grace = self.config.kill_grace;
        let stop_frontend = async {
            let mut server = frontend;
            server.process.terminate(grace).await;
            self.ports.release(server.port);
        };
        let stop_backend = async {
            if let Some(mut server) = backend {
                server.process.terminate(grace).await;
                self.ports.release(server.port);
            }
        };
        tokio::join!(stop_frontend, stop_backend);
    }
}

/// Keeps a viewer registered until dropped.
pub struct ConnectionGuard {
    manager: Arc<PreviewManager>,
    project_id: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let manager = self.manager.clone();
        let project_id = std::mem::take(&mut self.project_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    manager.unregister_connection(&project_id).await;
                });
            }
            Err(_) => warn!("No runtime to release viewer for {}", project_id),
        }
    }
}

/// Mark a running instance as failed if one of its servers has exited.
fn refresh(project_id: &str, instance: &mut PreviewInstance) {
    if instance.state != PreviewState::Running {
        return;
    }
    let Some(servers) = instance.servers.as_mut() else {
        return;
    };
    let mut exited = Vec::new();
    if let Some(status) = servers.frontend.process.exit_status() {
        exited.push(format!("frontend server exited ({})", status));
    }
    if let Some(backend) = servers.backend.as_mut() {
        if let Some(status) = backend.process.exit_status() {
            exited.push(format!("backend server exited ({})", status));
        }
    }
    if !exited.is_empty() {
        let reason = exited.join("; ");
        warn!("Preview for {}: {}", project_id, reason);
        instance.state = PreviewState::Error;
        instance.error = Some(reason);
    }
}

fn local_url(port: u16) -> String {
    format!("http://localhost:{}", port)
}

/// `frontend/` for fullstack layouts, the project root otherwise.
pub fn frontend_dir(root: &Path) -> PathBuf {
    let nested = root.join("frontend");
    if nested.is_dir() {
        nested
    } else {
        root.to_path_buf()
    }
}

/// Vite's dependency cache goes stale when packages change underneath it.
fn clear_build_cache(dir: &Path) {
    let cache = dir.join("node_modules").join(".vite");
    if cache.is_dir() {
        match std::fs::remove_dir_all(&cache) {
            Ok(()) => debug!("Cleared {}", cache.display()),
            Err(e) => warn!("Failed to clear {}: {}", cache.display(), e),
        }
    }
}

fn check_npm_project(dir: &Path, label: &str, issues: &mut Vec<String>) {
    let manifest = dir.join("package.json");
    let content = match std::fs::read_to_string(&manifest) {
        Ok(c) => c,
        Err(_) => {
            issues.push(format!("{}: package.json is missing", label));
            return;
        }
    };
    match serde_json::from_str::<serde_json::Value>(&content) {
        Ok(json) if json["scripts"]["dev"].is_string() => {}
        Ok(_) => issues.push(format!("{}: package.json has no \"dev\" script", label)),
        Err(e) => issues.push(format!("{}: package.json is invalid ({})", label, e)),
    }
}

/// Whether `a` was modified after `b`. A missing `b` counts as older.
fn is_newer(a: &Path, b: &Path) -> bool {
    let modified = |p: &Path| std::fs::metadata(p).and_then(|m| m.modified());
    match (modified(a), modified(b)) {
        (Ok(a), Ok(b)) => a > b,
        _ => true,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::pid_alive;
    use crate::store::{FileStore, NewProject, ProjectType};
    use std::os::unix::fs::PermissionsExt;

    /// Stands in for `npm`: `install` creates node_modules, anything else
    /// records its pid and sleeps like a dev server.
    const FAKE_NPM: &str = r#"#!/bin/sh
if [ "$1" = "install" ]; then
  echo install >> install.log
  [ -f fail-install ] && { echo "npm ERR! network" >&2; exit 1; }
  mkdir -p node_modules
  exit 0
fi
[ -f crash ] && { echo "Error: Cannot find module vite" >&2; exit 1; }
echo "$$" > dev.pid
echo "$PORT ${VITE_API_URL:-none}" >> spawns.log
exec sleep 30
"#;

    struct AlwaysReady;

    #[async_trait]
    impl ReadinessProbe for AlwaysReady {
        async fn is_ready(&self, _role: ServerRole, _port: u16) -> bool {
            true
        }
    }

    struct NeverReady;

    #[async_trait]
    impl ReadinessProbe for NeverReady {
        async fn is_ready(&self, _role: ServerRole, _port: u16) -> bool {
            false
        }
    }

    /// Backend becomes ready once it has started; the frontend never does.
    struct BackendOnly;

    #[async_trait]
    impl ReadinessProbe for BackendOnly {
        async fn is_ready(&self, role: ServerRole, _port: u16) -> bool {
            role == ServerRole::Backend
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        store: Arc<FileStore>,
        npm: String,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let npm = dir.path().join("fake-npm");
            std::fs::write(&npm, FAKE_NPM).unwrap();
            std::fs::set_permissions(&npm, std::fs::Permissions::from_mode(0o755)).unwrap();
            let store = Arc::new(FileStore::open(&dir.path().join("data"), &dir.path().join("work")).unwrap());
            Self {
                npm: npm.to_string_lossy().to_string(),
                dir,
                store,
            }
        }

        fn config(&self, port_start: u16, start_timeout: Duration) -> PreviewConfig {
            PreviewConfig {
                npm: self.npm.clone(),
                python: "python3".to_string(),
                port_start,
                port_end: port_start + 20,
                install_timeout: Duration::from_secs(10),
                start_timeout,
                kill_grace: Duration::from_secs(2),
            }
        }

        fn project(&self, name: &str, fullstack: bool) -> Project {
            let project = self
                .store
                .create_project(NewProject {
                    name: name.to_string(),
                    path: Some(self.dir.path().join(name)),
                    project_type: if fullstack {
                        ProjectType::Fullstack
                    } else {
                        ProjectType::Frontend
                    },
                    backend_framework: None,
                })
                .unwrap();
            if fullstack {
                std::fs::create_dir_all(project.path.join("backend")).unwrap();
                std::fs::create_dir_all(project.path.join("frontend")).unwrap();
            }
            project
        }

        fn manager(&self, config: PreviewConfig, probe: Arc<dyn ReadinessProbe>) -> Arc<PreviewManager> {
            Arc::new(PreviewManager::with_probe(config, self.store.clone(), probe))
        }
    }

    fn read_pid(dir: &Path) -> u32 {
        std::fs::read_to_string(dir.join("dev.pid")).unwrap().trim().parse().unwrap()
    }

    async fn wait_for_file(path: &Path) {
        for _ in 0..100 {
            if path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{} never appeared", path.display());
    }

    #[tokio::test]
    async fn frontend_start_is_idempotent_and_stop_kills_server() {
        let f = Fixture::new();
        let project = f.project("single", false);
        let mgr = f.manager(f.config(46100, Duration::from_secs(5)), Arc::new(AlwaysReady));

        let status = mgr.start(&project.id).await.unwrap();
        assert_eq!(status.status, PreviewState::Running);
        let port = status.frontend_port.unwrap();
        assert_eq!(status.url.as_deref(), Some(format!("http://localhost:{}", port).as_str()));
        assert!(status.backend_port.is_none());

        let again = mgr.start(&project.id).await.unwrap();
        assert_eq!(again.frontend_port, Some(port));

        wait_for_file(&project.path.join("spawns.log")).await;
        let pid = read_pid(&project.path);
        let log = std::fs::read_to_string(project.path.join("spawns.log")).unwrap();
        assert_eq!(log.lines().count(), 1);
        assert_eq!(log.trim(), format!("{} none", port));

        let stopped = mgr.stop(&project.id).await;
        assert_eq!(stopped.status, PreviewState::Stopped);
        assert!(!pid_alive(pid));
        assert_eq!(mgr.ports.reserved_count(), 0);

        // Stopping again is a no-op
        assert_eq!(mgr.stop(&project.id).await.status, PreviewState::Stopped);
    }

    #[tokio::test]
    async fn concurrent_projects_get_disjoint_ports() {
        let f = Fixture::new();
        let a = f.project("alpha", false);
        let b = f.project("beta", false);
        let mgr = f.manager(f.config(46200, Duration::from_secs(5)), Arc::new(AlwaysReady));

        let (sa, sb) = tokio::join!(mgr.start(&a.id), mgr.start(&b.id));
        let (pa, pb) = (sa.unwrap().frontend_port.unwrap(), sb.unwrap().frontend_port.unwrap());
        assert_ne!(pa, pb);

        mgr.stop(&a.id).await;
        let c = f.project("gamma", false);
        let pc = mgr.start(&c.id).await.unwrap().frontend_port.unwrap();
        assert_eq!(pc, pa);

        mgr.shutdown_all().await;
        assert_eq!(mgr.status(&b.id).status, PreviewState::Stopped);
        assert_eq!(mgr.status(&c.id).status, PreviewState::Stopped);
        assert_eq!(mgr.ports.reserved_count(), 0);
    }

    #[tokio::test]
    async fn last_viewer_leaving_stops_preview() {
        let f = Fixture::new();
        let project = f.project("viewers", false);
        let mgr = f.manager(f.config(46300, Duration::from_secs(5)), Arc::new(AlwaysReady));
        mgr.start(&project.id).await.unwrap();

        assert_eq!(mgr.register_connection(&project.id), 1);
        assert_eq!(mgr.register_connection(&project.id), 2);
        mgr.unregister_connection(&project.id).await;
        assert_eq!(mgr.status(&project.id).status, PreviewState::Running);
        assert_eq!(mgr.status(&project.id).connections, 1);

        mgr.unregister_connection(&project.id).await;
        assert_eq!(mgr.status(&project.id).status, PreviewState::Stopped);

        // Extra disconnects never go below zero
        mgr.unregister_connection(&project.id).await;
        assert_eq!(mgr.status(&project.id).connections, 0);
    }

    #[tokio::test]
    async fn viewer_arriving_before_teardown_keeps_preview() {
        let f = Fixture::new();
        let project = f.project("rejoin", false);
        let mgr = f.manager(f.config(47000, Duration::from_secs(5)), Arc::new(AlwaysReady));
        mgr.start(&project.id).await.unwrap();

        // Count already hit zero, then a new viewer registered
        mgr.register_connection(&project.id);
        mgr.stop_if_unwatched(&project.id).await;
        assert_eq!(mgr.status(&project.id).status, PreviewState::Running);

        mgr.unregister_connection(&project.id).await;
        assert_eq!(mgr.status(&project.id).status, PreviewState::Stopped);
        assert_eq!(mgr.ports.reserved_count(), 0);
    }

    #[tokio::test]
    async fn dropping_guard_releases_viewer() {
        let f = Fixture::new();
        let project = f.project("guarded", false);
        let mgr = f.manager(f.config(46350, Duration::from_secs(5)), Arc::new(AlwaysReady));
        mgr.start(&project.id).await.unwrap();

        let guard = mgr.connect(&project.id);
        assert_eq!(mgr.status(&project.id).connections, 1);
        drop(guard);
        for _ in 0..100 {
            if mgr.status(&project.id).status == PreviewState::Stopped {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("preview still running after last guard dropped");
    }

    #[tokio::test]
    async fn frontend_failure_kills_started_backend() {
        let f = Fixture::new();
        let project = f.project("stack", true);
        let mgr = f.manager(f.config(46400, Duration::from_millis(600)), Arc::new(BackendOnly));

        let err = mgr.start(&project.id).await.unwrap_err();
        assert!(matches!(err, PreviewError::ServerStartTimeout { ref label, .. } if label == "frontend"));

        let backend_dir = project.path.join("backend");
        let backend_pid = read_pid(&backend_dir);
        assert!(!pid_alive(backend_pid));
        assert!(!pid_alive(read_pid(&project.path.join("frontend"))));

        // Frontend was pointed at the backend
        let frontend_log = std::fs::read_to_string(project.path.join("frontend/spawns.log")).unwrap();
        assert!(frontend_log.contains("http://localhost:"));

        let status = mgr.status(&project.id);
        assert_eq!(status.status, PreviewState::Error);
        assert!(status.error.unwrap().contains("frontend"));
        assert_eq!(mgr.ports.reserved_count(), 0);
    }

    #[tokio::test]
    async fn backend_failure_never_starts_frontend() {
        let f = Fixture::new();
        let project = f.project("brokenapi", true);
        std::fs::write(project.path.join("backend/crash"), "").unwrap();
        let mgr = f.manager(f.config(46500, Duration::from_secs(5)), Arc::new(NeverReady));

        let err = mgr.start(&project.id).await.unwrap_err();
        match err {
            PreviewError::Backend(inner) => assert!(matches!(*inner, PreviewError::ProcessExited { .. })),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!project.path.join("frontend/spawns.log").exists());
        assert_eq!(mgr.status(&project.id).status, PreviewState::Error);
    }

    #[tokio::test]
    async fn stop_during_start_wins() {
        let f = Fixture::new();
        let project = f.project("racing", false);
        let mgr = f.manager(f.config(46600, Duration::from_secs(10)), Arc::new(NeverReady));

        let starter = {
            let mgr = mgr.clone();
            let id = project.id.clone();
            tokio::spawn(async move { mgr.start(&id).await })
        };
        wait_for_file(&project.path.join("dev.pid")).await;
        assert_eq!(mgr.status(&project.id).status, PreviewState::Starting);

        // A second start observes the one in progress
        let second = mgr.start(&project.id).await.unwrap();
        assert_eq!(second.status, PreviewState::Starting);

        assert_eq!(mgr.stop(&project.id).await.status, PreviewState::Stopped);
        let result = tokio::time::timeout(Duration::from_secs(5), starter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(result.status, PreviewState::Stopped);

        let log = std::fs::read_to_string(project.path.join("spawns.log")).unwrap();
        assert_eq!(log.lines().count(), 1);
        assert!(!pid_alive(read_pid(&project.path)));
        assert_eq!(mgr.ports.reserved_count(), 0);
    }

    #[tokio::test]
    async fn install_runs_once_and_failures_surface() {
        let f = Fixture::new();
        let project = f.project("deps", false);
        std::fs::write(project.path.join("package.json"), r#"{"scripts":{"dev":"vite"}}"#).unwrap();
        let mgr = f.manager(f.config(46700, Duration::from_secs(5)), Arc::new(AlwaysReady));

        mgr.start(&project.id).await.unwrap();
        mgr.stop(&project.id).await;
        mgr.start(&project.id).await.unwrap();
        mgr.stop(&project.id).await;
        let installs = std::fs::read_to_string(project.path.join("install.log")).unwrap();
        assert_eq!(installs.lines().count(), 1);

        let broken = f.project("nodeps", false);
        std::fs::write(broken.path.join("package.json"), "{}").unwrap();
        std::fs::write(broken.path.join("fail-install"), "").unwrap();
        let err = mgr.start(&broken.id).await.unwrap_err();
        assert!(matches!(err, PreviewError::DependencyInstallError { .. }));
        assert!(err.to_string().contains("network"));
        assert!(!broken.path.join("spawns.log").exists());
        assert_eq!(mgr.status(&broken.id).status, PreviewState::Error);
    }

    #[tokio::test]
    async fn stale_vite_cache_is_cleared() {
        let f = Fixture::new();
        let project = f.project("cache", false);
        std::fs::create_dir_all(project.path.join("node_modules/.vite/deps")).unwrap();
        let mgr = f.manager(f.config(46750, Duration::from_secs(5)), Arc::new(AlwaysReady));

        mgr.start(&project.id).await.unwrap();
        assert!(!project.path.join("node_modules/.vite").exists());
        assert!(project.path.join("node_modules").is_dir());
        mgr.stop(&project.id).await;
    }

    #[tokio::test]
    async fn unknown_project_is_not_found() {
        let f = Fixture::new();
        let mgr = f.manager(f.config(46800, Duration::from_secs(1)), Arc::new(AlwaysReady));
        assert!(matches!(
            mgr.start("missing").await,
            Err(PreviewError::ProjectNotFound(_))
        ));
        assert!(matches!(
            mgr.check_project_ready("missing"),
            Err(PreviewError::ProjectNotFound(_))
        ));
    }

    #[test]
    fn readiness_report_lists_missing_pieces() {
        let f = Fixture::new();
        let mgr = PreviewManager::with_probe(f.config(46900, Duration::from_secs(1)), f.store.clone(), Arc::new(NeverReady));

        let project = f
            .store
            .create_project(NewProject {
                name: "pyapp".to_string(),
                path: Some(f.dir.path().join("pyapp")),
                project_type: ProjectType::Fullstack,
                backend_framework: Some(BackendFramework::Python),
            })
            .unwrap();
        std::fs::create_dir_all(project.path.join("frontend")).unwrap();
        std::fs::create_dir_all(project.path.join("backend")).unwrap();
        std::fs::write(project.path.join("frontend/package.json"), r#"{"scripts":{"build":"vite build"}}"#).unwrap();
        std::fs::write(project.path.join("backend/main.py"), "app = None\n").unwrap();

        let report = mgr.check_project_ready(&project.id).unwrap();
        assert!(!report.ready);
        assert_eq!(
            report.issues,
            vec![
                "frontend: package.json has no \"dev\" script".to_string(),
                "backend: requirements.txt is missing".to_string(),
            ]
        );

        std::fs::write(project.path.join("frontend/package.json"), r#"{"scripts":{"dev":"vite"}}"#).unwrap();
        std::fs::write(project.path.join("backend/requirements.txt"), "fastapi\n").unwrap();
        assert!(mgr.check_project_ready(&project.id).unwrap().ready);
    }

    #[test]
    fn python_backend_command_uses_uvicorn() {
        let f = Fixture::new();
        let mgr = PreviewManager::with_probe(f.config(46950, Duration::from_secs(1)), f.store.clone(), Arc::new(NeverReady));
        let cmd = mgr.backend_command(Path::new("/tmp"), BackendFramework::Python, 5201);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(
            args,
            vec!["-m", "uvicorn", "main:app", "--host", "127.0.0.1", "--port", "5201", "--reload"]
        );
    }
}
