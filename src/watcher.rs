//! File watching for live project updates.
//!
//! One watcher per project. Raw `notify` events are passed to a debounce
//! task which holds changes for a fixed window after the first event of a
//! burst, keeps only the latest change per path, then publishes the batch
//! on a broadcast channel.
//!
//! Directories are watched individually so dependency and build trees
//! (node_modules, .git, ...) never get a watch at all.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::WatchError;

/// Never watched or reported
pub const EXCLUDED_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "dist",
    "build",
    ".next",
    ".vite",
    "__pycache__",
    ".venv",
    "venv",
    "target",
];

const RAW_CHANNEL_SIZE: usize = 1024;
const BROADCAST_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Add,
    Change,
    Unlink,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChangeEvent {
    pub project_id: String,
    pub change_type: ChangeType,
    /// Relative to the project root, `/`-separated
    pub path: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-project pending changes and the single flush deadline.
#[derive(Debug)]
pub struct ChangeDebouncer {
    window: Duration,
    pending: BTreeMap<String, (ChangeType, DateTime<Utc>)>,
    deadline: Option<Instant>,
}

impl ChangeDebouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: BTreeMap::new(),
            deadline: None,
        }
    }

    /// Record a change. The first change of a burst arms the deadline;
    /// later ones replace the pending change for their path.
    pub fn push(&mut self, path: String, change: ChangeType, now: Instant) {
        if self.deadline.is_none() {
            self.deadline = Some(now + self.window);
        }
        self.pending.insert(path, (change, Utc::now()));
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Drain the batch, one entry per distinct path.
    pub fn take(&mut self) -> Vec<(String, ChangeType, DateTime<Utc>)> {
        self.deadline = None;
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(path, (change, at))| (path, change, at))
            .collect()
    }
}

/// Keeps the project's change stream alive while held.
pub struct WatchSubscription {
    manager: Arc<WatchManager>,
    project_id: String,
    rx: broadcast::Receiver<FileChangeEvent>,
}

impl WatchSubscription {
    /// Next change, or `None` once the watch is stopped.
    pub async fn recv(&mut self) -> Option<FileChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Watch subscriber for {} skipped {} changes", self.project_id, n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for WatchSubscription {
    fn drop(&mut self) {
        self.manager.release(&self.project_id);
    }
}

struct WatchTask {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl WatchTask {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.join.await {
            warn!("Watch task ended abnormally: {}", e);
        }
    }
}

struct WatchEntry {
    root: PathBuf,
    sender: broadcast::Sender<FileChangeEvent>,
    subscribers: usize,
    task: Option<WatchTask>,
}

pub struct WatchManager {
    window: Duration,
    watches: DashMap<String, WatchEntry>,
}

impl WatchManager {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            watches: DashMap::new(),
        }
    }

    /// (Re)start watching `root` for the project. A running watcher is
    /// stopped completely before the new one is registered; existing
    /// subscribers carry over.
    pub async fn watch(&self, project_id: &str, root: &Path) -> Result<(), WatchError> {
        if !root.is_dir() {
            return Err(WatchError::MissingRoot(root.to_path_buf()));
        }
        let root = root.canonicalize().map_err(|_| WatchError::MissingRoot(root.to_path_buf()))?;

        let previous = self.watches.get_mut(project_id).and_then(|mut e| e.task.take());
        if let Some(task) = previous {
            debug!("Restarting watcher for {}", project_id);
            task.stop().await;
        }

        let sender = self
            .watches
            .entry(project_id.to_string())
            .or_insert_with(|| WatchEntry {
                root: root.clone(),
                sender: broadcast::channel(BROADCAST_SIZE).0,
                subscribers: 0,
                task: None,
            })
            .sender
            .clone();

        let (raw_tx, raw_rx) = mpsc::channel(RAW_CHANNEL_SIZE);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Err(e) = raw_tx.blocking_send(res) {
                debug!("Dropping file event after watcher shutdown: {}", e);
            }
        })?;
        let dirs = watch_tree(&mut watcher, &root, &root)?;
        info!("Watching {} ({} directories) for {}", root.display(), dirs, project_id);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let debounce = DebounceLoop {
            project_id: project_id.to_string(),
            root: root.clone(),
            debouncer: ChangeDebouncer::new(self.window),
            out: sender,
        };
        let task = WatchTask {
            shutdown: shutdown_tx,
            join: tokio::spawn(debounce.run(watcher, raw_rx, shutdown_rx)),
        };

        let displaced = match self.watches.get_mut(project_id) {
            Some(mut entry) => {
                entry.root = root;
                entry.task.replace(task)
            }
            // Stopped while we were setting up
            None => Some(task),
        };
        if let Some(task) = displaced {
            task.stop().await;
        }
        Ok(())
    }

    /// Subscribe to the project's changes, starting the watcher if needed.
    pub async fn subscribe(self: &Arc<Self>, project_id: &str, root: &Path) -> Result<WatchSubscription, WatchError> {
        if !self.is_watching(project_id) {
            self.watch(project_id, root).await?;
        }

        let mut entry = self
            .watches
            .entry(project_id.to_string())
            .or_insert_with(|| WatchEntry {
                root: root.to_path_buf(),
                sender: broadcast::channel(BROADCAST_SIZE).0,
                subscribers: 0,
                task: None,
            });
        entry.subscribers += 1;
        debug!("Watch subscribers for {}: {}", project_id, entry.subscribers);
        Ok(WatchSubscription {
            manager: self.clone(),
            project_id: project_id.to_string(),
            rx: entry.sender.subscribe(),
        })
    }

    pub fn is_watching(&self, project_id: &str) -> bool {
        self.watches
            .get(project_id)
            .map(|e| e.task.is_some())
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub fn subscriber_count(&self, project_id: &str) -> usize {
        self.watches.get(project_id).map(|e| e.subscribers).unwrap_or(0)
    }

    /// Stop the project's watcher and close its stream.
    pub async fn stop(&self, project_id: &str) -> bool {
        match self.watches.remove(project_id) {
            Some((_, entry)) => {
                info!("Stopped watching {} for {}", entry.root.display(), project_id);
                if let Some(task) = entry.task {
                    task.stop().await;
                }
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.watches.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.stop(&id).await;
        }
    }

    /// Drop one subscriber; the last one tears the watcher down.
    fn release(&self, project_id: &str) {
        let last = match self.watches.get_mut(project_id) {
            Some(mut entry) => {
                entry.subscribers = entry.subscribers.saturating_sub(1);
                entry.subscribers == 0
            }
            None => return,
        };
        if !last {
            return;
        }
        // Re-check under the removal lock in case someone subscribed
        if let Some((_, entry)) = self.watches.remove_if(project_id, |_, e| e.subscribers == 0) {
            info!("Last subscriber left, stopped watching {}", project_id);
            if let Some(task) = entry.task {
                // The task exits on its own; nothing to wait for here
                let _ = task.shutdown.send(());
            }
        }
    }
}

struct DebounceLoop {
    project_id: String,
    root: PathBuf,
    debouncer: ChangeDebouncer,
    out: broadcast::Sender<FileChangeEvent>,
}

impl DebounceLoop {
    /// Owns the watcher: dropping it on exit stops the OS-level watches.
    async fn run<W: Watcher + Send + 'static>(
        mut self,
        mut watcher: W,
        mut raw: mpsc::Receiver<notify::Result<Event>>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        loop {
            let deadline = self.debouncer.deadline();
            tokio::select! {
                _ = &mut shutdown => break,
                event = raw.recv() => match event {
                    Some(Ok(event)) => self.ingest(&mut watcher, event),
                    Some(Err(e)) => warn!("Watcher error for {}: {}", self.project_id, e),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush();
                }
            }
        }
        drop(watcher);
        debug!("Watch task for {} exited", self.project_id);
    }

    fn ingest<W: Watcher>(&mut self, watcher: &mut W, event: Event) {
        for (path, change) in classify(&event) {
            let Some(relative) = relative_path(&self.root, &path) else {
                continue;
            };
            if change == ChangeType::Add && path.is_dir() {
                if let Err(e) = watch_tree(watcher, &self.root, &path) {
                    warn!("Failed to watch new directory {}: {}", path.display(), e);
                }
            }
            self.debouncer.push(relative, change, Instant::now());
        }
    }

    fn flush(&mut self) {
        let batch = self.debouncer.take();
        debug!("Flushing {} changes for {}", batch.len(), self.project_id);
        for (path, change_type, timestamp) in batch {
            let event = FileChangeEvent {
                project_id: self.project_id.clone(),
                change_type,
                path,
                timestamp,
            };
            // No subscribers is fine
            let _ = self.out.send(event);
        }
    }
}

/// Map one raw event to per-path changes.
fn classify(event: &Event) -> Vec<(PathBuf, ChangeType)> {
    let change = match &event.kind {
        EventKind::Create(_) => ChangeType::Add,
        EventKind::Remove(_) => ChangeType::Unlink,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            return vec![
                (event.paths[0].clone(), ChangeType::Unlink),
                (event.paths[1].clone(), ChangeType::Add),
            ];
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => ChangeType::Unlink,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => ChangeType::Add,
        EventKind::Modify(ModifyKind::Name(_)) => {
            return event
                .paths
                .iter()
                .map(|p| {
                    let change = if p.exists() { ChangeType::Add } else { ChangeType::Unlink };
                    (p.clone(), change)
                })
                .collect();
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => return Vec::new(),
        EventKind::Modify(_) => ChangeType::Change,
        EventKind::Access(_) | EventKind::Any | EventKind::Other => return Vec::new(),
    };
    event.paths.iter().map(|p| (p.clone(), change)).collect()
}

/// Project-relative path, or `None` for the root itself and anything
/// outside it or inside an excluded directory.
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(name) => {
                let name = name.to_string_lossy();
                if EXCLUDED_DIRS.contains(&name.as_ref()) {
                    return None;
                }
                parts.push(name.into_owned());
            }
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Watch `dir` and every non-excluded directory below it. Returns the
/// number of directories watched.
fn watch_tree<W: Watcher>(watcher: &mut W, root: &Path, dir: &Path) -> notify::Result<usize> {
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    let mut count = 1;
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot list {}: {}", dir.display(), e);
            return Ok(count);
        }
    };
    for entry in entries.flatten() {
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        let path = entry.path();
        if relative_path(root, &path).is_none() {
            continue;
        }
        match watch_tree(watcher, root, &path) {
            Ok(n) => count += n,
            Err(e) => error!("Failed to watch {}: {}", path.display(), e),
        }
    }
    Ok(count)
}
