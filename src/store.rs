//! Project and transcript persistence.
//!
//! Layout under the data directory:
//!
//! ```text
//! projects/
//!   {project_id}/
//!     project.json     - project record (rewritten on update)
//!     messages.jsonl   - conversation turns, append-only
//! ```
//!
//! Project records are cached in memory; transcripts are loaded lazily on
//! first access and kept in sync with the file on every append.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    Frontend,
    Fullstack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendFramework {
    Node,
    Python,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub project_type: ProjectType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_framework: Option<BackendFramework>,
    /// External agent session to resume on the next turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Project {
    /// Fullstack projects with a backend run two dev servers.
    pub fn is_fullstack(&self) -> bool {
        self.project_type == ProjectType::Fullstack
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolActivity {
    pub name: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_activity: Vec<ToolActivity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

/// One persisted conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub id: String,
    pub project_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub metadata: TurnMetadata,
    pub created_at: DateTime<Utc>,
}

/// Storage operations the conversation orchestrator depends on.
pub trait ProjectStore: Send + Sync {
    fn find_project(&self, id: &str) -> Result<Project, StoreError>;

    /// Set or clear the resumable agent session for a project.
    fn update_resume_token(&self, id: &str, token: Option<&str>) -> Result<(), StoreError>;

    fn append_turn(
        &self,
        project_id: &str,
        role: Role,
        content: &str,
        metadata: TurnMetadata,
    ) -> Result<Turn, StoreError>;

    /// Turns ordered oldest first, skipping `offset`.
    fn list_turns(&self, project_id: &str, limit: usize, offset: usize) -> Result<Vec<Turn>, StoreError>;

    /// The last `n` turns, oldest first.
    fn recent_turns(&self, project_id: &str, n: usize) -> Result<Vec<Turn>, StoreError>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProject {
    pub name: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_project_type")]
    pub project_type: ProjectType,
    #[serde(default)]
    pub backend_framework: Option<BackendFramework>,
}

fn default_project_type() -> ProjectType {
    ProjectType::Frontend
}

/// File-backed [`ProjectStore`].
pub struct FileStore {
    projects_root: PathBuf,
    /// Default parent for project working directories
    workspace_root: PathBuf,
    projects: DashMap<String, Project>,
    turns: DashMap<String, Vec<Turn>>,
}

impl FileStore {
    /// Open (or create) the store, loading every project record.
    pub fn open(data_dir: &Path, workspace_root: &Path) -> Result<Self, StoreError> {
        let projects_root = data_dir.join("projects");
        fs::create_dir_all(&projects_root)?;

        let projects = DashMap::new();
        for entry in fs::read_dir(&projects_root)?.flatten() {
            let record = entry.path().join("project.json");
            if !record.is_file() {
                continue;
            }
            match fs::read_to_string(&record)
                .map_err(StoreError::from)
                .and_then(|s| serde_json::from_str::<Project>(&s).map_err(StoreError::from))
            {
                Ok(project) => {
                    projects.insert(project.id.clone(), project);
                }
                Err(e) => tracing::warn!("Skipping unreadable project {}: {}", record.display(), e),
            }
        }
        tracing::info!("Loaded {} projects from {}", projects.len(), projects_root.display());

        Ok(Self {
            projects_root,
            workspace_root: workspace_root.to_path_buf(),
            projects,
            turns: DashMap::new(),
        })
    }

    pub fn create_project(&self, req: NewProject) -> Result<Project, StoreError> {
        let name = req.name.trim();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ' ') {
            return Err(StoreError::Invalid(
                "Use only letters, numbers, spaces, hyphens and underscores".to_string(),
            ));
        }
        if req.backend_framework.is_some() && req.project_type != ProjectType::Fullstack {
            return Err(StoreError::Invalid(
                "backendFramework requires projectType fullstack".to_string(),
            ));
        }

        let slug: String = name
            .to_ascii_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("-");
        let short = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("{}-{}", slug, &short[..8]);
        // Names repeat, ids do not
        let path = req.path.unwrap_or_else(|| self.workspace_root.join(&id));
        fs::create_dir_all(&path)?;

        let project = Project {
            id: id.clone(),
            name: name.to_string(),
            path,
            project_type: req.project_type,
            backend_framework: match req.project_type {
                ProjectType::Fullstack => Some(req.backend_framework.unwrap_or(BackendFramework::Node)),
                ProjectType::Frontend => None,
            },
            resume_token: None,
            created_at: Utc::now(),
        };
        self.write_project(&project)?;
        self.projects.insert(id, project.clone());
        tracing::info!("Created project {} at {}", project.id, project.path.display());
        Ok(project)
    }

    pub fn list_projects(&self) -> Vec<Project> {
        let mut projects: Vec<Project> = self.projects.iter().map(|r| r.value().clone()).collect();
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        projects
    }

    fn project_dir(&self, id: &str) -> PathBuf {
        self.projects_root.join(id)
    }

    fn write_project(&self, project: &Project) -> Result<(), StoreError> {
        let dir = self.project_dir(&project.id);
        fs::create_dir_all(&dir)?;
        let tmp = dir.join("project.json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(project)?)?;
        fs::rename(&tmp, dir.join("project.json"))?;
        Ok(())
    }

    fn load_turns(&self, project_id: &str) -> Result<Vec<Turn>, StoreError> {
        let path = self.project_dir(project_id).join("messages.jsonl");
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut turns: Vec<Turn> = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<Turn>(line) {
                Ok(turn) => Some(turn),
                Err(e) => {
                    tracing::warn!("Skipping corrupt turn in {}: {}", path.display(), e);
                    None
                }
            })
            .collect();
        turns.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(turns)
    }

    /// Run `f` over the cached transcript, loading it on first use.
    fn with_turns<T>(&self, project_id: &str, f: impl FnOnce(&mut Vec<Turn>) -> T) -> Result<T, StoreError> {
        if !self.projects.contains_key(project_id) {
            return Err(StoreError::NotFound(project_id.to_string()));
        }
        if !self.turns.contains_key(project_id) {
            let loaded = self.load_turns(project_id)?;
            self.turns.entry(project_id.to_string()).or_insert(loaded);
        }
        let mut entry = self
            .turns
            .get_mut(project_id)
            .ok_or_else(|| StoreError::NotFound(project_id.to_string()))?;
        Ok(f(entry.value_mut()))
    }
}

impl ProjectStore for FileStore {
    fn find_project(&self, id: &str) -> Result<Project, StoreError> {
        self.projects
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn update_resume_token(&self, id: &str, token: Option<&str>) -> Result<(), StoreError> {
        let mut project = self.find_project(id)?;
        project.resume_token = token.map(|t| t.to_string());
        self.write_project(&project)?;
        self.projects.insert(id.to_string(), project);
        Ok(())
    }

    fn append_turn(
        &self,
        project_id: &str,
        role: Role,
        content: &str,
        metadata: TurnMetadata,
    ) -> Result<Turn, StoreError> {
        let turn = Turn {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            role,
            content: content.to_string(),
            metadata,
            created_at: Utc::now(),
        };
        let line = serde_json::to_string(&turn)?;
        let path = self.project_dir(project_id).join("messages.jsonl");

        // The transcript shard lock is held across the file append so
        // concurrent appends land in the same order on disk and in memory.
        self.with_turns(project_id, |turns| -> Result<(), StoreError> {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(file, "{}", line)?;
            turns.push(turn.clone());
            Ok(())
        })??;
        Ok(turn)
    }

    fn list_turns(&self, project_id: &str, limit: usize, offset: usize) -> Result<Vec<Turn>, StoreError> {
        self.with_turns(project_id, |turns| {
            turns.iter().skip(offset).take(limit).cloned().collect()
        })
    }

    fn recent_turns(&self, project_id: &str, n: usize) -> Result<Vec<Turn>, StoreError> {
        self.with_turns(project_id, |turns| {
            let skip = turns.len().saturating_sub(n);
            turns[skip..].to_vec()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(&dir.path().join("data"), &dir.path().join("work")).unwrap();
        (dir, store)
    }

    fn new_project(name: &str) -> NewProject {
        NewProject {
            name: name.to_string(),
            path: None,
            project_type: ProjectType::Frontend,
            backend_framework: None,
        }
    }

    #[test]
    fn create_project_makes_working_directory() {
        let (_dir, store) = store();
        let project = store.create_project(new_project("Counter App")).unwrap();
        assert!(project.id.starts_with("counter-app-"));
        assert!(project.path.ends_with(&project.id));
        assert!(project.path.is_dir());
        assert_eq!(store.list_projects().len(), 1);
    }

    #[test]
    fn same_name_gets_separate_working_directories() {
        let (_dir, store) = store();
        let first = store.create_project(new_project("counter")).unwrap();
        let second = store.create_project(new_project("counter")).unwrap();
        assert_ne!(first.id, second.id);
        assert_ne!(first.path, second.path);
        assert!(first.path.is_dir() && second.path.is_dir());
    }

    #[test]
    fn fullstack_defaults_to_node_backend() {
        let (_dir, store) = store();
        let mut req = new_project("api");
        req.project_type = ProjectType::Fullstack;
        let project = store.create_project(req).unwrap();
        assert_eq!(project.backend_framework, Some(BackendFramework::Node));
    }

    #[test]
    fn rejects_bad_names() {
        let (_dir, store) = store();
        assert!(matches!(
            store.create_project(new_project("../escape")),
            Err(StoreError::Invalid(_))
        ));
    }

    #[test]
    fn turns_survive_reopen_in_order() {
        let (dir, store) = store();
        let project = store.create_project(new_project("notes")).unwrap();
        store.append_turn(&project.id, Role::User, "first", TurnMetadata::default()).unwrap();
        store
            .append_turn(
                &project.id,
                Role::Assistant,
                "second",
                TurnMetadata {
                    tool_activity: vec![ToolActivity {
                        name: "Write".to_string(),
                        input: serde_json::json!({"file_path": "a.txt"}),
                    }],
                    cost: Some(0.01),
                },
            )
            .unwrap();
        store.update_resume_token(&project.id, Some("tok")).unwrap();
        drop(store);

        let reopened = FileStore::open(&dir.path().join("data"), &dir.path().join("work")).unwrap();
        let turns = reopened.list_turns(&project.id, 10, 0).unwrap();
        let contents: Vec<&str> = turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second"]);
        assert_eq!(turns[1].metadata.tool_activity[0].name, "Write");
        assert_eq!(
            reopened.find_project(&project.id).unwrap().resume_token.as_deref(),
            Some("tok")
        );
    }

    #[test]
    fn recent_turns_returns_tail_oldest_first() {
        let (_dir, store) = store();
        let project = store.create_project(new_project("tail")).unwrap();
        for i in 0..5 {
            store
                .append_turn(&project.id, Role::User, &format!("m{}", i), TurnMetadata::default())
                .unwrap();
        }
        let recent: Vec<String> = store
            .recent_turns(&project.id, 2)
            .unwrap()
            .into_iter()
            .map(|t| t.content)
            .collect();
        assert_eq!(recent, vec!["m3", "m4"]);
        assert_eq!(store.list_turns(&project.id, 2, 1).unwrap()[0].content, "m1");
    }

    #[test]
    fn unknown_project_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(store.find_project("nope"), Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.append_turn("nope", Role::User, "x", TurnMetadata::default()),
            Err(StoreError::NotFound(_))
        ));
    }
}
