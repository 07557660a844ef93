//! Prompt assembly for agent turns.

use crate::agent::ChatMode;
use crate::config::{HISTORY_CHAR_CAP, HISTORY_TURNS};
use crate::store::{BackendFramework, Project, ProjectType, Role, Turn};

const FRONTEND_PROMPT: &str = r#"You are building a web application inside the current working directory.
The project is a Vite + React + TypeScript frontend. Keep the dev server runnable with `npm run dev`;
it must honour the PORT environment variable and a `--port` flag. Put source files under src/.
Prefer small, focused components and keep package.json scripts intact."#;

const FULLSTACK_NODE_PROMPT: &str = r#"You are building a fullstack web application inside the current working directory.
Layout:
- frontend/: Vite + React + TypeScript, started with `npm run dev` (honours PORT and --port)
- backend/: Node.js (Express) API, started with `npm run dev`, listening on the PORT environment variable
The frontend reaches the API through the VITE_API_URL environment variable. Keep both dev scripts working."#;

const FULLSTACK_PYTHON_PROMPT: &str = r#"You are building a fullstack web application inside the current working directory.
Layout:
- frontend/: Vite + React + TypeScript, started with `npm run dev` (honours PORT and --port)
- backend/: FastAPI application in backend/main.py exposing `app`, dependencies in backend/requirements.txt,
  served with `uvicorn main:app --port <PORT>`
The frontend reaches the API through the VITE_API_URL environment variable. Keep requirements.txt up to date."#;

const ASK_MODE_PREFACE: &str = "The user is asking a question about the project. Answer it by reading and searching the code. Do not modify any files or run commands.";

/// System prompt for the project's stack.
pub fn system_prompt(project: &Project) -> &'static str {
    match (project.project_type, project.backend_framework) {
        (ProjectType::Frontend, _) => FRONTEND_PROMPT,
        (ProjectType::Fullstack, Some(BackendFramework::Python)) => FULLSTACK_PYTHON_PROMPT,
        (ProjectType::Fullstack, _) => FULLSTACK_NODE_PROMPT,
    }
}

/// Cap `content` at `max` characters, marking the cut with an ellipsis.
pub fn truncate_chars(content: &str, max: usize) -> String {
    match content.char_indices().nth(max) {
        None => content.to_string(),
        Some((idx, _)) => format!("{}...", &content[..idx]),
    }
}

/// Render prior turns as a transcript block. Only the last
/// [`HISTORY_TURNS`] are kept, each capped at [`HISTORY_CHAR_CAP`].
pub fn history_context(turns: &[Turn]) -> Option<String> {
    let skip = turns.len().saturating_sub(HISTORY_TURNS);
    let lines: Vec<String> = turns[skip..]
        .iter()
        .map(|turn| {
            let speaker = match turn.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::System => "System",
            };
            format!("{}: {}", speaker, truncate_chars(&turn.content, HISTORY_CHAR_CAP))
        })
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n\n"))
    }
}

/// Full prompt text for one turn. `history` is only passed when no external
/// session exists yet; resumed sessions carry their own memory.
pub fn build_prompt(project: &Project, mode: ChatMode, history: Option<&[Turn]>, message: &str) -> String {
    let mut prompt = String::from(system_prompt(project));
    if mode == ChatMode::Ask {
        prompt.push_str("\n\n");
        prompt.push_str(ASK_MODE_PREFACE);
    }
    if let Some(context) = history.and_then(history_context) {
        prompt.push_str("\n\n## Previous conversation\n\n");
        prompt.push_str(&context);
    }
    prompt.push_str("\n\n## Current request\n\n");
    prompt.push_str(message);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TurnMetadata;
    use chrono::Utc;
    use std::path::PathBuf;

    fn project(kind: ProjectType, backend: Option<BackendFramework>) -> Project {
        Project {
            id: "p".to_string(),
            name: "p".to_string(),
            path: PathBuf::from("/tmp/p"),
            project_type: kind,
            backend_framework: backend,
            resume_token: None,
            created_at: Utc::now(),
        }
    }

    fn turn(role: Role, content: &str) -> Turn {
        Turn {
            id: content.to_string(),
            project_id: "p".to_string(),
            role,
            content: content.to_string(),
            metadata: TurnMetadata::default(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn system_prompt_follows_stack() {
        assert!(system_prompt(&project(ProjectType::Frontend, None)).contains("Vite"));
        assert!(system_prompt(&project(ProjectType::Fullstack, Some(BackendFramework::Python)))
            .contains("FastAPI"));
        assert!(system_prompt(&project(ProjectType::Fullstack, None)).contains("Express"));
    }

    #[test]
    fn truncation_adds_ellipsis_only_when_cut() {
        assert_eq!(truncate_chars("short", 500), "short");
        let long = "é".repeat(501);
        let cut = truncate_chars(&long, 500);
        assert_eq!(cut.chars().count(), 503);
        assert!(cut.ends_with("..."));
        assert_eq!(truncate_chars(&"a".repeat(500), 500).len(), 500);
    }

    #[test]
    fn history_keeps_last_ten_turns() {
        let turns: Vec<Turn> = (0..12).map(|i| turn(Role::User, &format!("msg-{}", i))).collect();
        let ctx = history_context(&turns).unwrap();
        assert!(!ctx.contains("msg-0\n") && !ctx.contains("msg-1\n"));
        assert!(ctx.starts_with("User: msg-2"));
        assert!(ctx.ends_with("User: msg-11"));
        assert_eq!(ctx.matches("User: ").count(), 10);
    }

    #[test]
    fn history_caps_each_turn() {
        let turns = vec![turn(Role::Assistant, &"x".repeat(800))];
        let ctx = history_context(&turns).unwrap();
        assert_eq!(ctx, format!("Assistant: {}...", "x".repeat(500)));
    }

    #[test]
    fn prompt_without_history_has_no_transcript() {
        let p = project(ProjectType::Frontend, None);
        let prompt = build_prompt(&p, ChatMode::Build, None, "Build a counter");
        assert!(!prompt.contains("Previous conversation"));
        assert!(prompt.ends_with("## Current request\n\nBuild a counter"));

        let empty: Vec<Turn> = Vec::new();
        let prompt = build_prompt(&p, ChatMode::Build, Some(&empty), "hi");
        assert!(!prompt.contains("Previous conversation"));
    }

    #[test]
    fn ask_mode_adds_read_only_preface() {
        let p = project(ProjectType::Frontend, None);
        let history = vec![turn(Role::User, "earlier")];
        let prompt = build_prompt(&p, ChatMode::Ask, Some(&history), "What does App.tsx do?");
        assert!(prompt.contains("Do not modify any files"));
        assert!(prompt.contains("User: earlier"));
    }
}
