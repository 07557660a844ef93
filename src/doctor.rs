//! `kiln doctor`: check the external tools kiln drives.

use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

use crate::config::Config;
use crate::process::run_with_timeout;

const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ToolCheck {
    pub label: &'static str,
    pub command: String,
    pub required: bool,
    /// First line of `--version`, when the tool ran
    pub version: Option<String>,
}

impl ToolCheck {
    fn status(&self) -> &'static str {
        match (&self.version, self.required) {
            (Some(_), _) => "ok",
            (None, true) => "MISSING",
            (None, false) => "missing (optional)",
        }
    }
}

/// Version string of `command`, if it runs.
pub async fn probe_version(command: &str) -> Option<String> {
    let mut cmd = Command::new(command);
    cmd.arg("--version");
    let output = match run_with_timeout(cmd, VERSION_TIMEOUT).await {
        Ok(output) => output,
        Err(_) => return None,
    };
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let line = stdout
        .lines()
        .chain(stderr.lines())
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("installed");
    Some(line.to_string())
}

/// The agent CLI keeps credentials or past sessions under ~/.claude once logged in.
fn agent_logged_in(home: &Path) -> bool {
    let dir = home.join(".claude");
    [".credentials", ".credentials.json", "credentials.json"]
        .iter()
        .any(|f| dir.join(f).exists())
        || dir.join("projects").is_dir()
}

pub async fn run_checks(config: &Config) -> Vec<ToolCheck> {
    let tools: [(&'static str, String, bool); 6] = [
        ("claude", config.agent.cli.clone(), true),
        ("node", "node".to_string(), true),
        ("npm", config.preview.npm.clone(), true),
        ("script", "script".to_string(), false),
        ("python", config.preview.python.clone(), false),
        ("git", "git".to_string(), false),
    ];

    let mut checks = Vec::with_capacity(tools.len());
    for (label, command, required) in tools {
        let version = probe_version(&command).await;
        checks.push(ToolCheck {
            label,
            command,
            required,
            version,
        });
    }
    checks
}

pub fn format_table(checks: &[ToolCheck]) -> String {
    let width = checks.iter().map(|c| c.command.len()).max().unwrap_or(0).max(7);
    let mut out = format!("{:<8} {:<width$} {:<20} {}\n", "TOOL", "COMMAND", "STATUS", "VERSION", width = width);
    for check in checks {
        out.push_str(&format!(
            "{:<8} {:<width$} {:<20} {}\n",
            check.label,
            check.command,
            check.status(),
            check.version.as_deref().unwrap_or("-"),
            width = width
        ));
    }
    out
}

/// Print the report. Returns false when a required tool is missing.
pub async fn run(config: &Config) -> bool {
    let checks = run_checks(config).await;
    print!("{}", format_table(&checks));

    if let Some(home) = dirs::home_dir() {
        if !agent_logged_in(&home) {
            println!("\nclaude does not look logged in yet. Run `claude` once in a terminal to authenticate.");
        }
    }
    println!("\nData dir:     {}", config.data_dir.display());
    println!("Projects dir: {}", config.projects_dir.display());

    let missing: Vec<&str> = checks
        .iter()
        .filter(|c| c.required && c.version.is_none())
        .map(|c| c.label)
        .collect();
    if missing.is_empty() {
        true
    } else {
        println!("\nMissing required tools: {}", missing.join(", "));
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(label: &'static str, required: bool, version: Option<&str>) -> ToolCheck {
        ToolCheck {
            label,
            command: label.to_string(),
            required,
            version: version.map(str::to_string),
        }
    }

    #[test]
    fn table_marks_missing_tools() {
        let table = format_table(&[
            check("node", true, Some("v20.11.0")),
            check("npm", true, None),
            check("git", false, None),
        ]);
        let lines: Vec<&str> = table.lines().collect();
        assert!(lines[0].starts_with("TOOL"));
        assert!(lines[1].contains("ok") && lines[1].contains("v20.11.0"));
        assert!(lines[2].contains("MISSING"));
        assert!(lines[3].contains("missing (optional)"));
    }

    #[tokio::test]
    async fn absent_binary_has_no_version() {
        assert!(probe_version("/nonexistent/kiln-tool").await.is_none());
    }

    #[test]
    fn login_detected_from_session_dir() {
        let home = tempfile::tempdir().unwrap();
        assert!(!agent_logged_in(home.path()));
        std::fs::create_dir_all(home.path().join(".claude/projects")).unwrap();
        assert!(agent_logged_in(home.path()));
    }
}
