//! Automatic repair of previews that crash during startup.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::detect::ProjectType;
use crate::error::{RunnerError, RunnerResult};

/// What went wrong, handed to a [`FailureFixer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureContext {
    pub project_dir: PathBuf,
    pub project_type: ProjectType,
    pub command: String,
    pub exit_code: Option<i32>,
    /// Most recent output lines, oldest first
    pub recent_logs: Vec<String>,
    pub model: String,
}

/// Full replacement content for one project file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePatch {
    pub path: String,
    pub content: String,
}

impl FilePatch {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }

    /// First non-empty line, for display.
    pub fn excerpt(&self) -> String {
        self.content
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or_default()
            .chars()
            .take(120)
            .collect()
    }
}

/// Proposes file changes that should let a crashed preview start.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FailureFixer: Send + Sync {
    async fn propose_fix(&self, failure: &FailureContext) -> RunnerResult<Vec<FilePatch>>;
}

/// Write `patch` inside `project_dir`, refusing paths that escape it.
pub fn apply_patch(project_dir: &Path, patch: &FilePatch) -> RunnerResult<PathBuf> {
    let relative = Path::new(&patch.path);
    let escapes = relative.as_os_str().is_empty()
        || relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(RunnerError::FixFailed(format!(
            "refusing to write outside the project: {}",
            patch.path
        )));
    }

    let target = project_dir.join(relative);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&target, &patch.content)?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_apply_patch_writes_nested_file() {
        let dir = TempDir::new().unwrap();
        let patch = FilePatch::new("src/server.js", "\nconst port = 3000;\n");
        let target = apply_patch(dir.path(), &patch).unwrap();
        assert_eq!(
            std::fs::read_to_string(target).unwrap(),
            "\nconst port = 3000;\n"
        );
        assert_eq!(patch.excerpt(), "const port = 3000;");
    }

    #[test]
    fn test_apply_patch_rejects_escaping_paths() {
        let dir = TempDir::new().unwrap();
        for path in ["../evil.js", "/etc/passwd", ""] {
            let err = apply_patch(dir.path(), &FilePatch::new(path, "x")).unwrap_err();
            assert!(matches!(err, RunnerError::FixFailed(_)), "{}", path);
        }
    }
}
