//! Local checks run by the validation and auto-fix phases.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CoreResult;
use crate::files::list_project_files;

/// Category of a local validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    EmptyFile,
    MissingFile,
    InvalidJson,
}

/// One problem found in the generated tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub kind: IssueKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub files_checked: usize,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    /// Paths of files that exist but have no content.
    pub fn empty_files(&self) -> Vec<String> {
        self.issues
            .iter()
            .filter(|i| i.kind == IssueKind::EmptyFile)
            .map(|i| i.path.clone())
            .collect()
    }
}

/// Checks a project directory for obviously broken output.
pub struct ProjectValidator;

impl ProjectValidator {
    /// Validate `root` against the files the architecture promised.
    pub fn validate(root: &Path, planned: &[String]) -> CoreResult<ValidationReport> {
        let files = list_project_files(root)?;
        let mut issues = Vec::new();

        for path in &files {
            let full = root.join(path);
            let content = fs::read(&full)?;
            if content.iter().all(|b| b.is_ascii_whitespace()) {
                issues.push(ValidationIssue {
                    path: path.clone(),
                    kind: IssueKind::EmptyFile,
                    message: "file is empty".to_string(),
                });
                continue;
            }
            if path.ends_with(".json") {
                if let Err(e) = serde_json::from_slice::<serde_json::Value>(&content) {
                    issues.push(ValidationIssue {
                        path: path.clone(),
                        kind: IssueKind::InvalidJson,
                        message: format!("invalid JSON: {}", e),
                    });
                }
            }
        }

        for path in planned {
            let normalized = path.trim_start_matches("./").replace('\\', "/");
            if !normalized.ends_with('/') && !files.contains(&normalized) {
                issues.push(ValidationIssue {
                    path: normalized,
                    kind: IssueKind::MissingFile,
                    message: "planned file was not generated".to_string(),
                });
            }
        }

        debug!(
            "Validated {} file(s) in {:?}: {} issue(s)",
            files.len(),
            root,
            issues.len()
        );
        Ok(ValidationReport {
            files_checked: files.len(),
            issues,
        })
    }
}
