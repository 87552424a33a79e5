//! Project file handling: response parsing, listing, and transactional writes.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{CoreError, CoreResult};
use crate::generation::{FilePreview, GeneratedFile};

/// Trailing marker a model emits when it ran out of output budget.
pub const INCOMPLETE_MARKER: &str = "GENERATION_INCOMPLETE";

/// Written at the project root while agent-team verification runs.
pub const VERIFICATION_IN_PROGRESS: &str = "verification_in_progress.txt";

/// Written at the project root once agent-team verification is done.
pub const VERIFICATION_COMPLETE: &str = "verification_complete.txt";

/// Prefix of the staging directory used during a commit.
const STAGING_PREFIX: &str = ".loom-staging-";

/// Directories never listed or previewed.
const IGNORED_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "__pycache__",
    "venv",
    ".venv",
    "dist",
    "build",
    "target",
];

fn header_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)^\s*---\s*FILE:\s*(.+?)\s*---\s*$",
            r"(?i)^\s*(?:\*\*)?FILE:\s*`?([^`*]+?)`?(?:\*\*)?\s*$",
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

/// Whether a response ends with the incomplete marker.
pub fn is_incomplete(text: &str) -> bool {
    text.trim_end().ends_with(INCOMPLETE_MARKER)
}

/// Split a model response into files.
///
/// Accepts `--- FILE: path ---` markers followed by raw or fenced content,
/// and `FILE: path` headers followed by a fenced block. Text before the first
/// header is ignored, as are blocks whose path is unsafe.
pub fn parse_file_blocks(text: &str) -> Vec<GeneratedFile> {
    let mut files = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in text.lines() {
        let header = header_patterns()
            .iter()
            .find_map(|re| re.captures(line))
            .map(|c| c[1].trim().to_string());

        if let Some(path) = header {
            if let Some((path, body)) = current.take() {
                push_block(&mut files, path, &body);
            }
            current = Some((path, Vec::new()));
        } else if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }
    if let Some((path, body)) = current.take() {
        push_block(&mut files, path, &body);
    }
    files
}

fn push_block(files: &mut Vec<GeneratedFile>, path: String, body: &[&str]) {
    let path = match normalize_relative(&path) {
        Ok(normalized) => normalized.to_string_lossy().replace('\\', "/"),
        Err(e) => {
            warn!("Skipping generated block: {}", e);
            return;
        }
    };
    let content = strip_fences(body);
    files.retain(|f| f.path != path);
    files.push(GeneratedFile::new(path, content));
}

fn strip_fences(body: &[&str]) -> String {
    let lines: Vec<&str> = body
        .iter()
        .copied()
        .filter(|l| l.trim() != INCOMPLETE_MARKER)
        .collect();

    let first = lines.iter().position(|l| !l.trim().is_empty());
    let last = lines.iter().rposition(|l| !l.trim().is_empty());
    let (Some(first), Some(last)) = (first, last) else {
        return String::new();
    };
    let mut slice = &lines[first..=last];

    if slice[0].trim_start().starts_with("```") {
        slice = &slice[1..];
        if let Some(close) = slice.iter().rposition(|l| l.trim() == "```") {
            slice = &slice[..close];
        }
    }

    let mut content = slice.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    content
}

/// Validate a generated path and turn it into a safe relative path.
pub fn normalize_relative(path: &str) -> CoreResult<PathBuf> {
    let cleaned = path.trim().replace('\\', "/");
    let cleaned = cleaned.trim_start_matches("./");
    if cleaned.is_empty() {
        return Err(CoreError::UnsafePath("empty path".to_string()));
    }

    let candidate = Path::new(cleaned);
    let mut normalized = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            _ => return Err(CoreError::UnsafePath(path.to_string())),
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(CoreError::UnsafePath(path.to_string()));
    }
    Ok(normalized)
}

fn is_ignored(entry: &walkdir::DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    entry.depth() > 0
        && (IGNORED_DIRS.contains(&name.as_ref()) || name.starts_with(STAGING_PREFIX))
}

/// Relative paths of every project file, sorted, with `/` separators.
pub fn list_project_files(root: &Path) -> CoreResult<Vec<String>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_entry(|e| !is_ignored(e)) {
        let entry = entry.map_err(|e| CoreError::Io(std::io::Error::other(e.to_string())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.depth() == 1 {
            let name = entry.file_name().to_string_lossy();
            if name == VERIFICATION_IN_PROGRESS || name == VERIFICATION_COMPLETE {
                continue;
            }
        }
        if let Ok(relative) = entry.path().strip_prefix(root) {
            files.push(relative.to_string_lossy().replace('\\', "/"));
        }
    }
    files.sort();
    Ok(files)
}

/// Read the first `max_chars` characters of each listed file.
pub fn read_previews(root: &Path, paths: &[String], max_chars: usize) -> Vec<FilePreview> {
    paths
        .iter()
        .filter_map(|path| {
            let content = fs::read_to_string(root.join(path)).ok()?;
            let content: String = content.chars().take(max_chars).collect();
            Some(FilePreview {
                path: path.clone(),
                content,
            })
        })
        .collect()
}

/// A set of file writes that lands as a whole or not at all.
#[derive(Debug)]
pub struct FileBatch {
    root: PathBuf,
    files: Vec<(PathBuf, String)>,
}

struct AppliedWrite {
    target: PathBuf,
    backup: Option<PathBuf>,
    placed: bool,
    /// Directories this write created, deepest first
    created_dirs: Vec<PathBuf>,
}

impl FileBatch {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: Vec::new(),
        }
    }

    /// Queue a file; a later entry for the same path replaces the earlier one.
    pub fn add(&mut self, path: &str, content: impl Into<String>) -> CoreResult<()> {
        let relative = normalize_relative(path)?;
        self.files.retain(|(p, _)| *p != relative);
        self.files.push((relative, content.into()));
        Ok(())
    }

    pub fn from_generated(root: impl Into<PathBuf>, files: &[GeneratedFile]) -> CoreResult<Self> {
        let mut batch = Self::new(root);
        for file in files {
            batch.add(&file.path, file.content.clone())?;
        }
        Ok(batch)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Write every queued file, returning their relative paths.
    ///
    /// Content is staged next to the project first; files are then renamed
    /// into place. If any placement fails, already placed files are removed
    /// and overwritten ones restored from their backups.
    pub fn commit(self) -> CoreResult<Vec<String>> {
        if self.files.is_empty() {
            return Ok(Vec::new());
        }
        fs::create_dir_all(&self.root)?;
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&self.root)?;

        for (index, (_, content)) in self.files.iter().enumerate() {
            fs::write(staging.path().join(index.to_string()), content)?;
        }

        let mut applied: Vec<AppliedWrite> = Vec::with_capacity(self.files.len());
        for (index, (relative, _)) in self.files.iter().enumerate() {
            let mut write = AppliedWrite {
                target: self.root.join(relative),
                backup: None,
                placed: false,
                created_dirs: Vec::new(),
            };
            let staged = staging.path().join(index.to_string());
            let backup = staging.path().join(format!("{}.bak", index));
            let result = place(&staged, &backup, &mut write);
            applied.push(write);
            if let Err(e) = result {
                warn!(
                    "Write of {} failed, rolling back {} file(s): {}",
                    relative.display(),
                    applied.len(),
                    e
                );
                rollback(&applied);
                return Err(CoreError::Io(e));
            }
        }

        debug!("Committed {} file(s) under {:?}", applied.len(), self.root);
        Ok(self
            .files
            .iter()
            .map(|(p, _)| p.to_string_lossy().replace('\\', "/"))
            .collect())
    }
}

fn place(staged: &Path, backup: &Path, write: &mut AppliedWrite) -> std::io::Result<()> {
    if let Some(parent) = write.target.parent() {
        let mut missing = parent;
        while !missing.exists() {
            write.created_dirs.push(missing.to_path_buf());
            match missing.parent() {
                Some(up) => missing = up,
                None => break,
            }
        }
        fs::create_dir_all(parent)?;
    }
    if write.target.is_file() {
        fs::rename(&write.target, backup)?;
        write.backup = Some(backup.to_path_buf());
    }
    fs::rename(staged, &write.target)?;
    write.placed = true;
    Ok(())
}

fn rollback(applied: &[AppliedWrite]) {
    for write in applied.iter().rev() {
        if write.placed {
            if let Err(e) = fs::remove_file(&write.target) {
                warn!("Rollback could not remove {:?}: {}", write.target, e);
            }
        }
        if let Some(backup) = &write.backup {
            if let Err(e) = fs::rename(backup, &write.target) {
                warn!("Rollback could not restore {:?}: {}", write.target, e);
            }
        }
        for dir in &write.created_dirs {
            if let Err(e) = fs::remove_dir(dir) {
                debug!("Rollback left directory {:?}: {}", dir, e);
            }
        }
    }
}
