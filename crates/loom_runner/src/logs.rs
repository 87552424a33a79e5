//! Bounded per-session log buffers and AI patch markers.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Token that marks an automatically applied patch in process output.
pub const PATCH_MARKER: &str = "AI_PATCH_APPLIED";

/// Where a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOrigin {
    Install,
    Run,
    Supervisor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Level for a line of child output.
    pub fn classify(line: &str, from_stderr: bool) -> Self {
        let lower = line.to_lowercase();
        if lower.contains("warn") {
            LogLevel::Warn
        } else if from_stderr || lower.contains("error") {
            LogLevel::Error
        } else {
            LogLevel::Info
        }
    }
}

/// A patch reported by a marker line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiPatch {
    pub file: String,
    pub excerpt: String,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub origin: LogOrigin,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<AiPatch>,
}

impl LogEntry {
    pub fn new(origin: LogOrigin, level: LogLevel, message: impl Into<String>) -> Self {
        let message = message.into();
        let timestamp = Utc::now();
        let patch = parse_patch_marker(&message, timestamp);
        Self {
            timestamp,
            origin,
            level,
            message,
            patch,
        }
    }

    pub fn is_patch(&self) -> bool {
        self.patch.is_some()
    }
}

fn legacy_marker() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^:?\s*File '([^']+)' patched by AI\.?\s*(.*)$").ok())
        .as_ref()
}

/// Extract a patch from either marker form:
///
/// - `AI_PATCH_APPLIED: File 'src/app.js' patched by AI.`
/// - `AI_PATCH_APPLIED {"file": "src/app.js", "excerpt": "..."}`
pub fn parse_patch_marker(line: &str, at: DateTime<Utc>) -> Option<AiPatch> {
    let start = line.find(PATCH_MARKER)?;
    let rest = line[start + PATCH_MARKER.len()..].trim();

    if rest.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(rest).ok()?;
        let file = value.get("file")?.as_str()?.to_string();
        let excerpt = value
            .get("excerpt")
            .and_then(|e| e.as_str())
            .unwrap_or_default()
            .to_string();
        return Some(AiPatch {
            file,
            excerpt,
            applied_at: at,
        });
    }

    let captures = legacy_marker()?.captures(rest)?;
    Some(AiPatch {
        file: captures.get(1)?.as_str().to_string(),
        excerpt: captures
            .get(2)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default(),
        applied_at: at,
    })
}

/// Marker line written when the supervisor applies a fix itself.
pub fn patch_marker_line(file: &str, excerpt: &str) -> String {
    format!(
        "{} {}",
        PATCH_MARKER,
        serde_json::json!({"file": file, "excerpt": excerpt})
    )
}

/// Fixed-capacity log buffer; the oldest entries are evicted first.
#[derive(Debug)]
pub struct LogRing {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    dropped: u64,
}

pub type SharedLogs = Arc<Mutex<LogRing>>;

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            dropped: 0,
        }
    }

    pub fn shared(capacity: usize) -> SharedLogs {
        Arc::new(Mutex::new(Self::new(capacity)))
    }

    pub fn push(&mut self, entry: LogEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.dropped += 1;
        }
        self.entries.push_back(entry);
    }

    pub fn record(&mut self, origin: LogOrigin, level: LogLevel, message: impl Into<String>) {
        self.push(LogEntry::new(origin, level, message));
    }

    /// Ordinary log lines, oldest first. Patch markers are reported by [`Self::patches`].
    pub fn lines(&self) -> Vec<LogEntry> {
        self.entries.iter().filter(|e| !e.is_patch()).cloned().collect()
    }

    pub fn patches(&self) -> Vec<AiPatch> {
        self.entries.iter().filter_map(|e| e.patch.clone()).collect()
    }

    /// Messages of the last `n` entries.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries
            .iter()
            .skip(skip)
            .map(|e| e.message.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.dropped = 0;
    }
}
