//! Turning model replies into phase artifacts.

use loom_core::files::is_incomplete;
use loom_core::{parse_file_blocks, PhaseArtifact, PhaseKind, UpstreamError};
use serde_json::Value;

/// Pull a JSON object out of a reply that may wrap it in prose or fences.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return value.is_object().then_some(value);
    }

    let fenced = trimmed
        .find("```")
        .map(|start| &trimmed[start + 3..])
        .map(|rest| rest.strip_prefix("json").unwrap_or(rest))
        .and_then(|rest| rest.find("```").map(|end| rest[..end].trim()));
    if let Some(Ok(value)) = fenced.map(serde_json::from_str::<Value>) {
        if value.is_object() {
            return Some(value);
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&trimmed[start..=end])
        .ok()
        .filter(Value::is_object)
}

fn summary_of(document: &Value, fallback: &str) -> String {
    document
        .get("summary")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| fallback.to_string())
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .chars()
        .take(200)
        .collect()
}

/// Interpret a reply for `phase`.
pub fn parse_artifact(phase: PhaseKind, reply: &str) -> Result<PhaseArtifact, UpstreamError> {
    if reply.trim().is_empty() {
        return Err(UpstreamError::InvalidResponse(format!(
            "{} returned an empty reply",
            phase.label()
        )));
    }

    if phase.produces_files() {
        let files = parse_file_blocks(reply);
        let count = files.len();
        let mut artifact = PhaseArtifact::files(format!("{} file(s)", count), files);
        if is_incomplete(reply) {
            artifact = artifact.incomplete();
        }
        return Ok(artifact);
    }

    match extract_json(reply) {
        Some(document) => {
            let summary = summary_of(&document, phase.label());
            if phase == PhaseKind::AgentTeamVerification
                && document.get("passed").and_then(Value::as_bool) == Some(false)
            {
                return Err(UpstreamError::InvalidResponse(format!(
                    "verification failed: {}",
                    summary
                )));
            }
            Ok(PhaseArtifact::document(summary, document))
        }
        None if phase.requires_document() => Err(UpstreamError::InvalidResponse(format!(
            "{} reply is not a JSON object",
            phase.label()
        ))),
        None => Ok(PhaseArtifact::summary(first_line(reply))),
    }
}
