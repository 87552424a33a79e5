//! Prompts for each generation phase.

use std::fmt::Write;

use loom_core::{GenerationMode, PhaseKind, PhaseRequest, INCOMPLETE_MARKER};
use loom_runner::FailureContext;
use serde_json::Value;

const FILE_FORMAT: &str = "Return every file as a block that starts with a line \
`--- FILE: relative/path ---` followed by the complete file content. Paths are \
relative to the project root. Do not add commentary between blocks.";

/// System prompt for a phase.
pub fn system_prompt(phase: PhaseKind, mode: GenerationMode) -> String {
    match phase {
        PhaseKind::RequirementsAnalysis => "You are a senior product analyst. Turn the user's \
            application description into a JSON object with the keys `summary` (string), \
            `features` (array of strings), `needs_database` (boolean) and `needs_api` \
            (boolean, true only when a separate backend service is required). Answer with \
            JSON only."
            .to_string(),
        PhaseKind::ArchitectureDesign => "You are a software architect. Design the smallest \
            project that satisfies the analysed requirements. Answer with a JSON object with \
            the keys `summary`, `stack` and `files`, where `files` lists every file to create \
            as objects `{\"path\": ..., \"purpose\": ...}`. Prefer plain HTML, CSS and \
            JavaScript unless the requirements need more. Answer with JSON only."
            .to_string(),
        PhaseKind::DatabaseSchemaDesign => "You are a database designer. Produce a JSON \
            object with `summary` and `tables`, each table having `name`, `columns` and \
            `relations`. Answer with JSON only."
            .to_string(),
        PhaseKind::ApiDesign => "You are an API designer. Produce a JSON object with \
            `summary` and `endpoints`, each endpoint having `method`, `path`, `request` and \
            `response`. Answer with JSON only."
            .to_string(),
        PhaseKind::CodeGeneration => match mode {
            GenerationMode::Full => format!(
                "You are an expert developer. Write the complete project described by the \
                 architecture. Every file must be complete and runnable; include a \
                 package.json or requirements.txt when dependencies are needed. {} If you \
                 run out of space, end your answer with the line {}.",
                FILE_FORMAT, INCOMPLETE_MARKER
            ),
            GenerationMode::Incremental => format!(
                "You are an expert developer updating an existing project according to user \
                 feedback. Return only the files that must be created or changed, each in \
                 full. Leave every other file out of your answer. {}",
                FILE_FORMAT
            ),
        },
        PhaseKind::Validation => "You are a code reviewer. Review the project files and \
            the reported issues. Answer with a JSON object with `summary` and `issues`, each \
            issue having `path` and `problem`."
            .to_string(),
        PhaseKind::AutoFix => format!(
            "You are an expert developer fixing a generated project. Rewrite the files listed \
             in the issues so that they are complete and correct. {}",
            FILE_FORMAT
        ),
        PhaseKind::AgentTeamVerification => "You are a QA lead verifying a finished \
            project against its requirements. Answer with a JSON object with `passed` \
            (boolean) and `summary`."
            .to_string(),
    }
}

fn section(out: &mut String, title: &str, body: &str) {
    let _ = write!(out, "\n## {}\n{}\n", title, body.trim_end());
}

fn document(value: &Option<Value>) -> Option<String> {
    value
        .as_ref()
        .and_then(|v| serde_json::to_string_pretty(v).ok())
}

/// User message carrying everything the phase needs.
pub fn user_message(request: &PhaseRequest) -> String {
    let mut out = String::new();
    section(&mut out, "Application description", &request.requirements);

    let context = &request.context;
    let documents = [
        ("Requirements analysis", document(&context.analysis)),
        ("Architecture", document(&context.architecture)),
        ("Database schema", document(&context.schema)),
        ("API design", document(&context.api_spec)),
    ];
    for (title, body) in documents {
        if let Some(body) = body {
            section(&mut out, title, &body);
        }
    }

    if let Some(feedback) = &request.feedback {
        section(&mut out, "User feedback to apply", feedback);
    }
    if !request.existing_files.is_empty() {
        section(
            &mut out,
            "Existing files",
            &request.existing_files.join("\n"),
        );
    }
    for preview in &request.file_previews {
        section(
            &mut out,
            &format!("Current content of {}", preview.path),
            &preview.content,
        );
    }
    if !request.issues.is_empty() {
        let issues: Vec<String> = request
            .issues
            .iter()
            .map(|i| format!("- {}: {}", i.path, i.message))
            .collect();
        section(&mut out, "Issues found", &issues.join("\n"));
    }

    let _ = write!(out, "\nTask: {}", request.phase.label());
    out
}

pub fn fix_system_prompt() -> String {
    format!(
        "You are an expert developer. A generated project crashed on startup. Find the \
         cause in the output and return corrected versions of the files that need to \
         change, and nothing else. {}",
        FILE_FORMAT
    )
}

pub fn fix_user_message(failure: &FailureContext, files: &[String]) -> String {
    let mut out = String::new();
    section(
        &mut out,
        "Project",
        &format!(
            "type: {}\ncommand: {}\nexit code: {}",
            failure.project_type,
            failure.command,
            failure
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        ),
    );
    section(&mut out, "Output", &failure.recent_logs.join("\n"));
    if !files.is_empty() {
        section(&mut out, "Files", &files.join("\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::FilePreview;
    use serde_json::json;

    #[test]
    fn test_incremental_prompt_asks_for_changed_files_only() {
        let prompt = system_prompt(PhaseKind::CodeGeneration, GenerationMode::Incremental);
        assert!(prompt.contains("only the files"));
        assert!(prompt.contains("--- FILE:"));

        let full = system_prompt(PhaseKind::CodeGeneration, GenerationMode::Full);
        assert!(full.contains(INCOMPLETE_MARKER));
    }

    #[test]
    fn test_user_message_includes_context() {
        let mut request = PhaseRequest::new("s1", PhaseKind::CodeGeneration, "m", "a to-do list");
        request.context.architecture = Some(json!({"files": ["index.html"]}));
        request.feedback = Some("make the button blue".to_string());
        request.existing_files = vec!["index.html".to_string()];
        request.file_previews = vec![FilePreview {
            path: "index.html".to_string(),
            content: "<button>Add</button>".to_string(),
        }];

        let message = user_message(&request);
        assert!(message.contains("a to-do list"));
        assert!(message.contains("## Architecture"));
        assert!(message.contains("make the button blue"));
        assert!(message.contains("Current content of index.html"));
        assert!(!message.contains("## Database schema"));
    }
}
