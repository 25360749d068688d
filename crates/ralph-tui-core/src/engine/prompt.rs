//! Prompt builder (SPEC_FULL.md §4.2a): composes the agent prompt from a
//! system template selected by tracker kind, the task record, the progress
//! file tail, and the previous iteration's output summary. Grounded on the
//! teacher's `prompts/loader.rs` + `agent/loop_.rs` context-assembly
//! pattern, generalized from chat-message history to task/iteration history.

use std::path::Path;

use crate::iteration::IterationResult;
use crate::task::Task;

/// Tail length (bytes) of `progress.md` included in a prompt.
const PROGRESS_TAIL_BYTES: usize = 2000;
/// Tail length (chars) of the previous iteration's stdout included as a
/// one-paragraph summary.
const PREVIOUS_OUTPUT_TAIL_CHARS: usize = 400;

/// Outcome of [`generate_prompt_preview`], mirroring the wire shape from
/// spec.md §4.2's `generatePromptPreview`.
#[derive(Debug, Clone)]
pub struct PromptPreview {
    pub success: bool,
    pub prompt: Option<String>,
    pub source: Option<String>,
    pub error: Option<String>,
}

fn system_template(tracker_kind: &str) -> (&'static str, &'static str) {
    match tracker_kind {
        "beads" => (
            "beads-default",
            "You are an autonomous coding agent working through a beads-tracked backlog. \
             Complete the task below, committing your changes when the task's acceptance \
             criteria are met, and update its status through the tracker tools available to you.",
        ),
        "prd-json" => (
            "prd-json-default",
            "You are an autonomous coding agent working through a PRD-derived task list. \
             Complete the task below, implement it fully, and mark it done when finished.",
        ),
        _ => (
            "generic-default",
            "You are an autonomous coding agent. Complete the task below.",
        ),
    }
}

/// Build the full prompt text for `task`, given the tracker's reported
/// `tracker_kind`, an optional `progress.md` path, and the previous
/// iteration's result (if any).
pub fn build_prompt(
    tracker_kind: &str,
    task: &Task,
    progress_md_path: Option<&Path>,
    previous_iteration: Option<&IterationResult>,
) -> (String, String) {
    let (source, template) = system_template(tracker_kind);

    let mut sections = vec![template.to_string(), task_section(task)];

    if let Some(progress) = progress_md_path.and_then(|p| read_tail(p, PROGRESS_TAIL_BYTES)) {
        sections.push(format!("## Prior progress notes\n{progress}"));
    }

    if let Some(previous) = previous_iteration {
        sections.push(previous_summary(previous));
    }

    (sections.join("\n\n"), source.to_string())
}

/// Run the prompt builder for `task` without executing the agent, matching
/// spec.md §4.2's `generatePromptPreview` read-only helper.
pub fn generate_prompt_preview(
    tracker_kind: &str,
    task: Option<&Task>,
    progress_md_path: Option<&Path>,
    previous_iteration: Option<&IterationResult>,
) -> PromptPreview {
    let Some(task) = task else {
        return PromptPreview {
            success: false,
            prompt: None,
            source: None,
            error: Some("task not found".to_string()),
        };
    };
    let (prompt, source) = build_prompt(tracker_kind, task, progress_md_path, previous_iteration);
    PromptPreview {
        success: true,
        prompt: Some(prompt),
        source: Some(source),
        error: None,
    }
}

fn task_section(task: &Task) -> String {
    let mut lines = vec![format!("## Task: {}", task.title), format!("id: {}", task.id)];
    if let Some(description) = &task.description {
        lines.push(format!("description: {description}"));
    }
    if !task.labels.is_empty() {
        lines.push(format!("labels: {}", task.labels.join(", ")));
    }
    lines.join("\n")
}

fn previous_summary(previous: &IterationResult) -> String {
    let tail = previous
        .agent_result
        .as_ref()
        .map(|r| tail_chars(&r.stdout, PREVIOUS_OUTPUT_TAIL_CHARS))
        .unwrap_or_default();
    format!(
        "## Summary of iteration {}\nstatus: {:?}\n{tail}",
        previous.iteration, previous.status
    )
}

fn read_tail(path: &Path, max_bytes: usize) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    if content.len() <= max_bytes {
        Some(content)
    } else {
        Some(content[content.len() - max_bytes..].to_string())
    }
}

fn tail_chars(s: &str, max_chars: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= max_chars {
        s.to_string()
    } else {
        chars[chars.len() - max_chars..].iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iteration::{AgentResult, IterationStatus};
    use std::collections::{HashMap, HashSet};

    fn task() -> Task {
        Task {
            id: "t1".to_string(),
            title: "Fix the bug".to_string(),
            status: crate::task::TaskStatus::Open,
            priority: 0,
            description: Some("Null pointer in parser".to_string()),
            labels: vec!["bug".to_string()],
            r#type: None,
            assignee: None,
            parent_id: None,
            created_at: None,
            updated_at: None,
            metadata: HashMap::new(),
            depends_on: HashSet::new(),
            blocks: HashSet::new(),
        }
    }

    #[test]
    fn build_prompt_selects_template_by_tracker_kind() {
        let (prompt, source) = build_prompt("beads", &task(), None, None);
        assert_eq!(source, "beads-default");
        assert!(prompt.contains("Fix the bug"));
        assert!(prompt.contains("Null pointer"));
    }

    #[test]
    fn build_prompt_appends_previous_iteration_summary() {
        let mut previous = IterationResult::starting(1, task());
        previous.agent_result = Some(AgentResult {
            execution_id: "e1".to_string(),
            exit_code: Some(0),
            stdout: "did some work".to_string(),
            stderr: String::new(),
            interrupted: false,
            started_at: chrono::Utc::now(),
            ended_at: chrono::Utc::now(),
            duration_ms: 10,
        });
        previous.status = IterationStatus::Succeeded;

        let (prompt, _) = build_prompt("prd-json", &task(), None, Some(&previous));
        assert!(prompt.contains("did some work"));
        assert!(prompt.contains("iteration 1"));
    }

    #[test]
    fn preview_reports_failure_for_missing_task() {
        let preview = generate_prompt_preview("beads", None, None, None);
        assert!(!preview.success);
        assert!(preview.error.is_some());
    }
}
