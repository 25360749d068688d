//! Incremental output line parsing (SPEC_FULL.md §4.2b): recognizes
//! subagent start/end markers, model banner lines, and usage tallies in
//! agent stdout. Unrecognized lines pass through untouched. Grounded on the
//! teacher's line-oriented `agent::tool_parser` scanning approach,
//! generalized from tool-call extraction to the engine's own marker
//! vocabulary.

use super::state::{SubagentNode, SubagentStatus};

/// One recognized (or unrecognized) line of agent stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    SubagentStart { id: String, label: String },
    SubagentEnd { id: String, status: SubagentStatus, duration_ms: u64 },
    Model(String),
    Usage { input_tokens: u64, output_tokens: u64 },
    RateLimited(chrono::DateTime<chrono::Utc>),
    Passthrough,
}

/// Parse one line of agent stdout against the documented marker shapes.
pub fn parse_line(line: &str) -> ParsedLine {
    let trimmed = line.trim();

    if let Some(body) = strip_marker(trimmed, "[[subagent:start ", "]]") {
        if let (Some(id), Some(label)) = (field(body, "id"), field(body, "label")) {
            return ParsedLine::SubagentStart { id, label };
        }
    }
    if let Some(body) = strip_marker(trimmed, "[[subagent:end ", "]]") {
        if let (Some(id), Some(status), Some(duration_ms)) =
            (field(body, "id"), field(body, "status"), field(body, "duration_ms"))
        {
            let status = match status.as_str() {
                "ok" => SubagentStatus::Ok,
                _ => SubagentStatus::Error,
            };
            if let Ok(duration_ms) = duration_ms.parse() {
                return ParsedLine::SubagentEnd { id, status, duration_ms };
            }
        }
    }
    if let Some(body) = strip_marker(trimmed, "[[model:", "]]") {
        if !body.trim().is_empty() {
            return ParsedLine::Model(body.trim().to_string());
        }
    }
    if let Some(body) = strip_marker(trimmed, "[[usage:", "]]") {
        if let (Some(input), Some(output)) = (field(body, "input"), field(body, "output")) {
            if let (Ok(input_tokens), Ok(output_tokens)) = (input.parse(), output.parse()) {
                return ParsedLine::Usage { input_tokens, output_tokens };
            }
        }
    }
    if let Some(body) = strip_marker(trimmed, "[[rate_limited ", "]]") {
        if let Some(retry_after) = field(body, "retry_after") {
            if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(&retry_after) {
                return ParsedLine::RateLimited(parsed.with_timezone(&chrono::Utc));
            }
        }
    }

    ParsedLine::Passthrough
}

fn strip_marker<'a>(line: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    line.strip_prefix(prefix).and_then(|s| s.strip_suffix(suffix))
}

/// Find `key=value` among whitespace-separated `key=value` pairs. Values are
/// assumed not to contain spaces, matching the documented marker grammar.
fn field(body: &str, key: &str) -> Option<String> {
    body.split_whitespace().find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}

/// Buffers partial lines across stream chunks and builds the subagent
/// invocation tree as start/end markers arrive. One instance per iteration.
#[derive(Default)]
pub struct StreamParser {
    pending: String,
    tree: SubagentTreeBuilder,
}

/// What one call to [`StreamParser::feed`] discovered in a chunk.
#[derive(Debug, Clone, Default)]
pub struct FeedOutcome {
    pub model: Option<String>,
    pub usage: Option<(u64, u64)>,
    pub rate_limited: Option<chrono::DateTime<chrono::Utc>>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of stdout, parsing every complete line it contains.
    /// Incomplete trailing text is buffered for the next call.
    pub fn feed(&mut self, chunk: &str) -> FeedOutcome {
        self.pending.push_str(chunk);
        let mut outcome = FeedOutcome::default();

        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            match parse_line(line.trim_end_matches('\n')) {
                ParsedLine::SubagentStart { id, label } => self.tree.start(id, label),
                ParsedLine::SubagentEnd { id, status, duration_ms } => {
                    self.tree.end(&id, status, duration_ms)
                }
                ParsedLine::Model(model) => outcome.model = Some(model),
                ParsedLine::Usage { input_tokens, output_tokens } => {
                    outcome.usage = Some((input_tokens, output_tokens))
                }
                ParsedLine::RateLimited(retry_after) => outcome.rate_limited = Some(retry_after),
                ParsedLine::Passthrough => {}
            }
        }

        outcome
    }

    pub fn subagent_tree(&self) -> Vec<SubagentNode> {
        self.tree.roots.clone()
    }
}

/// Builds a nested [`SubagentNode`] tree from a stream of start/end markers.
/// New subagents nest under the currently-deepest open node, matching a
/// subagent that itself launches subordinates.
#[derive(Default)]
struct SubagentTreeBuilder {
    roots: Vec<SubagentNode>,
    open_path: Vec<usize>,
}

impl SubagentTreeBuilder {
    fn start(&mut self, id: String, label: String) {
        let siblings = Self::nav_mut(&mut self.roots, &self.open_path);
        siblings.push(SubagentNode {
            id,
            label,
            status: SubagentStatus::Running,
            duration_ms: None,
            children: Vec::new(),
        });
        self.open_path.push(siblings.len() - 1);
    }

    fn end(&mut self, id: &str, status: SubagentStatus, duration_ms: u64) {
        if let Some(&idx) = self.open_path.last() {
            let parent_path = &self.open_path[..self.open_path.len() - 1];
            let siblings = Self::nav_mut(&mut self.roots, parent_path);
            if siblings.get(idx).map(|n| n.id.as_str()) == Some(id) {
                siblings[idx].status = status;
                siblings[idx].duration_ms = Some(duration_ms);
                self.open_path.pop();
                return;
            }
        }
        // Out-of-order marker (end without a matching currently-open start):
        // search the whole tree defensively rather than dropping the event.
        find_and_close(&mut self.roots, id, status, duration_ms);
    }

    fn nav_mut<'a>(roots: &'a mut Vec<SubagentNode>, path: &[usize]) -> &'a mut Vec<SubagentNode> {
        let mut current = roots;
        for &idx in path {
            current = &mut current[idx].children;
        }
        current
    }
}

fn find_and_close(nodes: &mut [SubagentNode], id: &str, status: SubagentStatus, duration_ms: u64) -> bool {
    for node in nodes.iter_mut() {
        if node.id == id {
            node.status = status;
            node.duration_ms = Some(duration_ms);
            return true;
        }
        if find_and_close(&mut node.children, id, status, duration_ms) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subagent_start_and_end() {
        assert_eq!(
            parse_line("[[subagent:start id=a1 label=researcher]]"),
            ParsedLine::SubagentStart {
                id: "a1".to_string(),
                label: "researcher".to_string()
            }
        );
        assert_eq!(
            parse_line("[[subagent:end id=a1 status=ok duration_ms=1200]]"),
            ParsedLine::SubagentEnd {
                id: "a1".to_string(),
                status: SubagentStatus::Ok,
                duration_ms: 1200
            }
        );
    }

    #[test]
    fn parses_model_and_usage_markers() {
        assert_eq!(parse_line("[[model:claude-x]]"), ParsedLine::Model("claude-x".to_string()));
        assert_eq!(
            parse_line("[[usage:input=100 output=50]]"),
            ParsedLine::Usage {
                input_tokens: 100,
                output_tokens: 50
            }
        );
    }

    #[test]
    fn parses_rate_limited_marker() {
        let line = "[[rate_limited retry_after=2026-07-27T10:00:00Z]]";
        match parse_line(line) {
            ParsedLine::RateLimited(ts) => {
                assert_eq!(ts.to_rfc3339(), "2026-07-27T10:00:00+00:00");
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn unrecognized_line_passes_through() {
        assert_eq!(parse_line("just some regular output"), ParsedLine::Passthrough);
    }

    #[test]
    fn stream_parser_builds_nested_tree_across_chunks() {
        let mut parser = StreamParser::new();
        parser.feed("normal output\n[[subagent:start id=a1 label=");
        parser.feed("outer]]\n[[subagent:start id=a2 label=inner]]\n");
        parser.feed("[[subagent:end id=a2 status=ok duration_ms=5]]\n");
        let outcome = parser.feed("[[subagent:end id=a1 status=ok duration_ms=20]]\n");
        assert!(outcome.model.is_none());

        let tree = parser.subagent_tree();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].id, "a1");
        assert_eq!(tree[0].status, SubagentStatus::Ok);
        assert_eq!(tree[0].children.len(), 1);
        assert_eq!(tree[0].children[0].id, "a2");
    }

    #[test]
    fn stream_parser_reports_model_and_usage() {
        let mut parser = StreamParser::new();
        let outcome = parser.feed("[[model:claude-x]]\n[[usage:input=10 output=20]]\n");
        assert_eq!(outcome.model, Some("claude-x".to_string()));
        assert_eq!(outcome.usage, Some((10, 20)));
    }
}
