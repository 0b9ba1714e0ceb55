//! Relevance ranking and context formatting
//!
//! Distances coming out of the store are cosine distances in `[0, 2]`, so
//! `relevance = 1 - distance` is the cosine similarity in `[-1, 1]`. It is not
//! clamped: a negative relevance means the session points away from the query.

use crate::models::QueryResult;

/// Header placed above a non-empty context block.
pub const DEFAULT_HEADER: &str = "## Relevant Past Discussions\n";

/// Characters of each session document shown in a context block.
pub const DEFAULT_EXCERPT_CHARS: usize = 500;

pub fn relevance_from_distance(distance: f32) -> f32 {
    1.0 - distance
}

/// Render one result:
///
/// ```text
///
/// ### Session: 2025-01-15 - Winston (architect) - create-architecture
/// Relevance: 87%
///
/// {excerpt}
/// ```
///
/// The excerpt is cut at `max_chars` characters (not bytes, not word
/// boundaries) and gets a trailing `...` when cut.
pub fn format_result(result: &QueryResult, max_chars: usize) -> String {
    let meta = &result.metadata;
    format!(
        "\n### Session: {} - {} ({}) - {}\nRelevance: {:.0}%\n\n{}\n",
        meta.start_time.format("%Y-%m-%d"),
        meta.agent_persona,
        meta.agent_name,
        meta.workflow,
        result.relevance_score * 100.0,
        excerpt(&result.document, max_chars),
    )
}

/// Header followed by each result in ranking order, joined with `"\n"`.
/// Empty input gives an empty string, not a bare header.
pub fn format_context(results: &[QueryResult], header: &str, max_chars: usize) -> String {
    if results.is_empty() {
        return String::new();
    }
    let mut parts = Vec::with_capacity(results.len() + 1);
    parts.push(header.to_string());
    parts.extend(results.iter().map(|r| format_result(r, max_chars)));
    parts.join("\n")
}

fn excerpt(document: &str, max_chars: usize) -> String {
    match document.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &document[..cut]),
        None => document.to_string(),
    }
}
