//! Conversation cleanup and metadata helpers used when capturing a session.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

pub const MAX_TOPICS: usize = 5;

/// Minimum estimated session length in minutes.
pub const MIN_SESSION_MINUTES: i64 = 5;

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^#{1,3}\s+(.+)$").expect("valid header regex"))
}

fn bold_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\*\*(.+?)\*\*").expect("valid bold regex"))
}

fn blank_lines_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{3,}").expect("valid blank line regex"))
}

/// Trim, normalise line endings to `\n`, collapse runs of blank lines to a
/// single blank line and drop NUL bytes. Markdown is left alone.
pub fn preprocess(raw: &str) -> String {
    let text = raw
        .trim()
        .replace("\r\n", "\n")
        .replace('\r', "\n");
    let text = blank_lines_re().replace_all(&text, "\n\n");
    text.replace('\0', "")
}

/// Markdown headers (`#` to `###`) first, then `**bold**` terms, lower-cased
/// and de-duplicated, at most `max_topics`.
pub fn extract_topics(text: &str, max_topics: usize) -> Vec<String> {
    let headers = header_re()
        .captures_iter(text)
        .take(max_topics)
        .map(|c| c[1].trim().to_lowercase());
    let bold = bold_re()
        .captures_iter(text)
        .take(max_topics)
        .map(|c| c[1].trim().to_lowercase());

    let mut seen = HashSet::new();
    headers
        .chain(bold)
        .filter(|t| seen.insert(t.clone()))
        .take(max_topics)
        .collect()
}

/// Roughly two minutes per exchange, never under five.
pub fn estimate_session_minutes(text: &str) -> i64 {
    let user = text.matches("User:").count();
    let assistant = text.matches("Assistant:").count();
    let exchanges = i64::try_from(user.max(assistant)).unwrap_or(i64::MAX / 2);
    (exchanges * 2).max(MIN_SESSION_MINUTES)
}

/// Query used to pull context when a session starts and the caller gave none.
pub fn default_context_query(agent: &str, workflow: Option<&str>) -> String {
    match workflow {
        Some(w) if !w.trim().is_empty() && w != "none" => format!("past discussions about {w}"),
        _ => format!("past sessions with {agent}"),
    }
}

/// `"tech-writer"` becomes `"Tech-writer"`; only the first letter changes.
pub fn title_case(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Comma-separated CLI list, blanks dropped.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
