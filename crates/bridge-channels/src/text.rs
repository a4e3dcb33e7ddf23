//! Session-id extraction and size-bounded message text.
//!
//! Lengths are counted in `char`s. The one thing truncation must never do is
//! damage the trailing ``resume: `<id>` `` line: it is the only place the
//! session id survives between messages.

use bridge_types::MessageEntity;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::markdown::render_markdown;

const ELLIPSIS: &str = "…";

// The backticked form is what the bridge writes. Once Telegram renders the
// backticks into a code entity, replies carry the bare form, so both count.
static RESUME_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^resume:\s*(?:`(?P<quoted>[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})`|(?P<bare>[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}))$",
    )
    .expect("valid resume line regex")
});

/// The marker line appended to every resumable message.
pub fn resume_line(session_id: &str) -> String {
    format!("resume: `{session_id}`")
}

fn match_resume_line(line: &str) -> Option<&str> {
    let captures = RESUME_LINE_RE.captures(line.trim())?;
    captures
        .name("quoted")
        .or_else(|| captures.name("bare"))
        .map(|m| m.as_str())
}

pub fn is_resume_line(line: &str) -> bool {
    match_resume_line(line).is_some()
}

/// Session id from the last resume marker line in `text`.
pub fn extract_session_id(text: &str) -> Option<String> {
    text.lines()
        .filter_map(match_resume_line)
        .last()
        .map(str::to_string)
}

/// Prefer an id in the message itself, then one in the message it replies to.
pub fn resolve_resume_session(text: &str, reply_text: Option<&str>) -> Option<String> {
    extract_session_id(text).or_else(|| reply_text.and_then(extract_session_id))
}

/// Drop resume marker lines from a prompt before it reaches the runner.
pub fn strip_resume_lines(text: &str) -> String {
    text.lines()
        .filter(|line| !is_resume_line(line))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn take_chars(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn last_chars(text: &str, n: usize) -> &str {
    let len = char_len(text);
    if n >= len {
        return text;
    }
    match text.char_indices().nth(len - n) {
        Some((idx, _)) => &text[idx..],
        None => "",
    }
}

fn split_last_line(text: &str) -> (&str, &str) {
    match text.rfind('\n') {
        Some(idx) => (&text[..idx], &text[idx + 1..]),
        None => ("", text),
    }
}

/// Fit `text` into `limit` chars.
///
/// A trailing resume marker line is kept whole and stays last. Otherwise the
/// last non-empty line stays visible and content is cut from the middle.
pub fn truncate_for_telegram(text: &str, limit: usize) -> String {
    if char_len(text) <= limit {
        return text.to_string();
    }

    let trimmed = text.trim_end();
    let (body, last) = split_last_line(trimmed);
    if !is_resume_line(last) {
        return keep_last_line(trimmed, limit);
    }

    let marker_len = char_len(last);
    if marker_len >= limit {
        // below the marker's own length nothing whole can be kept
        return last_chars(last, limit).to_string();
    }

    let head = keep_last_line(body.trim_end(), limit - marker_len - 1);
    if head.is_empty() {
        last.to_string()
    } else {
        format!("{head}\n{last}")
    }
}

fn keep_last_line(text: &str, budget: usize) -> String {
    if char_len(text) <= budget {
        return text.to_string();
    }
    if budget == 0 {
        return String::new();
    }

    let (body, last) = split_last_line(text);
    let last_len = char_len(last);
    if last_len + 2 > budget {
        return format!("{ELLIPSIS}{}", last_chars(last, budget - 1));
    }

    let head = take_chars(body, budget - last_len - 2).trim_end();
    format!("{head}{ELLIPSIS}\n{last}")
}

/// Render markdown for Telegram within `limit` chars.
///
/// When the rendered text has to be cut, entities are dropped entirely:
/// spans computed for the full text would point at the wrong characters.
pub fn prepare_telegram(markdown: &str, limit: usize) -> (String, Option<Vec<MessageEntity>>) {
    let (rendered, entities) = render_markdown(markdown);
    if char_len(&rendered) > limit {
        return (truncate_for_telegram(&rendered, limit), None);
    }
    let entities = (!entities.is_empty()).then_some(entities);
    (rendered, entities)
}
