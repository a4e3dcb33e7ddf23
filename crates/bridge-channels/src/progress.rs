//! Progress text for a running turn and the edit throttle that paces it.

use std::collections::VecDeque;
use std::time::Duration;

use bridge_types::{AgentEvent, ItemStatus, ThreadItem};
use tokio::time::Instant;

use crate::text::resume_line;

pub const STATUS_WORKING: &str = "working";
pub const STATUS_DONE: &str = "done";
pub const STATUS_CANCELLED: &str = "cancelled";
pub const STATUS_ERROR: &str = "error";

const MAX_RECENT_LINES: usize = 5;
const MAX_COMMAND_CHARS: usize = 80;
const MAX_LISTED_FILES: usize = 3;

/// One progress line for `event`, or `None` when it has nothing to show.
pub fn render_event(event: &AgentEvent) -> Option<String> {
    match event {
        AgentEvent::ItemStarted { item } => match item {
            ThreadItem::CommandExecution { command, .. } => Some(running_line(command)),
            ThreadItem::McpToolCall { server, tool, .. } => {
                Some(format!("tool: `{}`", shorten(&format!("{server}.{tool}"))))
            }
            _ => None,
        },
        AgentEvent::ItemCompleted { item } => match item {
            ThreadItem::CommandExecution {
                command,
                exit_code,
                status,
                ..
            } => {
                let command = shorten(command);
                Some(match (exit_code, status) {
                    (Some(code), _) => format!("ran: `{command}` (exit {code})"),
                    (None, ItemStatus::Failed) => format!("ran: `{command}` (failed)"),
                    (None, _) => format!("ran: `{command}`"),
                })
            }
            ThreadItem::FileChange { changes, .. } => {
                let paths: Vec<String> = changes
                    .iter()
                    .take(MAX_LISTED_FILES)
                    .map(|change| format!("`{}`", shorten(&change.path)))
                    .collect();
                if paths.is_empty() {
                    return None;
                }
                let extra = changes.len().saturating_sub(MAX_LISTED_FILES);
                let more = if extra > 0 {
                    format!(" (+{extra} more)")
                } else {
                    String::new()
                };
                Some(format!("updated: {}{more}", paths.join(", ")))
            }
            ThreadItem::McpToolCall {
                server,
                tool,
                status: ItemStatus::Failed,
            } => Some(format!("tool failed: `{}`", shorten(&format!("{server}.{tool}")))),
            ThreadItem::WebSearch { query } => Some(format!("searched: {}", shorten(query))),
            ThreadItem::Error { message } => Some(format!("error: {}", shorten(message))),
            _ => None,
        },
        AgentEvent::TurnFailed { error } => Some(format!("turn failed: {}", shorten(&error.message))),
        AgentEvent::Error { message } => Some(format!("error: {}", shorten(message))),
        _ => None,
    }
}

fn running_line(command: &str) -> String {
    format!("running: `{}`", shorten(command))
}

/// First line only, no backticks, bounded length.
fn shorten(text: &str) -> String {
    let first = text.lines().next().unwrap_or("").trim().replace('`', "'");
    if first.chars().count() <= MAX_COMMAND_CHARS {
        return first;
    }
    let mut out: String = first.chars().take(MAX_COMMAND_CHARS - 1).collect();
    out.push('…');
    out
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m {:02}s", secs / 60, secs % 60),
        _ => format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60),
    }
}

/// `label · elapsed`, with the step count once there is one.
pub fn status_line(label: &str, elapsed: Duration, steps: usize) -> String {
    let elapsed = format_elapsed(elapsed);
    if steps == 0 {
        format!("{label} · {elapsed}")
    } else {
        format!("{label} · {elapsed} · step {steps}")
    }
}

/// Markdown for a terminal message: status line, optional body, resume line.
pub fn compose_final(
    label: &str,
    elapsed: Duration,
    steps: usize,
    body: Option<&str>,
    session_id: Option<&str>,
) -> String {
    let mut parts = vec![status_line(label, elapsed, steps)];
    if let Some(body) = body.map(str::trim).filter(|body| !body.is_empty()) {
        parts.push(body.to_string());
    }
    if let Some(id) = session_id {
        parts.push(resume_line(id));
    }
    parts.join("\n\n")
}

/// Keeps the most recent progress lines for one run.
#[derive(Debug)]
pub struct ProgressRenderer {
    recent: VecDeque<String>,
    max_lines: usize,
    steps: usize,
}

impl Default for ProgressRenderer {
    fn default() -> Self {
        Self::new(MAX_RECENT_LINES)
    }
}

impl ProgressRenderer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            recent: VecDeque::new(),
            max_lines: max_lines.max(1),
            steps: 0,
        }
    }

    /// Record `event`; `true` when the visible progress changed.
    pub fn observe(&mut self, event: &AgentEvent) -> bool {
        let Some(line) = render_event(event) else {
            return false;
        };

        // a finished command replaces its own "running" line
        if let AgentEvent::ItemCompleted {
            item: ThreadItem::CommandExecution { command, .. },
        } = event
        {
            if self.recent.back() == Some(&running_line(command)) {
                self.recent.pop_back();
                self.recent.push_back(line);
                return true;
            }
        }

        self.steps += 1;
        self.recent.push_back(line);
        while self.recent.len() > self.max_lines {
            self.recent.pop_front();
        }
        true
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn recent(&self) -> impl Iterator<Item = &str> {
        self.recent.iter().map(String::as_str)
    }

    pub fn render(&self, label: &str, elapsed: Duration, session_id: Option<&str>) -> String {
        let mut out = status_line(label, elapsed, self.steps);
        if !self.recent.is_empty() {
            out.push_str("\n\n");
            out.push_str(&self.recent.iter().cloned().collect::<Vec<_>>().join("\n"));
        }
        if let Some(id) = session_id {
            out.push_str("\n\n");
            out.push_str(&resume_line(id));
        }
        out
    }
}

/// Spaces progress edits at least `min_interval` apart.
///
/// Updates that arrive inside the window are coalesced: the throttle only
/// remembers that something is pending, and [`EditThrottle::deadline`]
/// says when the next edit may go out.
#[derive(Debug)]
pub struct EditThrottle {
    min_interval: Duration,
    last_flush: Instant,
    pending: bool,
}

impl EditThrottle {
    /// `started` counts as a flush: the initial progress message was just sent.
    pub fn new(min_interval: Duration, started: Instant) -> Self {
        Self {
            min_interval,
            last_flush: started,
            pending: false,
        }
    }

    pub fn mark_pending(&mut self) {
        self.pending = true;
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.then(|| self.last_flush + self.min_interval)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.pending && now >= self.last_flush + self.min_interval
    }

    pub fn flushed(&mut self, now: Instant) {
        self.last_flush = now;
        self.pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_types::{EventError, FileUpdate};

    fn started(command: &str) -> AgentEvent {
        AgentEvent::ItemStarted {
            item: ThreadItem::CommandExecution {
                command: command.to_string(),
                aggregated_output: String::new(),
                exit_code: None,
                status: ItemStatus::InProgress,
            },
        }
    }

    fn completed(command: &str, exit_code: i32) -> AgentEvent {
        AgentEvent::ItemCompleted {
            item: ThreadItem::CommandExecution {
                command: command.to_string(),
                aggregated_output: String::new(),
                exit_code: Some(exit_code),
                status: ItemStatus::Completed,
            },
        }
    }

    #[test]
    fn command_lines() {
        assert_eq!(render_event(&started("echo ok")).unwrap(), "running: `echo ok`");
        assert_eq!(
            render_event(&completed("echo ok", 2)).unwrap(),
            "ran: `echo ok` (exit 2)"
        );
    }

    #[test]
    fn silent_events() {
        let thread = AgentEvent::ThreadStarted {
            thread_id: "t".to_string(),
        };
        let message = AgentEvent::ItemCompleted {
            item: ThreadItem::AgentMessage {
                text: "hi".to_string(),
            },
        };
        assert_eq!(render_event(&thread), None);
        assert_eq!(render_event(&message), None);
        assert_eq!(render_event(&AgentEvent::Unknown), None);
    }

    #[test]
    fn file_changes_list_a_few_paths() {
        let changes = (0..5)
            .map(|i| FileUpdate {
                path: format!("src/f{i}.rs"),
                kind: "update".to_string(),
            })
            .collect();
        let event = AgentEvent::ItemCompleted {
            item: ThreadItem::FileChange {
                changes,
                status: ItemStatus::Completed,
            },
        };
        assert_eq!(
            render_event(&event).unwrap(),
            "updated: `src/f0.rs`, `src/f1.rs`, `src/f2.rs` (+2 more)"
        );
    }

    #[test]
    fn failures_are_shown() {
        let event = AgentEvent::TurnFailed {
            error: EventError {
                message: "usage limit".to_string(),
            },
        };
        assert_eq!(render_event(&event).unwrap(), "turn failed: usage limit");
    }

    #[test]
    fn long_multiline_commands_are_shortened() {
        let command = format!("cargo test `{}`\necho second", "x".repeat(200));
        let line = render_event(&started(&command)).unwrap();
        assert!(line.starts_with("running: `cargo test 'xxx"));
        assert!(line.ends_with("…`"));
        assert!(!line.contains("second"));
        assert!(line.chars().count() <= MAX_COMMAND_CHARS + "running: ``".len());
    }

    #[test]
    fn renderer_replaces_running_line_when_command_finishes() {
        let mut renderer = ProgressRenderer::default();
        assert!(renderer.observe(&started("echo 1")));
        assert!(renderer.observe(&completed("echo 1", 0)));

        let lines: Vec<_> = renderer.recent().collect();
        assert_eq!(lines, vec!["ran: `echo 1` (exit 0)"]);
        assert_eq!(renderer.steps(), 1);
    }

    #[test]
    fn renderer_keeps_only_recent_lines() {
        let mut renderer = ProgressRenderer::new(2);
        for i in 0..4 {
            renderer.observe(&started(&format!("echo {i}")));
        }
        let text = renderer.render(STATUS_WORKING, Duration::from_secs(3), None);
        assert_eq!(text, "working · 3s · step 4\n\nrunning: `echo 2`\nrunning: `echo 3`");
    }

    #[test]
    fn renderer_appends_resume_line() {
        let renderer = ProgressRenderer::default();
        let text = renderer.render(STATUS_WORKING, Duration::ZERO, Some("abc"));
        assert_eq!(text, "working · 0s\n\nresume: `abc`");
    }

    #[test]
    fn compose_final_skips_empty_parts() {
        assert_eq!(
            compose_final(STATUS_CANCELLED, Duration::from_secs(75), 0, None, Some("abc")),
            "cancelled · 1m 15s\n\nresume: `abc`"
        );
        assert_eq!(
            compose_final(STATUS_DONE, Duration::from_secs(2), 3, Some("answer"), None),
            "done · 2s · step 3\n\nanswer"
        );
    }

    #[test]
    fn throttle_waits_for_interval() {
        let t0 = Instant::now();
        let mut throttle = EditThrottle::new(Duration::from_secs(1), t0);
        assert_eq!(throttle.deadline(), None);
        assert!(!throttle.is_due(t0 + Duration::from_secs(5)));

        throttle.mark_pending();
        assert!(!throttle.is_due(t0 + Duration::from_millis(200)));
        assert_eq!(throttle.deadline(), Some(t0 + Duration::from_secs(1)));
        assert!(throttle.is_due(t0 + Duration::from_secs(1)));

        throttle.flushed(t0 + Duration::from_secs(1));
        assert!(!throttle.is_pending());
        assert_eq!(throttle.deadline(), None);
    }

    /// Replays a schedule of update times and counts the edits it produces.
    fn simulate(interval: Duration, updates: &[Duration]) -> usize {
        let t0 = Instant::now();
        let mut throttle = EditThrottle::new(interval, t0);
        let mut edits = 0;
        for at in updates {
            let now = t0 + *at;
            if let Some(deadline) = throttle.deadline() {
                if deadline < now {
                    throttle.flushed(deadline);
                    edits += 1;
                }
            }
            throttle.mark_pending();
            if throttle.is_due(now) {
                throttle.flushed(now);
                edits += 1;
            }
        }
        if throttle.deadline().is_some() {
            edits += 1;
        }
        edits
    }

    #[test]
    fn throttle_coalesces_bursts() {
        let ms = Duration::from_millis;
        assert_eq!(simulate(ms(1_000), &[ms(200), ms(400)]), 1);
        assert_eq!(simulate(ms(1_000), &[ms(0), ms(2_100)]), 2);
        let burst: Vec<_> = (0..50).map(|i| ms(i * 10)).collect();
        assert_eq!(simulate(ms(1_000), &burst), 1);
        let spread: Vec<_> = (1..=5).map(|i| ms(i * 1_500)).collect();
        assert_eq!(simulate(ms(1_000), &spread), 5);
    }
}
