use serde::{Deserialize, Serialize};

/// One line of `codex exec --json` output.
///
/// Kinds this crate does not know about deserialize to [`AgentEvent::Unknown`]
/// so a newer runner never breaks an older bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    #[serde(rename = "thread.started")]
    ThreadStarted { thread_id: String },
    #[serde(rename = "turn.started")]
    TurnStarted,
    #[serde(rename = "turn.completed")]
    TurnCompleted {
        #[serde(default)]
        usage: Option<Usage>,
    },
    #[serde(rename = "turn.failed")]
    TurnFailed { error: EventError },
    #[serde(rename = "item.started")]
    ItemStarted { item: ThreadItem },
    #[serde(rename = "item.updated")]
    ItemUpdated { item: ThreadItem },
    #[serde(rename = "item.completed")]
    ItemCompleted { item: ThreadItem },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(other)]
    Unknown,
}

impl AgentEvent {
    /// Session id carried by this event, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            AgentEvent::ThreadStarted { thread_id } => Some(thread_id.as_str()),
            _ => None,
        }
    }

    /// Final text of a completed agent message.
    pub fn agent_message(&self) -> Option<&str> {
        match self {
            AgentEvent::ItemCompleted {
                item: ThreadItem::AgentMessage { text },
            } => Some(text.as_str()),
            _ => None,
        }
    }

    pub fn parse_line(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThreadItem {
    AgentMessage {
        #[serde(default)]
        text: String,
    },
    Reasoning {
        #[serde(default)]
        text: String,
    },
    CommandExecution {
        command: String,
        #[serde(default)]
        aggregated_output: String,
        #[serde(default)]
        exit_code: Option<i32>,
        #[serde(default)]
        status: ItemStatus,
    },
    FileChange {
        #[serde(default)]
        changes: Vec<FileUpdate>,
        #[serde(default)]
        status: ItemStatus,
    },
    McpToolCall {
        server: String,
        tool: String,
        #[serde(default)]
        status: ItemStatus,
    },
    WebSearch {
        query: String,
    },
    TodoList {
        #[serde(default)]
        items: Vec<TodoEntry>,
    },
    Error {
        message: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    InProgress,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUpdate {
    pub path: String,
    #[serde(default)]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoEntry {
    pub text: String,
    #[serde(default)]
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventError {
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub cached_input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_thread_started() {
        let line = r#"{"type":"thread.started","thread_id":"019b66fc-64c2-7a71-81cd-081c504cfeb2"}"#;
        let event = AgentEvent::parse_line(line).unwrap();
        assert_eq!(
            event.session_id(),
            Some("019b66fc-64c2-7a71-81cd-081c504cfeb2")
        );
    }

    #[test]
    fn parses_command_execution_item() {
        let line = r#"{"type":"item.completed","item":{"id":"item_0","type":"command_execution","command":"echo ok","aggregated_output":"ok\n","exit_code":0,"status":"completed"}}"#;
        let event = AgentEvent::parse_line(line).unwrap();
        match event {
            AgentEvent::ItemCompleted {
                item:
                    ThreadItem::CommandExecution {
                        command,
                        exit_code,
                        status,
                        ..
                    },
            } => {
                assert_eq!(command, "echo ok");
                assert_eq!(exit_code, Some(0));
                assert_eq!(status, ItemStatus::Completed);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn agent_message_text_is_exposed() {
        let line = r#"{"type":"item.completed","item":{"id":"item_3","type":"agent_message","text":"done"}}"#;
        let event = AgentEvent::parse_line(line).unwrap();
        assert_eq!(event.agent_message(), Some("done"));
    }

    #[test]
    fn unknown_kinds_degrade_instead_of_failing() {
        let event = AgentEvent::parse_line(r#"{"type":"session.configured","model":"x"}"#).unwrap();
        assert_eq!(event, AgentEvent::Unknown);

        let item = r#"{"type":"item.started","item":{"id":"i","type":"image_view","path":"a.png"}}"#;
        let event = AgentEvent::parse_line(item).unwrap();
        assert_eq!(
            event,
            AgentEvent::ItemStarted {
                item: ThreadItem::Unknown
            }
        );
    }

    #[test]
    fn garbage_lines_are_skipped() {
        assert!(AgentEvent::parse_line("").is_none());
        assert!(AgentEvent::parse_line("not json").is_none());
    }
}
