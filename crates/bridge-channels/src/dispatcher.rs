//! Poll loop: long-polls Telegram, keeps to the configured chat, and routes
//! each message either to `/cancel` handling or to a new run.
//!
//! Runs are spawned and never awaited here, so a long agent turn does not
//! hold up the next `getUpdates` call.

use std::sync::Arc;
use std::time::Duration;

use bridge_observability::{emit_event, ObservabilityEvent};
use bridge_runtime::CodexExecConfig;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Level};

use crate::bridge::{AdmissionPolicy, Bridge, BridgeConfig, RunRequest};
use crate::telegram::{Message, TelegramClient};
use crate::text::{prepare_telegram, resolve_resume_session, strip_resume_lines};
use crate::traits::{IncomingMessage, SendMessage};

pub const POLL_TIMEOUT_SECS: u64 = 25;
const MAX_BACKOFF_SECS: u64 = 60;
/// Prompt used when a message carries nothing but a resume line.
const CONTINUE_PROMPT: &str = "continue";

// ---------------------------------------------------------------------------
// Slash command parsing
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
pub enum SlashCommand {
    Cancel,
}

/// Recognizes `/cancel` and `/cancel@botname`; anything else is a prompt.
pub fn parse_slash_command(text: &str) -> Option<SlashCommand> {
    let first = text.split_whitespace().next()?;
    let command = first.split('@').next().unwrap_or(first);
    match command {
        "/cancel" => Some(SlashCommand::Cancel),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Startup banner
// ---------------------------------------------------------------------------

pub fn startup_banner(codex: &CodexExecConfig, bridge: &BridgeConfig) -> String {
    let mut lines = vec!["**exec-bridge is ready**".to_string(), String::new()];
    lines.push(format!("codex: `{}`", codex.codex_cmd));
    if let Some(profile) = &codex.profile {
        lines.push(format!("profile: `{profile}`"));
    }
    if let Some(dir) = &codex.workdir {
        lines.push(format!("workdir: `{}`", dir.display()));
    }
    let admission = match bridge.admission {
        AdmissionPolicy::Queue => "queue",
        AdmissionPolicy::Reject => "reject",
    };
    lines.push(format!(
        "runs: up to {} at once, {admission} when full",
        bridge.max_concurrency.max(1)
    ));
    lines.push(format!(
        "final answer: {}",
        if bridge.final_notify {
            "new message"
        } else {
            "edit in place"
        }
    ));
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Build the run request for a plain message.
pub fn run_request(message: &IncomingMessage) -> RunRequest {
    let resume_session =
        resolve_resume_session(&message.text, message.reply_to_text.as_deref());
    let mut text = strip_resume_lines(&message.text);
    if text.is_empty() {
        text = CONTINUE_PROMPT.to_string();
    }
    RunRequest {
        chat_id: message.chat_id,
        user_msg_id: message.message_id,
        text,
        resume_session,
    }
}

/// Spawn the handling of one message from the bridge's chat. The task is
/// tracked by the bridge, so shutdown waits for its terminal message.
pub fn dispatch(bridge: &Bridge, message: IncomingMessage) -> JoinHandle<()> {
    let handle = bridge.clone();
    let sender = message.sender.clone().unwrap_or_default();
    match parse_slash_command(&message.text) {
        Some(SlashCommand::Cancel) => bridge.spawn(async move {
            let outcome = handle.handle_cancel(&message).await;
            debug!(%sender, ?outcome, "cancel handled");
        }),
        None => {
            let req = run_request(&message);
            debug!(%sender, user_msg_id = req.user_msg_id, "message accepted");
            bridge.spawn(async move {
                let status = handle.submit(req).await;
                debug!(%sender, ?status, "run finished");
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Poll loop
// ---------------------------------------------------------------------------

async fn announce(bridge: &Bridge) {
    let cfg = bridge.config();
    if cfg.startup_msg.trim().is_empty() {
        return;
    }
    let (text, entities) = prepare_telegram(&cfg.startup_msg, cfg.final_edit_limit);
    let message = SendMessage::new(cfg.chat_id, text)
        .silent(true)
        .with_entities(entities);
    if let Err(err) = cfg.bot.send_message(&message).await {
        warn!("startup message failed: {err}");
    }
}

/// Poll forever. Errors back off exponentially and never end the loop.
pub async fn run_bridge(bridge: Bridge, client: Arc<TelegramClient>) -> anyhow::Result<()> {
    let chat_id = bridge.config().chat_id;
    let mut offset = match client.drain_backlog().await {
        Ok(offset) => offset,
        Err(err) => {
            warn!("could not skip pending updates: {err}");
            0
        }
    };

    announce(&bridge).await;
    emit_event(
        Level::INFO,
        ObservabilityEvent {
            event: "bridge.started",
            component: "bridge.dispatcher",
            chat_id: Some(chat_id),
            status: Some("ok"),
            ..Default::default()
        },
    );
    info!(chat_id, "polling for messages");

    let mut backoff_secs: u64 = 1;
    loop {
        let updates = match client.get_updates(offset, POLL_TIMEOUT_SECS).await {
            Ok(updates) => {
                backoff_secs = 1;
                updates
            }
            Err(err) => {
                warn!("telegram poll error, retrying in {backoff_secs}s: {err}");
                tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                continue;
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            let Some(message) = update.message.and_then(Message::into_incoming) else {
                continue;
            };
            if message.chat_id != chat_id {
                debug!(chat_id = message.chat_id, "ignoring message from another chat");
                continue;
            }
            dispatch(&bridge, message);
        }
    }
}
