//! One user message → one agent turn, mirrored into the chat.
//!
//! A run posts a silent progress reply, streams runner events into throttled
//! edits of that reply, and finishes with exactly one terminal message. The
//! registry of running sessions is what `/cancel` talks to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bridge_observability::{emit_event, redact_text, ObservabilityEvent};
use bridge_runtime::AgentRunner;
use bridge_types::{AgentEvent, RunResult};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{sleep_until, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Level};

use crate::markdown::render_markdown;
use crate::progress::{
    compose_final, EditThrottle, ProgressRenderer, STATUS_CANCELLED, STATUS_DONE, STATUS_ERROR,
    STATUS_WORKING,
};
use crate::text::{char_len, extract_session_id, prepare_telegram};
use crate::traits::{ChatTransport, IncomingMessage, SendMessage};

/// Longest rendered final answer that is still edited into the progress message.
pub const TELEGRAM_MARKDOWN_LIMIT: usize = 3500;
pub const PROGRESS_EDIT_EVERY: Duration = Duration::from_secs(2);

pub const NO_AGENT_MESSAGE: &str = "(no agent message captured)";
pub const CANCEL_NEEDS_REPLY: &str =
    "reply to the progress message of the run you want to cancel.";
pub const CANCEL_NOT_RUNNING: &str = "nothing is currently running for that session.";
pub const BUSY_REPLY: &str = "busy: too many runs in progress, try again shortly.";
pub const SHUTDOWN_REPLY: &str = "exec-bridge is shutting down; send this again once it is back.";

const EVENT_BUFFER: usize = 256;

/// What to do with a message when every run slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    #[default]
    Queue,
    Reject,
}

impl std::str::FromStr for AdmissionPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "queue" => Ok(Self::Queue),
            "reject" => Ok(Self::Reject),
            other => Err(format!("expected `queue` or `reject`, got `{other}`")),
        }
    }
}

pub struct BridgeConfig {
    pub bot: Arc<dyn ChatTransport>,
    pub runner: Arc<dyn AgentRunner>,
    pub chat_id: i64,
    /// Always deliver the final answer as a new (notifying) message.
    pub final_notify: bool,
    pub startup_msg: String,
    pub max_concurrency: usize,
    pub admission: AdmissionPolicy,
    pub progress_edit_every: Duration,
    pub final_edit_limit: usize,
}

impl BridgeConfig {
    pub fn new(bot: Arc<dyn ChatTransport>, runner: Arc<dyn AgentRunner>, chat_id: i64) -> Self {
        Self {
            bot,
            runner,
            chat_id,
            final_notify: true,
            startup_msg: String::new(),
            max_concurrency: 4,
            admission: AdmissionPolicy::Queue,
            progress_edit_every: PROGRESS_EDIT_EVERY,
            final_edit_limit: TELEGRAM_MARKDOWN_LIMIT,
        }
    }
}

// ---------------------------------------------------------------------------
// Running-task registry
// ---------------------------------------------------------------------------

struct RunningTask {
    run_id: u64,
    token: CancellationToken,
}

/// Session id → cancellation handle of the run currently working on it.
#[derive(Clone, Default)]
pub struct RunningTasks {
    inner: Arc<Mutex<HashMap<String, RunningTask>>>,
}

impl RunningTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.inner.lock().contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal the run registered under `session_id`. The entry itself is
    /// left for that run to remove.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.inner.lock().get(session_id) {
            Some(task) => {
                task.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Handle that registers the run once its session id is known and
    /// unregisters it on drop.
    pub fn registration(&self, run_id: u64, token: CancellationToken) -> Registration {
        Registration {
            tasks: self.clone(),
            run_id,
            token,
            session_id: None,
        }
    }

    fn insert(&self, session_id: &str, run_id: u64, token: CancellationToken) -> bool {
        let mut tasks = self.inner.lock();
        if let Some(existing) = tasks.get(session_id) {
            return existing.run_id == run_id;
        }
        tasks.insert(session_id.to_string(), RunningTask { run_id, token });
        true
    }

    fn remove(&self, session_id: &str, run_id: u64) {
        let mut tasks = self.inner.lock();
        if tasks
            .get(session_id)
            .is_some_and(|task| task.run_id == run_id)
        {
            tasks.remove(session_id);
        }
    }
}

pub struct Registration {
    tasks: RunningTasks,
    run_id: u64,
    token: CancellationToken,
    session_id: Option<String>,
}

impl Registration {
    /// Register under `session_id`. `false` if another run already holds it.
    pub fn bind(&mut self, session_id: &str) -> bool {
        if self.session_id.as_deref() == Some(session_id) {
            return true;
        }
        if let Some(previous) = self.session_id.take() {
            self.tasks.remove(&previous, self.run_id);
        }
        let inserted = self
            .tasks
            .insert(session_id, self.run_id, self.token.clone());
        if inserted {
            self.session_id = Some(session_id.to_string());
        }
        inserted
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(session_id) = self.session_id.take() {
            self.tasks.remove(&session_id, self.run_id);
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub chat_id: i64,
    pub user_msg_id: i64,
    pub text: String,
    pub resume_session: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed { session_id: String },
    Cancelled { session_id: Option<String> },
    Failed { session_id: Option<String>, error: String },
    /// The progress message could not be posted; the runner never started.
    Aborted,
    /// Refused by the admission policy.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NoSession,
    NotRunning,
}

enum Outcome {
    Completed(RunResult),
    Cancelled,
    Failed(anyhow::Error),
}

struct ProgressMessage {
    chat_id: i64,
    message_id: i64,
    last_text: String,
}

#[derive(Clone)]
pub struct Bridge {
    cfg: Arc<BridgeConfig>,
    running: RunningTasks,
    permits: Arc<Semaphore>,
    next_run_id: Arc<AtomicU64>,
    /// Parent of every run token; cancelled once on shutdown.
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Bridge {
    pub fn new(cfg: BridgeConfig) -> Self {
        let permits = Arc::new(Semaphore::new(cfg.max_concurrency.max(1)));
        Self {
            cfg: Arc::new(cfg),
            running: RunningTasks::new(),
            permits,
            next_run_id: Arc::new(AtomicU64::new(1)),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.cfg
    }

    pub fn running(&self) -> &RunningTasks {
        &self.running
    }

    /// Spawn onto the bridge's tracked tasks so shutdown can wait for it.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tasks.spawn(task)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancel every run, queued ones included, and wait up to `grace` for
    /// their terminal messages. `false` if some task was still going.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let running = self.running.len();
        self.shutdown.cancel();
        self.tasks.close();
        info!(running, pending = self.tasks.len(), "cancelling runs for shutdown");
        tokio::time::timeout(grace, self.tasks.wait()).await.is_ok()
    }

    /// Apply the admission policy, then run.
    pub async fn submit(&self, req: RunRequest) -> RunStatus {
        if self.is_shutting_down() {
            self.reply(req.chat_id, req.user_msg_id, SHUTDOWN_REPLY).await;
            return RunStatus::Rejected;
        }
        let _permit = match self.cfg.admission {
            AdmissionPolicy::Queue => {
                let acquired = tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => None,
                    permit = self.permits.clone().acquire_owned() => permit.ok(),
                };
                match acquired {
                    Some(permit) => permit,
                    None => {
                        self.reply(req.chat_id, req.user_msg_id, SHUTDOWN_REPLY).await;
                        return RunStatus::Rejected;
                    }
                }
            }
            AdmissionPolicy::Reject => match self.permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    info!(user_msg_id = req.user_msg_id, "run rejected: at capacity");
                    self.reply(req.chat_id, req.user_msg_id, BUSY_REPLY).await;
                    return RunStatus::Rejected;
                }
            },
        };
        self.handle_message(req).await
    }

    pub async fn handle_message(&self, req: RunRequest) -> RunStatus {
        let cfg = &self.cfg;
        let started = Instant::now();
        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let resume = req.resume_session.as_deref();

        info!(
            run_id,
            user_msg_id = req.user_msg_id,
            resume = resume.unwrap_or(""),
            prompt = %redact_text(&req.text),
            "run requested"
        );

        let token = self.shutdown.child_token();
        let mut registration = self.running.registration(run_id, token.clone());
        if let Some(id) = resume {
            if !registration.bind(id) {
                warn!(run_id, session_id = id, "session already has a running task");
            }
        }

        // Only a bound id goes on the progress message: `/cancel` in reply to
        // it must reach this run and no other.
        let mut renderer = ProgressRenderer::default();
        let initial = renderer.render(STATUS_WORKING, started.elapsed(), registration.session_id());
        let (text, entities) = prepare_telegram(&initial, cfg.final_edit_limit);
        let message = SendMessage::new(req.chat_id, text)
            .reply_to(req.user_msg_id)
            .silent(true)
            .with_entities(entities);
        let message_id = match cfg.bot.send_message(&message).await {
            Ok(id) => id,
            Err(err) => {
                warn!(run_id, "progress message failed, run not started: {err}");
                emit_event(
                    Level::WARN,
                    ObservabilityEvent {
                        event: "run.aborted",
                        component: "bridge.run",
                        chat_id: Some(req.chat_id),
                        message_id: Some(req.user_msg_id),
                        status: Some("progress_send_failed"),
                        detail: Some(&err.to_string()),
                        ..Default::default()
                    },
                );
                return RunStatus::Aborted;
            }
        };

        let mut progress = ProgressMessage {
            chat_id: req.chat_id,
            message_id,
            last_text: initial,
        };
        let mut throttle = EditThrottle::new(cfg.progress_edit_every, Instant::now());
        let mut session_id = req.resume_session.clone();

        let (tx, mut rx) = mpsc::channel::<AgentEvent>(EVENT_BUFFER);
        let outcome = {
            let run = cfg.runner.run(&req.text, resume, tx);
            tokio::pin!(run);
            loop {
                let deadline = throttle.deadline();
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break Outcome::Cancelled,
                    Some(event) = rx.recv() => {
                        if let Some(id) = event.session_id() {
                            let was_bound = registration.session_id() == Some(id);
                            if !registration.bind(id) {
                                warn!(run_id, session_id = id, "session already has a running task");
                            } else if !was_bound {
                                throttle.mark_pending();
                            }
                            if session_id.as_deref() != Some(id) {
                                session_id = Some(id.to_string());
                                emit_event(
                                    Level::INFO,
                                    ObservabilityEvent {
                                        event: "run.session",
                                        component: "bridge.run",
                                        session_id: Some(id),
                                        chat_id: Some(req.chat_id),
                                        message_id: Some(message_id),
                                        ..Default::default()
                                    },
                                );
                                throttle.mark_pending();
                            }
                        }
                        if renderer.observe(&event) {
                            throttle.mark_pending();
                        }
                        if throttle.is_due(Instant::now()) {
                            self.flush_progress(&mut progress, &renderer, started, registration.session_id(), &mut throttle).await;
                        }
                    }
                    result = &mut run => break match result {
                        Ok(result) => Outcome::Completed(result),
                        Err(err) => Outcome::Failed(err),
                    },
                    _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        self.flush_progress(&mut progress, &renderer, started, registration.session_id(), &mut throttle).await;
                    }
                }
            }
        };
        // unregister before the terminal message goes out
        drop(registration);
        // events sent in the same poll that finished the run
        while let Ok(event) = rx.try_recv() {
            if let Some(id) = event.session_id() {
                session_id = Some(id.to_string());
            }
            renderer.observe(&event);
        }

        let elapsed = started.elapsed();
        let steps = renderer.steps();
        match outcome {
            Outcome::Completed(result) => {
                let answer = if result.answer.trim().is_empty() {
                    NO_AGENT_MESSAGE
                } else {
                    result.answer.as_str()
                };
                let final_md = compose_final(
                    STATUS_DONE,
                    elapsed,
                    steps,
                    Some(answer),
                    Some(&result.session_id),
                );
                self.send_final(&req, &progress, &final_md).await;
                self.emit_finished("run.completed", "ok", &req, Some(&result.session_id), None);
                RunStatus::Completed {
                    session_id: result.session_id,
                }
            }
            Outcome::Cancelled => {
                let text = compose_final(STATUS_CANCELLED, elapsed, steps, None, session_id.as_deref());
                self.edit_terminal(&progress, &text).await;
                self.emit_finished("run.cancelled", "cancelled", &req, session_id.as_deref(), None);
                RunStatus::Cancelled { session_id }
            }
            Outcome::Failed(err) => {
                let error = format!("{err:#}");
                let body = format!("Error: {error}");
                let text = compose_final(STATUS_ERROR, elapsed, steps, Some(&body), session_id.as_deref());
                self.edit_terminal(&progress, &text).await;
                self.emit_finished("run.failed", "error", &req, session_id.as_deref(), Some(&error));
                RunStatus::Failed { session_id, error }
            }
        }
    }

    /// Resolve the session from the replied-to message and signal its run.
    pub async fn handle_cancel(&self, msg: &IncomingMessage) -> CancelOutcome {
        let session_id = msg.reply_to_text.as_deref().and_then(extract_session_id);
        let Some(session_id) = session_id else {
            self.reply(msg.chat_id, msg.message_id, CANCEL_NEEDS_REPLY).await;
            return CancelOutcome::NoSession;
        };
        if !self.running.cancel(&session_id) {
            self.reply(msg.chat_id, msg.message_id, CANCEL_NOT_RUNNING).await;
            return CancelOutcome::NotRunning;
        }
        info!(session_id = %session_id, "cancel requested");
        CancelOutcome::Cancelled
    }

    async fn flush_progress(
        &self,
        progress: &mut ProgressMessage,
        renderer: &ProgressRenderer,
        started: Instant,
        session_id: Option<&str>,
        throttle: &mut EditThrottle,
    ) {
        let text = renderer.render(STATUS_WORKING, started.elapsed(), session_id);
        if text != progress.last_text {
            let (rendered, entities) = prepare_telegram(&text, self.cfg.final_edit_limit);
            match self
                .cfg
                .bot
                .edit_message_text(
                    progress.chat_id,
                    progress.message_id,
                    &rendered,
                    entities.as_deref(),
                )
                .await
            {
                Ok(()) => progress.last_text = text,
                Err(err) => debug!("progress edit skipped: {err}"),
            }
        }
        throttle.flushed(Instant::now());
    }

    /// Deliver the final answer: edited in place when it fits and nobody asked
    /// for a notification, otherwise as a new loud reply that replaces the
    /// progress message.
    async fn send_final(&self, req: &RunRequest, progress: &ProgressMessage, final_md: &str) {
        let cfg = &self.cfg;
        let (full, _) = render_markdown(final_md);
        let fits = char_len(&full) <= cfg.final_edit_limit;
        let (text, entities) = prepare_telegram(final_md, cfg.final_edit_limit);

        if fits && !cfg.final_notify {
            match cfg
                .bot
                .edit_message_text(progress.chat_id, progress.message_id, &text, entities.as_deref())
                .await
            {
                Ok(()) => return,
                Err(err) => warn!("final edit failed, sending a new message: {err}"),
            }
        }

        let message = SendMessage::new(req.chat_id, text.clone())
            .reply_to(req.user_msg_id)
            .silent(false)
            .with_entities(entities.clone());
        match cfg.bot.send_message(&message).await {
            Ok(_) => {
                if let Err(err) = cfg
                    .bot
                    .delete_message(progress.chat_id, progress.message_id)
                    .await
                {
                    warn!("failed to delete progress message: {err}");
                }
            }
            Err(err) => {
                warn!("final message failed, editing progress instead: {err}");
                if let Err(err) = cfg
                    .bot
                    .edit_message_text(progress.chat_id, progress.message_id, &text, entities.as_deref())
                    .await
                {
                    warn!("final answer could not be delivered: {err}");
                }
            }
        }
    }

    async fn edit_terminal(&self, progress: &ProgressMessage, markdown: &str) {
        let (text, entities) = prepare_telegram(markdown, self.cfg.final_edit_limit);
        if let Err(err) = self
            .cfg
            .bot
            .edit_message_text(progress.chat_id, progress.message_id, &text, entities.as_deref())
            .await
        {
            warn!("terminal edit failed: {err}");
        }
    }

    async fn reply(&self, chat_id: i64, reply_to: i64, text: &str) {
        let message = SendMessage::new(chat_id, text).reply_to(reply_to);
        if let Err(err) = self.cfg.bot.send_message(&message).await {
            warn!("reply failed: {err}");
        }
    }

    fn emit_finished(
        &self,
        event: &'static str,
        status: &'static str,
        req: &RunRequest,
        session_id: Option<&str>,
        detail: Option<&str>,
    ) {
        emit_event(
            if detail.is_some() { Level::WARN } else { Level::INFO },
            ObservabilityEvent {
                event,
                component: "bridge.run",
                session_id,
                chat_id: Some(req.chat_id),
                message_id: Some(req.user_msg_id),
                status: Some(status),
                detail,
                ..Default::default()
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_removes_only_its_own_run() {
        let tasks = RunningTasks::new();
        let mut first = tasks.registration(1, CancellationToken::new());
        assert!(first.bind("s1"));

        let mut second = tasks.registration(2, CancellationToken::new());
        assert!(!second.bind("s1"));
        drop(second);
        assert!(tasks.contains("s1"));

        drop(first);
        assert!(tasks.is_empty());
    }

    #[test]
    fn cancel_signals_token_and_keeps_entry() {
        let tasks = RunningTasks::new();
        let token = CancellationToken::new();
        let mut registration = tasks.registration(1, token.clone());
        registration.bind("s1");

        assert!(tasks.cancel("s1"));
        assert!(token.is_cancelled());
        assert!(tasks.contains("s1"));
        assert!(!tasks.cancel("other"));
    }

    #[test]
    fn rebinding_moves_the_entry() {
        let tasks = RunningTasks::new();
        let mut registration = tasks.registration(1, CancellationToken::new());
        registration.bind("old");
        registration.bind("new");
        assert!(!tasks.contains("old"));
        assert!(tasks.contains("new"));
        assert_eq!(registration.session_id(), Some("new"));
    }

    #[test]
    fn admission_policy_parses() {
        assert_eq!("queue".parse::<AdmissionPolicy>(), Ok(AdmissionPolicy::Queue));
        assert_eq!(" Reject ".parse::<AdmissionPolicy>(), Ok(AdmissionPolicy::Reject));
        assert!("drop".parse::<AdmissionPolicy>().is_err());
    }
}
