use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use bridge_types::{AgentEvent, RunResult};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::runner::{AgentRunner, SessionGuard, SessionLocks};

const STDERR_TAIL_CHARS: usize = 4_000;

#[derive(Debug, Clone)]
pub struct CodexExecConfig {
    pub codex_cmd: String,
    pub extra_args: Vec<String>,
    pub profile: Option<String>,
    pub workdir: Option<PathBuf>,
}

impl Default for CodexExecConfig {
    fn default() -> Self {
        Self {
            codex_cmd: "codex".to_string(),
            extra_args: Vec::new(),
            profile: None,
            workdir: None,
        }
    }
}

impl CodexExecConfig {
    /// Arguments for one turn. The prompt itself is fed through stdin (`-`).
    pub fn command_args(&self, resume: Option<&str>) -> Vec<String> {
        let mut args = vec!["exec".to_string(), "--json".to_string()];
        if let Some(profile) = &self.profile {
            args.push("--profile".to_string());
            args.push(profile.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        if let Some(session_id) = resume {
            args.push("resume".to_string());
            args.push(session_id.to_string());
        }
        args.push("-".to_string());
        args
    }
}

/// Runs `codex exec --json` as a child process, one process per turn.
pub struct CodexExecRunner {
    config: CodexExecConfig,
    sessions: SessionLocks,
}

impl CodexExecRunner {
    pub fn new(config: CodexExecConfig) -> Self {
        Self {
            config,
            sessions: SessionLocks::new(),
        }
    }

    pub fn config(&self) -> &CodexExecConfig {
        &self.config
    }

    /// Turns that resume the same session wait for each other. A brand new
    /// session takes its lock as soon as codex reports the id.
    pub async fn run_serialized(
        &self,
        prompt: &str,
        resume: Option<&str>,
        events: mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<RunResult> {
        let guard = match resume {
            Some(session_id) => Some(self.sessions.acquire(session_id).await),
            None => None,
        };
        self.run_process(prompt, resume, events, guard).await
    }

    async fn run_process(
        &self,
        prompt: &str,
        resume: Option<&str>,
        events: mpsc::Sender<AgentEvent>,
        mut guard: Option<SessionGuard>,
    ) -> anyhow::Result<RunResult> {
        let args = self.config.command_args(resume);
        let mut command = Command::new(&self.config.codex_cmd);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.workdir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", self.config.codex_cmd))?;
        info!(
            pid = child.id().unwrap_or_default(),
            resume = resume.unwrap_or(""),
            "codex exec started"
        );

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr unavailable"))?;

        stdin.write_all(prompt.as_bytes()).await?;
        stdin.shutdown().await?;
        drop(stdin);

        let stderr_task = tokio::spawn(read_tail(stderr, STDERR_TAIL_CHARS));

        let mut session_id = resume.map(str::to_string);
        let mut answer = String::new();
        let mut saw_agent_message = false;
        let mut failure: Option<String> = None;

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            let Some(event) = AgentEvent::parse_line(&line) else {
                debug!("codex: skipping non-event line");
                continue;
            };

            if let Some(id) = event.session_id() {
                if guard.is_none() {
                    guard = Some(self.sessions.acquire(id).await);
                }
                session_id = Some(id.to_string());
            }
            if let Some(text) = event.agent_message() {
                answer = text.to_string();
                saw_agent_message = true;
            }
            match &event {
                AgentEvent::TurnFailed { error } => failure = Some(error.message.clone()),
                AgentEvent::Error { message } => failure = Some(message.clone()),
                _ => {}
            }

            if events.send(event).await.is_err() {
                debug!("codex: event receiver dropped");
            }
        }

        let status = child.wait().await?;
        let stderr_tail = stderr_task.await.unwrap_or_default();
        drop(guard);

        if !status.success() {
            let detail = failure.unwrap_or_else(|| stderr_tail.trim().to_string());
            warn!(%status, "codex exec failed");
            bail!("codex exec exited with {status}: {detail}");
        }
        if let Some(message) = failure.filter(|_| !saw_agent_message) {
            bail!("codex turn failed: {message}");
        }

        let session_id = session_id
            .ok_or_else(|| anyhow!("codex exec finished without reporting a session id"))?;

        Ok(RunResult {
            session_id,
            answer,
            saw_agent_message,
        })
    }
}

#[async_trait]
impl AgentRunner for CodexExecRunner {
    async fn run(
        &self,
        prompt: &str,
        resume: Option<&str>,
        events: mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<RunResult> {
        self.run_serialized(prompt, resume, events).await
    }
}

async fn read_tail(
    mut stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    cap: usize,
) -> String {
    let mut out = String::new();
    let mut buf = vec![0_u8; 4096];
    loop {
        let read = match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        out.push_str(&String::from_utf8_lossy(&buf[..read]));
        let len = out.chars().count();
        if len > cap * 2 {
            out = out.chars().skip(len - cap).collect();
        }
    }
    let len = out.chars().count();
    if len > cap {
        out = out.chars().skip(len - cap).collect();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_turn_args() {
        let config = CodexExecConfig::default();
        assert_eq!(config.command_args(None), vec!["exec", "--json", "-"]);
    }

    #[test]
    fn resume_turn_args_keep_options_before_subcommand() {
        let config = CodexExecConfig {
            profile: Some("work".to_string()),
            extra_args: vec!["--skip-git-repo-check".to_string()],
            ..CodexExecConfig::default()
        };
        assert_eq!(
            config.command_args(Some("019b66fc-64c2-7a71-81cd-081c504cfeb2")),
            vec![
                "exec",
                "--json",
                "--profile",
                "work",
                "--skip-git-repo-check",
                "resume",
                "019b66fc-64c2-7a71-81cd-081c504cfeb2",
                "-",
            ]
        );
    }

    #[tokio::test]
    async fn read_tail_keeps_the_end() {
        let data = format!("{}END", "x".repeat(10_000));
        let tail = read_tail(std::io::Cursor::new(data.into_bytes()), 100).await;
        assert_eq!(tail.chars().count(), 100);
        assert!(tail.ends_with("END"));
    }
}
