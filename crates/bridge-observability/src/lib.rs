mod redact;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use redact::{redact_bot_token, RedactingMakeWriter, RedactingWriter, REDACTED_BOT};

const LOG_PREFIX: &str = "exec-bridge";

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub pruned_files: usize,
    pub initialized_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub session_id: Option<&'a str>,
    pub chat_id: Option<i64>,
    pub message_id: Option<i64>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

/// Prompt text for logs: char count and a hash, never the content.
pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!(
        "[redacted len={} hash={}]",
        trimmed.chars().count(),
        short_hash(trimmed)
    )
}

/// Stable within one process only; good for correlating log lines.
pub fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:08x}", hasher.finish() as u32)
}

macro_rules! obs_event {
    ($macro:ident, $event:expr) => {
        tracing::$macro!(
            target: OBS_TARGET,
            component = $event.component,
            event = $event.event,
            session_id = $event.session_id.unwrap_or(""),
            chat_id = $event.chat_id.unwrap_or_default(),
            message_id = $event.message_id.unwrap_or_default(),
            status = $event.status.unwrap_or(""),
            error_code = $event.error_code.unwrap_or(""),
            detail = $event.detail.unwrap_or(""),
            "observability_event"
        )
    };
}

pub const OBS_TARGET: &str = "bridge.obs";

pub fn emit_event(level: Level, event: ObservabilityEvent<'_>) {
    if level == Level::ERROR {
        obs_event!(error, event);
    } else if level == Level::WARN {
        obs_event!(warn, event);
    } else {
        obs_event!(info, event);
    }
}

/// Install the global subscriber: compact console output plus a daily JSONL
/// file. Both sinks scrub bot tokens before anything is written.
pub fn init_process_logging(
    process: &str,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    let pruned = cleanup_old_jsonl(logs_dir, process, retention_days)?;

    let prefix = format!("{LOG_PREFIX}.{process}");
    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(prefix.clone())
        .filename_suffix("jsonl")
        .build(logs_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(RedactingMakeWriter::new(non_blocking))
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_ansi(true)
        .with_writer(RedactingMakeWriter::new(std::io::stderr));

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    let info = LoggingInitInfo {
        process: process.to_string(),
        logs_dir: logs_dir.display().to_string(),
        prefix,
        retention_days,
        pruned_files: pruned,
        initialized_at: Utc::now(),
    };

    Ok((guard, info))
}

/// Date of a `exec-bridge.<process>.YYYY-MM-DD.jsonl` file, if it is one.
fn log_file_date(name: &str, prefix: &str) -> Option<NaiveDate> {
    let date = name.strip_prefix(prefix)?.strip_suffix(".jsonl")?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// Delete this process's daily files older than `retention_days`. Returns
/// how many were removed; files of other processes are left alone.
fn cleanup_old_jsonl(logs_dir: &Path, process: &str, retention_days: u64) -> anyhow::Result<usize> {
    let cutoff = Utc::now().date_naive() - chrono::Days::new(retention_days);
    let prefix = format!("{LOG_PREFIX}.{process}.");
    let mut removed = 0;

    for entry in fs::read_dir(logs_dir)?.flatten() {
        let path = entry.path();
        let expired = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| log_file_date(name, &prefix))
            .is_some_and(|date| date < cutoff);
        if expired && path.is_file() && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }

    Ok(removed)
}

pub fn canonical_logs_dir_from_root(root: &Path) -> PathBuf {
    root.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_text_masks_content() {
        let raw = "please deploy to prod";
        let redacted = redact_text(raw);
        assert!(redacted.contains("[redacted len="));
        assert!(!redacted.contains("deploy"));
    }

    #[test]
    fn redact_text_of_blank_is_empty() {
        assert_eq!(redact_text("   "), "");
    }

    #[test]
    fn log_file_date_needs_prefix_and_valid_date() {
        let prefix = "exec-bridge.bridge.";
        assert_eq!(
            log_file_date("exec-bridge.bridge.2024-02-29.jsonl", prefix),
            NaiveDate::from_ymd_opt(2024, 2, 29)
        );
        assert_eq!(log_file_date("exec-bridge.bridge.2024-02-30.jsonl", prefix), None);
        assert_eq!(log_file_date("exec-bridge.bridge.2024-02-29.log", prefix), None);
        assert_eq!(log_file_date("other.bridge.2024-02-29.jsonl", prefix), None);
    }

    #[test]
    fn short_hash_is_stable_and_short() {
        assert_eq!(short_hash("abc"), short_hash("abc"));
        assert_ne!(short_hash("abc"), short_hash("abd"));
        assert_eq!(short_hash("abc").len(), 8);
    }

    #[test]
    fn canonical_logs_dir_joins_logs_folder() {
        let root = PathBuf::from("/tmp/exec-bridge");
        let logs = canonical_logs_dir_from_root(&root);
        assert_eq!(logs, PathBuf::from("/tmp/exec-bridge").join("logs"));
    }

    #[test]
    fn cleanup_removes_only_expired_files_for_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("exec-bridge.bridge.2001-01-01.jsonl");
        let today = dir.path().join(format!(
            "exec-bridge.bridge.{}.jsonl",
            Utc::now().format("%Y-%m-%d")
        ));
        let other = dir.path().join("exec-bridge.other.2001-01-01.jsonl");
        for path in [&old, &today, &other] {
            fs::write(path, "{}\n").unwrap();
        }

        assert_eq!(cleanup_old_jsonl(dir.path(), "bridge", 14).unwrap(), 1);

        assert!(!old.exists());
        assert!(today.exists());
        assert!(other.exists());
    }
}
