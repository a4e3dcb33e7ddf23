//! TOML configuration for the bridge.
//!
//! Looked up in order: an explicit path (`--config` / `EXEC_BRIDGE_CONFIG`),
//! `./exec-bridge.toml`, then `<config dir>/exec-bridge/config.toml`.
//! Only `bot_token` and `chat_id` are required.

use std::path::{Path, PathBuf};
use std::time::Duration;

use toml::{Table, Value};

use crate::bridge::{AdmissionPolicy, PROGRESS_EDIT_EVERY};
use crate::error::ConfigError;

pub const LOCAL_CONFIG_FILE: &str = "exec-bridge.toml";
const DEFAULT_MAX_CONCURRENCY: usize = 4;
const DEFAULT_LOG_RETENTION_DAYS: u64 = 14;

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeFileConfig {
    pub bot_token: String,
    pub chat_id: i64,
    /// `None` leaves the choice to the command line default.
    pub final_notify: Option<bool>,
    pub progress_edit_every: Duration,
    pub max_concurrency: usize,
    pub admission: AdmissionPolicy,
    pub codex_cmd: Option<String>,
    pub codex_args: Vec<String>,
    pub profile: Option<String>,
    pub workdir: Option<PathBuf>,
    pub logs_dir: Option<PathBuf>,
    pub log_retention_days: u64,
}

fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(LOCAL_CONFIG_FILE)];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("exec-bridge").join("config.toml"));
    }
    paths
}

/// The explicit path wins even if it does not exist; reading it will say so.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    let candidates = candidate_paths();
    if let Some(found) = candidates.iter().find(|path| path.is_file()) {
        return Ok(found.clone());
    }
    Err(ConfigError::NotFound {
        searched: candidates
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

pub fn load_config(path: &Path) -> Result<BridgeFileConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&raw, path)
}

pub fn parse_config(raw: &str, path: &Path) -> Result<BridgeFileConfig, ConfigError> {
    let table: Table = toml::from_str(raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let fields = Fields { table: &table, path };

    let bot_token = match table.get("bot_token") {
        Some(Value::String(token)) if !token.trim().is_empty() => token.trim().to_string(),
        Some(Value::String(_)) => return Err(fields.invalid("bot_token", "must not be empty")),
        Some(_) => return Err(fields.invalid("bot_token", "must be a string")),
        None => return Err(fields.invalid("bot_token", "is required")),
    };
    let chat_id = match table.get("chat_id") {
        Some(Value::Integer(id)) => *id,
        Some(Value::String(_)) => {
            return Err(fields.invalid("chat_id", "must be an integer, not a quoted string"))
        }
        Some(_) => return Err(fields.invalid("chat_id", "must be an integer")),
        None => return Err(fields.invalid("chat_id", "is required")),
    };

    let progress_edit_every = match table.get("progress_edit_every_secs") {
        None => PROGRESS_EDIT_EVERY,
        Some(value) => {
            let secs = match value {
                Value::Integer(n) => *n as f64,
                Value::Float(f) => *f,
                _ => return Err(fields.invalid("progress_edit_every_secs", "must be a number")),
            };
            if !secs.is_finite() || secs <= 0.0 {
                return Err(fields.invalid("progress_edit_every_secs", "must be positive"));
            }
            Duration::try_from_secs_f64(secs)
                .map_err(|_| fields.invalid("progress_edit_every_secs", "is too large"))?
        }
    };

    let max_concurrency = match fields.integer("max_concurrency")? {
        None => DEFAULT_MAX_CONCURRENCY,
        Some(n) if n >= 1 => n as usize,
        Some(_) => return Err(fields.invalid("max_concurrency", "must be at least 1")),
    };

    let admission = match fields.string("admission")? {
        None => AdmissionPolicy::default(),
        Some(raw) => raw
            .parse()
            .map_err(|reason: String| fields.invalid("admission", reason))?,
    };

    let log_retention_days = match fields.integer("log_retention_days")? {
        None => DEFAULT_LOG_RETENTION_DAYS,
        Some(n) if n >= 1 => n as u64,
        Some(_) => return Err(fields.invalid("log_retention_days", "must be at least 1")),
    };

    let codex_args = match table.get("codex_args") {
        None => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(arg) => Ok(arg.clone()),
                _ => Err(fields.invalid("codex_args", "must be a list of strings")),
            })
            .collect::<Result<_, _>>()?,
        Some(_) => return Err(fields.invalid("codex_args", "must be a list of strings")),
    };

    Ok(BridgeFileConfig {
        bot_token,
        chat_id,
        final_notify: fields.boolean("final_notify")?,
        progress_edit_every,
        max_concurrency,
        admission,
        codex_cmd: fields.string("codex_cmd")?.map(str::to_string),
        codex_args,
        profile: fields.string("profile")?.map(str::to_string),
        workdir: fields.string("workdir")?.map(expand_home),
        logs_dir: fields.string("logs_dir")?.map(expand_home),
        log_retention_days,
    })
}

fn expand_home(raw: &str) -> PathBuf {
    match (raw.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(raw),
    }
}

struct Fields<'a> {
    table: &'a Table,
    path: &'a Path,
}

impl<'a> Fields<'a> {
    fn invalid(&self, key: &'static str, reason: impl Into<String>) -> ConfigError {
        ConfigError::Invalid {
            path: self.path.to_path_buf(),
            key,
            reason: reason.into(),
        }
    }

    fn string(&self, key: &'static str) -> Result<Option<&'a str>, ConfigError> {
        match self.table.get(key) {
            None => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.as_str())),
            Some(_) => Err(self.invalid(key, "must be a string")),
        }
    }

    fn integer(&self, key: &'static str) -> Result<Option<i64>, ConfigError> {
        match self.table.get(key) {
            None => Ok(None),
            Some(Value::Integer(value)) => Ok(Some(*value)),
            Some(_) => Err(self.invalid(key, "must be an integer")),
        }
    }

    fn boolean(&self, key: &'static str) -> Result<Option<bool>, ConfigError> {
        match self.table.get(key) {
            None => Ok(None),
            Some(Value::Boolean(value)) => Ok(Some(*value)),
            Some(_) => Err(self.invalid(key, "must be true or false")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(raw: &str) -> Result<BridgeFileConfig, ConfigError> {
        parse_config(raw, Path::new("test.toml"))
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse("bot_token = \"123:abc\"\nchat_id = 42\n").unwrap();
        assert_eq!(config.bot_token, "123:abc");
        assert_eq!(config.chat_id, 42);
        assert_eq!(config.final_notify, None);
        assert_eq!(config.progress_edit_every, PROGRESS_EDIT_EVERY);
        assert_eq!(config.max_concurrency, DEFAULT_MAX_CONCURRENCY);
        assert_eq!(config.admission, AdmissionPolicy::Queue);
        assert!(config.codex_args.is_empty());
    }

    #[test]
    fn full_config_round_trips_values() {
        let config = parse(
            r#"
bot_token = "123:abc"
chat_id = -1001
final_notify = false
progress_edit_every_secs = 1.5
max_concurrency = 2
admission = "reject"
codex_cmd = "/opt/codex"
codex_args = ["--skip-git-repo-check"]
profile = "work"
workdir = "/srv/repo"
log_retention_days = 3
"#,
        )
        .unwrap();
        assert_eq!(config.chat_id, -1001);
        assert_eq!(config.final_notify, Some(false));
        assert_eq!(config.progress_edit_every, Duration::from_millis(1500));
        assert_eq!(config.admission, AdmissionPolicy::Reject);
        assert_eq!(config.codex_cmd.as_deref(), Some("/opt/codex"));
        assert_eq!(config.codex_args, vec!["--skip-git-repo-check"]);
        assert_eq!(config.workdir, Some(PathBuf::from("/srv/repo")));
        assert_eq!(config.log_retention_days, 3);
    }

    #[test]
    fn empty_bot_token_is_rejected() {
        let err = parse("bot_token = \"  \"\nchat_id = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "bot_token", .. }));
    }

    #[test]
    fn string_chat_id_is_rejected() {
        let err = parse("bot_token = \"123:abc\"\nchat_id = \"42\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "chat_id", .. }));
        assert!(err.to_string().contains("chat_id"));
    }

    #[test]
    fn missing_chat_id_is_rejected() {
        let err = parse("bot_token = \"123:abc\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "chat_id", .. }));
    }

    #[test]
    fn bad_values_name_their_key() {
        for (raw, key) in [
            ("max_concurrency = 0", "max_concurrency"),
            ("admission = \"drop\"", "admission"),
            ("progress_edit_every_secs = -1", "progress_edit_every_secs"),
            ("codex_args = [1, 2]", "codex_args"),
            ("final_notify = \"yes\"", "final_notify"),
        ] {
            let err = parse(&format!("bot_token = \"t\"\nchat_id = 1\n{raw}\n")).unwrap_err();
            match err {
                ConfigError::Invalid { key: got, .. } => assert_eq!(got, key),
                other => panic!("unexpected error for {raw}: {other}"),
            }
        }
    }

    #[test]
    fn huge_edit_interval_is_rejected_not_a_panic() {
        let err = parse("bot_token = \"1:a\"\nchat_id = 1\nprogress_edit_every_secs = 1e30\n")
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "progress_edit_every_secs",
                ..
            }
        ));
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(parse("bot_token = "), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn load_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bot_token = \"123:abc\"\nchat_id = 7").unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.chat_id, 7);
    }

    #[test]
    fn explicit_path_is_used_as_is() {
        let path = Path::new("/nonexistent/exec-bridge.toml");
        assert_eq!(resolve_config_path(Some(path)).unwrap(), path);
        assert!(matches!(load_config(path), Err(ConfigError::Io { .. })));
    }
}
