use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bridge_channels::{
    load_config, resolve_config_path, run_bridge, startup_banner, Bridge, BridgeConfig,
    BridgeFileConfig, TelegramClient,
};
use bridge_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent,
};
use bridge_runtime::{CodexExecConfig, CodexExecRunner};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

/// How long ctrl-c waits for cancelled runs to post their last edit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "exec-bridge")]
#[command(about = "Drive `codex exec` from a Telegram chat")]
struct Cli {
    #[command(flatten)]
    options: Options,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Args, Debug, Clone, Default)]
struct Options {
    /// Config file; defaults to ./exec-bridge.toml, then the user config dir.
    #[arg(long, global = true, env = "EXEC_BRIDGE_CONFIG")]
    config: Option<PathBuf>,
    /// Deliver every final answer as a new message (notifies the chat).
    #[arg(long, global = true, conflicts_with = "no_final_notify")]
    final_notify: bool,
    /// Edit final answers into the progress message when they fit.
    #[arg(long, global = true)]
    no_final_notify: bool,
    /// Codex profile passed as `--profile`.
    #[arg(long, global = true)]
    profile: Option<String>,
    /// Working directory for codex; overrides `workdir` from the config.
    #[arg(long, global = true)]
    cd: Option<PathBuf>,
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Poll Telegram and run prompts (the default).
    Serve,
    /// Load and validate the config, print a summary, and exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.options.config.as_deref())?;
    let file = load_config(&config_path)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::CheckConfig => {
            println!("{}", config_summary(&config_path, &file, &cli.options));
            Ok(())
        }
        Command::Serve => serve(cli.options, config_path, file).await,
    }
}

async fn serve(options: Options, config_path: PathBuf, file: BridgeFileConfig) -> anyhow::Result<()> {
    let logs_dir = resolve_logs_dir(&options, &file);
    let (_log_guard, log_info) = init_process_logging("bridge", &logs_dir, file.log_retention_days)?;
    emit_event(
        tracing::Level::INFO,
        ObservabilityEvent {
            event: "logging.initialized",
            component: "bridge.main",
            status: Some("ok"),
            detail: Some("bridge jsonl logging initialized"),
            ..Default::default()
        },
    );
    info!("bridge logging initialized: {:?}", log_info);
    info!("config loaded from {}", config_path.display());

    let codex = codex_config(&options, &file);
    let client = Arc::new(
        TelegramClient::new(file.bot_token.clone()).context("failed to create telegram client")?,
    );
    let runner = Arc::new(CodexExecRunner::new(codex.clone()));

    let mut cfg = BridgeConfig::new(client.clone(), runner, file.chat_id);
    cfg.final_notify = resolve_final_notify(&options, &file);
    cfg.max_concurrency = file.max_concurrency;
    cfg.admission = file.admission;
    cfg.progress_edit_every = file.progress_edit_every;
    cfg.startup_msg = startup_banner(&codex, &cfg);
    let bridge = Bridge::new(cfg);

    tokio::select! {
        result = run_bridge(bridge.clone(), client) => result,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("shutting down");
            let drained = bridge.shutdown(SHUTDOWN_GRACE).await;
            if !drained {
                warn!("runs still finishing after {}s, exiting anyway", SHUTDOWN_GRACE.as_secs());
            }
            emit_event(
                tracing::Level::INFO,
                ObservabilityEvent {
                    event: "bridge.stopped",
                    component: "bridge.main",
                    status: Some(if drained { "ok" } else { "timeout" }),
                    ..Default::default()
                },
            );
            Ok(())
        }
    }
}

/// Flags win over the config file; the default is to notify.
fn resolve_final_notify(options: &Options, file: &BridgeFileConfig) -> bool {
    if options.no_final_notify {
        return false;
    }
    if options.final_notify {
        return true;
    }
    file.final_notify.unwrap_or(true)
}

fn codex_config(options: &Options, file: &BridgeFileConfig) -> CodexExecConfig {
    let defaults = CodexExecConfig::default();
    CodexExecConfig {
        codex_cmd: file.codex_cmd.clone().unwrap_or(defaults.codex_cmd),
        extra_args: file.codex_args.clone(),
        profile: options.profile.clone().or_else(|| file.profile.clone()),
        workdir: options.cd.clone().or_else(|| file.workdir.clone()),
    }
}

fn resolve_logs_dir(options: &Options, file: &BridgeFileConfig) -> PathBuf {
    if let Some(dir) = options.logs_dir.clone().or_else(|| file.logs_dir.clone()) {
        return dir;
    }
    let root = dirs::data_local_dir()
        .map(|dir| dir.join("exec-bridge"))
        .unwrap_or_else(|| PathBuf::from(".exec-bridge"));
    canonical_logs_dir_from_root(&root)
}

fn config_summary(path: &Path, file: &BridgeFileConfig, options: &Options) -> String {
    let codex = codex_config(options, file);
    let mut lines = vec![
        format!("config: {}", path.display()),
        format!("chat_id: {}", file.chat_id),
        format!("codex: {} {}", codex.codex_cmd, codex.command_args(None).join(" ")),
        format!("final_notify: {}", resolve_final_notify(options, file)),
        format!(
            "max_concurrency: {} ({:?})",
            file.max_concurrency, file.admission
        ),
        format!(
            "progress_edit_every: {:.1}s",
            file.progress_edit_every.as_secs_f64()
        ),
        format!("logs: {}", resolve_logs_dir(options, file).display()),
    ];
    if let Some(dir) = &codex.workdir {
        lines.push(format!("workdir: {}", dir.display()));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    use bridge_channels::AdmissionPolicy;

    fn file_config() -> BridgeFileConfig {
        BridgeFileConfig {
            bot_token: "123:secret".to_string(),
            chat_id: 42,
            final_notify: None,
            progress_edit_every: Duration::from_secs(2),
            max_concurrency: 4,
            admission: AdmissionPolicy::Queue,
            codex_cmd: None,
            codex_args: vec!["--skip-git-repo-check".to_string()],
            profile: Some("file-profile".to_string()),
            workdir: Some(PathBuf::from("/srv/file")),
            logs_dir: None,
            log_retention_days: 14,
        }
    }

    #[test]
    fn final_notify_defaults_on_and_flags_override_file() {
        let mut file = file_config();
        assert!(resolve_final_notify(&Options::default(), &file));

        file.final_notify = Some(false);
        assert!(!resolve_final_notify(&Options::default(), &file));

        let on = Options {
            final_notify: true,
            ..Options::default()
        };
        assert!(resolve_final_notify(&on, &file));

        file.final_notify = Some(true);
        let off = Options {
            no_final_notify: true,
            ..Options::default()
        };
        assert!(!resolve_final_notify(&off, &file));
    }

    #[test]
    fn cli_profile_and_cd_beat_config() {
        let options = Options {
            profile: Some("cli".to_string()),
            cd: Some(PathBuf::from("/tmp/work")),
            ..Options::default()
        };
        let codex = codex_config(&options, &file_config());
        assert_eq!(codex.codex_cmd, "codex");
        assert_eq!(codex.profile.as_deref(), Some("cli"));
        assert_eq!(codex.workdir, Some(PathBuf::from("/tmp/work")));
        assert_eq!(codex.extra_args, vec!["--skip-git-repo-check"]);
    }

    #[test]
    fn notify_flags_conflict() {
        let err = Cli::try_parse_from(["exec-bridge", "--final-notify", "--no-final-notify"]);
        assert!(err.is_err());
    }

    #[test]
    fn subcommand_is_optional() {
        let cli = Cli::try_parse_from(["exec-bridge", "--profile", "p"]).unwrap();
        assert_eq!(cli.command, None);
        assert_eq!(cli.options.profile.as_deref(), Some("p"));

        let cli = Cli::try_parse_from(["exec-bridge", "check-config"]).unwrap();
        assert_eq!(cli.command, Some(Command::CheckConfig));
    }

    #[test]
    fn summary_never_prints_the_token() {
        let summary = config_summary(Path::new("x.toml"), &file_config(), &Options::default());
        assert!(summary.contains("chat_id: 42"));
        assert!(!summary.contains("secret"));
    }
}
