//! Telegram side of the bridge: the Bot API shim, message rendering, the run
//! orchestrator and the poll loop that feeds it.

pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod markdown;
pub mod progress;
pub mod telegram;
pub mod text;
pub mod traits;

pub use bridge::{
    AdmissionPolicy, Bridge, BridgeConfig, CancelOutcome, RunRequest, RunStatus, RunningTasks,
    TELEGRAM_MARKDOWN_LIMIT,
};
pub use config::{load_config, resolve_config_path, BridgeFileConfig};
pub use dispatcher::{dispatch, run_bridge, startup_banner};
pub use error::{ConfigError, TelegramError};
pub use telegram::TelegramClient;
pub use text::{extract_session_id, prepare_telegram, resolve_resume_session, truncate_for_telegram};
pub use traits::{ChatTransport, IncomingMessage, SendMessage};
