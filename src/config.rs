//! Process configuration, read once from the environment at startup.
//!
//! Hot-reloadable pieces (current model, fallback chain, heartbeat model
//! override) do not live here; they belong to [`crate::config_store`], which
//! persists them and can swap them at runtime.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Strategy for resuming coding-agent subprocess sessions. The bridge itself
/// is an external collaborator; the gateway only validates and stores the
/// choice so the bridge can read one setting instead of baking one in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CodingResumeStrategy {
    /// Start a fresh subprocess session on every bridge request.
    #[default]
    FreshSession,
    /// Reuse the stored session id and let the subprocess reject stale ones.
    ReuseId,
    /// Maintain an id mapping file next to the bridge state.
    MapFile,
    /// Probe with `--resume` once and fall back to a fresh session.
    Probe,
}

impl CodingResumeStrategy {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "fresh-session" => Some(Self::FreshSession),
            "reuse-id" => Some(Self::ReuseId),
            "map-file" => Some(Self::MapFile),
            "probe" => Some(Self::Probe),
            _ => None,
        }
    }
}

/// Static gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Root of all persisted state.
    pub data_dir: PathBuf,

    pub host: String,
    pub port: u16,

    /// Default model, `provider/model`.
    pub default_provider: String,
    pub default_model: String,

    pub heartbeat_enabled: bool,
    pub heartbeat_interval: Duration,
    /// Active-hours window as minutes of day, `None` end points mean 00:00.
    pub heartbeat_active_start: u16,
    pub heartbeat_active_end: u16,
    /// Delivery channel string, e.g. `discord:dm:<userId>`.
    pub heartbeat_delivery: Option<String>,

    /// Per-session in-memory buffer bound (N).
    pub conversation_history: usize,
    pub world_model_path: PathBuf,
    pub archive_path: PathBuf,
    pub extraction_enabled: bool,
    pub extraction_timeout: Duration,

    /// IANA timezone name; `None` means the system timezone.
    pub user_timezone: Option<String>,

    /// Supervisor invocation used by the restart manager, shell-split.
    pub restart_command: Vec<String>,

    /// Directory of static dashboard assets served by the management API.
    pub static_dir: PathBuf,

    pub coding_resume_strategy: CodingResumeStrategy,
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env_string(name).map(|v| v.parse::<T>()) {
        Some(Ok(value)) => value,
        Some(Err(_)) => {
            tracing::warn!(var = name, "unparseable environment value, using default");
            default
        }
        None => default,
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match env_string(name).as_deref() {
        Some("1") | Some("true") | Some("yes") | Some("on") => true,
        Some("0") | Some("false") | Some("no") | Some("off") => false,
        Some(other) => {
            tracing::warn!(var = name, value = other, "unparseable boolean, using default");
            default
        }
        None => default,
    }
}

/// Parse `HH:MM` into minutes of day.
pub fn parse_minutes_of_day(value: &str) -> Option<u16> {
    let (hours, minutes) = value.split_once(':')?;
    let hours: u16 = hours.parse().ok()?;
    let minutes: u16 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 60 + minutes)
}

impl GatewayConfig {
    /// Build the configuration from the environment. Missing variables fall
    /// back to defaults; malformed values are logged and defaulted, never
    /// fatal.
    pub fn from_env() -> Self {
        let data_dir = env_string("GATEWAY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data"));

        let heartbeat_active_start = env_string("HEARTBEAT_ACTIVE_START")
            .and_then(|v| parse_minutes_of_day(&v))
            .unwrap_or(0);
        let heartbeat_active_end = env_string("HEARTBEAT_ACTIVE_END")
            .and_then(|v| parse_minutes_of_day(&v))
            .unwrap_or(0);

        let restart_command = env_string("GATEWAY_RESTART_COMMAND")
            .map(|v| v.split_whitespace().map(String::from).collect())
            .unwrap_or_else(|| {
                vec![
                    "systemctl".to_string(),
                    "--user".to_string(),
                    "restart".to_string(),
                    "gatehouse".to_string(),
                ]
            });

        let coding_resume_strategy = env_string("GATEWAY_CODING_RESUME")
            .map(|v| {
                CodingResumeStrategy::parse(&v).unwrap_or_else(|| {
                    tracing::warn!(value = %v, "unknown coding resume strategy, using fresh-session");
                    CodingResumeStrategy::FreshSession
                })
            })
            .unwrap_or_default();

        let world_model_path = env_string("STATE_WORLD_MODEL_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("state/world-model.md"));
        let archive_path = env_string("STATE_ARCHIVE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("state/archive.db"));

        Self {
            host: env_string("GATEWAY_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: env_parse("GATEWAY_PORT", 7171),
            default_provider: env_string("DEFAULT_PROVIDER")
                .unwrap_or_else(|| "anthropic".to_string()),
            default_model: env_string("DEFAULT_MODEL")
                .unwrap_or_else(|| "claude-sonnet-4-5".to_string()),
            heartbeat_enabled: env_bool("HEARTBEAT_ENABLED", false),
            heartbeat_interval: Duration::from_millis(env_parse(
                "HEARTBEAT_INTERVAL_MS",
                30 * 60 * 1000u64,
            )),
            heartbeat_active_start,
            heartbeat_active_end,
            heartbeat_delivery: env_string("HEARTBEAT_DELIVERY"),
            conversation_history: env_parse("STATE_CONVERSATION_HISTORY", 10usize).max(1),
            world_model_path,
            archive_path,
            extraction_enabled: env_bool("STATE_EXTRACTION_ENABLED", true),
            extraction_timeout: Duration::from_millis(env_parse(
                "STATE_EXTRACTION_TIMEOUT_MS",
                5_000u64,
            )),
            user_timezone: env_string("USER_TIMEZONE"),
            restart_command,
            static_dir: env_string("GATEWAY_STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("public")),
            coding_resume_strategy,
            data_dir,
        }
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    pub fn heartbeat_dir(&self) -> PathBuf {
        self.data_dir.join("heartbeat")
    }

    pub fn cron_dir(&self) -> PathBuf {
        self.data_dir.join("cron")
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.data_dir.join("skills")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn sentinel_path(&self) -> PathBuf {
        self.data_dir.join("restart-sentinel.json")
    }

    /// Config snapshot for the management API with nothing secret in it.
    /// Provider credentials never pass through this process, but the restart
    /// command may embed host specifics, so it is masked.
    pub fn masked_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "data_dir": self.data_dir.display().to_string(),
            "host": self.host,
            "port": self.port,
            "default_provider": self.default_provider,
            "default_model": self.default_model,
            "heartbeat_enabled": self.heartbeat_enabled,
            "heartbeat_interval_ms": self.heartbeat_interval.as_millis() as u64,
            "heartbeat_delivery": self.heartbeat_delivery,
            "conversation_history": self.conversation_history,
            "extraction_enabled": self.extraction_enabled,
            "user_timezone": self.user_timezone,
            "restart_command": "***",
            "coding_resume_strategy": self.coding_resume_strategy,
        })
    }

    /// A config rooted at an arbitrary directory, ignoring the ambient
    /// environment. Used by tests and by embedding callers.
    pub fn for_root(root: &Path) -> Self {
        Self {
            data_dir: root.to_path_buf(),
            host: "127.0.0.1".to_string(),
            port: 0,
            default_provider: "anthropic".to_string(),
            default_model: "claude-sonnet-4-5".to_string(),
            heartbeat_enabled: false,
            heartbeat_interval: Duration::from_secs(1800),
            heartbeat_active_start: 0,
            heartbeat_active_end: 0,
            heartbeat_delivery: None,
            conversation_history: 10,
            world_model_path: root.join("state/world-model.md"),
            archive_path: root.join("state/archive.db"),
            extraction_enabled: false,
            extraction_timeout: Duration::from_secs(5),
            user_timezone: None,
            restart_command: vec!["true".to_string()],
            static_dir: root.join("public"),
            coding_resume_strategy: CodingResumeStrategy::FreshSession,
        }
    }
}
