//! Restart with continuity.
//!
//! The gateway does not manage its own process lifecycle. It writes a
//! sentinel carrying the conversational context, then asks an external
//! supervisor to replace it. The successor consumes the sentinel exactly
//! once and delivers a wake message to the original conversation.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Command;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartSentinel {
    pub reason: String,
    /// Unix milliseconds at write time.
    pub timestamp: i64,
    #[serde(default)]
    pub session_key: Option<String>,
    /// Delivery channel string, e.g. `discord:dm:42`.
    #[serde(default)]
    pub delivery_target: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

impl RestartSentinel {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            session_key: None,
            delivery_target: None,
            reply_to: None,
        }
    }
}

pub struct RestartManager {
    sentinel_path: PathBuf,
    supervisor_command: Vec<String>,
}

impl RestartManager {
    pub fn new(sentinel_path: impl Into<PathBuf>, supervisor_command: Vec<String>) -> Self {
        Self {
            sentinel_path: sentinel_path.into(),
            supervisor_command,
        }
    }

    /// Write the sentinel, then hand control to the supervisor. The
    /// supervisor kills this process externally, so a call that "fails"
    /// without stderr is counted as success; we may simply have died before
    /// it could report.
    pub fn trigger_restart(&self, sentinel: &RestartSentinel) -> anyhow::Result<()> {
        self.write_sentinel(sentinel)?;

        let Some((program, args)) = self.supervisor_command.split_first() else {
            anyhow::bail!("no supervisor command configured");
        };
        tracing::info!(reason = %sentinel.reason, command = %program, "invoking supervisor for restart");

        match Command::new(program).args(args).output() {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) if output.stderr.is_empty() => {
                // Non-zero without stderr: assume the supervisor tore us
                // down mid-call and the wait was interrupted.
                Ok(())
            }
            Ok(output) => anyhow::bail!(
                "supervisor exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(error) => anyhow::bail!("failed to spawn supervisor {program:?}: {error}"),
        }
    }

    fn write_sentinel(&self, sentinel: &RestartSentinel) -> anyhow::Result<()> {
        if let Some(parent) = self.sentinel_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.sentinel_path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(sentinel)?)?;
        std::fs::rename(&tmp, &self.sentinel_path)?;
        Ok(())
    }

    /// Read-once-and-delete. An unparseable sentinel is deleted defensively
    /// and reported as absent.
    pub fn consume(&self) -> Option<RestartSentinel> {
        let content = match std::fs::read_to_string(&self.sentinel_path) {
            Ok(content) => content,
            Err(error) => {
                if error.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(%error, "failed to read restart sentinel");
                    let _ = std::fs::remove_file(&self.sentinel_path);
                }
                return None;
            }
        };

        let parsed = serde_json::from_str::<RestartSentinel>(&content);
        if let Err(error) = std::fs::remove_file(&self.sentinel_path) {
            tracing::warn!(%error, "failed to delete restart sentinel after read");
        }
        match parsed {
            Ok(sentinel) => Some(sentinel),
            Err(error) => {
                tracing::warn!(%error, "discarding unparseable restart sentinel");
                None
            }
        }
    }

    pub fn sentinel_exists(&self) -> bool {
        self.sentinel_path.exists()
    }
}
