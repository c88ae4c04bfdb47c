//! Crate error taxonomy.
//!
//! Transient transport failures surface as strings through the request
//! queue's resolve path; corrupt persisted state is logged and discarded by
//! the component that found it; only startup failures (archive open, port
//! bind) are allowed to abort the process.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    WorldModel(#[from] WorldModelError),

    #[error(transparent)]
    Cron(#[from] CronError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// Inbound keys must carry the agent segment this gateway serves.
    #[error("session key {key:?} addresses unknown agent {agent:?}")]
    ForeignAgent { key: String, agent: String },

    #[error("session log I/O failed for {path}: {source}")]
    LogIo {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to open archive: {0}")]
    Open(String),

    #[error(transparent)]
    Query(#[from] sqlx::Error),

    #[error("archive migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Error)]
pub enum WorldModelError {
    #[error("world model I/O failed for {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum CronError {
    #[error("cron job {0} not found")]
    JobNotFound(String),

    #[error("invalid schedule {schedule:?}: {reason}")]
    InvalidSchedule { schedule: String, reason: String },

    #[error("failed to persist cron jobs: {0}")]
    Persist(String),
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid model reference {0:?}")]
    InvalidModelRef(String),

    #[error("unknown alias {0:?}")]
    UnknownAlias(String),

    /// Raised by the placeholder runtime when no provider layer is linked in.
    #[error("no agent runtime is configured: {0}")]
    NotConfigured(String),

    #[error("agent call failed: {0}")]
    Call(String),

    #[error("completion call timed out after {0} ms")]
    Timeout(u64),
}
