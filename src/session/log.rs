//! Append-only per-session audit logs.
//!
//! One JSONL file per session under `sessions/`, named by the hex encoding
//! of the key. The log is the authoritative audit trail and has no retention
//! limit. A partial last line (crash mid-append) is tolerated on read.

use super::key::SessionKey;
use super::Turn;
use crate::error::SessionError;

use std::io::Write as _;
use std::path::{Path, PathBuf};

pub struct SessionLog {
    dir: PathBuf,
}

/// Directory-listing entry for one session.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionInfo {
    pub key: String,
    pub parsed: SessionKey,
    pub message_count: usize,
    /// Timestamp of the newest turn, unix milliseconds. Zero for a file with
    /// no parseable records.
    pub last_activity: i64,
    pub path: PathBuf,
}

impl SessionLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &SessionKey) -> PathBuf {
        self.dir.join(format!("{}.jsonl", key.encode()))
    }

    /// The filename scheme an earlier generation used: non `[A-Za-z0-9._-]`
    /// bytes replaced by `_`. Lossy, so it was retired for hex; files are
    /// migrated lazily on first touch.
    fn legacy_path_for(&self, key: &SessionKey) -> PathBuf {
        let sanitized: String = key
            .to_string()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{sanitized}.jsonl"))
    }

    /// Rename a legacy-named file to the hex name if the hex one does not
    /// exist yet. Called before every read and append.
    fn migrate_legacy(&self, key: &SessionKey) {
        let hex_path = self.path_for(key);
        if hex_path.exists() {
            return;
        }
        let legacy = self.legacy_path_for(key);
        if legacy != hex_path && legacy.exists() {
            if let Err(error) = std::fs::rename(&legacy, &hex_path) {
                tracing::warn!(%error, path = %legacy.display(), "failed to migrate legacy session file");
            } else {
                tracing::info!(session_key = %key, "migrated legacy session filename to hex");
            }
        }
    }

    /// Append one turn as a single JSON line. Creates the directory and file
    /// on first write.
    pub fn append(&self, key: &SessionKey, turn: &Turn) -> Result<(), SessionError> {
        self.migrate_legacy(key);
        let path = self.path_for(key);
        let io_err = |source| SessionError::LogIo {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(&self.dir).map_err(io_err)?;
        let mut line = serde_json::to_vec(turn).expect("turn serialization is infallible");
        line.push(b'\n');

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        file.write_all(&line).map_err(io_err)?;
        Ok(())
    }

    /// All turns in append order. Unparseable lines (including a truncated
    /// final line) are skipped.
    pub fn read(&self, key: &SessionKey) -> Result<Vec<Turn>, SessionError> {
        self.migrate_legacy(key);
        let path = self.path_for(key);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(SessionError::LogIo { path, source }),
        };
        Ok(parse_lines(&content))
    }

    /// A session exists only when its file holds at least one valid record,
    /// the same rule `list` applies. A cleared (zero-record) log does not
    /// count.
    pub fn exists(&self, key: &SessionKey) -> bool {
        self.migrate_legacy(key);
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(content) => content
                .lines()
                .any(|line| serde_json::from_str::<Turn>(line.trim()).is_ok()),
            Err(_) => false,
        }
    }

    /// Truncate a session's log.
    pub fn clear(&self, key: &SessionKey) -> Result<(), SessionError> {
        let path = self.path_for(key);
        match std::fs::write(&path, b"") {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SessionError::LogIo { path, source }),
        }
    }

    /// Scan the sessions directory. Filenames that don't hex-decode to a
    /// valid UTF-8 session key are skipped, never deleted.
    pub fn list(&self) -> Vec<SessionInfo> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(parsed) = SessionKey::decode(stem) else {
                tracing::debug!(file = %path.display(), "skipping non-decodable session filename");
                continue;
            };

            let turns = std::fs::read_to_string(&path)
                .map(|content| parse_lines(&content))
                .unwrap_or_default();
            if turns.is_empty() {
                continue;
            }
            let last_activity = turns.iter().map(|t| t.timestamp).max().unwrap_or(0);
            sessions.push(SessionInfo {
                key: parsed.to_string(),
                parsed,
                message_count: turns.len(),
                last_activity,
                path,
            });
        }

        sessions.sort_by_key(|info| std::cmp::Reverse(info.last_activity));
        sessions
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn parse_lines(content: &str) -> Vec<Turn> {
    content
        .lines()
        .filter_map(|line| serde_json::from_str::<Turn>(line.trim()).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;

    fn turn(role: Role, content: &str, timestamp: i64, key: &SessionKey) -> Turn {
        Turn {
            role,
            content: content.to_string(),
            timestamp,
            session_key: key.clone(),
        }
    }

    #[test]
    fn append_then_read_round_trips_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let log = SessionLog::new(tmp.path().join("sessions"));
        let key = SessionKey::parse("main:cli:main").unwrap();

        log.append(&key, &turn(Role::User, "hello", 1000, &key)).unwrap();
        log.append(&key, &turn(Role::Assistant, "hi", 1001, &key)).unwrap();

        let turns = log.read(&key).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "hello");
        assert_eq!(turns[1].content, "hi");

        let listing = log.list();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].message_count, 2);
        assert_eq!(listing[0].last_activity, 1001);
        assert_eq!(listing[0].key, "main:cli:main");
    }

    #[test]
    fn partial_last_line_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let log = SessionLog::new(tmp.path().join("sessions"));
        let key = SessionKey::parse("main:cli:main").unwrap();

        log.append(&key, &turn(Role::User, "ok", 1, &key)).unwrap();
        let path = tmp
            .path()
            .join("sessions")
            .join(format!("{}.jsonl", key.encode()));
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"role\":\"assistant\",\"content\":\"trunc");
        std::fs::write(&path, content).unwrap();

        let turns = log.read(&key).unwrap();
        assert_eq!(turns.len(), 1);
    }

    #[test]
    fn list_skips_undecodable_filenames() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("sessions");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("not-hex.jsonl"), "{}\n").unwrap();

        let log = SessionLog::new(&dir);
        assert!(log.list().is_empty());
        // The stray file must still be there.
        assert!(dir.join("not-hex.jsonl").exists());
    }

    #[test]
    fn legacy_sanitized_filename_is_migrated() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("sessions");
        std::fs::create_dir_all(&dir).unwrap();
        let key = SessionKey::parse("main:discord:dm:42").unwrap();

        let record = serde_json::json!({
            "role": "user",
            "content": "old",
            "timestamp": 5,
            "session_key": "main:discord:dm:42",
        });
        std::fs::write(dir.join("main_discord_dm_42.jsonl"), format!("{record}\n")).unwrap();

        let log = SessionLog::new(&dir);
        let turns = log.read(&key).unwrap();
        assert_eq!(turns.len(), 1);
        assert!(dir.join(format!("{}.jsonl", key.encode())).exists());
        assert!(!dir.join("main_discord_dm_42.jsonl").exists());
    }

    #[test]
    fn clear_truncates() {
        let tmp = tempfile::tempdir().unwrap();
        let log = SessionLog::new(tmp.path().join("sessions"));
        let key = SessionKey::parse("main:cli:main").unwrap();
        log.append(&key, &turn(Role::User, "x", 1, &key)).unwrap();
        assert!(log.exists(&key));

        log.clear(&key).unwrap();
        assert!(log.read(&key).unwrap().is_empty());
        // The file remains on disk but holds no valid record, so the
        // session no longer exists anywhere: not listed, not found.
        assert!(log.list().is_empty());
        assert!(!log.exists(&key));
    }

    #[test]
    fn exists_requires_a_parseable_record() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("sessions");
        std::fs::create_dir_all(&dir).unwrap();
        let log = SessionLog::new(&dir);
        let key = SessionKey::parse("main:cli:main").unwrap();

        assert!(!log.exists(&key));

        // A file of only junk lines is not a session.
        let path = dir.join(format!("{}.jsonl", key.encode()));
        std::fs::write(&path, "{not json\n\n").unwrap();
        assert!(!log.exists(&key));

        // One valid record after the junk makes it one.
        log.append(&key, &turn(Role::User, "hi", 1, &key)).unwrap();
        assert!(log.exists(&key));
    }
}
