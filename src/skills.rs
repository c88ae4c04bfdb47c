//! Markdown skill files, managed through the management API.
//!
//! A skill is one markdown file under `skills/`. Names are constrained so
//! they can appear in URLs and filenames without escaping.

use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize)]
pub struct SkillInfo {
    pub name: String,
    /// First non-empty line, with any leading `#` markers stripped.
    pub title: String,
    pub size: u64,
}

pub struct SkillStore {
    dir: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum SkillError {
    #[error("invalid skill name {0:?} (expected [a-z0-9][a-z0-9-]*)")]
    InvalidName(String),

    #[error("no skill named {0:?}")]
    NotFound(String),

    #[error("skill {0:?} already exists")]
    AlreadyExists(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

impl SkillStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, SkillError> {
        if !valid_name(name) {
            return Err(SkillError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(format!("{name}.md")))
    }

    pub fn list(&self) -> Vec<SkillInfo> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut skills = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !valid_name(name) {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let title = std::fs::read_to_string(&path)
                .ok()
                .and_then(|content| first_title(&content))
                .unwrap_or_default();
            skills.push(SkillInfo {
                name: name.to_string(),
                title,
                size,
            });
        }
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills
    }

    pub fn get(&self, name: &str) -> Result<String, SkillError> {
        let path = self.path_for(name)?;
        std::fs::read_to_string(&path).map_err(|error| {
            if error.kind() == std::io::ErrorKind::NotFound {
                SkillError::NotFound(name.to_string())
            } else {
                SkillError::Io(error)
            }
        })
    }

    pub fn create(&self, name: &str, content: &str) -> Result<(), SkillError> {
        let path = self.path_for(name)?;
        if path.exists() {
            return Err(SkillError::AlreadyExists(name.to_string()));
        }
        self.write(&path, content)
    }

    pub fn update(&self, name: &str, content: &str) -> Result<(), SkillError> {
        let path = self.path_for(name)?;
        if !path.exists() {
            return Err(SkillError::NotFound(name.to_string()));
        }
        self.write(&path, content)
    }

    pub fn delete(&self, name: &str) -> Result<(), SkillError> {
        let path = self.path_for(name)?;
        std::fs::remove_file(&path).map_err(|error| {
            if error.kind() == std::io::ErrorKind::NotFound {
                SkillError::NotFound(name.to_string())
            } else {
                SkillError::Io(error)
            }
        })
    }

    fn write(&self, path: &Path, content: &str) -> Result<(), SkillError> {
        std::fs::create_dir_all(&self.dir)?;
        let tmp = path.with_extension("md.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn first_title(content: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.trim_start_matches('#').trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (SkillStore, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        (SkillStore::new(tmp.path().join("skills")), tmp)
    }

    #[test]
    fn create_get_update_delete_cycle() {
        let (store, _tmp) = store();
        store.create("daily-brief", "# Daily Brief\n\nSteps...").unwrap();
        assert!(matches!(
            store.create("daily-brief", "x"),
            Err(SkillError::AlreadyExists(_))
        ));

        assert!(store.get("daily-brief").unwrap().contains("Steps"));
        store.update("daily-brief", "# Daily Brief v2").unwrap();
        assert!(store.get("daily-brief").unwrap().contains("v2"));

        let listing = store.list();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].title, "Daily Brief v2");

        store.delete("daily-brief").unwrap();
        assert!(matches!(store.get("daily-brief"), Err(SkillError::NotFound(_))));
    }

    #[test]
    fn names_are_validated() {
        let (store, _tmp) = store();
        for bad in ["", "Has-Caps", "../escape", "dot.dot", "-leading"] {
            assert!(
                matches!(store.create(bad, "x"), Err(SkillError::InvalidName(_))),
                "accepted {bad:?}"
            );
        }
        store.create("ok-name-2", "x").unwrap();
    }

    #[test]
    fn update_requires_existing_skill() {
        let (store, _tmp) = store();
        assert!(matches!(
            store.update("ghost", "x"),
            Err(SkillError::NotFound(_))
        ));
    }
}
