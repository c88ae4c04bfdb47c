//! The persistent world model: one markdown document under a fixed section
//! schema, injected at the head of every agent invocation.
//!
//! Writes are atomic (tmp + rename) and rewrite the `Last updated:` header.
//! Structured updates come from the extractor; unknown sections are skipped
//! with a warning rather than auto-created, keeping the schema closed.

use crate::error::WorldModelError;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;

const TEMPLATE: &str = "\
# World Model

Last updated: (never)

## Identity

## Current Task

## Active Projects

## Key Technical Decisions

## Preferences & Patterns
";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateAction {
    /// Overwrite the value for an existing field, or add it if absent.
    Replace,
    /// Append a new field line to the section.
    Add,
    /// Delete the first matching `(section, field)` line.
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldModelUpdate {
    pub action: UpdateAction,
    pub section: String,
    pub field: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// A `(section, field, value)` line removed by an update, reported to the
/// caller so it can be archived with a reason.
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedLine {
    pub section: String,
    pub field: String,
    pub value: Option<String>,
    pub reason: String,
}

pub struct WorldModel {
    path: PathBuf,
    cache: Mutex<Option<String>>,
}

struct ParsedDocument {
    header: Vec<String>,
    /// Section name → lines (excluding the `## ` heading itself).
    sections: Vec<(String, Vec<String>)>,
}

impl WorldModel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    /// Current document text. Cached after the first read; a missing file is
    /// instantiated from the built-in template and persisted.
    pub fn load(&self) -> Result<String, WorldModelError> {
        if let Some(cached) = self.cache.lock().unwrap().clone() {
            return Ok(cached);
        }
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                self.save(TEMPLATE)?;
                return self.load();
            }
            Err(source) => {
                return Err(WorldModelError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        *self.cache.lock().unwrap() = Some(text.clone());
        Ok(text)
    }

    /// Atomic write: tmp + rename, with the `Last updated:` header rewritten
    /// to the current instant. Updates the cache.
    pub fn save(&self, text: &str) -> Result<(), WorldModelError> {
        let stamped = rewrite_timestamp(text);
        let io_err = |source| WorldModelError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = self.path.with_extension("md.tmp");
        std::fs::write(&tmp, &stamped).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;

        *self.cache.lock().unwrap() = Some(stamped);
        Ok(())
    }

    /// Wholesale replacement, e.g. from the management API.
    pub fn replace_content(&self, text: &str) -> Result<(), WorldModelError> {
        self.save(text)
    }

    /// Apply structured updates and persist. Returns the removed lines so
    /// the caller can archive them.
    pub fn apply_updates(
        &self,
        updates: &[WorldModelUpdate],
    ) -> Result<Vec<RemovedLine>, WorldModelError> {
        let text = self.load()?;
        let mut document = parse(&text);
        let mut removed = Vec::new();

        for update in updates {
            let Some(section) = document
                .sections
                .iter_mut()
                .find(|(name, _)| name == &update.section)
            else {
                tracing::warn!(
                    section = %update.section,
                    field = %update.field,
                    "world model update targets unknown section, skipping"
                );
                continue;
            };
            let lines = &mut section.1;
            let existing = lines
                .iter()
                .position(|line| field_of(line).is_some_and(|f| f == update.field));

            match update.action {
                UpdateAction::Replace => {
                    let value = update.value.as_deref().unwrap_or_default();
                    let new_line = format!("- {}: {}", update.field, value);
                    match existing {
                        Some(index) => {
                            if lines[index] != new_line {
                                removed.push(RemovedLine {
                                    section: update.section.clone(),
                                    field: update.field.clone(),
                                    value: value_of(&lines[index]),
                                    reason: "replaced".to_string(),
                                });
                                lines[index] = new_line;
                            }
                        }
                        None => lines.push(new_line),
                    }
                }
                UpdateAction::Add => {
                    let value = update.value.as_deref().unwrap_or_default();
                    lines.push(format!("- {}: {}", update.field, value));
                }
                UpdateAction::Remove => {
                    if let Some(index) = existing {
                        let line = lines.remove(index);
                        removed.push(RemovedLine {
                            section: update.section.clone(),
                            field: update.field.clone(),
                            value: value_of(&line),
                            reason: "removed".to_string(),
                        });
                    }
                }
            }
        }

        self.save(&render(&document))?;
        Ok(removed)
    }
}

/// Section boundary: a line matching `^## (.+)$`. Everything before the
/// first section is the header.
fn parse(text: &str) -> ParsedDocument {
    let mut header = Vec::new();
    let mut sections: Vec<(String, Vec<String>)> = Vec::new();

    for line in text.lines() {
        if let Some(name) = line.strip_prefix("## ") {
            sections.push((name.trim().to_string(), Vec::new()));
        } else if let Some((_, lines)) = sections.last_mut() {
            lines.push(line.to_string());
        } else {
            header.push(line.to_string());
        }
    }

    ParsedDocument { header, sections }
}

fn render(document: &ParsedDocument) -> String {
    let mut out = document.header.join("\n");
    for (name, lines) in &document.sections {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str("## ");
        out.push_str(name);
        if !lines.is_empty() {
            out.push('\n');
            out.push_str(&lines.join("\n"));
        }
    }
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Field name of a `- <field>: <value>` line, if it is one.
fn field_of(line: &str) -> Option<&str> {
    let rest = line.trim_start().strip_prefix("- ")?;
    let colon = rest.find(':')?;
    // A field line needs whitespace (or end of line) after the colon.
    let after = &rest[colon + 1..];
    if !after.is_empty() && !after.starts_with(char::is_whitespace) {
        return None;
    }
    Some(rest[..colon].trim_end())
}

fn value_of(line: &str) -> Option<String> {
    let rest = line.trim_start().strip_prefix("- ")?;
    let colon = rest.find(':')?;
    Some(rest[colon + 1..].trim().to_string())
}

fn rewrite_timestamp(text: &str) -> String {
    let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let stamp = format!("Last updated: {now}");
    let mut replaced = false;
    let mut out: Vec<String> = text
        .lines()
        .map(|line| {
            if !replaced && line.starts_with("Last updated:") {
                replaced = true;
                stamp.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        out.insert(0, stamp);
    }
    let mut joined = out.join("\n");
    joined.push('\n');
    joined
}
