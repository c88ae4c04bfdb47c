//! Hot-reloadable model configuration: aliases, fallback chain, heartbeat
//! override, and the current model/thinking level.
//!
//! Three JSON files live in the data dir. Every read tolerates a missing or
//! corrupt file by returning the zero value; every write is atomic
//! (tmp + rename). Alias resolution is case-insensitive and deliberately
//! non-recursive: an alias maps to a model ref, never to another alias.

use crate::error::LlmError;
use crate::llm::{ModelRef, ThinkingLevel};

use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

pub struct ConfigStore {
    aliases_path: PathBuf,
    fallbacks_path: PathBuf,
    heartbeat_model_path: PathBuf,
    current_model: ArcSwap<ModelRef>,
    thinking_level: ArcSwap<ThinkingLevel>,
}

#[derive(serde::Serialize, serde::Deserialize, Default)]
struct HeartbeatModelFile {
    #[serde(rename = "ref")]
    model_ref: Option<String>,
}

impl ConfigStore {
    pub fn new(data_dir: &std::path::Path, default_model: ModelRef) -> Self {
        Self {
            aliases_path: data_dir.join("model-aliases.json"),
            fallbacks_path: data_dir.join("model-fallbacks.json"),
            heartbeat_model_path: data_dir.join("heartbeat/model.json"),
            current_model: ArcSwap::from_pointee(default_model),
            thinking_level: ArcSwap::from_pointee(ThinkingLevel::default()),
        }
    }

    // -- current model / thinking level ------------------------------------

    pub fn current_model(&self) -> ModelRef {
        (**self.current_model.load()).clone()
    }

    pub fn set_current_model(&self, model: ModelRef) {
        self.current_model.store(Arc::new(model));
    }

    pub fn thinking_level(&self) -> ThinkingLevel {
        **self.thinking_level.load()
    }

    pub fn set_thinking_level(&self, level: ThinkingLevel) {
        self.thinking_level.store(Arc::new(level));
    }

    // -- aliases -----------------------------------------------------------

    pub fn aliases(&self) -> BTreeMap<String, String> {
        read_json(&self.aliases_path)
    }

    pub fn set_alias(&self, name: &str, model: &ModelRef) -> std::io::Result<()> {
        let mut aliases = self.aliases();
        aliases.insert(name.to_lowercase(), model.to_string());
        write_json(&self.aliases_path, &aliases)
    }

    /// Returns whether the alias existed.
    pub fn remove_alias(&self, name: &str) -> std::io::Result<bool> {
        let mut aliases = self.aliases();
        let existed = aliases.remove(&name.to_lowercase()).is_some();
        if existed {
            write_json(&self.aliases_path, &aliases)?;
        }
        Ok(existed)
    }

    /// Resolve a user-supplied name: an alias (case-insensitive) or a
    /// literal `provider/model` ref. Non-recursive by design.
    pub fn resolve_model(&self, name: &str) -> Result<ModelRef, LlmError> {
        if let Some(target) = self.aliases().get(&name.to_lowercase()) {
            return ModelRef::parse(target);
        }
        ModelRef::parse(name)
    }

    // -- fallback chain ----------------------------------------------------

    pub fn fallback_chain(&self) -> Vec<ModelRef> {
        let raw: Vec<String> = read_json(&self.fallbacks_path);
        raw.iter()
            .filter_map(|entry| match ModelRef::parse(entry) {
                Ok(model) => Some(model),
                Err(_) => {
                    tracing::warn!(%entry, "skipping unparseable fallback ref");
                    None
                }
            })
            .collect()
    }

    pub fn set_fallback_chain(&self, chain: &[ModelRef]) -> std::io::Result<()> {
        let raw: Vec<String> = chain.iter().map(ModelRef::to_string).collect();
        write_json(&self.fallbacks_path, &raw)
    }

    pub fn clear_fallback_chain(&self) -> std::io::Result<()> {
        write_json(&self.fallbacks_path, &Vec::<String>::new())
    }

    // -- heartbeat model override ------------------------------------------

    pub fn heartbeat_model(&self) -> Option<ModelRef> {
        let file: HeartbeatModelFile = read_json(&self.heartbeat_model_path);
        file.model_ref.as_deref().and_then(|r| ModelRef::parse(r).ok())
    }

    pub fn set_heartbeat_model(&self, model: Option<&ModelRef>) -> std::io::Result<()> {
        write_json(
            &self.heartbeat_model_path,
            &HeartbeatModelFile {
                model_ref: model.map(ModelRef::to_string),
            },
        )
    }
}

fn read_json<T: serde::de::DeserializeOwned + Default>(path: &std::path::Path) -> T {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(error) => {
            if error.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(%error, path = %path.display(), "failed to read config file");
            }
            return T::default();
        }
    };
    match serde_json::from_str(&content) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(%error, path = %path.display(), "corrupt config file, using defaults");
            T::default()
        }
    }
}

fn write_json<T: serde::Serialize>(path: &std::path::Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (ConfigStore, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(tmp.path(), ModelRef::new("anthropic", "claude-sonnet-4-5"));
        (store, tmp)
    }

    #[test]
    fn alias_resolution_is_case_insensitive_and_non_recursive() {
        let (store, _tmp) = store();
        store
            .set_alias("Fast", &ModelRef::new("groq", "llama-3.3-70b"))
            .unwrap();
        // An alias whose name shadows another alias's target must not chain.
        store
            .set_alias("groq/llama-3.3-70b", &ModelRef::new("openai", "gpt-4.1"))
            .unwrap();

        let resolved = store.resolve_model("FAST").unwrap();
        assert_eq!(resolved, ModelRef::new("groq", "llama-3.3-70b"));
    }

    #[test]
    fn unknown_name_parses_as_literal_ref() {
        let (store, _tmp) = store();
        let resolved = store.resolve_model("openai/gpt-4.1").unwrap();
        assert_eq!(resolved.provider, "openai");
        // A bare word is a model on the default provider, not an error.
        assert_eq!(store.resolve_model("haiku").unwrap().provider, "anthropic");
    }

    #[test]
    fn corrupt_files_read_as_zero_values() {
        let (store, tmp) = store();
        std::fs::write(tmp.path().join("model-aliases.json"), "{not json").unwrap();
        std::fs::write(tmp.path().join("model-fallbacks.json"), "42").unwrap();
        assert!(store.aliases().is_empty());
        assert!(store.fallback_chain().is_empty());
        assert!(store.heartbeat_model().is_none());
    }

    #[test]
    fn fallback_chain_round_trips_and_skips_junk() {
        let (store, tmp) = store();
        store
            .set_fallback_chain(&[
                ModelRef::new("openai", "gpt-4.1"),
                ModelRef::new("groq", "llama-3.3-70b"),
            ])
            .unwrap();
        assert_eq!(store.fallback_chain().len(), 2);

        std::fs::write(
            tmp.path().join("model-fallbacks.json"),
            r#"["openai/gpt-4.1", "", "groq/llama-3.3-70b"]"#,
        )
        .unwrap();
        assert_eq!(store.fallback_chain().len(), 2);
    }

    #[test]
    fn heartbeat_model_override_round_trips() {
        let (store, _tmp) = store();
        assert!(store.heartbeat_model().is_none());
        store
            .set_heartbeat_model(Some(&ModelRef::new("anthropic", "claude-haiku-4-5")))
            .unwrap();
        assert_eq!(
            store.heartbeat_model().unwrap().model,
            "claude-haiku-4-5"
        );
        store.set_heartbeat_model(None).unwrap();
        assert!(store.heartbeat_model().is_none());
    }

    #[test]
    fn remove_alias_reports_existence() {
        let (store, _tmp) = store();
        store.set_alias("fast", &ModelRef::new("groq", "x")).unwrap();
        assert!(store.remove_alias("FAST").unwrap());
        assert!(!store.remove_alias("fast").unwrap());
    }
}
