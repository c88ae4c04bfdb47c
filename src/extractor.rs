//! Post-exchange world-model extraction.
//!
//! After every completed exchange, a secondary LLM call proposes world-model
//! deltas and tags for the archived turns. The whole path is fire-and-forget:
//! bounded by a per-call timeout, walked down the fallback chain, and every
//! failure is swallowed. Extraction may never add user-visible latency.

use crate::archive::Archive;
use crate::config_store::ConfigStore;
use crate::error::LlmError;
use crate::llm::{CompletionClient, ModelRef};
use crate::session::SessionKey;
use crate::world_model::{WorldModel, WorldModelUpdate};

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

pub struct Extractor {
    enabled: bool,
    timeout: Duration,
    world_model: Arc<WorldModel>,
    archive: Arc<Archive>,
    config_store: Arc<ConfigStore>,
    completions: Arc<dyn CompletionClient>,
}

#[derive(Debug, serde::Deserialize)]
struct ExtractionResponse {
    world_model_updates: serde_json::Value,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    archive_note: Option<String>,
}

impl Extractor {
    pub fn new(
        enabled: bool,
        timeout: Duration,
        world_model: Arc<WorldModel>,
        archive: Arc<Archive>,
        config_store: Arc<ConfigStore>,
        completions: Arc<dyn CompletionClient>,
    ) -> Self {
        Self {
            enabled,
            timeout,
            world_model,
            archive,
            config_store,
            completions,
        }
    }

    /// Kick off extraction for one completed exchange and return
    /// immediately.
    pub fn spawn(self: &Arc<Self>, user: String, assistant: String, key: SessionKey) {
        if !self.enabled {
            return;
        }
        let extractor = self.clone();
        tokio::spawn(async move {
            if let Err(error) = extractor.run(&user, &assistant, &key).await {
                tracing::debug!(%error, session_key = %key, "extraction pass failed");
            }
        });
    }

    async fn run(&self, user: &str, assistant: &str, key: &SessionKey) -> anyhow::Result<()> {
        let prompt = self.build_prompt(user, assistant)?;
        let raw = self.complete_with_fallbacks(&prompt).await?;
        let parsed = parse_extraction(&raw)?;

        let updates = validate_updates(&parsed.world_model_updates)?;
        if !updates.is_empty() {
            let removed = self.world_model.apply_updates(&updates)?;
            for line in removed {
                self.archive
                    .archive_world_model_item(
                        &line.section,
                        &line.field,
                        line.value.as_deref(),
                        &line.reason,
                    )
                    .await?;
            }
            tracing::debug!(count = updates.len(), "applied world model updates");
        }

        if !parsed.tags.is_empty() {
            let recent = self.archive.get_recent_turns(key, 2).await?;
            let ids: Vec<i64> = recent.iter().map(|r| r.id).collect();
            self.archive.update_tags(&ids, &parsed.tags).await?;
        }

        if let Some(note) = parsed.archive_note.filter(|n| !n.is_empty()) {
            tracing::debug!(session_key = %key, %note, "archive note");
        }
        Ok(())
    }

    fn build_prompt(&self, user: &str, assistant: &str) -> anyhow::Result<String> {
        let world_model = self.world_model.load()?;
        Ok(format!(
            "You maintain a compact world model about the user. Here is the current document:\n\n\
             {world_model}\n\n\
             The latest exchange:\n\n\
             User: {user}\n\nAssistant: {assistant}\n\n\
             Respond with strict JSON only, no prose and no code fences, of the shape:\n\
             {{\"world_model_updates\": [{{\"action\": \"replace|add|remove\", \"section\": \"...\", \
             \"field\": \"...\", \"value\": \"...\"}}], \"tags\": [\"...\"], \"archive_note\": \"...\"}}\n\
             Only use the section headings that already exist. Keep the document under 800 tokens; \
             prefer replace and remove over add when it grows."
        ))
    }

    async fn complete_with_fallbacks(&self, prompt: &str) -> Result<String, LlmError> {
        let mut models: Vec<ModelRef> = vec![self.config_store.current_model()];
        models.extend(self.config_store.fallback_chain());

        let mut last_error = LlmError::Call("no models to try".to_string());
        for model in models {
            match tokio::time::timeout(self.timeout, self.completions.complete(&model, prompt))
                .await
            {
                Ok(Ok(text)) => return Ok(text),
                Ok(Err(error)) => {
                    tracing::debug!(model = %model, %error, "extraction model failed");
                    last_error = error;
                }
                Err(_) => {
                    tracing::debug!(model = %model, "extraction model timed out");
                    last_error = LlmError::Timeout(self.timeout.as_millis() as u64);
                }
            }
        }
        Err(last_error)
    }
}

/// Strip surrounding code fences, then parse the strict-JSON response.
fn parse_extraction(raw: &str) -> anyhow::Result<ExtractionResponse> {
    static FENCE: OnceLock<regex::Regex> = OnceLock::new();
    let fence = FENCE.get_or_init(|| {
        regex::Regex::new(r"(?s)^\s*```(?:json)?\s*\n?(.*?)\n?\s*```\s*$").expect("static regex")
    });

    let body = match fence.captures(raw) {
        Some(captures) => captures.get(1).map(|m| m.as_str()).unwrap_or(raw),
        None => raw.trim(),
    };
    Ok(serde_json::from_str(body)?)
}

/// `world_model_updates` must be an array; each element must carry `action`,
/// `section`, and `field`. Anything else rejects the whole response.
fn validate_updates(value: &serde_json::Value) -> anyhow::Result<Vec<WorldModelUpdate>> {
    let items = value
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("world_model_updates is not an array"))?;

    let mut updates = Vec::with_capacity(items.len());
    for item in items {
        for required in ["action", "section", "field"] {
            if item.get(required).and_then(|v| v.as_str()).is_none() {
                anyhow::bail!("update missing required field {required:?}");
            }
        }
        updates.push(serde_json::from_value(item.clone())?);
    }
    Ok(updates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedCompletions {
        responses: Mutex<Vec<Result<String, LlmError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedCompletions {
        fn new(responses: Vec<Result<String, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedCompletions {
        async fn complete(&self, model: &ModelRef, _prompt: &str) -> Result<String, LlmError> {
            self.calls.lock().unwrap().push(model.to_string());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Err(LlmError::Call("script exhausted".to_string()))
            } else {
                responses.remove(0)
            }
        }
    }

    async fn extractor_with(
        completions: Arc<ScriptedCompletions>,
        enabled: bool,
    ) -> (Arc<Extractor>, Arc<WorldModel>, Arc<Archive>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let world_model = Arc::new(WorldModel::new(tmp.path().join("world-model.md")));
        world_model
            .save("Last updated: x\n\n## Current Task\n- Working on: X\n\n## Identity\n")
            .unwrap();
        let archive = Arc::new(Archive::open_in_memory().await.unwrap());
        let store = Arc::new(ConfigStore::new(
            tmp.path(),
            ModelRef::new("anthropic", "claude-sonnet-4-5"),
        ));
        let extractor = Arc::new(Extractor::new(
            enabled,
            Duration::from_secs(5),
            world_model.clone(),
            archive.clone(),
            store,
            completions,
        ));
        (extractor, world_model, archive, tmp)
    }

    fn exchange_key() -> SessionKey {
        SessionKey::parse("main:cli:main").unwrap()
    }

    #[tokio::test]
    async fn applies_updates_and_tags() {
        let completions = ScriptedCompletions::new(vec![Ok(r#"
            {"world_model_updates":
              [{"action": "replace", "section": "Current Task", "field": "Working on", "value": "Y"}],
             "tags": ["rust", "gateway"],
             "archive_note": "model switch discussion"}
        "#
        .to_string())]);
        let (extractor, world_model, archive, _tmp) =
            extractor_with(completions, true).await;

        let key = exchange_key();
        archive
            .archive(&[crate::session::Turn::now(
                crate::session::Role::User,
                "evicted turn",
                key.clone(),
            )])
            .await
            .unwrap();

        extractor.run("user msg", "assistant msg", &key).await.unwrap();

        assert!(world_model.load().unwrap().contains("- Working on: Y"));
        let record = archive.read(1).await.unwrap().unwrap();
        assert_eq!(record.tags.as_deref(), Some("rust,gateway"));
    }

    #[tokio::test]
    async fn code_fences_are_stripped() {
        let fenced = "```json\n{\"world_model_updates\": [], \"tags\": []}\n```";
        let parsed = parse_extraction(fenced).unwrap();
        assert!(parsed.tags.is_empty());

        let bare = "{\"world_model_updates\": [], \"tags\": [\"a\"]}";
        assert_eq!(parse_extraction(bare).unwrap().tags, ["a"]);
    }

    #[tokio::test]
    async fn malformed_updates_are_rejected() {
        assert!(validate_updates(&serde_json::json!({"not": "an array"})).is_err());
        assert!(
            validate_updates(&serde_json::json!([{"action": "add", "section": "Identity"}]))
                .is_err()
        );
        let ok = validate_updates(&serde_json::json!([
            {"action": "remove", "section": "Identity", "field": "name"}
        ]))
        .unwrap();
        assert_eq!(ok.len(), 1);
    }

    #[tokio::test]
    async fn first_working_model_wins() {
        let completions = ScriptedCompletions::new(vec![
            Err(LlmError::Call("primary down".to_string())),
            Ok(r#"{"world_model_updates": [], "tags": []}"#.to_string()),
        ]);
        let (extractor, _world_model, _archive, _tmp) =
            extractor_with(completions.clone(), true).await;
        extractor
            .config_store
            .set_fallback_chain(&[ModelRef::new("openai", "gpt-4.1")])
            .unwrap();

        extractor.run("u", "a", &exchange_key()).await.unwrap();
        let calls = completions.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1], "openai/gpt-4.1");
    }

    #[tokio::test]
    async fn disabled_extractor_spawns_nothing() {
        let completions = ScriptedCompletions::new(vec![]);
        let (extractor, _world_model, _archive, _tmp) =
            extractor_with(completions.clone(), false).await;

        extractor.spawn("u".into(), "a".into(), exchange_key());
        tokio::task::yield_now().await;
        assert!(completions.calls.lock().unwrap().is_empty());
    }
}
