//! In-band commands: textual input handled synchronously by the gateway
//! before (and instead of) an LLM call.
//!
//! Matching is keyword-anchored: input counts as a command only when its
//! first word (after an optional `/`) is a recognized keyword, so natural
//! language starting with other words never short-circuits.

use crate::config_store::ConfigStore;
use crate::llm::{AgentRuntime, ThinkingLevel};

use std::sync::Arc;

#[derive(Debug, PartialEq)]
pub enum CommandOutcome {
    /// Not a recognized command; enqueue for the agent.
    NotACommand,
    /// Handled; deliver this text, skip the LLM and the extractor.
    Reply(String),
    /// The restart command. The session router handles it with session
    /// context so the sentinel can carry the originating delivery target.
    Restart,
}

pub struct CommandHandler {
    config_store: Arc<ConfigStore>,
    runtime: Arc<dyn AgentRuntime>,
}

impl CommandHandler {
    pub fn new(config_store: Arc<ConfigStore>, runtime: Arc<dyn AgentRuntime>) -> Self {
        Self {
            config_store,
            runtime,
        }
    }

    pub async fn handle(&self, content: &str) -> CommandOutcome {
        let trimmed = content.trim();
        let stripped = trimmed.strip_prefix('/').unwrap_or(trimmed);
        let mut words = stripped.split_whitespace();
        let Some(keyword) = words.next() else {
            return CommandOutcome::NotACommand;
        };
        let args: Vec<&str> = words.collect();

        match keyword.to_lowercase().as_str() {
            "models" => CommandOutcome::Reply(self.models(args.first().copied())),
            "model" => self.model(&args).await,
            "alias" => CommandOutcome::Reply(self.alias(&args)),
            "fallback" => CommandOutcome::Reply(self.fallback(&args)),
            "think" => self.think(&args).await,
            "status" => CommandOutcome::Reply(self.status()),
            "heartbeat" => CommandOutcome::Reply(self.heartbeat(&args)),
            "restart" => CommandOutcome::Restart,
            _ => CommandOutcome::NotACommand,
        }
    }

    fn models(&self, provider_filter: Option<&str>) -> String {
        let current = self.config_store.current_model();
        let mut lines = vec![format!("Current model: {current}")];

        let aliases = self.config_store.aliases();
        let filtered: Vec<_> = aliases
            .iter()
            .filter(|(_, target)| {
                provider_filter.is_none_or(|p| target.starts_with(&format!("{p}/")))
            })
            .collect();
        if !filtered.is_empty() {
            lines.push("Aliases:".to_string());
            for (name, target) in filtered {
                lines.push(format!("  {name} -> {target}"));
            }
        }

        let chain = self.config_store.fallback_chain();
        if !chain.is_empty() {
            let rendered: Vec<String> = chain.iter().map(ToString::to_string).collect();
            lines.push(format!("Fallbacks: {}", rendered.join(" -> ")));
        }
        lines.join("\n")
    }

    async fn model(&self, args: &[&str]) -> CommandOutcome {
        let Some(name) = args.first() else {
            return CommandOutcome::Reply(format!(
                "Current model: {}\nUsage: model <provider/model|alias>",
                self.config_store.current_model()
            ));
        };
        match self.config_store.resolve_model(name) {
            Ok(model) => {
                self.runtime.set_model(model.clone()).await;
                self.config_store.set_current_model(model.clone());
                CommandOutcome::Reply(format!("Model set to {model}"))
            }
            Err(error) => CommandOutcome::Reply(format!("Cannot switch model: {error}")),
        }
    }

    fn alias(&self, args: &[&str]) -> String {
        match args {
            [] | ["list"] => {
                let aliases = self.config_store.aliases();
                if aliases.is_empty() {
                    "No aliases defined.".to_string()
                } else {
                    aliases
                        .iter()
                        .map(|(name, target)| format!("{name} -> {target}"))
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }
            ["set", name, reference] => match crate::llm::ModelRef::parse(reference) {
                Ok(model) => match self.config_store.set_alias(name, &model) {
                    Ok(()) => format!("Alias {} -> {model}", name.to_lowercase()),
                    Err(error) => format!("Failed to save alias: {error}"),
                },
                Err(error) => format!("Invalid model reference: {error}"),
            },
            ["remove", name] => match self.config_store.remove_alias(name) {
                Ok(true) => format!("Removed alias {}", name.to_lowercase()),
                Ok(false) => format!("No alias named {}", name.to_lowercase()),
                Err(error) => format!("Failed to remove alias: {error}"),
            },
            _ => "Usage: alias [list] | alias set <name> <provider/model> | alias remove <name>"
                .to_string(),
        }
    }

    fn fallback(&self, args: &[&str]) -> String {
        match args {
            [] | ["list"] => {
                let chain = self.config_store.fallback_chain();
                if chain.is_empty() {
                    "No fallback models configured.".to_string()
                } else {
                    let rendered: Vec<String> = chain.iter().map(ToString::to_string).collect();
                    rendered.join(" -> ")
                }
            }
            ["clear"] => match self.config_store.clear_fallback_chain() {
                Ok(()) => "Fallback chain cleared.".to_string(),
                Err(error) => format!("Failed to clear fallbacks: {error}"),
            },
            ["set", references @ ..] if !references.is_empty() => {
                let mut chain = Vec::new();
                for reference in references {
                    match self.config_store.resolve_model(reference) {
                        Ok(model) => chain.push(model),
                        Err(error) => return format!("Invalid fallback {reference:?}: {error}"),
                    }
                }
                match self.config_store.set_fallback_chain(&chain) {
                    Ok(()) => {
                        let rendered: Vec<String> =
                            chain.iter().map(ToString::to_string).collect();
                        format!("Fallback chain: {}", rendered.join(" -> "))
                    }
                    Err(error) => format!("Failed to save fallbacks: {error}"),
                }
            }
            _ => "Usage: fallback [list] | fallback set <ref...> | fallback clear".to_string(),
        }
    }

    async fn think(&self, args: &[&str]) -> CommandOutcome {
        let Some(level) = args.first().copied().and_then(ThinkingLevel::parse) else {
            return CommandOutcome::Reply(
                "Usage: think <off|minimal|low|medium|high|xhigh>".to_string(),
            );
        };
        self.runtime.set_thinking_level(level).await;
        self.config_store.set_thinking_level(level);
        CommandOutcome::Reply(format!("Thinking level set to {}", level.as_str()))
    }

    fn status(&self) -> String {
        let chain = self.config_store.fallback_chain();
        let fallbacks = if chain.is_empty() {
            "none".to_string()
        } else {
            let rendered: Vec<String> = chain.iter().map(ToString::to_string).collect();
            rendered.join(" -> ")
        };
        let heartbeat = self
            .config_store
            .heartbeat_model()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "default".to_string());
        format!(
            "Model: {}\nThinking: {}\nFallbacks: {}\nHeartbeat model: {}",
            self.config_store.current_model(),
            self.config_store.thinking_level().as_str(),
            fallbacks,
            heartbeat,
        )
    }

    fn heartbeat(&self, args: &[&str]) -> String {
        match args {
            [] => match self.config_store.heartbeat_model() {
                Some(model) => format!("Heartbeat model override: {model}"),
                None => "Heartbeat uses the default model.".to_string(),
            },
            ["model", "clear"] => match self.config_store.set_heartbeat_model(None) {
                Ok(()) => "Heartbeat model override cleared.".to_string(),
                Err(error) => format!("Failed to clear heartbeat model: {error}"),
            },
            ["model", reference] => match self.config_store.resolve_model(reference) {
                Ok(model) => match self.config_store.set_heartbeat_model(Some(&model)) {
                    Ok(()) => format!("Heartbeat model set to {model}"),
                    Err(error) => format!("Failed to save heartbeat model: {error}"),
                },
                Err(error) => format!("Invalid model reference: {error}"),
            },
            _ => "Usage: heartbeat [model <provider/model|clear>]".to_string(),
        }
    }
}
