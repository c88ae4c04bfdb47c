//! The heartbeat: a timer-driven self-trigger that runs a user-authored
//! instruction file inside the last-known DM session.
//!
//! Ticks fire on a fixed interval, plus one delayed first tick shortly after
//! startup so channels have time to connect. A tick that falls outside the
//! active-hours window, or finds no instructions, is skipped silently. A
//! tick never retries; failures are recorded and the next tick proceeds.

use crate::channel::{ChannelHub, OutboundMessage};
use crate::config_store::ConfigStore;
use crate::extractor::Extractor;
use crate::llm::AgentRuntime;
use crate::queue;
use crate::session::SessionRouter;

use chrono::Timelike as _;
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Grace before the extra first tick, so adapters can connect.
const FIRST_TICK_DELAY: Duration = Duration::from_secs(30);

const INSTRUCTION_FILE: &str = "HEARTBEAT.md";
const RUNS_FILE: &str = "runs.jsonl";

#[derive(Debug, Clone)]
pub struct HeartbeatOptions {
    pub enabled: bool,
    pub interval: Duration,
    /// Active window in minutes of day. `start == end` means always active;
    /// `start > end` spans midnight (e.g. 22:00–06:00).
    pub active_start: u16,
    pub active_end: u16,
    /// Delivery channel string (`discord:dm:42`). None runs without
    /// delivery, useful when the response only matters for its side effects.
    pub delivery: Option<String>,
    pub dir: PathBuf,
    pub timezone: Option<chrono_tz::Tz>,
}

/// One run record, appended to `runs.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRun {
    pub started_at: i64,
    pub completed_at: i64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

pub struct HeartbeatRunner {
    options: HeartbeatOptions,
    router: Arc<SessionRouter>,
    extractor: Arc<Extractor>,
    config_store: Arc<ConfigStore>,
    runtime: Arc<dyn AgentRuntime>,
    hub: Arc<ChannelHub>,
}

/// Active-hours predicate over minutes of day.
pub fn is_active(now: u16, start: u16, end: u16) -> bool {
    use std::cmp::Ordering;
    match start.cmp(&end) {
        Ordering::Equal => true,
        Ordering::Less => now >= start && now < end,
        Ordering::Greater => now >= start || now < end,
    }
}

impl HeartbeatRunner {
    pub fn new(
        options: HeartbeatOptions,
        router: Arc<SessionRouter>,
        extractor: Arc<Extractor>,
        config_store: Arc<ConfigStore>,
        runtime: Arc<dyn AgentRuntime>,
        hub: Arc<ChannelHub>,
    ) -> Self {
        Self {
            options,
            router,
            extractor,
            config_store,
            runtime,
            hub,
        }
    }

    pub fn instruction_path(&self) -> PathBuf {
        self.options.dir.join(INSTRUCTION_FILE)
    }

    pub fn runs_path(&self) -> PathBuf {
        self.options.dir.join(RUNS_FILE)
    }

    /// Run until shutdown. Does nothing when disabled.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.options.enabled {
            tracing::info!("heartbeat disabled");
            return;
        }
        tracing::info!(
            interval_secs = self.options.interval.as_secs(),
            "heartbeat runner started"
        );

        tokio::select! {
            _ = tokio::time::sleep(FIRST_TICK_DELAY) => self.tick().await,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }

        let mut interval = tokio::time::interval_at(
            tokio::time::Instant::now() + self.options.interval,
            self.options.interval,
        );
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// One heartbeat tick. Public so the management API can force a run.
    pub async fn tick(&self) {
        let now = self.minutes_of_day();
        if !is_active(now, self.options.active_start, self.options.active_end) {
            tracing::debug!(minutes = now, "heartbeat outside active hours, skipping");
            return;
        }

        let instructions = match std::fs::read_to_string(self.instruction_path()) {
            Ok(text) if !text.trim().is_empty() => text,
            _ => {
                tracing::debug!("heartbeat instruction file empty or missing, skipping");
                return;
            }
        };

        let started_at = chrono::Utc::now().timestamp_millis();
        let session = self.router.last_dm_session();

        // Optional model override, swapped around the call and restored
        // whatever happens.
        let restore = self.config_store.heartbeat_model().map(|override_model| {
            let primary = self.config_store.current_model();
            (override_model, primary)
        });
        if let Some((override_model, _)) = &restore {
            self.runtime.set_model(override_model.clone()).await;
            self.config_store.set_current_model(override_model.clone());
        }

        let response = match &session {
            Some(key) => {
                let response = self.router.run_session_exchange(key, &instructions).await;
                self.extractor
                    .spawn(instructions.clone(), response.clone(), key.clone());
                response
            }
            // No DM seen yet: run the prompt with no context injection.
            None => self.router.run_detached(&instructions).await,
        };

        if let Some((_, primary)) = restore {
            self.runtime.set_model(primary.clone()).await;
            self.config_store.set_current_model(primary);
        }

        let session_key = session.as_ref().map(|key| key.to_string());
        if response.trim().is_empty() || response == queue::EMPTY_RESPONSE {
            tracing::warn!("heartbeat produced an empty response");
            self.record(HeartbeatRun {
                started_at,
                completed_at: chrono::Utc::now().timestamp_millis(),
                success: false,
                response: None,
                error: Some("empty response".to_string()),
                session_key,
            });
            return;
        }

        let mut success = true;
        let mut error = None;
        if let Some(delivery) = &self.options.delivery {
            if let Err(delivery_error) = self
                .hub
                .deliver(delivery, OutboundMessage::text(&response))
                .await
            {
                tracing::warn!(error = %delivery_error, %delivery, "heartbeat delivery failed");
                success = false;
                error = Some(delivery_error.to_string());
            }
        }

        self.record(HeartbeatRun {
            started_at,
            completed_at: chrono::Utc::now().timestamp_millis(),
            success,
            response: Some(response),
            error,
            session_key,
        });
    }

    fn minutes_of_day(&self) -> u16 {
        match self.options.timezone {
            Some(tz) => {
                let now = chrono::Utc::now().with_timezone(&tz);
                (now.hour() * 60 + now.minute()) as u16
            }
            None => {
                let now = chrono::Local::now();
                (now.hour() * 60 + now.minute()) as u16
            }
        }
    }

    fn record(&self, run: HeartbeatRun) {
        if let Err(error) = append_run(&self.runs_path(), &run) {
            tracing::warn!(%error, "failed to append heartbeat run record");
        }
    }

    /// Newest-first page of run records for the management API.
    pub fn read_runs(&self, offset: usize, limit: usize) -> Vec<HeartbeatRun> {
        read_runs(&self.runs_path(), offset, limit)
    }
}

fn append_run(path: &std::path::Path, run: &HeartbeatRun) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_vec(run)?;
    line.push(b'\n');
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(&line)
}

pub(crate) fn read_runs(path: &std::path::Path, offset: usize, limit: usize) -> Vec<HeartbeatRun> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let mut runs: Vec<HeartbeatRun> = content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();
    runs.reverse();
    runs.into_iter().skip(offset).take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelRef;
    use crate::testing::Harness;

    fn runner_for(harness: &Harness, options: HeartbeatOptions) -> Arc<HeartbeatRunner> {
        Arc::new(HeartbeatRunner::new(
            options,
            harness.router.clone(),
            harness.extractor.clone(),
            harness.store.clone(),
            harness.runtime.clone(),
            Arc::new(ChannelHub::new()),
        ))
    }

    fn options(dir: PathBuf) -> HeartbeatOptions {
        HeartbeatOptions {
            enabled: true,
            interval: Duration::from_secs(1800),
            active_start: 0,
            active_end: 0,
            delivery: None,
            dir,
            timezone: None,
        }
    }

    #[test]
    fn active_hours_normal_window() {
        // 09:00–17:00
        assert!(!is_active(8 * 60 + 59, 540, 1020));
        assert!(is_active(540, 540, 1020));
        assert!(is_active(720, 540, 1020));
        assert!(!is_active(1020, 540, 1020));
    }

    #[test]
    fn active_hours_overnight_window() {
        // 22:00–06:00
        assert!(is_active(1320, 1320, 360));
        assert!(is_active(0, 1320, 360));
        assert!(is_active(359, 1320, 360));
        assert!(!is_active(360, 1320, 360));
        assert!(!is_active(720, 1320, 360));
    }

    #[test]
    fn equal_endpoints_mean_always_active() {
        for minute in [0, 360, 720, 1439] {
            assert!(is_active(minute, 600, 600));
        }
    }

    #[tokio::test]
    async fn tick_without_instructions_is_a_silent_skip() {
        let harness = Harness::new("should not run").await;
        let runner = runner_for(&harness, options(harness.tmp.path().join("heartbeat")));

        runner.tick().await;
        assert!(harness.runtime.prompt_log().is_empty());
        assert!(runner.read_runs(0, 10).is_empty());
    }

    #[tokio::test]
    async fn tick_runs_in_last_dm_session_and_records() {
        let harness = Harness::new("heartbeat says hi").await;
        harness
            .router
            .handle_inbound("main:discord:dm:42", "hello", None)
            .await
            .unwrap();

        let dir = harness.tmp.path().join("heartbeat");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(INSTRUCTION_FILE), "check on the user").unwrap();

        let runner = runner_for(&harness, options(dir));
        runner.tick().await;

        let runs = runner.read_runs(0, 10);
        assert_eq!(runs.len(), 1);
        assert!(runs[0].success);
        assert_eq!(runs[0].session_key.as_deref(), Some("main:discord:dm:42"));
        assert_eq!(runs[0].response.as_deref(), Some("heartbeat says hi"));

        // The exchange landed in the DM session's log.
        let key = crate::session::SessionKey::parse("main:discord:dm:42").unwrap();
        let turns = harness.log.read(&key).unwrap();
        assert!(turns.iter().any(|t| t.content == "check on the user"));
    }

    #[tokio::test]
    async fn tick_outside_window_skips() {
        let harness = Harness::new("nope").await;
        let dir = harness.tmp.path().join("heartbeat");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(INSTRUCTION_FILE), "instructions").unwrap();

        // A one-minute window that cannot contain "now" twice: pick the
        // minute after the current one, zero-length coverage via start+1.
        let mut opts = options(dir);
        let runner_probe = runner_for(&harness, opts.clone());
        let now = runner_probe.minutes_of_day();
        opts.active_start = (now + 2) % 1440;
        opts.active_end = (now + 3) % 1440;

        let runner = runner_for(&harness, opts);
        runner.tick().await;
        assert!(harness.runtime.prompt_log().is_empty());
    }

    #[tokio::test]
    async fn model_override_is_swapped_and_restored() {
        let harness = Harness::new("ok").await;
        harness
            .store
            .set_heartbeat_model(Some(&ModelRef::new("anthropic", "claude-haiku-4-5")))
            .unwrap();

        let dir = harness.tmp.path().join("heartbeat");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(INSTRUCTION_FILE), "quick check").unwrap();

        let runner = runner_for(&harness, options(dir));
        runner.tick().await;

        // Restored after the tick.
        assert_eq!(harness.store.current_model().model, "claude-sonnet-4-5");
        assert_eq!(
            harness.runtime.state().await.model.model,
            "claude-sonnet-4-5"
        );
    }

    #[tokio::test]
    async fn empty_response_is_recorded_as_failure() {
        let harness = Harness::new("   ").await;
        let dir = harness.tmp.path().join("heartbeat");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(INSTRUCTION_FILE), "say nothing").unwrap();

        let runner = runner_for(&harness, options(dir));
        runner.tick().await;

        let runs = runner.read_runs(0, 10);
        assert_eq!(runs.len(), 1);
        assert!(!runs[0].success);
        assert_eq!(runs[0].error.as_deref(), Some("empty response"));
    }

    #[tokio::test]
    async fn runs_page_newest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("runs.jsonl");
        for i in 0..5 {
            append_run(
                &path,
                &HeartbeatRun {
                    started_at: i,
                    completed_at: i,
                    success: true,
                    response: Some(format!("run {i}")),
                    error: None,
                    session_key: None,
                },
            )
            .unwrap();
        }

        let page = read_runs(&path, 1, 2);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].started_at, 3);
        assert_eq!(page[1].started_at, 2);
    }
}
