//! Persistent scheduled jobs: one-shot instants, fixed intervals, and cron
//! expressions.
//!
//! Jobs live in `cron/jobs.json` (atomic writes) and survive restarts; every
//! enabled job is scheduled again on `start()`. Execution calls back into
//! the host, which puts the job's prompt through the request queue, and
//! the response is delivered to the job's target. Every execution appends a
//! record to `cron/runs/<jobId>.jsonl`.

use crate::channel::{ChannelHub, OutboundMessage};
use crate::error::CronError;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

const POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    /// One-shot at an ISO instant; deactivates after firing.
    At,
    /// Fixed interval, `<n><s|m|h|d>`.
    Every,
    /// Standard 5-field cron expression.
    Cron,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub schedule_type: ScheduleType,
    pub schedule: String,
    pub prompt: String,
    /// Delivery channel string; None keeps the response out of any channel.
    #[serde(default)]
    pub delivery: Option<String>,
    pub enabled: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronRun {
    pub started_at: i64,
    pub completed_at: i64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Host callback: run the job's prompt (through the request queue) and
/// return the response text.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &CronJob) -> Result<String, String>;
}

struct JobState {
    job: CronJob,
    next_run: Option<DateTime<Utc>>,
}

pub struct CronService {
    jobs: Mutex<HashMap<String, JobState>>,
    jobs_path: PathBuf,
    runs_dir: PathBuf,
    timezone: Option<chrono_tz::Tz>,
    executor: Arc<dyn JobExecutor>,
    hub: Arc<ChannelHub>,
}

impl CronService {
    pub fn new(
        dir: &Path,
        timezone: Option<chrono_tz::Tz>,
        executor: Arc<dyn JobExecutor>,
        hub: Arc<ChannelHub>,
    ) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            jobs_path: dir.join("jobs.json"),
            runs_dir: dir.join("runs"),
            timezone,
            executor,
            hub,
        }
    }

    // -- persistence --------------------------------------------------------

    /// Load persisted jobs. Corrupt files are logged and discarded.
    pub fn load(&self) -> usize {
        let content = match std::fs::read_to_string(&self.jobs_path) {
            Ok(content) => content,
            Err(_) => return 0,
        };
        let jobs: Vec<CronJob> = match serde_json::from_str(&content) {
            Ok(jobs) => jobs,
            Err(error) => {
                tracing::warn!(%error, "corrupt cron jobs file, starting empty");
                return 0;
            }
        };

        let mut map = self.jobs.lock().unwrap();
        let count = jobs.len();
        for job in jobs {
            let next_run = if job.enabled {
                self.compute_next_run(&job).ok().flatten()
            } else {
                None
            };
            map.insert(job.id.clone(), JobState { job, next_run });
        }
        tracing::info!(count, "loaded cron jobs");
        count
    }

    fn persist(&self) -> Result<(), CronError> {
        let jobs: Vec<CronJob> = {
            let map = self.jobs.lock().unwrap();
            let mut jobs: Vec<CronJob> = map.values().map(|state| state.job.clone()).collect();
            jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            jobs
        };
        let data = serde_json::to_vec_pretty(&jobs)
            .map_err(|error| CronError::Persist(error.to_string()))?;

        if let Some(parent) = self.jobs_path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| CronError::Persist(error.to_string()))?;
        }
        let tmp = self.jobs_path.with_extension("json.tmp");
        std::fs::write(&tmp, data).map_err(|error| CronError::Persist(error.to_string()))?;
        std::fs::rename(&tmp, &self.jobs_path)
            .map_err(|error| CronError::Persist(error.to_string()))
    }

    // -- CRUD ---------------------------------------------------------------

    pub fn add_job(
        &self,
        name: &str,
        schedule_type: ScheduleType,
        schedule: &str,
        prompt: &str,
        delivery: Option<String>,
    ) -> Result<CronJob, CronError> {
        let job = CronJob {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            schedule_type,
            schedule: schedule.to_string(),
            prompt: prompt.to_string(),
            delivery,
            enabled: true,
            created_at: Utc::now().timestamp_millis(),
        };
        // Validates the schedule as a side effect.
        let next_run = self.compute_next_run(&job)?;

        self.jobs.lock().unwrap().insert(
            job.id.clone(),
            JobState {
                job: job.clone(),
                next_run,
            },
        );
        self.persist()?;
        Ok(job)
    }

    pub fn remove_job(&self, id: &str) -> Result<CronJob, CronError> {
        let removed = self
            .jobs
            .lock()
            .unwrap()
            .remove(id)
            .map(|state| state.job)
            .ok_or_else(|| CronError::JobNotFound(id.to_string()))?;
        self.persist()?;
        Ok(removed)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), CronError> {
        {
            let mut map = self.jobs.lock().unwrap();
            let state = map
                .get_mut(id)
                .ok_or_else(|| CronError::JobNotFound(id.to_string()))?;
            state.job.enabled = enabled;
            state.next_run = if enabled {
                self.compute_next_run(&state.job)?
            } else {
                None
            };
        }
        self.persist()
    }

    pub fn list_jobs(&self) -> Vec<CronJob> {
        let map = self.jobs.lock().unwrap();
        let mut jobs: Vec<CronJob> = map.values().map(|state| state.job.clone()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    pub fn get_job(&self, id: &str) -> Option<CronJob> {
        self.jobs.lock().unwrap().get(id).map(|s| s.job.clone())
    }

    /// Force a run now, outside the schedule. Does not touch `next_run`.
    pub async fn trigger_job(&self, id: &str) -> Result<CronRun, CronError> {
        let job = self
            .get_job(id)
            .ok_or_else(|| CronError::JobNotFound(id.to_string()))?;
        Ok(self.execute(&job).await)
    }

    pub fn read_runs(&self, id: &str, offset: usize, limit: usize) -> Vec<CronRun> {
        let path = self.runs_dir.join(format!("{id}.jsonl"));
        let Ok(content) = std::fs::read_to_string(path) else {
            return Vec::new();
        };
        let mut runs: Vec<CronRun> = content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        runs.reverse();
        runs.into_iter().skip(offset).take(limit).collect()
    }

    // -- scheduling ---------------------------------------------------------

    /// Poll loop. Every enabled job whose `next_run` has passed is executed.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
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

    async fn tick(&self) {
        let now = Utc::now();
        let due: Vec<CronJob> = {
            let map = self.jobs.lock().unwrap();
            map.values()
                .filter(|state| {
                    state.job.enabled && state.next_run.is_some_and(|at| at <= now)
                })
                .map(|state| state.job.clone())
                .collect()
        };

        for job in due {
            tracing::info!(job_id = %job.id, name = %job.name, "cron job due");
            self.execute(&job).await;
            self.reschedule_after_run(&job.id);
        }
    }

    fn reschedule_after_run(&self, id: &str) {
        let mut persist_needed = false;
        {
            let mut map = self.jobs.lock().unwrap();
            if let Some(state) = map.get_mut(id) {
                if state.job.schedule_type == ScheduleType::At {
                    // One-shot: deactivate after firing.
                    state.job.enabled = false;
                    state.next_run = None;
                    persist_needed = true;
                } else {
                    state.next_run = self.compute_next_run(&state.job).ok().flatten();
                }
            }
        }
        if persist_needed && let Err(error) = self.persist() {
            tracing::warn!(%error, "failed to persist cron jobs after one-shot run");
        }
    }

    async fn execute(&self, job: &CronJob) -> CronRun {
        let started_at = Utc::now().timestamp_millis();
        let run = match self.executor.execute(job).await {
            Ok(response) => {
                let mut success = true;
                let mut error = None;
                if let Some(delivery) = &job.delivery
                    && let Err(delivery_error) = self
                        .hub
                        .deliver(delivery, OutboundMessage::text(&response))
                        .await
                {
                    tracing::warn!(job_id = %job.id, error = %delivery_error, "cron delivery failed");
                    success = false;
                    error = Some(delivery_error.to_string());
                }
                CronRun {
                    started_at,
                    completed_at: Utc::now().timestamp_millis(),
                    success,
                    response: Some(response),
                    error,
                }
            }
            Err(error) => CronRun {
                started_at,
                completed_at: Utc::now().timestamp_millis(),
                success: false,
                response: None,
                error: Some(error),
            },
        };

        if let Err(error) = self.append_run(&job.id, &run) {
            tracing::warn!(job_id = %job.id, %error, "failed to append cron run record");
        }
        run
    }

    fn append_run(&self, id: &str, run: &CronRun) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.runs_dir)?;
        let mut line = serde_json::to_vec(run)?;
        line.push(b'\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.runs_dir.join(format!("{id}.jsonl")))?;
        file.write_all(&line)
    }

    fn compute_next_run(&self, job: &CronJob) -> Result<Option<DateTime<Utc>>, CronError> {
        match job.schedule_type {
            ScheduleType::At => {
                let at = DateTime::parse_from_rfc3339(job.schedule.trim())
                    .map_err(|error| CronError::InvalidSchedule {
                        schedule: job.schedule.clone(),
                        reason: error.to_string(),
                    })?
                    .with_timezone(&Utc);
                Ok(Some(at))
            }
            ScheduleType::Every | ScheduleType::Cron => {
                let expr = match job.schedule_type {
                    ScheduleType::Every => every_to_cron(&job.schedule)?,
                    _ => job.schedule.clone(),
                };
                let schedule = parse_cron(&expr).map_err(|reason| CronError::InvalidSchedule {
                    schedule: job.schedule.clone(),
                    reason,
                })?;
                let next = match self.timezone {
                    Some(tz) => schedule.upcoming(tz).next().map(|t| t.with_timezone(&Utc)),
                    None => schedule.upcoming(Utc).next(),
                };
                Ok(next)
            }
        }
    }
}

/// Convert `every`-style durations (`^\d+[smhd]$`) to a minutes-step cron
/// pattern. Sub-minute durations round up to one minute.
fn every_to_cron(schedule: &str) -> Result<String, CronError> {
    let invalid = |reason: &str| CronError::InvalidSchedule {
        schedule: schedule.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = schedule.trim();
    let (digits, unit) = trimmed.split_at(trimmed.len().saturating_sub(1));
    let amount: u64 = digits
        .parse()
        .map_err(|_| invalid("expected <number><s|m|h|d>"))?;
    if amount == 0 {
        return Err(invalid("interval must be positive"));
    }
    let minutes = match unit {
        "s" => (amount as f64 / 60.0).round() as u64,
        "m" => amount,
        "h" => amount * 60,
        "d" => amount * 60 * 24,
        _ => return Err(invalid("unit must be one of s, m, h, d")),
    }
    .max(1);

    Ok(format!("*/{minutes} * * * *"))
}

/// Parse a standard 5-field cron expression; the `cron` crate wants 7
/// fields, so seconds and years are pinned.
fn parse_cron(expr: &str) -> Result<cron::Schedule, String> {
    let trimmed = expr.trim();
    let fields = trimmed.split_whitespace().count();
    let full = match fields {
        5 => format!("0 {trimmed} *"),
        6 => format!("{trimmed} *"),
        _ => trimmed.to_string(),
    };
    full.parse::<cron::Schedule>().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Executor that records what it ran and answers with a fixed response.
    struct RecordingExecutor {
        executed: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingExecutor {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                executed: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl JobExecutor for RecordingExecutor {
        async fn execute(&self, job: &CronJob) -> Result<String, String> {
            self.executed.lock().unwrap().push(job.prompt.clone());
            if self.fail {
                Err("executor failed".to_string())
            } else {
                Ok(format!("ran: {}", job.prompt))
            }
        }
    }

    fn service(
        dir: &Path,
        executor: Arc<RecordingExecutor>,
    ) -> CronService {
        CronService::new(dir, None, executor, Arc::new(ChannelHub::new()))
    }

    #[test]
    fn every_durations_convert_to_minute_steps() {
        assert_eq!(every_to_cron("30m").unwrap(), "*/30 * * * *");
        assert_eq!(every_to_cron("2h").unwrap(), "*/120 * * * *");
        assert_eq!(every_to_cron("1d").unwrap(), "*/1440 * * * *");
        // Sub-minute rounds and clamps to at least one minute.
        assert_eq!(every_to_cron("10s").unwrap(), "*/1 * * * *");
        assert_eq!(every_to_cron("90s").unwrap(), "*/2 * * * *");
    }

    #[test]
    fn bad_durations_are_rejected() {
        for bad in ["", "30", "m", "30x", "-5m", "0m", "5 m"] {
            assert!(every_to_cron(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn five_field_cron_expressions_parse() {
        assert!(parse_cron("0 9 * * *").is_ok());
        assert!(parse_cron("30 14 * * 1-5").is_ok());
        assert!(parse_cron("not a cron").is_err());
    }

    #[test]
    fn jobs_persist_across_service_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = RecordingExecutor::new(false);

        let job_id = {
            let service = service(tmp.path(), executor.clone());
            let job = service
                .add_job("report", ScheduleType::Every, "30m", "write the report", None)
                .unwrap();
            job.id
        };

        // A fresh instance over the same data dir sees the same job,
        // scheduled once loaded.
        let service = service(tmp.path(), executor);
        assert_eq!(service.load(), 1);
        let jobs = service.list_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, job_id);
        assert_eq!(jobs[0].schedule, "30m");
        assert!(jobs[0].enabled);
        assert!(
            service
                .jobs
                .lock()
                .unwrap()
                .get(&job_id)
                .unwrap()
                .next_run
                .is_some()
        );
    }

    #[test]
    fn invalid_schedules_are_rejected_at_add() {
        let tmp = tempfile::tempdir().unwrap();
        let service = service(tmp.path(), RecordingExecutor::new(false));
        assert!(
            service
                .add_job("bad", ScheduleType::Every, "banana", "x", None)
                .is_err()
        );
        assert!(
            service
                .add_job("bad", ScheduleType::At, "tomorrow-ish", "x", None)
                .is_err()
        );
        assert!(service.list_jobs().is_empty());
    }

    #[tokio::test]
    async fn due_at_job_fires_once_then_deactivates() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = RecordingExecutor::new(false);
        let service = service(tmp.path(), executor.clone());

        let past = (Utc::now() - chrono::Duration::seconds(5)).to_rfc3339();
        let job = service
            .add_job("once", ScheduleType::At, &past, "one shot", None)
            .unwrap();

        service.tick().await;
        assert_eq!(executor.executed.lock().unwrap().len(), 1);

        // Deactivated, not removed, and no longer due.
        let reloaded = service.get_job(&job.id).unwrap();
        assert!(!reloaded.enabled);
        service.tick().await;
        assert_eq!(executor.executed.lock().unwrap().len(), 1);

        let runs = service.read_runs(&job.id, 0, 10);
        assert_eq!(runs.len(), 1);
        assert!(runs[0].success);
        assert_eq!(runs[0].response.as_deref(), Some("ran: one shot"));
    }

    #[tokio::test]
    async fn trigger_forces_a_run_outside_the_schedule() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = RecordingExecutor::new(false);
        let service = service(tmp.path(), executor.clone());

        let job = service
            .add_job("daily", ScheduleType::Cron, "0 9 * * *", "morning brief", None)
            .unwrap();

        let run = service.trigger_job(&job.id).await.unwrap();
        assert!(run.success);
        assert_eq!(executor.executed.lock().unwrap().len(), 1);
        assert!(service.trigger_job("missing").await.is_err());
    }

    #[tokio::test]
    async fn failed_executions_are_recorded() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = RecordingExecutor::new(true);
        let service = service(tmp.path(), executor);

        let job = service
            .add_job("flaky", ScheduleType::Cron, "0 9 * * *", "x", None)
            .unwrap();
        let run = service.trigger_job(&job.id).await.unwrap();
        assert!(!run.success);
        assert_eq!(run.error.as_deref(), Some("executor failed"));

        let runs = service.read_runs(&job.id, 0, 10);
        assert_eq!(runs.len(), 1);
        assert!(!runs[0].success);
    }

    #[tokio::test]
    async fn disabled_jobs_are_never_due() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = RecordingExecutor::new(false);
        let service = service(tmp.path(), executor.clone());

        let past = (Utc::now() - chrono::Duration::seconds(5)).to_rfc3339();
        let job = service
            .add_job("paused", ScheduleType::At, &past, "x", None)
            .unwrap();
        service.set_enabled(&job.id, false).unwrap();

        service.tick().await;
        assert!(executor.executed.lock().unwrap().is_empty());
    }

    #[test]
    fn remove_job_persists_the_removal() {
        let tmp = tempfile::tempdir().unwrap();
        let service1 = service(tmp.path(), RecordingExecutor::new(false));
        let job = service1
            .add_job("gone", ScheduleType::Every, "1h", "x", None)
            .unwrap();
        service1.remove_job(&job.id).unwrap();
        assert!(service1.remove_job(&job.id).is_err());

        let service2 = service(tmp.path(), RecordingExecutor::new(false));
        assert_eq!(service2.load(), 0);
    }
}
