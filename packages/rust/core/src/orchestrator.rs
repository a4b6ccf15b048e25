//! Polling loop driving submitted tasks to a terminal state.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use kbforge_remote::{BatchApi, RemoteState};
use kbforge_shared::{ConversionTask, PollingConfig, Result, TaskEvent};
use kbforge_storage::TaskStore;
use tracing::{debug, info, instrument, warn};

use crate::materialize::{Materialized, ResultMaterializer};
use crate::pipeline::ProgressReporter;

// ---------------------------------------------------------------------------
// PollPolicy
// ---------------------------------------------------------------------------

/// Pacing between polling cycles.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    /// Wait after a cycle in which some task changed state.
    pub interval: Duration,
    /// Cap for the backed-off wait.
    pub max_interval: Duration,
    /// Growth factor applied after a cycle without any change.
    pub backoff_factor: f64,
    /// Stop polling once this much time has passed.
    pub deadline: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::from_config(&PollingConfig::default())
    }
}

impl PollPolicy {
    pub fn from_config(config: &PollingConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_secs),
            max_interval: Duration::from_secs(config.max_interval_secs),
            backoff_factor: config.backoff_factor,
            deadline: config.deadline_secs.map(Duration::from_secs),
        }
    }

    /// Wait before the next cycle, given the previous wait and whether the
    /// last cycle made progress.
    pub fn next_wait(&self, previous: Duration, progressed: bool) -> Duration {
        if progressed {
            return self.interval;
        }
        previous
            .mul_f64(self.backoff_factor.max(1.0))
            .min(self.max_interval)
            .max(self.interval)
    }
}

// ---------------------------------------------------------------------------
// PollingOrchestrator
// ---------------------------------------------------------------------------

/// Outcome of a polling run.
#[derive(Debug, Default, Clone)]
pub struct PollReport {
    pub cycles: usize,
    /// Archives downloaded in this run.
    pub downloaded: usize,
    /// Done tasks whose archive was already on disk.
    pub already_present: usize,
    /// `(id, remote error)` for tasks the service failed.
    pub failed: Vec<(String, String)>,
    /// Download attempts that will be retried next cycle.
    pub download_retries: usize,
    /// Tasks still waiting when the run ended.
    pub still_active: usize,
    /// The run stopped because the deadline elapsed.
    pub deadline_reached: bool,
}

/// Drives the task state machine from batch status responses.
pub struct PollingOrchestrator<'a> {
    api: &'a dyn BatchApi,
    store: &'a dyn TaskStore,
    materializer: &'a ResultMaterializer,
    policy: PollPolicy,
}

impl<'a> PollingOrchestrator<'a> {
    pub fn new(
        api: &'a dyn BatchApi,
        store: &'a dyn TaskStore,
        materializer: &'a ResultMaterializer,
        policy: PollPolicy,
    ) -> Self {
        Self {
            api,
            store,
            materializer,
            policy,
        }
    }

    /// Poll until no task is active or the deadline elapses.
    #[instrument(skip_all)]
    pub async fn run(&self, progress: &dyn ProgressReporter) -> Result<PollReport> {
        let started = Instant::now();
        let mut report = PollReport::default();
        let mut active = self.store.list_active().await?;
        let mut wait = self.policy.interval;

        info!(active = active.len(), "starting polling");

        while !active.is_empty() {
            report.cycles += 1;
            progress.phase(&format!(
                "Polling cycle {} ({} tasks waiting)",
                report.cycles,
                active.len()
            ));

            let progressed = self.poll_once(&mut active, &mut report).await?;
            if active.is_empty() {
                break;
            }

            wait = self.policy.next_wait(wait, progressed);
            if let Some(deadline) = self.policy.deadline {
                if started.elapsed() + wait > deadline {
                    warn!(
                        remaining = active.len(),
                        "polling deadline reached, tasks stay queued for the next run"
                    );
                    report.deadline_reached = true;
                    break;
                }
            }

            info!(
                remaining = active.len(),
                wait_secs = wait.as_secs_f64(),
                "waiting before next poll"
            );
            tokio::time::sleep(wait).await;
        }

        report.still_active = active.len();
        info!(
            cycles = report.cycles,
            downloaded = report.downloaded,
            failed = report.failed.len(),
            still_active = report.still_active,
            "polling finished"
        );
        Ok(report)
    }

    /// Run one cycle over `active`, removing tasks that reach a terminal
    /// state. Returns whether any task changed state.
    ///
    /// Each distinct batch is queried once. Every transition is persisted
    /// before the next remote call.
    pub async fn poll_once(
        &self,
        active: &mut Vec<ConversionTask>,
        report: &mut PollReport,
    ) -> Result<bool> {
        let mut by_batch: BTreeMap<String, Vec<ConversionTask>> = BTreeMap::new();
        for task in active.drain(..) {
            match task.state.batch_id() {
                Some(batch_id) => by_batch.entry(batch_id.to_string()).or_default().push(task),
                None => warn!(task_id = %task.id, "active task without batch id, dropping"),
            }
        }

        let mut progressed = false;
        for (batch_id, tasks) in by_batch {
            let status = match self.api.batch_status(&batch_id).await {
                Ok(status) => status,
                Err(e) if e.is_transient() => {
                    warn!(%batch_id, error = %e, "status query failed, retrying next cycle");
                    active.extend(tasks);
                    continue;
                }
                Err(e) => {
                    warn!(%batch_id, error = %e, tasks = tasks.len(), "batch rejected, failing its tasks");
                    let error = e.to_string();
                    for mut task in tasks {
                        self.fail(&mut task, &error).await?;
                        report.failed.push((task.id.clone(), error.clone()));
                    }
                    progressed = true;
                    continue;
                }
            };

            for mut task in tasks {
                let Some(result) = status.result_for(&task.id) else {
                    debug!(task_id = %task.id, %batch_id, "task missing from batch response");
                    active.push(task);
                    continue;
                };

                match &result.state {
                    RemoteState::Done { zip_url } => {
                        progressed |= self.record_query(&mut task).await?;
                        match self.materializer.materialize(&task, zip_url).await {
                            Ok(outcome) => {
                                task.apply(TaskEvent::Completed)?;
                                self.store.put(&task).await?;
                                match outcome {
                                    Materialized::Written { .. } => report.downloaded += 1,
                                    Materialized::AlreadyPresent { .. } => {
                                        report.already_present += 1
                                    }
                                }
                                info!(task_id = %task.id, path = %outcome.path().display(), "task done");
                                progressed = true;
                            }
                            Err(e) => {
                                warn!(task_id = %task.id, error = %e, "download failed, will retry");
                                report.download_retries += 1;
                                active.push(task);
                            }
                        }
                    }
                    RemoteState::Failed { error } => {
                        warn!(task_id = %task.id, file = %task.file_name, %error, "remote conversion failed");
                        self.fail(&mut task, error).await?;
                        report.failed.push((task.id.clone(), error.clone()));
                        progressed = true;
                    }
                    RemoteState::InProgress(state) => {
                        debug!(task_id = %task.id, %state, "still processing");
                        progressed |= self.record_query(&mut task).await?;
                        active.push(task);
                    }
                }
            }
        }

        active.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(progressed)
    }

    /// Apply `Queried`, persisting only when the state actually changed.
    async fn record_query(&self, task: &mut ConversionTask) -> Result<bool> {
        let before = task.state.clone();
        task.apply(TaskEvent::Queried)?;
        if task.state == before {
            return Ok(false);
        }
        self.store.put(task).await?;
        Ok(true)
    }

    async fn fail(&self, task: &mut ConversionTask, error: &str) -> Result<()> {
        task.apply(TaskEvent::Queried)?;
        task.apply(TaskEvent::RemoteFailed {
            error: error.to_string(),
        })?;
        self.store.put(task).await
    }
}
