//! Reruns of past job executions, one at a time or in bulk
//!
//! A rerun starts a new execution from the saved configuration of an old
//! one. Bulk reruns start the first valid job immediately and queue the rest
//! in selection order; a background driver starts each queued job once the
//! previous one has finished.

use crate::clients::SecretStore;
use crate::error::{ProcessingError, Result};
use crate::job_service::{JobId, JobService, PreparedJob, StartJobResponse, StartOptions};
use crate::models::{BulkRerunQueueEntry, ExecutionId, ExecutionStatus};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Re-check interval while a queued rerun waits for another job
const BUSY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Ordered queue of pending whole-job reruns
#[derive(Debug, Clone, Default)]
pub struct RerunQueue {
    entries: Arc<Mutex<VecDeque<BulkRerunQueueEntry>>>,
}

impl RerunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<BulkRerunQueueEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, entry: BulkRerunQueueEntry) {
        self.entries().push_back(entry);
    }

    /// Put an entry back at the head, keeping its place in line
    pub fn push_front(&self, entry: BulkRerunQueueEntry) {
        self.entries().push_front(entry);
    }

    pub fn pop(&self) -> Option<BulkRerunQueueEntry> {
        self.entries().pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Pending entries in the order they will run
    pub fn pending(&self) -> Vec<BulkRerunQueueEntry> {
        self.entries().iter().cloned().collect()
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.entries();
        let cleared = entries.len();
        entries.clear();
        cleared
    }
}

/// A selected job that could not be rerun
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RerunFailure {
    pub execution_id: ExecutionId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RerunResponse {
    pub success: bool,
    pub execution_id: ExecutionId,
    pub job_id: JobId,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRerunResponse {
    pub success: bool,
    /// Execution started immediately, if any
    pub started: Option<ExecutionId>,
    /// Jobs left waiting in the rerun queue
    pub queued: usize,
    pub failed_jobs: Vec<RerunFailure>,
    pub message: String,
}

struct CoordinatorInner {
    job_service: JobService,
    queue: RerunQueue,
    secret_store: Arc<dyn SecretStore>,
    drivers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Validates and launches reruns through the [`JobService`]
#[derive(Clone)]
pub struct RerunCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl RerunCoordinator {
    pub fn new(job_service: JobService, queue: RerunQueue, secret_store: Arc<dyn SecretStore>) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                job_service,
                queue,
                secret_store,
                drivers: tokio::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn queue(&self) -> &RerunQueue {
        &self.inner.queue
    }

    /// True when the service or the repository reports a running job
    async fn job_running(&self) -> Result<bool> {
        if self.inner.job_service.is_running() {
            return Ok(true);
        }
        Ok(self
            .inner
            .job_service
            .repository()
            .running_execution()
            .await?
            .is_some())
    }

    /// Build a queue entry for `execution_id` from its saved configuration
    async fn prepare_entry(&self, execution_id: ExecutionId, selection: &[ExecutionId]) -> Result<BulkRerunQueueEntry> {
        let repository = self.inner.job_service.repository();
        let execution = repository
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| ProcessingError::NotFound {
                entity: "execution",
                id: execution_id.to_string(),
            })?;

        let configuration_id = execution.configuration_id.ok_or_else(|| ProcessingError::InvalidInput {
            message: format!("Execution {} has no saved configuration", execution_id),
        })?;

        let saved = repository
            .get_configuration(configuration_id)
            .await?
            .ok_or_else(|| ProcessingError::NotFound {
                entity: "configuration",
                id: configuration_id.to_string(),
            })?;

        Ok(BulkRerunQueueEntry {
            job_id: execution.id,
            label: format!("{} (Rerun)", execution.display_label()),
            configuration: saved.settings,
            configuration_id,
            original_job_ids: selection.to_vec(),
        })
    }

    /// Claim the job slot for `entry` with live credentials merged in
    async fn launch(&self, entry: BulkRerunQueueEntry) -> Result<PreparedJob> {
        let configuration = entry
            .configuration
            .with_credentials(self.inner.secret_store.api_keys())
            .normalize_advanced();

        let prepared = self
            .inner
            .job_service
            .begin(
                configuration,
                StartOptions {
                    configuration_id: Some(entry.configuration_id),
                    label: Some(entry.label.clone()),
                },
            )
            .await?;

        info!(
            "Rerun of {} started as execution {} ({})",
            entry.job_id,
            prepared.execution_id(),
            entry.label
        );
        Ok(prepared)
    }

    /// Run `first` (if any) in the background, then keep draining the queue
    async fn spawn_driver(&self, first: Option<PreparedJob>) {
        let coordinator = self.clone();
        let handle = tokio::spawn(async move {
            if let Some(prepared) = first {
                if let Err(e) = prepared.run().await {
                    warn!("Rerun failed: {}", e);
                }
            }
            coordinator.drain().await;
        });

        let mut drivers = self.inner.drivers.lock().await;
        drivers.retain(|driver| !driver.is_finished());
        drivers.push(handle);
    }

    async fn drain(&self) {
        let mut updates = self.inner.job_service.subscribe();
        loop {
            match self.process_next_bulk_rerun().await {
                Ok(Some(response)) => debug!(
                    "Queued rerun {} finished ({:?})",
                    response.execution_id, response.result.status
                ),
                Ok(None) => break,
                Err(ProcessingError::JobAlreadyRunning { execution_id }) => {
                    debug!("Waiting for execution {} before next rerun", execution_id);
                    let wait_for_end = async {
                        loop {
                            match updates.recv().await {
                                Ok(update) if update.event.is_terminal() => break,
                                Ok(_) => continue,
                                Err(RecvError::Lagged(_) | RecvError::Closed) => break,
                            }
                        }
                    };
                    let _ = tokio::time::timeout(BUSY_POLL_INTERVAL, wait_for_end).await;
                }
                Err(e) => warn!("Queued rerun could not start: {}", e),
            }
        }
    }

    /// Rerun one execution in the background
    #[instrument(skip(self))]
    pub async fn rerun_job_execution(&self, execution_id: ExecutionId) -> Result<RerunResponse> {
        let entry = self.prepare_entry(execution_id, &[execution_id]).await?;

        if let Some(running) = self.inner.job_service.repository().running_execution().await? {
            return Err(ProcessingError::JobAlreadyRunning {
                execution_id: running.id.to_string(),
            });
        }

        let label = entry.label.clone();
        let prepared = self.launch(entry).await?;
        let response = RerunResponse {
            success: true,
            execution_id: prepared.execution_id(),
            job_id: prepared.job_id(),
            label,
        };

        self.spawn_driver(Some(prepared)).await;
        Ok(response)
    }

    /// Rerun several executions one after another, in selection order.
    ///
    /// Refused outright, with nothing queued, when any job is running.
    #[instrument(skip(self, execution_ids), fields(selected = execution_ids.len()))]
    pub async fn bulk_rerun_job_executions(&self, execution_ids: &[ExecutionId]) -> Result<BulkRerunResponse> {
        let repository = self.inner.job_service.repository().clone();
        let mut failed_jobs = Vec::new();
        let mut entries = Vec::new();
        let mut selected_running = false;

        for &execution_id in execution_ids {
            if let Some(execution) = repository.get_execution(execution_id).await? {
                if execution.status == ExecutionStatus::Running {
                    selected_running = true;
                    failed_jobs.push(RerunFailure {
                        execution_id,
                        reason: "Job is currently running".to_string(),
                    });
                    continue;
                }
            }

            match self.prepare_entry(execution_id, execution_ids).await {
                Ok(entry) => entries.push(entry),
                Err(e) => failed_jobs.push(RerunFailure {
                    execution_id,
                    reason: e.to_string(),
                }),
            }
        }

        if selected_running || self.job_running().await? {
            warn!("Bulk rerun refused: a job is running");
            return Ok(BulkRerunResponse {
                success: false,
                started: None,
                queued: 0,
                failed_jobs,
                message: "Cannot start a bulk rerun while a job is running".to_string(),
            });
        }

        let mut remaining = VecDeque::from(entries);
        let mut started = None;
        while let Some(entry) = remaining.pop_front() {
            let job_id = entry.job_id;
            match self.launch(entry).await {
                Ok(prepared) => {
                    started = Some(prepared);
                    break;
                }
                Err(e) => failed_jobs.push(RerunFailure {
                    execution_id: job_id,
                    reason: e.to_string(),
                }),
            }
        }

        let Some(first) = started else {
            return Ok(BulkRerunResponse {
                success: false,
                started: None,
                queued: 0,
                failed_jobs,
                message: "No selected job could be rerun".to_string(),
            });
        };

        let queued = remaining.len();
        for entry in remaining {
            self.inner.queue.push(entry);
        }

        let started = first.execution_id();
        self.spawn_driver(Some(first)).await;

        info!("Bulk rerun started {} with {} queued", started, queued);
        Ok(BulkRerunResponse {
            success: true,
            started: Some(started),
            queued,
            message: format!("Started 1 job, {} queued, {} failed", queued, failed_jobs.len()),
            failed_jobs,
        })
    }

    /// Start the next queued rerun and run it to completion.
    ///
    /// Returns `Ok(None)` when the queue is empty. An entry that cannot start
    /// because another job holds the slot goes back to the head of the queue.
    pub async fn process_next_bulk_rerun(&self) -> Result<Option<StartJobResponse>> {
        let Some(entry) = self.inner.queue.pop() else {
            return Ok(None);
        };

        match self.launch(entry.clone()).await {
            Ok(prepared) => prepared.run().await.map(Some),
            Err(e @ ProcessingError::JobAlreadyRunning { .. }) => {
                self.inner.queue.push_front(entry);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Wait until every started rerun and every queued entry has finished
    pub async fn wait_for_completion(&self) {
        loop {
            let drivers: Vec<JoinHandle<()>> = {
                let mut drivers = self.inner.drivers.lock().await;
                drivers.drain(..).collect()
            };

            if drivers.is_empty() {
                if self.inner.queue.is_empty() {
                    return;
                }
                self.spawn_driver(None).await;
                continue;
            }

            for driver in drivers {
                if let Err(e) = driver.await {
                    warn!("Rerun driver ended abnormally: {}", e);
                }
            }
        }
    }
}
