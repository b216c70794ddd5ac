//! Persistent job lifecycle around the [`JobEngine`]
//!
//! The service owns the single "current job" slot, records every execution in
//! the repository and republishes engine events to subscribers tagged with
//! their execution id.

use crate::engine::{JobEngine, JobOutcomeStatus, JobResult};
use crate::error::{ProcessingError, Result};
use crate::events::{EventSink, JobEvent, JobUpdate};
use crate::models::{ConfigurationId, ExecutionId, ExecutionStatus, JobConfiguration, JobExecution};
use crate::repository::Repository;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const UPDATE_CHANNEL_CAPACITY: usize = 1024;

/// Identifies a job run in memory; distinct from its execution record id
pub type JobId = Uuid;

/// Options recorded on the execution row
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOptions {
    pub configuration_id: Option<ConfigurationId>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartJobResponse {
    pub success: bool,
    pub execution_id: ExecutionId,
    pub job_id: JobId,
    pub result: JobResult,
}

/// The job currently holding the slot
#[derive(Debug, Clone)]
struct ActiveJob {
    execution_id: ExecutionId,
    job_id: JobId,
    abort: CancellationToken,
}

struct ServiceInner {
    repository: Arc<dyn Repository>,
    engine: JobEngine,
    updates: broadcast::Sender<JobUpdate>,
    /// At most one job runs at a time
    current: Mutex<Option<ActiveJob>>,
}

/// Starts, stops and records job executions
#[derive(Clone)]
pub struct JobService {
    inner: Arc<ServiceInner>,
}

impl JobService {
    pub fn new(repository: Arc<dyn Repository>, engine: JobEngine) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ServiceInner {
                repository,
                engine,
                updates,
                current: Mutex::new(None),
            }),
        }
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.inner.repository
    }

    /// Receive every event of every job from now on
    pub fn subscribe(&self) -> broadcast::Receiver<JobUpdate> {
        self.inner.updates.subscribe()
    }

    fn slot(&self) -> MutexGuard<'_, Option<ActiveJob>> {
        self.inner
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn current_execution_id(&self) -> Option<ExecutionId> {
        self.slot().as_ref().map(|job| job.execution_id)
    }

    pub fn is_running(&self) -> bool {
        self.slot().is_some()
    }

    /// Claim the job slot and record a `running` execution.
    ///
    /// The returned [`PreparedJob`] holds the slot until it is run to
    /// completion or dropped.
    pub async fn begin(&self, config: JobConfiguration, options: StartOptions) -> Result<PreparedJob> {
        let active = {
            let mut slot = self.slot();
            if let Some(running) = slot.as_ref() {
                return Err(ProcessingError::JobAlreadyRunning {
                    execution_id: running.execution_id.to_string(),
                });
            }

            let active = ActiveJob {
                execution_id: Uuid::new_v4(),
                job_id: Uuid::new_v4(),
                abort: CancellationToken::new(),
            };
            *slot = Some(active.clone());
            active
        };

        let mut execution = JobExecution::start(
            options.configuration_id,
            options.label,
            Some(config.snapshot()),
        );
        execution.id = active.execution_id;

        if let Err(e) = self.inner.repository.insert_execution(&execution).await {
            error!("Failed to record execution {}: {}", execution.id, e);
            self.release(active.execution_id);
            return Err(e);
        }

        info!(
            "Job {} prepared as execution {} ({})",
            active.job_id,
            execution.id,
            execution.display_label()
        );

        Ok(PreparedJob {
            service: self.clone(),
            execution,
            config,
            job_id: active.job_id,
            abort: active.abort,
            finished: false,
        })
    }

    /// Run a job to completion
    pub async fn start_job(&self, config: JobConfiguration, options: StartOptions) -> Result<StartJobResponse> {
        self.begin(config, options).await?.run().await
    }

    /// Request the current job to stop at its next generation boundary.
    ///
    /// The running job records its execution as `stopped` when the engine
    /// reports the abort. It is the only writer of the execution row, so a job
    /// that finishes before the boundary keeps its terminal status.
    pub async fn stop_job(&self) -> Result<Option<ExecutionId>> {
        let Some(active) = self.slot().clone() else {
            debug!("stop_job called with no job running");
            return Ok(None);
        };

        info!("Stopping execution {}", active.execution_id);
        active.abort.cancel();

        Ok(Some(active.execution_id))
    }

    pub async fn get_job_status(&self, execution_id: ExecutionId) -> Result<Option<JobExecution>> {
        self.inner.repository.get_execution(execution_id).await
    }

    pub async fn get_job_history(&self, limit: usize) -> Result<Vec<JobExecution>> {
        self.inner.repository.list_executions(limit).await
    }

    /// Free the slot if it still belongs to `execution_id`
    fn release(&self, execution_id: ExecutionId) {
        let mut slot = self.slot();
        if slot.as_ref().map(|job| job.execution_id) == Some(execution_id) {
            *slot = None;
        }
    }

    fn publish(&self, execution_id: ExecutionId, event: JobEvent) {
        let update = JobUpdate {
            execution_id,
            timestamp: Utc::now(),
            event,
        };
        // no subscribers is fine
        let _ = self.inner.updates.send(update);
    }

    /// Persist whatever an engine event changes on the execution record
    async fn record(&self, execution: &mut JobExecution, event: &JobEvent) {
        let repository = &self.inner.repository;
        match event {
            JobEvent::Progress { .. } => return,
            JobEvent::ImageGenerated { image } => {
                if let Err(e) = repository.insert_image(image).await {
                    warn!("Failed to record image {}: {}", image.id, e);
                }
                return;
            }
            JobEvent::Error { message, .. } => {
                execution.status = ExecutionStatus::Failed;
                execution.error_message = Some(message.clone());
            }
            JobEvent::JobComplete {
                status,
                total_images,
                successful_images,
                failed_images,
                ..
            } => {
                execution.status = match status {
                    JobOutcomeStatus::Completed => ExecutionStatus::Completed,
                    JobOutcomeStatus::Failed => ExecutionStatus::Failed,
                    JobOutcomeStatus::Aborted => ExecutionStatus::Stopped,
                };
                execution.total_images = *total_images;
                execution.successful_images = *successful_images;
                execution.failed_images = *failed_images;
                execution.ended_at = Some(Utc::now());
            }
        }

        if let Err(e) = repository.update_execution(execution).await {
            warn!("Failed to update execution {}: {}", execution.id, e);
        }
    }
}

/// A job that owns the slot and has a `running` execution row
pub struct PreparedJob {
    service: JobService,
    execution: JobExecution,
    config: JobConfiguration,
    job_id: JobId,
    abort: CancellationToken,
    finished: bool,
}

impl PreparedJob {
    pub fn execution_id(&self) -> ExecutionId {
        self.execution.id
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Drive the engine, recording and republishing each event in order
    #[instrument(skip(self), fields(execution_id = %self.execution.id))]
    pub async fn run(mut self) -> Result<StartJobResponse> {
        let (sink, mut events) = EventSink::channel();
        let engine = &self.service.inner.engine;
        let execution_id = self.execution.id;

        let run_engine = async {
            let sink = sink;
            engine
                .execute_job(&self.config, execution_id, &self.abort, &sink)
                .await
        };

        let mut execution = self.execution.clone();
        let service = &self.service;
        let consume = async {
            while let Some(event) = events.recv().await {
                service.record(&mut execution, &event).await;
                service.publish(execution_id, event);
            }
        };

        let (result, ()) = tokio::join!(run_engine, consume);
        self.finished = true;

        info!(
            "Execution {} ended {:?}: {}/{} image(s) succeeded",
            execution_id, result.status, result.successful_images, result.total_images
        );

        Ok(StartJobResponse {
            success: result.is_completed(),
            execution_id,
            job_id: self.job_id,
            result,
        })
    }
}

impl Drop for PreparedJob {
    fn drop(&mut self) {
        self.service.release(self.execution.id);
        if self.finished {
            return;
        }

        warn!("Execution {} dropped before it finished", self.execution.id);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let repository = self.service.inner.repository.clone();
        let mut execution = self.execution.clone();
        runtime.spawn(async move {
            execution.status = ExecutionStatus::Failed;
            execution.error_message = Some("Job was abandoned before completion".to_string());
            execution.ended_at = Some(Utc::now());
            if let Err(e) = repository.update_execution(&execution).await {
                warn!("Failed to mark execution {} failed: {}", execution.id, e);
            }
        });
    }
}
