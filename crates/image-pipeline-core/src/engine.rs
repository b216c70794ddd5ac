//! Persistence-free orchestration of one job execution
//!
//! The engine walks the generations of a job in index order, asks the
//! parameter generator for a prompt, calls the image generator and turns
//! whatever it returns into [`GeneratedImage`] records. A failing generation
//! is reported and counted, never fatal to the job. Abort is cooperative and
//! only observed between generations (and between generation retries).

use crate::clients::{
    GenerationOutput, GenerationRequest, ImageGenerator, MetadataGenerator, NamingContext,
    ParameterGenerator, PromptParameters, QualityChecker,
};
use crate::config::PathDefaults;
use crate::error::{qc_reason_for, PipelineStage, ProcessingError, Result};
use crate::events::{EventSink, JobEvent, JobPhase};
use crate::models::{
    ExecutionId, GeneratedImage, GenerationParameters, JobConfiguration, ProcessingSettings,
    QcStatus,
};
use crate::progress::{ProgressPlan, ProgressReporter};
use crate::utils::{self, performance::Timer};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

const MAX_GENERATION_BACKOFF: Duration = Duration::from_secs(30);

/// How a job execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcomeStatus {
    Completed,
    Failed,
    Aborted,
}

/// Result of one job execution
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub status: JobOutcomeStatus,
    pub images: Vec<GeneratedImage>,
    pub successful_images: u32,
    pub failed_images: u32,
    pub total_images: u32,
    pub message: Option<String>,
    pub error: Option<String>,
}

impl JobResult {
    pub fn is_completed(&self) -> bool {
        self.status == JobOutcomeStatus::Completed
    }
}

/// Image counts accumulated while the loop runs
#[derive(Debug, Default)]
struct Tally {
    images: Vec<GeneratedImage>,
    /// Variations lost to a failed parameter or image generation call
    lost_variations: u32,
}

impl Tally {
    fn successful(&self) -> u32 {
        self.images
            .iter()
            .filter(|i| i.qc_status == QcStatus::Approved)
            .count() as u32
    }

    fn failed(&self) -> u32 {
        self.images.len() as u32 - self.successful() + self.lost_variations
    }

    fn into_result(
        self,
        status: JobOutcomeStatus,
        message: Option<String>,
        error: Option<String>,
    ) -> JobResult {
        let successful_images = self.successful();
        let failed_images = self.failed();
        JobResult {
            status,
            successful_images,
            failed_images,
            total_images: successful_images + failed_images,
            images: self.images,
            message,
            error,
        }
    }
}

/// Backoff before retry `attempt` (1-based), doubling and capped
pub fn generation_backoff(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor)).min(MAX_GENERATION_BACKOFF)
}

/// Turn raw generator output into image records.
///
/// Processed images are `approved`; failed items become `qc_failed` with a
/// `processing_failed:<stage>` reason.
pub fn normalize_output(
    execution_id: ExecutionId,
    prompt: &str,
    settings: &ProcessingSettings,
    output: GenerationOutput,
) -> Vec<GeneratedImage> {
    let default_settings = settings.to_json().ok();
    let (processed, failed) = output.into_parts();
    let mut images = Vec::with_capacity(processed.len() + failed.len());

    for item in processed {
        let mut image = GeneratedImage::new(execution_id, prompt);
        image.seed = item.seed;
        image.temp_image_path = Some(item.temp_path.unwrap_or_else(|| item.path.clone()));
        image.final_image_path = Some(item.path);
        image.metadata = item.metadata;
        image.processing_settings = match item.settings {
            Some(applied) => applied.to_json().ok(),
            None => default_settings.clone(),
        };
        images.push(image);
    }

    for item in failed {
        let mut image = GeneratedImage::new(execution_id, prompt);
        image.qc_status = QcStatus::QcFailed;
        image.qc_reason = Some(item.stage.qc_reason());
        image.temp_image_path = item.path;
        image.processing_settings = default_settings.clone();
        tracing::debug!("Generator reported {} failure: {}", item.stage, item.error);
        images.push(image);
    }

    images
}

/// Drives one job execution against injected collaborators
#[derive(Clone)]
pub struct JobEngine {
    parameter_generator: Arc<dyn ParameterGenerator>,
    image_generator: Arc<dyn ImageGenerator>,
    quality_checker: Option<Arc<dyn QualityChecker>>,
    metadata_generator: Option<Arc<dyn MetadataGenerator>>,
    path_defaults: PathDefaults,
}

impl JobEngine {
    pub fn new(
        parameter_generator: Arc<dyn ParameterGenerator>,
        image_generator: Arc<dyn ImageGenerator>,
    ) -> Self {
        Self {
            parameter_generator,
            image_generator,
            quality_checker: None,
            metadata_generator: None,
            path_defaults: PathDefaults::platform(),
        }
    }

    pub fn with_quality_checker(mut self, checker: Arc<dyn QualityChecker>) -> Self {
        self.quality_checker = Some(checker);
        self
    }

    pub fn with_metadata_generator(mut self, generator: Arc<dyn MetadataGenerator>) -> Self {
        self.metadata_generator = Some(generator);
        self
    }

    pub fn with_path_defaults(mut self, path_defaults: PathDefaults) -> Self {
        self.path_defaults = path_defaults;
        self
    }

    fn temp_directory(&self, config: &JobConfiguration) -> PathBuf {
        utils::paths::non_empty(config.file_paths.temp_directory.as_ref())
            .cloned()
            .unwrap_or_else(|| self.path_defaults.temp_directory.clone())
    }

    /// Run one job to its end.
    ///
    /// Every emitted sequence ends with exactly one `JobComplete` event.
    #[instrument(skip(self, config, execution_id, abort, sink), fields(execution_id = %execution_id))]
    pub async fn execute_job(
        &self,
        config: &JobConfiguration,
        execution_id: ExecutionId,
        abort: &CancellationToken,
        sink: &EventSink,
    ) -> JobResult {
        let _timer = Timer::new(format!("Job {}", execution_id));
        let generations = config.parameters.count.max(1);
        let variations = config.parameters.variations.max(1);
        let reporter = ProgressReporter::new(ProgressPlan::new(generations), sink.clone());
        let mut tally = Tally::default();

        info!(
            "Starting job with {} generation(s) x {} variation(s)",
            generations, variations
        );

        let result = self
            .run_generations(
                config,
                execution_id,
                generations,
                variations,
                abort,
                sink,
                &reporter,
                &mut tally,
            )
            .await;

        let result = match result {
            Ok(LoopEnd::Finished) => {
                reporter.report(
                    JobPhase::Finalization,
                    reporter.plan().finalizing(),
                    None,
                    "Finalizing job",
                );
                let message = format!(
                    "Generated {} of {} image(s)",
                    tally.successful(),
                    tally.successful() + tally.failed()
                );
                reporter.report(JobPhase::Finalization, reporter.plan().complete(), None, &message);
                tally.into_result(JobOutcomeStatus::Completed, Some(message), None)
            }
            Ok(LoopEnd::Aborted) => {
                info!("Job aborted");
                tally.into_result(
                    JobOutcomeStatus::Aborted,
                    Some("Job was stopped".to_string()),
                    None,
                )
            }
            Err(e) => {
                warn!("Job failed: {}", e);
                sink.emit(JobEvent::Error {
                    generation: None,
                    message: e.to_string(),
                });
                tally.into_result(JobOutcomeStatus::Failed, None, Some(e.to_string()))
            }
        };

        sink.emit(JobEvent::JobComplete {
            status: result.status,
            total_images: result.total_images,
            successful_images: result.successful_images,
            failed_images: result.failed_images,
            message: result.message.clone().or_else(|| result.error.clone()),
        });

        info!(
            "Job finished as {:?}: {} succeeded, {} failed",
            result.status, result.successful_images, result.failed_images
        );
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_generations(
        &self,
        config: &JobConfiguration,
        execution_id: ExecutionId,
        generations: u32,
        variations: u32,
        abort: &CancellationToken,
        sink: &EventSink,
        reporter: &ProgressReporter,
        tally: &mut Tally,
    ) -> Result<LoopEnd> {
        let plan = *reporter.plan();
        reporter.report(JobPhase::Initialization, 0.0, None, "Preparing job");

        let temp_directory = self.temp_directory(config);
        utils::file::ensure_directory_exists(&temp_directory).await?;
        reporter.report(
            JobPhase::Initialization,
            plan.initialized(),
            None,
            "Job initialized",
        );

        for index in 0..generations {
            let generation = index + 1;
            if abort.is_cancelled() {
                return Ok(LoopEnd::Aborted);
            }

            reporter.report(
                JobPhase::ParameterGeneration,
                plan.generation_started(index),
                Some(generation),
                format!("Generating parameters for generation {}/{}", generation, generations),
            );

            let parameters = match self
                .parameter_generator
                .generate_parameters(config, index)
                .await
            {
                Ok(parameters) => parameters,
                Err(e) => {
                    self.skip_generation(sink, reporter, tally, index, variations, &e);
                    continue;
                }
            };

            reporter.report(
                JobPhase::ImageGeneration,
                plan.parameters_done(index),
                Some(generation),
                format!("Generating {} image(s) for generation {}", variations, generation),
            );

            let request = GenerationRequest {
                model: config.parameters.model.clone(),
                variations,
                advanced: config.parameters.advanced.clone(),
                output_directory: temp_directory.clone(),
                processing: config.processing.clone(),
                naming: NamingContext {
                    execution_id,
                    generation,
                },
                api_key: config.api_keys.generation.clone(),
                timeout: Duration::from_secs(config.parameters.polling_timeout_secs),
                parameters,
            };

            let output = match self
                .generate_with_retry(&request, &config.parameters, abort)
                .await
            {
                Ok(output) => output,
                Err(ProcessingError::Cancelled) => return Ok(LoopEnd::Aborted),
                Err(e) => {
                    self.skip_generation(sink, reporter, tally, index, variations, &e);
                    continue;
                }
            };

            let images = normalize_output(
                execution_id,
                &request.parameters.prompt,
                &config.processing,
                output,
            );

            for mut image in images {
                self.review_image(&mut image, config, &request.parameters).await;
                sink.emit(JobEvent::ImageGenerated {
                    image: image.clone(),
                });
                tally.images.push(image);
            }

            reporter.report(
                JobPhase::ImageGeneration,
                plan.generation_done(index),
                Some(generation),
                format!("Generation {}/{} complete", generation, generations),
            );
        }

        Ok(LoopEnd::Finished)
    }

    fn skip_generation(
        &self,
        sink: &EventSink,
        reporter: &ProgressReporter,
        tally: &mut Tally,
        index: u32,
        variations: u32,
        error: &ProcessingError,
    ) {
        let generation = index + 1;
        warn!("Generation {} failed: {}", generation, error);
        sink.emit(JobEvent::Error {
            generation: Some(generation),
            message: error.to_string(),
        });
        tally.lost_variations += variations;
        reporter.report(
            JobPhase::ImageGeneration,
            reporter.plan().generation_done(index),
            Some(generation),
            format!("Generation {} failed", generation),
        );
    }

    async fn generate_with_retry(
        &self,
        request: &GenerationRequest,
        parameters: &GenerationParameters,
        abort: &CancellationToken,
    ) -> Result<GenerationOutput> {
        let mut attempt = 0u32;
        loop {
            match self.image_generator.generate(request).await {
                Ok(output) => return Ok(output),
                Err(e) if e.is_recoverable() && attempt < parameters.generation_retry_attempts => {
                    attempt += 1;
                    let delay = generation_backoff(parameters.generation_retry_backoff_ms, attempt);
                    warn!(
                        "Generation {} attempt {} failed ({}), retrying in {:?}",
                        request.naming.generation, attempt, e, delay
                    );
                    tokio::select! {
                        _ = abort.cancelled() => return Err(ProcessingError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Quality check and metadata for an approved image
    async fn review_image(
        &self,
        image: &mut GeneratedImage,
        config: &JobConfiguration,
        parameters: &PromptParameters,
    ) {
        if image.qc_status != QcStatus::Approved {
            return;
        }
        let Some(path) = image.final_image_path.clone() else {
            return;
        };

        if config.ai.run_quality_check {
            if let Some(checker) = &self.quality_checker {
                match checker.check(&path, &parameters.prompt).await {
                    Ok(verdict) if verdict.passed => {}
                    Ok(verdict) => {
                        image.qc_status = QcStatus::QcFailed;
                        image.qc_reason =
                            Some(verdict.reason.unwrap_or_else(|| "qc_failed".to_string()));
                        return;
                    }
                    Err(e) => {
                        warn!("Quality check failed for {}: {}", path.display(), e);
                        image.qc_status = QcStatus::QcFailed;
                        image.qc_reason = Some(qc_reason_for(&ProcessingError::stage(
                            PipelineStage::Qc,
                            e.to_string(),
                        )));
                        return;
                    }
                }
            }
        }

        if config.ai.run_metadata_gen {
            if let Some(generator) = &self.metadata_generator {
                let template = match &config.file_paths.metadata_prompt_file {
                    Some(file) => tokio::fs::read_to_string(file).await.ok(),
                    None => None,
                };
                match generator
                    .generate_metadata(&path, &parameters.prompt, template.as_deref())
                    .await
                {
                    Ok(metadata) => {
                        let merged = image.metadata.clone().unwrap_or_default().merged_with(&metadata);
                        image.metadata = Some(merged);
                    }
                    Err(e) => warn!("Metadata generation failed for {}: {}", path.display(), e),
                }
            }
        }
    }
}

enum LoopEnd {
    Finished,
    Aborted,
}
