//! Staged post-processing of a single image with per-stage fail policy
//!
//! Stages run in a fixed order: background removal, trim, enhance, convert
//! (encode into `<temp>/processing`), metadata, copy to the output
//! directory, source cleanup and finally the record update. Optional stages
//! soft-fail unless selected in [`FailOptions`]; the convert stage always
//! hard-fails.

use crate::clients::{BackgroundRemover, MetadataGenerator, SecretStore, REMOVE_BG_SERVICE};
use crate::config::PathDefaults;
use crate::error::{qc_reason_for, PipelineStage, ProcessingError, Result};
use crate::models::{FailOptions, GeneratedImage, JobConfiguration, ProcessingSettings, QcStatus};
use crate::repository::Repository;
use crate::transform::{EncodeOptions, ImageTransformer};
use crate::utils::{self, performance::Timer};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Sub-directory of the temp root processed files are staged in
pub const PROCESSING_DIR: &str = "processing";

/// One image to push through the pipeline
#[derive(Debug, Clone)]
pub struct PostProcessRequest {
    pub image: GeneratedImage,
    pub source_path: PathBuf,
    pub settings: ProcessingSettings,
    pub include_metadata: bool,
    pub job_configuration: JobConfiguration,
    pub use_original_settings: bool,
    pub fail_options: FailOptions,
}

/// How a stage ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Applied,
    /// Failed, and the pipeline carried on without it
    SoftFailed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub stage: PipelineStage,
    #[serde(flatten)]
    pub status: StepStatus,
}

/// Result of one run; failures carry a `processing_failed:<stage>` reason
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostProcessOutcome {
    pub success: bool,
    pub steps: Vec<StepRecord>,
    pub processed_image_path: Option<PathBuf>,
    pub error: Option<String>,
    pub qc_reason: Option<String>,
}

/// Attribute `error` to `stage` unless it already names it
fn tagged(stage: PipelineStage, error: ProcessingError) -> ProcessingError {
    match error.pipeline_stage() {
        Some(existing) if existing == stage => error,
        _ => ProcessingError::stage(stage, error.to_string()),
    }
}

/// Runs the retry post-processing pipeline
pub struct PostProcessingRunner {
    repository: Arc<dyn Repository>,
    transformer: Arc<dyn ImageTransformer>,
    background_remover: Option<Arc<dyn BackgroundRemover>>,
    metadata_generator: Option<Arc<dyn MetadataGenerator>>,
    secret_store: Option<Arc<dyn SecretStore>>,
    path_defaults: PathDefaults,
}

impl PostProcessingRunner {
    pub fn new(
        repository: Arc<dyn Repository>,
        transformer: Arc<dyn ImageTransformer>,
        path_defaults: PathDefaults,
    ) -> Self {
        Self {
            repository,
            transformer,
            background_remover: None,
            metadata_generator: None,
            secret_store: None,
            path_defaults,
        }
    }

    pub fn with_background_remover(mut self, remover: Arc<dyn BackgroundRemover>) -> Self {
        self.background_remover = Some(remover);
        self
    }

    pub fn with_metadata_generator(mut self, generator: Arc<dyn MetadataGenerator>) -> Self {
        self.metadata_generator = Some(generator);
        self
    }

    /// Credentials for background removal when the configuration has none
    pub fn with_secret_store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.secret_store = Some(store);
        self
    }

    fn temp_root(&self, config: &JobConfiguration) -> PathBuf {
        utils::paths::non_empty(config.file_paths.temp_directory.as_ref())
            .cloned()
            .unwrap_or_else(|| self.path_defaults.temp_directory.clone())
    }

    fn output_root(&self, config: &JobConfiguration) -> PathBuf {
        utils::paths::non_empty(config.file_paths.output_directory.as_ref())
            .cloned()
            .unwrap_or_else(|| self.path_defaults.output_directory.clone())
    }

    /// Process one image; never returns an error, failures are reported in
    /// the outcome
    #[instrument(skip(self, request), fields(image_id = %request.image.id))]
    pub async fn run(&self, request: PostProcessRequest) -> PostProcessOutcome {
        let _timer = Timer::new(format!("post-process {}", request.image.id));
        let mut steps = Vec::new();

        match self.process(request, &mut steps).await {
            Ok(path) => {
                info!("Post-processing finished: {}", path.display());
                PostProcessOutcome {
                    success: true,
                    steps,
                    processed_image_path: Some(path),
                    error: None,
                    qc_reason: None,
                }
            }
            Err(e) => {
                let reason = qc_reason_for(&e);
                warn!("Post-processing failed ({}): {}", reason, e);
                PostProcessOutcome {
                    success: false,
                    steps,
                    processed_image_path: None,
                    error: Some(e.to_string()),
                    qc_reason: Some(reason),
                }
            }
        }
    }

    /// Apply an optional stage's result, soft-failing unless `stage` is a
    /// selected hard-fail step
    fn settle(
        stage: PipelineStage,
        result: Result<Vec<u8>>,
        current: &mut Vec<u8>,
        fail_options: &FailOptions,
        steps: &mut Vec<StepRecord>,
    ) -> Result<()> {
        match result {
            Ok(bytes) => {
                *current = bytes;
                steps.push(StepRecord {
                    stage,
                    status: StepStatus::Applied,
                });
                Ok(())
            }
            Err(e) if fail_options.is_hard(stage) => Err(tagged(stage, e)),
            Err(e) => {
                warn!("{} failed, continuing without it: {}", stage, e);
                steps.push(StepRecord {
                    stage,
                    status: StepStatus::SoftFailed {
                        error: e.to_string(),
                    },
                });
                Ok(())
            }
        }
    }

    async fn process(&self, request: PostProcessRequest, steps: &mut Vec<StepRecord>) -> Result<PathBuf> {
        let PostProcessRequest {
            mut image,
            source_path,
            settings,
            include_metadata,
            job_configuration,
            use_original_settings,
            fail_options,
        } = request;

        if !utils::file::is_file_accessible(&source_path).await {
            return Err(ProcessingError::FileNotFound { path: source_path });
        }
        let mut bytes = tokio::fs::read(&source_path).await?;

        if settings.remove_bg {
            match &self.background_remover {
                Some(remover) => {
                    let api_key = job_configuration.api_keys.remove_bg.clone().or_else(|| {
                        self.secret_store
                            .as_ref()
                            .and_then(|store| store.get_secret(REMOVE_BG_SERVICE))
                    });
                    let result = remover
                        .remove_background(bytes.clone(), &settings.remove_bg_size, api_key.as_deref())
                        .await;
                    Self::settle(PipelineStage::RemoveBg, result, &mut bytes, &fail_options, steps)?;
                }
                None => debug!("No background remover configured, skipping"),
            }
        }

        if settings.trim_transparent_background {
            let result = self.transformer.trim(bytes.clone()).await;
            Self::settle(PipelineStage::Trim, result, &mut bytes, &fail_options, steps)?;
        }

        if settings.image_enhancement {
            let result = self
                .transformer
                .enhance(bytes.clone(), settings.sharpening, settings.saturation)
                .await;
            Self::settle(PipelineStage::Enhancement, result, &mut bytes, &fail_options, steps)?;
        }

        // convert always hard-fails
        let options = EncodeOptions::from(&settings);
        let encoded = self
            .transformer
            .encode(bytes, &options)
            .await
            .map_err(|e| tagged(PipelineStage::Convert, e))?;

        let temp_root = self.temp_root(&job_configuration);
        let processing_dir = temp_root.join(PROCESSING_DIR);
        let stem = utils::file::stem_of(&source_path);
        let file_name = format!("{}.{}", stem, options.format.extension());
        let processed_path = processing_dir.join(&file_name);

        utils::file::ensure_directory_exists(&processing_dir)
            .await
            .map_err(|e| tagged(PipelineStage::Convert, e))?;
        tokio::fs::write(&processed_path, &encoded)
            .await
            .map_err(|e| tagged(PipelineStage::Convert, e.into()))?;
        steps.push(StepRecord {
            stage: PipelineStage::Convert,
            status: StepStatus::Applied,
        });

        let mut new_metadata = None;
        if include_metadata {
            match &self.metadata_generator {
                Some(generator) => {
                    let template = match &job_configuration.file_paths.metadata_prompt_file {
                        Some(path) if !path.as_os_str().is_empty() => {
                            match tokio::fs::read_to_string(path).await {
                                Ok(text) => Some(text),
                                Err(e) => {
                                    warn!("Metadata prompt file {} unreadable: {}", path.display(), e);
                                    None
                                }
                            }
                        }
                        _ => None,
                    };

                    let result = generator
                        .generate_metadata(&processed_path, &image.generation_prompt, template.as_deref())
                        .await;
                    match result {
                        Ok(metadata) => {
                            new_metadata = Some(metadata);
                            steps.push(StepRecord {
                                stage: PipelineStage::Metadata,
                                status: StepStatus::Applied,
                            });
                        }
                        Err(e) if fail_options.is_hard(PipelineStage::Metadata) => {
                            self.discard(&processed_path).await;
                            return Err(tagged(PipelineStage::Metadata, e));
                        }
                        Err(e) => {
                            warn!("Metadata regeneration failed, keeping existing metadata: {}", e);
                            steps.push(StepRecord {
                                stage: PipelineStage::Metadata,
                                status: StepStatus::SoftFailed {
                                    error: e.to_string(),
                                },
                            });
                        }
                    }
                }
                None => debug!("No metadata generator configured, skipping"),
            }
        }

        let output_root = self.output_root(&job_configuration);
        let final_path = match self.copy_to_output(&processed_path, &output_root, &file_name).await {
            Ok(path) => {
                steps.push(StepRecord {
                    stage: PipelineStage::SaveFinal,
                    status: StepStatus::Applied,
                });
                self.discard(&processed_path).await;
                path
            }
            Err(e) if fail_options.is_hard(PipelineStage::Convert) => {
                self.discard(&processed_path).await;
                return Err(tagged(PipelineStage::SaveFinal, e));
            }
            Err(e) => {
                warn!(
                    "Copy to output failed, keeping {} as the final image: {}",
                    source_path.display(),
                    e
                );
                steps.push(StepRecord {
                    stage: PipelineStage::SaveFinal,
                    status: StepStatus::SoftFailed {
                        error: e.to_string(),
                    },
                });
                self.discard(&processed_path).await;
                source_path.clone()
            }
        };

        let mut source_removed = false;
        let temp_artifact = utils::paths::is_within(&source_path, &temp_root)
            && !utils::paths::is_within(&source_path, &output_root);
        if final_path != source_path && temp_artifact {
            match tokio::fs::remove_file(&source_path).await {
                Ok(()) => source_removed = true,
                Err(e) => warn!("Could not remove source {}: {}", source_path.display(), e),
            }
        } else {
            debug!("Source {} kept", source_path.display());
        }

        image.final_image_path = Some(final_path.clone());
        image.qc_status = QcStatus::Approved;
        image.qc_reason = None;
        if source_removed && image.temp_image_path.as_deref() == Some(source_path.as_path()) {
            image.temp_image_path = None;
        }
        if let Some(metadata) = new_metadata {
            image.metadata = Some(image.metadata.clone().unwrap_or_default().merged_with(&metadata));
        }
        if !use_original_settings {
            image.processing_settings = Some(settings.to_json()?);
        }
        self.repository.update_image(&image).await?;

        Ok(final_path)
    }

    async fn copy_to_output(&self, processed: &Path, output_root: &Path, file_name: &str) -> Result<PathBuf> {
        utils::file::ensure_directory_exists(output_root).await?;
        let destination = output_root.join(file_name);
        tokio::fs::copy(processed, &destination).await?;
        Ok(destination)
    }

    async fn discard(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            debug!("Could not remove staged file {}: {}", path.display(), e);
        }
    }
}
