//! Core data models for job executions, generated images and retries

use crate::error::PipelineStage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Identifier of one job execution
pub type ExecutionId = Uuid;
/// Identifier of a generated image
pub type ImageId = Uuid;
/// Identifier of a saved job configuration
pub type ConfigurationId = Uuid;
/// Identifier of a retry queue unit or batch
pub type RetryJobId = Uuid;

/// Immutable settings bundle a job runs with
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobConfiguration {
    pub api_keys: ApiKeys,
    pub file_paths: FilePaths,
    pub parameters: GenerationParameters,
    pub processing: ProcessingSettings,
    pub ai: AiOptions,
}

impl JobConfiguration {
    /// Copy with every credential removed, for persisted snapshots
    pub fn without_credentials(&self) -> Self {
        Self {
            api_keys: ApiKeys::default(),
            ..self.clone()
        }
    }

    /// Copy carrying the supplied live credentials
    pub fn with_credentials(&self, api_keys: ApiKeys) -> Self {
        Self {
            api_keys,
            ..self.clone()
        }
    }

    /// Clear advanced sampler options that are switched off so snapshots
    /// never carry stale values
    pub fn normalize_advanced(mut self) -> Self {
        if !self.parameters.advanced.enabled {
            self.parameters.advanced = AdvancedOptions::default();
        }
        self
    }

    /// The credential-stripped, normalized form stored alongside an execution
    pub fn snapshot(&self) -> Self {
        self.without_credentials().normalize_advanced()
    }
}

/// Credentials, never persisted
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiKeys {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_bg: Option<String>,
}

impl ApiKeys {
    pub fn is_empty(&self) -> bool {
        self.generation.is_none() && self.vision.is_none() && self.remove_bg.is_none()
    }
}

impl fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mask = |v: &Option<String>| v.as_ref().map(|_| "***");
        f.debug_struct("ApiKeys")
            .field("generation", &mask(&self.generation))
            .field("vision", &mask(&self.vision))
            .field("remove_bg", &mask(&self.remove_bg))
            .finish()
    }
}

/// File locations a job reads and writes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FilePaths {
    /// Final output tree; `None` or empty means "platform default"
    pub output_directory: Option<PathBuf>,
    /// Where freshly generated images land before post-processing
    pub temp_directory: Option<PathBuf>,
    pub system_prompt_file: Option<PathBuf>,
    pub keywords_file: Option<PathBuf>,
    pub quality_check_prompt_file: Option<PathBuf>,
    pub metadata_prompt_file: Option<PathBuf>,
}

/// Generation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GenerationParameters {
    pub model: String,
    pub aspect_ratios: Vec<String>,
    /// Number of generations (parameter sets) in one job
    pub count: u32,
    /// Images requested per generation
    pub variations: u32,
    pub keyword_random: bool,
    pub generation_retry_attempts: u32,
    pub generation_retry_backoff_ms: u64,
    pub polling_timeout_secs: u64,
    pub advanced: AdvancedOptions,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            aspect_ratios: vec!["1:1".to_string()],
            count: 1,
            variations: 1,
            keyword_random: false,
            generation_retry_attempts: 1,
            generation_retry_backoff_ms: 1000,
            polling_timeout_secs: 15 * 60,
            advanced: AdvancedOptions::default(),
        }
    }
}

/// Optional sampler controls, only honoured when `enabled`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdvancedOptions {
    pub enabled: bool,
    pub steps: Option<u32>,
    pub cfg_scale: Option<f32>,
    pub scheduler: Option<String>,
    pub negative_prompt: Option<String>,
    pub loras: Vec<String>,
}

/// Output format chosen for the converted image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Png,
    Jpg,
    Webp,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpg => "jpg",
            OutputFormat::Webp => "webp",
        }
    }
}

/// Post-processing options, also the per-image `processingSettings` snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProcessingSettings {
    pub remove_bg: bool,
    pub remove_bg_size: String,
    pub trim_transparent_background: bool,
    pub image_enhancement: bool,
    /// Unsharp-mask strength, 0..=10
    pub sharpening: f32,
    /// Saturation multiplier, 0..=2
    pub saturation: f32,
    pub image_convert: bool,
    pub convert_to_jpg: bool,
    pub convert_to_webp: bool,
    pub jpg_background: String,
    pub jpg_quality: u8,
    pub png_quality: u8,
    pub webp_quality: u8,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            remove_bg: false,
            remove_bg_size: "auto".to_string(),
            trim_transparent_background: false,
            image_enhancement: false,
            sharpening: 5.0,
            saturation: 1.4,
            image_convert: false,
            convert_to_jpg: false,
            convert_to_webp: false,
            jpg_background: "white".to_string(),
            jpg_quality: 100,
            png_quality: 100,
            webp_quality: 85,
        }
    }
}

impl ProcessingSettings {
    /// Format the convert stage encodes to
    pub fn output_format(&self) -> OutputFormat {
        if !self.image_convert {
            OutputFormat::Png
        } else if self.convert_to_jpg {
            OutputFormat::Jpg
        } else if self.convert_to_webp {
            OutputFormat::Webp
        } else {
            OutputFormat::Png
        }
    }

    /// Encoder quality for the chosen format
    pub fn quality(&self) -> u8 {
        match self.output_format() {
            OutputFormat::Png => self.png_quality,
            OutputFormat::Jpg => self.jpg_quality,
            OutputFormat::Webp => self.webp_quality,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// AI feature toggles
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AiOptions {
    pub run_quality_check: bool,
    pub run_metadata_gen: bool,
    pub vision_model: Option<String>,
}

/// A named configuration saved by the user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedConfiguration {
    pub id: ConfigurationId,
    pub name: String,
    pub settings: JobConfiguration,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SavedConfiguration {
    pub fn new(name: impl Into<String>, settings: JobConfiguration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            settings,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Execution lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Stopped => "stopped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "stopped" => Some(ExecutionStatus::Stopped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One run record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecution {
    pub id: ExecutionId,
    pub configuration_id: Option<ConfigurationId>,
    pub label: Option<String>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_images: u32,
    pub successful_images: u32,
    pub failed_images: u32,
    pub error_message: Option<String>,
    pub configuration_snapshot: Option<JobConfiguration>,
}

impl JobExecution {
    /// A fresh `running` record
    pub fn start(
        configuration_id: Option<ConfigurationId>,
        label: Option<String>,
        snapshot: Option<JobConfiguration>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            configuration_id,
            label,
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            total_images: 0,
            successful_images: 0,
            failed_images: 0,
            error_message: None,
            configuration_snapshot: snapshot,
        }
    }

    /// Human label, falling back to the short id
    pub fn display_label(&self) -> String {
        match &self.label {
            Some(label) if !label.trim().is_empty() => label.clone(),
            _ => format!("Job {}", &self.id.simple().to_string()[..8]),
        }
    }
}

/// Lifecycle state of a single image
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QcStatus {
    Approved,
    QcFailed,
    Processing,
    RetryFailed,
}

impl QcStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QcStatus::Approved => "approved",
            QcStatus::QcFailed => "qc_failed",
            QcStatus::Processing => "processing",
            QcStatus::RetryFailed => "retry_failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "approved" => Some(QcStatus::Approved),
            "qc_failed" => Some(QcStatus::QcFailed),
            "processing" => Some(QcStatus::Processing),
            "retry_failed" => Some(QcStatus::RetryFailed),
            _ => None,
        }
    }
}

impl fmt::Display for QcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Title, description and tags attached to an image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ImageMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

impl ImageMetadata {
    /// Overlay `newer` on top of `self`; empty fields keep the old value
    pub fn merged_with(&self, newer: &ImageMetadata) -> ImageMetadata {
        ImageMetadata {
            title: newer.title.clone().or_else(|| self.title.clone()),
            description: newer.description.clone().or_else(|| self.description.clone()),
            tags: if newer.tags.is_empty() {
                self.tags.clone()
            } else {
                newer.tags.clone()
            },
        }
    }
}

/// One produced image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedImage {
    pub id: ImageId,
    pub execution_id: ExecutionId,
    pub generation_prompt: String,
    pub seed: Option<i64>,
    pub qc_status: QcStatus,
    pub qc_reason: Option<String>,
    pub temp_image_path: Option<PathBuf>,
    pub final_image_path: Option<PathBuf>,
    pub metadata: Option<ImageMetadata>,
    /// JSON snapshot of the settings actually applied; historical rows may be
    /// missing fields or malformed
    pub processing_settings: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl GeneratedImage {
    pub fn new(execution_id: ExecutionId, generation_prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            generation_prompt: generation_prompt.into(),
            seed: None,
            qc_status: QcStatus::Approved,
            qc_reason: None,
            temp_image_path: None,
            final_image_path: None,
            metadata: None,
            processing_settings: None,
            created_at: Utc::now(),
        }
    }

    /// The final path, only when the image is approved
    pub fn ready_path(&self) -> Option<&PathBuf> {
        match self.qc_status {
            QcStatus::Approved => self.final_image_path.as_ref(),
            _ => None,
        }
    }
}

/// Which stages must hard-fail instead of falling back
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailOptions {
    pub enabled: bool,
    pub steps: Vec<PipelineStage>,
}

impl FailOptions {
    pub fn hard_fail_on(steps: impl IntoIterator<Item = PipelineStage>) -> Self {
        Self {
            enabled: true,
            steps: steps.into_iter().collect(),
        }
    }

    /// True when `stage` failures must propagate
    pub fn is_hard(&self, stage: PipelineStage) -> bool {
        self.enabled && self.steps.contains(&stage)
    }
}

/// Retry unit lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RetryJobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Everything needed to reprocess one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRequest {
    pub image_id: ImageId,
    pub use_original_settings: bool,
    pub modified_settings: Option<ProcessingSettings>,
    pub include_metadata: bool,
    pub fail_options: FailOptions,
}

/// Queue unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryJob {
    pub id: RetryJobId,
    pub batch_id: RetryJobId,
    pub request: RetryRequest,
    pub status: RetryJobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl RetryJob {
    pub fn new(batch_id: RetryJobId, request: RetryRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_id,
            request,
            status: RetryJobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn image_id(&self) -> ImageId {
        self.request.image_id
    }
}

/// Structured result of reprocessing one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryOutcome {
    pub success: bool,
    pub message: Option<String>,
    pub error: Option<String>,
    pub qc_reason: Option<String>,
    pub processed_image_path: Option<PathBuf>,
}

impl RetryOutcome {
    pub fn succeeded(message: impl Into<String>, processed_image_path: Option<PathBuf>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
            qc_reason: None,
            processed_image_path,
        }
    }

    pub fn failed(error: impl Into<String>, qc_reason: Option<String>) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.into()),
            qc_reason,
            processed_image_path: None,
        }
    }
}

/// A pending whole-job rerun
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRerunQueueEntry {
    pub job_id: ExecutionId,
    pub label: String,
    pub configuration: JobConfiguration,
    pub configuration_id: ConfigurationId,
    pub original_job_ids: Vec<ExecutionId>,
}
