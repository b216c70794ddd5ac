//! Error types for the job orchestration and retry engine

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;

/// Post-processing stage a failure is attributed to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    #[serde(alias = "removebg")]
    RemoveBg,
    Trim,
    #[serde(alias = "enhance")]
    Enhancement,
    Convert,
    Metadata,
    SaveFinal,
    Qc,
}

impl PipelineStage {
    /// Stable tag used in `failOptions.steps` and persisted qc reasons
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::RemoveBg => "remove_bg",
            PipelineStage::Trim => "trim",
            PipelineStage::Enhancement => "enhancement",
            PipelineStage::Convert => "convert",
            PipelineStage::Metadata => "metadata",
            PipelineStage::SaveFinal => "save_final",
            PipelineStage::Qc => "qc",
        }
    }

    /// Parse a stage tag, accepting the legacy `enhance` spelling
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "remove_bg" | "removebg" => Some(PipelineStage::RemoveBg),
            "trim" => Some(PipelineStage::Trim),
            "enhancement" | "enhance" => Some(PipelineStage::Enhancement),
            "convert" => Some(PipelineStage::Convert),
            "metadata" => Some(PipelineStage::Metadata),
            "save_final" => Some(PipelineStage::SaveFinal),
            "qc" => Some(PipelineStage::Qc),
            _ => None,
        }
    }

    /// The `processing_failed:<stage>` reason stored on a failed image
    pub fn qc_reason(&self) -> String {
        format!("processing_failed:{}", self.as_str())
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for pipeline operations
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{stage} stage failed: {message}")]
    Stage {
        stage: PipelineStage,
        message: String,
    },

    #[error("Processing failed: {message}")]
    ProcessingFailed { message: String },

    #[error("Image generation failed: {message}")]
    GenerationFailed { message: String },

    #[error("Parameter generation failed: {message}")]
    ParameterGenerationFailed { message: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Logging initialization failed: {message}")]
    LoggingError { message: String },

    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("A job is already running: {execution_id}")]
    JobAlreadyRunning { execution_id: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timeout occurred during operation")]
    Timeout,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProcessingError {
    /// Shorthand for a stage-tagged failure
    pub fn stage(stage: PipelineStage, message: impl Into<String>) -> Self {
        ProcessingError::Stage {
            stage,
            message: message.into(),
        }
    }

    /// Stage tag carried by this error, if any
    pub fn pipeline_stage(&self) -> Option<PipelineStage> {
        match self {
            ProcessingError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Get the error type as a string for categorization
    pub fn error_type(&self) -> &'static str {
        match self {
            ProcessingError::Io(_) => "io_error",
            ProcessingError::Stage { .. } => "stage_failed",
            ProcessingError::ProcessingFailed { .. } => "processing_failed",
            ProcessingError::GenerationFailed { .. } => "generation_failed",
            ProcessingError::ParameterGenerationFailed { .. } => "parameter_generation_failed",
            ProcessingError::ConfigError { .. } => "config_error",
            ProcessingError::LoggingError { .. } => "logging_error",
            ProcessingError::FileNotFound { .. } => "file_not_found",
            ProcessingError::NotFound { .. } => "not_found",
            ProcessingError::InvalidInput { .. } => "invalid_input",
            ProcessingError::JobAlreadyRunning { .. } => "job_already_running",
            ProcessingError::Cancelled => "cancelled",
            ProcessingError::Timeout => "timeout",
            ProcessingError::Database(_) => "database_error",
            ProcessingError::Serialization(_) => "serialization_error",
        }
    }

    /// Check if the error is worth one more attempt after a short delay
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProcessingError::Timeout
                | ProcessingError::NotFound { .. }
                | ProcessingError::Database(_)
                | ProcessingError::GenerationFailed { .. }
        )
    }
}

fn metadata_error_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(metadata|vision|title|description|tags)\b")
            .expect("metadata pattern is a valid regex")
    })
}

/// Derive the persisted qc reason for a failed retry.
///
/// Stage tags are authoritative. Untagged errors that read like a metadata
/// failure keep the historical `processing_failed:metadata` reason, anything
/// else is `processing_failed:qc`.
pub fn qc_reason_for(error: &ProcessingError) -> String {
    if let Some(stage) = error.pipeline_stage() {
        return stage.qc_reason();
    }
    if metadata_error_pattern().is_match(&error.to_string()) {
        return PipelineStage::Metadata.qc_reason();
    }
    PipelineStage::Qc.qc_reason()
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ProcessingError>;
