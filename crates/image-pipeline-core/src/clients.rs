//! External collaborators of the pipeline and their default implementations
//!
//! The engine and post-processing runner only see the traits defined here.
//! Concrete HTTP clients for generation providers, vision models and
//! background removal live outside this crate; the implementations below
//! cover the file- and process-based setups the CLI supports.

use crate::error::{PipelineStage, ProcessingError, Result};
use crate::models::{
    AdvancedOptions, ApiKeys, ExecutionId, ImageMetadata, JobConfiguration, ProcessingSettings,
};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Prompt and context produced for one generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptParameters {
    pub prompt: String,
    pub aspect_ratio: String,
    pub keyword: Option<String>,
    /// Extra context handed to the metadata generator
    pub context: Option<String>,
}

/// Produces the prompt for generation `index` of a job
#[async_trait]
pub trait ParameterGenerator: Send + Sync {
    async fn generate_parameters(
        &self,
        config: &JobConfiguration,
        index: u32,
    ) -> Result<PromptParameters>;
}

/// Naming information the generator uses to place its files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingContext {
    pub execution_id: ExecutionId,
    /// 1-based generation number
    pub generation: u32,
}

impl NamingContext {
    /// File stem shared by every variation of this generation
    pub fn file_stem(&self) -> String {
        format!(
            "{}_{:03}",
            &self.execution_id.simple().to_string()[..8],
            self.generation
        )
    }
}

/// One call to the image generator
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub parameters: PromptParameters,
    pub model: String,
    pub variations: u32,
    pub advanced: AdvancedOptions,
    pub output_directory: PathBuf,
    pub processing: ProcessingSettings,
    pub naming: NamingContext,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

/// An image the generator already post-processed
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProcessedImage {
    pub path: PathBuf,
    /// Pre-processing location, when the generator kept one
    pub temp_path: Option<PathBuf>,
    pub seed: Option<i64>,
    pub metadata: Option<ImageMetadata>,
    pub settings: Option<ProcessingSettings>,
}

impl ProcessedImage {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

/// A variation that failed inside the generator's own processing
#[derive(Debug, Clone, PartialEq)]
pub struct FailedItem {
    pub path: Option<PathBuf>,
    pub stage: PipelineStage,
    pub error: String,
}

/// The shapes a generator may return
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutput {
    Path(PathBuf),
    Paths(Vec<PathBuf>),
    Batch {
        processed: Vec<ProcessedImage>,
        failed: Vec<FailedItem>,
    },
}

impl GenerationOutput {
    /// Flatten into processed and failed items
    pub fn into_parts(self) -> (Vec<ProcessedImage>, Vec<FailedItem>) {
        match self {
            GenerationOutput::Path(path) => (vec![ProcessedImage::at(path)], Vec::new()),
            GenerationOutput::Paths(paths) => {
                (paths.into_iter().map(ProcessedImage::at).collect(), Vec::new())
            }
            GenerationOutput::Batch { processed, failed } => (processed, failed),
        }
    }
}

/// The (costly) image generation call
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput>;
}

/// Removes the background from encoded image bytes
#[async_trait]
pub trait BackgroundRemover: Send + Sync {
    async fn remove_background(
        &self,
        image: Vec<u8>,
        size: &str,
        api_key: Option<&str>,
    ) -> Result<Vec<u8>>;
}

/// Produces title, description and tags for an image
#[async_trait]
pub trait MetadataGenerator: Send + Sync {
    async fn generate_metadata(
        &self,
        image_path: &Path,
        prompt: &str,
        template: Option<&str>,
    ) -> Result<ImageMetadata>;
}

/// Verdict of an AI quality check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityVerdict {
    pub passed: bool,
    pub reason: Option<String>,
}

/// Judges whether a generated image is usable
#[async_trait]
pub trait QualityChecker: Send + Sync {
    async fn check(&self, image_path: &Path, prompt: &str) -> Result<QualityVerdict>;
}

pub const GENERATION_SERVICE: &str = "generation";
pub const VISION_SERVICE: &str = "vision";
pub const REMOVE_BG_SERVICE: &str = "remove_bg";

/// Resolves credentials by service name at job start
pub trait SecretStore: Send + Sync {
    fn get_secret(&self, service: &str) -> Option<String>;

    fn api_keys(&self) -> ApiKeys {
        ApiKeys {
            generation: self.get_secret(GENERATION_SERVICE),
            vision: self.get_secret(VISION_SERVICE),
            remove_bg: self.get_secret(REMOVE_BG_SERVICE),
        }
    }
}

/// Reads `IMAGE_PIPELINE_<SERVICE>_API_KEY`
#[derive(Debug, Clone, Default)]
pub struct EnvSecretStore;

impl EnvSecretStore {
    pub fn variable_name(service: &str) -> String {
        format!("IMAGE_PIPELINE_{}_API_KEY", service.to_ascii_uppercase())
    }
}

impl SecretStore for EnvSecretStore {
    fn get_secret(&self, service: &str) -> Option<String> {
        std::env::var(Self::variable_name(service))
            .ok()
            .filter(|value| !value.trim().is_empty())
    }
}

/// Fixed secrets, for embedding and tests
#[derive(Debug, Clone, Default)]
pub struct MemorySecretStore {
    secrets: HashMap<String, String>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, service: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(service.into(), value.into());
        self
    }
}

impl SecretStore for MemorySecretStore {
    fn get_secret(&self, service: &str) -> Option<String> {
        self.secrets.get(service).cloned()
    }
}

const KEYWORD_PLACEHOLDER: &str = "{keyword}";

/// Builds prompts from a keywords file and an optional system-prompt template.
///
/// Keywords are one per line; blank lines and `#` comments are skipped.
/// Generation `index` uses keyword `index % len`, or a random one when
/// `keywordRandom` is set. Aspect ratios cycle the same way.
#[derive(Debug, Clone, Default)]
pub struct PromptFileParameterGenerator;

impl PromptFileParameterGenerator {
    pub fn new() -> Self {
        Self
    }

    async fn read_keywords(path: &Path) -> Result<Vec<String>> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            ProcessingError::ParameterGenerationFailed {
                message: format!("Failed to read keywords file {}: {}", path.display(), e),
            }
        })?;

        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect())
    }
}

/// Fill `{keyword}` in a template, appending the keyword when absent
pub fn render_prompt(template: &str, keyword: &str) -> String {
    let template = template.trim();
    if template.is_empty() {
        keyword.to_string()
    } else if template.contains(KEYWORD_PLACEHOLDER) {
        template.replace(KEYWORD_PLACEHOLDER, keyword)
    } else {
        format!("{} {}", template, keyword)
    }
}

#[async_trait]
impl ParameterGenerator for PromptFileParameterGenerator {
    async fn generate_parameters(
        &self,
        config: &JobConfiguration,
        index: u32,
    ) -> Result<PromptParameters> {
        let keywords_file = config.file_paths.keywords_file.as_ref().ok_or_else(|| {
            ProcessingError::ParameterGenerationFailed {
                message: "No keywords file configured".to_string(),
            }
        })?;

        let keywords = Self::read_keywords(keywords_file).await?;
        if keywords.is_empty() {
            return Err(ProcessingError::ParameterGenerationFailed {
                message: format!("Keywords file {} is empty", keywords_file.display()),
            });
        }

        let position = if config.parameters.keyword_random {
            rand::rng().random_range(0..keywords.len())
        } else {
            index as usize % keywords.len()
        };
        let keyword = keywords[position].clone();

        let template = match &config.file_paths.system_prompt_file {
            Some(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
                ProcessingError::ParameterGenerationFailed {
                    message: format!("Failed to read system prompt {}: {}", path.display(), e),
                }
            })?,
            None => String::new(),
        };

        let ratios = &config.parameters.aspect_ratios;
        let aspect_ratio = if ratios.is_empty() {
            "1:1".to_string()
        } else {
            ratios[index as usize % ratios.len()].clone()
        };

        Ok(PromptParameters {
            prompt: render_prompt(&template, &keyword),
            aspect_ratio,
            context: Some(keyword.clone()),
            keyword: Some(keyword),
        })
    }
}

/// Runs an external generator program per generation.
///
/// The prompt and naming context are passed through `IMAGE_PIPELINE_*`
/// environment variables. Each non-empty stdout line is an image path
/// (relative paths resolve against the output directory); a line of the form
/// `FAILED <stage> <path|-> <message>` reports a variation that failed inside
/// the generator.
#[derive(Debug, Clone)]
pub struct CommandImageGenerator {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandImageGenerator {
    /// Parse a command line and resolve its program on `PATH`
    pub fn from_command_line(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace();
        let program = parts.next().ok_or_else(|| ProcessingError::ConfigError {
            message: "Generator command is empty".to_string(),
        })?;

        let program = which::which(program).map_err(|e| ProcessingError::ConfigError {
            message: format!("Generator program '{}' not found: {}", program, e),
        })?;

        Ok(Self {
            program,
            args: parts.map(str::to_string).collect(),
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self, request: &GenerationRequest) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("IMAGE_PIPELINE_PROMPT", &request.parameters.prompt)
            .env("IMAGE_PIPELINE_ASPECT_RATIO", &request.parameters.aspect_ratio)
            .env("IMAGE_PIPELINE_MODEL", &request.model)
            .env("IMAGE_PIPELINE_VARIATIONS", request.variations.to_string())
            .env("IMAGE_PIPELINE_OUTPUT_DIR", &request.output_directory)
            .env("IMAGE_PIPELINE_EXECUTION_ID", request.naming.execution_id.to_string())
            .env("IMAGE_PIPELINE_GENERATION", request.naming.generation.to_string())
            .env("IMAGE_PIPELINE_FILE_STEM", request.naming.file_stem())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(key) = &request.api_key {
            command.env("IMAGE_PIPELINE_API_KEY", key);
        }

        if request.advanced.enabled {
            if let Some(steps) = request.advanced.steps {
                command.env("IMAGE_PIPELINE_STEPS", steps.to_string());
            }
            if let Some(cfg_scale) = request.advanced.cfg_scale {
                command.env("IMAGE_PIPELINE_CFG_SCALE", cfg_scale.to_string());
            }
            if let Some(scheduler) = &request.advanced.scheduler {
                command.env("IMAGE_PIPELINE_SCHEDULER", scheduler);
            }
            if let Some(negative) = &request.advanced.negative_prompt {
                command.env("IMAGE_PIPELINE_NEGATIVE_PROMPT", negative);
            }
        }

        command
    }
}

/// Interpret generator stdout
pub fn parse_generator_output(stdout: &str, output_directory: &Path) -> GenerationOutput {
    let resolve = |raw: &str| {
        let path = PathBuf::from(raw);
        if path.is_absolute() {
            path
        } else {
            output_directory.join(path)
        }
    };

    let mut processed = Vec::new();
    let mut failed = Vec::new();

    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(rest) = line.strip_prefix("FAILED ") {
            let mut fields = rest.splitn(3, ' ');
            let stage = fields
                .next()
                .and_then(PipelineStage::parse)
                .unwrap_or(PipelineStage::Qc);
            let path = fields.next().filter(|p| *p != "-").map(resolve);
            let error = fields.next().unwrap_or("generator reported a failure").to_string();
            failed.push(FailedItem { path, stage, error });
        } else {
            processed.push(ProcessedImage::at(resolve(line)));
        }
    }

    if failed.is_empty() {
        GenerationOutput::Paths(processed.into_iter().map(|p| p.path).collect())
    } else {
        GenerationOutput::Batch { processed, failed }
    }
}

#[async_trait]
impl ImageGenerator for CommandImageGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput> {
        tokio::fs::create_dir_all(&request.output_directory).await?;

        let child = self
            .command(request)
            .spawn()
            .map_err(|e| ProcessingError::GenerationFailed {
                message: format!("Failed to start {}: {}", self.program.display(), e),
            })?;

        let output = tokio::time::timeout(request.timeout, child.wait_with_output())
            .await
            .map_err(|_| ProcessingError::Timeout)??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProcessingError::GenerationFailed {
                message: format!("Generator exited with {}: {}", output.status, stderr.trim()),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let result = parse_generator_output(&stdout, &request.output_directory);
        let (processed, failed) = result.clone().into_parts();
        if processed.is_empty() && failed.is_empty() {
            return Err(ProcessingError::GenerationFailed {
                message: "Generator produced no images".to_string(),
            });
        }

        tracing::debug!(
            "Generator produced {} image(s), {} failure(s)",
            processed.len(),
            failed.len()
        );
        Ok(result)
    }
}
