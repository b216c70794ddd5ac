//! Scriptable collaborator doubles for tests and dry runs

use crate::clients::{
    BackgroundRemover, GenerationOutput, GenerationRequest, ImageGenerator, MetadataGenerator,
    ParameterGenerator, PromptParameters, QualityChecker, QualityVerdict,
};
use crate::error::{PipelineStage, ProcessingError, Result};
use crate::models::{ImageId, ImageMetadata, JobConfiguration, RetryOutcome, RetryRequest};
use crate::queue::RetryJobProcessor;
use crate::transform::{EncodeOptions, ImageTransformer};
use async_trait::async_trait;
use image::{DynamicImage, Rgba, RgbaImage};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// PNG bytes of a red square inside a transparent border
pub fn test_png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut image = RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 0]));
    for x in (width / 4)..(width - width / 4).max(width / 4 + 1) {
        for y in (height / 4)..(height - height / 4).max(height / 4 + 1) {
            image.put_pixel(x, y, Rgba([220, 30, 30, 255]));
        }
    }

    let mut buffer = std::io::Cursor::new(Vec::new());
    // encoding an in-memory RGBA buffer to PNG cannot fail
    let _ = DynamicImage::ImageRgba8(image).write_to(&mut buffer, image::ImageFormat::Png);
    buffer.into_inner()
}

/// Write a small test PNG, creating parent directories
pub async fn write_test_png(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, test_png_bytes(16, 16)).await?;
    Ok(())
}

/// Prompts `prompt <generation>`; can fail at chosen generations
#[derive(Debug, Default)]
pub struct MockParameterGenerator {
    failing: HashSet<u32>,
    calls: AtomicU32,
}

impl MockParameterGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail for generation number `generation` (1-based)
    pub fn failing_at(mut self, generation: u32) -> Self {
        self.failing.insert(generation);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ParameterGenerator for MockParameterGenerator {
    async fn generate_parameters(
        &self,
        config: &JobConfiguration,
        index: u32,
    ) -> Result<PromptParameters> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let generation = index + 1;
        if self.failing.contains(&generation) {
            return Err(ProcessingError::ParameterGenerationFailed {
                message: format!("mock failure for generation {}", generation),
            });
        }

        Ok(PromptParameters {
            prompt: format!("prompt {}", generation),
            aspect_ratio: config
                .parameters
                .aspect_ratios
                .first()
                .cloned()
                .unwrap_or_else(|| "1:1".to_string()),
            keyword: None,
            context: None,
        })
    }
}

/// Writes one PNG per requested variation into the output directory
#[derive(Default)]
pub struct MockImageGenerator {
    failing: HashSet<u32>,
    transient_failures: AtomicU32,
    cancel_after: Option<(u32, CancellationToken)>,
    scripted: Mutex<HashMap<u32, GenerationOutput>>,
    delay: Option<Duration>,
    calls: AtomicU32,
}

impl MockImageGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail generation number `generation` (1-based) permanently
    pub fn failing_at(mut self, generation: u32) -> Self {
        self.failing.insert(generation);
        self
    }

    /// Fail the first `times` calls with a recoverable error
    pub fn failing_times(self, times: u32) -> Self {
        self.transient_failures.store(times, Ordering::SeqCst);
        self
    }

    /// Cancel `token` once generation `generation` has produced its images
    pub fn cancel_after(mut self, generation: u32, token: CancellationToken) -> Self {
        self.cancel_after = Some((generation, token));
        self
    }

    /// Return `output` verbatim for generation `generation`
    pub fn with_output(self, generation: u32, output: GenerationOutput) -> Self {
        if let Ok(mut scripted) = self.scripted.lock() {
            scripted.insert(generation, output);
        }
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageGenerator for MockImageGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let generation = request.naming.generation;

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ProcessingError::GenerationFailed {
                message: "mock provider unavailable".to_string(),
            });
        }

        if self.failing.contains(&generation) {
            return Err(ProcessingError::InvalidInput {
                message: format!("mock provider rejected generation {}", generation),
            });
        }

        let scripted = self
            .scripted
            .lock()
            .ok()
            .and_then(|mut scripted| scripted.remove(&generation));

        let output = match scripted {
            Some(output) => output,
            None => {
                tokio::fs::create_dir_all(&request.output_directory).await?;
                let mut paths = Vec::new();
                for variation in 1..=request.variations {
                    let path = request
                        .output_directory
                        .join(format!("{}_{}.png", request.naming.file_stem(), variation));
                    write_test_png(&path).await?;
                    paths.push(path);
                }
                GenerationOutput::Paths(paths)
            }
        };

        if let Some((after, token)) = &self.cancel_after {
            if *after == generation {
                info!("Mock generator cancelling after generation {}", generation);
                token.cancel();
            }
        }

        Ok(output)
    }
}

/// Returns its input unchanged, or fails
#[derive(Debug, Default)]
pub struct MockBackgroundRemover {
    fail: bool,
}

impl MockBackgroundRemover {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self { fail: true }
    }
}

#[async_trait]
impl BackgroundRemover for MockBackgroundRemover {
    async fn remove_background(
        &self,
        image: Vec<u8>,
        _size: &str,
        _api_key: Option<&str>,
    ) -> Result<Vec<u8>> {
        if self.fail {
            return Err(ProcessingError::stage(
                PipelineStage::RemoveBg,
                "mock background removal failed",
            ));
        }
        Ok(image)
    }
}

/// Derives metadata from the prompt
#[derive(Debug, Default)]
pub struct MockMetadataGenerator {
    fail: bool,
    calls: AtomicU32,
}

impl MockMetadataGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataGenerator for MockMetadataGenerator {
    async fn generate_metadata(
        &self,
        _image_path: &Path,
        prompt: &str,
        template: Option<&str>,
    ) -> Result<ImageMetadata> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ProcessingError::stage(
                PipelineStage::Metadata,
                "mock vision model returned nothing",
            ));
        }

        Ok(ImageMetadata {
            title: Some(format!("Title for {}", prompt)),
            description: template.map(|t| t.trim().to_string()),
            tags: prompt.split_whitespace().map(str::to_string).collect(),
        })
    }
}

/// Fixed quality verdicts
#[derive(Debug)]
pub struct MockQualityChecker {
    verdict: Option<QualityVerdict>,
}

impl MockQualityChecker {
    pub fn passing() -> Self {
        Self {
            verdict: Some(QualityVerdict {
                passed: true,
                reason: None,
            }),
        }
    }

    pub fn rejecting(reason: &str) -> Self {
        Self {
            verdict: Some(QualityVerdict {
                passed: false,
                reason: Some(reason.to_string()),
            }),
        }
    }

    /// Every check errors out
    pub fn erroring() -> Self {
        Self { verdict: None }
    }
}

#[async_trait]
impl QualityChecker for MockQualityChecker {
    async fn check(&self, _image_path: &Path, _prompt: &str) -> Result<QualityVerdict> {
        self.verdict.clone().ok_or_else(|| ProcessingError::ProcessingFailed {
            message: "mock quality service unreachable".to_string(),
        })
    }
}

/// Pass-through transformer that fails on selected stages
#[derive(Debug, Default)]
pub struct MockTransformer {
    failing: HashSet<PipelineStage>,
}

impl MockTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(mut self, stage: PipelineStage) -> Self {
        self.failing.insert(stage);
        self
    }

    fn check(&self, stage: PipelineStage) -> Result<()> {
        if self.failing.contains(&stage) {
            return Err(ProcessingError::stage(stage, format!("mock {} failure", stage)));
        }
        Ok(())
    }
}

#[async_trait]
impl ImageTransformer for MockTransformer {
    async fn trim(&self, image: Vec<u8>) -> Result<Vec<u8>> {
        self.check(PipelineStage::Trim)?;
        Ok(image)
    }

    async fn enhance(&self, image: Vec<u8>, _sharpening: f32, _saturation: f32) -> Result<Vec<u8>> {
        self.check(PipelineStage::Enhancement)?;
        Ok(image)
    }

    async fn encode(&self, image: Vec<u8>, _options: &EncodeOptions) -> Result<Vec<u8>> {
        self.check(PipelineStage::Convert)?;
        Ok(image)
    }
}

/// Records the order retry requests arrive in
#[derive(Debug, Default)]
pub struct MockRetryProcessor {
    processed: Mutex<Vec<ImageId>>,
    failing: HashSet<ImageId>,
    delay: Option<Duration>,
}

impl MockRetryProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(mut self, image_id: ImageId) -> Self {
        self.failing.insert(image_id);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn processed(&self) -> Vec<ImageId> {
        self.processed
            .lock()
            .map(|processed| processed.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RetryJobProcessor for MockRetryProcessor {
    async fn process_image(&self, request: &RetryRequest) -> RetryOutcome {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Ok(mut processed) = self.processed.lock() {
            processed.push(request.image_id);
        }

        if self.failing.contains(&request.image_id) {
            RetryOutcome::failed("mock retry failure", Some(PipelineStage::Qc.qc_reason()))
        } else {
            RetryOutcome::succeeded("Retry processing successful", None)
        }
    }
}
