//! Resolves the configuration and settings a past image was produced with

use crate::config::PathDefaults;
use crate::error::Result;
use crate::models::{GeneratedImage, JobConfiguration, ProcessingSettings};
use crate::repository::Repository;
use crate::utils;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Looks up the job configuration behind an image, falling back to defaults
#[derive(Clone)]
pub struct ConfigResolver {
    repository: Arc<dyn Repository>,
    path_defaults: PathDefaults,
    retry_delay: Duration,
}

impl ConfigResolver {
    pub fn new(repository: Arc<dyn Repository>, path_defaults: PathDefaults, retry_delay: Duration) -> Self {
        Self {
            repository,
            path_defaults,
            retry_delay,
        }
    }

    /// Read through `lookup`, trying once more after the retry delay when the
    /// first read errors or finds nothing
    async fn lookup_with_retry<T, F, Fut>(&self, what: &str, lookup: F) -> Option<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        match lookup().await {
            Ok(Some(found)) => return Some(found),
            Ok(None) => debug!("{} not found, retrying once", what),
            Err(e) => debug!("{} lookup failed ({}), retrying once", what, e),
        }

        tokio::time::sleep(self.retry_delay).await;

        match lookup().await {
            Ok(found) => found,
            Err(e) => {
                warn!("{} lookup failed after retry: {}", what, e);
                None
            }
        }
    }

    /// Configuration the image's execution ran with, credentials excluded.
    ///
    /// Never fails: a missing execution, an execution without a saved
    /// configuration, or a configuration that cannot be read all yield
    /// [`ConfigResolver::get_fallback_configuration`].
    pub async fn get_original_job_configuration(&self, image: &GeneratedImage) -> JobConfiguration {
        let execution_id = image.execution_id;
        let execution = self
            .lookup_with_retry("Execution", || self.repository.get_execution(execution_id))
            .await;

        let Some(execution) = execution else {
            info!("No execution {} for image {}, using fallback configuration", execution_id, image.id);
            return self.get_fallback_configuration();
        };

        let Some(configuration_id) = execution.configuration_id else {
            info!("Execution {} has no saved configuration, using fallback", execution_id);
            return self.get_fallback_configuration();
        };

        let configuration = self
            .lookup_with_retry("Configuration", || self.repository.get_configuration(configuration_id))
            .await;

        match configuration {
            Some(saved) => self.correct_paths(saved.settings.without_credentials()),
            None => {
                warn!(
                    "Configuration {} of execution {} is missing, using fallback",
                    configuration_id, execution_id
                );
                self.get_fallback_configuration()
            }
        }
    }

    /// Default configuration with this machine's default paths
    pub fn get_fallback_configuration(&self) -> JobConfiguration {
        self.correct_paths(JobConfiguration::default())
    }

    /// Settings recorded on the image, with a default for anything missing
    pub fn get_original_processing_settings(&self, image: &GeneratedImage) -> ProcessingSettings {
        parse_processing_settings(image.processing_settings.as_deref())
    }

    /// Replace unset output/temp directories with platform defaults; custom
    /// paths are kept as they are
    pub fn correct_paths(&self, mut config: JobConfiguration) -> JobConfiguration {
        let paths = &mut config.file_paths;
        if utils::paths::non_empty(paths.output_directory.as_ref()).is_none() {
            paths.output_directory = Some(self.path_defaults.output_directory.clone());
        }
        if utils::paths::non_empty(paths.temp_directory.as_ref()).is_none() {
            paths.temp_directory = Some(self.path_defaults.temp_directory.clone());
        }
        config
    }
}

fn field<'a>(object: &'a Map<String, Value>, camel: &str, snake: &str) -> Option<&'a Value> {
    object.get(camel).or_else(|| object.get(snake))
}

fn as_bool(value: Option<&Value>, default: bool) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(default),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            _ => default,
        },
        _ => default,
    }
}

fn as_number(value: Option<&Value>) -> Option<f64> {
    let number = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|n| n.is_finite())
}

fn as_f32_in(value: Option<&Value>, min: f32, max: f32, default: f32) -> f32 {
    as_number(value)
        .map(|n| (n as f32).clamp(min, max))
        .unwrap_or(default)
}

fn as_quality(value: Option<&Value>, default: u8) -> u8 {
    as_number(value)
        .map(|n| n.round().clamp(1.0, 100.0) as u8)
        .unwrap_or(default)
}

fn as_string(value: Option<&Value>, default: &str) -> String {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        _ => default.to_string(),
    }
}

/// Parse a stored `processingSettings` JSON blob field by field.
///
/// Accepts camelCase or snake_case keys, booleans written as strings or
/// numbers, and numbers written as strings. Anything unreadable takes the
/// default; numeric values are clamped to their valid ranges.
pub fn parse_processing_settings(json: Option<&str>) -> ProcessingSettings {
    let defaults = ProcessingSettings::default();

    let parsed = json
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| serde_json::from_str::<Value>(s).ok());

    let Some(Value::Object(object)) = parsed else {
        if json.is_some() {
            debug!("Stored processing settings unreadable, using defaults");
        }
        return defaults;
    };
    let o = &object;

    ProcessingSettings {
        remove_bg: as_bool(field(o, "removeBg", "remove_bg"), defaults.remove_bg),
        remove_bg_size: as_string(field(o, "removeBgSize", "remove_bg_size"), &defaults.remove_bg_size),
        trim_transparent_background: as_bool(
            field(o, "trimTransparentBackground", "trim_transparent_background"),
            defaults.trim_transparent_background,
        ),
        image_enhancement: as_bool(
            field(o, "imageEnhancement", "image_enhancement"),
            defaults.image_enhancement,
        ),
        sharpening: as_f32_in(field(o, "sharpening", "sharpening"), 0.0, 10.0, defaults.sharpening),
        saturation: as_f32_in(field(o, "saturation", "saturation"), 0.0, 2.0, defaults.saturation),
        image_convert: as_bool(field(o, "imageConvert", "image_convert"), defaults.image_convert),
        convert_to_jpg: as_bool(field(o, "convertToJpg", "convert_to_jpg"), defaults.convert_to_jpg),
        convert_to_webp: as_bool(field(o, "convertToWebp", "convert_to_webp"), defaults.convert_to_webp),
        jpg_background: as_string(field(o, "jpgBackground", "jpg_background"), &defaults.jpg_background),
        jpg_quality: as_quality(field(o, "jpgQuality", "jpg_quality"), defaults.jpg_quality),
        png_quality: as_quality(field(o, "pngQuality", "png_quality"), defaults.png_quality),
        webp_quality: as_quality(field(o, "webpQuality", "webp_quality"), defaults.webp_quality),
    }
}
