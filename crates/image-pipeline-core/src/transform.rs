//! Pixel transforms used by the post-processing stages

use crate::error::{PipelineStage, ProcessingError, Result};
use crate::models::{OutputFormat, ProcessingSettings};
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, GenericImageView, Rgb, RgbImage, RgbaImage};
use tracing::{debug, instrument};

/// Encoding parameters for the convert stage
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeOptions {
    pub format: OutputFormat,
    pub quality: u8,
    /// Colour alpha is flattened onto for formats without transparency
    pub background: String,
}

impl From<&ProcessingSettings> for EncodeOptions {
    fn from(settings: &ProcessingSettings) -> Self {
        Self {
            format: settings.output_format(),
            quality: settings.quality(),
            background: settings.jpg_background.clone(),
        }
    }
}

/// Buffer-in, buffer-out image transforms.
///
/// Every error is tagged with the stage it belongs to.
#[async_trait]
pub trait ImageTransformer: Send + Sync {
    /// Crop fully transparent borders
    async fn trim(&self, image: Vec<u8>) -> Result<Vec<u8>>;

    /// Sharpen (0..=10) and scale saturation (0..=2)
    async fn enhance(&self, image: Vec<u8>, sharpening: f32, saturation: f32) -> Result<Vec<u8>>;

    /// Encode to the requested output format
    async fn encode(&self, image: Vec<u8>, options: &EncodeOptions) -> Result<Vec<u8>>;
}

/// Default transformer on the `image` crate
#[derive(Debug, Clone, Default)]
pub struct RasterTransformer;

impl RasterTransformer {
    pub fn new() -> Self {
        Self
    }
}

async fn run_blocking<T, F>(stage: PipelineStage, task: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| ProcessingError::stage(stage, format!("Image task failed: {}", e)))?
}

fn decode(stage: PipelineStage, bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes)
        .map_err(|e| ProcessingError::stage(stage, format!("Failed to decode image: {}", e)))
}

fn encode_png(stage: PipelineStage, image: &DynamicImage) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    image
        .write_with_encoder(PngEncoder::new(&mut buffer))
        .map_err(|e| ProcessingError::stage(stage, format!("Failed to encode PNG: {}", e)))?;
    Ok(buffer)
}

/// Bounding box `(x, y, width, height)` of pixels with non-zero alpha
pub fn opaque_bounds(image: &RgbaImage) -> Option<(u32, u32, u32, u32)> {
    let (mut min_x, mut min_y) = (u32::MAX, u32::MAX);
    let (mut max_x, mut max_y) = (0u32, 0u32);
    let mut found = false;

    for (x, y, pixel) in image.enumerate_pixels() {
        if pixel[3] > 0 {
            found = true;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
    }

    found.then(|| (min_x, min_y, max_x - min_x + 1, max_y - min_y + 1))
}

/// Scale saturation around per-pixel luma
pub fn adjust_saturation(image: &mut RgbaImage, factor: f32) {
    for pixel in image.pixels_mut() {
        let [r, g, b, _] = pixel.0;
        let luma = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
        for channel in pixel.0.iter_mut().take(3) {
            let value = luma + (*channel as f32 - luma) * factor;
            *channel = value.round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Parse a background colour name or `#rrggbb`; unknown values are white
pub fn parse_background(value: &str) -> Rgb<u8> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "black" => Rgb([0, 0, 0]),
        "white" | "" => Rgb([255, 255, 255]),
        hex if hex.len() == 7 && hex.starts_with('#') => {
            let channel = |range: std::ops::Range<usize>| u8::from_str_radix(&hex[range], 16).ok();
            match (channel(1..3), channel(3..5), channel(5..7)) {
                (Some(r), Some(g), Some(b)) => Rgb([r, g, b]),
                _ => Rgb([255, 255, 255]),
            }
        }
        _ => Rgb([255, 255, 255]),
    }
}

fn flatten(image: &RgbaImage, background: Rgb<u8>) -> RgbImage {
    let mut flat = RgbImage::new(image.width(), image.height());
    for (x, y, pixel) in image.enumerate_pixels() {
        let alpha = pixel[3] as f32 / 255.0;
        let blend = |fg: u8, bg: u8| (fg as f32 * alpha + bg as f32 * (1.0 - alpha)).round() as u8;
        flat.put_pixel(
            x,
            y,
            Rgb([
                blend(pixel[0], background[0]),
                blend(pixel[1], background[1]),
                blend(pixel[2], background[2]),
            ]),
        );
    }
    flat
}

#[async_trait]
impl ImageTransformer for RasterTransformer {
    #[instrument(skip(self, image), fields(bytes = image.len()))]
    async fn trim(&self, image: Vec<u8>) -> Result<Vec<u8>> {
        run_blocking(PipelineStage::Trim, move || {
            let decoded = decode(PipelineStage::Trim, &image)?;
            if !decoded.color().has_alpha() {
                debug!("Image has no alpha channel, nothing to trim");
                return Ok(image);
            }

            let rgba = decoded.to_rgba8();
            let (x, y, width, height) = opaque_bounds(&rgba).ok_or_else(|| {
                ProcessingError::stage(PipelineStage::Trim, "Image has no opaque pixels")
            })?;

            if (width, height) == decoded.dimensions() {
                return Ok(image);
            }

            debug!("Trimming to {}x{} at ({}, {})", width, height, x, y);
            let cropped = DynamicImage::ImageRgba8(rgba).crop_imm(x, y, width, height);
            encode_png(PipelineStage::Trim, &cropped)
        })
        .await
    }

    #[instrument(skip(self, image), fields(bytes = image.len()))]
    async fn enhance(&self, image: Vec<u8>, sharpening: f32, saturation: f32) -> Result<Vec<u8>> {
        let sharpening = sharpening.clamp(0.0, 10.0);
        let saturation = saturation.clamp(0.0, 2.0);

        run_blocking(PipelineStage::Enhancement, move || {
            let mut decoded = decode(PipelineStage::Enhancement, &image)?;

            if sharpening > 0.0 {
                decoded = decoded.unsharpen(0.5 + sharpening * 0.15, 1);
            }

            let mut rgba = decoded.to_rgba8();
            if (saturation - 1.0).abs() > f32::EPSILON {
                adjust_saturation(&mut rgba, saturation);
            }

            encode_png(PipelineStage::Enhancement, &DynamicImage::ImageRgba8(rgba))
        })
        .await
    }

    #[instrument(skip(self, image, options), fields(format = ?options.format))]
    async fn encode(&self, image: Vec<u8>, options: &EncodeOptions) -> Result<Vec<u8>> {
        let options = options.clone();

        run_blocking(PipelineStage::Convert, move || {
            let decoded = decode(PipelineStage::Convert, &image)?;
            let mut buffer = Vec::new();

            let written = match options.format {
                OutputFormat::Png => decoded.write_with_encoder(PngEncoder::new(&mut buffer)),
                OutputFormat::Jpg => {
                    let flat = flatten(&decoded.to_rgba8(), parse_background(&options.background));
                    let quality = options.quality.clamp(1, 100);
                    DynamicImage::ImageRgb8(flat)
                        .write_with_encoder(JpegEncoder::new_with_quality(&mut buffer, quality))
                }
                OutputFormat::Webp => DynamicImage::ImageRgba8(decoded.to_rgba8())
                    .write_with_encoder(WebPEncoder::new_lossless(&mut buffer)),
            };

            written.map_err(|e| {
                ProcessingError::stage(
                    PipelineStage::Convert,
                    format!("Failed to encode {}: {}", options.format.extension(), e),
                )
            })?;
            Ok(buffer)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn png_bytes(image: RgbaImage) -> Vec<u8> {
        encode_png(PipelineStage::Convert, &DynamicImage::ImageRgba8(image)).unwrap()
    }

    fn framed_image() -> RgbaImage {
        let mut image = RgbaImage::from_pixel(10, 8, Rgba([0, 0, 0, 0]));
        for x in 2..6 {
            for y in 3..5 {
                image.put_pixel(x, y, Rgba([200, 40, 40, 255]));
            }
        }
        image
    }

    #[test]
    fn test_opaque_bounds() {
        assert_eq!(opaque_bounds(&framed_image()), Some((2, 3, 4, 2)));
        let empty = RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 0]));
        assert_eq!(opaque_bounds(&empty), None);
    }

    #[test]
    fn test_parse_background() {
        assert_eq!(parse_background("black"), Rgb([0, 0, 0]));
        assert_eq!(parse_background("#ff8000"), Rgb([255, 128, 0]));
        assert_eq!(parse_background("#zzzzzz"), Rgb([255, 255, 255]));
        assert_eq!(parse_background("mauve"), Rgb([255, 255, 255]));
    }

    #[test]
    fn test_saturation_zero_is_grayscale() {
        let mut image = RgbaImage::from_pixel(1, 1, Rgba([200, 40, 40, 255]));
        adjust_saturation(&mut image, 0.0);
        let [r, g, b, a] = image.get_pixel(0, 0).0;
        assert_eq!(r, g);
        assert_eq!(g, b);
        assert_eq!(a, 255);
    }

    #[tokio::test]
    async fn test_trim_crops_transparent_border() {
        let transformer = RasterTransformer::new();
        let trimmed = transformer.trim(png_bytes(framed_image())).await.unwrap();

        let decoded = image::load_from_memory(&trimmed).unwrap();
        assert_eq!(decoded.dimensions(), (4, 2));
    }

    #[tokio::test]
    async fn test_trim_fully_transparent_is_trim_stage_error() {
        let transformer = RasterTransformer::new();
        let empty = RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 0]));

        let error = transformer.trim(png_bytes(empty)).await.unwrap_err();
        assert_eq!(error.pipeline_stage(), Some(PipelineStage::Trim));
    }

    #[tokio::test]
    async fn test_undecodable_input_is_tagged() {
        let transformer = RasterTransformer::new();
        let error = transformer
            .enhance(b"not an image".to_vec(), 5.0, 1.4)
            .await
            .unwrap_err();
        assert_eq!(error.pipeline_stage(), Some(PipelineStage::Enhancement));

        let options = EncodeOptions {
            format: OutputFormat::Jpg,
            quality: 90,
            background: "white".to_string(),
        };
        let error = transformer
            .encode(b"still not an image".to_vec(), &options)
            .await
            .unwrap_err();
        assert_eq!(error.pipeline_stage(), Some(PipelineStage::Convert));
    }

    #[tokio::test]
    async fn test_encode_formats() {
        let transformer = RasterTransformer::new();
        let source = png_bytes(framed_image());

        for format in [OutputFormat::Png, OutputFormat::Jpg, OutputFormat::Webp] {
            let options = EncodeOptions {
                format,
                quality: 90,
                background: "white".to_string(),
            };
            let encoded = transformer.encode(source.clone(), &options).await.unwrap();
            let guessed = image::guess_format(&encoded).unwrap();
            let expected = match format {
                OutputFormat::Png => image::ImageFormat::Png,
                OutputFormat::Jpg => image::ImageFormat::Jpeg,
                OutputFormat::Webp => image::ImageFormat::WebP,
            };
            assert_eq!(guessed, expected);
        }
    }
}
