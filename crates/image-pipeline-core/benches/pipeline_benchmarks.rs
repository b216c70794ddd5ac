//! Benchmarks for the hot pure functions of the pipeline

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use image_pipeline_core::clients::{FailedItem, GenerationOutput, ProcessedImage};
use image_pipeline_core::config_resolver::parse_processing_settings;
use image_pipeline_core::engine::normalize_output;
use image_pipeline_core::{PipelineStage, ProcessingSettings};
use std::path::PathBuf;
use uuid::Uuid;

fn benchmark_normalize_output(c: &mut Criterion) {
    let execution_id = Uuid::new_v4();
    let settings = ProcessingSettings::default();

    c.bench_function("normalize_batch_output", |b| {
        b.iter(|| {
            let output = GenerationOutput::Batch {
                processed: (0..8)
                    .map(|i| ProcessedImage::at(format!("/out/image_{}.png", i)))
                    .collect(),
                failed: vec![FailedItem {
                    path: Some(PathBuf::from("/tmp/failed.png")),
                    stage: PipelineStage::RemoveBg,
                    error: "provider error".to_string(),
                }],
            };
            normalize_output(execution_id, "a red fox", &settings, black_box(output))
        });
    });
}

fn benchmark_settings_parsing(c: &mut Criterion) {
    let current = ProcessingSettings::default().to_json().unwrap();
    let legacy = r#"{"trim_transparent_background":"true","sharpening":"7","jpgQuality":"250"}"#;

    c.bench_function("parse_current_settings", |b| {
        b.iter(|| parse_processing_settings(black_box(Some(current.as_str()))))
    });

    c.bench_function("parse_legacy_settings", |b| {
        b.iter(|| parse_processing_settings(black_box(Some(legacy))))
    });

    c.bench_function("parse_malformed_settings", |b| {
        b.iter(|| parse_processing_settings(black_box(Some("{broken"))))
    });
}

criterion_group!(benches, benchmark_normalize_output, benchmark_settings_parsing);
criterion_main!(benches);
