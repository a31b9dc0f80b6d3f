//! Test-set evaluation of a saved checkpoint.

use super::checkpoint::load_checkpoint;
use super::metrics::ClassificationMetrics;
use super::trainer::{build_loader, predict_pass};
use candle_core::Device;
use deepfake_core::{ExperimentConfig, Result, VideoSample};
use deepfake_data::TransformMode;
use deepfake_model::{DeepfakeDetector, ModelVars};
use tracing::{info, warn};

/// Build a fresh detector, load `config.training.checkpoint_path` into it
/// and score one inference pass over `test`.
///
/// An empty test split yields accuracy 0.0 without touching the checkpoint.
///
/// # Errors
///
/// Fails if the checkpoint is missing or does not match `config.model`, or
/// if a frame cannot be decoded.
pub fn evaluate_checkpoint(
    config: &ExperimentConfig,
    test: &[VideoSample],
    device: &Device,
) -> Result<ClassificationMetrics> {
    if test.is_empty() {
        warn!("Test split is empty; reporting accuracy 0.0");
        return Ok(ClassificationMetrics::default());
    }

    let vars = ModelVars::new();
    let model = DeepfakeDetector::new(&config.model, &vars, device)?;
    load_checkpoint(&vars, &config.training.checkpoint_path, device)?;

    let loader = build_loader(test, config, TransformMode::Eval)?;
    let metrics = predict_pass(&model, &loader, device)?.metrics();
    info!(
        videos = test.len(),
        accuracy = metrics.accuracy,
        path = %config.training.checkpoint_path.display(),
        "Test evaluation: {metrics}"
    );
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use deepfake_core::{DeepfakeError, Label};
    use std::path::PathBuf;

    #[test]
    fn test_empty_split_reports_zero() {
        let config = ExperimentConfig::default();
        let metrics = evaluate_checkpoint(&config, &[], &Device::Cpu).unwrap();
        assert_eq!(metrics.accuracy, 0.0);
        assert_eq!(metrics.total(), 0);
    }

    #[test]
    fn test_missing_checkpoint_fails() {
        let mut config = ExperimentConfig::default();
        config.model.backbone_scale = Some(deepfake_core::BackboneScale {
            width: 0.25,
            depth: 0.25,
        });
        config.model.lstm_hidden = 4;
        config.model.head_hidden = 4;
        config.training.checkpoint_path = PathBuf::from("/nonexistent/best.safetensors");
        let test = vec![VideoSample {
            dir: PathBuf::from("/nonexistent/real/v"),
            frames: vec![PathBuf::from("/nonexistent/real/v/0.jpg")],
            label: Label::Real,
        }];
        let err = evaluate_checkpoint(&config, &test, &Device::Cpu).unwrap_err();
        assert!(matches!(err, DeepfakeError::Checkpoint(_)));
    }
}
