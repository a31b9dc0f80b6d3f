//! End-to-end run on a synthetic frame-folder dataset: index, split, train,
//! evaluate, then rebuild the test split from the manifest.

use candle_core::Device;
use deepfake_core::{BackboneScale, ExperimentConfig, Label};
use deepfake_data::{index_videos, split_dataset, DatasetSplit, SplitManifest};
use deepfake_trainer::training::evaluate::evaluate_checkpoint;
use deepfake_trainer::training::trainer::train;
use image::{Rgb, RgbImage};
use std::path::Path;
use tempfile::TempDir;

const VIDEOS_PER_CLASS: usize = 5;
const FRAMES_PER_VIDEO: usize = 4;

fn write_dataset(root: &Path) {
    for label in Label::ALL {
        let base: u8 = match label {
            Label::Real => 40,
            Label::Fake => 200,
        };
        for v in 0..VIDEOS_PER_CLASS {
            let dir = root.join(label.dir_name()).join(format!("video_{v:02}"));
            std::fs::create_dir_all(&dir).unwrap();
            for f in 0..FRAMES_PER_VIDEO {
                let img = RgbImage::from_fn(20, 20, |x, y| {
                    Rgb([
                        base.wrapping_add((x * 2) as u8),
                        base.wrapping_add((y * 2) as u8),
                        base.wrapping_add((f * 5 + v) as u8),
                    ])
                });
                img.save(dir.join(format!("frame_{f:03}.jpg"))).unwrap();
            }
        }
    }
}

fn tiny_config(tmp: &Path) -> ExperimentConfig {
    let mut config = ExperimentConfig::default();
    config.data.root = tmp.join("faces");
    config.data.frames_per_video = 2;
    config.data.resize = 16;
    config.data.crop_size = 12;
    config.data.num_workers = 0;

    config.model.backbone_scale = Some(BackboneScale {
        width: 0.25,
        depth: 0.25,
    });
    config.model.lstm_hidden = 4;
    config.model.head_hidden = 4;
    config.model.pretrained.enabled = false;

    config.training.checkpoint_path = tmp.join("models").join("detector.safetensors");
    config.training.batch_size = 3;
    config.training.max_epochs = 2;
    config.training.learning_rate = 1e-3;
    config.validate().unwrap();
    config
}

#[test]
fn test_index_split_train_evaluate() {
    let tmp = TempDir::new().unwrap();
    let config = tiny_config(tmp.path());
    write_dataset(&config.data.root);
    let device = Device::Cpu;

    let samples = index_videos(&config.data).unwrap();
    assert_eq!(samples.len(), 2 * VIDEOS_PER_CLASS);
    let split = split_dataset(samples, &config.data, config.training.seed);
    assert_eq!(split.sizes().train, 8);
    assert_eq!(split.sizes().val, 1);
    assert_eq!(split.sizes().test, 1);

    let outcome = train(&config, &split, &device, None).unwrap();
    assert!(!outcome.history.is_empty() && outcome.history.len() <= 2);
    assert!(outcome.history[0].improved, "first epoch always saves");
    let last_improved = outcome.history.iter().rev().find(|e| e.improved).map(|e| e.epoch);
    assert_eq!(outcome.best_epoch, last_improved);
    for epoch in &outcome.history {
        assert!(epoch.train_loss.is_finite());
        assert!((0.0..=1.0).contains(&epoch.train_accuracy));
        assert_eq!(epoch.val_metrics.total(), 1);
    }
    assert!(config.training.checkpoint_path.exists());
    assert!(config.training.split_manifest_path().exists());

    let metrics = evaluate_checkpoint(&config, &split.test, &device).unwrap();
    assert_eq!(metrics.total(), 1);
    assert!((0.0..=1.0).contains(&metrics.accuracy));

    // the manifest reproduces the same test videos and the same score
    let manifest = SplitManifest::load(&config.training.split_manifest_path()).unwrap();
    let rebuilt = DatasetSplit::from_manifest(index_videos(&config.data).unwrap(), &manifest).unwrap();
    assert_eq!(rebuilt.test, split.test);
    let again = evaluate_checkpoint(&config, &rebuilt.test, &device).unwrap();
    assert_eq!(again, metrics);
}

#[test]
fn test_class_weights_with_prefetch_workers() {
    let tmp = TempDir::new().unwrap();
    let mut config = tiny_config(tmp.path());
    config.data.num_workers = 2;
    config.training.use_class_weights = true;
    config.training.max_epochs = 1;
    write_dataset(&config.data.root);

    let samples = index_videos(&config.data).unwrap();
    let split = split_dataset(samples, &config.data, 7);
    let outcome = train(&config, &split, &Device::Cpu, None).unwrap();

    assert_eq!(outcome.history.len(), 1);
    assert!(!outcome.stopped_early);
    assert_eq!(outcome.best_epoch, Some(1));
    assert!(outcome.checkpoint_path.exists());
}
