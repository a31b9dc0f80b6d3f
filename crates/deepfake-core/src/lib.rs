//! Core types for the deepfake video detector.
//!
//! This crate holds everything the other workspace crates agree on: the
//! dataset sample model, the immutable [`ExperimentConfig`] and its
//! sections, and the shared [`DeepfakeError`] type.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Number of output classes (real, fake).
pub const NUM_CLASSES: usize = 2;

// ---------------------------------------------------------------------------
// Dataset types
// ---------------------------------------------------------------------------

/// Ground-truth class of a video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    /// Authentic footage.
    Real,
    /// Manipulated footage.
    Fake,
}

impl Label {
    /// Labels in class-index order.
    pub const ALL: [Label; NUM_CLASSES] = [Label::Real, Label::Fake];

    /// Class index used as the training target.
    #[must_use]
    pub fn index(self) -> u32 {
        match self {
            Self::Real => 0,
            Self::Fake => 1,
        }
    }

    /// Name of the class subdirectory under the dataset root.
    #[must_use]
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Real => "real",
            Self::Fake => "fake",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// One indexed video: its frame images in playback order and its label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSample {
    /// Directory holding the frames of this video.
    pub dir: PathBuf,
    /// Frame image paths, sorted.
    pub frames: Vec<PathBuf>,
    /// Ground-truth class.
    pub label: Label,
}

impl VideoSample {
    /// Number of frames available for sampling.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

/// Per-class sample counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCounts {
    pub real: usize,
    pub fake: usize,
}

impl ClassCounts {
    /// Count the labels of `samples`.
    #[must_use]
    pub fn from_samples(samples: &[VideoSample]) -> Self {
        let mut counts = Self::default();
        for sample in samples {
            counts.add(sample.label);
        }
        counts
    }

    pub fn add(&mut self, label: Label) {
        match label {
            Label::Real => self.real += 1,
            Label::Fake => self.fake += 1,
        }
    }

    #[must_use]
    pub fn get(&self, label: Label) -> usize {
        match label {
            Label::Real => self.real,
            Label::Fake => self.fake,
        }
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.real + self.fake
    }
}

// ---------------------------------------------------------------------------
// Configuration types
// ---------------------------------------------------------------------------

/// Complete, immutable configuration of one experiment run.
///
/// Every component receives the section it needs by reference; nothing reads
/// configuration from globals.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Dataset layout, sampling and augmentation.
    pub data: DataConfig,
    /// Network architecture and pretrained weights.
    pub model: ModelConfig,
    /// Optimisation, scheduling and checkpointing.
    pub training: TrainingConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl ExperimentConfig {
    /// Check cross-field constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`DeepfakeError::Config`] describing the first violated rule.
    pub fn validate(&self) -> Result<()> {
        let data = &self.data;
        if data.frames_per_video == 0 {
            return Err(config_err("data.frames_per_video must be at least 1"));
        }
        if let Some(min) = data.min_frames {
            if min < data.frames_per_video {
                return Err(config_err(format!(
                    "data.min_frames ({min}) must not be below data.frames_per_video ({})",
                    data.frames_per_video
                )));
            }
        }
        if data.frame_extensions.is_empty() {
            return Err(config_err("data.frame_extensions must not be empty"));
        }
        if data.crop_size == 0 || data.crop_size > data.resize {
            return Err(config_err(format!(
                "data.crop_size ({}) must be in 1..={}",
                data.crop_size, data.resize
            )));
        }
        let fractions_ok = data.train_fraction > 0.0
            && data.train_fraction < 1.0
            && data.val_fraction >= 0.0
            && data.val_fraction < 1.0
            && data.train_fraction + data.val_fraction <= 1.0;
        if !fractions_ok {
            return Err(config_err(format!(
                "invalid split fractions: train={} val={}",
                data.train_fraction, data.val_fraction
            )));
        }

        if !(0.0..=1.0).contains(&data.augment.hflip_prob) {
            return Err(config_err("data.augment.hflip_prob must be in [0, 1]"));
        }

        let model = &self.model;
        if model.trainable_from_stage > BACKBONE_STAGES {
            return Err(config_err(format!(
                "model.trainable_from_stage ({}) exceeds the {BACKBONE_STAGES} backbone stages",
                model.trainable_from_stage
            )));
        }
        if !(0.0..1.0).contains(&model.dropout) {
            return Err(config_err("model.dropout must be in [0, 1)"));
        }
        let (width, depth) = model.backbone_multipliers();
        if width <= 0.0 || depth <= 0.0 {
            return Err(config_err("backbone multipliers must be positive"));
        }
        if model.lstm_hidden == 0 || model.head_hidden == 0 {
            return Err(config_err("model hidden sizes must be non-zero"));
        }

        let training = &self.training;
        if training.batch_size == 0 {
            return Err(config_err("training.batch_size must be at least 1"));
        }
        if training.max_epochs == 0 {
            return Err(config_err("training.max_epochs must be at least 1"));
        }
        if training.learning_rate <= 0.0 {
            return Err(config_err("training.learning_rate must be positive"));
        }
        if training.max_grad_norm <= 0.0 {
            return Err(config_err("training.max_grad_norm must be positive"));
        }
        if !(0.0..1.0).contains(&training.scheduler.factor) {
            return Err(config_err("training.scheduler.factor must be in [0, 1)"));
        }
        Ok(())
    }
}

fn config_err(msg: impl Into<String>) -> DeepfakeError {
    DeepfakeError::Config(msg.into())
}

/// Dataset layout, frame sampling and image pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Root directory containing `real/` and `fake/` subdirectories.
    pub root: PathBuf,
    /// Frames fed to the model per video.
    pub frames_per_video: usize,
    /// Minimum frame count for a video to be indexed. Defaults to
    /// `frames_per_video`.
    pub min_frames: Option<usize>,
    /// Accepted frame file extensions (case-sensitive, without the dot).
    pub frame_extensions: Vec<String>,
    /// Square side frames are resized to before cropping.
    pub resize: u32,
    /// Square side of the crop fed to the backbone.
    pub crop_size: u32,
    /// Fraction of videos assigned to the training split.
    pub train_fraction: f64,
    /// Fraction of videos assigned to the validation split.
    pub val_fraction: f64,
    /// Background decode threads. `0` decodes on the training thread.
    pub num_workers: usize,
    /// Batches prepared ahead of consumption.
    pub prefetch_batches: usize,
    /// Training-time augmentation.
    pub augment: AugmentConfig,
    /// Per-channel normalisation mean (RGB).
    pub mean: [f32; 3],
    /// Per-channel normalisation standard deviation (RGB).
    pub std: [f32; 3],
}

impl DataConfig {
    /// Minimum frame count a video needs to be indexed.
    #[must_use]
    pub fn effective_min_frames(&self) -> usize {
        self.min_frames
            .unwrap_or(self.frames_per_video)
            .max(self.frames_per_video)
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/faces"),
            frames_per_video: 16,
            min_frames: None,
            frame_extensions: vec!["jpg".to_string()],
            resize: 256,
            crop_size: 224,
            train_fraction: 0.8,
            val_fraction: 0.1,
            num_workers: 2,
            prefetch_batches: 2,
            augment: AugmentConfig::default(),
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }
}

/// Random augmentation applied to training frames only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    /// Probability of a horizontal flip.
    pub hflip_prob: f64,
    /// Brightness factor is drawn from `[1 - b, 1 + b]`.
    pub brightness: f32,
    /// Contrast factor is drawn from `[1 - c, 1 + c]`.
    pub contrast: f32,
    /// Saturation factor is drawn from `[1 - s, 1 + s]`.
    pub saturation: f32,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            hflip_prob: 0.5,
            brightness: 0.1,
            contrast: 0.1,
            saturation: 0.1,
        }
    }
}

/// Number of MBConv stages in the EfficientNet backbone.
pub const BACKBONE_STAGES: usize = 7;

/// EfficientNet compound-scaling variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackboneVariant {
    B0,
    B1,
    B2,
    #[default]
    B3,
}

impl BackboneVariant {
    /// `(width, depth)` multipliers applied to the B0 stage table.
    #[must_use]
    pub fn multipliers(&self) -> (f64, f64) {
        match self {
            Self::B0 => (1.0, 1.0),
            Self::B1 => (1.0, 1.1),
            Self::B2 => (1.1, 1.2),
            Self::B3 => (1.2, 1.4),
        }
    }
}

/// Explicit width/depth multipliers, mostly for small CPU runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackboneScale {
    pub width: f64,
    pub depth: f64,
}

/// Network architecture settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Backbone scaling variant.
    pub backbone: BackboneVariant,
    /// Overrides the multipliers of `backbone` when set.
    pub backbone_scale: Option<BackboneScale>,
    /// First backbone stage whose parameters are trained. Earlier stages and
    /// the stem stay frozen.
    pub trainable_from_stage: usize,
    /// Whether the final 1x1 backbone convolution is trained.
    pub train_head_conv: bool,
    /// Hidden size of each LSTM direction.
    pub lstm_hidden: usize,
    /// Hidden width of the classifier head.
    pub head_hidden: usize,
    /// Dropout probability inside the classifier head.
    pub dropout: f32,
    /// Pretrained backbone weights.
    pub pretrained: PretrainedConfig,
}

impl ModelConfig {
    /// `(width, depth)` multipliers the backbone is built with.
    #[must_use]
    pub fn backbone_multipliers(&self) -> (f64, f64) {
        match self.backbone_scale {
            Some(scale) => (scale.width, scale.depth),
            None => self.backbone.multipliers(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backbone: BackboneVariant::B3,
            backbone_scale: None,
            trainable_from_stage: 4,
            train_head_conv: false,
            lstm_hidden: 512,
            head_hidden: 512,
            dropout: 0.5,
            pretrained: PretrainedConfig::default(),
        }
    }
}

/// Where pretrained backbone weights come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PretrainedConfig {
    /// Load pretrained weights at all.
    pub enabled: bool,
    /// HuggingFace model ID holding a timm-format `model.safetensors`.
    pub model_id: String,
    /// Local safetensors file; takes precedence over `model_id`.
    pub weights_path: Option<PathBuf>,
    /// Optional cache directory for downloaded weights.
    pub cache_dir: Option<PathBuf>,
}

impl Default for PretrainedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model_id: "timm/efficientnet_b3.ra2_in1k".to_string(),
            weights_path: None,
            cache_dir: None,
        }
    }
}

/// Optimisation and checkpointing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Best-model checkpoint, overwritten on every improvement.
    pub checkpoint_path: PathBuf,
    pub batch_size: usize,
    pub max_epochs: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// Weight the loss by inverse class frequency.
    pub use_class_weights: bool,
    /// Global gradient-norm ceiling.
    pub max_grad_norm: f64,
    /// Epochs without strict validation improvement before stopping.
    pub patience: usize,
    /// Learning-rate plateau scheduler.
    pub scheduler: PlateauConfig,
    /// Seed for the dataset split, shuffling and augmentation.
    pub seed: u64,
}

impl TrainingConfig {
    /// Path of the split manifest written next to the checkpoint.
    #[must_use]
    pub fn split_manifest_path(&self) -> PathBuf {
        self.checkpoint_path.with_extension("split.json")
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            checkpoint_path: PathBuf::from("models/deepfake_detector.safetensors"),
            batch_size: 10,
            max_epochs: 50,
            learning_rate: 5e-5,
            weight_decay: 1e-2,
            use_class_weights: false,
            max_grad_norm: 1.0,
            patience: 10,
            scheduler: PlateauConfig::default(),
            seed: 42,
        }
    }
}

/// Reduce-on-plateau settings (maximising validation accuracy).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlateauConfig {
    /// Multiplier applied to the learning rate on a plateau.
    pub factor: f64,
    /// Epochs without improvement tolerated before reducing.
    pub patience: usize,
    /// Relative improvement required to count as better.
    pub threshold: f64,
    /// Lower bound for the learning rate.
    pub min_lr: f64,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            factor: 0.5,
            patience: 3,
            threshold: 1e-4,
            min_lr: 0.0,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: `text` (human-readable) or `json` (structured).
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Load an [`ExperimentConfig`] from a YAML file and validate it.
///
/// Missing sections and fields take their defaults.
///
/// # Errors
///
/// Returns an error if the file cannot be read, the YAML is invalid, or the
/// resulting configuration fails [`ExperimentConfig::validate`].
pub fn load_config(path: &Path) -> Result<ExperimentConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        DeepfakeError::Config(format!(
            "Failed to read config file {}: {e}",
            path.display()
        ))
    })?;
    let config: ExperimentConfig = serde_yaml::from_str(&contents)
        .map_err(|e| DeepfakeError::Config(format!("Failed to parse config YAML: {e}")))?;
    config.validate()?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Core error types.
#[derive(thiserror::Error, Debug)]
pub enum DeepfakeError {
    /// Indexing found no usable videos.
    #[error("No videos found under {}; check data.root", root.display())]
    EmptyDataset {
        /// The scanned dataset root.
        root: PathBuf,
    },

    /// Dataset indexing, splitting or batching error.
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Frame decoding or transformation error.
    #[error("Image error: {0}")]
    Image(String),

    /// Model construction or tensor computation error.
    #[error("Model error: {0}")]
    Model(String),

    /// Checkpoint save or load error.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization / deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias for `std::result::Result<T, DeepfakeError>`.
pub type Result<T> = std::result::Result<T, DeepfakeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_yaml(yaml: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_defaults_match_reference_run() {
        let cfg = ExperimentConfig::default();
        assert_eq!(cfg.data.frames_per_video, 16);
        assert_eq!(cfg.data.effective_min_frames(), 16);
        assert_eq!(cfg.training.batch_size, 10);
        assert_eq!(cfg.training.max_epochs, 50);
        assert!((cfg.training.learning_rate - 5e-5).abs() < 1e-12);
        assert!((cfg.training.weight_decay - 1e-2).abs() < 1e-12);
        assert!(!cfg.training.use_class_weights);
        assert_eq!(cfg.training.patience, 10);
        assert_eq!(cfg.training.scheduler.patience, 3);
        assert_eq!(cfg.model.trainable_from_stage, 4);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_config_partial_yaml() {
        let yaml = r#"
data:
  root: "/tmp/faces"
  frames_per_video: 8
training:
  max_epochs: 3
  seed: 7
model:
  backbone: b0
  backbone_scale:
    width: 0.25
    depth: 0.5
"#;
        let f = write_yaml(yaml);
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.data.root, PathBuf::from("/tmp/faces"));
        assert_eq!(cfg.data.frames_per_video, 8);
        assert_eq!(cfg.data.crop_size, 224);
        assert_eq!(cfg.training.max_epochs, 3);
        assert_eq!(cfg.training.seed, 7);
        assert_eq!(cfg.training.batch_size, 10);
        assert_eq!(cfg.model.backbone, BackboneVariant::B0);
        assert_eq!(cfg.model.backbone_multipliers(), (0.25, 0.5));
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn test_example_config_matches_defaults() {
        let yaml = include_str!("../../../config/experiment.example.yaml");
        let cfg: ExperimentConfig = serde_yaml::from_str(yaml).unwrap();
        cfg.validate().unwrap();
        let defaults = ExperimentConfig::default();
        assert_eq!(cfg.data.root, defaults.data.root);
        assert_eq!(cfg.data.frame_extensions, defaults.data.frame_extensions);
        assert_eq!(cfg.model.backbone, defaults.model.backbone);
        assert_eq!(cfg.model.pretrained.model_id, defaults.model.pretrained.model_id);
        assert_eq!(cfg.training.checkpoint_path, defaults.training.checkpoint_path);
        assert_eq!(cfg.training.max_epochs, defaults.training.max_epochs);
        assert!((cfg.training.learning_rate - defaults.training.learning_rate).abs() < 1e-12);
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config(Path::new("/nonexistent/experiment.yaml"));
        assert!(matches!(result, Err(DeepfakeError::Config(_))));
    }

    #[test]
    fn test_load_config_invalid_yaml() {
        let f = write_yaml("data: [valid: yaml: {{{}}}");
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_validate_rejects_min_frames_below_sample_count() {
        let mut cfg = ExperimentConfig::default();
        cfg.data.min_frames = Some(8);
        assert!(cfg.validate().is_err());
        cfg.data.min_frames = Some(32);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.data.effective_min_frames(), 32);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = ExperimentConfig::default();
        cfg.data.crop_size = 300;
        assert!(cfg.validate().is_err());

        let mut cfg = ExperimentConfig::default();
        cfg.data.train_fraction = 0.95;
        assert!(cfg.validate().is_err());

        let mut cfg = ExperimentConfig::default();
        cfg.training.batch_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ExperimentConfig::default();
        cfg.model.trainable_from_stage = BACKBONE_STAGES + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_split_manifest_path_sits_next_to_checkpoint() {
        let cfg = TrainingConfig::default();
        assert_eq!(
            cfg.split_manifest_path(),
            PathBuf::from("models/deepfake_detector.split.json")
        );
    }

    #[test]
    fn test_label_indices_and_counts() {
        assert_eq!(Label::Real.index(), 0);
        assert_eq!(Label::Fake.index(), 1);
        assert_eq!(Label::Fake.to_string(), "fake");

        let samples: Vec<VideoSample> = [Label::Real, Label::Fake, Label::Fake]
            .into_iter()
            .map(|label| VideoSample {
                dir: PathBuf::from("v"),
                frames: vec![],
                label,
            })
            .collect();
        let counts = ClassCounts::from_samples(&samples);
        assert_eq!(counts.real, 1);
        assert_eq!(counts.fake, 2);
        assert_eq!(counts.get(Label::Fake), 2);
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn test_empty_dataset_error_message() {
        let err = DeepfakeError::EmptyDataset {
            root: PathBuf::from("/data/faces"),
        };
        assert!(err.to_string().contains("/data/faces"));
    }
}
