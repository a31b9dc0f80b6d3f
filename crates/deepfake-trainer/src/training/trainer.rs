//! Epoch loop for the video classifier.
//!
//! Each epoch moves through [`EpochPhase`]: training batches, a validation
//! pass, then the improvement check that may save the checkpoint, reduce
//! the learning rate or stop the run.

use super::checkpoint::save_checkpoint;
use super::loss::{class_weight_tensor, class_weights, cross_entropy};
use super::metrics::{ClassificationMetrics, Confusion};
use super::schedule::{EarlyStopping, PlateauScheduler, StopDecision};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use deepfake_core::{DeepfakeError, ExperimentConfig, Label, Result, VideoSample};
use deepfake_data::{
    DatasetSplit, FrameLoader, FrameTransform, HostBatch, LoaderOptions, SplitManifest,
    TransformMode,
};
use deepfake_model::{load_backbone_weights, DeepfakeDetector, ModelVars};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Added to the gradient norm before computing the clip coefficient.
const CLIP_EPS: f64 = 1e-6;

/// Loss and accuracy over one epoch of training batches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainStats {
    /// Mean of the per-batch losses.
    pub loss: f64,
    /// Correct predictions over all training videos.
    pub accuracy: f64,
}

/// Where the epoch loop is.
#[derive(Debug, Clone, PartialEq)]
pub enum EpochPhase {
    Training,
    Validating {
        train: TrainStats,
    },
    CheckingImprovement {
        train: TrainStats,
        val: ClassificationMetrics,
    },
    EpochAdvance,
    EarlyStopped,
}

/// Per-epoch record kept in the training history.
#[derive(Debug, Clone)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_metrics: ClassificationMetrics,
    /// Learning rate used during the epoch.
    pub learning_rate: f64,
    /// Validation accuracy beat every earlier epoch; the checkpoint was saved.
    pub improved: bool,
}

/// Result of a training run.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub history: Vec<EpochMetrics>,
    pub best_epoch: Option<usize>,
    pub best_val_accuracy: f64,
    pub stopped_early: bool,
    pub checkpoint_path: PathBuf,
}

/// Train a fresh detector on `split.train`, validating on `split.val` after
/// every epoch.
///
/// The split manifest is written next to the checkpoint before the first
/// epoch. When `pretrained_weights` is given the backbone is initialised from
/// it. The checkpoint is overwritten whenever validation accuracy strictly
/// exceeds every earlier epoch, so the file always holds the best model.
///
/// # Errors
///
/// Any decode, tensor or I/O error aborts the run.
pub fn train(
    config: &ExperimentConfig,
    split: &DatasetSplit,
    device: &Device,
    pretrained_weights: Option<&Path>,
) -> Result<TrainingOutcome> {
    let sizes = split.sizes();
    info!(
        total = split.total(),
        train = sizes.train,
        val = sizes.val,
        test = sizes.test,
        "Dataset sizes"
    );
    if split.train.is_empty() {
        return Err(DeepfakeError::Dataset(
            "training split is empty; add videos or raise data.train_fraction".to_string(),
        ));
    }
    if split.val.is_empty() {
        warn!("Validation split is empty; validation accuracy will be 0.0");
    }

    let manifest_path = config.training.split_manifest_path();
    SplitManifest::from_split(split).save(&manifest_path)?;
    debug!(path = %manifest_path.display(), "Split manifest written");

    let mut run = TrainingRun::new(config, split, device, pretrained_weights)?;
    run.fit()
}

/// Loader over `samples` configured from `config`. Training mode shuffles
/// every epoch and augments; evaluation mode keeps order.
pub fn build_loader(
    samples: &[VideoSample],
    config: &ExperimentConfig,
    mode: TransformMode,
) -> Result<FrameLoader> {
    let transform = match mode {
        TransformMode::Train => FrameTransform::train(&config.data),
        TransformMode::Eval => FrameTransform::eval(&config.data),
    };
    FrameLoader::new(
        samples.to_vec(),
        transform,
        LoaderOptions {
            batch_size: config.training.batch_size,
            frames_per_video: config.data.frames_per_video,
            shuffle: mode == TransformMode::Train,
            num_workers: config.data.num_workers,
            prefetch_batches: config.data.prefetch_batches,
            seed: config.training.seed,
        },
    )
}

/// Upload a host batch: frames `(B, T, C, H, W)` and labels `(B,)`.
pub(crate) fn batch_tensors(batch: HostBatch, device: &Device) -> Result<(Tensor, Tensor)> {
    let dims = batch.dims();
    let n = batch.labels.len();
    let frames = Tensor::from_vec(batch.frames, dims, device)
        .map_err(tensor_err("Failed to upload frames"))?;
    let labels =
        Tensor::from_vec(batch.labels, n, device).map_err(tensor_err("Failed to upload labels"))?;
    Ok((frames, labels))
}

/// Predicted class per row of `logits`.
pub(crate) fn predictions(logits: &Tensor) -> Result<Vec<u32>> {
    logits
        .argmax(D::Minus1)
        .and_then(|t| t.to_vec1::<u32>())
        .map_err(tensor_err("argmax failed"))
}

/// One inference pass over `loader` with the model in evaluation mode.
pub(crate) fn predict_pass(
    model: &DeepfakeDetector,
    loader: &FrameLoader,
    device: &Device,
) -> Result<Confusion> {
    let mut confusion = Confusion::default();
    for batch in loader.epoch(0)? {
        let batch = batch?;
        let labels = batch.labels.clone();
        let (frames, _) = batch_tensors(batch, device)?;
        let logits = model.forward_t(&frames, false)?;
        confusion.update(&predictions(&logits)?, &labels);
    }
    Ok(confusion)
}

/// Scale all gradients of `vars` so their global L2 norm is at most
/// `max_norm`. Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> candle_core::Result<f64> {
    let mut sum_sq = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var) {
            sum_sq += g.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        }
    }
    let total = sum_sq.sqrt();
    let coef = max_norm / (total + CLIP_EPS);
    if coef < 1.0 {
        for var in vars {
            let Some(g) = grads.get(var) else {
                continue;
            };
            let clipped = (g * coef)?;
            grads.insert(var, clipped);
        }
    }
    Ok(total)
}

fn tensor_err(context: &'static str) -> impl Fn(candle_core::Error) -> DeepfakeError {
    move |e| DeepfakeError::Model(format!("{context}: {e}"))
}

fn progress_bar(batches: usize, epoch: usize) -> ProgressBar {
    let pb = ProgressBar::new(batches as u64);
    let style = ProgressStyle::with_template(
        "  [epoch {prefix}] {elapsed_precise} {bar:40.cyan/blue} {pos}/{len} eta {eta} {msg}",
    )
    .map(|s| s.progress_chars("=>-"))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_prefix(epoch.to_string());
    pb
}

struct TrainingRun<'a> {
    config: &'a ExperimentConfig,
    device: Device,
    vars: ModelVars,
    model: DeepfakeDetector,
    trainable: Vec<Var>,
    optimizer: AdamW,
    class_weights: Option<Tensor>,
    train_loader: FrameLoader,
    val_loader: FrameLoader,
}

impl<'a> TrainingRun<'a> {
    fn new(
        config: &'a ExperimentConfig,
        split: &DatasetSplit,
        device: &Device,
        pretrained_weights: Option<&Path>,
    ) -> Result<Self> {
        let vars = ModelVars::new();
        let model = DeepfakeDetector::new(&config.model, &vars, device)?;
        match pretrained_weights {
            Some(path) => {
                load_backbone_weights(&vars, path, device)?;
            }
            None => warn!("No pretrained weights; backbone starts from random initialisation"),
        }
        let (frozen_params, trainable_params) = vars.parameter_counts()?;
        info!(frozen_params, trainable_params, "Model created");

        let class_weights = if config.training.use_class_weights {
            let counts = split.class_counts();
            let weights = class_weights(&counts);
            info!(
                real = weights[Label::Real.index() as usize],
                fake = weights[Label::Fake.index() as usize],
                "Using class weights"
            );
            Some(class_weight_tensor(&counts, device).map_err(tensor_err("Class weights"))?)
        } else {
            None
        };

        let trainable = vars.trainable_vars();
        let optimizer = AdamW::new(
            trainable.clone(),
            ParamsAdamW {
                lr: config.training.learning_rate,
                weight_decay: config.training.weight_decay,
                ..Default::default()
            },
        )
        .map_err(tensor_err("Failed to create optimizer"))?;

        Ok(Self {
            config,
            device: device.clone(),
            train_loader: build_loader(&split.train, config, TransformMode::Train)?,
            val_loader: build_loader(&split.val, config, TransformMode::Eval)?,
            vars,
            model,
            trainable,
            optimizer,
            class_weights,
        })
    }

    fn fit(&mut self) -> Result<TrainingOutcome> {
        let config = self.config;
        let training = &config.training;
        let mut scheduler = PlateauScheduler::new(&training.scheduler, training.learning_rate);
        let mut stopping = EarlyStopping::new(training.patience);
        let mut history = Vec::new();
        let mut epoch = 1;
        let mut phase = EpochPhase::Training;
        let mut stopped_early = false;

        info!(
            lr = training.learning_rate,
            weight_decay = training.weight_decay,
            batch_size = training.batch_size,
            max_epochs = training.max_epochs,
            patience = training.patience,
            "Training started"
        );

        loop {
            phase = match phase {
                EpochPhase::Training => EpochPhase::Validating {
                    train: self.train_epoch(epoch)?,
                },
                EpochPhase::Validating { train } => EpochPhase::CheckingImprovement {
                    train,
                    val: self.validate()?,
                },
                EpochPhase::CheckingImprovement { train, val } => {
                    let learning_rate = scheduler.lr();
                    if let Some(lr) = scheduler.step(val.accuracy) {
                        self.optimizer.set_learning_rate(lr);
                        info!(epoch, lr, "Reducing learning rate");
                    }

                    info!(
                        epoch,
                        train_acc = train.accuracy,
                        val_acc = val.accuracy,
                        loss = train.loss,
                        "Epoch {epoch:02} | Train Acc: {:.4} | Val Acc: {:.4} | Loss: {:.4}",
                        train.accuracy,
                        val.accuracy,
                        train.loss
                    );
                    debug!(epoch, "Validation {val}");

                    let decision = stopping.observe(epoch, val.accuracy);
                    let improved = decision == StopDecision::Improved;
                    if improved {
                        save_checkpoint(&self.vars, &training.checkpoint_path)?;
                        info!(
                            epoch,
                            val_acc = val.accuracy,
                            path = %training.checkpoint_path.display(),
                            "[BEST] Saved model with val_acc={:.4}",
                            val.accuracy
                        );
                    }
                    history.push(EpochMetrics {
                        epoch,
                        train_loss: train.loss,
                        train_accuracy: train.accuracy,
                        val_metrics: val,
                        learning_rate,
                        improved,
                    });

                    if decision == StopDecision::Stop {
                        EpochPhase::EarlyStopped
                    } else {
                        EpochPhase::EpochAdvance
                    }
                }
                EpochPhase::EpochAdvance => {
                    if epoch >= training.max_epochs {
                        break;
                    }
                    epoch += 1;
                    EpochPhase::Training
                }
                EpochPhase::EarlyStopped => {
                    info!(epoch, patience = training.patience, "Early stopping");
                    stopped_early = true;
                    break;
                }
            };
        }

        Ok(TrainingOutcome {
            stopped_early,
            history,
            best_epoch: stopping.best_epoch(),
            best_val_accuracy: stopping.best().unwrap_or(0.0),
            checkpoint_path: training.checkpoint_path.clone(),
        })
    }

    fn train_epoch(&mut self, epoch: usize) -> Result<TrainStats> {
        let pb = progress_bar(self.train_loader.num_batches(), epoch);
        let mut total_loss = 0.0;
        let mut batches = 0usize;
        let mut confusion = Confusion::default();

        for batch in self.train_loader.epoch(epoch)? {
            let batch = batch?;
            let labels_host = batch.labels.clone();
            let (frames, labels) = batch_tensors(batch, &self.device)?;

            let logits = self.model.forward_t(&frames, true)?;
            let loss = cross_entropy(&logits, &labels, self.class_weights.as_ref())
                .map_err(tensor_err("Loss computation failed"))?;
            let mut grads = loss.backward().map_err(tensor_err("Backward pass failed"))?;
            clip_grad_norm(&mut grads, &self.trainable, self.config.training.max_grad_norm)
                .map_err(tensor_err("Gradient clipping failed"))?;
            self.optimizer
                .step(&grads)
                .map_err(tensor_err("Optimizer step failed"))?;

            total_loss += loss
                .to_dtype(DType::F64)
                .and_then(|l| l.to_scalar::<f64>())
                .map_err(tensor_err("Loss scalar failed"))?;
            batches += 1;
            confusion.update(&predictions(&logits)?, &labels_host);

            pb.set_message(format!(
                "loss {:.4} acc {:.4}",
                total_loss / batches as f64,
                confusion.metrics().accuracy
            ));
            pb.inc(1);
        }
        pb.finish_and_clear();

        Ok(TrainStats {
            loss: if batches > 0 {
                total_loss / batches as f64
            } else {
                0.0
            },
            accuracy: confusion.metrics().accuracy,
        })
    }

    fn validate(&self) -> Result<ClassificationMetrics> {
        Ok(predict_pass(&self.model, &self.val_loader, &self.device)?.metrics())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_scales_to_max_norm() {
        let device = Device::Cpu;
        let w = Var::new(&[1.0f32, 1.0], &device).unwrap();
        let c = Tensor::new(&[3.0f32, 4.0], &device).unwrap();
        let loss = w.as_tensor().mul(&c).unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();

        let norm = clip_grad_norm(&mut grads, &[w.clone()], 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-6);
        let g: Vec<f32> = grads.get(&w).unwrap().to_vec1().unwrap();
        assert!((g[0] - 0.6).abs() < 1e-5);
        assert!((g[1] - 0.8).abs() < 1e-5);
    }

    #[test]
    fn test_clip_leaves_small_gradients() {
        let device = Device::Cpu;
        let w = Var::new(&[1.0f32, 1.0], &device).unwrap();
        let c = Tensor::new(&[0.3f32, 0.4], &device).unwrap();
        let loss = w.as_tensor().mul(&c).unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();

        clip_grad_norm(&mut grads, &[w.clone()], 1.0).unwrap();
        let g: Vec<f32> = grads.get(&w).unwrap().to_vec1().unwrap();
        assert_eq!(g, vec![0.3, 0.4]);
    }

    #[test]
    fn test_batch_tensors_shapes() {
        let batch = HostBatch {
            frames: vec![0.0; 2 * 3 * 3 * 4 * 4],
            labels: vec![0, 1],
            frames_per_video: 3,
            side: 4,
        };
        let (frames, labels) = batch_tensors(batch, &Device::Cpu).unwrap();
        assert_eq!(frames.dims(), &[2, 3, 3, 4, 4]);
        assert_eq!(labels.to_vec1::<u32>().unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_predictions_take_row_argmax() {
        let logits = Tensor::new(&[[0.1f32, 0.9], [2.0, -1.0]], &Device::Cpu).unwrap();
        assert_eq!(predictions(&logits).unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_empty_training_split_is_rejected() {
        let config = ExperimentConfig::default();
        let split = DatasetSplit {
            train: vec![],
            val: vec![],
            test: vec![],
            seed: 0,
        };
        let err = train(&config, &split, &Device::Cpu, None).unwrap_err();
        assert!(matches!(err, DeepfakeError::Dataset(_)));
    }
}
