//! The full video classifier and its parameter store.

use crate::backbone::{Backbone, BackboneArch, FreezePolicy};
use crate::temporal::TemporalAggregator;
use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{linear, Dropout, Linear, VarBuilder, VarMap};
use deepfake_core::{DeepfakeError, ModelConfig, Result, NUM_CLASSES};
use std::collections::HashMap;

/// Parameters of one detector, split into two maps.
///
/// Only `trainable` is handed to the optimizer. Names are unique across
/// both maps, so together they form one flat checkpoint namespace.
pub struct ModelVars {
    pub frozen: VarMap,
    pub trainable: VarMap,
}

impl Default for ModelVars {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelVars {
    #[must_use]
    pub fn new() -> Self {
        Self {
            frozen: VarMap::new(),
            trainable: VarMap::new(),
        }
    }

    /// Variables the optimizer updates.
    #[must_use]
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.trainable.all_vars()
    }

    /// Element counts of the `(frozen, trainable)` maps.
    pub fn parameter_counts(&self) -> Result<(usize, usize)> {
        let count = |map: &VarMap| -> Result<usize> {
            Ok(lock(map)?.values().map(|v| v.elem_count()).sum())
        };
        Ok((count(&self.frozen)?, count(&self.trainable)?))
    }

    /// Snapshot every variable by name.
    pub fn named_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let mut out = HashMap::new();
        for map in [&self.frozen, &self.trainable] {
            for (name, var) in lock(map)?.iter() {
                out.insert(name.clone(), var.as_tensor().clone());
            }
        }
        Ok(out)
    }

    /// Overwrite every variable whose name starts with `prefix` with the
    /// tensor stored under the rest of its name. Returns the number of
    /// variables assigned.
    ///
    /// # Errors
    ///
    /// Fails if a selected variable has no source tensor or the shapes
    /// differ. Variables assigned before the failure keep their new values.
    pub fn assign_from(&self, tensors: &HashMap<String, Tensor>, prefix: &str) -> Result<usize> {
        let mut assigned = 0;
        for map in [&self.frozen, &self.trainable] {
            for (name, var) in lock(map)?.iter() {
                let Some(key) = name.strip_prefix(prefix) else {
                    continue;
                };
                let source = tensors
                    .get(key)
                    .ok_or_else(|| DeepfakeError::Model(format!("Missing tensor {key}")))?;
                if source.dims() != var.dims() {
                    return Err(DeepfakeError::Model(format!(
                        "Shape mismatch for {key}: expected {:?}, found {:?}",
                        var.dims(),
                        source.dims()
                    )));
                }
                source
                    .to_dtype(var.dtype())
                    .and_then(|t| t.to_device(var.device()))
                    .and_then(|t| var.set(&t))
                    .map_err(|e| DeepfakeError::Model(format!("Failed to assign {key}: {e}")))?;
                assigned += 1;
            }
        }
        Ok(assigned)
    }
}

fn lock(map: &VarMap) -> Result<std::sync::MutexGuard<'_, HashMap<String, Var>>> {
    map.data()
        .lock()
        .map_err(|e| DeepfakeError::Model(format!("Variable map lock poisoned: {e}")))
}

/// Two-layer MLP over the pooled temporal feature.
#[derive(Debug, Clone)]
struct ClassifierHead {
    fc1: Linear,
    dropout: Dropout,
    fc2: Linear,
}

impl ClassifierHead {
    fn new(in_dim: usize, hidden: usize, dropout: f32, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            fc1: linear(in_dim, hidden, vb.pp("fc1"))?,
            dropout: Dropout::new(dropout),
            fc2: linear(hidden, NUM_CLASSES, vb.pp("fc2"))?,
        })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let h = self.fc1.forward(x)?.relu()?;
        let h = self.dropout.forward(&h, train)?;
        self.fc2.forward(&h)
    }
}

/// EfficientNet frame encoder, BiLSTM + self-attention, MLP head.
pub struct DeepfakeDetector {
    backbone: Backbone,
    temporal: TemporalAggregator,
    head: ClassifierHead,
    device: Device,
}

impl DeepfakeDetector {
    /// Build a detector whose parameters live in `vars`.
    ///
    /// Backbone parameters are named `backbone.*`, the temporal block
    /// `temporal.*` and the head `head.*`. Everything outside the backbone
    /// is trainable.
    pub fn new(config: &ModelConfig, vars: &ModelVars, device: &Device) -> Result<Self> {
        let (width, depth) = config.backbone_multipliers();
        let arch = BackboneArch::scaled(width, depth);
        let policy = FreezePolicy {
            trainable_from_stage: config.trainable_from_stage,
            train_head_conv: config.train_head_conv,
        };
        let frozen = VarBuilder::from_varmap(&vars.frozen, DType::F32, device);
        let trainable = VarBuilder::from_varmap(&vars.trainable, DType::F32, device);

        let backbone = Backbone::new(&arch, policy, frozen.pp("backbone"), trainable.pp("backbone"))
            .map_err(|e| DeepfakeError::Model(format!("Failed to create backbone: {e}")))?;
        let temporal = TemporalAggregator::new(
            backbone.feature_dim(),
            config.lstm_hidden,
            trainable.pp("temporal"),
        )
        .map_err(|e| DeepfakeError::Model(format!("Failed to create temporal block: {e}")))?;
        let head = ClassifierHead::new(
            temporal.output_dim(),
            config.head_hidden,
            config.dropout,
            trainable.pp("head"),
        )
        .map_err(|e| DeepfakeError::Model(format!("Failed to create classifier head: {e}")))?;

        tracing::debug!(
            feature_dim = backbone.feature_dim(),
            temporal_dim = temporal.output_dim(),
            "Detector created"
        );

        Ok(Self {
            backbone,
            temporal,
            head,
            device: device.clone(),
        })
    }

    /// Map a clip batch `(B, T, C, H, W)` to logits `(B, 2)`.
    ///
    /// `train` enables dropout and batch-norm statistics updates in the
    /// trainable layers.
    pub fn forward_t(&self, frames: &Tensor, train: bool) -> Result<Tensor> {
        self.forward_inner(frames, train)
            .map_err(|e| DeepfakeError::Model(format!("Forward pass failed: {e}")))
    }

    fn forward_inner(&self, frames: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let (b, t, c, h, w) = frames.dims5()?;
        let flat = frames.reshape((b * t, c, h, w))?;
        let features = self.backbone.forward_t(&flat, train)?;
        let features = features.reshape((b, t, self.backbone.feature_dim()))?;
        let pooled = self.temporal.forward(&features)?;
        self.head.forward_t(&pooled, train)
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deepfake_core::BackboneScale;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            backbone_scale: Some(BackboneScale {
                width: 0.25,
                depth: 0.25,
            }),
            lstm_hidden: 8,
            head_hidden: 6,
            ..ModelConfig::default()
        }
    }

    fn clip(b: usize, t: usize) -> Tensor {
        Tensor::randn(0f32, 1.0, (b, t, 3, 32, 32), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_forward_shape() {
        let vars = ModelVars::new();
        let model = DeepfakeDetector::new(&tiny_config(), &vars, &Device::Cpu).unwrap();
        let logits = model.forward_t(&clip(2, 3), false).unwrap();
        assert_eq!(logits.dims(), &[2, NUM_CLASSES]);
        let logits = model.forward_t(&clip(1, 1), true).unwrap();
        assert_eq!(logits.dims(), &[1, NUM_CLASSES]);
    }

    #[test]
    fn test_eval_is_deterministic() {
        let vars = ModelVars::new();
        let model = DeepfakeDetector::new(&tiny_config(), &vars, &Device::Cpu).unwrap();
        let x = clip(2, 2);
        let a: Vec<Vec<f32>> = model.forward_t(&x, false).unwrap().to_vec2().unwrap();
        let b: Vec<Vec<f32>> = model.forward_t(&x, false).unwrap().to_vec2().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_trainable_vars_exclude_frozen_backbone() {
        let vars = ModelVars::new();
        DeepfakeDetector::new(&tiny_config(), &vars, &Device::Cpu).unwrap();

        let trainable = lock(&vars.trainable).unwrap();
        assert!(trainable.contains_key("head.fc2.weight"));
        assert!(trainable.contains_key("temporal.lstm.weight_ih_l0"));
        assert!(trainable.contains_key("temporal.attention.query.weight"));
        assert!(trainable.contains_key("backbone.blocks.4.0.conv_pw.weight"));
        assert!(!trainable.contains_key("backbone.conv_stem.weight"));
        drop(trainable);

        let frozen = lock(&vars.frozen).unwrap();
        assert!(frozen.contains_key("backbone.conv_stem.weight"));
        assert!(frozen.keys().all(|k| k.starts_with("backbone.")));
        drop(frozen);

        let (frozen_n, trainable_n) = vars.parameter_counts().unwrap();
        assert!(frozen_n > 0 && trainable_n > 0);
        assert_eq!(vars.trainable_vars().len(), vars.trainable.all_vars().len());
    }

    #[test]
    fn test_assign_from_copies_weights_between_models() {
        let config = tiny_config();
        let src = ModelVars::new();
        let a = DeepfakeDetector::new(&config, &src, &Device::Cpu).unwrap();
        let dst = ModelVars::new();
        let b = DeepfakeDetector::new(&config, &dst, &Device::Cpu).unwrap();

        let tensors = src.named_tensors().unwrap();
        let assigned = dst.assign_from(&tensors, "").unwrap();
        assert_eq!(assigned, tensors.len());

        let x = clip(1, 2);
        let ya: Vec<Vec<f32>> = a.forward_t(&x, false).unwrap().to_vec2().unwrap();
        let yb: Vec<Vec<f32>> = b.forward_t(&x, false).unwrap().to_vec2().unwrap();
        assert_eq!(ya, yb);
    }

    #[test]
    fn test_assign_from_reports_missing_and_mismatched() {
        let vars = ModelVars::new();
        DeepfakeDetector::new(&tiny_config(), &vars, &Device::Cpu).unwrap();

        let err = vars.assign_from(&HashMap::new(), "head.").unwrap_err();
        assert!(err.to_string().contains("Missing tensor"));

        let mut tensors = HashMap::new();
        for name in ["fc1.weight", "fc1.bias", "fc2.weight", "fc2.bias"] {
            tensors.insert(
                name.to_string(),
                Tensor::zeros((1, 1), DType::F32, &Device::Cpu).unwrap(),
            );
        }
        let err = vars.assign_from(&tensors, "head.").unwrap_err();
        assert!(err.to_string().contains("Shape mismatch"));
    }
}
