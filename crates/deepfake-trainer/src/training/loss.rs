//! Class weighting and the (optionally weighted) cross-entropy loss.

use candle_core::{Device, Result, Tensor, D};
use deepfake_core::{ClassCounts, Label, NUM_CLASSES};

/// Inverse-frequency weights: `total / count` per class, or 1.0 for a class
/// with no samples.
#[must_use]
pub fn class_weights(counts: &ClassCounts) -> [f32; NUM_CLASSES] {
    let total = counts.total() as f32;
    Label::ALL.map(|label| match counts.get(label) {
        0 => 1.0,
        n => total / n as f32,
    })
}

/// Class-weight tensor on `device`, indexed by [`Label::index`].
pub fn class_weight_tensor(counts: &ClassCounts, device: &Device) -> Result<Tensor> {
    Tensor::new(&class_weights(counts), device)
}

/// Mean cross-entropy of `logits` `(B, C)` against class indices
/// `targets` `(B,)`.
///
/// With `weights`, each sample's negative log-likelihood is scaled by the
/// weight of its true class and the sum is divided by the summed weights.
pub fn cross_entropy(logits: &Tensor, targets: &Tensor, weights: Option<&Tensor>) -> Result<Tensor> {
    let Some(weights) = weights else {
        return candle_nn::loss::cross_entropy(logits, targets);
    };
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let nll = log_probs
        .gather(&targets.unsqueeze(1)?, 1)?
        .squeeze(1)?
        .neg()?;
    let sample_weights = weights.index_select(targets, 0)?;
    let weighted = (nll * &sample_weights)?.sum_all()?;
    weighted / sample_weights.sum_all()?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_inverse_frequency_weights() {
        let w = class_weights(&ClassCounts { real: 30, fake: 10 });
        assert!((w[0] - 40.0 / 30.0).abs() < 1e-6);
        assert!((w[1] - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_class_gets_unit_weight() {
        let w = class_weights(&ClassCounts { real: 5, fake: 0 });
        assert_eq!(w, [1.0, 1.0]);
    }

    #[test]
    fn test_unit_weights_match_plain_cross_entropy() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[2.0f32, -1.0], [0.5, 0.3], [-0.2, 1.7]], &device).unwrap();
        let targets = Tensor::new(&[0u32, 1, 1], &device).unwrap();
        let ones = Tensor::new(&[1.0f32, 1.0], &device).unwrap();

        let plain = scalar(&cross_entropy(&logits, &targets, None).unwrap());
        let weighted = scalar(&cross_entropy(&logits, &targets, Some(&ones)).unwrap());
        assert!((plain - weighted).abs() < 1e-5);
    }

    #[test]
    fn test_weighted_mean_normalises_by_weight_sum() {
        let device = Device::Cpu;
        // uniform logits: every sample has nll = ln 2
        let logits = Tensor::zeros((4, 2), candle_core::DType::F32, &device).unwrap();
        let targets = Tensor::new(&[0u32, 0, 0, 1], &device).unwrap();
        let weights = Tensor::new(&[1.0f32, 3.0], &device).unwrap();
        let loss = scalar(&cross_entropy(&logits, &targets, Some(&weights)).unwrap());
        assert!((loss - std::f32::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn test_weights_shift_the_loss_toward_rare_class() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[3.0f32, 0.0], [3.0, 0.0]], &device).unwrap();
        let targets = Tensor::new(&[0u32, 1], &device).unwrap();
        let plain = scalar(&cross_entropy(&logits, &targets, None).unwrap());
        let weights = Tensor::new(&[1.0f32, 4.0], &device).unwrap();
        let weighted = scalar(&cross_entropy(&logits, &targets, Some(&weights)).unwrap());
        // the misclassified sample belongs to the up-weighted class
        assert!(weighted > plain);
    }

    #[test]
    fn test_weight_tensor_layout() {
        let t = class_weight_tensor(&ClassCounts { real: 1, fake: 3 }, &Device::Cpu).unwrap();
        let v: Vec<f32> = t.to_vec1().unwrap();
        assert_eq!(v, vec![4.0, 4.0 / 3.0]);
    }
}
