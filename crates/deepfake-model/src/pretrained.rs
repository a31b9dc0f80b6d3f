//! ImageNet initialisation of the backbone from timm safetensors weights.

use crate::detector::ModelVars;
use candle_core::Device;
use deepfake_core::{DeepfakeError, PretrainedConfig, Result};
use std::path::{Path, PathBuf};

/// Prefix of backbone parameters inside [`ModelVars`].
pub const BACKBONE_PREFIX: &str = "backbone.";

const WEIGHTS_FILE: &str = "model.safetensors";

/// Resolve the backbone weights file.
///
/// Returns `None` when pretrained initialisation is disabled, the configured
/// local file when set, and otherwise downloads `model.safetensors` of
/// `config.model_id` from the HuggingFace Hub (cached after the first run).
pub async fn fetch_backbone_weights(config: &PretrainedConfig) -> Result<Option<PathBuf>> {
    use hf_hub::api::tokio::{Api, ApiBuilder};

    if !config.enabled {
        return Ok(None);
    }
    if let Some(path) = &config.weights_path {
        return Ok(Some(path.clone()));
    }

    let api = match &config.cache_dir {
        Some(dir) => ApiBuilder::new().with_cache_dir(dir.clone()).build(),
        None => Api::new(),
    }
    .map_err(|e| DeepfakeError::Model(format!("Failed to create HF API client: {e}")))?;

    tracing::info!(model_id = %config.model_id, "Fetching pretrained backbone weights");
    let path = api
        .model(config.model_id.clone())
        .get(WEIGHTS_FILE)
        .await
        .map_err(|e| {
            DeepfakeError::Model(format!(
                "Failed to download {WEIGHTS_FILE} for {}: {e}",
                config.model_id
            ))
        })?;
    Ok(Some(path))
}

/// Copy backbone weights from a safetensors file into `vars`, frozen and
/// trainable parts alike. Tensors in the file that the backbone does not
/// use (classifier, `num_batches_tracked`) are ignored.
///
/// # Errors
///
/// Fails if the file cannot be read or a backbone parameter is missing or
/// has a different shape, e.g. weights of another EfficientNet variant.
pub fn load_backbone_weights(vars: &ModelVars, path: &Path, device: &Device) -> Result<usize> {
    let tensors = candle_core::safetensors::load(path, device).map_err(|e| {
        DeepfakeError::Model(format!(
            "Failed to read pretrained weights {}: {e}",
            path.display()
        ))
    })?;
    let loaded = vars.assign_from(&tensors, BACKBONE_PREFIX)?;
    tracing::info!(
        path = %path.display(),
        tensors = loaded,
        unused = tensors.len().saturating_sub(loaded),
        "Loaded pretrained backbone"
    );
    Ok(loaded)
}
