//! Best-model checkpoint: every parameter of the detector (frozen and
//! trainable, batch-norm running statistics included) in one safetensors
//! file.

use candle_core::Device;
use deepfake_core::{DeepfakeError, Result};
use deepfake_model::ModelVars;
use std::path::Path;

/// Write all parameters of `vars` to `path`, replacing any previous file.
pub fn save_checkpoint(vars: &ModelVars, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tensors = vars.named_tensors()?;
    candle_core::safetensors::save(&tensors, path).map_err(|e| {
        DeepfakeError::Checkpoint(format!("Failed to save {}: {e}", path.display()))
    })?;
    tracing::debug!(path = %path.display(), tensors = tensors.len(), "Checkpoint saved");
    Ok(())
}

/// Restore every parameter of `vars` from the checkpoint at `path`.
///
/// # Errors
///
/// Returns [`DeepfakeError::Checkpoint`] if the file is missing or
/// unreadable, or does not match the model built from the current config.
pub fn load_checkpoint(vars: &ModelVars, path: &Path, device: &Device) -> Result<()> {
    let tensors = candle_core::safetensors::load(path, device).map_err(|e| {
        DeepfakeError::Checkpoint(format!("Failed to load {}: {e}", path.display()))
    })?;
    vars.assign_from(&tensors, "").map_err(|e| {
        DeepfakeError::Checkpoint(format!(
            "{} does not match the configured model: {e}",
            path.display()
        ))
    })?;
    tracing::debug!(path = %path.display(), tensors = tensors.len(), "Checkpoint loaded");
    Ok(())
}
