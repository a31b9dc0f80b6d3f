//! Per-frame image pipeline.
//!
//! Both modes resize to a square, crop, and normalise into a CHW `f32`
//! buffer. Training mode crops at a random offset and applies a random
//! horizontal flip and colour jitter; evaluation mode centre-crops and is
//! fully deterministic.

use deepfake_core::{AugmentConfig, DataConfig, DeepfakeError, Result};
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use rand::seq::SliceRandom;
use rand::Rng;
use std::path::Path;

/// Number of colour channels produced per frame.
pub const CHANNELS: usize = 3;

/// Luma weights used for grayscale conversion (ITU-R 601-2).
const LUMA: [f32; 3] = [0.299, 0.587, 0.114];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformMode {
    Train,
    Eval,
}

/// Frame transform shared by all loader workers.
#[derive(Debug, Clone)]
pub struct FrameTransform {
    mode: TransformMode,
    resize: u32,
    crop: u32,
    augment: AugmentConfig,
    mean: [f32; 3],
    std: [f32; 3],
}

impl FrameTransform {
    /// Augmenting transform for the training split.
    #[must_use]
    pub fn train(config: &DataConfig) -> Self {
        Self::new(TransformMode::Train, config)
    }

    /// Deterministic transform for validation and test splits.
    #[must_use]
    pub fn eval(config: &DataConfig) -> Self {
        Self::new(TransformMode::Eval, config)
    }

    fn new(mode: TransformMode, config: &DataConfig) -> Self {
        Self {
            mode,
            resize: config.resize,
            crop: config.crop_size,
            augment: config.augment.clone(),
            mean: config.mean,
            std: config.std,
        }
    }

    #[must_use]
    pub fn mode(&self) -> TransformMode {
        self.mode
    }

    /// Side length of the square output.
    #[must_use]
    pub fn output_side(&self) -> usize {
        self.crop as usize
    }

    /// Number of `f32` values produced per frame.
    #[must_use]
    pub fn frame_len(&self) -> usize {
        CHANNELS * self.output_side() * self.output_side()
    }

    /// Decode `path` as RGB and transform it, appending CHW values to `out`.
    ///
    /// # Errors
    ///
    /// Returns [`DeepfakeError::Image`] if the file cannot be opened or
    /// decoded.
    pub fn load_into<R: Rng + ?Sized>(
        &self,
        path: &Path,
        rng: &mut R,
        out: &mut Vec<f32>,
    ) -> Result<()> {
        let image = image::open(path)
            .map_err(|e| DeepfakeError::Image(format!("Failed to decode {}: {e}", path.display())))?;
        self.apply_into(&image, rng, out);
        Ok(())
    }

    /// Transform an already decoded image, appending CHW values to `out`.
    pub fn apply_into<R: Rng + ?Sized>(&self, image: &DynamicImage, rng: &mut R, out: &mut Vec<f32>) {
        let resized = image
            .resize_exact(self.resize, self.resize, FilterType::Triangle)
            .to_rgb8();
        let (x, y) = self.crop_origin(rng);
        let mut cropped: RgbImage = imageops::crop_imm(&resized, x, y, self.crop, self.crop).to_image();

        let mut pixels: Vec<[f32; 3]> = Vec::with_capacity(self.output_side() * self.output_side());
        if self.mode == TransformMode::Train {
            if rng.gen_bool(self.augment.hflip_prob) {
                imageops::flip_horizontal_in_place(&mut cropped);
            }
            pixels.extend(cropped.pixels().map(|p| to_unit(p.0)));
            color_jitter(&mut pixels, &self.augment, rng);
        } else {
            pixels.extend(cropped.pixels().map(|p| to_unit(p.0)));
        }

        out.reserve(self.frame_len());
        for c in 0..CHANNELS {
            let (mean, std) = (self.mean[c], self.std[c]);
            out.extend(pixels.iter().map(|px| (px[c] - mean) / std));
        }
    }

    fn crop_origin<R: Rng + ?Sized>(&self, rng: &mut R) -> (u32, u32) {
        let slack = self.resize - self.crop;
        match self.mode {
            TransformMode::Train => (rng.gen_range(0..=slack), rng.gen_range(0..=slack)),
            TransformMode::Eval => {
                let offset = (f64::from(slack) / 2.0).round_ties_even() as u32;
                (offset, offset)
            }
        }
    }
}

fn to_unit(rgb: [u8; 3]) -> [f32; 3] {
    rgb.map(|v| f32::from(v) / 255.0)
}

#[derive(Debug, Clone, Copy)]
enum Jitter {
    Brightness(f32),
    Contrast(f32),
    Saturation(f32),
}

/// Draw brightness, contrast and saturation factors, then apply them in a
/// random order.
fn color_jitter<R: Rng + ?Sized>(pixels: &mut [[f32; 3]], cfg: &AugmentConfig, rng: &mut R) {
    let mut ops = Vec::with_capacity(3);
    if cfg.brightness > 0.0 {
        ops.push(Jitter::Brightness(draw_factor(cfg.brightness, rng)));
    }
    if cfg.contrast > 0.0 {
        ops.push(Jitter::Contrast(draw_factor(cfg.contrast, rng)));
    }
    if cfg.saturation > 0.0 {
        ops.push(Jitter::Saturation(draw_factor(cfg.saturation, rng)));
    }
    ops.shuffle(rng);

    for op in ops {
        match op {
            Jitter::Brightness(f) => {
                for px in pixels.iter_mut() {
                    *px = px.map(|v| (v * f).clamp(0.0, 1.0));
                }
            }
            Jitter::Contrast(f) => {
                if pixels.is_empty() {
                    continue;
                }
                let mean = pixels.iter().map(luma).sum::<f32>() / pixels.len() as f32;
                for px in pixels.iter_mut() {
                    *px = px.map(|v| blend(v, mean, f));
                }
            }
            Jitter::Saturation(f) => {
                for px in pixels.iter_mut() {
                    let gray = luma(px);
                    *px = px.map(|v| blend(v, gray, f));
                }
            }
        }
    }
}

fn draw_factor<R: Rng + ?Sized>(amount: f32, rng: &mut R) -> f32 {
    let low = (1.0 - amount).max(0.0);
    rng.gen_range(low..=1.0 + amount)
}

fn luma(px: &[f32; 3]) -> f32 {
    px[0] * LUMA[0] + px[1] * LUMA[1] + px[2] * LUMA[2]
}

fn blend(value: f32, toward: f32, factor: f32) -> f32 {
    (factor * value + (1.0 - factor) * toward).clamp(0.0, 1.0)
}
