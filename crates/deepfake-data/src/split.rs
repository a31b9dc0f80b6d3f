//! Seeded train/validation/test partition.
//!
//! The partition is drawn once per run: indices are shuffled with a seeded
//! ChaCha RNG and cut into consecutive train, validation and test ranges.
//! [`SplitManifest`] records the seed and the video directories of every
//! split so a later evaluation can rebuild the exact test set.

use deepfake_core::{ClassCounts, DataConfig, DeepfakeError, Result, VideoSample};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Number of videos in each split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitSizes {
    pub train: usize,
    pub val: usize,
    pub test: usize,
}

/// `train = floor(total * train_fraction)`, `val = floor(total *
/// val_fraction)`, and test takes the remainder.
#[must_use]
pub fn split_sizes(total: usize, train_fraction: f64, val_fraction: f64) -> SplitSizes {
    let train = ((total as f64 * train_fraction).floor() as usize).min(total);
    let val = ((total as f64 * val_fraction).floor() as usize).min(total - train);
    SplitSizes {
        train,
        val,
        test: total - train - val,
    }
}

/// The three subsets of one run.
#[derive(Debug, Clone)]
pub struct DatasetSplit {
    pub train: Vec<VideoSample>,
    pub val: Vec<VideoSample>,
    pub test: Vec<VideoSample>,
    /// Seed the partition was drawn with.
    pub seed: u64,
}

impl DatasetSplit {
    #[must_use]
    pub fn sizes(&self) -> SplitSizes {
        SplitSizes {
            train: self.train.len(),
            val: self.val.len(),
            test: self.test.len(),
        }
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.train.len() + self.val.len() + self.test.len()
    }

    /// Class counts over all three splits.
    #[must_use]
    pub fn class_counts(&self) -> ClassCounts {
        let mut counts = ClassCounts::from_samples(&self.train);
        for sample in self.val.iter().chain(&self.test) {
            counts.add(sample.label);
        }
        counts
    }

    /// Rebuild a split from indexed `samples` and a saved manifest.
    ///
    /// # Errors
    ///
    /// Returns [`DeepfakeError::Dataset`] if a directory listed in the
    /// manifest is no longer present in `samples`.
    pub fn from_manifest(samples: Vec<VideoSample>, manifest: &SplitManifest) -> Result<Self> {
        let mut by_dir: HashMap<PathBuf, VideoSample> = samples
            .into_iter()
            .map(|sample| (sample.dir.clone(), sample))
            .collect();
        let mut take = |dirs: &[PathBuf]| -> Result<Vec<VideoSample>> {
            dirs.iter()
                .map(|dir| {
                    by_dir.remove(dir).ok_or_else(|| {
                        DeepfakeError::Dataset(format!(
                            "Video {} from the split manifest is missing or has too few frames",
                            dir.display()
                        ))
                    })
                })
                .collect()
        };
        Ok(Self {
            train: take(&manifest.train)?,
            val: take(&manifest.val)?,
            test: take(&manifest.test)?,
            seed: manifest.seed,
        })
    }
}

/// Partition `samples` with a seeded shuffle.
#[must_use]
pub fn split_dataset(samples: Vec<VideoSample>, config: &DataConfig, seed: u64) -> DatasetSplit {
    let sizes = split_sizes(samples.len(), config.train_fraction, config.val_fraction);

    let mut order: Vec<usize> = (0..samples.len()).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    order.shuffle(&mut rng);

    let mut slots: Vec<Option<VideoSample>> = samples.into_iter().map(Some).collect();
    let mut take = |range: &[usize]| -> Vec<VideoSample> {
        range.iter().filter_map(|&i| slots[i].take()).collect()
    };
    let train = take(&order[..sizes.train]);
    let val = take(&order[sizes.train..sizes.train + sizes.val]);
    let test = take(&order[sizes.train + sizes.val..]);

    info!(
        total = train.len() + val.len() + test.len(),
        train = train.len(),
        val = val.len(),
        test = test.len(),
        seed,
        "Dataset split"
    );

    DatasetSplit {
        train,
        val,
        test,
        seed,
    }
}

/// On-disk record of a split, stored next to the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitManifest {
    pub seed: u64,
    pub train: Vec<PathBuf>,
    pub val: Vec<PathBuf>,
    pub test: Vec<PathBuf>,
}

impl SplitManifest {
    #[must_use]
    pub fn from_split(split: &DatasetSplit) -> Self {
        let dirs = |samples: &[VideoSample]| samples.iter().map(|s| s.dir.clone()).collect();
        Self {
            seed: split.seed,
            train: dirs(&split.train),
            val: dirs(&split.val),
            test: dirs(&split.test),
        }
    }

    /// Write the manifest as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            DeepfakeError::Dataset(format!(
                "Failed to read split manifest {}: {e}",
                path.display()
            ))
        })?;
        Ok(serde_json::from_str(&json)?)
    }
}
