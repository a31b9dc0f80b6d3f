//! Mini-batch assembly with background prefetching.
//!
//! A [`FrameLoader`] owns one split. Each call to [`FrameLoader::epoch`]
//! yields a [`BatchStream`] of [`HostBatch`]es. With `num_workers > 0` a
//! producer thread decodes batches on a dedicated rayon pool and hands them
//! over through a bounded channel; a decode failure travels through the same
//! channel and surfaces on the consumer's next fetch. With `num_workers == 0`
//! batches are decoded inline.

use crate::sampler::sample_frames;
use crate::transform::{FrameTransform, CHANNELS};
use crossbeam_channel::{bounded, Receiver};
use deepfake_core::{DeepfakeError, Result, VideoSample};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;

/// Batching options for one split.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub batch_size: usize,
    pub frames_per_video: usize,
    /// Reshuffle sample order every epoch.
    pub shuffle: bool,
    /// Decode threads; `0` decodes on the consuming thread.
    pub num_workers: usize,
    /// Batches buffered ahead of the consumer.
    pub prefetch_batches: usize,
    /// Base seed for shuffling and augmentation.
    pub seed: u64,
}

/// A decoded batch in host memory, laid out as `(B, T, C, H, W)`.
#[derive(Debug, Clone)]
pub struct HostBatch {
    pub frames: Vec<f32>,
    /// Class index per video.
    pub labels: Vec<u32>,
    pub frames_per_video: usize,
    /// Side of the square frames.
    pub side: usize,
}

impl HostBatch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// `(B, T, C, H, W)`.
    #[must_use]
    pub fn dims(&self) -> (usize, usize, usize, usize, usize) {
        (
            self.len(),
            self.frames_per_video,
            CHANNELS,
            self.side,
            self.side,
        )
    }
}

struct Shared {
    samples: Vec<VideoSample>,
    transform: FrameTransform,
    frames_per_video: usize,
    seed: u64,
}

impl Shared {
    // Augmentation randomness depends only on (seed, epoch, sample), never on
    // which worker decodes the clip.
    fn clip_rng(&self, epoch: usize, sample_index: usize) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        rng.set_stream(sample_index as u64 + 1);
        rng
    }

    fn load_clip(&self, epoch: usize, sample_index: usize) -> Result<Vec<f32>> {
        let sample = &self.samples[sample_index];
        let mut rng = self.clip_rng(epoch, sample_index);
        let mut clip = Vec::with_capacity(self.frames_per_video * self.transform.frame_len());
        for path in sample_frames(sample, self.frames_per_video) {
            self.transform.load_into(path, &mut rng, &mut clip)?;
        }
        Ok(clip)
    }

    fn build_batch(&self, epoch: usize, indices: &[usize], parallel: bool) -> Result<HostBatch> {
        let clips: Vec<Vec<f32>> = if parallel {
            indices
                .par_iter()
                .map(|&i| self.load_clip(epoch, i))
                .collect::<Result<_>>()?
        } else {
            indices
                .iter()
                .map(|&i| self.load_clip(epoch, i))
                .collect::<Result<_>>()?
        };
        Ok(HostBatch {
            frames: clips.concat(),
            labels: indices
                .iter()
                .map(|&i| self.samples[i].label.index())
                .collect(),
            frames_per_video: self.frames_per_video,
            side: self.transform.output_side(),
        })
    }
}

/// Batches one split, optionally with background decode workers.
pub struct FrameLoader {
    shared: Arc<Shared>,
    options: LoaderOptions,
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl FrameLoader {
    /// # Errors
    ///
    /// Returns [`DeepfakeError::Dataset`] for a zero batch size, a sample with
    /// too few frames, or a worker pool that cannot be created.
    pub fn new(
        samples: Vec<VideoSample>,
        transform: FrameTransform,
        options: LoaderOptions,
    ) -> Result<Self> {
        if options.batch_size == 0 {
            return Err(DeepfakeError::Dataset("batch size must be at least 1".to_string()));
        }
        if let Some(short) = samples
            .iter()
            .find(|s| s.frame_count() < options.frames_per_video)
        {
            return Err(DeepfakeError::Dataset(format!(
                "{} has {} frames, fewer than the {} sampled per video",
                short.dir.display(),
                short.frame_count(),
                options.frames_per_video
            )));
        }

        let pool = if options.num_workers > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(options.num_workers)
                .thread_name(|i| format!("frame-decode-{i}"))
                .build()
                .map_err(|e| DeepfakeError::Dataset(format!("Failed to start decode pool: {e}")))?;
            Some(Arc::new(pool))
        } else {
            None
        };

        Ok(Self {
            shared: Arc::new(Shared {
                samples,
                transform,
                frames_per_video: options.frames_per_video,
                seed: options.seed,
            }),
            options,
            pool,
        })
    }

    /// Number of videos in the split.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.samples.is_empty()
    }

    /// Batches per epoch; the last batch may be short.
    #[must_use]
    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.options.batch_size)
    }

    #[must_use]
    pub fn samples(&self) -> &[VideoSample] {
        &self.shared.samples
    }

    fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if self.options.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(self.options.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
    }

    /// Start iterating the batches of `epoch`.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefetch thread cannot be spawned.
    pub fn epoch(&self, epoch: usize) -> Result<BatchStream> {
        let batches: VecDeque<Vec<usize>> = self
            .epoch_order(epoch)
            .chunks(self.options.batch_size)
            .map(<[usize]>::to_vec)
            .collect();
        let remaining = batches.len();

        let Some(pool) = &self.pool else {
            return Ok(BatchStream {
                source: Source::Inline {
                    shared: Arc::clone(&self.shared),
                    batches,
                    epoch,
                },
                remaining,
            });
        };

        let (tx, rx) = bounded(self.options.prefetch_batches.max(1));
        let shared = Arc::clone(&self.shared);
        let pool = Arc::clone(pool);
        let handle = std::thread::Builder::new()
            .name("frame-prefetch".to_string())
            .spawn(move || {
                for indices in batches {
                    let batch = pool.install(|| shared.build_batch(epoch, &indices, true));
                    let failed = batch.is_err();
                    if tx.send(batch).is_err() || failed {
                        debug!(epoch, failed, "Prefetch producer stopping");
                        break;
                    }
                }
            })
            .map_err(|e| DeepfakeError::Dataset(format!("Failed to spawn prefetch thread: {e}")))?;

        Ok(BatchStream {
            source: Source::Prefetch {
                rx: Some(rx),
                handle: Some(handle),
            },
            remaining,
        })
    }
}

enum Source {
    Inline {
        shared: Arc<Shared>,
        batches: VecDeque<Vec<usize>>,
        epoch: usize,
    },
    Prefetch {
        rx: Option<Receiver<Result<HostBatch>>>,
        handle: Option<JoinHandle<()>>,
    },
}

/// Batches of one epoch. Dropping the stream stops any background work.
pub struct BatchStream {
    source: Source,
    remaining: usize,
}

impl Iterator for BatchStream {
    type Item = Result<HostBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let item = match &mut self.source {
            Source::Inline {
                shared,
                batches,
                epoch,
            } => {
                let indices = batches.pop_front()?;
                shared.build_batch(*epoch, &indices, false)
            }
            Source::Prefetch { rx, .. } => match rx.as_ref()?.recv() {
                Ok(batch) => batch,
                Err(_) => Err(DeepfakeError::Dataset(
                    "Prefetch thread exited before delivering all batches".to_string(),
                )),
            },
        };
        self.remaining = if item.is_ok() { self.remaining - 1 } else { 0 };
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

impl Drop for BatchStream {
    fn drop(&mut self) {
        if let Source::Prefetch { rx, handle } = &mut self.source {
            // Closing the receiver makes the producer's next send fail.
            drop(rx.take());
            if let Some(handle) = handle.take() {
                let _ = handle.join();
            }
        }
    }
}
