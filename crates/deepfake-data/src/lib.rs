//! Dataset side of the deepfake video detector.
//!
//! # Modules
//!
//! - [`indexer`] — scans `root/{real,fake}/<video>/` frame folders
//! - [`sampler`] — evenly spaced frame selection
//! - [`transform`] — resize, crop, flip, colour jitter, normalisation
//! - [`split`] — seeded train/validation/test partition and its manifest
//! - [`loader`] — mini-batch assembly with background prefetching

pub mod indexer;
pub mod loader;
pub mod sampler;
pub mod split;
pub mod transform;

pub use indexer::index_videos;
pub use loader::{BatchStream, FrameLoader, HostBatch, LoaderOptions};
pub use sampler::even_indices;
pub use split::{split_dataset, split_sizes, DatasetSplit, SplitManifest, SplitSizes};
pub use transform::{FrameTransform, TransformMode};
