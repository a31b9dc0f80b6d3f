//! Video classifier training pipeline.
//!
//! [`trainer::train`] runs the epoch loop over a fixed [`DatasetSplit`]
//! (AdamW, gradient clipping, plateau LR schedule, early stopping, best
//! checkpoint) and [`evaluate::evaluate_checkpoint`] scores a saved
//! checkpoint on held-out videos.
//!
//! [`DatasetSplit`]: deepfake_data::DatasetSplit

pub mod checkpoint;
pub mod evaluate;
pub mod loss;
pub mod metrics;
pub mod schedule;
pub mod trainer;
