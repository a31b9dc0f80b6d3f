//! Training and evaluation drivers for the deepfake video classifier.

pub mod training;
