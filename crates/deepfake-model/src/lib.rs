//! Video classifier: a time-shared EfficientNet frame encoder, a
//! bidirectional LSTM with self-attention over time, and a small
//! classification head.
//!
//! ```text
//! (B, T, C, H, W) → backbone per frame → (B, T, F)
//!                 → BiLSTM → (B, T, 2H) → attention → mean over T → (B, 2H)
//!                 → Linear → ReLU → Dropout → Linear → (B, 2)
//! ```

pub mod backbone;
pub mod detector;
pub mod device;
pub mod pretrained;
pub mod temporal;

pub use backbone::{Backbone, BackboneArch};
pub use detector::{DeepfakeDetector, ModelVars};
pub use device::select_device;
pub use pretrained::{fetch_backbone_weights, load_backbone_weights};
