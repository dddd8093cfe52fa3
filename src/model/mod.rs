//! Model module for the probe heads using the Burn framework
//!
//! This module provides:
//! - Depthwise-separable conv/deconv building blocks
//! - The UNETR-style multi-scale segmentation decoder
//! - The linear-probe classifier and its optional image encoder
//!
//! ## Architecture
//!
//! Both heads sit on top of a frozen upstream feature extractor:
//! - Segmentation fuses a five-level feature pyramid into per-pixel logits
//! - Classification projects one embedding per sample to class logits

pub mod blocks;
pub mod classifier;
pub mod encoder;
pub mod unetr;

// Re-export main types for convenience
pub use classifier::{ClassificationModel, ClassificationModelConfig};
pub use encoder::{ConvEncoder, ConvEncoderConfig};
pub use unetr::{FeaturePyramid, UnetrDecoder, UnetrDecoderConfig};
