//! Batch records and their typed, validated forms
//!
//! Loaders hand over a loosely-filled [`BatchRecord`]. Each task converts it
//! once into its own batch type, so a missing field is reported by name
//! before any model code runs.

use std::collections::BTreeMap;

use burn::tensor::{
    backend::{AutodiffBackend, Backend},
    Tensor,
};

use crate::model::unetr::FeaturePyramid;
use crate::utils::error::{ProbeError, Result};

/// Pyramid levels a segmentation batch must carry, shallowest first
pub const PYRAMID_STAGES: [&str; 4] = ["z3", "z6", "z9", "z12"];

/// Upstream encoder output stored in a batch
#[derive(Debug, Clone)]
pub enum Embeddings<B: Backend> {
    /// One embedding per sample, `[batch, dim]`
    Vector(Tensor<B, 2>),
    /// Named feature maps, `[batch, channels, h, w]` each
    Stages(BTreeMap<String, Tensor<B, 4>>),
}

/// A batch as produced by a data loader; every field is optional
#[derive(Debug, Clone)]
pub struct BatchRecord<B: Backend> {
    pub image: Option<Tensor<B, 4>>,
    pub mask: Option<Tensor<B, 4>>,
    pub embs: Option<Embeddings<B>>,
    pub label: Option<Tensor<B, 2>>,
}

impl<B: Backend> Default for BatchRecord<B> {
    fn default() -> Self {
        Self {
            image: None,
            mask: None,
            embs: None,
            label: None,
        }
    }
}

impl<B: Backend> BatchRecord<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, image: Tensor<B, 4>) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_mask(mut self, mask: Tensor<B, 4>) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn with_label(mut self, label: Tensor<B, 2>) -> Self {
        self.label = Some(label);
        self
    }

    pub fn with_embedding_vector(mut self, embs: Tensor<B, 2>) -> Self {
        self.embs = Some(Embeddings::Vector(embs));
        self
    }

    /// Add one named feature map, switching `embs` to the stage form
    pub fn with_stage(mut self, name: &str, features: Tensor<B, 4>) -> Self {
        match &mut self.embs {
            Some(Embeddings::Stages(stages)) => {
                stages.insert(name.to_string(), features);
            }
            _ => {
                let mut stages = BTreeMap::new();
                stages.insert(name.to_string(), features);
                self.embs = Some(Embeddings::Stages(stages));
            }
        }
        self
    }
}

/// What the linear probe consumes
#[derive(Debug, Clone)]
pub enum ProbeInput<B: Backend> {
    Embeddings(Tensor<B, 2>),
    Images(Tensor<B, 4>),
}

impl<B: AutodiffBackend> ProbeInput<B> {
    pub fn inner(self) -> ProbeInput<B::InnerBackend> {
        match self {
            ProbeInput::Embeddings(embs) => ProbeInput::Embeddings(embs.inner()),
            ProbeInput::Images(images) => ProbeInput::Images(images.inner()),
        }
    }
}

/// Validated classification batch
#[derive(Debug, Clone)]
pub struct ClassificationBatch<B: Backend> {
    pub input: ProbeInput<B>,
    /// Binary targets, same shape as the logits
    pub label: Tensor<B, 2>,
}

impl<B: Backend> ClassificationBatch<B> {
    /// Models with an encoder need `image`; without one they need `embs`
    /// as an embedding matrix. `label` is always required.
    pub fn from_record(record: BatchRecord<B>, has_encoder: bool) -> Result<Self> {
        let input = if has_encoder {
            ProbeInput::Images(record.image.ok_or(ProbeError::MissingField("image"))?)
        } else {
            match record.embs {
                Some(Embeddings::Vector(embs)) => ProbeInput::Embeddings(embs),
                Some(Embeddings::Stages(_)) => {
                    return Err(ProbeError::Data(
                        "classification expects one embedding vector per sample, got feature maps"
                            .to_string(),
                    ))
                }
                None => return Err(ProbeError::MissingField("embs")),
            }
        };
        let label = record.label.ok_or(ProbeError::MissingField("label"))?;

        Ok(Self { input, label })
    }
}

/// Validated segmentation batch
#[derive(Debug, Clone)]
pub struct SegmentationBatch<B: Backend> {
    pub pyramid: FeaturePyramid<B>,
    /// Ground-truth mask, same shape as the logits
    pub mask: Tensor<B, 4>,
    /// Per-sample, per-channel binary label; required when the batch
    /// feeds the epoch metrics
    pub label: Option<Tensor<B, 2>>,
}

impl<B: Backend> SegmentationBatch<B> {
    /// `image` becomes `z0`; `embs` must be a stage map holding
    /// `z3`, `z6`, `z9` and `z12`.
    pub fn from_record(record: BatchRecord<B>, require_label: bool) -> Result<Self> {
        let z0 = record.image.ok_or(ProbeError::MissingField("image"))?;
        let mask = record.mask.ok_or(ProbeError::MissingField("mask"))?;

        let mut stages = match record.embs {
            Some(Embeddings::Stages(stages)) => stages,
            Some(Embeddings::Vector(_)) => {
                return Err(ProbeError::Data(
                    "segmentation expects named feature maps in embs, got a vector".to_string(),
                ))
            }
            None => return Err(ProbeError::MissingField("embs")),
        };
        let mut take = |name: &str| {
            stages
                .remove(name)
                .ok_or_else(|| ProbeError::MissingStage(name.to_string()))
        };
        let [z3, z6, z9, z12] = [
            take(PYRAMID_STAGES[0])?,
            take(PYRAMID_STAGES[1])?,
            take(PYRAMID_STAGES[2])?,
            take(PYRAMID_STAGES[3])?,
        ];

        let label = match (record.label, require_label) {
            (None, true) => return Err(ProbeError::MissingField("label")),
            (label, _) => label,
        };

        Ok(Self {
            pyramid: FeaturePyramid { z0, z3, z6, z9, z12 },
            mask,
            label,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn full_segmentation_record() -> BatchRecord<TestBackend> {
        let device = Default::default();
        let mut record = BatchRecord::new()
            .with_image(Tensor::zeros([1, 3, 32, 32], &device))
            .with_mask(Tensor::zeros([1, 1, 32, 32], &device))
            .with_label(Tensor::zeros([1, 1], &device));
        for stage in PYRAMID_STAGES {
            record = record.with_stage(stage, Tensor::zeros([1, 8, 2, 2], &device));
        }
        record
    }

    #[test]
    fn test_classification_without_encoder_needs_embs() {
        let device = Default::default();
        let record = BatchRecord::<TestBackend>::new()
            .with_image(Tensor::zeros([1, 3, 8, 8], &device))
            .with_label(Tensor::zeros([1, 1], &device));

        let err = ClassificationBatch::from_record(record, false).unwrap_err();
        assert!(matches!(err, ProbeError::MissingField("embs")));
    }

    #[test]
    fn test_classification_with_encoder_needs_image() {
        let device = Default::default();
        let record = BatchRecord::<TestBackend>::new()
            .with_embedding_vector(Tensor::zeros([1, 4], &device))
            .with_label(Tensor::zeros([1, 1], &device));

        let err = ClassificationBatch::from_record(record, true).unwrap_err();
        assert!(matches!(err, ProbeError::MissingField("image")));
    }

    #[test]
    fn test_classification_needs_label() {
        let device = Default::default();
        let record = BatchRecord::<TestBackend>::new()
            .with_embedding_vector(Tensor::zeros([1, 4], &device));

        let err = ClassificationBatch::from_record(record, false).unwrap_err();
        assert!(matches!(err, ProbeError::MissingField("label")));
    }

    #[test]
    fn test_classification_embedding_batch() {
        let device = Default::default();
        let record = BatchRecord::<TestBackend>::new()
            .with_embedding_vector(Tensor::zeros([2, 4], &device))
            .with_label(Tensor::zeros([2, 1], &device));

        let batch = ClassificationBatch::from_record(record, false).unwrap();
        assert!(matches!(batch.input, ProbeInput::Embeddings(_)));
        assert_eq!(batch.label.dims(), [2, 1]);
    }

    #[test]
    fn test_segmentation_batch_builds_pyramid() {
        let batch = SegmentationBatch::from_record(full_segmentation_record(), true).unwrap();
        assert_eq!(batch.pyramid.z0.dims(), [1, 3, 32, 32]);
        assert_eq!(batch.pyramid.z12.dims(), [1, 8, 2, 2]);
        assert!(batch.label.is_some());
    }

    #[test]
    fn test_segmentation_missing_stage_is_named() {
        let mut record = full_segmentation_record();
        if let Some(Embeddings::Stages(stages)) = &mut record.embs {
            stages.remove("z9");
        }

        let err = SegmentationBatch::from_record(record, true).unwrap_err();
        assert!(matches!(err, ProbeError::MissingStage(ref s) if s == "z9"));
    }

    #[test]
    fn test_segmentation_label_only_required_when_asked() {
        let mut record = full_segmentation_record();
        record.label = None;

        assert!(SegmentationBatch::from_record(record.clone(), false).is_ok());
        let err = SegmentationBatch::from_record(record, true).unwrap_err();
        assert!(matches!(err, ProbeError::MissingField("label")));
    }

    #[test]
    fn test_segmentation_needs_mask() {
        let mut record = full_segmentation_record();
        record.mask = None;

        let err = SegmentationBatch::from_record(record, false).unwrap_err();
        assert!(matches!(err, ProbeError::MissingField("mask")));
    }
}
