//! Binary segmentation task
//!
//! Decodes the feature pyramid into per-pixel logits. Training logs the
//! loss and a batch F-score (`train_dsc`). Validation and test also derive
//! a per-sample label from the predicted mask, track pixel overlap and
//! buffer the raw logits for the epoch-end reference F-score.

use burn::{
    module::AutodiffModule,
    tensor::{
        activation::sigmoid,
        backend::{AutodiffBackend, Backend},
        ElementConversion, Tensor,
    },
};
use tracing::info;

use super::aggregator::{EpochReport, PhaseAggregators};
use super::batch::{BatchRecord, SegmentationBatch};
use super::loss::{GeneralizedDiceLoss, LossFn};
use super::{EvalPhaseHandler, Phase, TrainablePhaseHandler};
use crate::model::unetr::UnetrDecoder;
use crate::utils::config::RunConfig;
use crate::utils::error::{ProbeError, Result};
use crate::utils::metrics::{FScore, DEFAULT_THRESHOLD};
use crate::utils::sink::MetricSink;
use crate::utils::tensor::to_host_vec;

/// Per-sample, per-channel label from a probability map.
///
/// A channel of a sample is positive when strictly more than
/// `pixel_threshold` pixels have probability above 0.5.
/// `[batch, channels, h, w]` -> `[batch, channels]` of 0.0 / 1.0.
pub fn derive_mask_labels<B: Backend>(
    probabilities: Tensor<B, 4>,
    pixel_threshold: usize,
) -> Tensor<B, 2> {
    let [batch, channels, _, _] = probabilities.dims();

    probabilities
        .greater_elem(DEFAULT_THRESHOLD)
        .float()
        .sum_dim(3)
        .sum_dim(2)
        .reshape([batch, channels])
        .greater_elem(pixel_threshold as f32)
        .float()
}

pub struct SegmentationTask<B: Backend> {
    model: UnetrDecoder<B>,
    loss: Box<dyn LossFn<B, 4>>,
    sink: Box<dyn MetricSink>,
    aggregators: PhaseAggregators,
    train_fscore: FScore,
    learning_rate: f64,
    pixel_threshold: usize,
}

impl<B: Backend> SegmentationTask<B> {
    pub fn new(model: UnetrDecoder<B>, sink: Box<dyn MetricSink>, config: &RunConfig) -> Self {
        Self {
            model,
            loss: Box::new(GeneralizedDiceLoss::default()),
            sink,
            aggregators: PhaseAggregators::new(config.buffer_limit()),
            train_fscore: FScore::default(),
            learning_rate: config.learning_rate,
            pixel_threshold: config.pixel_threshold,
        }
    }

    /// Replace the default generalized Dice loss
    pub fn with_loss(mut self, loss: Box<dyn LossFn<B, 4>>) -> Self {
        info!("Segmentation loss: {}", loss.name());
        self.loss = loss;
        self
    }

    pub fn pixel_threshold(&self) -> usize {
        self.pixel_threshold
    }

    pub fn into_model(self) -> UnetrDecoder<B> {
        self.model
    }

    /// Loss, logging and metric bookkeeping for one batch of logits.
    ///
    /// An evaluation batch is checked for its label and for buffer room
    /// before anything is logged or folded, so a rejected batch leaves no
    /// trace in the epoch.
    fn score(
        &mut self,
        phase: Phase,
        logits: Tensor<B, 4>,
        mask: Tensor<B, 4>,
        label: Option<Tensor<B, 2>>,
    ) -> Result<Tensor<B, 1>> {
        if logits.dims() != mask.dims() {
            return Err(ProbeError::ShapeMismatch {
                stage: "segmentation loss",
                expected: logits.dims().to_vec(),
                actual: mask.dims().to_vec(),
            });
        }
        if let Some(aggregator) = self.aggregators.get_mut(phase) {
            let [batch, channels, _, _] = logits.dims();
            match &label {
                None => return Err(ProbeError::MissingField("label")),
                Some(label) if label.dims() != [batch, channels] => {
                    return Err(ProbeError::ShapeMismatch {
                        stage: "segmentation labels",
                        expected: vec![batch, channels],
                        actual: label.dims().to_vec(),
                    })
                }
                Some(_) => {}
            }
            aggregator.ensure_capacity()?;
        }

        let loss = self.loss.forward(logits.clone(), mask.clone());
        let loss_value: f64 = loss.clone().into_scalar().elem();
        self.sink
            .log_scalar(&format!("{}loss", phase.prefix()), loss_value)?;

        let Some(aggregator) = self.aggregators.get_mut(phase) else {
            let dsc = self.train_fscore.compute(
                &to_host_vec(logits.detach())?,
                &to_host_vec(mask.detach())?,
            )?;
            self.sink.log_scalar("train_dsc", dsc)?;
            return Ok(loss);
        };

        let label = label.ok_or(ProbeError::MissingField("label"))?;
        let logits = logits.detach();
        let probabilities = sigmoid(logits.clone());

        let predicted = derive_mask_labels(probabilities.clone(), self.pixel_threshold);
        aggregator.update(predicted, label)?;
        aggregator.update_overlap(probabilities, mask.clone())?;
        aggregator.record_outputs(logits, mask)?;

        Ok(loss)
    }
}

impl<B: Backend> TrainablePhaseHandler<B> for SegmentationTask<B> {
    type Model = UnetrDecoder<B>;

    fn model(&self) -> &Self::Model {
        &self.model
    }

    fn set_model(&mut self, model: Self::Model) {
        self.model = model;
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn begin_phase(&mut self, phase: Phase) -> Result<()> {
        if let Some(aggregator) = self.aggregators.get_mut(phase) {
            aggregator.begin();
        }
        Ok(())
    }

    fn on_batch(&mut self, phase: Phase, batch: BatchRecord<B>) -> Result<Tensor<B, 1>> {
        let SegmentationBatch {
            pyramid,
            mask,
            label,
        } = SegmentationBatch::from_record(batch, phase.aggregates())?;

        let logits = self.model.forward(pyramid)?;
        self.score(phase, logits, mask, label)
    }

    fn on_phase_end(&mut self, phase: Phase) -> Result<Option<EpochReport>> {
        let report = self.aggregators.finish(phase, self.sink.as_mut())?;
        if let Some(report) = &report {
            info!(
                "{} epoch: dsc {:.4}, reference {:.4}, f1 {:.4}",
                phase,
                report.dice.unwrap_or_default(),
                report.reference_fscore.unwrap_or_default(),
                report.f1
            );
        }
        Ok(report)
    }
}

impl<B: AutodiffBackend> EvalPhaseHandler<B> for SegmentationTask<B> {
    fn on_eval_batch(&mut self, phase: Phase, batch: BatchRecord<B>) -> Result<Tensor<B, 1>> {
        let SegmentationBatch {
            pyramid,
            mask,
            label,
        } = SegmentationBatch::from_record(batch, phase.aggregates())?;

        let logits = self.model.valid().forward(pyramid.inner())?;
        self.score(phase, Tensor::from_inner(logits), mask, label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::unetr::UnetrDecoderConfig;
    use crate::training::batch::PYRAMID_STAGES;
    use crate::utils::sink::{Emission, MemorySink};
    use burn::backend::NdArray;
    use burn::tensor::TensorData;

    type TestBackend = NdArray;

    fn probability_map(foreground: usize) -> Tensor<TestBackend, 4> {
        let device = Default::default();
        let values: Vec<f32> = (0..64 * 64)
            .map(|i| if i < foreground { 0.9 } else { 0.1 })
            .collect();
        Tensor::from_data(TensorData::new(values, [1, 1, 64, 64]), &device)
    }

    fn label_of(foreground: usize, threshold: usize) -> f32 {
        let labels = derive_mask_labels(probability_map(foreground), threshold);
        assert_eq!(labels.dims(), [1, 1]);
        labels.into_scalar()
    }

    #[test]
    fn test_pixel_threshold_is_strict() {
        assert_eq!(label_of(1001, 1000), 1.0);
        assert_eq!(label_of(1000, 1000), 0.0);
        assert_eq!(label_of(0, 1000), 0.0);
    }

    #[test]
    fn test_exactly_half_is_background() {
        let device = Default::default();
        let probs = Tensor::<TestBackend, 4>::full([1, 1, 2, 2], 0.5, &device);
        let labels = derive_mask_labels(probs, 0);
        assert_eq!(labels.into_scalar(), 0.0);
    }

    #[test]
    fn test_labels_per_channel() {
        let device = Default::default();
        // Channel 0: 3 foreground pixels, channel 1: 1
        let probs = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![0.9f32, 0.9, 0.9, 0.1, 0.9, 0.1, 0.1, 0.1], [1, 2, 2, 2]),
            &device,
        );
        let labels = derive_mask_labels(probs, 2);
        let values = labels.into_data().to_vec::<f32>().unwrap();
        assert_eq!(values, vec![1.0, 0.0]);
    }

    fn task(sink: &MemorySink) -> SegmentationTask<TestBackend> {
        let device = Default::default();
        let model = UnetrDecoderConfig::new(8, 1, 3)
            .with_init_filters(2)
            .init(&device);
        let mut config = RunConfig::default();
        config.pixel_threshold = 10;
        SegmentationTask::new(model, Box::new(sink.clone()), &config)
    }

    fn record(with_label: bool) -> BatchRecord<TestBackend> {
        let device = Default::default();
        let mask: Vec<f32> = (0..2 * 32 * 32).map(|i| ((i / 7) % 2) as f32).collect();
        let mut record = BatchRecord::new()
            .with_image(Tensor::ones([2, 3, 32, 32], &device))
            .with_mask(Tensor::from_data(TensorData::new(mask, [2, 1, 32, 32]), &device));
        for stage in PYRAMID_STAGES {
            record = record.with_stage(stage, Tensor::ones([2, 8, 2, 2], &device));
        }
        if with_label {
            record = record.with_label(Tensor::from_floats([[1.0], [0.0]], &device));
        }
        record
    }

    #[test]
    fn test_training_logs_batch_fscore() {
        let sink = MemorySink::new();
        let mut task = task(&sink);

        task.begin_phase(Phase::Train).unwrap();
        task.on_batch(Phase::Train, record(false)).unwrap();
        assert_eq!(task.on_phase_end(Phase::Train).unwrap(), None);

        let dsc = sink.scalar("train_dsc").unwrap();
        assert!((0.0..=1.0).contains(&dsc));
        assert!(sink.scalar("train_loss").is_some());
    }

    #[test]
    fn test_validation_epoch_reports_overlap_and_reference() {
        let sink = MemorySink::new();
        let mut task = task(&sink);

        task.begin_phase(Phase::Val).unwrap();
        task.on_batch(Phase::Val, record(true)).unwrap();
        task.on_batch(Phase::Val, record(true)).unwrap();
        let report = task.on_phase_end(Phase::Val).unwrap().unwrap();

        assert_eq!(report.samples, 4);
        assert!(report.dice.is_some());
        assert!(report.reference_delta().unwrap() <= 1e-4);
        for name in ["val_loss", "val_dsc", "val_smp", "val_smp_delta", "val_f1"] {
            assert!(sink.scalar(name).is_some(), "missing {name}");
        }
    }

    #[test]
    fn test_validation_requires_label() {
        let sink = MemorySink::new();
        let mut task = task(&sink);

        let err = task.on_batch(Phase::Val, record(false)).unwrap_err();
        assert!(matches!(err, ProbeError::MissingField("label")));
    }

    #[test]
    fn test_mask_shape_checked() {
        let sink = MemorySink::new();
        let mut task = task(&sink);
        let device = Default::default();

        let mut batch = record(true);
        batch.mask = Some(Tensor::zeros([2, 1, 16, 16], &device));
        let err = task.on_batch(Phase::Val, batch).unwrap_err();
        assert!(matches!(
            err,
            ProbeError::ShapeMismatch { stage: "segmentation loss", .. }
        ));
    }

    fn labelled_task(sink: &MemorySink, buffer_capacity: usize) -> SegmentationTask<TestBackend> {
        let device = Default::default();
        let model = UnetrDecoderConfig::new(8, 1, 3)
            .with_init_filters(2)
            .init(&device);
        let mut config = RunConfig::default();
        config.pixel_threshold = 10;
        config.buffer_capacity = buffer_capacity;
        SegmentationTask::new(model, Box::new(sink.clone()), &config)
    }

    #[test]
    fn test_rejected_batch_leaves_epoch_untouched() {
        let sink = MemorySink::new();
        let mut task = labelled_task(&sink, 1);

        task.begin_phase(Phase::Val).unwrap();
        task.on_batch(Phase::Val, record(true)).unwrap();
        let err = task.on_batch(Phase::Val, record(true)).unwrap_err();
        assert!(matches!(err, ProbeError::BufferFull(1)));

        let report = task.on_phase_end(Phase::Val).unwrap().unwrap();
        // Binary metrics, overlap and reference all cover the first batch only
        assert_eq!(report.samples, 2);
        assert!(report.reference_delta().unwrap() <= 1e-4);
        let losses = sink
            .emissions()
            .into_iter()
            .filter(|e| matches!(e, Emission::Scalar { name, .. } if name == "val_loss"))
            .count();
        assert_eq!(losses, 1);
    }

    #[test]
    fn test_label_shape_checked_before_folding() {
        let sink = MemorySink::new();
        let mut task = task(&sink);
        let device = Default::default();

        let batch = record(false).with_label(Tensor::zeros([2, 3], &device));
        task.begin_phase(Phase::Val).unwrap();
        let err = task.on_batch(Phase::Val, batch).unwrap_err();
        assert!(matches!(
            err,
            ProbeError::ShapeMismatch { stage: "segmentation labels", .. }
        ));
        assert!(sink.emissions().is_empty());
    }

    #[test]
    fn test_background_only_epoch_has_no_reference_gap() {
        let sink = MemorySink::new();
        let mut task = task(&sink);
        let device = Default::default();

        let mut batch = record(true).with_label(Tensor::zeros([2, 1], &device));
        batch.mask = Some(Tensor::zeros([2, 1, 32, 32], &device));

        task.begin_phase(Phase::Val).unwrap();
        task.on_batch(Phase::Val, batch).unwrap();
        let report = task.on_phase_end(Phase::Val).unwrap().unwrap();

        // Whatever the decoder predicts, Dice and the reference agree
        assert!(report.reference_delta().unwrap() <= 1e-4);
    }

    #[test]
    fn test_eval_batches_keep_batch_norm_statistics() {
        use burn::backend::Autodiff;

        type AdBackend = Autodiff<NdArray>;
        let device = Default::default();
        let sink = MemorySink::new();
        let model = UnetrDecoderConfig::new(8, 1, 3)
            .with_init_filters(2)
            .init::<AdBackend>(&device);
        let mut config = RunConfig::default();
        config.pixel_threshold = 10;
        let mut task = SegmentationTask::new(model, Box::new(sink.clone()), &config);

        let running_mean = |task: &SegmentationTask<AdBackend>| {
            task.model().decoder0[0]
                .bn1
                .running_mean
                .value_sync()
                .into_data()
                .to_vec::<f32>()
                .unwrap()
        };
        let batch = || {
            let mask: Vec<f32> = (0..2 * 32 * 32).map(|i| ((i / 7) % 2) as f32).collect();
            let image: Vec<f32> = (0..2 * 3 * 32 * 32).map(|i| (i % 11) as f32).collect();
            let mut record = BatchRecord::<AdBackend>::new()
                .with_image(Tensor::from_data(TensorData::new(image, [2, 3, 32, 32]), &device))
                .with_mask(Tensor::from_data(TensorData::new(mask, [2, 1, 32, 32]), &device))
                .with_label(Tensor::from_floats([[1.0], [0.0]], &device));
            for stage in PYRAMID_STAGES {
                record = record.with_stage(stage, Tensor::ones([2, 8, 2, 2], &device));
            }
            record
        };

        let initial = running_mean(&task);

        task.begin_phase(Phase::Val).unwrap();
        task.on_eval_batch(Phase::Val, batch()).unwrap();
        task.on_phase_end(Phase::Val).unwrap().unwrap();
        assert_eq!(running_mean(&task), initial);

        task.on_batch(Phase::Train, batch()).unwrap();
        assert_ne!(running_mean(&task), initial);
    }
}
