//! Binary classification task
//!
//! Runs the linear probe over embeddings (or images, when the model has an
//! encoder), logs `{phase}_loss` for every batch and, in validation and test,
//! folds sigmoid probabilities into the phase aggregator.

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
use super::batch::{BatchRecord, ClassificationBatch, ProbeInput};
use super::loss::{BceWithLogitsLoss, LossFn};
use super::{EvalPhaseHandler, Phase, TrainablePhaseHandler};
use crate::model::classifier::ClassificationModel;
use crate::utils::config::RunConfig;
use crate::utils::error::{ProbeError, Result};
use crate::utils::sink::MetricSink;

pub struct ClassificationTask<B: Backend> {
    model: ClassificationModel<B>,
    loss: Box<dyn LossFn<B, 2>>,
    sink: Box<dyn MetricSink>,
    aggregators: PhaseAggregators,
    learning_rate: f64,
}

impl<B: Backend> ClassificationTask<B> {
    pub fn new(model: ClassificationModel<B>, sink: Box<dyn MetricSink>, config: &RunConfig) -> Self {
        Self {
            model,
            loss: Box::new(BceWithLogitsLoss),
            sink,
            aggregators: PhaseAggregators::new(config.buffer_limit()),
            learning_rate: config.learning_rate,
        }
    }

    /// Replace the default BCE-with-logits loss
    pub fn with_loss(mut self, loss: Box<dyn LossFn<B, 2>>) -> Self {
        self.loss = loss;
        self
    }

    pub fn into_model(self) -> ClassificationModel<B> {
        self.model
    }

    /// Loss, logging and aggregation for one batch of logits
    fn score(&mut self, phase: Phase, logits: Tensor<B, 2>, label: Tensor<B, 2>) -> Result<Tensor<B, 1>> {
        if logits.dims() != label.dims() {
            return Err(ProbeError::ShapeMismatch {
                stage: "classification loss",
                expected: logits.dims().to_vec(),
                actual: label.dims().to_vec(),
            });
        }

        let loss = self.loss.forward(logits.clone(), label.clone());
        let loss_value: f64 = loss.clone().into_scalar().elem();
        self.sink
            .log_scalar(&format!("{}loss", phase.prefix()), loss_value)?;

        if let Some(aggregator) = self.aggregators.get_mut(phase) {
            aggregator.update(sigmoid(logits.detach()), label)?;
        }

        Ok(loss)
    }
}

fn probe_logits<B: Backend>(model: &ClassificationModel<B>, input: ProbeInput<B>) -> Result<Tensor<B, 2>> {
    match input {
        ProbeInput::Embeddings(embs) => Ok(model.forward_embeddings(embs)),
        ProbeInput::Images(images) => model.forward_images(images),
    }
}

impl<B: Backend> TrainablePhaseHandler<B> for ClassificationTask<B> {
    type Model = ClassificationModel<B>;

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
        let ClassificationBatch { input, label } =
            ClassificationBatch::from_record(batch, self.model.has_encoder())?;

        let logits = probe_logits(&self.model, input)?;
        self.score(phase, logits, label)
    }

    fn on_phase_end(&mut self, phase: Phase) -> Result<Option<EpochReport>> {
        let report = self.aggregators.finish(phase, self.sink.as_mut())?;
        if let Some(report) = &report {
            info!(
                "{} epoch: accuracy {:.4}, f1 {:.4}, specificity {:.4}",
                phase, report.accuracy, report.f1, report.specificity
            );
        }
        Ok(report)
    }
}

impl<B: AutodiffBackend> EvalPhaseHandler<B> for ClassificationTask<B> {
    fn on_eval_batch(&mut self, phase: Phase, batch: BatchRecord<B>) -> Result<Tensor<B, 1>> {
        let ClassificationBatch { input, label } =
            ClassificationBatch::from_record(batch, self.model.has_encoder())?;

        let logits = probe_logits(&self.model.valid(), input.inner())?;
        self.score(phase, Tensor::from_inner(logits), label)
    }
}
