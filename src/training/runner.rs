//! Reference driver for [`TrainablePhaseHandler`]
//!
//! Iterates the batches of one phase, steps the optimizer on every training
//! batch and closes the phase. Validation and test batches run on the
//! inference copy of the model. Any scheduler honouring the same call order
//! can replace it.

use std::marker::PhantomData;

use burn::{
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, ElementConversion},
};

use super::aggregator::EpochReport;
use super::batch::BatchRecord;
use super::{EvalPhaseHandler, Phase, TrainablePhaseHandler};
use crate::utils::error::Result;
use crate::utils::logging::PhaseLogger;
use crate::utils::metrics::RunningAverage;

/// Outcome of one phase
#[derive(Debug, Clone)]
pub struct PhaseSummary {
    pub phase: Phase,
    pub batches: usize,
    pub mean_loss: f64,
    pub report: Option<EpochReport>,
}

pub struct PhaseRunner<B, H, O>
where
    B: AutodiffBackend,
    H: EvalPhaseHandler<B>,
    H::Model: AutodiffModule<B>,
    O: Optimizer<H::Model, B>,
{
    handler: H,
    optimizer: O,
    epoch: usize,
    _backend: PhantomData<B>,
}

impl<B, H, O> PhaseRunner<B, H, O>
where
    B: AutodiffBackend,
    H: EvalPhaseHandler<B>,
    H::Model: AutodiffModule<B>,
    O: Optimizer<H::Model, B>,
{
    pub fn new(handler: H, optimizer: O) -> Self {
        Self {
            handler,
            optimizer,
            epoch: 0,
            _backend: PhantomData,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Run one phase over `batches`
    pub fn run_phase<I>(&mut self, phase: Phase, batches: I) -> Result<PhaseSummary>
    where
        I: IntoIterator<Item = BatchRecord<B>>,
    {
        self.handler.begin_phase(phase)?;
        let mut logger = PhaseLogger::start(phase.name(), self.epoch);
        let mut losses = RunningAverage::new();

        for batch in batches {
            let loss = if phase == Phase::Train {
                self.handler.on_batch(phase, batch)?
            } else {
                self.handler.on_eval_batch(phase, batch)?
            };
            let loss_value: f64 = loss.clone().into_scalar().elem();
            losses.add(loss_value);
            logger.batch_done(loss_value);

            if phase == Phase::Train {
                let grads = loss.backward();
                let grads = GradientsParams::from_grads(grads, self.handler.model());
                let model = self.handler.model().clone();
                let model = self
                    .optimizer
                    .step(self.handler.learning_rate(), model, grads);
                self.handler.set_model(model);
            }
        }

        let report = self.handler.on_phase_end(phase)?;
        logger.finish(losses.average());

        Ok(PhaseSummary {
            phase,
            batches: losses.count(),
            mean_loss: losses.average(),
            report,
        })
    }

    /// Train then validate, then advance the epoch counter
    pub fn run_epoch<T, V>(&mut self, train: T, val: V) -> Result<(PhaseSummary, PhaseSummary)>
    where
        T: IntoIterator<Item = BatchRecord<B>>,
        V: IntoIterator<Item = BatchRecord<B>>,
    {
        let train = self.run_phase(Phase::Train, train)?;
        let val = self.run_phase(Phase::Val, val)?;
        self.epoch += 1;
        Ok((train, val))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::classifier::{ClassificationModel, ClassificationModelConfig};
    use crate::training::classification::ClassificationTask;
    use crate::training::configure_optimizers;
    use crate::utils::config::RunConfig;
    use crate::utils::sink::MemorySink;
    use burn::backend::{Autodiff, NdArray};
    use burn::module::Module;
    use burn::tensor::{Tensor, TensorData};

    type TestBackend = Autodiff<NdArray>;

    fn batches(n: usize) -> Vec<BatchRecord<TestBackend>> {
        let device = Default::default();
        (0..n)
            .map(|i| {
                let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
                BatchRecord::new()
                    .with_embedding_vector(Tensor::from_data(
                        TensorData::new(vec![sign, sign, 0.5 * sign, 0.0f32], [1, 4]),
                        &device,
                    ))
                    .with_label(Tensor::from_data(
                        TensorData::new(vec![if sign > 0.0 { 1.0f32 } else { 0.0 }], [1, 1]),
                        &device,
                    ))
            })
            .collect()
    }

    fn runner(
        sink: &MemorySink,
    ) -> PhaseRunner<TestBackend, ClassificationTask<TestBackend>, impl Optimizer<ClassificationModel<TestBackend>, TestBackend>> {
        let device = Default::default();
        let model = ClassificationModelConfig::new(4).init(&device).unwrap();
        let task = ClassificationTask::new(model, Box::new(sink.clone()), &RunConfig::default());
        PhaseRunner::new(
            task,
            configure_optimizers::<TestBackend, ClassificationModel<TestBackend>>(),
        )
    }

    #[test]
    fn test_training_phase_updates_parameters() {
        let sink = MemorySink::new();
        let mut runner = runner(&sink);
        let before = runner.handler().model().probe.weight.val().into_data().to_vec::<f32>().unwrap();

        let summary = runner.run_phase(Phase::Train, batches(4)).unwrap();
        assert_eq!(summary.batches, 4);
        assert!(summary.report.is_none());

        let after = runner.handler().model().probe.weight.val().into_data().to_vec::<f32>().unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_epoch_runs_train_then_validation() {
        let sink = MemorySink::new();
        let mut runner = runner(&sink);

        let (train, val) = runner.run_epoch(batches(2), batches(4)).unwrap();
        assert_eq!(train.phase, Phase::Train);
        assert_eq!(val.report.unwrap().samples, 4);
        assert_eq!(runner.epoch(), 1);
        assert!(sink.scalar("val_f1").is_some());
        assert!(runner.handler().model().num_params() > 0);
    }

    fn first_conv_weight<O>(runner: &PhaseRunner<TestBackend, ClassificationTask<TestBackend>, O>) -> Vec<f32>
    where
        O: Optimizer<ClassificationModel<TestBackend>, TestBackend>,
    {
        runner.handler().model().encoder.as_ref().unwrap().blocks[0]
            .conv
            .weight
            .val()
            .into_data()
            .to_vec::<f32>()
            .unwrap()
    }

    #[test]
    fn test_frozen_encoder_untouched_by_training() {
        use crate::model::encoder::ConvEncoderConfig;

        let device = Default::default();
        let sink = MemorySink::new();
        let model = ClassificationModelConfig::new(4)
            .with_encoder(Some(ConvEncoderConfig::new().with_base_filters(2).with_embedding_dim(4)))
            .init::<TestBackend>(&device)
            .unwrap();
        let task = ClassificationTask::new(model, Box::new(sink.clone()), &RunConfig::default());
        let mut runner = PhaseRunner::new(
            task,
            configure_optimizers::<TestBackend, ClassificationModel<TestBackend>>(),
        );

        let before = first_conv_weight(&runner);

        let batch = BatchRecord::new()
            .with_image(Tensor::ones([2, 3, 8, 8], &device))
            .with_label(Tensor::from_floats([[1.0], [0.0]], &device));
        runner.run_phase(Phase::Train, vec![batch]).unwrap();

        assert_eq!(before, first_conv_weight(&runner));
    }

    #[test]
    fn test_validation_phase_leaves_batch_norm_statistics() {
        use crate::model::encoder::ConvEncoderConfig;

        let device = Default::default();
        let sink = MemorySink::new();
        let model = ClassificationModelConfig::new(4)
            .with_encoder(Some(ConvEncoderConfig::new().with_base_filters(2).with_embedding_dim(4)))
            .with_freeze_encoder(false)
            .init::<TestBackend>(&device)
            .unwrap();
        let task = ClassificationTask::new(model, Box::new(sink.clone()), &RunConfig::default());
        let mut runner = PhaseRunner::new(
            task,
            configure_optimizers::<TestBackend, ClassificationModel<TestBackend>>(),
        );

        let running_mean = runner.handler().model().encoder.as_ref().unwrap().blocks[0]
            .bn
            .running_mean
            .value_sync()
            .into_data()
            .to_vec::<f32>()
            .unwrap();

        let pixels: Vec<f32> = (0..2 * 3 * 8 * 8).map(|i| (i % 5) as f32 - 1.0).collect();
        let batch = BatchRecord::new()
            .with_image(Tensor::from_data(TensorData::new(pixels, [2, 3, 8, 8]), &device))
            .with_label(Tensor::from_floats([[1.0], [0.0]], &device));
        let summary = runner.run_phase(Phase::Val, vec![batch]).unwrap();
        assert_eq!(summary.report.unwrap().samples, 2);

        let after = runner.handler().model().encoder.as_ref().unwrap().blocks[0]
            .bn
            .running_mean
            .value_sync()
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert_eq!(running_mean, after);
    }
}
