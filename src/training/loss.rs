//! Pluggable losses
//!
//! A loss reduces `(logits, targets)` of the same shape to a single-element
//! tensor. Tasks hold one behind `Box<dyn LossFn<B, D>>`, so swapping the
//! loss does not touch the model or the metric code.

use burn::tensor::{activation::sigmoid, backend::Backend, Tensor};

/// `(logits, targets) -> scalar loss`
pub trait LossFn<B: Backend, const D: usize> {
    fn forward(&self, logits: Tensor<B, D>, targets: Tensor<B, D>) -> Tensor<B, 1>;

    fn name(&self) -> &'static str;
}

/// Binary cross-entropy on raw logits, averaged over every element.
///
/// Uses `max(x, 0) - x * y + ln(1 + exp(-|x|))`, which stays finite for
/// large logits.
#[derive(Debug, Clone, Copy, Default)]
pub struct BceWithLogitsLoss;

impl<B: Backend, const D: usize> LossFn<B, D> for BceWithLogitsLoss {
    fn forward(&self, logits: Tensor<B, D>, targets: Tensor<B, D>) -> Tensor<B, 1> {
        let positive = logits.clone().clamp_min(0.0);
        let cross = logits.clone() * targets;
        let soft = logits.abs().neg().exp().log1p();

        (positive - cross + soft).mean()
    }

    fn name(&self) -> &'static str {
        "bce_with_logits"
    }
}

/// Generalized Dice loss over `[batch, channels, h, w]` logits.
///
/// Sigmoid activation, per-channel weights `1 / (sum of target)^2`. A
/// channel with an empty target gets the largest weight of its sample
/// instead of an infinite one.
#[derive(Debug, Clone, Copy)]
pub struct GeneralizedDiceLoss {
    pub smooth_nr: f32,
    pub smooth_dr: f32,
}

impl Default for GeneralizedDiceLoss {
    fn default() -> Self {
        Self {
            smooth_nr: 1e-5,
            smooth_dr: 1e-5,
        }
    }
}

impl<B: Backend> LossFn<B, 4> for GeneralizedDiceLoss {
    fn forward(&self, logits: Tensor<B, 4>, targets: Tensor<B, 4>) -> Tensor<B, 1> {
        let [batch, channels, _, _] = logits.dims();
        let probs = sigmoid(logits);

        let spatial_sum = |x: Tensor<B, 4>| x.sum_dim(3).sum_dim(2).reshape([batch, channels]);
        let intersection = spatial_sum(probs.clone() * targets.clone());
        let ground = spatial_sum(targets);
        let predicted = spatial_sum(probs);
        let denominator = ground.clone() + predicted;

        let empty = ground.clone().equal_elem(0.0);
        let squared = ground.powf_scalar(2.0).mask_fill(empty.clone(), 1.0);
        let weights = squared.recip().mask_fill(empty.clone(), 0.0);
        let row_max = weights.clone().max_dim(1).repeat_dim(1, channels);
        let weights = weights.mask_where(empty, row_max);

        let numerator = (intersection * weights.clone())
            .sum_dim(1)
            .mul_scalar(2.0)
            .add_scalar(self.smooth_nr);
        let denominator = (denominator * weights).sum_dim(1).add_scalar(self.smooth_dr);

        (numerator / denominator).neg().add_scalar(1.0).mean()
    }

    fn name(&self) -> &'static str {
        "generalized_dice"
    }
}
