//! Image encoder for the classification probe
//!
//! A small convolutional stack that maps raw images to a fixed-size
//! embedding. It stands in for any upstream feature extractor whose output
//! the linear probe is trained on.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

/// Configuration for [`ConvEncoder`]
#[derive(Config, Debug)]
pub struct ConvEncoderConfig {
    /// Number of input channels (3 for RGB)
    #[config(default = "3")]
    pub in_channels: usize,

    /// Filters in the first block, doubled in the second
    #[config(default = "16")]
    pub base_filters: usize,

    /// Width of the produced embedding
    #[config(default = "64")]
    pub embedding_dim: usize,
}

impl ConvEncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvEncoder<B> {
        let base = self.base_filters;

        ConvEncoder {
            blocks: vec![
                EncoderBlock::new(self.in_channels, base, true, device),
                EncoderBlock::new(base, base * 2, true, device),
                EncoderBlock::new(base * 2, self.embedding_dim, false, device),
            ],
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            embedding_dim: self.embedding_dim,
        }
    }
}

/// Conv2d, BatchNorm, ReLU and an optional 2x2 max-pool
#[derive(Module, Debug)]
pub struct EncoderBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
    pub relu: Relu,
    pub pool: Option<MaxPool2d>,
}

impl<B: Backend> EncoderBlock<B> {
    fn new(in_channels: usize, out_channels: usize, with_pool: bool, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);

        let pool = with_pool.then(|| MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init());

        Self {
            conv,
            bn: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
            pool,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        let x = self.relu.forward(x);

        match &self.pool {
            Some(pool) => pool.forward(x),
            None => x,
        }
    }
}

/// Raw image `[batch, channels, h, w]` to embedding `[batch, embedding_dim]`
#[derive(Module, Debug)]
pub struct ConvEncoder<B: Backend> {
    pub blocks: Vec<EncoderBlock<B>>,
    pub global_pool: AdaptiveAvgPool2d,
    embedding_dim: usize,
}

impl<B: Backend> ConvEncoder<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.blocks.iter().fold(x, |x, block| block.forward(x));

        // [B, C, 1, 1] -> [B, C]
        let x = self.global_pool.forward(x);
        let [batch_size, channels, _, _] = x.dims();
        x.reshape([batch_size, channels])
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_encoder_embedding_shape() {
        let device = Default::default();
        let encoder = ConvEncoderConfig::new()
            .with_base_filters(4)
            .with_embedding_dim(12)
            .init::<TestBackend>(&device);

        let output = encoder.forward(Tensor::zeros([2, 3, 32, 32], &device));
        assert_eq!(output.dims(), [2, 12]);
        assert_eq!(encoder.embedding_dim(), 12);
    }

    #[test]
    fn test_encoder_accepts_any_resolution() {
        let device = Default::default();
        let encoder = ConvEncoderConfig::new()
            .with_base_filters(2)
            .with_embedding_dim(5)
            .init::<TestBackend>(&device);

        let output = encoder.forward(Tensor::zeros([1, 3, 20, 28], &device));
        assert_eq!(output.dims(), [1, 5]);
    }
}
