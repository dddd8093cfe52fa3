//! Convolution building blocks for the multi-scale decoder
//!
//! Every block is depthwise-separable where it carries a spatial kernel:
//! a per-channel convolution (groups = channels) followed by a 1x1
//! pointwise projection. Upsampling always goes through a kernel-2,
//! stride-2 transposed convolution, which exactly doubles height and width.

use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

/// Transposed convolution, kernel 2, stride 2, no padding.
#[derive(Module, Debug)]
pub struct SingleDeconv2dBlock<B: Backend> {
    pub block: ConvTranspose2d<B>,
}

impl<B: Backend> SingleDeconv2dBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, groups: usize, device: &B::Device) -> Self {
        let block = ConvTranspose2dConfig::new([in_channels, out_channels], [2, 2])
            .with_stride([2, 2])
            .with_padding([0, 0])
            .with_padding_out([0, 0])
            .with_groups(groups)
            .init(device);

        Self { block }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.block.forward(x)
    }
}

/// Stride-1 convolution with `(kernel_size - 1) / 2` padding on each side
#[derive(Module, Debug)]
pub struct SingleConv2dBlock<B: Backend> {
    pub block: Conv2d<B>,
}

impl<B: Backend> SingleConv2dBlock<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        groups: usize,
        device: &B::Device,
    ) -> Self {
        let padding = kernel_size.saturating_sub(1) / 2;
        let block = Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
            .with_stride([1, 1])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_groups(groups)
            .init(device);

        Self { block }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.block.forward(x)
    }
}

/// Same-resolution channel transform:
/// depthwise conv -> BatchNorm -> ReLU -> pointwise 1x1 -> BatchNorm -> ReLU
#[derive(Module, Debug)]
pub struct Conv2dBlock<B: Backend> {
    pub depthwise: SingleConv2dBlock<B>,
    pub bn1: BatchNorm<B, 2>,
    pub pointwise: SingleConv2dBlock<B>,
    pub bn2: BatchNorm<B, 2>,
    pub relu: Relu,
    out_channels: usize,
}

impl<B: Backend> Conv2dBlock<B> {
    /// Create a block with the default 3x3 depthwise kernel
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self::with_kernel(in_channels, out_channels, 3, device)
    }

    pub fn with_kernel(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            depthwise: SingleConv2dBlock::new(in_channels, in_channels, kernel_size, in_channels, device),
            bn1: BatchNormConfig::new(in_channels).init(device),
            pointwise: SingleConv2dBlock::new(in_channels, out_channels, 1, 1, device),
            bn2: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
            out_channels,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.depthwise.forward(x);
        let x = self.bn1.forward(x);
        let x = self.relu.forward(x);

        let x = self.pointwise.forward(x);
        let x = self.bn2.forward(x);
        self.relu.forward(x)
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }
}

/// Upsample (x2) followed by a [`Conv2dBlock`].
///
/// The upsampling transpose is depthwise, so the channel change happens only
/// in the trailing pointwise projection.
#[derive(Module, Debug)]
pub struct Deconv2dBlock<B: Backend> {
    pub upsample: SingleDeconv2dBlock<B>,
    pub conv: Conv2dBlock<B>,
}

impl<B: Backend> Deconv2dBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self::with_kernel(in_channels, out_channels, 3, device)
    }

    pub fn with_kernel(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            upsample: SingleDeconv2dBlock::new(in_channels, in_channels, in_channels, device),
            conv: Conv2dBlock::with_kernel(in_channels, out_channels, kernel_size, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.upsample.forward(x);
        self.conv.forward(x)
    }

    pub fn out_channels(&self) -> usize {
        self.conv.out_channels()
    }
}

/// Depthwise upsample (x2) then pointwise projection, no normalization.
/// Used at branch merge points.
#[derive(Module, Debug)]
pub struct SingleDwConv2dBlock<B: Backend> {
    pub upsample: SingleDeconv2dBlock<B>,
    pub project: SingleConv2dBlock<B>,
}

impl<B: Backend> SingleDwConv2dBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            upsample: SingleDeconv2dBlock::new(in_channels, in_channels, in_channels, device),
            project: SingleConv2dBlock::new(in_channels, out_channels, 1, 1, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.upsample.forward(x);
        self.project.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_single_deconv_doubles_spatial() {
        let device = Default::default();
        let block = SingleDeconv2dBlock::<TestBackend>::new(4, 4, 4, &device);

        let output = block.forward(Tensor::zeros([2, 4, 5, 7], &device));
        assert_eq!(output.dims(), [2, 4, 10, 14]);
    }

    #[test]
    fn test_single_conv_preserves_spatial() {
        let device = Default::default();
        for kernel_size in [1, 3, 5] {
            let block = SingleConv2dBlock::<TestBackend>::new(3, 6, kernel_size, 1, &device);
            let output = block.forward(Tensor::zeros([1, 3, 9, 9], &device));
            assert_eq!(output.dims(), [1, 6, 9, 9]);
        }
    }

    #[test]
    fn test_conv_block_changes_channels_only() {
        let device = Default::default();
        let block = Conv2dBlock::<TestBackend>::new(8, 16, &device);

        let output = block.forward(Tensor::ones([2, 8, 6, 6], &device));
        assert_eq!(output.dims(), [2, 16, 6, 6]);
        assert_eq!(block.out_channels(), 16);
    }

    #[test]
    fn test_conv_block_output_is_non_negative() {
        let device = Default::default();
        let block = Conv2dBlock::<TestBackend>::new(2, 3, &device);

        let input = Tensor::<TestBackend, 4>::random(
            [1, 2, 4, 4],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let min = block.forward(input).min().into_scalar();
        assert!(min >= 0.0);
    }

    #[test]
    fn test_deconv_block_upsamples_and_projects() {
        let device = Default::default();
        let block = Deconv2dBlock::<TestBackend>::new(8, 4, &device);

        let output = block.forward(Tensor::zeros([1, 8, 4, 4], &device));
        assert_eq!(output.dims(), [1, 4, 8, 8]);
    }

    #[test]
    fn test_dw_block_upsamples_and_projects() {
        let device = Default::default();
        let block = SingleDwConv2dBlock::<TestBackend>::new(16, 8, &device);

        let output = block.forward(Tensor::zeros([1, 16, 3, 3], &device));
        assert_eq!(output.dims(), [1, 8, 6, 6]);
    }
}
