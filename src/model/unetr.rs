//! UNETR-style multi-scale decoder
//!
//! Fuses a five-level feature pyramid `(z0, z3, z6, z9, z12)` into
//! full-resolution per-pixel logits. Branches run deepest first; each merge
//! concatenates `[shallower branch, accumulated deeper result]` on the
//! channel axis and upsamples the fused map by two.
//!
//! With `f = init_filters` and `tw = transformer_width`:
//!
//! ```text
//! z12 ── dw-up(tw→8f) ─────────────────────────┐
//! z9  ── deconv(tw→8f) ────────────── cat 16f ─┴─ conv×3 → dw-up(8f→4f) ─┐
//! z6  ── deconv(tw→8f→4f) ─────────── cat 8f ───────── conv×2 → dw-up(4f→2f) ─┐
//! z3  ── deconv(tw→8f→4f→2f) ──────── cat 4f ───────── conv×2 → dw-up(2f→f) ──┐
//! z0  ── conv(in→f→f) ─────────────── cat 2f ───────── conv×2 → 1x1(f→out)
//! ```
//!
//! When `z3..z12` share spatial size `S`, the fused map meeting `z0` is
//! `16·S` wide, so `z0` has to be that size. Nothing is checked at
//! construction; every merge point checks its operands on the forward pass.

use burn::{
    config::Config,
    module::Module,
    tensor::{
        backend::{AutodiffBackend, Backend},
        Tensor,
    },
};
use tracing::{debug, info};

use super::blocks::{Conv2dBlock, Deconv2dBlock, SingleConv2dBlock, SingleDwConv2dBlock};
use crate::utils::error::{self, ProbeError};

/// Configuration for the multi-scale decoder
#[derive(Config, Debug)]
pub struct UnetrDecoderConfig {
    /// Channel count of `z3`, `z6`, `z9` and `z12`
    pub transformer_width: usize,
    /// Number of output channels (classes)
    pub output_dim: usize,
    /// Channel count of `z0`
    pub input_dim: usize,
    /// Base channel width, doubled per level going deeper
    #[config(default = "32")]
    pub init_filters: usize,
}

impl UnetrDecoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> UnetrDecoder<B> {
        let f = self.init_filters;
        let tw = self.transformer_width;

        let decoder = UnetrDecoder {
            decoder0: vec![
                Conv2dBlock::new(self.input_dim, f, device),
                Conv2dBlock::new(f, f, device),
            ],
            decoder3: vec![
                Deconv2dBlock::new(tw, 8 * f, device),
                Deconv2dBlock::new(8 * f, 4 * f, device),
                Deconv2dBlock::new(4 * f, 2 * f, device),
            ],
            decoder6: vec![
                Deconv2dBlock::new(tw, 8 * f, device),
                Deconv2dBlock::new(8 * f, 4 * f, device),
            ],
            decoder9: Deconv2dBlock::new(tw, 8 * f, device),
            decoder12_upsampler: SingleDwConv2dBlock::new(tw, 8 * f, device),
            decoder9_upsampler: FusionStage::new(&[16 * f, 8 * f, 8 * f, 8 * f], 4 * f, device),
            decoder6_upsampler: FusionStage::new(&[8 * f, 4 * f, 4 * f], 2 * f, device),
            decoder3_upsampler: FusionStage::new(&[4 * f, 2 * f, 2 * f], f, device),
            decoder0_header: DecoderHead::new(2 * f, f, self.output_dim, device),
            input_dim: self.input_dim,
            transformer_width: tw,
            output_dim: self.output_dim,
        };

        info!(
            "Built UNETR decoder (width {}, filters {}, {} -> {}) with {} parameters",
            tw,
            f,
            self.input_dim,
            self.output_dim,
            decoder.num_params()
        );

        decoder
    }
}

/// The five inputs of the decoder, shallowest first
#[derive(Debug, Clone)]
pub struct FeaturePyramid<B: Backend> {
    /// Raw input level, `input_dim` channels
    pub z0: Tensor<B, 4>,
    pub z3: Tensor<B, 4>,
    pub z6: Tensor<B, 4>,
    pub z9: Tensor<B, 4>,
    pub z12: Tensor<B, 4>,
}

impl<B: AutodiffBackend> FeaturePyramid<B> {
    /// The same levels on the inner backend, without gradient tracking
    pub fn inner(self) -> FeaturePyramid<B::InnerBackend> {
        FeaturePyramid {
            z0: self.z0.inner(),
            z3: self.z3.inner(),
            z6: self.z6.inner(),
            z9: self.z9.inner(),
            z12: self.z12.inner(),
        }
    }
}

/// Shapes of the two operands concatenated at one merge point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePoint {
    pub stage: &'static str,
    pub shallow: [usize; 4],
    pub deep: [usize; 4],
}

impl MergePoint {
    /// Channel count of the concatenated result
    pub fn fused_channels(&self) -> usize {
        self.shallow[1] + self.deep[1]
    }
}

/// Conv blocks at one resolution followed by an upsample-and-project step
#[derive(Module, Debug)]
pub struct FusionStage<B: Backend> {
    pub convs: Vec<Conv2dBlock<B>>,
    pub upsample: SingleDwConv2dBlock<B>,
}

impl<B: Backend> FusionStage<B> {
    /// `widths` lists the channel count entering each conv block and, last,
    /// the count leaving the final one.
    fn new(widths: &[usize], out_channels: usize, device: &B::Device) -> Self {
        let convs = widths
            .windows(2)
            .map(|pair| Conv2dBlock::new(pair[0], pair[1], device))
            .collect();
        let last = widths.last().copied().unwrap_or(out_channels);

        Self {
            convs,
            upsample: SingleDwConv2dBlock::new(last, out_channels, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.convs.iter().fold(x, |x, block| block.forward(x));
        self.upsample.forward(x)
    }
}

/// Final conv blocks and the 1x1 projection to logits
#[derive(Module, Debug)]
pub struct DecoderHead<B: Backend> {
    pub convs: Vec<Conv2dBlock<B>>,
    pub logits: SingleConv2dBlock<B>,
}

impl<B: Backend> DecoderHead<B> {
    fn new(in_channels: usize, filters: usize, output_dim: usize, device: &B::Device) -> Self {
        Self {
            convs: vec![
                Conv2dBlock::new(in_channels, filters, device),
                Conv2dBlock::new(filters, filters, device),
            ],
            logits: SingleConv2dBlock::new(filters, output_dim, 1, 1, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.convs.iter().fold(x, |x, block| block.forward(x));
        self.logits.forward(x)
    }
}

/// Multi-scale decoder producing `[batch, output_dim, H, W]` logits
#[derive(Module, Debug)]
pub struct UnetrDecoder<B: Backend> {
    pub decoder0: Vec<Conv2dBlock<B>>,
    pub decoder3: Vec<Deconv2dBlock<B>>,
    pub decoder6: Vec<Deconv2dBlock<B>>,
    pub decoder9: Deconv2dBlock<B>,
    pub decoder12_upsampler: SingleDwConv2dBlock<B>,
    pub decoder9_upsampler: FusionStage<B>,
    pub decoder6_upsampler: FusionStage<B>,
    pub decoder3_upsampler: FusionStage<B>,
    pub decoder0_header: DecoderHead<B>,
    input_dim: usize,
    transformer_width: usize,
    output_dim: usize,
}

impl<B: Backend> UnetrDecoder<B> {
    /// Decode a feature pyramid into per-pixel logits.
    ///
    /// Fails with [`ProbeError::ShapeMismatch`] when an input has the wrong
    /// channel count or two operands of a merge disagree on batch or
    /// spatial size.
    pub fn forward(&self, pyramid: FeaturePyramid<B>) -> error::Result<Tensor<B, 4>> {
        self.fuse(pyramid, None)
    }

    /// Like [`forward`](Self::forward), also returning the operand shapes at
    /// every merge point, deepest first.
    pub fn forward_traced(
        &self,
        pyramid: FeaturePyramid<B>,
    ) -> error::Result<(Tensor<B, 4>, Vec<MergePoint>)> {
        let mut trace = Vec::with_capacity(4);
        let output = self.fuse(pyramid, Some(&mut trace))?;
        Ok((output, trace))
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    fn fuse(
        &self,
        pyramid: FeaturePyramid<B>,
        mut trace: Option<&mut Vec<MergePoint>>,
    ) -> error::Result<Tensor<B, 4>> {
        let FeaturePyramid { z0, z3, z6, z9, z12 } = pyramid;

        check_channels("z0", &z0, self.input_dim)?;
        for (stage, z) in [("z3", &z3), ("z6", &z6), ("z9", &z9), ("z12", &z12)] {
            check_channels(stage, z, self.transformer_width)?;
        }

        let z12 = self.decoder12_upsampler.forward(z12);

        let z9 = self.decoder9.forward(z9);
        let z9 = merge("decoder9 merge", z9, z12, trace.as_deref_mut())?;
        let z9 = self.decoder9_upsampler.forward(z9);

        let z6 = self.decoder6.iter().fold(z6, |x, block| block.forward(x));
        let z6 = merge("decoder6 merge", z6, z9, trace.as_deref_mut())?;
        let z6 = self.decoder6_upsampler.forward(z6);

        let z3 = self.decoder3.iter().fold(z3, |x, block| block.forward(x));
        let z3 = merge("decoder3 merge", z3, z6, trace.as_deref_mut())?;
        let z3 = self.decoder3_upsampler.forward(z3);

        let z0 = self.decoder0.iter().fold(z0, |x, block| block.forward(x));
        let z0 = merge("decoder0 merge", z0, z3, trace.as_deref_mut())?;

        Ok(self.decoder0_header.forward(z0))
    }
}

fn check_channels<B: Backend>(stage: &'static str, x: &Tensor<B, 4>, channels: usize) -> error::Result<()> {
    let dims = x.dims();
    if dims[1] != channels {
        return Err(ProbeError::ShapeMismatch {
            stage,
            expected: vec![dims[0], channels, dims[2], dims[3]],
            actual: dims.to_vec(),
        });
    }
    Ok(())
}

/// Concatenate `[shallow, deep]` along channels after checking that batch
/// and spatial dims agree.
fn merge<B: Backend>(
    stage: &'static str,
    shallow: Tensor<B, 4>,
    deep: Tensor<B, 4>,
    trace: Option<&mut Vec<MergePoint>>,
) -> error::Result<Tensor<B, 4>> {
    let s = shallow.dims();
    let d = deep.dims();

    if s[0] != d[0] || s[2] != d[2] || s[3] != d[3] {
        return Err(ProbeError::ShapeMismatch {
            stage,
            expected: vec![s[0], d[1], s[2], s[3]],
            actual: d.to_vec(),
        });
    }

    debug!("{}: {:?} + {:?}", stage, s, d);
    if let Some(trace) = trace {
        trace.push(MergePoint {
            stage,
            shallow: s,
            deep: d,
        });
    }

    Ok(Tensor::cat(vec![shallow, deep], 1))
}
