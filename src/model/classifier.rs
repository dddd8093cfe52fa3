//! Linear probe classifier
//!
//! One linear layer over an embedding, optionally preceded by an image
//! encoder. Which input a batch must carry depends only on whether the
//! model was built with an encoder.

use burn::{
    config::Config,
    module::Module,
    nn::{Linear, LinearConfig},
    tensor::{backend::Backend, Tensor},
};
use tracing::info;

use super::encoder::{ConvEncoder, ConvEncoderConfig};
use crate::utils::error::{self, ProbeError};

/// Configuration for [`ClassificationModel`]
#[derive(Config, Debug)]
pub struct ClassificationModelConfig {
    /// Width of the embedding fed to the probe
    pub input_dim: usize,

    /// Number of output logits
    #[config(default = "1")]
    pub num_classes: usize,

    /// Encoder to run on raw images; `None` means batches carry embeddings
    #[config(default = "None")]
    pub encoder: Option<ConvEncoderConfig>,

    /// Exclude encoder parameters from gradient computation
    #[config(default = "true")]
    pub freeze_encoder: bool,
}

impl ClassificationModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<ClassificationModel<B>> {
        let encoder = match &self.encoder {
            Some(config) => {
                if config.embedding_dim != self.input_dim {
                    return Err(ProbeError::Config(format!(
                        "encoder embedding_dim {} does not match probe input_dim {}",
                        config.embedding_dim, self.input_dim
                    )));
                }
                let encoder = config.init(device);
                Some(if self.freeze_encoder { encoder.no_grad() } else { encoder })
            }
            None => None,
        };

        let model = ClassificationModel {
            encoder,
            probe: LinearConfig::new(self.input_dim, self.num_classes).init(device),
            num_classes: self.num_classes,
            freeze_encoder: self.freeze_encoder,
        };

        info!(
            "Built classification model: total {} parameters, trainable {}",
            model.num_params(),
            model.num_trainable_params()
        );

        Ok(model)
    }
}

/// Optional encoder followed by a linear probe
#[derive(Module, Debug)]
pub struct ClassificationModel<B: Backend> {
    pub encoder: Option<ConvEncoder<B>>,
    pub probe: Linear<B>,
    num_classes: usize,
    freeze_encoder: bool,
}

impl<B: Backend> ClassificationModel<B> {
    /// Logits `[batch, num_classes]` from ready-made embeddings
    pub fn forward_embeddings(&self, embs: Tensor<B, 2>) -> Tensor<B, 2> {
        self.probe.forward(embs)
    }

    /// Logits `[batch, num_classes]` from raw images; needs an encoder
    pub fn forward_images(&self, images: Tensor<B, 4>) -> error::Result<Tensor<B, 2>> {
        let encoder = self.encoder.as_ref().ok_or_else(|| {
            ProbeError::Config("model was built without an encoder".to_string())
        })?;
        Ok(self.probe.forward(encoder.forward(images)))
    }

    pub fn has_encoder(&self) -> bool {
        self.encoder.is_some()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Parameters that receive gradients
    pub fn num_trainable_params(&self) -> usize {
        match &self.encoder {
            Some(encoder) if !self.freeze_encoder => encoder.num_params() + self.probe.num_params(),
            _ => self.probe.num_params(),
        }
    }
}
