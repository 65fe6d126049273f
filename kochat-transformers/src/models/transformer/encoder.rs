//! Transformer encoder.
use candle_core::Tensor;
use candle_nn::VarBuilder;
use snafu::{ResultExt, Snafu};

use crate::architectures::{BuildArchitecture, BuildEmbeddings, Embeddings};
use crate::architectures::{BuildEncoderLayer, Encoder, EncoderLayer, EncoderOutput};
use crate::error::BoxedError;
use crate::layers::attention::AttentionMask;
use crate::layers::transformer::{TransformerEmbeddingsConfig, TransformerLayerConfig};

/// Configuration of a post-norm transformer encoder, such as ELECTRA.
///
/// Every layer normalizes its own residual connections, so the encoder
/// has no final layer norm.
#[derive(Debug)]
pub struct TransformerEncoderConfig {
    embeddings: Box<dyn BuildEmbeddings>,
    layer: Box<dyn BuildEncoderLayer>,
    n_hidden_layers: usize,
}

impl TransformerEncoderConfig {
    /// Embeddings of the pieces, positions and types.
    ///
    /// Default: `TransformerEmbeddingsConfig::default()`
    pub fn embeddings(mut self, embeddings: Box<dyn BuildEmbeddings>) -> Self {
        self.embeddings = embeddings;
        self
    }

    /// Configuration shared by all layers.
    ///
    /// Default: `TransformerLayerConfig::default()`
    pub fn layer(mut self, layer: Box<dyn BuildEncoderLayer>) -> Self {
        self.layer = layer;
        self
    }

    /// Number of layers.
    ///
    /// Default: `12`
    pub fn n_hidden_layers(mut self, n_hidden_layers: usize) -> Self {
        self.n_hidden_layers = n_hidden_layers;
        self
    }
}

impl Default for TransformerEncoderConfig {
    fn default() -> Self {
        TransformerEncoderConfig {
            embeddings: Box::<TransformerEmbeddingsConfig>::default(),
            layer: Box::<TransformerLayerConfig>::default(),
            n_hidden_layers: 12,
        }
    }
}

impl BuildArchitecture for TransformerEncoderConfig {
    type Architecture = TransformerEncoder;

    fn build(&self, vb: VarBuilder) -> Result<Self::Architecture, BoxedError> {
        let embeddings = self
            .embeddings
            .build(vb.push_prefix("embeddings"))
            .context(BuildEmbeddingsSnafu)?;

        let mut layers = Vec::with_capacity(self.n_hidden_layers);
        for layer in 0..self.n_hidden_layers {
            layers.push(
                self.layer
                    .build_encoder_layer(vb.push_prefix(format!("layer_{layer}")))
                    .context(BuildLayerSnafu { layer })?,
            );
        }

        Ok(TransformerEncoder { embeddings, layers })
    }
}

#[derive(Debug, Snafu)]
pub enum TransformerEncoderError {
    #[snafu(display("Cannot build encoder embeddings"))]
    BuildEmbeddings { source: BoxedError },

    #[snafu(display("Cannot build encoder layer {layer}"))]
    BuildLayer { layer: usize, source: BoxedError },

    #[snafu(display("Cannot embed pieces"))]
    Embed { source: BoxedError },

    #[snafu(display("Cannot apply encoder layer {layer}"))]
    Layer { layer: usize, source: BoxedError },
}

/// Transformer encoder.
pub struct TransformerEncoder {
    embeddings: Box<dyn Embeddings>,
    layers: Vec<Box<dyn EncoderLayer>>,
}

impl Encoder for TransformerEncoder {
    fn forward_t(
        &self,
        piece_ids: &Tensor,
        attention_mask: &AttentionMask,
        positions: Option<&Tensor>,
        type_ids: Option<&Tensor>,
        train: bool,
    ) -> Result<EncoderOutput, BoxedError> {
        let mut hidden_states = Vec::with_capacity(self.layers.len() + 1);
        let mut hidden = self
            .embeddings
            .forward(piece_ids, train, positions, type_ids)
            .context(EmbedSnafu)?;

        for (layer, encoder_layer) in self.layers.iter().enumerate() {
            let next = encoder_layer
                .forward_t(&hidden, attention_mask, positions, train)
                .context(LayerSnafu { layer })?;
            hidden_states.push(hidden);
            hidden = next;
        }
        hidden_states.push(hidden);

        Ok(EncoderOutput::new(hidden_states))
    }
}
