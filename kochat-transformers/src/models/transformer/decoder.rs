//! Transformer decoder.
use candle_core::{ModuleT, Tensor};
use candle_nn::VarBuilder;
use snafu::{ensure, ResultExt, Snafu};

use crate::architectures::{BuildArchitecture, Embeddings};
use crate::architectures::{BuildDecoderLayer, Decoder, DecoderLayer, DecoderOutput};
use crate::error::BoxedError;
use crate::kv_cache::{KeyValueCache, LayerKeyValueCache, LayerKeyValueCacheError};
use crate::layers::attention::AttentionMask;
use crate::layers::build_module::BuildModule;
use crate::layers::identity::Identity;
use crate::layers::transformer::{
    TransformerEmbeddings, TransformerEmbeddingsConfig, TransformerEmbeddingsError,
    TransformerLayerConfig,
};

/// Configuration of a pre-norm transformer decoder, such as GPT-2.
///
/// Pre-norm layers leave their output unnormalized, so the output of the
/// last layer passes through `output_layer_norm`.
#[derive(Debug)]
pub struct TransformerDecoderConfig {
    embeddings: TransformerEmbeddingsConfig,
    layer: Box<dyn BuildDecoderLayer<Cache = LayerKeyValueCache>>,
    n_hidden_layers: usize,
    output_layer_norm: Box<dyn BuildModule>,
}

impl TransformerDecoderConfig {
    /// Embeddings of the pieces and their positions.
    ///
    /// Default: `TransformerEmbeddingsConfig::default()`
    pub fn embeddings(mut self, embeddings: TransformerEmbeddingsConfig) -> Self {
        self.embeddings = embeddings;
        self
    }

    /// Configuration shared by all layers.
    ///
    /// Default: `TransformerLayerConfig::default()`
    pub fn layer(mut self, layer: Box<dyn BuildDecoderLayer<Cache = LayerKeyValueCache>>) -> Self {
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

    /// Normalization of the last hidden state.
    ///
    /// Default: `Identity`
    pub fn output_layer_norm(mut self, output_layer_norm: Box<dyn BuildModule>) -> Self {
        self.output_layer_norm = output_layer_norm;
        self
    }
}

impl Default for TransformerDecoderConfig {
    fn default() -> Self {
        TransformerDecoderConfig {
            embeddings: TransformerEmbeddingsConfig::default(),
            layer: Box::<TransformerLayerConfig>::default(),
            n_hidden_layers: 12,
            output_layer_norm: Box::new(Identity),
        }
    }
}

impl BuildArchitecture for TransformerDecoderConfig {
    type Architecture = TransformerDecoder;

    fn build(&self, vb: VarBuilder) -> Result<Self::Architecture, BoxedError> {
        let embeddings = self
            .embeddings
            .build_embeddings(vb.push_prefix("embeddings"))
            .context(BuildEmbeddingsSnafu)?;

        let mut layers = Vec::with_capacity(self.n_hidden_layers);
        for layer in 0..self.n_hidden_layers {
            layers.push(
                self.layer
                    .build_decoder_layer(vb.push_prefix(format!("layer_{layer}")))
                    .context(BuildLayerSnafu { layer })?,
            );
        }

        let output_layer_norm = self
            .output_layer_norm
            .build(vb.push_prefix("output_layer_norm"))
            .context(BuildOutputLayerNormSnafu)?;

        Ok(TransformerDecoder {
            embeddings,
            layers,
            output_layer_norm,
        })
    }
}

#[derive(Debug, Snafu)]
pub enum TransformerDecoderError {
    #[snafu(display("Cannot build decoder embeddings"))]
    BuildEmbeddings { source: TransformerEmbeddingsError },

    #[snafu(display("Cannot build decoder layer {layer}"))]
    BuildLayer { layer: usize, source: BoxedError },

    #[snafu(display("Cannot build output layer norm"))]
    BuildOutputLayerNorm { source: BoxedError },

    #[snafu(display("Cannot get length of cached sequence"))]
    CacheLength { source: LayerKeyValueCacheError },

    #[snafu(display("Cannot embed pieces"))]
    Embed { source: BoxedError },

    #[snafu(display("Cannot apply decoder layer {layer}"))]
    Layer { layer: usize, source: BoxedError },

    #[snafu(display("Cannot apply output layer norm"))]
    OutputLayerNorm { source: candle_core::Error },

    #[snafu(display("Cannot create positions"))]
    Positions { source: candle_core::Error },

    #[snafu(display("Cannot decode {seq_len} pieces, the decoder has {n_positions} positions"))]
    SequenceTooLong { seq_len: usize, n_positions: usize },
}

/// Transformer decoder.
pub struct TransformerDecoder {
    embeddings: TransformerEmbeddings,
    layers: Vec<Box<dyn DecoderLayer<Cache = LayerKeyValueCache>>>,
    output_layer_norm: Box<dyn ModuleT>,
}

impl TransformerDecoder {
    pub fn embeddings(&self) -> &TransformerEmbeddings {
        &self.embeddings
    }

    /// Number of learned positions, which bounds the length of the
    /// cached and new pieces together.
    pub fn n_positions(&self) -> Option<usize> {
        self.embeddings.n_positions()
    }

    /// Positions of `piece_ids`, continuing after the cached pieces.
    fn positions(
        &self,
        piece_ids: &Tensor,
        cache: &KeyValueCache,
    ) -> Result<Tensor, TransformerDecoderError> {
        let (_, n_new) = piece_ids.dims2().context(PositionsSnafu)?;
        let start = cache.seq_len().context(CacheLengthSnafu)?;
        let end = start + n_new;
        if let Some(n_positions) = self.n_positions() {
            ensure!(
                end <= n_positions,
                SequenceTooLongSnafu {
                    seq_len: end,
                    n_positions
                }
            );
        }

        Tensor::arange(start as u32, end as u32, piece_ids.device())
            .and_then(|positions| positions.unsqueeze(0))
            .context(PositionsSnafu)
    }
}

impl Decoder for TransformerDecoder {
    type Cache = KeyValueCache;

    fn forward_t(
        &self,
        piece_ids: &Tensor,
        attention_mask: &AttentionMask,
        cache: &mut Self::Cache,
        positions: Option<&Tensor>,
        train: bool,
    ) -> Result<DecoderOutput, BoxedError> {
        let positions = match positions {
            Some(positions) => positions.clone(),
            None => self.positions(piece_ids, cache)?,
        };

        let mut hidden_states = Vec::with_capacity(self.layers.len() + 1);
        let mut hidden = self
            .embeddings
            .forward(piece_ids, train, Some(&positions), None)
            .context(EmbedSnafu)?;

        for (layer, decoder_layer) in self.layers.iter().enumerate() {
            let next = decoder_layer
                .forward_t(
                    &hidden,
                    attention_mask,
                    cache.layer_mut(layer),
                    Some(&positions),
                    train,
                )
                .context(LayerSnafu { layer })?;
            hidden_states.push(hidden);
            hidden = next;
        }

        let hidden = self
            .output_layer_norm
            .forward_t(&hidden, train)
            .context(OutputLayerNormSnafu)?;
        hidden_states.push(hidden);

        Ok(DecoderOutput::new(hidden_states))
    }
}
