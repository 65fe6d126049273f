//! Transformer layer shared by the GPT-2 decoder and the ELECTRA encoder.
use candle_core::{ModuleT, Tensor};
use candle_nn::VarBuilder;
use snafu::{ResultExt, Snafu};

use crate::architectures::{BuildDecoderLayer, BuildEncoderLayer, DecoderLayer, EncoderLayer};
use crate::error::BoxedError;
use crate::kv_cache::LayerKeyValueCache;
use crate::layers::attention::{Attention, AttentionMask, BuildAttention, SelfAttentionConfig};
use crate::layers::build_module::BuildModule;
use crate::layers::feedforward::PointwiseFeedForwardConfig;
use crate::layers::identity::Identity;

/// Transformer layer configuration.
///
/// The same configuration describes pre-norm layers (GPT-2), where the
/// attention and feed-forward blocks normalize their inputs, and post-norm
/// layers (BERT, ELECTRA), where the residual connections are normalized.
#[derive(Debug)]
pub struct TransformerLayerConfig {
    attention: SelfAttentionConfig,
    attn_residual_layer_norm: Box<dyn BuildModule>,
    feedforward: PointwiseFeedForwardConfig,
    ffn_residual_layer_norm: Box<dyn BuildModule>,
}

impl TransformerLayerConfig {
    /// Attention block configuration.
    ///
    /// Default: `SelfAttentionConfig::default()`
    pub fn attention(mut self, attention: SelfAttentionConfig) -> Self {
        self.attention = attention;
        self
    }

    /// Normalization of the attention output after the residual connection.
    ///
    /// Default: `Identity`
    pub fn attn_residual_layer_norm(mut self, attn_residual_layer_norm: Box<dyn BuildModule>) -> Self {
        self.attn_residual_layer_norm = attn_residual_layer_norm;
        self
    }

    /// Feed-forward block configuration.
    ///
    /// Default: `PointwiseFeedForwardConfig::default()`
    pub fn feedforward(mut self, feedforward: PointwiseFeedForwardConfig) -> Self {
        self.feedforward = feedforward;
        self
    }

    /// Normalization of the feed-forward output after the residual
    /// connection.
    ///
    /// Default: `Identity`
    pub fn ffn_residual_layer_norm(mut self, ffn_residual_layer_norm: Box<dyn BuildModule>) -> Self {
        self.ffn_residual_layer_norm = ffn_residual_layer_norm;
        self
    }

    fn build_layer(&self, vb: VarBuilder) -> Result<TransformerLayer, TransformerLayerError> {
        Ok(TransformerLayer {
            attention: self
                .attention
                .build(vb.push_prefix("attention"))
                .context(BuildAttentionSnafu)?,
            attn_residual_layer_norm: self
                .attn_residual_layer_norm
                .build(vb.push_prefix("attn_residual_layer_norm"))
                .context(BuildLayerNormSnafu)?,
            ffn: self
                .feedforward
                .build(vb.push_prefix("ffn"))
                .context(BuildFeedForwardSnafu)?,
            ffn_residual_layer_norm: self
                .ffn_residual_layer_norm
                .build(vb.push_prefix("ffn_residual_layer_norm"))
                .context(BuildLayerNormSnafu)?,
        })
    }
}

impl Default for TransformerLayerConfig {
    fn default() -> Self {
        Self {
            attention: SelfAttentionConfig::default(),
            attn_residual_layer_norm: Box::new(Identity),
            feedforward: PointwiseFeedForwardConfig::default(),
            ffn_residual_layer_norm: Box::new(Identity),
        }
    }
}

impl BuildDecoderLayer for TransformerLayerConfig {
    type Cache = LayerKeyValueCache;

    fn build_decoder_layer(
        &self,
        vb: VarBuilder,
    ) -> Result<Box<dyn DecoderLayer<Cache = Self::Cache>>, BoxedError> {
        Ok(Box::new(TransformerDecoderLayer {
            inner: self.build_layer(vb)?,
        }))
    }
}

impl BuildEncoderLayer for TransformerLayerConfig {
    fn build_encoder_layer(&self, vb: VarBuilder) -> Result<Box<dyn EncoderLayer>, BoxedError> {
        Ok(Box::new(TransformerEncoderLayer {
            inner: self.build_layer(vb)?,
        }))
    }
}

#[derive(Debug, Snafu)]
pub enum TransformerLayerError {
    #[snafu(display("Cannot build attention layer"))]
    BuildAttention { source: BoxedError },

    #[snafu(display("Cannot build feed-forward layer"))]
    BuildFeedForward { source: BoxedError },

    #[snafu(display("Cannot build layer norm"))]
    BuildLayerNorm { source: BoxedError },

    #[snafu(display("Cannot apply point-wise feed-forward layer"))]
    FeedForward { source: candle_core::Error },

    #[snafu(display("Cannot apply residual connection"))]
    Residual { source: candle_core::Error },

    #[snafu(display("Cannot apply self-attention"))]
    SelfAttention { source: BoxedError },
}

/// Attention and feed-forward blocks, each with a residual connection.
struct TransformerLayer {
    attention: Box<dyn Attention>,
    attn_residual_layer_norm: Box<dyn ModuleT>,
    ffn: Box<dyn ModuleT>,
    ffn_residual_layer_norm: Box<dyn ModuleT>,
}

impl TransformerLayer {
    /// Transform hidden states of shape `(batch_size, seq_len, width)`.
    ///
    /// Decoder layers attend causally and extend `cache` with the keys
    /// and values of `input`. Encoder layers pass an unused cache.
    fn forward(
        &self,
        input: &Tensor,
        attention_mask: &AttentionMask,
        cache: &mut LayerKeyValueCache,
        positions: Option<&Tensor>,
        train: bool,
        use_causal_mask: bool,
    ) -> Result<Tensor, TransformerLayerError> {
        let attn_out = self
            .attention
            .forward_t(
                input,
                attention_mask,
                cache,
                positions,
                train,
                use_causal_mask,
            )
            .context(SelfAttentionSnafu)?;

        let residual = (input + attn_out)
            .and_then(|xs| self.attn_residual_layer_norm.forward_t(&xs, train))
            .context(ResidualSnafu)?;

        let ffn_out = self
            .ffn
            .forward_t(&residual, train)
            .context(FeedForwardSnafu)?;

        (residual + ffn_out)
            .and_then(|xs| self.ffn_residual_layer_norm.forward_t(&xs, train))
            .context(ResidualSnafu)
    }
}

/// Layer of a causal decoder.
pub struct TransformerDecoderLayer {
    inner: TransformerLayer,
}

impl DecoderLayer for TransformerDecoderLayer {
    type Cache = LayerKeyValueCache;

    fn forward_t(
        &self,
        input: &Tensor,
        attention_mask: &AttentionMask,
        cache: &mut Self::Cache,
        positions: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor, BoxedError> {
        Ok(self
            .inner
            .forward(input, attention_mask, cache, positions, train, true)?)
    }
}

/// Layer of a bidirectional encoder.
pub struct TransformerEncoderLayer {
    inner: TransformerLayer,
}

impl EncoderLayer for TransformerEncoderLayer {
    fn forward_t(
        &self,
        input: &Tensor,
        attention_mask: &AttentionMask,
        positions: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor, BoxedError> {
        Ok(self.inner.forward(
            input,
            attention_mask,
            &mut LayerKeyValueCache::no_cache(),
            positions,
            train,
            false,
        )?)
    }
}
