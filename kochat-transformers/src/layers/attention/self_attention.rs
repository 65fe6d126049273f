use candle_core::{DType, Module, ModuleT, Tensor};
use candle_nn::{linear, Linear, VarBuilder};
use snafu::{ensure, ResultExt, Snafu};

use crate::error::BoxedError;
use crate::kv_cache::{LayerKeyValueCache, LayerKeyValueCacheError};
use crate::layers::attention::{
    Attention, AttentionMask, AttentionScorer, BuildAttention, BuildAttentionScorer, SDPAConfig,
};
use crate::layers::build_module::BuildModule;
use crate::layers::identity::Identity;
use crate::util::tensor_ext::MinLike;

/// Attention heads configuration to use in self-attention.
#[derive(Debug, Clone)]
pub struct AttentionHeads {
    pub n_heads: usize,
    pub qkv_mode: QkvMode,
}

/// How the query, key and value projections are handled in
/// the self-attention layer.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum QkvMode {
    /// Separate query, key and value projections.
    Separate,

    /// A single projection of width `3 * hidden_width`. The projection
    /// output is split into query, key and value (in that order) before
    /// splitting the heads.
    MergedSplitAfter,
}

/// Representation of the query, key and value projections.
enum QkvTensors {
    Merged(Linear),
    Separate {
        query: Linear,
        key: Linear,
        value: Linear,
    },
}

/// Self-attention configuration.
#[derive(Debug)]
pub struct SelfAttentionConfig {
    attention_heads: AttentionHeads,
    attention_scorer: Box<dyn BuildAttentionScorer>,
    dropout: Box<dyn BuildModule>,
    hidden_width: usize,
    layer_norm: Box<dyn BuildModule>,
}

impl SelfAttentionConfig {
    /// Attention head configuration.
    ///
    /// Default: 12 heads with separate query, key and value projections.
    pub fn attention_heads(mut self, attention_heads: AttentionHeads) -> Self {
        self.attention_heads = attention_heads;
        self
    }

    /// Attention scorer.
    ///
    /// Default: `SDPAConfig::default()`
    pub fn attention_scorer(mut self, attention_scorer: Box<dyn BuildAttentionScorer>) -> Self {
        self.attention_scorer = attention_scorer;
        self
    }

    /// Dropout to apply after the output projection.
    ///
    /// Default: `Identity`
    pub fn dropout(mut self, dropout: Box<dyn BuildModule>) -> Self {
        self.dropout = dropout;
        self
    }

    /// Hidden width.
    ///
    /// Default: `768`
    pub fn hidden_width(mut self, hidden_width: usize) -> Self {
        self.hidden_width = hidden_width;
        self
    }

    /// Layer norm applied to the input of the attention layer.
    ///
    /// Pre-norm layers set this normalization, post-norm layers use
    /// the residual normalization of the transformer layer instead.
    ///
    /// Default: `Identity`
    pub fn layer_norm(mut self, layer_norm: Box<dyn BuildModule>) -> Self {
        self.layer_norm = layer_norm;
        self
    }
}

impl Default for SelfAttentionConfig {
    fn default() -> Self {
        Self {
            attention_heads: AttentionHeads {
                n_heads: 12,
                qkv_mode: QkvMode::Separate,
            },
            attention_scorer: Box::<SDPAConfig>::default(),
            dropout: Box::new(Identity),
            hidden_width: 768,
            layer_norm: Box::new(Identity),
        }
    }
}

impl BuildAttention for SelfAttentionConfig {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn Attention>, BoxedError> {
        let hidden_width = self.hidden_width;
        let n_heads = self.attention_heads.n_heads;
        ensure!(
            n_heads > 0 && hidden_width % n_heads == 0,
            InvalidHeadsSnafu {
                hidden_width,
                n_heads
            }
        );

        let qkv = match self.attention_heads.qkv_mode {
            QkvMode::MergedSplitAfter => QkvTensors::Merged(
                linear(hidden_width, 3 * hidden_width, vb.push_prefix("qkv"))
                    .context(BuildQkvSnafu)?,
            ),
            QkvMode::Separate => QkvTensors::Separate {
                query: linear(hidden_width, hidden_width, vb.push_prefix("query"))
                    .context(BuildQkvSnafu)?,
                key: linear(hidden_width, hidden_width, vb.push_prefix("key"))
                    .context(BuildQkvSnafu)?,
                value: linear(hidden_width, hidden_width, vb.push_prefix("value"))
                    .context(BuildQkvSnafu)?,
            },
        };

        Ok(Box::new(SelfAttention {
            attention_scorer: self
                .attention_scorer
                .build(vb.clone())
                .context(BuildAttentionScorerSnafu)?,
            dropout: self
                .dropout
                .build(vb.push_prefix("dropout"))
                .context(BuildDropoutSnafu)?,
            hidden_width,
            layer_norm: self
                .layer_norm
                .build(vb.push_prefix("layer_norm"))
                .context(BuildLayerNormSnafu)?,
            n_heads,
            output: linear(hidden_width, hidden_width, vb.push_prefix("output"))
                .context(BuildOutputSnafu)?,
            qkv,
        }))
    }
}

/// Errors for self-attention.
#[derive(Debug, Snafu)]
pub enum SelfAttentionError {
    #[snafu(display("Cannot apply attention scorer"))]
    AttentionScorer { source: BoxedError },

    #[snafu(display("Cannot build attention scorer"))]
    BuildAttentionScorer { source: BoxedError },

    #[snafu(display("Cannot build dropout"))]
    BuildDropout { source: BoxedError },

    #[snafu(display("Cannot build layer norm"))]
    BuildLayerNorm { source: BoxedError },

    #[snafu(display("Cannot build output layer"))]
    BuildOutput { source: candle_core::Error },

    #[snafu(display("Cannot build query, key, value projections"))]
    BuildQkv { source: candle_core::Error },

    #[snafu(display("Cannot update key-value cache"))]
    Cache { source: LayerKeyValueCacheError },

    #[snafu(display("Cannot combine heads"))]
    CombineHeads { source: candle_core::Error },

    #[snafu(display("Cannot apply dropout"))]
    Dropout { source: candle_core::Error },

    #[snafu(display("Hidden width {hidden_width} is not divisible by number of heads {n_heads}"))]
    InvalidHeads { hidden_width: usize, n_heads: usize },

    #[snafu(display("Cannot apply layer norm"))]
    LayerNorm { source: candle_core::Error },

    #[snafu(display("Cannot apply output layer"))]
    Output { source: candle_core::Error },

    #[snafu(display("Cannot calculate key, query, or value"))]
    Qkv { source: candle_core::Error },

    #[snafu(display("Cannot split heads"))]
    SplitHeads { source: candle_core::Error },
}

/// Transformer self-attention layer.
///
/// See [Vaswani et al., 2017](https://arxiv.org/abs/1706.03762).
pub struct SelfAttention {
    attention_scorer: Box<dyn AttentionScorer>,
    dropout: Box<dyn ModuleT>,
    hidden_width: usize,
    layer_norm: Box<dyn ModuleT>,
    n_heads: usize,
    output: Linear,
    qkv: QkvTensors,
}

impl SelfAttention {
    /// Project the input to query, key and value heads.
    fn query_key_value(&self, input: &Tensor) -> Result<(Tensor, Tensor, Tensor), BoxedError> {
        let (query, key, value) = match &self.qkv {
            QkvTensors::Merged(qkv) => {
                let proj = qkv.forward(input).context(QkvSnafu)?;
                let width = self.hidden_width;
                (
                    proj.narrow(2, 0, width).context(QkvSnafu)?,
                    proj.narrow(2, width, width).context(QkvSnafu)?,
                    proj.narrow(2, 2 * width, width).context(QkvSnafu)?,
                )
            }
            QkvTensors::Separate { query, key, value } => (
                query.forward(input).context(QkvSnafu)?,
                key.forward(input).context(QkvSnafu)?,
                value.forward(input).context(QkvSnafu)?,
            ),
        };

        Ok((
            query.split_heads(self.n_heads)?,
            key.split_heads(self.n_heads)?,
            value.split_heads(self.n_heads)?,
        ))
    }
}

impl Attention for SelfAttention {
    fn forward_t(
        &self,
        input: &Tensor,
        attention_mask: &AttentionMask,
        cache: &mut LayerKeyValueCache,
        _positions: Option<&Tensor>,
        train: bool,
        use_causal_mask: bool,
    ) -> Result<Tensor, BoxedError> {
        let input = self
            .layer_norm
            .forward_t(input, train)
            .context(LayerNormSnafu)?;

        let (query, key, value) = self.query_key_value(&input)?;

        cache.update(&key, &value).context(CacheSnafu)?;
        let (key, value) = match (cache.key(), cache.value()) {
            (Some(key), Some(value)) => (key.clone(), value.clone()),
            _ => (key, value),
        };

        let attn = self
            .attention_scorer
            .forward(&query, &key, &value, attention_mask, train, use_causal_mask)
            .context(AttentionScorerSnafu)?
            .combine_heads()?;

        let output = self.output.forward(&attn).context(OutputSnafu)?;
        Ok(self
            .dropout
            .forward_t(&output, train)
            .context(DropoutSnafu)?)
    }
}

trait CombineHeads {
    fn combine_heads(&self) -> Result<Tensor, SelfAttentionError>;
}

impl CombineHeads for Tensor {
    fn combine_heads(&self) -> Result<Tensor, SelfAttentionError> {
        let (batch_size, n_heads, seq_len, head_width) =
            self.dims4().context(CombineHeadsSnafu)?;
        self.transpose(1, 2)
            .and_then(|heads| heads.reshape((batch_size, seq_len, n_heads * head_width)))
            .context(CombineHeadsSnafu)
    }
}

trait SplitHeads {
    fn split_heads(&self, n_heads: usize) -> Result<Tensor, SelfAttentionError>;
}

impl SplitHeads for Tensor {
    fn split_heads(&self, n_heads: usize) -> Result<Tensor, SelfAttentionError> {
        let (batch_size, seq_len, model_width) = self.dims3().context(SplitHeadsSnafu)?;
        let head_width = model_width / n_heads;
        self.reshape((batch_size, seq_len, n_heads, head_width))
            .and_then(|heads| heads.transpose(1, 2))
            .and_then(|heads| heads.contiguous())
            .context(SplitHeadsSnafu)
    }
}

#[derive(Debug, Snafu)]
pub enum SelfAttentionMaskError {
    #[snafu(display("Cannot apply logits mask"))]
    ApplyLogitsMask { source: candle_core::Error },

    #[snafu(display("Cannot intersect masks"))]
    IntersectMasks { source: candle_core::Error },

    #[snafu(display("Cannot reshape input mask"))]
    ReshapeMask { source: candle_core::Error },
}

/// Self-attention mask.
///
/// A 4D attention mask with shape *(batch_size, heads, query_len, key_len)*.
/// Elements for which the corresponding mask element is set to `false` are
/// ignored during attention calculation. Dimensions of size 1 are
/// broadcast.
#[derive(Clone, Debug)]
pub struct SelfAttentionMask {
    bool_mask: Tensor,
}

impl TryFrom<&AttentionMask> for SelfAttentionMask {
    type Error = SelfAttentionMaskError;

    fn try_from(attention_mask: &AttentionMask) -> Result<Self, Self::Error> {
        let (batch_len, key_len) = attention_mask
            .bool_mask
            .shape()
            .dims2()
            .context(ReshapeMaskSnafu)?;
        Ok(SelfAttentionMask {
            bool_mask: attention_mask
                .bool_mask
                .reshape((batch_len, 1, 1, key_len))
                .context(ReshapeMaskSnafu)?,
        })
    }
}

impl SelfAttentionMask {
    /// Use the attention mask to mask logits.
    ///
    /// Masked logits are set to the minimum value of the logits data type.
    ///
    /// * input - Tensor to which the mask is applied.
    ///   *Shape:* `(batch_size, heads, query_len, key_len)`
    ///
    /// Returns: Logits with the attention mask applied.
    /// *Shape:* `(batch_size, heads, query_len, key_len)`
    pub fn apply_logit_mask(&self, input: &Tensor) -> Result<Tensor, SelfAttentionMaskError> {
        let blocked_value = input.min_like().context(ApplyLogitsMaskSnafu)?;
        self.bool_mask
            .broadcast_as(input.shape())
            .and_then(|xs| xs.where_cond(input, &blocked_value))
            .context(ApplyLogitsMaskSnafu)
    }

    /// Merge this attention mask with another attention mask.
    pub fn intersect(
        &self,
        other: &SelfAttentionMask,
    ) -> Result<SelfAttentionMask, SelfAttentionMaskError> {
        Ok(SelfAttentionMask {
            bool_mask: self
                .bool_mask
                .broadcast_mul(&other.bool_mask)
                .context(IntersectMasksSnafu)?,
        })
    }
}

#[derive(Debug, Snafu)]
pub enum CausalMaskError {
    #[snafu(display("Cannot create causal mask"))]
    CreateMask { source: candle_core::Error },

    #[snafu(display("Key has invalid number of dimensions"))]
    KeyDim { source: candle_core::Error },

    #[snafu(display("Query has invalid number of dimensions"))]
    QueryDim { source: candle_core::Error },

    #[snafu(display("Query length {query_len} must not be larger than key length {key_len}"))]
    QueryLen { key_len: usize, query_len: usize },

    #[snafu(display("Cannot slice causal mask to key/query size"))]
    SliceMask { source: candle_core::Error },
}

/// Trait for creating causal masks.
pub trait CausalMask: Sized {
    type Error;

    /// Create a causal mask for the given query and key.
    ///
    /// A causal mask ensures that tokens cannot attend to succeeding tokens.
    /// When the key is longer than the query (e.g. when keys are cached),
    /// the query is aligned with the last key positions.
    ///
    /// * `query` - Query tensor.
    ///   *Shape:* `(batch_size, heads, query_len, width)`
    /// * `key` - Key tensor.
    ///   *Shape:* `(batch_size, heads, key_len, width)`
    fn causal_mask(query: &Tensor, key: &Tensor) -> Result<Self, Self::Error>;
}

impl CausalMask for SelfAttentionMask {
    type Error = CausalMaskError;

    fn causal_mask(query: &Tensor, key: &Tensor) -> Result<Self, Self::Error> {
        let (_, _, query_len, _) = query.shape().dims4().context(QueryDimSnafu)?;
        let (_, _, key_len, _) = key.shape().dims4().context(KeyDimSnafu)?;

        ensure!(query_len <= key_len, QueryLenSnafu { key_len, query_len });

        let causal_mask = Tensor::tril2(key_len, DType::U8, key.device())
            .and_then(|mask| mask.reshape((1, 1, key_len, key_len)))
            .context(CreateMaskSnafu)?;
        Ok(Self {
            bool_mask: causal_mask
                .narrow(2, key_len - query_len, query_len)
                .context(SliceMaskSnafu)?,
        })
    }
}
