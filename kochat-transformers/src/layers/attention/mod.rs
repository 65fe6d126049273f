use std::fmt::Debug;

use candle_core::Tensor;
use candle_nn::VarBuilder;

mod mask;
pub use mask::{AttentionMask, AttentionMaskError};

mod sdpa;
pub use sdpa::{SDPAConfig, SDPAError, SDPA};

mod self_attention;
pub use self_attention::{
    AttentionHeads, CausalMask, CausalMaskError, QkvMode, SelfAttention, SelfAttentionConfig,
    SelfAttentionError, SelfAttentionMask, SelfAttentionMaskError,
};

use crate::error::BoxedError;
use crate::kv_cache::LayerKeyValueCache;

/// Attention over the pieces of a sequence.
pub trait Attention {
    /// Attend from every piece of `input` to the pieces that
    /// `attention_mask` marks as `true`.
    ///
    /// `input` has shape `(batch_size, seq_len, width)`. When `cache`
    /// holds keys and values of earlier pieces, the mask covers the
    /// cached pieces followed by the new ones. With `use_causal_mask`,
    /// a piece cannot attend to the pieces after it.
    fn forward_t(
        &self,
        input: &Tensor,
        attention_mask: &AttentionMask,
        cache: &mut LayerKeyValueCache,
        positions: Option<&Tensor>,
        train: bool,
        use_causal_mask: bool,
    ) -> Result<Tensor, BoxedError>;
}

pub trait BuildAttention: Debug {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn Attention>, BoxedError>;
}

/// Computes attention from queries, keys and values that are already
/// split into heads.
pub trait AttentionScorer {
    /// Weigh `value` by the similarity of `query` and `key`.
    ///
    /// Queries have shape `(batch_size, n_heads, query_len, head_width)`,
    /// keys and values `(batch_size, n_heads, key_len, head_width)`.
    /// Keys that are `false` in `attention_mask` get no weight.
    ///
    /// Returns a tensor with the shape of `query`.
    fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attention_mask: &AttentionMask,
        train: bool,
        use_causal_mask: bool,
    ) -> Result<Tensor, BoxedError>;
}

pub trait BuildAttentionScorer: Debug {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn AttentionScorer>, BoxedError>;
}
