use std::fmt::Debug;

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::architectures::BuildArchitecture;
use crate::error::BoxedError;
use crate::layers::attention::AttentionMask;

/// Hidden states computed by a decoder.
///
/// Holds the output of the embeddings followed by the output of every
/// decoder layer. With a key/value cache, only the new pieces have hidden
/// states.
pub struct DecoderOutput {
    hidden_states: Vec<Tensor>,
}

impl DecoderOutput {
    pub fn new(hidden_states: Vec<Tensor>) -> Self {
        DecoderOutput { hidden_states }
    }

    /// Output of the last decoder layer.
    pub fn last_hidden_state(&self) -> Option<&Tensor> {
        self.hidden_states.last()
    }

    /// Output of the embeddings followed by the output of every layer.
    pub fn hidden_states(&self) -> &[Tensor] {
        &self.hidden_states
    }
}

/// Configurations that build a [`Decoder`].
pub trait BuildDecoder: Debug {
    type Decoder: Decoder;

    fn build(&self, vb: VarBuilder) -> Result<Self::Decoder, BoxedError>;
}

impl<C> BuildDecoder for C
where
    C: BuildArchitecture + Debug,
    C::Architecture: Decoder,
{
    type Decoder = C::Architecture;

    fn build(&self, vb: VarBuilder) -> Result<Self::Decoder, BoxedError> {
        BuildArchitecture::build(self, vb)
    }
}

/// Decoder that attends to the current and preceding pieces only.
pub trait Decoder {
    /// State kept between calls during incremental decoding.
    type Cache;

    /// Compute the hidden states of a batch of sequences.
    ///
    /// * `piece_ids` - Pieces to decode. During incremental decoding these
    ///   are only the pieces that are not in the cache yet.
    ///   *Shape:* `(batch_size, seq_len)`
    /// * `attention_mask` - Positions that are `false` in the mask are
    ///   padding. The mask spans the cached pieces as well.
    ///   *Shape:* `(batch_size, cache_len + seq_len)`
    /// * `cache` - Keys and values of earlier calls, updated in place.
    /// * `positions` - Positions of the pieces, defaults to continuing
    ///   after the cached pieces.
    ///   *Shape:* `(batch_size, seq_len)`
    /// * `train` - Enables dropout.
    fn forward_t(
        &self,
        piece_ids: &Tensor,
        attention_mask: &AttentionMask,
        cache: &mut Self::Cache,
        positions: Option<&Tensor>,
        train: bool,
    ) -> Result<DecoderOutput, BoxedError>;
}

/// A single layer of a [`Decoder`].
pub trait DecoderLayer {
    /// Keys and values of a layer for incremental decoding.
    type Cache;

    /// Transform hidden states of shape `(batch_size, seq_len, width)`.
    ///
    /// `attention_mask` has the shape `(batch_size, cache_len + seq_len)`.
    /// The keys and values of the input are appended to `cache`.
    fn forward_t(
        &self,
        input: &Tensor,
        attention_mask: &AttentionMask,
        cache: &mut Self::Cache,
        positions: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor, BoxedError>;
}

/// Configurations that build a [`DecoderLayer`].
pub trait BuildDecoderLayer: Debug {
    type Cache;

    fn build_decoder_layer(
        &self,
        vb: VarBuilder,
    ) -> Result<Box<dyn DecoderLayer<Cache = Self::Cache>>, BoxedError>;
}
