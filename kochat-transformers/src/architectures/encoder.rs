use std::fmt::Debug;

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::architectures::BuildArchitecture;
use crate::error::BoxedError;
use crate::layers::attention::AttentionMask;

/// Hidden states computed by an encoder.
///
/// The first hidden state is the output of the embeddings, followed by
/// the output of every encoder layer.
pub struct EncoderOutput {
    hidden_states: Vec<Tensor>,
}

impl EncoderOutput {
    pub fn new(hidden_states: Vec<Tensor>) -> Self {
        EncoderOutput { hidden_states }
    }

    /// Output of the last encoder layer.
    ///
    /// Falls back to the embeddings when the encoder has no layers.
    pub fn last_hidden_state(&self) -> Option<&Tensor> {
        self.hidden_states.last()
    }

    /// Output of the embeddings followed by the output of every layer.
    pub fn hidden_states(&self) -> &[Tensor] {
        &self.hidden_states
    }
}

/// Bidirectional encoder of piece sequences.
pub trait Encoder {
    /// Compute the hidden states of a batch of sequences.
    ///
    /// * `piece_ids` - Pieces to encode.
    ///   *Shape:* `(batch_size, seq_len)`
    /// * `attention_mask` - Positions that are `false` in the mask are
    ///   padding and are not attended to.
    ///   *Shape:* `(batch_size, seq_len)`
    /// * `positions` - Positions of the pieces, defaults to `0..seq_len`.
    ///   *Shape:* `(batch_size, seq_len)`
    /// * `type_ids` - Segment of each piece, defaults to zero.
    ///   *Shape:* `(batch_size, seq_len)`
    /// * `train` - Enables dropout.
    fn forward_t(
        &self,
        piece_ids: &Tensor,
        attention_mask: &AttentionMask,
        positions: Option<&Tensor>,
        type_ids: Option<&Tensor>,
        train: bool,
    ) -> Result<EncoderOutput, BoxedError>;
}

/// Configurations that build an [`Encoder`].
pub trait BuildEncoder: Debug {
    type Encoder: Encoder;

    fn build(&self, vb: VarBuilder) -> Result<Self::Encoder, BoxedError>;
}

impl<C> BuildEncoder for C
where
    C: BuildArchitecture + Debug,
    C::Architecture: Encoder,
{
    type Encoder = C::Architecture;

    fn build(&self, vb: VarBuilder) -> Result<Self::Encoder, BoxedError> {
        BuildArchitecture::build(self, vb)
    }
}

/// A single layer of an [`Encoder`].
pub trait EncoderLayer {
    /// Transform hidden states.
    ///
    /// The input and output have the shape `(batch_size, seq_len, width)`.
    /// Padding positions are excluded from attention through `mask`.
    fn forward_t(
        &self,
        input: &Tensor,
        mask: &AttentionMask,
        positions: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor, BoxedError>;
}

/// Configurations that build an [`EncoderLayer`].
pub trait BuildEncoderLayer: Debug {
    fn build_encoder_layer(&self, vb: VarBuilder) -> Result<Box<dyn EncoderLayer>, BoxedError>;
}
