use candle_core::Tensor;

use crate::architectures::DecoderOutput;
use crate::error::BoxedError;
use crate::layers::attention::AttentionMask;

/// Hidden states and next-piece logits of a causal language model.
pub struct CausalLMOutput {
    decoder_output: DecoderOutput,
    logits: Tensor,
}

impl CausalLMOutput {
    pub fn new(decoder_output: DecoderOutput, logits: Tensor) -> Self {
        CausalLMOutput {
            decoder_output,
            logits,
        }
    }

    pub fn decoder_output(&self) -> &DecoderOutput {
        &self.decoder_output
    }

    /// Unnormalized scores of the piece that follows each position.
    ///
    /// *Shape:* `(batch_size, seq_len, n_pieces)`
    pub fn logits(&self) -> &Tensor {
        &self.logits
    }
}

/// Language model that predicts the next piece of a sequence.
pub trait CausalLM {
    /// State kept between calls during incremental decoding.
    type Cache;

    /// Compute next-piece logits for every position of a batch.
    ///
    /// The arguments are those of [`Decoder::forward_t`]. In training
    /// mode dropout is applied, and the cache is normally disabled.
    ///
    /// [`Decoder::forward_t`]: crate::architectures::Decoder::forward_t
    fn forward_t(
        &self,
        piece_ids: &Tensor,
        attention_mask: &AttentionMask,
        cache: &mut Self::Cache,
        positions: Option<&Tensor>,
        train: bool,
    ) -> Result<CausalLMOutput, BoxedError>;
}
