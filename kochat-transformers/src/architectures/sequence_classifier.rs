use candle_core::Tensor;

use crate::architectures::EncoderOutput;
use crate::error::BoxedError;
use crate::layers::attention::AttentionMask;

/// Hidden states and label logits of a sequence classifier.
pub struct SequenceClassifierOutput {
    encoder_output: EncoderOutput,
    logits: Tensor,
}

impl SequenceClassifierOutput {
    pub fn new(encoder_output: EncoderOutput, logits: Tensor) -> Self {
        SequenceClassifierOutput {
            encoder_output,
            logits,
        }
    }

    pub fn encoder_output(&self) -> &EncoderOutput {
        &self.encoder_output
    }

    /// Unnormalized label scores.
    ///
    /// *Shape:* `(batch_size, n_labels)`
    pub fn logits(&self) -> &Tensor {
        &self.logits
    }
}

/// Model that assigns a label to a whole sequence.
pub trait SequenceClassifier {
    /// Compute label logits for a batch of sequences.
    ///
    /// The arguments are those of [`Encoder::forward_t`].
    ///
    /// [`Encoder::forward_t`]: crate::architectures::Encoder::forward_t
    fn forward_t(
        &self,
        piece_ids: &Tensor,
        attention_mask: &AttentionMask,
        positions: Option<&Tensor>,
        type_ids: Option<&Tensor>,
        train: bool,
    ) -> Result<SequenceClassifierOutput, BoxedError>;
}
