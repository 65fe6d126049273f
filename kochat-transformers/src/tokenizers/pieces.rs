use candle_core::{Device, Tensor};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::layers::attention::{AttentionMask, AttentionMaskError};

/// `PiecesWithIds` errors.
#[derive(Debug, Snafu)]
pub enum PiecesWithIdsError {
    #[snafu(display("Cannot calculate maximum sequence length"))]
    MaxLength,

    #[snafu(display("Cannot create padded tensor"))]
    PaddedTensor { source: candle_core::Error },

    #[snafu(display("Cannot create boolean mask"))]
    BoolMask { source: candle_core::Error },

    #[snafu(display("Cannot create attention mask"))]
    AttentionMask { source: AttentionMaskError },
}

/// Encoded output of tokenizers.
#[derive(Debug, Clone, Default)]
pub struct PiecesWithIds {
    /// Piece identifiers of each input sequence.
    pub ids: Vec<Vec<u32>>,
    /// Piece strings of each input sequence.
    pub pieces: Vec<Vec<String>>,
}

impl PiecesWithIds {
    fn max_len(&self) -> Result<usize, PiecesWithIdsError> {
        self.ids
            .iter()
            .map(Vec::len)
            .max()
            .context(MaxLengthSnafu)
    }

    /// Lay out the sequences in a padded row-major buffer.
    fn padded<T: Copy>(
        &self,
        max_len: usize,
        padding: T,
        pad_left: bool,
        fill: impl Fn(&[u32], &mut [T]),
    ) -> Vec<T> {
        let mut padded = vec![padding; self.ids.len() * max_len];
        if max_len == 0 {
            return padded;
        }
        for (row, ids) in padded.chunks_mut(max_len).zip(&self.ids) {
            let start = if pad_left { max_len - ids.len() } else { 0 };
            fill(ids, &mut row[start..start + ids.len()]);
        }
        padded
    }

    /// Generate a padded tensor of the piece identifiers.
    ///
    /// * padding_id - Piece identifier of the padding piece. The actual identifier
    ///   generally doesn't matter when an attention mask is used (and
    ///   as long as it is a valid vocabulary index).
    /// * pad_left - When `false`, sequences shorter than the longest sequence are
    ///   right-padded. Otherwise, sequences are left-padded.
    /// * device - Device on which the padded tensor is created.
    ///
    /// Returns: The padded piece ids.
    /// *Shape:* ``(batch_size, max_seq_len)``
    pub fn padded_tensor(
        &self,
        padding_id: u32,
        pad_left: bool,
        device: &Device,
    ) -> Result<Tensor, PiecesWithIdsError> {
        let max_len = self.max_len()?;
        let padded = self.padded(max_len, padding_id, pad_left, |ids, row| {
            row.copy_from_slice(ids)
        });
        Tensor::from_vec(padded, (self.ids.len(), max_len), device).context(PaddedTensorSnafu)
    }

    /// Generate the attention masks. The mask is equivalent to:
    /// `ids.padded_tensor(padding_id) != padding_id`
    ///
    /// * pad_left - When `false`, sequences shorter than the longest sequence are
    ///   right-padded. Otherwise, sequences are left-padded.
    /// * device - Device on which the padded tensor is created.
    ///
    /// Returns: The attention mask.
    pub fn attention_mask(
        &self,
        pad_left: bool,
        device: &Device,
    ) -> Result<AttentionMask, PiecesWithIdsError> {
        let max_len = self.max_len()?;
        let padded = self.padded(max_len, 0u8, pad_left, |_, row| row.fill(1));
        let bool_mask =
            Tensor::from_vec(padded, (self.ids.len(), max_len), device).context(BoolMaskSnafu)?;
        AttentionMask::new(bool_mask).context(AttentionMaskSnafu)
    }
}
