use candle_core::{Device, Tensor};
use snafu::{ensure, ResultExt, Snafu};

/// Errors for attention masks.
#[derive(Debug, Snafu)]
pub enum AttentionMaskError {
    #[snafu(display("Cannot concatenate masks"))]
    ConcatMasks { source: candle_core::Error },

    #[snafu(display("Cannot create mask from sequence lengths"))]
    FromLengths { source: candle_core::Error },

    #[snafu(display("Attention mask must be 2D, was {}D", n_dims))]
    InvalidDims { n_dims: usize },
}

/// Attention mask.
///
/// Sequence elements for which the corresponding mask element is set to
/// `false` are ignored during attention calculation. Guaranteed to be
/// a 2D array.
#[derive(Clone, Debug)]
pub struct AttentionMask {
    pub(crate) bool_mask: Tensor,
}

impl AttentionMask {
    /// Create an input attention mask.
    ///
    /// * `bool_mask` - Boolean mask tensor.
    ///   *Shape:* `(batch_size, seq_len)`
    pub fn new(bool_mask: Tensor) -> Result<Self, AttentionMaskError> {
        let n_dims = bool_mask.dims().len();
        ensure!(n_dims == 2, InvalidDimsSnafu { n_dims });
        Ok(AttentionMask { bool_mask })
    }

    /// Create a mask for right-padded sequences.
    ///
    /// The first `len` elements of each sequence are attended to.
    ///
    /// * `lens` - The unpadded length of each sequence.
    /// * `seq_len` - The padded sequence length.
    /// * `device` - Device to place the mask on.
    pub fn from_lengths(
        lens: &[usize],
        seq_len: usize,
        device: &Device,
    ) -> Result<Self, AttentionMaskError> {
        let mask = lens
            .iter()
            .flat_map(|&len| (0..seq_len).map(move |idx| u8::from(idx < len)))
            .collect::<Vec<_>>();
        let bool_mask =
            Tensor::from_vec(mask, (lens.len(), seq_len), device).context(FromLengthsSnafu)?;
        Self::new(bool_mask)
    }

    /// Get the boolean mask.
    ///
    /// *Shape:* `(batch_size, seq_len)`
    pub fn bool_mask(&self) -> &Tensor {
        &self.bool_mask
    }

    /// Extend the mask using another mask.
    ///
    /// The masks are concatenated along the sequence dimension. This is
    /// used to extend the mask with the pieces added in a generation step.
    pub fn extend(&self, other: &Self) -> Result<Self, AttentionMaskError> {
        Ok(AttentionMask {
            bool_mask: Tensor::cat(&[&self.bool_mask, &other.bool_mask], 1)
                .context(ConcatMasksSnafu)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use snafu::{report, ResultExt, Whatever};

    use super::AttentionMask;

    #[test]
    #[report]
    fn attention_mask_must_be_2d() -> Result<(), Whatever> {
        let mask = Tensor::ones((2, 3, 4), DType::U8, &Device::Cpu)
            .whatever_context("Cannot create tensor")?;
        assert!(AttentionMask::new(mask).is_err());
        Ok(())
    }

    #[test]
    #[report]
    fn attention_mask_from_lengths() -> Result<(), Whatever> {
        let mask = AttentionMask::from_lengths(&[2, 4, 0], 4, &Device::Cpu)
            .whatever_context("Cannot create mask")?;
        assert_eq!(
            mask.bool_mask()
                .to_vec2::<u8>()
                .whatever_context("Cannot convert mask")?,
            vec![vec![1, 1, 0, 0], vec![1, 1, 1, 1], vec![0, 0, 0, 0]]
        );
        Ok(())
    }

    #[test]
    #[report]
    fn attention_mask_extends_along_sequence() -> Result<(), Whatever> {
        let mask = AttentionMask::from_lengths(&[3], 3, &Device::Cpu)
            .whatever_context("Cannot create mask")?;
        let step = AttentionMask::from_lengths(&[1], 1, &Device::Cpu)
            .whatever_context("Cannot create mask")?;
        let extended = mask.extend(&step).whatever_context("Cannot extend mask")?;
        assert_eq!(extended.bool_mask().dims(), &[1, 4]);
        Ok(())
    }
}
