//! Collation of samples into shuffled batches.
use candle_core::{Device, Tensor};
use kochat_transformers::layers::attention::{AttentionMask, AttentionMaskError};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_pcg::Pcg32;
use snafu::{ensure, ResultExt, Snafu};

use crate::dataset::Sample;

#[derive(Debug, Snafu)]
pub enum BatchError {
    #[snafu(display("Cannot collate an empty batch"))]
    EmptyBatch,

    #[snafu(display("Cannot collate samples of different lengths ({len} and {other_len})"))]
    LengthMismatch { len: usize, other_len: usize },

    #[snafu(display("Cannot create batch tensor"))]
    Tensor { source: candle_core::Error },

    #[snafu(display("Cannot create batch attention mask"))]
    Mask { source: AttentionMaskError },

    #[snafu(display("Batch size must be at least 1"))]
    BatchSize,
}

/// A batch of training samples.
pub struct Batch {
    /// *Shape:* `(batch_size, seq_len)`, `u32`
    pub token_ids: Tensor,
    /// *Shape:* `(batch_size, seq_len)`, `f32`
    pub loss_mask: Tensor,
    /// *Shape:* `(batch_size, seq_len)`, `u32`
    pub labels: Tensor,
    /// Masks the padding of each sample.
    pub attention_mask: AttentionMask,
}

impl Batch {
    /// Stack samples into a batch.
    pub fn collate(samples: &[&Sample], device: &Device) -> Result<Self, BatchError> {
        let first = samples.first().ok_or(BatchError::EmptyBatch)?;
        let seq_len = first.token_ids.len();
        for sample in samples {
            ensure!(
                sample.token_ids.len() == seq_len
                    && sample.labels.len() == seq_len
                    && sample.loss_mask.len() == seq_len,
                LengthMismatchSnafu {
                    len: seq_len,
                    other_len: sample.token_ids.len()
                }
            );
        }

        let shape = (samples.len(), seq_len);
        let stack_u32 = |field: fn(&Sample) -> &[u32]| {
            let data = samples
                .iter()
                .flat_map(|sample| field(sample).iter().copied())
                .collect::<Vec<_>>();
            Tensor::from_vec(data, shape, device).context(TensorSnafu)
        };

        let token_ids = stack_u32(|sample| sample.token_ids.as_slice())?;
        let labels = stack_u32(|sample| sample.labels.as_slice())?;
        let loss_mask = Tensor::from_vec(
            samples
                .iter()
                .flat_map(|sample| sample.loss_mask.iter().copied())
                .collect::<Vec<_>>(),
            shape,
            device,
        )
        .context(TensorSnafu)?;

        let lens = samples.iter().map(|sample| sample.len).collect::<Vec<_>>();
        let attention_mask =
            AttentionMask::from_lengths(&lens, seq_len, device).context(MaskSnafu)?;

        Ok(Batch {
            token_ids,
            loss_mask,
            labels,
            attention_mask,
        })
    }
}

/// Splits samples into shuffled batches, reshuffling every epoch.
pub struct Batcher {
    batch_size: usize,
    n_samples: usize,
    rng: Pcg32,
}

impl Batcher {
    /// Create a batcher for `n_samples` samples.
    ///
    /// The shuffling order is determined by `seed`.
    pub fn new(n_samples: usize, batch_size: usize, seed: u64) -> Result<Self, BatchError> {
        ensure!(batch_size > 0, BatchSizeSnafu);
        Ok(Batcher {
            batch_size,
            n_samples,
            rng: Pcg32::seed_from_u64(seed),
        })
    }

    /// Number of batches per epoch. The last batch may be smaller.
    pub fn len(&self) -> usize {
        self.n_samples.div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.n_samples == 0
    }

    /// Sample indices of each batch in the next epoch.
    pub fn epoch(&mut self) -> Vec<Vec<usize>> {
        let mut indices = (0..self.n_samples).collect::<Vec<_>>();
        indices.shuffle(&mut self.rng);
        indices
            .chunks(self.batch_size)
            .map(<[usize]>::to_vec)
            .collect()
    }
}
