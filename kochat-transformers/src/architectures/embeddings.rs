use std::fmt::Debug;

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::error::BoxedError;

/// Maps piece identifiers to their input representations.
pub trait Embeddings {
    /// Embed a batch of pieces.
    ///
    /// `positions` defaults to `0..seq_len` for every sequence and
    /// `type_ids` to all zeros. Both have the shape of `piece_ids`,
    /// `(batch_size, seq_len)`.
    fn forward(
        &self,
        piece_ids: &Tensor,
        train: bool,
        positions: Option<&Tensor>,
        type_ids: Option<&Tensor>,
    ) -> Result<Tensor, BoxedError>;
}

pub trait BuildEmbeddings: Debug {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn Embeddings>, BoxedError>;
}
