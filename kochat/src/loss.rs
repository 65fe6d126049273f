use candle_core::{DType, Tensor, D};
use candle_nn::ops::log_softmax;
use snafu::{ensure, ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum LossError {
    #[snafu(display("Cannot compute cross entropy"))]
    CrossEntropy { source: candle_core::Error },

    #[snafu(display("Loss mask does not select any position"))]
    EmptyMask,
}

/// Cross entropy of the positions selected by a loss mask.
///
/// * `logits` - Next-piece logits.
///   *Shape:* `(batch_size, seq_len, n_pieces)`
/// * `labels` - The piece that should be predicted at each position.
///   *Shape:* `(batch_size, seq_len)`
/// * `loss_mask` - `1` for positions that contribute to the loss.
///   *Shape:* `(batch_size, seq_len)`
///
/// Returns: the mean negative log likelihood over the masked positions.
pub fn masked_cross_entropy(
    logits: &Tensor,
    labels: &Tensor,
    loss_mask: &Tensor,
) -> Result<Tensor, LossError> {
    let loss_mask = loss_mask.to_dtype(DType::F32).context(CrossEntropySnafu)?;
    let n_positions = loss_mask
        .sum_all()
        .and_then(|sum| sum.to_scalar::<f32>())
        .context(CrossEntropySnafu)?;
    ensure!(n_positions > 0., EmptyMaskSnafu);

    let log_probs = logits
        .to_dtype(DType::F32)
        .and_then(|logits| log_softmax(&logits, D::Minus1))
        .context(CrossEntropySnafu)?;
    let label_log_probs = labels
        .unsqueeze(D::Minus1)
        .and_then(|labels| log_probs.gather(&labels, D::Minus1))
        .and_then(|log_probs| log_probs.squeeze(D::Minus1))
        .context(CrossEntropySnafu)?;

    (label_log_probs * loss_mask)
        .and_then(|nll| nll.sum_all())
        .and_then(|nll| nll.affine(-1. / n_positions as f64, 0.))
        .context(CrossEntropySnafu)
}
