use ndarray::{Array3, ArrayView2, ArrayView3};

use crate::Result;

/// A next-token loss over `[batch, seq, vocab]` logits.
///
/// `labels` has shape `[batch, seq - 1]`: the label of position `t` is the token at `t + 1`,
/// so the last position of every sequence carries no label.
pub trait LossFn {
    fn loss(&self, logits: ArrayView3<f32>, labels: ArrayView2<i64>) -> Result<f32>;

    /// The gradient of `loss` with respect to `logits`, same shape as `logits`.
    fn loss_prime(&self, logits: ArrayView3<f32>, labels: ArrayView2<i64>) -> Result<Array3<f32>>;
}
