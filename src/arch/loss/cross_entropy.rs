use ndarray::{Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Zip, s};

use super::LossFn;
use crate::{BufferErr, Result};

/// Label value excluded from the loss reduction.
pub const IGNORE_INDEX: i64 = -100;

/// Mean cross entropy over every non ignored label.
#[derive(Debug, Default, Clone, Copy)]
pub struct MaskedCrossEntropy;

impl MaskedCrossEntropy {
    /// Returns a new `MaskedCrossEntropy`.
    pub fn new() -> Self {
        Self
    }

    /// Builds the next-token labels of a tokenized batch.
    ///
    /// Labels are `input_ids[:, 1:]`, with every position whose shifted attention mask is zero
    /// replaced by `IGNORE_INDEX`.
    ///
    /// # Arguments
    /// * `input_ids` - Token ids, `[batch, seq]`.
    /// * `attention_mask` - Mask of the same shape, zero on padding.
    ///
    /// # Returns
    /// The labels, `[batch, seq - 1]`.
    pub fn shift_labels(
        &self,
        input_ids: ArrayView2<u32>,
        attention_mask: ArrayView2<u8>,
    ) -> Array2<i64> {
        let (batch, seq) = input_ids.dim();
        if seq == 0 {
            return Array2::zeros((batch, 0));
        }

        let mut labels = Array2::zeros((batch, seq - 1));
        Zip::from(&mut labels)
            .and(input_ids.slice(s![.., 1..]))
            .and(attention_mask.slice(s![.., 1..]))
            .for_each(|label, &id, &mask| {
                *label = if mask == 0 { IGNORE_INDEX } else { id as i64 };
            });

        labels
    }

    /// Validates shapes and yields every `(batch, position, label)` that takes part in the loss.
    fn active_labels(
        &self,
        logits: ArrayView3<f32>,
        labels: ArrayView2<i64>,
    ) -> Result<Vec<(usize, usize, usize)>> {
        let (batch, seq, vocab) = logits.dim();
        if labels.nrows() != batch {
            return Err(BufferErr::ShapeMismatch {
                what: "label batch",
                got: labels.nrows(),
                expected: batch,
            });
        }

        if labels.ncols() + 1 != seq.max(1) {
            return Err(BufferErr::ShapeMismatch {
                what: "label positions",
                got: labels.ncols(),
                expected: seq.saturating_sub(1),
            });
        }

        let mut active = Vec::new();
        for ((b, t), &label) in labels.indexed_iter() {
            if label == IGNORE_INDEX {
                continue;
            }

            match usize::try_from(label) {
                Ok(label) if label < vocab => active.push((b, t, label)),
                _ => {
                    return Err(BufferErr::Model(format!(
                        "label {label} is outside a vocabulary of {vocab} tokens"
                    )));
                }
            }
        }

        Ok(active)
    }
}

fn log_sum_exp(row: ArrayView1<f32>) -> f32 {
    let max = row.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
    max + row.iter().map(|&x| (x - max).exp()).sum::<f32>().ln()
}

impl LossFn for MaskedCrossEntropy {
    // NOTE: a batch where every label is ignored has no defined mean, it contributes a zero
    // loss and a zero gradient instead.
    fn loss(&self, logits: ArrayView3<f32>, labels: ArrayView2<i64>) -> Result<f32> {
        let active = self.active_labels(logits, labels)?;
        if active.is_empty() {
            return Ok(0.0);
        }

        let total: f32 = active
            .iter()
            .map(|&(b, t, label)| {
                let row = logits.slice(s![b, t, ..]);
                log_sum_exp(row) - row[label]
            })
            .sum();

        Ok(total / active.len() as f32)
    }

    fn loss_prime(&self, logits: ArrayView3<f32>, labels: ArrayView2<i64>) -> Result<Array3<f32>> {
        let active = self.active_labels(logits, labels)?;
        let mut d = Array3::zeros(logits.dim());
        if active.is_empty() {
            return Ok(d);
        }

        let scale = 1. / active.len() as f32;
        for (b, t, label) in active {
            let row = logits.slice(s![b, t, ..]);
            let lse = log_sum_exp(row);

            let mut d_row = d.slice_mut(s![b, t, ..]);
            d_row.zip_mut_with(&row, |d, &x| *d = (x - lse).exp() * scale);
            d_row[label] -= scale;
        }

        Ok(d)
    }
}
