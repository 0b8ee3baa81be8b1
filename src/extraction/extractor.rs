use log::trace;
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, s};

use super::{GradientModel, LayerGrad, OutputKind, Tap};
use crate::{
    BufferErr, Direction, Result,
    arch::loss::{LossFn, MaskedCrossEntropy},
    data::TokenizedBatch,
};

/// Runs the instrumented forward/backward pass over a tokenized batch and harvests one
/// gradient row per labelled, unpadded token position.
pub struct GradientExtractor<M> {
    model: M,
    loss_fn: MaskedCrossEntropy,
    tap: Tap,
    kind: OutputKind,
    dim: usize,
}

impl<M: GradientModel> GradientExtractor<M> {
    /// Creates a new `GradientExtractor`, probing the target layer once.
    ///
    /// # Arguments
    /// * `model` - The model to trace.
    /// * `tap` - The layer and side gradients are captured on.
    /// * `d_submodule` - Row width; inferred from the layer's declared width when `None`.
    ///
    /// # Returns
    /// The extractor, `InvalidLayer` if the layer does not exist or `UnknownDimension` if no
    /// width was given and the layer declares none.
    pub fn new(model: M, tap: Tap, d_submodule: Option<usize>) -> Result<Self> {
        let layers = model.num_layers();
        if tap.layer >= layers {
            return Err(BufferErr::InvalidLayer {
                layer: tap.layer,
                layers,
            });
        }

        let kind = match tap.direction {
            Direction::In => OutputKind::Single,
            Direction::Out => model.output_kind(tap.layer)?,
        };

        let dim = match d_submodule {
            Some(dim) => dim,
            None => model
                .declared_width(tap.layer, tap.direction)
                .ok_or(BufferErr::UnknownDimension { layer: tap.layer })?,
        };

        if dim == 0 {
            return Err(BufferErr::InvalidConfig("d_submodule must be positive"));
        }

        Ok(Self {
            model,
            loss_fn: MaskedCrossEntropy::new(),
            tap,
            kind,
            dim,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn kind(&self) -> OutputKind {
        self.kind
    }

    pub fn tap(&self) -> Tap {
        self.tap
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn release_cache(&mut self) {
        self.model.release_cache();
    }

    /// Computes the gradient at the tap for every position of `batch`.
    ///
    /// # Returns
    /// The gradient, `[batch, seq, d]`.
    pub fn gradients(&mut self, batch: &TokenizedBatch) -> Result<Array3<f32>> {
        let logits = self.model.forward(batch)?;
        let labels = self
            .loss_fn
            .shift_labels(batch.input_ids(), batch.attention_mask());

        let loss = self.loss_fn.loss(logits.view(), labels.view())?;
        if !loss.is_finite() {
            return Err(BufferErr::NonFinite("loss"));
        }
        trace!(loss = loss; "backward pass");

        let d_logits = self.loss_fn.loss_prime(logits.view(), labels.view())?;
        let grad = match (self.kind, self.model.backward(d_logits.view(), self.tap)?) {
            (OutputKind::Single, LayerGrad::Single(grad)) => grad,
            (OutputKind::Tuple, LayerGrad::Tuple(grads)) => {
                grads
                    .into_iter()
                    .next()
                    .ok_or(BufferErr::ShapeMismatch {
                        what: "layer outputs",
                        got: 0,
                        expected: 1,
                    })?
            }
            (kind, grad) => {
                return Err(BufferErr::Model(format!(
                    "layer {} was probed as {kind:?} but produced a {:?} gradient",
                    self.tap.layer,
                    grad.kind()
                )));
            }
        };

        let (rows, seq, dim) = grad.dim();
        let checks = [
            ("gradient batch", rows, batch.batch_size()),
            ("gradient positions", seq, batch.seq_len()),
            ("gradient width", dim, self.dim),
        ];
        for (what, got, expected) in checks {
            if got != expected {
                return Err(BufferErr::ShapeMismatch {
                    what,
                    got,
                    expected,
                });
            }
        }

        Ok(grad)
    }

    /// Runs one extraction round over `batch`.
    ///
    /// # Returns
    /// The harvested rows, `[n, d]`, ordered by sequence then position.
    pub fn extract(&mut self, batch: &TokenizedBatch) -> Result<Array2<f32>> {
        if batch.seq_len() < 2 {
            return Ok(Array2::zeros((0, self.dim)));
        }

        let grads = self.gradients(batch)?;
        harvest(grads.view(), batch.attention_mask())
    }
}

/// Keeps the rows of every position whose attention mask is set, except the final position
/// of each sequence which has no label.
///
/// # Arguments
/// * `grads` - Per position gradients, `[batch, seq, d]`.
/// * `attention_mask` - The batch's mask, `[batch, seq]`.
pub fn harvest(grads: ArrayView3<f32>, attention_mask: ArrayView2<u8>) -> Result<Array2<f32>> {
    let (batch, seq, dim) = grads.dim();
    if seq == 0 {
        return Ok(Array2::zeros((0, dim)));
    }

    let keep: Vec<usize> = attention_mask
        .slice(s![.., ..seq - 1])
        .indexed_iter()
        .filter(|&(_, &mask)| mask != 0)
        .map(|((b, t), _)| b * seq + t)
        .collect();

    let flat = grads
        .to_shape((batch * seq, dim))
        .map_err(|_| BufferErr::ShapeMismatch {
            what: "gradient elements",
            got: grads.len(),
            expected: batch * seq * dim,
        })?;

    Ok(flat.select(Axis(0), &keep))
}

#[cfg(test)]
mod tests {
    use ndarray::{Array3, array};

    use super::*;
    use crate::{
        arch::{BlockKind, TinyLm},
        data::{ByteTokenizer, Tokenizer},
    };

    fn model(blocks: &[BlockKind]) -> TinyLm {
        TinyLm::seeded(ByteTokenizer.vocab_size(), 6, blocks, 7)
    }

    #[test]
    fn harvest_drops_final_position_and_padding() {
        let grads =
            Array3::from_shape_fn((2, 3, 2), |(b, t, k)| (10 * b + t) as f32 + k as f32 * 0.5);
        let mask = array![[1_u8, 1, 1], [1, 0, 0]];

        let rows = harvest(grads.view(), mask.view()).unwrap();
        assert_eq!(rows, array![[0_f32, 0.5], [1., 1.5], [10., 10.5]]);
    }

    #[test]
    fn width_is_inferred_from_declared_layers() {
        let extractor =
            GradientExtractor::new(model(&[BlockKind::Mlp]), Tap::new(0, Direction::Out), None)
                .unwrap();
        assert_eq!(extractor.dim(), 6);
        assert_eq!(extractor.kind(), OutputKind::Single);
    }

    #[test]
    fn undeclared_width_must_be_given() {
        let tap = Tap::new(0, Direction::Out);
        assert!(matches!(
            GradientExtractor::new(model(&[BlockKind::Attn]), tap, None),
            Err(BufferErr::UnknownDimension { layer: 0 })
        ));

        let extractor = GradientExtractor::new(model(&[BlockKind::Attn]), tap, Some(6)).unwrap();
        assert_eq!(extractor.kind(), OutputKind::Tuple);
    }

    #[test]
    fn input_taps_are_single_even_on_tuple_layers() {
        let tap = Tap::new(0, Direction::In);
        let extractor = GradientExtractor::new(model(&[BlockKind::Attn]), tap, Some(6)).unwrap();
        assert_eq!(extractor.kind(), OutputKind::Single);
    }

    #[test]
    fn missing_layer_is_rejected() {
        let tap = Tap::new(3, Direction::Out);
        assert!(matches!(
            GradientExtractor::new(model(&[BlockKind::Mlp]), tap, None),
            Err(BufferErr::InvalidLayer { layer: 3, layers: 1 })
        ));
    }

    #[test]
    fn extract_yields_one_row_per_labelled_position() {
        let tap = Tap::new(1, Direction::Out);
        let model = model(&[BlockKind::Mlp, BlockKind::Attn]);
        let mut extractor = GradientExtractor::new(model, tap, Some(6)).unwrap();

        let batch = TokenizedBatch::encode(&ByteTokenizer, &["hello", "hi"], 8);
        let rows = extractor.extract(&batch).unwrap();

        // "hello" keeps positions 0..4, "hi" keeps 0..2 since position 4 is final.
        assert_eq!(rows.dim(), (4 + 2, 6));
        assert!(rows.iter().all(|x| x.is_finite()));
        assert!(rows.iter().any(|&x| x != 0.));
    }

    #[test]
    fn too_short_batches_yield_nothing() {
        let tap = Tap::new(0, Direction::Out);
        let mut extractor =
            GradientExtractor::new(model(&[BlockKind::Mlp]), tap, None).unwrap();

        let batch = TokenizedBatch::encode(&ByteTokenizer, &["a", ""], 8);
        assert_eq!(extractor.extract(&batch).unwrap().dim(), (0, 6));
    }

    #[test]
    fn wrong_width_is_a_shape_mismatch() {
        let tap = Tap::new(0, Direction::Out);
        let mut extractor =
            GradientExtractor::new(model(&[BlockKind::Mlp]), tap, Some(5)).unwrap();

        let batch = TokenizedBatch::encode(&ByteTokenizer, &["abc"], 8);
        assert!(matches!(
            extractor.extract(&batch),
            Err(BufferErr::ShapeMismatch { what: "gradient width", got: 6, expected: 5 })
        ));
    }
}
