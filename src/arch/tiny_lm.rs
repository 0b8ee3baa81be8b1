use ndarray::{Array2, Array3, ArrayView3, Axis};
use rand::{Rng, SeedableRng, rngs::StdRng};

use super::{Dense, activations::ActFn};
use crate::{
    BufferErr, Direction, Result,
    data::TokenizedBatch,
    extraction::{GradientModel, LayerGrad, OutputKind, Tap},
};

/// The flavour of a residual block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Returns its hidden state and declares its widths.
    Mlp,
    /// Returns `(hidden, pre-activation)` and declares no widths.
    Attn,
}

#[derive(Debug, Clone)]
struct Block {
    kind: BlockKind,
    dense: Dense,
}

impl Block {
    fn forward(&mut self, x: Array2<f32>) -> Array2<f32> {
        let a = self.dense.forward(x.view());
        x + a
    }

    fn backward(&self, d: Array2<f32>) -> Array2<f32> {
        let dx = self.dense.backward(d.view());
        d + dx
    }
}

/// A small residual language model: token embedding, a stack of residual dense blocks and an
/// unembedding. Every position is processed independently.
#[derive(Debug, Clone)]
pub struct TinyLm {
    vocab: usize,
    d_model: usize,
    embed: Array2<f32>,
    blocks: Vec<Block>,
    unembed: Array2<f32>,

    // Shape of the cached forward pass
    shape: Option<(usize, usize)>,
}

impl TinyLm {
    /// Creates a new `TinyLm` with randomly initialized weights.
    ///
    /// # Arguments
    /// * `vocab` - Vocabulary size.
    /// * `d_model` - Width of the hidden state.
    /// * `blocks` - The kind of every residual block, bottom to top.
    /// * `rng` - Source of the initial weights.
    pub fn new<R: Rng>(vocab: usize, d_model: usize, blocks: &[BlockKind], rng: &mut R) -> Self {
        let embed = Array2::from_shape_simple_fn((vocab, d_model), || rng.random_range(-1.0..1.0));
        let blocks = blocks
            .iter()
            .map(|&kind| Block {
                kind,
                dense: Dense::new((d_model, d_model), Some(ActFn::tanh()), rng),
            })
            .collect();
        let bound = 1. / (d_model.max(1) as f32).sqrt();
        let unembed =
            Array2::from_shape_simple_fn((d_model, vocab), || rng.random_range(-bound..=bound));

        Self {
            vocab,
            d_model,
            embed,
            blocks,
            unembed,
            shape: None,
        }
    }

    /// Creates a new `TinyLm` from a fixed seed.
    pub fn seeded(vocab: usize, d_model: usize, blocks: &[BlockKind], seed: u64) -> Self {
        Self::new(vocab, d_model, blocks, &mut StdRng::seed_from_u64(seed))
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    fn unflatten(&self, x: Array2<f32>, batch: usize, seq: usize) -> Result<Array3<f32>> {
        let (rows, cols) = x.dim();
        x.into_shape_with_order((batch, seq, cols))
            .map_err(|_| BufferErr::ShapeMismatch {
                what: "flattened positions",
                got: rows,
                expected: batch * seq,
            })
    }
}

impl GradientModel for TinyLm {
    fn vocab_size(&self) -> usize {
        self.vocab
    }

    fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    fn declared_width(&self, layer: usize, _direction: Direction) -> Option<usize> {
        match self.blocks.get(layer)?.kind {
            BlockKind::Mlp => Some(self.d_model),
            BlockKind::Attn => None,
        }
    }

    fn output_kind(&self, layer: usize) -> Result<OutputKind> {
        let block = self.blocks.get(layer).ok_or(BufferErr::InvalidLayer {
            layer,
            layers: self.blocks.len(),
        })?;

        Ok(match block.kind {
            BlockKind::Mlp => OutputKind::Single,
            BlockKind::Attn => OutputKind::Tuple,
        })
    }

    fn forward(&mut self, batch: &TokenizedBatch) -> Result<Array3<f32>> {
        let (rows, seq) = batch.input_ids().dim();

        let ids = batch
            .input_ids()
            .iter()
            .map(|&id| {
                let id = id as usize;
                if id < self.vocab {
                    Ok(id)
                } else {
                    Err(BufferErr::ShapeMismatch {
                        what: "token id",
                        got: id,
                        expected: self.vocab,
                    })
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let mut x = self.embed.select(Axis(0), &ids);
        for block in &mut self.blocks {
            x = block.forward(x);
        }

        let logits = x.dot(&self.unembed);
        self.shape = Some((rows, seq));
        self.unflatten(logits, rows, seq)
    }

    fn backward(&mut self, d_logits: ArrayView3<f32>, tap: Tap) -> Result<LayerGrad> {
        let (rows, seq) = self
            .shape
            .ok_or_else(|| BufferErr::Model("backward called before forward".to_string()))?;

        let block = self.blocks.get(tap.layer).ok_or(BufferErr::InvalidLayer {
            layer: tap.layer,
            layers: self.blocks.len(),
        })?;

        if d_logits.dim() != (rows, seq, self.vocab) {
            return Err(BufferErr::ShapeMismatch {
                what: "logit gradient",
                got: d_logits.len(),
                expected: rows * seq * self.vocab,
            });
        }

        let d_logits = d_logits
            .to_shape((rows * seq, self.vocab))
            .map_err(|_| BufferErr::ShapeMismatch {
                what: "logit gradient",
                got: d_logits.len(),
                expected: rows * seq * self.vocab,
            })?;

        let mut d = d_logits.dot(&self.unembed.t());
        for above in self.blocks[tap.layer + 1..].iter().rev() {
            d = above.backward(d);
        }

        match (tap.direction, block.kind) {
            (Direction::In, _) => {
                let d_in = block.backward(d);
                Ok(LayerGrad::Single(self.unflatten(d_in, rows, seq)?))
            }
            (Direction::Out, BlockKind::Mlp) => {
                Ok(LayerGrad::Single(self.unflatten(d, rows, seq)?))
            }
            (Direction::Out, BlockKind::Attn) => {
                // The pre-activation element is not consumed downstream.
                let d_z = Array3::zeros((rows, seq, self.d_model));
                let d_hidden = self.unflatten(d, rows, seq)?;
                Ok(LayerGrad::Tuple(vec![d_hidden, d_z]))
            }
        }
    }

    fn release_cache(&mut self) {
        for block in &mut self.blocks {
            block.dense.clear();
        }
        self.shape = None;
    }
}

#[cfg(test)]
mod tests {
    use ndarray::s;

    use super::*;
    use crate::{
        arch::loss::{LossFn, MaskedCrossEntropy},
        data::{ByteTokenizer, Tokenizer},
    };

    const VOCAB: usize = 257;

    fn batch(texts: &[&str]) -> TokenizedBatch {
        TokenizedBatch::encode(&ByteTokenizer, texts, 16)
    }

    fn loss_of(model: &mut TinyLm, batch: &TokenizedBatch) -> f32 {
        let loss_fn = MaskedCrossEntropy;
        let logits = model.forward(batch).unwrap();
        let labels = loss_fn.shift_labels(batch.input_ids(), batch.attention_mask());
        loss_fn.loss(logits.view(), labels.view()).unwrap()
    }

    fn grad_at(model: &mut TinyLm, batch: &TokenizedBatch, tap: Tap) -> LayerGrad {
        let loss_fn = MaskedCrossEntropy;
        let logits = model.forward(batch).unwrap();
        let labels = loss_fn.shift_labels(batch.input_ids(), batch.attention_mask());
        let d_logits = loss_fn.loss_prime(logits.view(), labels.view()).unwrap();
        model.backward(d_logits.view(), tap).unwrap()
    }

    #[test]
    fn forward_produces_logits_per_position() {
        let mut model = TinyLm::seeded(VOCAB, 4, &[BlockKind::Mlp, BlockKind::Mlp], 1);
        let logits = model.forward(&batch(&["abc", "de"])).unwrap();
        assert_eq!(logits.dim(), (2, 3, VOCAB));
        assert_eq!(ByteTokenizer.vocab_size(), VOCAB);
    }

    #[test]
    fn input_gradient_matches_embedding_finite_differences() {
        let mut model = TinyLm::seeded(VOCAB, 4, &[BlockKind::Mlp, BlockKind::Mlp], 3);
        let batch = batch(&["abcd"]);

        let LayerGrad::Single(grad) = grad_at(&mut model, &batch, Tap::new(0, Direction::In))
        else {
            panic!("input taps are single");
        };

        let h = 1e-2;
        for (pos, byte) in "abcd".bytes().enumerate() {
            let id = byte as usize + 1;
            for k in 0..4 {
                let mut plus = model.clone();
                plus.embed[(id, k)] += h;
                let mut minus = model.clone();
                minus.embed[(id, k)] -= h;

                let numeric = (loss_of(&mut plus, &batch) - loss_of(&mut minus, &batch)) / (2. * h);
                let analytic = grad[(0, pos, k)];
                assert!(
                    (numeric - analytic).abs() < 2e-3,
                    "pos {pos} k {k}: {numeric} vs {analytic}"
                );
            }
        }
    }

    #[test]
    fn final_position_receives_no_gradient() {
        let mut model = TinyLm::seeded(VOCAB, 4, &[BlockKind::Mlp], 5);
        let tap = Tap::new(0, Direction::Out);
        let LayerGrad::Single(grad) = grad_at(&mut model, &batch(&["xyz"]), tap) else {
            panic!("mlp blocks are single");
        };

        assert!(grad.slice(s![0, 2, ..]).iter().all(|&x| x == 0.));
        assert!(grad.slice(s![0, ..2, ..]).iter().any(|&x| x != 0.));
    }

    #[test]
    fn input_of_a_block_is_output_of_the_one_below() {
        let blocks = [BlockKind::Mlp; 3];
        let mut model = TinyLm::seeded(VOCAB, 4, &blocks, 9);
        let batch = batch(&["residual", "stream"]);

        let out = Tap::new(0, Direction::Out);
        let LayerGrad::Single(below) = grad_at(&mut model, &batch, out) else {
            panic!("mlp blocks are single");
        };
        let above = Tap::new(1, Direction::In);
        let LayerGrad::Single(input) = grad_at(&mut model, &batch, above) else {
            panic!("input taps are single");
        };

        assert_eq!(below, input);
    }

    #[test]
    fn attn_blocks_return_tuples() {
        let mut model = TinyLm::seeded(VOCAB, 4, &[BlockKind::Attn, BlockKind::Mlp], 11);
        assert_eq!(model.output_kind(0).unwrap(), OutputKind::Tuple);
        assert_eq!(model.declared_width(0, Direction::Out), None);
        assert_eq!(model.declared_width(1, Direction::In), Some(4));

        let tap = Tap::new(0, Direction::Out);
        let LayerGrad::Tuple(grads) = grad_at(&mut model, &batch(&["tuple"]), tap) else {
            panic!("attn blocks are tuples");
        };
        assert_eq!(grads.len(), 2);
        assert!(grads[0].iter().any(|&x| x != 0.));
        assert!(grads[1].iter().all(|&x| x == 0.));
    }

    #[test]
    fn backward_requires_a_forward_pass() {
        let mut model = TinyLm::seeded(VOCAB, 4, &[BlockKind::Mlp], 13);
        model.forward(&batch(&["ab"])).unwrap();
        model.release_cache();

        let d_logits = Array3::zeros((1, 2, VOCAB));
        assert!(matches!(
            model.backward(d_logits.view(), Tap::new(0, Direction::Out)),
            Err(BufferErr::Model(_))
        ));
    }

    #[test]
    fn out_of_vocabulary_tokens_are_rejected() {
        let mut model = TinyLm::seeded(8, 4, &[BlockKind::Mlp], 17);
        assert!(matches!(
            model.forward(&batch(&["z"])),
            Err(BufferErr::ShapeMismatch { what: "token id", .. })
        ));
    }
}
