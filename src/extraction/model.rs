use ndarray::{Array3, ArrayView3};

use crate::{Direction, Result, data::TokenizedBatch};

/// How a layer hands back its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// A single `[batch, seq, d]` array.
    Single,
    /// A group of arrays; the hidden state is the first element.
    Tuple,
}

/// The gradient captured at a layer, shaped like the layer's output.
#[derive(Debug, Clone)]
pub enum LayerGrad {
    Single(Array3<f32>),
    Tuple(Vec<Array3<f32>>),
}

impl LayerGrad {
    pub fn kind(&self) -> OutputKind {
        match self {
            LayerGrad::Single(_) => OutputKind::Single,
            LayerGrad::Tuple(_) => OutputKind::Tuple,
        }
    }
}

/// A point in the model where gradients are captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tap {
    pub layer: usize,
    pub direction: Direction,
}

impl Tap {
    pub fn new(layer: usize, direction: Direction) -> Self {
        Self { layer, direction }
    }
}

/// A language model that can be traced: run forward, then propagate a loss gradient back to
/// one of its layers.
pub trait GradientModel {
    fn vocab_size(&self) -> usize;

    fn num_layers(&self) -> usize;

    /// The width the layer declares on the given side, if it declares one.
    fn declared_width(&self, layer: usize, direction: Direction) -> Option<usize>;

    /// Reports whether the layer returns a single array or a group of arrays.
    fn output_kind(&self, layer: usize) -> Result<OutputKind>;

    /// Runs the forward pass, caching whatever `backward` needs.
    ///
    /// # Returns
    /// The logits, `[batch, seq, vocab]`.
    fn forward(&mut self, batch: &TokenizedBatch) -> Result<Array3<f32>>;

    /// Propagates `d_logits` back through the last forward pass down to `tap`.
    ///
    /// Output taps return a value shaped like the layer's output; input taps always return
    /// the gradient of the first positional input as a `LayerGrad::Single`.
    fn backward(&mut self, d_logits: ArrayView3<f32>, tap: Tap) -> Result<LayerGrad>;

    /// Releases transient buffers held between passes.
    fn release_cache(&mut self) {}
}
