use ndarray::{Array1, Array2, ArrayView2, linalg};
use rand::Rng;

use super::activations::ActFn;

/// A fully connected layer, `act(x·w + b)`.
///
/// The forward pass caches the pre-activation so that `backward` can compute the delta
/// flowing back into the input. Parameters are never updated here.
#[derive(Clone, Debug)]
pub struct Dense {
    dim: (usize, usize),
    act_fn: Option<ActFn>,
    w: Array2<f32>,
    b: Array1<f32>,

    // Forward metadata
    z: Array2<f32>,
}

impl Dense {
    /// Creates a new `Dense` with weights drawn uniformly from `±1/sqrt(fan_in)` and zero biases.
    ///
    /// # Arguments
    /// * `dim` - The `(input, output)` widths.
    /// * `act_fn` - Optional activation applied after the affine map.
    /// * `rng` - Source of the initial weights.
    pub fn new<R: Rng>(dim: (usize, usize), act_fn: Option<ActFn>, rng: &mut R) -> Self {
        let bound = 1. / (dim.0.max(1) as f32).sqrt();
        let w = Array2::from_shape_simple_fn(dim, || rng.random_range(-bound..=bound));

        Self::from_params(w, Array1::zeros(dim.1), act_fn)
    }

    /// Creates a new `Dense` from explicit parameters.
    pub fn from_params(w: Array2<f32>, b: Array1<f32>, act_fn: Option<ActFn>) -> Self {
        let dim = w.dim();

        Self {
            dim,
            act_fn,
            w,
            b,
            z: Array2::zeros((0, dim.1)),
        }
    }

    pub fn forward(&mut self, x: ArrayView2<f32>) -> Array2<f32> {
        let mut z = Array2::zeros((x.nrows(), self.dim.1));
        linalg::general_mat_mul(1.0, &x, &self.w, 0.0, &mut z);
        z += &self.b;

        let a = match &self.act_fn {
            Some(act_fn) => z.mapv(|z| act_fn.f(z)),
            None => z.clone(),
        };

        self.z = z;
        a
    }

    /// Propagates `d`, the delta at this layer's output, back to its input.
    pub fn backward(&self, d: ArrayView2<f32>) -> Array2<f32> {
        let mut d = d.to_owned();
        if let Some(act_fn) = &self.act_fn {
            d.zip_mut_with(&self.z, |d, &z| *d *= act_fn.df(z));
        }

        let mut dx = Array2::zeros((d.nrows(), self.dim.0));
        linalg::general_mat_mul(1.0, &d, &self.w.t(), 0.0, &mut dx);
        dx
    }

    /// Drops the cached forward metadata.
    pub fn clear(&mut self) {
        self.z = Array2::zeros((0, self.dim.1));
    }
}
