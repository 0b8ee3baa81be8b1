pub mod activations;
mod dense;
pub mod loss;
mod tiny_lm;

pub use dense::Dense;
pub use tiny_lm::{BlockKind, TinyLm};
