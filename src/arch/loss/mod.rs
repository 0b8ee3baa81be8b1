mod cross_entropy;
mod loss_fn;

pub use cross_entropy::{IGNORE_INDEX, MaskedCrossEntropy};
pub use loss_fn::LossFn;
