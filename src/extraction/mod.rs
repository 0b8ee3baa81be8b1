mod extractor;
mod model;

pub use extractor::{GradientExtractor, harvest};
pub use model::{GradientModel, LayerGrad, OutputKind, Tap};
