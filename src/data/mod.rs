pub mod source;
pub mod tokenizer;

pub use source::{IterSource, SampleSource, TextStream};
pub use tokenizer::{BatchLoader, ByteTokenizer, TokenizedBatch, Tokenizer};
