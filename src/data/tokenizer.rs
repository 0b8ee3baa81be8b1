use ndarray::{Array2, ArrayView2};

use super::SampleSource;
use crate::{BufferErr, Result};

/// Converts raw text into token ids.
pub trait Tokenizer {
    fn encode(&self, text: &str) -> Vec<u32>;

    /// The id written into padded positions.
    fn pad_id(&self) -> u32;

    fn vocab_size(&self) -> usize;
}

/// Byte level tokenizer: every byte maps to `byte + 1`, `0` is reserved for padding.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub fn new() -> Self {
        Self
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.bytes().map(|b| b as u32 + 1).collect()
    }

    fn pad_id(&self) -> u32 {
        0
    }

    fn vocab_size(&self) -> usize {
        u8::MAX as usize + 2
    }
}

/// Fixed length, right padded token sequences together with their attention mask.
///
/// Both arrays have shape `[batch, seq]`.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenizedBatch {
    input_ids: Array2<u32>,
    attention_mask: Array2<u8>,
}

impl TokenizedBatch {
    /// Creates a new `TokenizedBatch`.
    ///
    /// # Returns
    /// The batch or a `ShapeMismatch` if the ids and the mask disagree in shape.
    pub fn new(input_ids: Array2<u32>, attention_mask: Array2<u8>) -> Result<Self> {
        if input_ids.dim() != attention_mask.dim() {
            let got = attention_mask.len();
            return Err(BufferErr::ShapeMismatch {
                what: "attention mask",
                got,
                expected: input_ids.len(),
            });
        }

        Ok(Self {
            input_ids,
            attention_mask,
        })
    }

    /// Tokenizes `texts`, truncating each record to `max_len` tokens and padding on the
    /// right up to the longest record of the batch.
    pub fn encode<T, S>(tokenizer: &T, texts: &[S], max_len: usize) -> Self
    where
        T: Tokenizer + ?Sized,
        S: AsRef<str>,
    {
        let encoded: Vec<Vec<u32>> = texts
            .iter()
            .map(|text| {
                let mut ids = tokenizer.encode(text.as_ref());
                ids.truncate(max_len);
                ids
            })
            .collect();

        let seq_len = encoded.iter().map(Vec::len).max().unwrap_or_default();
        let mut input_ids = Array2::from_elem((encoded.len(), seq_len), tokenizer.pad_id());
        let mut attention_mask = Array2::zeros((encoded.len(), seq_len));

        for (b, ids) in encoded.iter().enumerate() {
            for (t, &id) in ids.iter().enumerate() {
                input_ids[(b, t)] = id;
                attention_mask[(b, t)] = 1;
            }
        }

        Self {
            input_ids,
            attention_mask,
        }
    }

    pub fn input_ids(&self) -> ArrayView2<'_, u32> {
        self.input_ids.view()
    }

    pub fn attention_mask(&self) -> ArrayView2<'_, u8> {
        self.attention_mask.view()
    }

    pub fn batch_size(&self) -> usize {
        self.input_ids.nrows()
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.ncols()
    }
}

/// Pulls records from a `SampleSource` and tokenizes them in fixed size batches.
#[derive(Debug, Clone)]
pub struct BatchLoader<T> {
    tokenizer: T,
    batch_size: usize,
    max_len: usize,
}

impl<T: Tokenizer> BatchLoader<T> {
    /// Creates a new `BatchLoader`.
    ///
    /// # Arguments
    /// * `tokenizer` - The tokenizer applied to every record.
    /// * `batch_size` - Records per batch.
    /// * `ctx_len` - Context length; sequences keep one extra token as the final label.
    pub fn new(tokenizer: T, batch_size: usize, ctx_len: usize) -> Self {
        Self {
            tokenizer,
            batch_size,
            max_len: ctx_len + 1,
        }
    }

    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    /// Pulls exactly `batch_size` records from `source`.
    ///
    /// # Returns
    /// The records or `EndOfStream` if the source ran dry first; a partial batch is
    /// never returned.
    pub fn text_batch<S>(&self, source: &mut S) -> Result<Vec<String>>
    where
        S: SampleSource + ?Sized,
    {
        (0..self.batch_size)
            .map(|_| source.next_record().unwrap_or(Err(BufferErr::EndOfStream)))
            .collect()
    }

    /// Pulls and tokenizes the next batch of records.
    pub fn tokenized_batch<S>(&self, source: &mut S) -> Result<TokenizedBatch>
    where
        S: SampleSource + ?Sized,
    {
        let texts = self.text_batch(source)?;
        Ok(TokenizedBatch::encode(&self.tokenizer, &texts, self.max_len))
    }
}
