#![allow(dead_code)]

use std::{collections::VecDeque, num::NonZeroUsize};

use gradient_buffer::{
    BufferConfig, BufferErr, Direction, GradientBuffer, Result,
    data::{ByteTokenizer, SampleSource, TokenizedBatch},
    extraction::{GradientModel, LayerGrad, OutputKind, Tap},
};
use ndarray::{Array2, Array3, ArrayView1, ArrayView3};

pub const VOCAB: usize = 257;
pub const WIDTH: usize = 3;

/// A one layer model whose gradient rows identify where they came from:
/// `[token id, position, sequence number]`. Sequence numbers keep growing across calls, so
/// every row ever produced is unique.
#[derive(Debug)]
pub struct StubLm {
    pub kind: OutputKind,
    pub width: Option<usize>,
    pub forwards: usize,
    pub releases: usize,
    sequences: usize,
    ids: Option<Array2<u32>>,
}

impl StubLm {
    pub fn new() -> Self {
        Self::with(OutputKind::Single, Some(WIDTH))
    }

    pub fn with(kind: OutputKind, width: Option<usize>) -> Self {
        Self {
            kind,
            width,
            forwards: 0,
            releases: 0,
            sequences: 0,
            ids: None,
        }
    }
}

impl GradientModel for StubLm {
    fn vocab_size(&self) -> usize {
        VOCAB
    }

    fn num_layers(&self) -> usize {
        1
    }

    fn declared_width(&self, layer: usize, _direction: Direction) -> Option<usize> {
        if layer == 0 { self.width } else { None }
    }

    fn output_kind(&self, layer: usize) -> Result<OutputKind> {
        match layer {
            0 => Ok(self.kind),
            _ => Err(BufferErr::InvalidLayer { layer, layers: 1 }),
        }
    }

    fn forward(&mut self, batch: &TokenizedBatch) -> Result<Array3<f32>> {
        self.forwards += 1;
        self.ids = Some(batch.input_ids().to_owned());

        let (rows, seq) = batch.input_ids().dim();
        Ok(Array3::zeros((rows, seq, VOCAB)))
    }

    fn backward(&mut self, _d_logits: ArrayView3<f32>, tap: Tap) -> Result<LayerGrad> {
        let ids = self
            .ids
            .take()
            .ok_or_else(|| BufferErr::Model("no forward pass".to_string()))?;

        let (rows, seq) = ids.dim();
        let first = self.sequences;
        self.sequences += rows;

        let grad = Array3::from_shape_fn((rows, seq, WIDTH), |(b, t, k)| match k {
            0 => ids[(b, t)] as f32,
            1 => t as f32,
            _ => (first + b) as f32,
        });

        Ok(match (tap.direction, self.kind) {
            (Direction::Out, OutputKind::Tuple) => {
                let extra = Array3::ones((rows, seq, WIDTH));
                LayerGrad::Tuple(vec![grad, extra])
            }
            _ => LayerGrad::Single(grad),
        })
    }

    fn release_cache(&mut self) {
        self.releases += 1;
        self.ids = None;
    }
}

/// A source over a fixed list of records that remembers whether it was closed.
#[derive(Debug)]
pub struct VecSource {
    records: VecDeque<String>,
    pub closed: bool,
}

impl VecSource {
    pub fn new(records: Vec<String>) -> Self {
        Self {
            records: records.into(),
            closed: false,
        }
    }
}

impl SampleSource for VecSource {
    fn next_record(&mut self) -> Option<Result<String>> {
        if self.closed {
            return None;
        }
        self.records.pop_front().map(Ok)
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

pub type StubBuffer = GradientBuffer<VecSource, StubLm, ByteTokenizer>;

/// `n` records of `len` characters each.
pub fn records(n: usize, len: usize) -> Vec<String> {
    (0..n).map(|i| char::from(b'a' + (i % 26) as u8).to_string().repeat(len)).collect()
}

pub fn config(n_ctxs: f64, ctx_len: usize, refresh: usize, out: usize) -> BufferConfig {
    BufferConfig {
        n_ctxs,
        ctx_len: NonZeroUsize::new(ctx_len).unwrap(),
        refresh_batch_size: NonZeroUsize::new(refresh).unwrap(),
        out_batch_size: NonZeroUsize::new(out).unwrap(),
        seed: Some(7),
        ..Default::default()
    }
}

pub fn buffer(records: Vec<String>, config: BufferConfig) -> StubBuffer {
    GradientBuffer::new(VecSource::new(records), StubLm::new(), ByteTokenizer, 0, config).unwrap()
}

/// The `(sequence, position)` a stub gradient row was captured at.
pub fn key(row: ArrayView1<f32>) -> (usize, usize) {
    (row[2] as usize, row[1] as usize)
}

pub fn keys(rows: &Array2<f32>) -> Vec<(usize, usize)> {
    rows.rows().into_iter().map(key).collect()
}
