use log::{debug, info, warn};
use ndarray::{Array2, s};

use super::{BatchSampler, BufferPool};
use crate::{
    BufferConfig, BufferErr, BufferMetrics, BufferSnapshot, Result,
    data::{BatchLoader, SampleSource, Tokenizer},
    extraction::{GradientExtractor, GradientModel, OutputKind, Tap},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Live,
    /// The source ran dry during a refill.
    Exhausted,
    /// A refill failed for any other reason.
    Poisoned,
}

/// A pool of per-token gradient rows captured at one layer of a language model, served as
/// randomized batches that never repeat a row within a pool generation.
///
/// Whenever fewer than half of the pool's rows are unread, the next batch call first refills
/// it: read rows are dropped, unread rows move to the front and new rows are extracted from
/// the sample source until the pool is full again.
pub struct GradientBuffer<S, M, T> {
    source: S,
    loader: BatchLoader<T>,
    extractor: GradientExtractor<M>,
    pool: BufferPool,
    sampler: BatchSampler,
    snapshot: BufferSnapshot,
    metrics: BufferMetrics,
    state: State,
}

impl<S, M, T> GradientBuffer<S, M, T>
where
    S: SampleSource,
    M: GradientModel,
    T: Tokenizer,
{
    /// Creates a new, empty `GradientBuffer`.
    ///
    /// # Arguments
    /// * `source` - The stream of raw text records.
    /// * `model` - The model whose gradients are captured.
    /// * `tokenizer` - Turns records into token ids the model understands.
    /// * `layer` - Index of the layer gradients are captured at.
    /// * `config` - The remaining construction parameters.
    ///
    /// # Returns
    /// The buffer or a configuration error: an out of range parameter, a pool too large to
    /// address, a missing layer, a feature dimension that can't be inferred or a tokenizer
    /// that emits ids the model does not know.
    pub fn new(
        source: S,
        model: M,
        tokenizer: T,
        layer: usize,
        config: BufferConfig,
    ) -> Result<Self> {
        let capacity = config.capacity()?;

        if tokenizer.vocab_size() > model.vocab_size() {
            return Err(BufferErr::ShapeMismatch {
                what: "tokenizer vocabulary",
                got: tokenizer.vocab_size(),
                expected: model.vocab_size(),
            });
        }

        let tap = Tap::new(layer, config.io);
        let extractor = GradientExtractor::new(model, tap, config.d_submodule)?;
        let dim = extractor.dim();

        capacity
            .checked_mul(dim)
            .and_then(|len| len.checked_mul(size_of::<f32>()))
            .filter(|&bytes| bytes <= isize::MAX as usize)
            .ok_or(BufferErr::InvalidConfig(
                "a pool of n_ctxs * ctx_len rows of d_submodule floats is not addressable",
            ))?;

        debug!(
            layer = layer,
            capacity = capacity,
            dim = dim;
            "gradient buffer created"
        );

        Ok(Self {
            source,
            loader: BatchLoader::new(
                tokenizer,
                config.refresh_batch_size.get(),
                config.ctx_len.get(),
            ),
            extractor,
            pool: BufferPool::new(capacity, dim),
            sampler: BatchSampler::new(config.seed),
            snapshot: config.snapshot(dim),
            metrics: BufferMetrics::default(),
            state: State::Live,
        })
    }

    /// The parameters this buffer was built with.
    pub fn config(&self) -> &BufferSnapshot {
        &self.snapshot
    }

    pub fn metrics(&self) -> &BufferMetrics {
        &self.metrics
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn model(&self) -> &M {
        self.extractor.model()
    }

    /// What the target layer was probed to return.
    pub fn output_kind(&self) -> OutputKind {
        self.extractor.kind()
    }

    /// Returns the next batch of `out_batch_size` rows, or fewer if the pool can't supply that
    /// many, refilling first if less than half of the pool is unread.
    ///
    /// # Returns
    /// The batch, `EndOfStream` once the source can no longer refill the pool or `Poisoned`
    /// after any other refill failure.
    pub fn next_batch(&mut self) -> Result<Array2<f32>> {
        self.check_state()?;

        if self.sampler.needs_refill(&self.pool) {
            self.refresh()?;
        }

        let batch = self
            .sampler
            .next_batch(&mut self.pool, self.snapshot.out_batch_size);
        self.metrics.add_batch(batch.nrows());

        Ok(batch)
    }

    /// Refills the pool to capacity, keeping every unread row.
    ///
    /// A failed refill leaves the pool partially filled; the buffer refuses any further work
    /// afterwards.
    pub fn refresh(&mut self) -> Result<()> {
        self.check_state()?;

        if let Err(e) = self.refill() {
            self.state = match e {
                BufferErr::EndOfStream => State::Exhausted,
                _ => State::Poisoned,
            };
            warn!("refill failed with {} of {} rows: {e}", self.pool.len(), self.pool.capacity());
            return Err(e);
        }

        Ok(())
    }

    /// Closes the underlying sample source.
    pub fn close(&mut self) -> Result<()> {
        self.source.close()
    }

    fn check_state(&self) -> Result<()> {
        match self.state {
            State::Live => Ok(()),
            State::Exhausted => Err(BufferErr::EndOfStream),
            State::Poisoned => Err(BufferErr::Poisoned),
        }
    }

    fn refill(&mut self) -> Result<()> {
        self.extractor.release_cache();

        let kept = self.pool.compact()?;
        let capacity = self.pool.capacity();
        info!(unread = kept, capacity = capacity; "refreshing gradient buffer");

        while !self.pool.is_full() {
            let batch = self.loader.tokenized_batch(&mut self.source)?;
            let rows = self.extractor.extract(&batch)?;

            let remaining = self.pool.remaining_space()?;
            let take = rows.nrows().min(remaining);
            self.pool.append(rows.slice(s![..take, ..]))?;

            let positions = batch.batch_size() * batch.seq_len();
            self.metrics.add_round(take, positions - take);
            debug!(
                round = self.metrics.rounds,
                appended = take,
                filled = self.pool.len(),
                capacity = capacity;
                "extraction round"
            );
        }

        self.pool.reset_read();
        self.metrics.bump_refill();
        info!(refills = self.metrics.refills; "gradient buffer refreshed");

        Ok(())
    }
}

impl<S, M, T> Iterator for GradientBuffer<S, M, T>
where
    S: SampleSource,
    M: GradientModel,
    T: Tokenizer,
{
    type Item = Result<Array2<f32>>;

    /// Yields batches until a refill fails; that failure is yielded once, then `None`.
    fn next(&mut self) -> Option<Self::Item> {
        match self.state {
            State::Live => Some(self.next_batch()),
            State::Exhausted | State::Poisoned => None,
        }
    }
}
