use ndarray::Array2;
use rand::{SeedableRng, rngs::StdRng, seq::index};

use super::BufferPool;

/// Issues randomized, duplicate free batches of unread pool rows.
#[derive(Debug, Clone)]
pub struct BatchSampler {
    rng: StdRng,
}

impl BatchSampler {
    /// Creates a new `BatchSampler`.
    ///
    /// # Arguments
    /// * `seed` - Fixes the sampling order when given, otherwise the OS seeds it.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Self { rng }
    }

    /// Whether `pool` has fallen below half of its capacity in unread rows.
    pub fn needs_refill(&self, pool: &BufferPool) -> bool {
        pool.unread() < pool.capacity() / 2
    }

    /// Picks up to `size` unread rows uniformly at random, in random order.
    ///
    /// # Returns
    /// `min(size, unread)` distinct row indices.
    pub fn select(&mut self, pool: &BufferPool, size: usize) -> Vec<usize> {
        let unread = pool.unread_indices();
        let amount = size.min(unread.len());

        index::sample(&mut self.rng, unread.len(), amount)
            .into_iter()
            .map(|i| unread[i])
            .collect()
    }

    /// Selects a batch, marks it read and copies it out.
    pub fn next_batch(&mut self, pool: &mut BufferPool, size: usize) -> Array2<f32> {
        let idxs = self.select(pool, size);
        pool.mark_read(&idxs);
        pool.gather(&idxs)
    }
}
