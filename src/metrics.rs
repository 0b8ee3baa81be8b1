use serde::Serialize;

/// Running counters of a `GradientBuffer`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BufferMetrics {
    /// Completed refills.
    pub refills: u64,
    /// Extraction rounds across every refill.
    pub rounds: u64,
    /// Rows appended to the pool.
    pub rows_extracted: u64,
    /// Token positions dropped for being padding, final, or past the pool's capacity.
    pub rows_discarded: u64,
    pub batches: u64,
    pub rows_served: u64,
}

impl BufferMetrics {
    #[inline]
    pub fn bump_refill(&mut self) {
        self.refills += 1;
    }

    #[inline]
    pub fn add_round(&mut self, appended: usize, discarded: usize) {
        self.rounds += 1;
        self.rows_extracted += appended as u64;
        self.rows_discarded += discarded as u64;
    }

    #[inline]
    pub fn add_batch(&mut self, rows: usize) {
        self.batches += 1;
        self.rows_served += rows as u64;
    }
}
