use ndarray::{Array2, ArrayView2, Axis};

use crate::{BufferErr, Result};

/// Fixed capacity storage of gradient rows, each with a read marker.
///
/// Rows only change through `compact` (drop every read row), `append` (fill empty slots) and
/// `reset_read`. Outside of a refill `rows().nrows() == read().len()` always holds.
#[derive(Debug, Clone)]
pub struct BufferPool {
    rows: Array2<f32>,
    read: Vec<bool>,
    capacity: usize,
}

impl BufferPool {
    /// Creates a new, empty `BufferPool`.
    ///
    /// # Arguments
    /// * `capacity` - The maximum amount of rows.
    /// * `dim` - The width of every row.
    pub fn new(capacity: usize, dim: usize) -> Self {
        Self {
            rows: Array2::zeros((0, dim)),
            read: Vec::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dim(&self) -> usize {
        self.rows.ncols()
    }

    /// The amount of populated rows.
    pub fn len(&self) -> usize {
        self.rows.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// The amount of rows not yet issued in this pool generation.
    pub fn unread(&self) -> usize {
        self.read.iter().filter(|&&read| !read).count()
    }

    pub fn unread_indices(&self) -> Vec<usize> {
        self.read
            .iter()
            .enumerate()
            .filter_map(|(i, &read)| (!read).then_some(i))
            .collect()
    }

    pub fn rows(&self) -> ArrayView2<'_, f32> {
        self.rows.view()
    }

    pub fn read(&self) -> &[bool] {
        &self.read
    }

    /// Returns the amount of empty slots.
    ///
    /// # Returns
    /// The free slots or `PoolFull` if there are none: asking to append to a full pool is a
    /// refill bookkeeping bug.
    pub fn remaining_space(&self) -> Result<usize> {
        match self.capacity.checked_sub(self.len()) {
            Some(remaining) if remaining > 0 => Ok(remaining),
            _ => Err(BufferErr::PoolFull {
                len: self.len(),
                capacity: self.capacity,
            }),
        }
    }

    /// Drops every read row, keeping the unread ones at the front in their relative order.
    ///
    /// The survivors are copied into a freshly allocated array with room for `capacity` rows;
    /// the old storage is released.
    ///
    /// # Returns
    /// The amount of rows that survived, or an error if the storage can't be reserved. The
    /// pool is left untouched on error.
    pub fn compact(&mut self) -> Result<usize> {
        let keep = self.unread_indices();
        let dim = self.dim();

        let len = self
            .capacity
            .checked_mul(dim)
            .ok_or(BufferErr::InvalidConfig("pool size overflows a usize"))?;
        let mut data: Vec<f32> = Vec::new();
        data.try_reserve_exact(len)?;
        for &i in &keep {
            data.extend(self.rows.row(i).iter());
        }

        self.rows = Array2::from_shape_vec((keep.len(), dim), data).map_err(|_| {
            BufferErr::ShapeMismatch {
                what: "compacted rows",
                got: keep.len(),
                expected: self.read.len(),
            }
        })?;
        self.read = vec![false; keep.len()];

        Ok(keep.len())
    }

    /// Writes `rows` into the first empty slots.
    ///
    /// # Returns
    /// `CapacityExceeded` if `rows` does not fit; callers truncate to `remaining_space` first.
    pub fn append(&mut self, rows: ArrayView2<f32>) -> Result<()> {
        if rows.ncols() != self.dim() {
            return Err(BufferErr::ShapeMismatch {
                what: "row width",
                got: rows.ncols(),
                expected: self.dim(),
            });
        }

        let remaining = self.capacity.saturating_sub(self.len());
        if rows.nrows() > remaining {
            return Err(BufferErr::CapacityExceeded {
                got: rows.nrows(),
                remaining,
            });
        }

        let (got, dim) = rows.dim();
        self.rows
            .append(Axis(0), rows)
            .map_err(|_| BufferErr::ShapeMismatch {
                what: "appended rows",
                got,
                expected: dim,
            })?;
        self.read.resize(self.rows.nrows(), false);

        Ok(())
    }

    /// Marks the given rows as issued.
    ///
    /// # Panics
    /// If an index is out of bounds. Indices must also be unread, which is only checked in
    /// debug builds.
    pub fn mark_read(&mut self, idxs: &[usize]) {
        for &i in idxs {
            debug_assert!(!self.read[i], "row {i} was already read");
            self.read[i] = true;
        }
    }

    /// Starts a new pool generation: every row becomes unread.
    pub fn reset_read(&mut self) {
        self.read.clear();
        self.read.resize(self.rows.nrows(), false);
    }

    /// Copies out the given rows, in the given order.
    pub fn gather(&self, idxs: &[usize]) -> Array2<f32> {
        self.rows.select(Axis(0), idxs)
    }
}
