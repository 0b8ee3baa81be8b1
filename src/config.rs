use std::{fmt, num::NonZeroUsize, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{BufferErr, Result};

const DEFAULT_N_CTXS: f64 = 3e4;
const DEFAULT_CTX_LEN: NonZeroUsize = NonZeroUsize::new(128).unwrap();
const DEFAULT_REFRESH_BATCH_SIZE: NonZeroUsize = NonZeroUsize::new(512).unwrap();
const DEFAULT_OUT_BATCH_SIZE: NonZeroUsize = NonZeroUsize::new(8192).unwrap();

/// Which side of the target layer gradients are captured on.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Direction {
    /// The gradient flowing into the layer's input.
    In,
    /// The gradient flowing into the layer's output.
    #[default]
    Out,
}

impl FromStr for Direction {
    type Err = BufferErr;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in" => Ok(Self::In),
            "out" => Ok(Self::Out),
            other => Err(BufferErr::InvalidDirection(other.to_string())),
        }
    }
}

impl TryFrom<String> for Direction {
    type Error = BufferErr;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Direction> for String {
    fn from(value: Direction) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => f.write_str("in"),
            Direction::Out => f.write_str("out"),
        }
    }
}

/// Where the pool rows are meant to live.
///
/// Rows are always held in host memory; accelerator designators are accepted so that
/// configurations written for GPU runs load unchanged and show up in the snapshot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
}

impl FromStr for Device {
    type Err = BufferErr;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || BufferErr::InvalidDevice(s.to_string());

        match s.split_once(':') {
            None if s == "cpu" => Ok(Self::Cpu),
            None if s == "cuda" => Ok(Self::Cuda(0)),
            Some(("cuda", ordinal)) => ordinal.parse().map(Self::Cuda).map_err(|_| invalid()),
            _ => Err(invalid()),
        }
    }
}

impl TryFrom<String> for Device {
    type Error = BufferErr;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(value: Device) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

/// Construction parameters of a `GradientBuffer`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Width of the captured rows, inferred from the layer when `None`.
    pub d_submodule: Option<usize>,
    pub io: Direction,
    /// Approximate number of contexts the pool holds.
    pub n_ctxs: f64,
    /// Token positions per context.
    pub ctx_len: NonZeroUsize,
    /// Records pulled from the source per extraction round.
    pub refresh_batch_size: NonZeroUsize,
    /// Rows handed out per batch.
    pub out_batch_size: NonZeroUsize,
    pub device: Device,
    /// Seed for the batch sampler, drawn from the OS when `None`.
    pub seed: Option<u64>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            d_submodule: None,
            io: Direction::default(),
            n_ctxs: DEFAULT_N_CTXS,
            ctx_len: DEFAULT_CTX_LEN,
            refresh_batch_size: DEFAULT_REFRESH_BATCH_SIZE,
            out_batch_size: DEFAULT_OUT_BATCH_SIZE,
            device: Device::default(),
            seed: None,
        }
    }
}

impl BufferConfig {
    /// Returns the pool capacity, `floor(n_ctxs * ctx_len)`.
    ///
    /// # Returns
    /// The capacity or an error if it would be smaller than two rows or larger than a `usize`.
    pub fn capacity(&self) -> Result<usize> {
        if !self.n_ctxs.is_finite() || self.n_ctxs <= 0.0 {
            return Err(BufferErr::InvalidConfig("n_ctxs must be a positive number"));
        }

        let rows = (self.n_ctxs * self.ctx_len.get() as f64).floor();
        if rows >= usize::MAX as f64 {
            return Err(BufferErr::InvalidConfig(
                "n_ctxs * ctx_len exceeds the addressable amount of rows",
            ));
        }

        let capacity = rows as usize;
        if capacity < 2 {
            return Err(BufferErr::InvalidConfig(
                "n_ctxs * ctx_len must hold at least two rows",
            ));
        }

        Ok(capacity)
    }

    /// Freezes this configuration with its resolved feature dimension.
    pub(crate) fn snapshot(&self, d_submodule: usize) -> BufferSnapshot {
        BufferSnapshot {
            d_submodule,
            io: self.io,
            n_ctxs: self.n_ctxs,
            ctx_len: self.ctx_len.get(),
            refresh_batch_size: self.refresh_batch_size.get(),
            out_batch_size: self.out_batch_size.get(),
            device: self.device,
        }
    }
}

/// Read-only view of the parameters a buffer was built with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferSnapshot {
    pub d_submodule: usize,
    pub io: Direction,
    pub n_ctxs: f64,
    pub ctx_len: usize,
    pub refresh_batch_size: usize,
    pub out_batch_size: usize,
    pub device: Device,
}
