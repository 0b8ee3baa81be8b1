pub mod arch;
pub mod buffer;
pub mod config;
pub mod data;
pub mod error;
pub mod extraction;
pub mod metrics;

pub use buffer::{BatchSampler, BufferPool, GradientBuffer};
pub use config::{BufferConfig, BufferSnapshot, Device, Direction};
pub use error::{BufferErr, Result};
pub use metrics::BufferMetrics;
