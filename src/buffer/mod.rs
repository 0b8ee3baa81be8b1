mod gradient_buffer;
mod pool;
mod sampler;

pub use gradient_buffer::GradientBuffer;
pub use pool::BufferPool;
pub use sampler::BatchSampler;
