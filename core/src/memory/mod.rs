mod buffer;
mod safeguard;

pub use buffer::AdaptiveBuffer;
pub use buffer::compute_buffer_size;
pub use safeguard::BufferPool;
pub use safeguard::CleanupReason;
pub use safeguard::CleanupReport;
pub use safeguard::MemoryProbe;
pub use safeguard::MemorySafeguard;
