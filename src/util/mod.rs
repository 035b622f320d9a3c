//! Some useful types.

mod async_stream;
pub(crate) use async_stream::AsyncStream;
pub use async_stream::ConnectionMode;

mod pid_allocator;
pub use pid_allocator::PidAllocator;

mod tokio_runtime;
pub use tokio_runtime::{RuntimeLease, SharedRuntime, TokioRuntime};
