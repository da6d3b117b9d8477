//! Reference [`Driver`](crate::Driver) implementations.
//!
//! - [`MemoryDriver`]: concurrent in-process map
//! - [`FsDriver`]: one file per key under a base directory
//! - [`NullDriver`]: accepts writes and stores nothing
//! - [`QueueDriver`]: write-batching decorator over another driver

pub mod fs;
pub mod memory;
pub mod null;
pub mod queue;

pub use fs::{FsDriver, FsDriverConfig};
pub use memory::MemoryDriver;
pub use null::NullDriver;
pub use queue::{QueueConfig, QueueDriver, QueuedOperation, QueuedValue};
