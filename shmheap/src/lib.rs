//! Node-scoped shared memory for co-located cores.
//!
//! - [`Segment`]: a named POSIX shared-memory object mapped at a fixed base
//! - [`ManagedHeap`]: a first-fit heap living inside a segment
//! - [`LocaleHeap`]: the locale bring-up protocol plus per-core accounting
//! - [`Arena`] / [`Pool`]: bump and fixed-size allocators over any [`ChunkSource`]

pub mod arena;
pub mod error;
pub mod heap;
pub mod locale;
pub mod pool;
pub mod segment;

pub use arena::{Arena, ArenaConfig, CHUNK_ALIGN, ChunkSource, SystemChunks};
pub use error::{HeapError, Result};
pub use heap::ManagedHeap;
pub use locale::{Budget, DEFAULT_BASE_ADDRESS, DEFAULT_NAME, HeapBudget, HeapConfig, HeapSize, LocaleHeap};
pub use pool::{PREFETCH_DISTANCE, Pool, PoolConfig};
pub use segment::Segment;
