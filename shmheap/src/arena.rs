//! Bump allocation over chunks obtained from a [`ChunkSource`].

use std::alloc::{Layout, alloc, dealloc};
use std::ptr::NonNull;

use tracing::trace;

use crate::error::{HeapError, Result};
use crate::locale::LocaleHeap;

/// Alignment of every chunk handed out by a source.
pub const CHUNK_ALIGN: usize = 64;

/// Where arenas get their chunks from.
pub trait ChunkSource {
    /// Allocates `size` bytes aligned to [`CHUNK_ALIGN`].
    fn allocate_chunk(&self, size: usize) -> Result<NonNull<u8>>;

    /// Returns a chunk.
    ///
    /// # Safety
    /// `ptr`/`size` must describe a chunk obtained from `allocate_chunk` on
    /// this source that has not been released yet.
    unsafe fn release_chunk(&self, ptr: NonNull<u8>, size: usize);
}

impl<T: ChunkSource + ?Sized> ChunkSource for &T {
    fn allocate_chunk(&self, size: usize) -> Result<NonNull<u8>> {
        (**self).allocate_chunk(size)
    }

    unsafe fn release_chunk(&self, ptr: NonNull<u8>, size: usize) {
        unsafe { (**self).release_chunk(ptr, size) }
    }
}

impl ChunkSource for LocaleHeap {
    fn allocate_chunk(&self, size: usize) -> Result<NonNull<u8>> {
        self.allocate_aligned(size, CHUNK_ALIGN)
    }

    unsafe fn release_chunk(&self, ptr: NonNull<u8>, _size: usize) {
        unsafe { self.deallocate(ptr) }
    }
}

/// Chunks from the process's global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemChunks;

impl ChunkSource for SystemChunks {
    fn allocate_chunk(&self, size: usize) -> Result<NonNull<u8>> {
        let layout = Layout::from_size_align(size.max(1), CHUNK_ALIGN)
            .map_err(|e| HeapError::InvalidConfig(e.to_string()))?;
        NonNull::new(unsafe { alloc(layout) }).ok_or(HeapError::OutOfMemory {
            requested: size,
            free: 0,
            allocated: 0,
        })
    }

    unsafe fn release_chunk(&self, ptr: NonNull<u8>, size: usize) {
        // Layout was validated when the chunk was allocated.
        let layout = unsafe { Layout::from_size_align_unchecked(size.max(1), CHUNK_ALIGN) };
        unsafe { dealloc(ptr.as_ptr(), layout) }
    }
}

/// Arena parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Every allocation is rounded up to, and aligned on, this many bytes.
    ///
    /// Default: 8
    pub align: usize,
    /// Minimum size of a freshly appended chunk.
    ///
    /// Default: 64 KiB
    pub chunk_size: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            align: 8,
            chunk_size: 64 * 1024,
        }
    }
}

impl ArenaConfig {
    pub fn with_align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

#[derive(Debug)]
struct Chunk {
    base: NonNull<u8>,
    size: usize,
    offset: usize,
}

/// Bump allocator. Objects are never freed individually; [`clear`](Arena::clear)
/// or dropping the arena releases every chunk at once.
pub struct Arena<S: ChunkSource> {
    source: S,
    config: ArenaConfig,
    chunks: Vec<Chunk>,
    allocated_bytes: usize,
}

impl<S: ChunkSource> Arena<S> {
    pub fn new(source: S, config: ArenaConfig) -> Result<Self> {
        if !config.align.is_power_of_two() {
            return Err(HeapError::InvalidConfig(format!(
                "arena alignment {} is not a power of two",
                config.align
            )));
        }
        Ok(Self {
            source,
            config,
            chunks: Vec::new(),
            allocated_bytes: 0,
        })
    }

    /// Hands out `size` bytes (rounded up to the arena alignment).
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
        let size = size
            .checked_next_multiple_of(self.config.align)
            .ok_or(self.too_large(size))?;
        let fits = self
            .chunks
            .last()
            .is_some_and(|c| c.size - c.offset >= size);
        if !fits {
            self.append_chunk(size)?;
        }
        let Some(chunk) = self.chunks.last_mut() else {
            return Err(HeapError::InvalidConfig("arena has no chunk".into()));
        };
        let p = unsafe { chunk.base.add(chunk.offset) };
        chunk.offset += size;
        Ok(p)
    }

    fn append_chunk(&mut self, min_size: usize) -> Result<()> {
        let align = self.config.align;
        let size = min_size
            .max(self.config.chunk_size)
            .checked_add(align)
            .ok_or(self.too_large(min_size))?;
        let base = self.source.allocate_chunk(size)?;
        let offset = (base.as_ptr() as usize).next_multiple_of(align) - base.as_ptr() as usize;
        self.chunks.push(Chunk { base, size, offset });
        self.allocated_bytes += size;
        trace!(size, chunks = self.chunks.len(), "arena chunk appended");
        Ok(())
    }

    fn too_large(&self, requested: usize) -> HeapError {
        HeapError::OutOfMemory {
            requested,
            free: 0,
            allocated: self.allocated_bytes,
        }
    }

    /// Releases every chunk.
    pub fn clear(&mut self) {
        for chunk in self.chunks.drain(..) {
            unsafe { self.source.release_chunk(chunk.base, chunk.size) };
        }
        self.allocated_bytes = 0;
    }

    /// Number of chunks currently held.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Bytes obtained from the source, chunk padding included.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }
}

impl<S: ChunkSource> Drop for Arena<S> {
    fn drop(&mut self) {
        self.clear();
    }
}
