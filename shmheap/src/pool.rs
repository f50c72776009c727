//! Fixed-size object pool on top of an [`Arena`].
//!
//! Freed objects are threaded onto [`PREFETCH_DISTANCE`] intrusive free
//! lists. Allocation and free both rotate through the lists, so consecutive
//! allocations come from different lists and the next head can be touched
//! ahead of use.

use std::ptr::NonNull;

use tracing::warn;

use crate::arena::{Arena, ArenaConfig, ChunkSource};
use crate::error::{HeapError, Result};

/// Number of parallel free lists.
pub const PREFETCH_DISTANCE: usize = 4;

/// Pool parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Object size; raised to at least pointer size.
    pub object_size: usize,
    /// Object alignment.
    ///
    /// Default: 8
    pub align: usize,
    /// Objects carved per arena chunk.
    ///
    /// Default: 64
    pub objects_per_chunk: usize,
    /// Soft cap on bytes drawn from the arena. Exceeding it logs a warning
    /// once; allocation still succeeds.
    ///
    /// Default: none
    pub max_pool_bytes: Option<usize>,
}

impl PoolConfig {
    pub fn new(object_size: usize) -> Self {
        Self {
            object_size,
            align: 8,
            objects_per_chunk: 64,
            max_pool_bytes: None,
        }
    }

    pub fn with_align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    pub fn with_objects_per_chunk(mut self, n: usize) -> Self {
        self.objects_per_chunk = n;
        self
    }

    pub fn with_max_pool_bytes(mut self, max: usize) -> Self {
        self.max_pool_bytes = Some(max);
        self
    }
}

#[repr(C)]
struct Link {
    next: Option<NonNull<Link>>,
}

/// Pool of equally sized objects.
pub struct Pool<S: ChunkSource> {
    arena: Arena<S>,
    object_size: usize,
    firsts: [Option<NonNull<Link>>; PREFETCH_DISTANCE],
    first_index: usize,
    allocated_objects: usize,
    fresh_objects: usize,
    max_pool_bytes: Option<usize>,
    cap_warned: bool,
}

impl<S: ChunkSource> Pool<S> {
    pub fn new(source: S, config: PoolConfig) -> Result<Self> {
        if config.objects_per_chunk == 0 {
            return Err(HeapError::InvalidConfig("pool needs at least one object per chunk".into()));
        }
        let object_size = config
            .object_size
            .max(size_of::<Link>())
            .checked_next_multiple_of(config.align.max(1));
        let chunk_size = object_size.and_then(|size| size.checked_mul(config.objects_per_chunk));
        let (Some(object_size), Some(chunk_size)) = (object_size, chunk_size) else {
            return Err(HeapError::InvalidConfig(format!(
                "{} objects of {} bytes do not fit in the address space",
                config.objects_per_chunk, config.object_size
            )));
        };
        let arena = Arena::new(
            source,
            ArenaConfig::default()
                .with_align(config.align.max(align_of::<Link>()))
                .with_chunk_size(chunk_size),
        )?;
        Ok(Self {
            arena,
            object_size,
            firsts: [None; PREFETCH_DISTANCE],
            first_index: 0,
            allocated_objects: 0,
            fresh_objects: 0,
            max_pool_bytes: config.max_pool_bytes,
            cap_warned: false,
        })
    }

    /// Takes one object, reusing a freed one when available.
    pub fn allocate(&mut self) -> Result<NonNull<u8>> {
        if self.firsts[self.first_index].is_none()
            && let Some(index) = self.firsts.iter().position(Option::is_some)
        {
            self.first_index = index;
        }

        let obj = match self.firsts[self.first_index] {
            Some(head) => {
                self.firsts[self.first_index] = unsafe { head.as_ref().next };
                self.first_index = (self.first_index + 1) % PREFETCH_DISTANCE;
                head.cast()
            }
            None => {
                let p = self.arena.allocate(self.object_size)?;
                self.fresh_objects += 1;
                self.check_cap();
                p
            }
        };
        self.allocated_objects += 1;
        Ok(obj)
    }

    /// Returns an object to the pool.
    ///
    /// # Safety
    /// `obj` must come from [`allocate`](Self::allocate) on this pool and
    /// must not be used afterwards.
    pub unsafe fn free(&mut self, obj: NonNull<u8>) {
        let link = obj.cast::<Link>();
        unsafe {
            link.write(Link {
                next: self.firsts[self.first_index],
            });
        }
        self.firsts[self.first_index] = Some(link);
        self.first_index = (self.first_index + 1) % PREFETCH_DISTANCE;
        self.allocated_objects -= 1;
    }

    /// Objects currently handed out.
    pub fn allocated_objects(&self) -> usize {
        self.allocated_objects
    }

    /// Objects ever carved from the arena.
    pub fn fresh_objects(&self) -> usize {
        self.fresh_objects
    }

    /// Effective object size after rounding.
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Bytes drawn from the chunk source.
    pub fn pool_bytes(&self) -> usize {
        self.arena.allocated_bytes()
    }

    fn check_cap(&mut self) {
        if let Some(max) = self.max_pool_bytes
            && !self.cap_warned
            && self.arena.allocated_bytes() > max
        {
            self.cap_warned = true;
            warn!(
                pool_bytes = self.arena.allocated_bytes(),
                max_pool_bytes = max,
                "shared pool size exceeded its cap"
            );
        }
    }

    pub(crate) fn cap_warned(&self) -> bool {
        self.cap_warned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::SystemChunks;
    use std::collections::HashSet;

    #[test]
    fn objects_are_at_least_pointer_sized() {
        let pool = Pool::new(SystemChunks, PoolConfig::new(1)).unwrap();
        assert!(pool.object_size() >= size_of::<usize>());
    }

    #[test]
    fn oversized_objects_are_rejected() {
        let config = PoolConfig::new(usize::MAX / 2).with_objects_per_chunk(4);
        assert!(matches!(Pool::new(SystemChunks, config), Err(HeapError::InvalidConfig(_))));
        assert!(Pool::new(SystemChunks, PoolConfig::new(usize::MAX - 1)).is_err());
    }

    #[test]
    fn reuse_after_free() {
        let mut pool = Pool::new(SystemChunks, PoolConfig::new(48)).unwrap();
        let objs: Vec<_> = (0..10).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.allocated_objects(), 10);
        assert_eq!(pool.fresh_objects(), 10);

        let freed: HashSet<_> = objs.iter().map(|p| p.as_ptr() as usize).collect();
        for p in objs {
            unsafe { pool.free(p) };
        }
        assert_eq!(pool.allocated_objects(), 0);

        for _ in 0..10 {
            let p = pool.allocate().unwrap();
            assert!(freed.contains(&(p.as_ptr() as usize)));
        }
        assert_eq!(pool.fresh_objects(), 10);
    }

    #[test]
    fn free_lists_rotate() {
        let mut pool = Pool::new(SystemChunks, PoolConfig::new(16)).unwrap();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        unsafe {
            pool.free(a);
            pool.free(b);
        }
        // a and b went onto different lists; both come back.
        let x = pool.allocate().unwrap();
        let y = pool.allocate().unwrap();
        let got: HashSet<_> = [x, y].iter().map(|p| p.as_ptr() as usize).collect();
        let want: HashSet<_> = [a, b].iter().map(|p| p.as_ptr() as usize).collect();
        assert_eq!(got, want);
        assert_eq!(pool.fresh_objects(), 2);
    }

    #[test]
    fn cap_warns_once_and_keeps_allocating() {
        let mut pool = Pool::new(
            SystemChunks,
            PoolConfig::new(64).with_objects_per_chunk(4).with_max_pool_bytes(512),
        )
        .unwrap();
        for _ in 0..32 {
            pool.allocate().unwrap();
        }
        assert!(pool.pool_bytes() > 512);
        assert!(pool.cap_warned());
        assert_eq!(pool.allocated_objects(), 32);
    }

    #[test]
    fn distinct_live_objects() {
        let mut pool = Pool::new(SystemChunks, PoolConfig::new(24).with_objects_per_chunk(3)).unwrap();
        let live: HashSet<_> = (0..100).map(|_| pool.allocate().unwrap().as_ptr() as usize).collect();
        assert_eq!(live.len(), 100);
    }
}
