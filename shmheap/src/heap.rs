//! First-fit heap stored inside a shared segment.
//!
//! Layout (all offsets relative to the segment base):
//!
//! ```text
//! 0                64
//! +----------------+--------------------------------------------------+
//! | HeapHeader     | blocks ...                                       |
//! +----------------+--------------------------------------------------+
//! ```
//!
//! Every block starts with a 16-byte header `{size, link}`. Free blocks are
//! kept in an address-ordered singly linked list through `link`. For an
//! allocated block the 8 bytes just before the user pointer hold the block
//! offset, which lets aligned allocations place the user pointer anywhere
//! inside the block.
//!
//! The header carries a spinlock so processes of one locale can allocate
//! and free concurrently.

use std::hint::spin_loop;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{HeapError, Result};

const MAGIC: u64 = 0x6873_6d68_6561_7031;
const HEADER_SIZE: usize = 64;
const BLOCK_HEADER: usize = 16;
const MIN_BLOCK: usize = 32;
const GRANULE: usize = 16;

/// Offset value meaning "no block".
const NIL: u64 = 0;

#[repr(C)]
struct HeapHeader {
    magic: u64,
    lock: AtomicU32,
    _pad: u32,
    size: u64,
    free_head: u64,
    free_bytes: u64,
    _reserved: [u64; 3],
}

const _: () = assert!(std::mem::size_of::<HeapHeader>() == HEADER_SIZE);

#[repr(C)]
struct BlockHeader {
    size: u64,
    link: u64,
}

/// View of a heap living in shared memory. Does not own the memory.
pub struct ManagedHeap {
    base: NonNull<u8>,
    len: usize,
}

// All mutation goes through the in-segment spinlock.
unsafe impl Send for ManagedHeap {}
unsafe impl Sync for ManagedHeap {}

struct LockGuard<'a> {
    lock: &'a AtomicU32,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.store(0, Ordering::Release);
    }
}

impl ManagedHeap {
    /// Writes a fresh heap header covering `len` bytes at `base`.
    ///
    /// # Safety
    /// `base..base+len` must be writable, 16-byte aligned, and not in use by
    /// any other heap view while formatting.
    pub unsafe fn format(base: NonNull<u8>, len: usize) -> Result<Self> {
        if len < HEADER_SIZE + MIN_BLOCK {
            return Err(HeapError::InvalidConfig(format!(
                "heap of {len} bytes is too small"
            )));
        }
        let heap = Self { base, len };
        let usable = (len - HEADER_SIZE) & !(GRANULE - 1);
        unsafe {
            let header = heap.header_ptr();
            header.write(HeapHeader {
                magic: 0,
                lock: AtomicU32::new(0),
                _pad: 0,
                size: len as u64,
                free_head: HEADER_SIZE as u64,
                free_bytes: usable as u64,
                _reserved: [0; 3],
            });
            heap.block(HEADER_SIZE as u64).write(BlockHeader {
                size: usable as u64,
                link: NIL,
            });
            std::sync::atomic::fence(Ordering::Release);
            (*header).magic = MAGIC;
        }
        Ok(heap)
    }

    /// Opens a heap previously formatted by another core.
    ///
    /// # Safety
    /// `base..base+len` must be a live mapping of a segment.
    pub unsafe fn open(base: NonNull<u8>, len: usize, name: &str) -> Result<Self> {
        let heap = Self { base, len };
        let header = unsafe { &*heap.header_ptr() };
        if header.magic != MAGIC || header.size != len as u64 {
            return Err(HeapError::BadMagic(name.to_owned()));
        }
        Ok(heap)
    }

    /// Allocates `size` bytes aligned to `align` (a power of two).
    ///
    /// Returns the user pointer and the number of heap bytes the block
    /// consumes, or `None` if no free block is large enough.
    pub fn allocate(&self, size: usize, align: usize) -> Option<(NonNull<u8>, usize)> {
        debug_assert!(align.is_power_of_two());
        let align = align.max(GRANULE);
        let need = size.max(1).checked_next_multiple_of(GRANULE)?;
        if need > self.len {
            return None;
        }
        let base = self.base.as_ptr() as usize;

        let _guard = self.lock();
        unsafe {
            let header = self.header_ptr();
            let mut prev = NIL;
            let mut cur = (*header).free_head;
            while cur != NIL {
                let blk = &mut *self.block(cur);
                let blk_size = blk.size as usize;
                let start = cur as usize;
                let fit = (base + start + BLOCK_HEADER)
                    .checked_next_multiple_of(align)
                    .and_then(|aligned| {
                        let user = aligned - base;
                        Some((user, user.checked_add(need)?))
                    })
                    .filter(|&(_, end)| end <= start + blk_size);
                if let Some((user, end)) = fit {
                    let mut used = end - start;
                    let rest = blk_size - used;
                    let next = blk.link;
                    let replacement = if rest >= MIN_BLOCK {
                        let split = (start + used) as u64;
                        self.block(split).write(BlockHeader {
                            size: rest as u64,
                            link: next,
                        });
                        split
                    } else {
                        used = blk_size;
                        next
                    };
                    if prev == NIL {
                        (*header).free_head = replacement;
                    } else {
                        (*self.block(prev)).link = replacement;
                    }
                    blk.size = used as u64;
                    self.word(user - 8).write(cur);
                    (*header).free_bytes -= used as u64;
                    let ptr = NonNull::new_unchecked(self.base.as_ptr().add(user));
                    return Some((ptr, used));
                }
                prev = cur;
                cur = blk.link;
            }
        }
        None
    }

    /// Returns a block to the heap and reports how many bytes it held.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on a
    /// view of the same heap and not freed since.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) -> usize {
        let user = ptr.as_ptr() as usize - self.base.as_ptr() as usize;
        let _guard = self.lock();
        unsafe {
            let header = self.header_ptr();
            let off = self.word(user - 8).read();
            let size = (*self.block(off)).size;
            (*header).free_bytes += size;

            let mut prev = NIL;
            let mut next = (*header).free_head;
            while next != NIL && next < off {
                prev = next;
                next = (*self.block(next)).link;
            }

            let blk = &mut *self.block(off);
            blk.link = next;
            if next != NIL && off + blk.size == next {
                let nb = &*self.block(next);
                blk.size += nb.size;
                blk.link = nb.link;
            }

            if prev == NIL {
                (*header).free_head = off;
            } else {
                let pb = &mut *self.block(prev);
                if prev + pb.size == off {
                    pb.size += blk.size;
                    pb.link = blk.link;
                } else {
                    pb.link = off;
                }
            }
            size as usize
        }
    }

    /// Bytes currently on the free list (including block headers).
    pub fn free_bytes(&self) -> usize {
        let _guard = self.lock();
        unsafe { (*self.header_ptr()).free_bytes as usize }
    }

    /// Size of the largest free block.
    pub fn largest_free_block(&self) -> usize {
        let _guard = self.lock();
        let mut largest = 0;
        unsafe {
            let mut cur = (*self.header_ptr()).free_head;
            while cur != NIL {
                let blk = &*self.block(cur);
                largest = largest.max(blk.size as usize);
                cur = blk.link;
            }
        }
        largest
    }

    /// Total bytes covered by the heap, header included.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn lock(&self) -> LockGuard<'_> {
        let lock = unsafe { &(*self.header_ptr()).lock };
        while lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while lock.load(Ordering::Relaxed) != 0 {
                spin_loop();
            }
        }
        LockGuard { lock }
    }

    fn header_ptr(&self) -> *mut HeapHeader {
        self.base.as_ptr().cast()
    }

    unsafe fn block(&self, off: u64) -> *mut BlockHeader {
        debug_assert!((off as usize) + BLOCK_HEADER <= self.len);
        unsafe { self.base.as_ptr().add(off as usize).cast() }
    }

    unsafe fn word(&self, off: usize) -> *mut u64 {
        unsafe { self.base.as_ptr().add(off).cast() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{Layout, alloc_zeroed, dealloc};

    struct Backing {
        ptr: NonNull<u8>,
        layout: Layout,
    }

    impl Backing {
        fn new(len: usize) -> Self {
            let layout = Layout::from_size_align(len, 4096).unwrap();
            let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).unwrap();
            Self { ptr, layout }
        }
    }

    impl Drop for Backing {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }

    #[test]
    fn huge_requests_are_refused() {
        let mem = Backing::new(1 << 16);
        let heap = unsafe { ManagedHeap::format(mem.ptr, 1 << 16) }.unwrap();
        let initial = heap.free_bytes();
        assert!(heap.allocate(usize::MAX - 3, 8).is_none());
        assert!(heap.allocate(usize::MAX, 16).is_none());
        assert!(heap.allocate(usize::MAX - (1 << 16), 8).is_none());
        assert!(heap.allocate(64, 1 << 62).is_none());
        assert_eq!(heap.free_bytes(), initial);

        // The heap is still usable afterwards.
        let (p, used) = heap.allocate(64, 8).unwrap();
        assert_eq!(heap.free_bytes(), initial - used);
        unsafe { heap.deallocate(p) };
    }

    #[test]
    fn allocate_and_free_restores_free_bytes() {
        let mem = Backing::new(1 << 16);
        let heap = unsafe { ManagedHeap::format(mem.ptr, 1 << 16) }.unwrap();
        let initial = heap.free_bytes();

        let (a, sa) = heap.allocate(100, 8).unwrap();
        let (b, sb) = heap.allocate(1000, 8).unwrap();
        let (c, sc) = heap.allocate(10, 8).unwrap();
        assert_eq!(heap.free_bytes(), initial - sa - sb - sc);

        unsafe {
            assert_eq!(heap.deallocate(b), sb);
            assert_eq!(heap.deallocate(a), sa);
            assert_eq!(heap.deallocate(c), sc);
        }
        assert_eq!(heap.free_bytes(), initial);
        assert_eq!(heap.largest_free_block(), initial);
    }

    #[test]
    fn aligned_allocation() {
        let mem = Backing::new(1 << 16);
        let heap = unsafe { ManagedHeap::format(mem.ptr, 1 << 16) }.unwrap();
        for align in [16, 64, 256, 4096] {
            let (p, _) = heap.allocate(24, align).unwrap();
            assert_eq!(p.as_ptr() as usize % align, 0);
        }
    }

    #[test]
    fn exhaustion_returns_none() {
        let mem = Backing::new(4096);
        let heap = unsafe { ManagedHeap::format(mem.ptr, 4096) }.unwrap();
        assert!(heap.allocate(8192, 8).is_none());
        let (p, _) = heap.allocate(2048, 8).unwrap();
        assert!(heap.allocate(2048, 8).is_none());
        unsafe { heap.deallocate(p) };
        assert!(heap.allocate(2048, 8).is_some());
    }

    #[test]
    fn open_checks_magic() {
        let mem = Backing::new(4096);
        assert!(matches!(
            unsafe { ManagedHeap::open(mem.ptr, 4096, "blank") },
            Err(HeapError::BadMagic(_))
        ));
        let _ = unsafe { ManagedHeap::format(mem.ptr, 4096) }.unwrap();
        assert!(unsafe { ManagedHeap::open(mem.ptr, 4096, "formatted") }.is_ok());
    }

    #[test]
    fn concurrent_views_do_not_overlap() {
        let mem = Backing::new(1 << 20);
        let heap = unsafe { ManagedHeap::format(mem.ptr, 1 << 20) }.unwrap();
        let base = mem.ptr.as_ptr() as usize;

        let ranges: Vec<(usize, usize)> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let view = unsafe { ManagedHeap::open(NonNull::new(base as *mut u8).unwrap(), 1 << 20, "t") }
                        .unwrap();
                    s.spawn(move || {
                        (0..64)
                            .map(|i| {
                                let size = 16 + i * 8;
                                let (p, _) = view.allocate(size, 8).unwrap();
                                (p.as_ptr() as usize, size)
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });
        drop(heap);

        let mut sorted = ranges;
        sorted.sort();
        for w in sorted.windows(2) {
            assert!(w[0].0 + w[0].1 <= w[1].0);
        }
    }
}
