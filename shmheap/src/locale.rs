//! Locale-wide shared heap: creation, attachment and allocation.

use std::cell::Cell;
use std::error::Error as StdError;
use std::ptr::NonNull;

use tracing::{debug, info};

use crate::error::{HeapError, Result};
use crate::heap::ManagedHeap;
use crate::segment::{Segment, page_size};

/// Base address every core maps the locale heap at.
pub const DEFAULT_BASE_ADDRESS: usize = 0x4000_0000_0000;

/// Name of the locale heap object in the shm namespace.
pub const DEFAULT_NAME: &str = "/dsm_locale_heap";

/// How large the locale heap should be.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HeapSize {
    /// An exact byte count (rounded up to the page size).
    Bytes(usize),
    /// A fraction of the node's physical memory (rounded down to the page size).
    FractionOfNode(f64),
}

impl HeapSize {
    /// Resolves to a byte count on this node.
    pub fn resolve(self) -> Result<usize> {
        let page = page_size();
        match self {
            HeapSize::Bytes(0) => Err(HeapError::InvalidConfig("heap size must be non-zero".into())),
            HeapSize::Bytes(n) => Ok(n.next_multiple_of(page)),
            HeapSize::FractionOfNode(f) if !(f > 0.0 && f <= 1.0) => Err(HeapError::InvalidConfig(
                format!("heap fraction {f} is outside (0, 1]"),
            )),
            HeapSize::FractionOfNode(f) => {
                let bytes = (physical_memory()? as f64 * f) as usize;
                let bytes = bytes - bytes % page;
                if bytes == 0 {
                    return Err(HeapError::InvalidConfig(format!(
                        "heap fraction {f} of node memory is smaller than a page"
                    )));
                }
                Ok(bytes)
            }
        }
    }
}

/// Fractions of the locale heap set aside for downstream consumers.
///
/// The heap itself does not enforce these; they are carried here so the
/// global allocator and the shared message pool can size themselves.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeapBudget {
    /// Share given to the job-wide global heap.
    ///
    /// Default: 0.25
    pub global_heap: f64,
    /// Share given to the shared message pool.
    ///
    /// Default: 0.5
    pub shared_pool: f64,
}

impl Default for HeapBudget {
    fn default() -> Self {
        Self {
            global_heap: 0.25,
            shared_pool: 0.5,
        }
    }
}

/// Byte amounts derived from a [`HeapBudget`] and the actual heap size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub total: usize,
    pub global_heap: usize,
    pub shared_pool: usize,
    pub reserved: usize,
}

/// Configuration for the locale heap.
#[derive(Debug, Clone, PartialEq)]
pub struct HeapConfig {
    /// Name of the shared-memory object.
    ///
    /// Default: `/dsm_locale_heap`
    pub name: String,
    /// Fixed virtual base address.
    ///
    /// Default: `0x4000_0000_0000`
    pub base_address: usize,
    /// Size of the segment.
    ///
    /// Default: 1 GiB
    pub size: HeapSize,
    /// Subdivision fractions reported by [`LocaleHeap::budget`].
    pub budget: HeapBudget,
    /// Several locales live on one host (in-process fabric). Each locale then
    /// gets its own name suffix and its own base address range.
    ///
    /// Default: false
    pub colocated_locales: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_owned(),
            base_address: DEFAULT_BASE_ADDRESS,
            size: HeapSize::Bytes(1 << 30),
            budget: HeapBudget::default(),
            colocated_locales: false,
        }
    }
}

impl HeapConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Appends a job identifier so concurrent jobs on one node do not collide.
    pub fn with_job_id(mut self, job: &str) -> Self {
        self.name = format!("{}.{job}", self.name);
        self
    }

    pub fn with_base_address(mut self, base: usize) -> Self {
        self.base_address = base;
        self
    }

    pub fn with_size(mut self, size: HeapSize) -> Self {
        self.size = size;
        self
    }

    pub fn with_budget(mut self, budget: HeapBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_colocated_locales(mut self, colocated: bool) -> Self {
        self.colocated_locales = colocated;
        self
    }

    fn placement(&self, locale: usize, len: usize) -> (String, usize) {
        if self.colocated_locales {
            let stride = len.next_multiple_of(1 << 30);
            (
                format!("{}.{locale}", self.name),
                self.base_address + locale * stride,
            )
        } else {
            (self.name.clone(), self.base_address)
        }
    }
}

/// One core's handle on its locale's shared heap.
///
/// Not `Sync`: the running allocation total is per core.
pub struct LocaleHeap {
    segment: Segment,
    heap: ManagedHeap,
    budget: HeapBudget,
    locale_core: usize,
    allocated: Cell<usize>,
}

impl LocaleHeap {
    /// Brings up the locale heap on every core of a locale.
    ///
    /// Locale-core 0 creates and formats the segment; after the first
    /// agreement the other cores attach; after the second core 0 removes the
    /// name so the object disappears once every core has unmapped it.
    ///
    /// `agree` is a rendezvous over at least the cores of this locale: each
    /// core passes whether its own step succeeded and gets back whether every
    /// core's did. A core whose step failed still takes part, so its peers
    /// return [`HeapError::PeerFailed`] instead of waiting on it.
    pub fn activate<F, E>(config: &HeapConfig, locale: usize, locale_core: usize, mut agree: F) -> Result<Self>
    where
        F: FnMut(bool) -> std::result::Result<bool, E>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let len = config.size.resolve()?;
        let (name, base) = config.placement(locale, len);
        let mut rendezvous = |ok| agree(ok).map_err(|e| HeapError::Rendezvous(e.into()));

        let created = if locale_core == 0 {
            create(&name, base, len).map(Some)
        } else {
            Ok(None)
        };
        let agreed = rendezvous(created.is_ok());
        let created = created?;
        if !agreed? {
            if let Some((segment, _)) = &created {
                let _ = segment.unlink();
            }
            return Err(HeapError::PeerFailed { locale });
        }
        if created.is_some() {
            info!(locale, name = %name, bytes = len, "locale heap created");
        }

        let attached = match created {
            Some(pair) => Ok(pair),
            None => attach(&name, base),
        };
        let agreed = rendezvous(attached.is_ok());
        let (segment, heap) = attached?;
        if locale_core == 0 {
            segment.unlink()?;
        }
        if !agreed? {
            return Err(HeapError::PeerFailed { locale });
        }
        debug!(locale, locale_core, name = %name, "locale heap attached");

        Ok(Self {
            segment,
            heap,
            budget: config.budget,
            locale_core,
            allocated: Cell::new(0),
        })
    }

    /// Allocates `size` bytes with the heap's default 16-byte alignment.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        self.allocate_aligned(size, 16)
    }

    /// Allocates `size` bytes aligned to `align`.
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        if !align.is_power_of_two() {
            return Err(HeapError::InvalidConfig(format!("alignment {align} is not a power of two")));
        }
        match self.heap.allocate(size, align) {
            Some((ptr, used)) => {
                self.allocated.set(self.allocated.get() + used);
                Ok(ptr)
            }
            None => Err(HeapError::OutOfMemory {
                requested: size,
                free: self.heap.free_bytes(),
                allocated: self.allocated.get(),
            }),
        }
    }

    /// Returns memory obtained from this locale's heap.
    ///
    /// # Safety
    /// `ptr` must come from [`allocate`](Self::allocate) or
    /// [`allocate_aligned`](Self::allocate_aligned) on a handle of the same
    /// locale and must not be used afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        let used = unsafe { self.heap.deallocate(ptr) };
        self.allocated.set(self.allocated.get().saturating_sub(used));
    }

    /// Bytes this core currently holds.
    pub fn allocated(&self) -> usize {
        self.allocated.get()
    }

    /// Bytes free in the whole locale heap.
    pub fn free_bytes(&self) -> usize {
        self.heap.free_bytes()
    }

    pub fn base(&self) -> *mut u8 {
        self.segment.base()
    }

    pub fn len(&self) -> usize {
        self.segment.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segment.is_empty()
    }

    pub fn contains(&self, ptr: *const u8) -> bool {
        self.segment.contains(ptr)
    }

    pub fn locale_core(&self) -> usize {
        self.locale_core
    }

    /// Byte amounts for the downstream consumers of the heap.
    pub fn budget(&self) -> Budget {
        let total = self.len();
        let global_heap = (total as f64 * self.budget.global_heap) as usize;
        let shared_pool = (total as f64 * self.budget.shared_pool) as usize;
        Budget {
            total,
            global_heap,
            shared_pool,
            reserved: total.saturating_sub(global_heap + shared_pool),
        }
    }

    /// Releases this core's mapping.
    pub fn finish(self) -> Result<()> {
        if self.segment.is_creator() {
            self.segment.unlink()?;
        }
        debug!(locale_core = self.locale_core, allocated = self.allocated.get(), "locale heap released");
        Ok(())
    }
}

impl std::fmt::Debug for LocaleHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocaleHeap")
            .field("segment", &self.segment)
            .field("locale_core", &self.locale_core)
            .field("allocated", &self.allocated.get())
            .finish()
    }
}

fn create(name: &str, base: usize, len: usize) -> Result<(Segment, ManagedHeap)> {
    let segment = Segment::create(name, base, len)?;
    let ptr = segment.as_non_null();
    let heap = unsafe { ManagedHeap::format(ptr, segment.len())? };
    Ok((segment, heap))
}

fn attach(name: &str, base: usize) -> Result<(Segment, ManagedHeap)> {
    let segment = Segment::attach(name, base)?;
    let ptr = segment.as_non_null();
    let heap = unsafe { ManagedHeap::open(ptr, segment.len(), name)? };
    Ok((segment, heap))
}

fn physical_memory() -> Result<usize> {
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    if pages <= 0 {
        return Err(HeapError::Io(std::io::Error::last_os_error()));
    }
    Ok(pages as usize * page_size())
}
