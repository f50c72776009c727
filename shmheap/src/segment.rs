//! POSIX shared-memory segments mapped at a fixed virtual base.
//!
//! Every process of a locale maps the same named object at the same address,
//! so raw pointers into the segment mean the same thing on every core of the
//! locale. Cores that live in one process (the in-process fabric used by
//! tests) share a single mapping through a process-wide table keyed by base
//! address.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap, shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{HeapError, Result};

/// Mappings established by this process, keyed by base address.
static MAPPINGS: Mutex<BTreeMap<usize, Weak<Mapping>>> = parking_lot::const_mutex(BTreeMap::new());

struct Mapping {
    base: NonNull<u8>,
    len: usize,
}

// The mapping is plain shared memory; synchronization is the user's concern.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        let mut table = MAPPINGS.lock();
        unsafe {
            let _ = munmap(self.base.cast(), self.len);
        }
        let key = self.base.as_ptr() as usize;
        if table.get(&key).is_some_and(|w| w.strong_count() == 0) {
            table.remove(&key);
        }
    }
}

/// A named shared-memory object mapped at a fixed address.
pub struct Segment {
    mapping: Arc<Mapping>,
    name: CString,
    creator: bool,
}

impl Segment {
    /// Creates the named object, sizes it to `len` bytes and maps it at `base`.
    ///
    /// A stale object left behind by an earlier job under the same name is
    /// removed first. The new object is zero-filled.
    pub fn create(name: &str, base: usize, len: usize) -> Result<Self> {
        let name = object_name(name)?;
        let len = NonZeroUsize::new(len)
            .ok_or_else(|| HeapError::InvalidConfig("segment size must be non-zero".into()))?;
        check_page_aligned(base)?;

        remove_stale(&name)?;

        let fd = shm_open(
            name.as_c_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(io::Error::from)?;

        if let Err(e) = ftruncate(&fd, len.get() as i64) {
            let _ = shm_unlink(name.as_c_str());
            return Err(io::Error::from(e).into());
        }

        let mut table = MAPPINGS.lock();
        let mapping = match map_fixed(&fd, base, len) {
            Ok(m) => Arc::new(m),
            Err(e) => {
                let _ = shm_unlink(name.as_c_str());
                return Err(e);
            }
        };
        table.insert(base, Arc::downgrade(&mapping));
        drop(table);

        debug!(name = ?name, base = format_args!("{base:#x}"), len = len.get(), "created shared segment");
        Ok(Self {
            mapping,
            name,
            creator: true,
        })
    }

    /// Attaches to an object created by another core of the locale.
    ///
    /// The size is taken from the object itself. If this process already
    /// maps the object at `base`, the existing mapping is shared.
    pub fn attach(name: &str, base: usize) -> Result<Self> {
        let name = object_name(name)?;
        check_page_aligned(base)?;

        let fd = shm_open(name.as_c_str(), OFlag::O_RDWR, Mode::empty()).map_err(io::Error::from)?;
        let file = File::from(fd);
        let len = file.metadata()?.len() as usize;
        let len = NonZeroUsize::new(len)
            .ok_or_else(|| HeapError::InvalidConfig(format!("segment {name:?} is empty")))?;

        let mut table = MAPPINGS.lock();
        let mapping = match table.get(&base).and_then(Weak::upgrade) {
            Some(m) => m,
            None => {
                let m = Arc::new(map_fixed(&file, base, len)?);
                table.insert(base, Arc::downgrade(&m));
                m
            }
        };
        drop(table);

        if mapping.len != len.get() {
            return Err(HeapError::AddressInUse {
                base,
                len: mapping.len.max(len.get()),
            });
        }

        debug!(name = ?name, base = format_args!("{base:#x}"), len = len.get(), "attached shared segment");
        Ok(Self {
            mapping,
            name,
            creator: false,
        })
    }

    /// Removes the name from the OS namespace. Existing mappings stay valid.
    ///
    /// A name that is already gone is not an error.
    pub fn unlink(&self) -> Result<()> {
        match shm_unlink(self.name.as_c_str()) {
            Ok(()) | Err(Errno::ENOENT) => Ok(()),
            Err(e) => Err(io::Error::from(e).into()),
        }
    }

    /// Base address of the mapping.
    pub fn base(&self) -> *mut u8 {
        self.mapping.base.as_ptr()
    }

    pub fn as_non_null(&self) -> NonNull<u8> {
        self.mapping.base
    }

    /// Length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.mapping.len
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.len == 0
    }

    /// Whether this handle created the object.
    pub fn is_creator(&self) -> bool {
        self.creator
    }

    /// Whether `ptr` falls inside the mapping.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.base() as usize;
        let p = ptr as usize;
        p >= start && p < start + self.len()
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("base", &self.base())
            .field("len", &self.len())
            .field("creator", &self.creator)
            .finish()
    }
}

/// Removes a leftover object with this name, if any.
fn remove_stale(name: &CString) -> Result<()> {
    match shm_unlink(name.as_c_str()) {
        Ok(()) => {
            debug!(name = ?name, "removed stale shared segment");
            Ok(())
        }
        Err(Errno::ENOENT) => Ok(()),
        Err(e) => Err(io::Error::from(e).into()),
    }
}

fn map_fixed<F: std::os::fd::AsFd>(fd: F, base: usize, len: NonZeroUsize) -> Result<Mapping> {
    let addr = NonZeroUsize::new(base)
        .ok_or_else(|| HeapError::InvalidConfig("segment base must be non-zero".into()))?;
    let ptr = unsafe {
        mmap(
            Some(addr),
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED | MapFlags::MAP_FIXED_NOREPLACE,
            fd,
            0,
        )
    };
    let ptr = match ptr {
        Ok(p) => p,
        Err(Errno::EEXIST) => {
            return Err(HeapError::AddressInUse {
                base,
                len: len.get(),
            });
        }
        Err(e) => return Err(io::Error::from(e).into()),
    };

    // Kernels without MAP_FIXED_NOREPLACE treat the address as a hint.
    let actual = ptr.as_ptr() as usize;
    if actual != base {
        unsafe {
            let _ = munmap(ptr, len.get());
        }
        return Err(HeapError::MapMismatch {
            expected: base,
            actual,
        });
    }

    Ok(Mapping {
        base: ptr.cast(),
        len: len.get(),
    })
}

fn object_name(name: &str) -> Result<CString> {
    let name = if name.starts_with('/') {
        name.to_owned()
    } else {
        format!("/{name}")
    };
    CString::new(name).map_err(|e| HeapError::InvalidConfig(e.to_string()))
}

fn check_page_aligned(base: usize) -> Result<()> {
    let page = page_size();
    if base == 0 || !base.is_multiple_of(page) {
        return Err(HeapError::InvalidConfig(format!(
            "segment base {base:#x} is not page aligned"
        )));
    }
    Ok(())
}

pub(crate) fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 { 4096 } else { sz as usize }
}
