//! Registered memory every core can address remotely without a round trip.
//!
//! A pinned region is registered once per core; the `(base, rkey)` pair of
//! every core is all-gathered, so translating a local address into the
//! equivalent address on any peer is arithmetic. Addresses passed to the
//! work-request builders are always expressed in this core's region and
//! mapped to the same offset in the peer's.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use amsg::{Collectives, Core};
use nix::errno::Errno;
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};
use shmheap::LocaleHeap;
use tracing::debug;

use crate::error::{Error, Result};
use crate::mesh::Mesh;
use crate::verbs::{MrKeys, SendWr, Sge, Verbs, WrOpcode};

/// Where the anonymous mapping goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// At this address on every core; fails if anything is mapped there.
    Fixed(usize),
    /// Wherever the kernel puts it.
    Anywhere,
}

struct AnonMapping {
    base: NonNull<c_void>,
    len: usize,
}

impl AnonMapping {
    fn new(len: usize, placement: Placement) -> Result<Self> {
        let length = NonZeroUsize::new(len).ok_or_else(|| Error::Pinned("region length must be non-zero".into()))?;
        let mut flags = MapFlags::MAP_SHARED | MapFlags::MAP_ANONYMOUS;
        let addr = match placement {
            Placement::Fixed(base) => {
                flags |= MapFlags::MAP_FIXED_NOREPLACE;
                Some(NonZeroUsize::new(base).ok_or_else(|| Error::Pinned("fixed base must be non-zero".into()))?)
            }
            Placement::Anywhere => None,
        };
        let ptr = match unsafe { mmap_anonymous(addr, length, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE, flags) } {
            Ok(p) => p,
            Err(Errno::EEXIST) => {
                return Err(Error::Pinned(format!("{:#x}+{len:#x} is already mapped", addr.map_or(0, |a| a.get()))));
            }
            Err(e) => return Err(Error::Verbs(e.into())),
        };
        if let Placement::Fixed(base) = placement
            && ptr.as_ptr() as usize != base
        {
            let actual = ptr.as_ptr() as usize;
            unsafe {
                let _ = munmap(ptr, len);
            }
            return Err(Error::Pinned(format!("mapped at {actual:#x}, expected {base:#x}")));
        }
        Ok(Self { base: ptr, len })
    }
}

impl Drop for AnonMapping {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.base, self.len);
        }
    }
}

/// Remote coordinates for one access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAddr {
    pub addr: u64,
    pub rkey: u32,
    /// Key of the local side of the transfer.
    pub lkey: u32,
}

#[derive(Debug, Clone, Copy)]
struct Peer {
    base: u64,
    rkey: u32,
}

/// One core's registered region plus every peer's `(base, rkey)`.
pub struct PinnedRegion<V: Verbs> {
    // Deregister before unmapping.
    mr: V::Mr,
    _mapping: Option<AnonMapping>,
    keys: MrKeys,
    peers: Vec<Peer>,
}

impl<V: Verbs> PinnedRegion<V> {
    /// Maps `len` bytes of anonymous shared memory, registers them and
    /// exchanges keys. Collective.
    pub fn new<C: Collectives + ?Sized>(
        mesh: &Mesh<V>,
        comm: &mut C,
        len: usize,
        placement: Placement,
    ) -> Result<Self> {
        let mapping = AnonMapping::new(len, placement)?;
        let mr = unsafe { mesh.register(mapping.base.as_ptr().cast(), mapping.len)? };
        Self::exchange(mesh, comm, mr, Some(mapping))
    }

    /// Registers the locale heap's segment and exchanges keys. Collective.
    ///
    /// # Safety
    /// `heap` must outlive the returned region.
    pub unsafe fn from_heap<C: Collectives + ?Sized>(mesh: &Mesh<V>, comm: &mut C, heap: &LocaleHeap) -> Result<Self> {
        let mr = unsafe { mesh.register(heap.base(), heap.len())? };
        Self::exchange(mesh, comm, mr, None)
    }

    fn exchange<C: Collectives + ?Sized>(
        mesh: &Mesh<V>,
        comm: &mut C,
        mr: V::Mr,
        mapping: Option<AnonMapping>,
    ) -> Result<Self> {
        let keys = mesh.mr_keys(&mr);
        let mut mine = [0u8; 12];
        mine[..8].copy_from_slice(&keys.addr.to_le_bytes());
        mine[8..].copy_from_slice(&keys.rkey.to_le_bytes());
        let peers = comm
            .all_gather(&mine)?
            .iter()
            .enumerate()
            .map(|(core, bytes)| {
                let bytes: [u8; 12] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Bootstrap(format!("core {core} sent a {}-byte region key", bytes.len())))?;
                let [b0, b1, b2, b3, b4, b5, b6, b7, k0, k1, k2, k3] = bytes;
                Ok(Peer {
                    base: u64::from_le_bytes([b0, b1, b2, b3, b4, b5, b6, b7]),
                    rkey: u32::from_le_bytes([k0, k1, k2, k3]),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(
            core = comm.mycore(),
            base = format_args!("{:#x}", keys.addr),
            len = keys.len,
            lkey = keys.lkey,
            rkey = keys.rkey,
            "pinned region registered"
        );
        Ok(Self {
            mr,
            _mapping: mapping,
            keys,
            peers,
        })
    }

    fn offset_of(&self, ptr: *const u8, len: usize) -> Result<usize> {
        let addr = ptr as usize;
        let base = self.keys.addr as usize;
        match addr.checked_sub(base) {
            Some(off) if off.checked_add(len).is_some_and(|end| end <= self.keys.len) => Ok(off),
            _ => Err(Error::OutOfRange { addr, len }),
        }
    }

    /// Coordinates of the `len` bytes at `ptr` (in this core's region) on `core`.
    pub fn translate(&self, core: Core, ptr: *const u8, len: usize) -> Result<RemoteAddr> {
        let off = self.offset_of(ptr, len)?;
        let peer = self.peers.get(core).ok_or(Error::InvalidCore {
            core,
            cores: self.peers.len(),
        })?;
        Ok(RemoteAddr {
            addr: peer.base + off as u64,
            rkey: peer.rkey,
            lkey: self.keys.lkey,
        })
    }

    fn sge(&self, ptr: *const u8, len: u32) -> Result<Sge> {
        self.offset_of(ptr, len as usize)?;
        Ok(Sge {
            addr: ptr as u64,
            length: len,
            lkey: self.keys.lkey,
        })
    }

    /// Writes `len` bytes from `src` to the peer's copy of `dst`.
    pub fn write_wr(&self, wr_id: u64, core: Core, src: *const u8, dst: *const u8, len: u32) -> Result<SendWr> {
        let remote = self.translate(core, dst, len as usize)?;
        let opcode = WrOpcode::RdmaWrite {
            remote_addr: remote.addr,
            rkey: remote.rkey,
        };
        Ok(SendWr::new(wr_id, opcode, self.sge(src, len)?))
    }

    /// Reads `len` bytes of the peer's copy of `src` into `dst`.
    pub fn read_wr(&self, wr_id: u64, core: Core, dst: *mut u8, src: *const u8, len: u32) -> Result<SendWr> {
        let remote = self.translate(core, src, len as usize)?;
        let opcode = WrOpcode::RdmaRead {
            remote_addr: remote.addr,
            rkey: remote.rkey,
        };
        Ok(SendWr::new(wr_id, opcode, self.sge(dst, len)?))
    }

    /// Adds `add` to the peer's copy of the word at `target`; the old value
    /// lands in `result`.
    pub fn fetch_add_wr(&self, wr_id: u64, core: Core, result: *mut u64, target: *const u64, add: u64) -> Result<SendWr> {
        let remote = self.translate(core, target.cast::<u8>(), 8)?;
        let opcode = WrOpcode::FetchAdd {
            remote_addr: remote.addr,
            rkey: remote.rkey,
            add,
        };
        Ok(SendWr::new(wr_id, opcode, self.sge(result.cast::<u8>().cast_const(), 8)?))
    }

    pub fn compare_swap_wr(
        &self,
        wr_id: u64,
        core: Core,
        result: *mut u64,
        target: *const u64,
        compare: u64,
        swap: u64,
    ) -> Result<SendWr> {
        let remote = self.translate(core, target.cast::<u8>(), 8)?;
        let opcode = WrOpcode::CompareSwap {
            remote_addr: remote.addr,
            rkey: remote.rkey,
            compare,
            swap,
        };
        Ok(SendWr::new(wr_id, opcode, self.sge(result.cast::<u8>().cast_const(), 8)?))
    }

    pub fn base(&self) -> *mut u8 {
        self.keys.addr as *mut u8
    }

    pub fn len(&self) -> usize {
        self.keys.len
    }

    pub fn is_empty(&self) -> bool {
        self.keys.len == 0
    }

    pub fn keys(&self) -> MrKeys {
        self.keys
    }

    /// Base address of `core`'s region.
    pub fn remote_base(&self, core: Core) -> Option<u64> {
        self.peers.get(core).map(|p| p.base)
    }

    pub fn mr(&self) -> &V::Mr {
        &self.mr
    }
}
