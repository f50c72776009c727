//! Provider-neutral verbs types and the [`Verbs`] seam.
//!
//! The mesh only needs the reliable-connected subset of the verbs API:
//! device and port queries, protection domains, one completion queue, RC
//! queue pairs with the Reset -> Init -> Rtr -> Rts transitions, memory
//! registration, and posting/polling work requests.

use std::io;

use bitflags::bitflags;

bitflags! {
    /// Memory region and queue pair access permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        /// Enable local write access.
        const LOCAL_WRITE = 1;

        /// Enable remote write access.
        /// Requires `LOCAL_WRITE` to be set.
        const REMOTE_WRITE = 1 << 1;

        /// Enable remote read access.
        const REMOTE_READ = 1 << 2;

        /// Enable remote atomic operation access.
        /// Requires `LOCAL_WRITE` to be set.
        const REMOTE_ATOMIC = 1 << 3;
    }
}

impl AccessFlags {
    /// Local write plus every remote permission.
    pub const ALL: Self = Self::LOCAL_WRITE
        .union(Self::REMOTE_WRITE)
        .union(Self::REMOTE_READ)
        .union(Self::REMOTE_ATOMIC);
}

/// Path MTU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum Mtu {
    Mtu256 = 1,
    Mtu512 = 2,
    Mtu1024 = 3,
    Mtu2048 = 4,
    Mtu4096 = 5,
}

impl Mtu {
    /// Returns the MTU size in bytes.
    pub fn bytes(&self) -> usize {
        match self {
            Self::Mtu256 => 256,
            Self::Mtu512 => 512,
            Self::Mtu1024 => 1024,
            Self::Mtu2048 => 2048,
            Self::Mtu4096 => 4096,
        }
    }
}

/// Logical port state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Down,
    Init,
    Armed,
    Active,
}

/// One entry of the device list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    /// Node GUID, host byte order.
    pub guid: u64,
}

/// The device attributes the mesh uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAttr {
    /// Maximum outstanding RDMA read & atomic operations per QP.
    pub max_qp_rd_atom: u32,
    /// Maximum outstanding WRs on any work queue.
    pub max_qp_wr: u32,
    /// Maximum scatter/gather entries per WR.
    pub max_sge: u32,
    /// Number of physical ports.
    pub phys_port_cnt: u8,
}

/// The port attributes the mesh uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAttr {
    pub state: PortState,
    /// Base port LID.
    pub lid: u16,
    pub active_mtu: Mtu,
}

/// Queue pair capacities requested at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
}

/// QP state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QpState {
    Reset,
    Init,
    Rtr,
    Rts,
    Error,
}

/// A forward queue pair transition and the attributes it sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpTransition {
    /// RESET -> INIT.
    Init {
        port: u8,
        pkey_index: u16,
        access: AccessFlags,
    },
    /// INIT -> RTR (Ready to Receive).
    Rtr {
        path_mtu: Mtu,
        dest_qp_num: u32,
        rq_psn: u32,
        max_dest_rd_atomic: u8,
        min_rnr_timer: u8,
        dest_lid: u16,
        port: u8,
    },
    /// RTR -> RTS (Ready to Send).
    Rts {
        timeout: u8,
        retry_count: u8,
        rnr_retry: u8,
        sq_psn: u32,
        max_rd_atomic: u8,
    },
}

impl QpTransition {
    /// State the QP must be in before this transition.
    pub fn from_state(&self) -> QpState {
        match self {
            Self::Init { .. } => QpState::Reset,
            Self::Rtr { .. } => QpState::Init,
            Self::Rts { .. } => QpState::Rtr,
        }
    }

    /// State the QP is in afterwards.
    pub fn to_state(&self) -> QpState {
        match self {
            Self::Init { .. } => QpState::Init,
            Self::Rtr { .. } => QpState::Rtr,
            Self::Rts { .. } => QpState::Rts,
        }
    }
}

/// Scatter/gather element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// Send work request operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrOpcode {
    /// Two-sided send, consumes a receive WR at the peer.
    Send,
    RdmaWrite { remote_addr: u64, rkey: u32 },
    RdmaRead { remote_addr: u64, rkey: u32 },
    /// 8-byte fetch-and-add; the old value lands in the local SGE.
    FetchAdd { remote_addr: u64, rkey: u32, add: u64 },
    /// 8-byte compare-and-swap; the old value lands in the local SGE.
    CompareSwap {
        remote_addr: u64,
        rkey: u32,
        compare: u64,
        swap: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendWr {
    pub wr_id: u64,
    pub opcode: WrOpcode,
    pub sg_list: Vec<Sge>,
    /// Generate a completion on success. Failures always complete.
    pub signaled: bool,
}

impl SendWr {
    pub fn new(wr_id: u64, opcode: WrOpcode, sge: Sge) -> Self {
        Self {
            wr_id,
            opcode,
            sg_list: vec![sge],
            signaled: true,
        }
    }

    pub fn unsignaled(mut self) -> Self {
        self.signaled = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvWr {
    pub wr_id: u64,
    pub sg_list: Vec<Sge>,
}

/// Work completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    LocalLengthError,
    LocalProtectionError,
    RemoteAccessError,
    RemoteInvalidRequest,
    RnrRetryExceeded,
    WrFlushError,
    GeneralError,
}

impl WcStatus {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Operation a completion reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    FetchAdd,
    CompareSwap,
    Recv,
}

impl From<&WrOpcode> for WcOpcode {
    fn from(op: &WrOpcode) -> Self {
        match op {
            WrOpcode::Send => Self::Send,
            WrOpcode::RdmaWrite { .. } => Self::RdmaWrite,
            WrOpcode::RdmaRead { .. } => Self::RdmaRead,
            WrOpcode::FetchAdd { .. } => Self::FetchAdd,
            WrOpcode::CompareSwap { .. } => Self::CompareSwap,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    /// Local QP the work request was posted on.
    pub qp_num: u32,
    /// Bytes received (receive completions only).
    pub byte_len: u32,
}

/// Keys and range of a registered memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrKeys {
    pub addr: u64,
    pub len: usize,
    pub lkey: u32,
    pub rkey: u32,
}

/// The verbs provider.
///
/// Handles are owned by the caller; the provider never tears a queue pair
/// down behind the caller's back.
pub trait Verbs {
    type Context;
    type Pd;
    type Cq;
    type Qp;
    type Mr;

    fn devices(&self) -> io::Result<Vec<DeviceInfo>>;
    fn open_device(&self, device: &DeviceInfo) -> io::Result<Self::Context>;
    fn query_device(&self, ctx: &Self::Context) -> io::Result<DeviceAttr>;
    fn query_port(&self, ctx: &Self::Context, port: u8) -> io::Result<PortAttr>;
    fn alloc_pd(&self, ctx: &Self::Context) -> io::Result<Self::Pd>;
    fn create_cq(&self, ctx: &Self::Context, depth: u32) -> io::Result<Self::Cq>;

    /// Creates an RC queue pair whose send and receive queues both complete
    /// on `cq`. Only signaled sends generate successful completions.
    fn create_rc_qp(&self, pd: &Self::Pd, cq: &Self::Cq, caps: &QpCaps) -> io::Result<Self::Qp>;
    fn qp_num(&self, qp: &Self::Qp) -> u32;
    fn modify_qp(&self, qp: &mut Self::Qp, transition: &QpTransition) -> io::Result<()>;

    /// Registers `len` bytes at `addr`.
    ///
    /// # Safety
    /// The range must stay mapped and valid for reads and writes until the
    /// region is dropped; remote peers may access it at any time.
    unsafe fn register(&self, pd: &Self::Pd, addr: *mut u8, len: usize, access: AccessFlags) -> io::Result<Self::Mr>;
    fn mr_keys(&self, mr: &Self::Mr) -> MrKeys;

    fn post_send(&self, qp: &mut Self::Qp, wrs: &[SendWr]) -> io::Result<()>;
    fn post_recv(&self, qp: &mut Self::Qp, wrs: &[RecvWr]) -> io::Result<()>;

    /// Appends at most `max` completions to `out`; returns how many.
    fn poll_cq(&self, cq: &Self::Cq, max: usize, out: &mut Vec<WorkCompletion>) -> io::Result<usize>;
}
