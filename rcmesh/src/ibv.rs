//! Hardware provider over libibverbs.
//!
//! Handles own their verbs objects and release them on drop; the mesh and
//! the pinned regions drop them in dependency order (MRs and QPs before the
//! CQ and PD, those before the device context). Posting and polling go
//! through the provider's context ops, the same entry points the inline
//! `ibv_post_send`/`ibv_poll_cq` wrappers in `verbs.h` use.

use std::ffi::{CStr, c_int, c_void};
use std::io;
use std::ptr::{self, NonNull};

use ibverbs_sys as sys;
use ibverbs_sys::{ibv_port_state, ibv_qp_attr_mask, ibv_qp_state, ibv_qp_type, ibv_send_flags, ibv_wc_opcode, ibv_wc_status, ibv_wr_opcode};
use tracing::debug;

use crate::verbs::{
    AccessFlags, DeviceAttr, DeviceInfo, MrKeys, Mtu, PortAttr, PortState, QpCaps, QpTransition, RecvWr, SendWr,
    Verbs, WcOpcode, WcStatus, WorkCompletion, WrOpcode,
};

fn check(rc: c_int) -> io::Result<()> {
    match rc {
        0 => Ok(()),
        rc if rc > 0 => Err(io::Error::from_raw_os_error(rc)),
        _ => Err(io::Error::last_os_error()),
    }
}

fn missing_op(op: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, format!("provider does not implement {op}"))
}

/// The device list; freed on drop.
struct DeviceList {
    list: NonNull<*mut sys::ibv_device>,
    len: usize,
}

impl DeviceList {
    fn get() -> io::Result<Self> {
        let mut len: c_int = 0;
        let list = unsafe { sys::ibv_get_device_list(&mut len) };
        let list = NonNull::new(list).ok_or_else(io::Error::last_os_error)?;
        Ok(Self {
            list,
            len: len.max(0) as usize,
        })
    }

    fn iter(&self) -> impl Iterator<Item = *mut sys::ibv_device> + '_ {
        (0..self.len).map(|i| unsafe { *self.list.as_ptr().add(i) })
    }
}

impl Drop for DeviceList {
    fn drop(&mut self) {
        unsafe { sys::ibv_free_device_list(self.list.as_ptr()) };
    }
}

fn device_info(device: *mut sys::ibv_device) -> DeviceInfo {
    let name = unsafe { CStr::from_ptr(sys::ibv_get_device_name(device)) };
    DeviceInfo {
        name: name.to_string_lossy().into_owned(),
        guid: u64::from_be(unsafe { sys::ibv_get_device_guid(device) }),
    }
}

/// Provider for the RDMA devices of this host.
#[derive(Debug, Default, Clone, Copy)]
pub struct IbVerbs;

pub struct IbContext {
    ctx: NonNull<sys::ibv_context>,
}

impl Drop for IbContext {
    fn drop(&mut self) {
        unsafe { sys::ibv_close_device(self.ctx.as_ptr()) };
    }
}

pub struct IbPd {
    pd: NonNull<sys::ibv_pd>,
}

impl Drop for IbPd {
    fn drop(&mut self) {
        unsafe { sys::ibv_dealloc_pd(self.pd.as_ptr()) };
    }
}

pub struct IbCq {
    cq: NonNull<sys::ibv_cq>,
}

impl Drop for IbCq {
    fn drop(&mut self) {
        unsafe { sys::ibv_destroy_cq(self.cq.as_ptr()) };
    }
}

pub struct IbQp {
    qp: NonNull<sys::ibv_qp>,
}

impl Drop for IbQp {
    fn drop(&mut self) {
        unsafe { sys::ibv_destroy_qp(self.qp.as_ptr()) };
    }
}

/// Deregistered on drop; the keys stop working at that point.
pub struct IbMr {
    mr: NonNull<sys::ibv_mr>,
}

impl Drop for IbMr {
    fn drop(&mut self) {
        unsafe { sys::ibv_dereg_mr(self.mr.as_ptr()) };
    }
}

fn port_state(raw: ibv_port_state::Type) -> PortState {
    match raw {
        ibv_port_state::IBV_PORT_ACTIVE => PortState::Active,
        ibv_port_state::IBV_PORT_ARMED => PortState::Armed,
        ibv_port_state::IBV_PORT_INIT => PortState::Init,
        _ => PortState::Down,
    }
}

fn mtu(raw: sys::ibv_mtu) -> Mtu {
    match raw {
        sys::IBV_MTU_256 => Mtu::Mtu256,
        sys::IBV_MTU_512 => Mtu::Mtu512,
        sys::IBV_MTU_1024 => Mtu::Mtu1024,
        sys::IBV_MTU_2048 => Mtu::Mtu2048,
        _ => Mtu::Mtu4096,
    }
}

fn wc_status(raw: ibv_wc_status::Type) -> WcStatus {
    match raw {
        ibv_wc_status::IBV_WC_SUCCESS => WcStatus::Success,
        ibv_wc_status::IBV_WC_LOC_LEN_ERR => WcStatus::LocalLengthError,
        ibv_wc_status::IBV_WC_LOC_PROT_ERR => WcStatus::LocalProtectionError,
        ibv_wc_status::IBV_WC_REM_ACCESS_ERR => WcStatus::RemoteAccessError,
        ibv_wc_status::IBV_WC_REM_INV_REQ_ERR => WcStatus::RemoteInvalidRequest,
        ibv_wc_status::IBV_WC_RNR_RETRY_EXC_ERR => WcStatus::RnrRetryExceeded,
        ibv_wc_status::IBV_WC_WR_FLUSH_ERR => WcStatus::WrFlushError,
        _ => WcStatus::GeneralError,
    }
}

// Only meaningful for successful completions.
fn wc_opcode(raw: ibv_wc_opcode::Type) -> WcOpcode {
    match raw {
        ibv_wc_opcode::IBV_WC_RDMA_WRITE => WcOpcode::RdmaWrite,
        ibv_wc_opcode::IBV_WC_RDMA_READ => WcOpcode::RdmaRead,
        ibv_wc_opcode::IBV_WC_FETCH_ADD => WcOpcode::FetchAdd,
        ibv_wc_opcode::IBV_WC_COMP_SWAP => WcOpcode::CompareSwap,
        ibv_wc_opcode::IBV_WC_RECV => WcOpcode::Recv,
        _ => WcOpcode::Send,
    }
}

fn sge_list(sges: &[crate::verbs::Sge]) -> Vec<sys::ibv_sge> {
    sges.iter()
        .map(|s| sys::ibv_sge {
            addr: s.addr,
            length: s.length,
            lkey: s.lkey,
        })
        .collect()
}

impl Verbs for IbVerbs {
    type Context = IbContext;
    type Pd = IbPd;
    type Cq = IbCq;
    type Qp = IbQp;
    type Mr = IbMr;

    fn devices(&self) -> io::Result<Vec<DeviceInfo>> {
        Ok(DeviceList::get()?.iter().map(device_info).collect())
    }

    fn open_device(&self, device: &DeviceInfo) -> io::Result<IbContext> {
        let list = DeviceList::get()?;
        let found = list
            .iter()
            .find(|&d| device_info(d).name == device.name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no device {}", device.name)))?;
        let ctx = unsafe { sys::ibv_open_device(found) };
        let ctx = NonNull::new(ctx).ok_or_else(io::Error::last_os_error)?;
        debug!(device = %device.name, guid = format_args!("{:#018x}", device.guid), "device opened");
        Ok(IbContext { ctx })
    }

    fn query_device(&self, ctx: &IbContext) -> io::Result<DeviceAttr> {
        let mut attr: sys::ibv_device_attr = unsafe { std::mem::zeroed() };
        check(unsafe { sys::ibv_query_device(ctx.ctx.as_ptr(), &mut attr) })?;
        Ok(DeviceAttr {
            max_qp_rd_atom: attr.max_qp_rd_atom.max(0) as u32,
            max_qp_wr: attr.max_qp_wr.max(0) as u32,
            max_sge: attr.max_sge.max(0) as u32,
            phys_port_cnt: attr.phys_port_cnt,
        })
    }

    fn query_port(&self, ctx: &IbContext, port: u8) -> io::Result<PortAttr> {
        let mut attr: sys::ibv_port_attr = unsafe { std::mem::zeroed() };
        check(unsafe { sys::ibv_query_port(ctx.ctx.as_ptr(), port, &mut attr as *mut sys::ibv_port_attr as *mut _) })?;
        Ok(PortAttr {
            state: port_state(attr.state),
            lid: attr.lid,
            active_mtu: mtu(attr.active_mtu),
        })
    }

    fn alloc_pd(&self, ctx: &IbContext) -> io::Result<IbPd> {
        let pd = unsafe { sys::ibv_alloc_pd(ctx.ctx.as_ptr()) };
        NonNull::new(pd).map_or(Err(io::Error::last_os_error()), |pd| Ok(IbPd { pd }))
    }

    fn create_cq(&self, ctx: &IbContext, depth: u32) -> io::Result<IbCq> {
        let cq = unsafe { sys::ibv_create_cq(ctx.ctx.as_ptr(), depth as c_int, ptr::null_mut(), ptr::null_mut(), 0) };
        NonNull::new(cq).map_or(Err(io::Error::last_os_error()), |cq| Ok(IbCq { cq }))
    }

    fn create_rc_qp(&self, pd: &IbPd, cq: &IbCq, caps: &QpCaps) -> io::Result<IbQp> {
        let mut init: sys::ibv_qp_init_attr = unsafe { std::mem::zeroed() };
        init.send_cq = cq.cq.as_ptr();
        init.recv_cq = cq.cq.as_ptr();
        init.qp_type = ibv_qp_type::IBV_QPT_RC;
        init.sq_sig_all = 0;
        init.cap.max_send_wr = caps.max_send_wr;
        init.cap.max_recv_wr = caps.max_recv_wr;
        init.cap.max_send_sge = caps.max_send_sge;
        init.cap.max_recv_sge = caps.max_recv_sge;
        init.cap.max_inline_data = caps.max_inline_data;
        let qp = unsafe { sys::ibv_create_qp(pd.pd.as_ptr(), &mut init) };
        NonNull::new(qp).map_or(Err(io::Error::last_os_error()), |qp| Ok(IbQp { qp }))
    }

    fn qp_num(&self, qp: &IbQp) -> u32 {
        unsafe { (*qp.qp.as_ptr()).qp_num }
    }

    fn modify_qp(&self, qp: &mut IbQp, transition: &QpTransition) -> io::Result<()> {
        let mut attr: sys::ibv_qp_attr = unsafe { std::mem::zeroed() };
        let mask = match *transition {
            QpTransition::Init {
                port,
                pkey_index,
                access,
            } => {
                attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
                attr.pkey_index = pkey_index;
                attr.port_num = port;
                attr.qp_access_flags = access.bits();
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                    | ibv_qp_attr_mask::IBV_QP_PORT
                    | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS
            }
            QpTransition::Rtr {
                path_mtu,
                dest_qp_num,
                rq_psn,
                max_dest_rd_atomic,
                min_rnr_timer,
                dest_lid,
                port,
            } => {
                attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
                attr.path_mtu = path_mtu as sys::ibv_mtu;
                attr.dest_qp_num = dest_qp_num;
                attr.rq_psn = rq_psn;
                attr.max_dest_rd_atomic = max_dest_rd_atomic;
                attr.min_rnr_timer = min_rnr_timer;
                // LID routed, no GRH.
                attr.ah_attr.is_global = 0;
                attr.ah_attr.dlid = dest_lid;
                attr.ah_attr.sl = 0;
                attr.ah_attr.src_path_bits = 0;
                attr.ah_attr.port_num = port;
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_AV
                    | ibv_qp_attr_mask::IBV_QP_PATH_MTU
                    | ibv_qp_attr_mask::IBV_QP_DEST_QPN
                    | ibv_qp_attr_mask::IBV_QP_RQ_PSN
                    | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                    | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER
            }
            QpTransition::Rts {
                timeout,
                retry_count,
                rnr_retry,
                sq_psn,
                max_rd_atomic,
            } => {
                attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
                attr.timeout = timeout;
                attr.retry_cnt = retry_count;
                attr.rnr_retry = rnr_retry;
                attr.sq_psn = sq_psn;
                attr.max_rd_atomic = max_rd_atomic;
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_TIMEOUT
                    | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                    | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                    | ibv_qp_attr_mask::IBV_QP_SQ_PSN
                    | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC
            }
        };
        check(unsafe { sys::ibv_modify_qp(qp.qp.as_ptr(), &mut attr, mask.0 as c_int) })
    }

    unsafe fn register(&self, pd: &IbPd, addr: *mut u8, len: usize, access: AccessFlags) -> io::Result<IbMr> {
        let mr = unsafe { sys::ibv_reg_mr(pd.pd.as_ptr(), addr as *mut c_void, len, access.bits() as c_int) };
        NonNull::new(mr).map_or(Err(io::Error::last_os_error()), |mr| Ok(IbMr { mr }))
    }

    fn mr_keys(&self, mr: &IbMr) -> MrKeys {
        let raw = unsafe { &*mr.mr.as_ptr() };
        MrKeys {
            addr: raw.addr as u64,
            len: raw.length,
            lkey: raw.lkey,
            rkey: raw.rkey,
        }
    }

    fn post_send(&self, qp: &mut IbQp, wrs: &[SendWr]) -> io::Result<()> {
        if wrs.is_empty() {
            return Ok(());
        }
        let mut sges: Vec<Vec<sys::ibv_sge>> = wrs.iter().map(|wr| sge_list(&wr.sg_list)).collect();
        let mut chain: Vec<sys::ibv_send_wr> = wrs
            .iter()
            .zip(sges.iter_mut())
            .map(|(wr, sg)| {
                let mut raw: sys::ibv_send_wr = unsafe { std::mem::zeroed() };
                raw.wr_id = wr.wr_id;
                raw.sg_list = sg.as_mut_ptr();
                raw.num_sge = sg.len() as c_int;
                if wr.signaled {
                    raw.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
                }
                match wr.opcode {
                    WrOpcode::Send => raw.opcode = ibv_wr_opcode::IBV_WR_SEND,
                    WrOpcode::RdmaWrite { remote_addr, rkey } | WrOpcode::RdmaRead { remote_addr, rkey } => {
                        raw.opcode = if matches!(wr.opcode, WrOpcode::RdmaWrite { .. }) {
                            ibv_wr_opcode::IBV_WR_RDMA_WRITE
                        } else {
                            ibv_wr_opcode::IBV_WR_RDMA_READ
                        };
                        raw.wr.rdma.remote_addr = remote_addr;
                        raw.wr.rdma.rkey = rkey;
                    }
                    WrOpcode::FetchAdd { remote_addr, rkey, add } => {
                        raw.opcode = ibv_wr_opcode::IBV_WR_ATOMIC_FETCH_AND_ADD;
                        raw.wr.atomic.remote_addr = remote_addr;
                        raw.wr.atomic.rkey = rkey;
                        raw.wr.atomic.compare_add = add;
                    }
                    WrOpcode::CompareSwap {
                        remote_addr,
                        rkey,
                        compare,
                        swap,
                    } => {
                        raw.opcode = ibv_wr_opcode::IBV_WR_ATOMIC_CMP_AND_SWP;
                        raw.wr.atomic.remote_addr = remote_addr;
                        raw.wr.atomic.rkey = rkey;
                        raw.wr.atomic.compare_add = compare;
                        raw.wr.atomic.swap = swap;
                    }
                }
                raw
            })
            .collect();
        let head = chain.as_mut_ptr();
        unsafe {
            for i in 1..chain.len() {
                (*head.add(i - 1)).next = head.add(i);
            }
            let post = (*(*qp.qp.as_ptr()).context)
                .ops
                .post_send
                .ok_or_else(|| missing_op("post_send"))?;
            let mut bad = ptr::null_mut();
            check(post(qp.qp.as_ptr(), head, &mut bad))
        }
    }

    fn post_recv(&self, qp: &mut IbQp, wrs: &[RecvWr]) -> io::Result<()> {
        if wrs.is_empty() {
            return Ok(());
        }
        let mut sges: Vec<Vec<sys::ibv_sge>> = wrs.iter().map(|wr| sge_list(&wr.sg_list)).collect();
        let mut chain: Vec<sys::ibv_recv_wr> = wrs
            .iter()
            .zip(sges.iter_mut())
            .map(|(wr, sg)| {
                let mut raw: sys::ibv_recv_wr = unsafe { std::mem::zeroed() };
                raw.wr_id = wr.wr_id;
                raw.sg_list = sg.as_mut_ptr();
                raw.num_sge = sg.len() as c_int;
                raw
            })
            .collect();
        let head = chain.as_mut_ptr();
        unsafe {
            for i in 1..chain.len() {
                (*head.add(i - 1)).next = head.add(i);
            }
            let post = (*(*qp.qp.as_ptr()).context)
                .ops
                .post_recv
                .ok_or_else(|| missing_op("post_recv"))?;
            let mut bad = ptr::null_mut();
            check(post(qp.qp.as_ptr(), head, &mut bad))
        }
    }

    fn poll_cq(&self, cq: &IbCq, max: usize, out: &mut Vec<WorkCompletion>) -> io::Result<usize> {
        if max == 0 {
            return Ok(0);
        }
        let mut wcs: Vec<sys::ibv_wc> = (0..max).map(|_| sys::ibv_wc::default()).collect();
        let n = unsafe {
            let poll = (*(*cq.cq.as_ptr()).context)
                .ops
                .poll_cq
                .ok_or_else(|| missing_op("poll_cq"))?;
            poll(cq.cq.as_ptr(), max as c_int, wcs.as_mut_ptr())
        };
        if n < 0 {
            return Err(io::Error::other(format!("ibv_poll_cq returned {n}")));
        }
        let n = n as usize;
        out.extend(wcs[..n].iter().map(|wc| WorkCompletion {
            wr_id: wc.wr_id,
            status: wc_status(wc.status),
            opcode: wc_opcode(wc.opcode),
            qp_num: wc.qp_num,
            byte_len: wc.byte_len,
        }));
        Ok(n)
    }
}
