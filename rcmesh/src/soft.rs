//! Software RC provider.
//!
//! A [`SoftFabric`] is a switch shared by every [`SoftVerbs`] created from
//! it; all of them must live in one process. Work requests execute
//! synchronously inside `post_send`, directly against the registered
//! memory, with the same key, range and permission checks a host channel
//! adapter applies. A failed work request moves its queue pair to the error
//! state; later requests on it complete with [`WcStatus::WrFlushError`].
//! Dropping a handle removes it from the switch, so keys of a dropped
//! region stop working.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::verbs::{
    AccessFlags, DeviceAttr, DeviceInfo, MrKeys, Mtu, PortAttr, PortState, QpCaps, QpState, QpTransition,
    RecvWr, SendWr, Sge, Verbs, WcOpcode, WcStatus, WorkCompletion, WrOpcode,
};

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.into())
}

struct MrEntry {
    pd: u32,
    addr: usize,
    len: usize,
    access: AccessFlags,
}

impl MrEntry {
    fn covers(&self, addr: u64, len: usize) -> bool {
        let addr = addr as usize;
        addr >= self.addr && addr.checked_add(len).is_some_and(|end| end <= self.addr + self.len)
    }
}

struct QpEntry {
    pd: u32,
    cq: u32,
    lid: u16,
    state: QpState,
    caps: QpCaps,
    access: AccessFlags,
    dest: Option<(u16, u32)>,
    recv_queue: VecDeque<RecvWr>,
}

#[derive(Default)]
struct SwitchState {
    next_id: u32,
    /// Keyed by lkey; rkey maps to the same entry.
    mrs: HashMap<u32, MrEntry>,
    rkeys: HashMap<u32, u32>,
    qps: HashMap<u32, QpEntry>,
    cqs: HashMap<u32, VecDeque<WorkCompletion>>,
}

impl SwitchState {
    fn next(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn local_sge(&self, pd: u32, sge: &Sge, write: bool) -> Option<&MrEntry> {
        let mr = self.mrs.get(&sge.lkey)?;
        let allowed = mr.pd == pd && mr.covers(sge.addr, sge.length as usize);
        let writable = !write || mr.access.contains(AccessFlags::LOCAL_WRITE);
        (allowed && writable).then_some(mr)
    }

    fn remote_range(&self, target_pd: u32, rkey: u32, addr: u64, len: usize, need: AccessFlags) -> bool {
        self.rkeys
            .get(&rkey)
            .and_then(|lkey| self.mrs.get(lkey))
            .is_some_and(|mr| mr.pd == target_pd && mr.covers(addr, len) && mr.access.contains(need))
    }

    fn complete(&mut self, cq: u32, wc: WorkCompletion) {
        if let Some(q) = self.cqs.get_mut(&cq) {
            q.push_back(wc);
        }
    }
}

/// In-process switch connecting [`SoftVerbs`] instances.
#[derive(Clone)]
pub struct SoftFabric {
    state: Switch,
    devices: usize,
    ports: u8,
    max_qp_rd_atom: u32,
    active_mtu: Mtu,
}

impl Default for SoftFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftFabric {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SwitchState::default())),
            devices: 1,
            ports: 1,
            max_qp_rd_atom: 16,
            active_mtu: Mtu::Mtu4096,
        }
    }

    /// Number of devices each node reports.
    pub fn with_devices(mut self, devices: usize) -> Self {
        self.devices = devices;
        self
    }

    /// Number of ports each device reports.
    pub fn with_ports(mut self, ports: u8) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_max_qp_rd_atom(mut self, max: u32) -> Self {
        self.max_qp_rd_atom = max;
        self
    }

    pub fn with_active_mtu(mut self, mtu: Mtu) -> Self {
        self.active_mtu = mtu;
        self
    }

    /// A provider for a node whose ports carry `lid`. Cores on the same node
    /// share a LID.
    pub fn verbs(&self, lid: u16) -> SoftVerbs {
        SoftVerbs {
            fabric: self.clone(),
            lid,
        }
    }
}

/// One node's view of a [`SoftFabric`].
#[derive(Clone)]
pub struct SoftVerbs {
    fabric: SoftFabric,
    lid: u16,
}

#[derive(Debug)]
pub struct SoftContext {
    device: usize,
}

#[derive(Debug)]
pub struct SoftPd(u32);

type Switch = Arc<Mutex<SwitchState>>;

pub struct SoftCq {
    id: u32,
    switch: Switch,
}

impl Drop for SoftCq {
    fn drop(&mut self) {
        self.switch.lock().cqs.remove(&self.id);
    }
}

pub struct SoftQp {
    qpn: u32,
    switch: Switch,
}

impl Drop for SoftQp {
    fn drop(&mut self) {
        self.switch.lock().qps.remove(&self.qpn);
    }
}

pub struct SoftMr {
    keys: MrKeys,
    switch: Switch,
}

impl Drop for SoftMr {
    fn drop(&mut self) {
        let mut state = self.switch.lock();
        state.mrs.remove(&self.keys.lkey);
        state.rkeys.remove(&self.keys.rkey);
    }
}

/// Outcome of one send WR at the responder.
enum Outcome {
    Done,
    Failed(WcStatus),
}

impl SoftVerbs {
    pub fn lid(&self) -> u16 {
        self.lid
    }

    /// Executes one WR. Called with the switch locked.
    fn execute(&self, state: &mut SwitchState, qpn: u32, wr: &SendWr) -> Outcome {
        let Some(qp) = state.qps.get(&qpn) else {
            return Outcome::Failed(WcStatus::GeneralError);
        };
        let (pd, Some((dest_lid, dest_qpn))) = (qp.pd, qp.dest) else {
            return Outcome::Failed(WcStatus::GeneralError);
        };
        let Some(target) = state.qps.get(&dest_qpn) else {
            return Outcome::Failed(WcStatus::RemoteInvalidRequest);
        };
        let connected_back = target.dest == Some((self.lid, qpn)) && target.lid == dest_lid;
        if !connected_back || target.state < QpState::Rtr || target.state == QpState::Error {
            return Outcome::Failed(WcStatus::RemoteInvalidRequest);
        }
        let (target_pd, target_cq, target_access) = (target.pd, target.cq, target.access);

        match wr.opcode {
            WrOpcode::Send => {
                let mut payload = Vec::new();
                for sge in &wr.sg_list {
                    if state.local_sge(pd, sge, false).is_none() {
                        return Outcome::Failed(WcStatus::LocalProtectionError);
                    }
                    let src = unsafe { std::slice::from_raw_parts(sge.addr as *const u8, sge.length as usize) };
                    payload.extend_from_slice(src);
                }
                let Some(recv) = state.qps.get_mut(&dest_qpn).and_then(|t| t.recv_queue.pop_front()) else {
                    return Outcome::Failed(WcStatus::RnrRetryExceeded);
                };
                let capacity: usize = recv.sg_list.iter().map(|s| s.length as usize).sum();
                let writable = recv.sg_list.iter().all(|s| state.local_sge(target_pd, s, true).is_some());
                let status = if !writable {
                    WcStatus::LocalProtectionError
                } else if capacity < payload.len() {
                    WcStatus::LocalLengthError
                } else {
                    let mut rest = &payload[..];
                    for sge in &recv.sg_list {
                        let n = rest.len().min(sge.length as usize);
                        unsafe {
                            std::ptr::copy_nonoverlapping(rest.as_ptr(), sge.addr as *mut u8, n);
                        }
                        rest = &rest[n..];
                    }
                    WcStatus::Success
                };
                state.complete(
                    target_cq,
                    WorkCompletion {
                        wr_id: recv.wr_id,
                        status,
                        opcode: WcOpcode::Recv,
                        qp_num: dest_qpn,
                        byte_len: payload.len() as u32,
                    },
                );
                if status.is_success() {
                    Outcome::Done
                } else {
                    if let Some(t) = state.qps.get_mut(&dest_qpn) {
                        t.state = QpState::Error;
                    }
                    Outcome::Failed(WcStatus::RemoteInvalidRequest)
                }
            }
            WrOpcode::RdmaWrite { remote_addr, rkey } => {
                let len: usize = wr.sg_list.iter().map(|s| s.length as usize).sum();
                if wr.sg_list.iter().any(|s| state.local_sge(pd, s, false).is_none()) {
                    return Outcome::Failed(WcStatus::LocalProtectionError);
                }
                if !target_access.contains(AccessFlags::REMOTE_WRITE)
                    || !state.remote_range(target_pd, rkey, remote_addr, len, AccessFlags::REMOTE_WRITE)
                {
                    return Outcome::Failed(WcStatus::RemoteAccessError);
                }
                let mut dst = remote_addr as *mut u8;
                for sge in &wr.sg_list {
                    unsafe {
                        std::ptr::copy(sge.addr as *const u8, dst, sge.length as usize);
                        dst = dst.add(sge.length as usize);
                    }
                }
                Outcome::Done
            }
            WrOpcode::RdmaRead { remote_addr, rkey } => {
                let len: usize = wr.sg_list.iter().map(|s| s.length as usize).sum();
                if wr.sg_list.iter().any(|s| state.local_sge(pd, s, true).is_none()) {
                    return Outcome::Failed(WcStatus::LocalProtectionError);
                }
                if !target_access.contains(AccessFlags::REMOTE_READ)
                    || !state.remote_range(target_pd, rkey, remote_addr, len, AccessFlags::REMOTE_READ)
                {
                    return Outcome::Failed(WcStatus::RemoteAccessError);
                }
                let mut src = remote_addr as *const u8;
                for sge in &wr.sg_list {
                    unsafe {
                        std::ptr::copy(src, sge.addr as *mut u8, sge.length as usize);
                        src = src.add(sge.length as usize);
                    }
                }
                Outcome::Done
            }
            WrOpcode::FetchAdd { remote_addr, rkey, .. } | WrOpcode::CompareSwap { remote_addr, rkey, .. } => {
                let [sge] = wr.sg_list.as_slice() else {
                    return Outcome::Failed(WcStatus::LocalLengthError);
                };
                if sge.length != 8 || state.local_sge(pd, sge, true).is_none() {
                    return Outcome::Failed(WcStatus::LocalProtectionError);
                }
                if !remote_addr.is_multiple_of(8)
                    || !target_access.contains(AccessFlags::REMOTE_ATOMIC)
                    || !state.remote_range(target_pd, rkey, remote_addr, 8, AccessFlags::REMOTE_ATOMIC)
                {
                    return Outcome::Failed(WcStatus::RemoteAccessError);
                }
                // SAFETY: the range is registered, 8-byte aligned and in bounds.
                let word = unsafe { AtomicU64::from_ptr(remote_addr as *mut u64) };
                let old = match wr.opcode {
                    WrOpcode::FetchAdd { add, .. } => word.fetch_add(add, Ordering::SeqCst),
                    WrOpcode::CompareSwap { compare, swap, .. } => {
                        match word.compare_exchange(compare, swap, Ordering::SeqCst, Ordering::SeqCst) {
                            Ok(v) | Err(v) => v,
                        }
                    }
                    _ => unreachable!(),
                };
                unsafe { std::ptr::write_unaligned(sge.addr as *mut u64, old) };
                Outcome::Done
            }
        }
    }
}

impl Verbs for SoftVerbs {
    type Context = SoftContext;
    type Pd = SoftPd;
    type Cq = SoftCq;
    type Qp = SoftQp;
    type Mr = SoftMr;

    fn devices(&self) -> io::Result<Vec<DeviceInfo>> {
        Ok((0..self.fabric.devices)
            .map(|i| DeviceInfo {
                name: format!("soft_{i}"),
                guid: ((self.lid as u64) << 16) | i as u64,
            })
            .collect())
    }

    fn open_device(&self, device: &DeviceInfo) -> io::Result<SoftContext> {
        let index = device
            .name
            .strip_prefix("soft_")
            .and_then(|i| i.parse::<usize>().ok())
            .filter(|&i| i < self.fabric.devices)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no device {}", device.name)))?;
        Ok(SoftContext { device: index })
    }

    fn query_device(&self, _ctx: &SoftContext) -> io::Result<DeviceAttr> {
        Ok(DeviceAttr {
            max_qp_rd_atom: self.fabric.max_qp_rd_atom,
            max_qp_wr: 16384,
            max_sge: 30,
            phys_port_cnt: self.fabric.ports,
        })
    }

    fn query_port(&self, ctx: &SoftContext, port: u8) -> io::Result<PortAttr> {
        if port == 0 || port > self.fabric.ports {
            return Err(invalid(format!("device {} has no port {port}", ctx.device)));
        }
        Ok(PortAttr {
            state: PortState::Active,
            lid: self.lid,
            active_mtu: self.fabric.active_mtu,
        })
    }

    fn alloc_pd(&self, _ctx: &SoftContext) -> io::Result<SoftPd> {
        Ok(SoftPd(self.fabric.state.lock().next()))
    }

    fn create_cq(&self, _ctx: &SoftContext, depth: u32) -> io::Result<SoftCq> {
        if depth == 0 {
            return Err(invalid("completion queue depth must be non-zero"));
        }
        let mut state = self.fabric.state.lock();
        let id = state.next();
        state.cqs.insert(id, VecDeque::with_capacity(depth as usize));
        Ok(SoftCq {
            id,
            switch: self.fabric.state.clone(),
        })
    }

    fn create_rc_qp(&self, pd: &SoftPd, cq: &SoftCq, caps: &QpCaps) -> io::Result<SoftQp> {
        if caps.max_send_wr == 0 || caps.max_send_sge == 0 {
            return Err(invalid("queue pair needs send capacity"));
        }
        let mut state = self.fabric.state.lock();
        if !state.cqs.contains_key(&cq.id) {
            return Err(invalid("unknown completion queue"));
        }
        let qpn = state.next();
        state.qps.insert(
            qpn,
            QpEntry {
                pd: pd.0,
                cq: cq.id,
                lid: self.lid,
                state: QpState::Reset,
                caps: *caps,
                access: AccessFlags::empty(),
                dest: None,
                recv_queue: VecDeque::new(),
            },
        );
        Ok(SoftQp {
            qpn,
            switch: self.fabric.state.clone(),
        })
    }

    fn qp_num(&self, qp: &SoftQp) -> u32 {
        qp.qpn
    }

    fn modify_qp(&self, qp: &mut SoftQp, transition: &QpTransition) -> io::Result<()> {
        let mut state = self.fabric.state.lock();
        let entry = state
            .qps
            .get_mut(&qp.qpn)
            .ok_or_else(|| invalid(format!("unknown QP {}", qp.qpn)))?;
        if entry.state != transition.from_state() {
            return Err(invalid(format!(
                "QP {} is in {:?}, {:?} requires {:?}",
                qp.qpn,
                entry.state,
                transition.to_state(),
                transition.from_state()
            )));
        }
        let max_atom = self.fabric.max_qp_rd_atom;
        match *transition {
            QpTransition::Init { port, access, .. } => {
                if port == 0 || port > self.fabric.ports {
                    return Err(invalid(format!("no port {port}")));
                }
                entry.access = access;
            }
            QpTransition::Rtr {
                path_mtu,
                dest_qp_num,
                dest_lid,
                max_dest_rd_atomic,
                ..
            } => {
                if path_mtu > self.fabric.active_mtu || max_dest_rd_atomic as u32 > max_atom {
                    return Err(invalid("RTR attributes exceed device limits"));
                }
                entry.dest = Some((dest_lid, dest_qp_num));
            }
            QpTransition::Rts { max_rd_atomic, .. } => {
                if max_rd_atomic as u32 > max_atom {
                    return Err(invalid("max_rd_atomic exceeds device limit"));
                }
            }
        }
        entry.state = transition.to_state();
        Ok(())
    }

    unsafe fn register(&self, pd: &SoftPd, addr: *mut u8, len: usize, access: AccessFlags) -> io::Result<SoftMr> {
        if addr.is_null() || len == 0 {
            return Err(invalid("cannot register an empty range"));
        }
        let needs_local_write = AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_ATOMIC;
        if access.intersects(needs_local_write) && !access.contains(AccessFlags::LOCAL_WRITE) {
            return Err(invalid("remote write/atomic access requires local write"));
        }
        let mut state = self.fabric.state.lock();
        let lkey = state.next();
        let rkey = state.next();
        state.mrs.insert(
            lkey,
            MrEntry {
                pd: pd.0,
                addr: addr as usize,
                len,
                access,
            },
        );
        state.rkeys.insert(rkey, lkey);
        Ok(SoftMr {
            keys: MrKeys {
                addr: addr as u64,
                len,
                lkey,
                rkey,
            },
            switch: self.fabric.state.clone(),
        })
    }

    fn mr_keys(&self, mr: &SoftMr) -> MrKeys {
        mr.keys
    }

    fn post_send(&self, qp: &mut SoftQp, wrs: &[SendWr]) -> io::Result<()> {
        let mut state = self.fabric.state.lock();
        let entry = state.qps.get(&qp.qpn).ok_or_else(|| invalid(format!("unknown QP {}", qp.qpn)))?;
        if entry.state < QpState::Rts {
            return Err(invalid(format!("QP {} is not ready to send ({:?})", qp.qpn, entry.state)));
        }
        if wrs.len() > entry.caps.max_send_wr as usize {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        if wrs.iter().any(|wr| wr.sg_list.len() > entry.caps.max_send_sge as usize) {
            return Err(invalid("too many scatter/gather entries"));
        }
        let cq = entry.cq;
        for wr in wrs {
            let errored = state.qps.get(&qp.qpn).is_some_and(|e| e.state == QpState::Error);
            let status = if errored {
                WcStatus::WrFlushError
            } else {
                match self.execute(&mut state, qp.qpn, wr) {
                    Outcome::Done => WcStatus::Success,
                    Outcome::Failed(status) => {
                        if let Some(e) = state.qps.get_mut(&qp.qpn) {
                            e.state = QpState::Error;
                        }
                        status
                    }
                }
            };
            trace!(qp = qp.qpn, wr_id = wr.wr_id, ?status, "soft send");
            if wr.signaled || !status.is_success() {
                state.complete(
                    cq,
                    WorkCompletion {
                        wr_id: wr.wr_id,
                        status,
                        opcode: WcOpcode::from(&wr.opcode),
                        qp_num: qp.qpn,
                        byte_len: 0,
                    },
                );
            }
        }
        Ok(())
    }

    fn post_recv(&self, qp: &mut SoftQp, wrs: &[RecvWr]) -> io::Result<()> {
        let mut state = self.fabric.state.lock();
        let entry = state
            .qps
            .get_mut(&qp.qpn)
            .ok_or_else(|| invalid(format!("unknown QP {}", qp.qpn)))?;
        if entry.state == QpState::Reset {
            return Err(invalid(format!("QP {} is in RESET", qp.qpn)));
        }
        if entry.recv_queue.len() + wrs.len() > entry.caps.max_recv_wr as usize {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        entry.recv_queue.extend(wrs.iter().cloned());
        Ok(())
    }

    fn poll_cq(&self, cq: &SoftCq, max: usize, out: &mut Vec<WorkCompletion>) -> io::Result<usize> {
        let mut state = self.fabric.state.lock();
        let queue = state
            .cqs
            .get_mut(&cq.id)
            .ok_or_else(|| invalid(format!("unknown CQ {}", cq.id)))?;
        let n = max.min(queue.len());
        out.extend(queue.drain(..n));
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pair {
        verbs: SoftVerbs,
        pd: SoftPd,
        cq: SoftCq,
        qp: SoftQp,
    }

    fn caps() -> QpCaps {
        QpCaps {
            max_send_wr: 8,
            max_recv_wr: 8,
            max_send_sge: 2,
            max_recv_sge: 2,
            max_inline_data: 0,
        }
    }

    fn endpoint(fabric: &SoftFabric, lid: u16) -> Pair {
        let verbs = fabric.verbs(lid);
        let dev = verbs.devices().unwrap().remove(0);
        let ctx = verbs.open_device(&dev).unwrap();
        let pd = verbs.alloc_pd(&ctx).unwrap();
        let cq = verbs.create_cq(&ctx, 16).unwrap();
        let qp = verbs.create_rc_qp(&pd, &cq, &caps()).unwrap();
        Pair { verbs, pd, cq, qp }
    }

    fn connect(a: &mut Pair, b: &mut Pair, access: AccessFlags) {
        let (an, bn) = (a.verbs.qp_num(&a.qp), b.verbs.qp_num(&b.qp));
        let (al, bl) = (a.verbs.lid(), b.verbs.lid());
        for (p, dest_lid, dest_qp_num) in [(a, bl, bn), (b, al, an)] {
            p.verbs
                .modify_qp(&mut p.qp, &QpTransition::Init { port: 1, pkey_index: 0, access })
                .unwrap();
            p.verbs
                .modify_qp(
                    &mut p.qp,
                    &QpTransition::Rtr {
                        path_mtu: Mtu::Mtu1024,
                        dest_qp_num,
                        rq_psn: 0,
                        max_dest_rd_atomic: 4,
                        min_rnr_timer: 12,
                        dest_lid,
                        port: 1,
                    },
                )
                .unwrap();
            p.verbs
                .modify_qp(
                    &mut p.qp,
                    &QpTransition::Rts {
                        timeout: 14,
                        retry_count: 7,
                        rnr_retry: 7,
                        sq_psn: 0,
                        max_rd_atomic: 4,
                    },
                )
                .unwrap();
        }
    }

    fn register(p: &Pair, buf: &mut [u8], access: AccessFlags) -> (SoftMr, MrKeys) {
        let mr = unsafe { p.verbs.register(&p.pd, buf.as_mut_ptr(), buf.len(), access) }.unwrap();
        let keys = p.verbs.mr_keys(&mr);
        (mr, keys)
    }

    fn poll_one(p: &Pair) -> WorkCompletion {
        let mut out = Vec::new();
        assert_eq!(p.verbs.poll_cq(&p.cq, 1, &mut out).unwrap(), 1);
        out[0]
    }

    #[test]
    fn write_then_read_back() {
        let fabric = SoftFabric::new();
        let (mut a, mut b) = (endpoint(&fabric, 1), endpoint(&fabric, 2));
        connect(&mut a, &mut b, AccessFlags::ALL);
        let mut local = vec![0u8; 64];
        let mut remote = vec![0u8; 64];
        let (_lk_mr, lk) = register(&a, &mut local, AccessFlags::ALL);
        let (_rk_mr, rk) = register(&b, &mut remote, AccessFlags::ALL);

        local[..5].copy_from_slice(b"hello");
        let wr = SendWr::new(
            1,
            WrOpcode::RdmaWrite { remote_addr: rk.addr + 8, rkey: rk.rkey },
            Sge { addr: lk.addr, length: 5, lkey: lk.lkey },
        );
        a.verbs.post_send(&mut a.qp, &[wr]).unwrap();
        let wc = poll_one(&a);
        assert_eq!((wc.wr_id, wc.status, wc.opcode), (1, WcStatus::Success, WcOpcode::RdmaWrite));
        assert_eq!(&remote[8..13], b"hello");

        let wr = SendWr::new(
            2,
            WrOpcode::RdmaRead { remote_addr: rk.addr + 8, rkey: rk.rkey },
            Sge { addr: lk.addr + 32, length: 5, lkey: lk.lkey },
        );
        a.verbs.post_send(&mut a.qp, &[wr]).unwrap();
        assert!(poll_one(&a).status.is_success());
        assert_eq!(&local[32..37], b"hello");
    }

    #[test]
    fn unsignaled_success_is_silent() {
        let fabric = SoftFabric::new();
        let (mut a, mut b) = (endpoint(&fabric, 1), endpoint(&fabric, 1));
        connect(&mut a, &mut b, AccessFlags::ALL);
        let mut local = vec![1u8; 8];
        let mut remote = vec![0u8; 8];
        let (_lk_mr, lk) = register(&a, &mut local, AccessFlags::ALL);
        let (_rk_mr, rk) = register(&b, &mut remote, AccessFlags::ALL);
        let wr = SendWr::new(
            9,
            WrOpcode::RdmaWrite { remote_addr: rk.addr, rkey: rk.rkey },
            Sge { addr: lk.addr, length: 8, lkey: lk.lkey },
        )
        .unsignaled();
        a.verbs.post_send(&mut a.qp, &[wr]).unwrap();
        let mut out = Vec::new();
        assert_eq!(a.verbs.poll_cq(&a.cq, 4, &mut out).unwrap(), 0);
        assert_eq!(remote, vec![1u8; 8]);
    }

    #[test]
    fn bad_rkey_errors_and_flushes() {
        let fabric = SoftFabric::new();
        let (mut a, mut b) = (endpoint(&fabric, 1), endpoint(&fabric, 2));
        connect(&mut a, &mut b, AccessFlags::ALL);
        let mut local = vec![0u8; 16];
        let mut remote = vec![0u8; 16];
        let (_lk_mr, lk) = register(&a, &mut local, AccessFlags::ALL);
        let (_rk_mr, rk) = register(&b, &mut remote, AccessFlags::LOCAL_WRITE);

        let write = |id| {
            SendWr::new(
                id,
                WrOpcode::RdmaWrite { remote_addr: rk.addr, rkey: rk.rkey },
                Sge { addr: lk.addr, length: 4, lkey: lk.lkey },
            )
            .unsignaled()
        };
        a.verbs.post_send(&mut a.qp, &[write(1), write(2)]).unwrap();
        assert_eq!(poll_one(&a).status, WcStatus::RemoteAccessError);
        assert_eq!(poll_one(&a).status, WcStatus::WrFlushError);
    }

    #[test]
    fn send_consumes_posted_receive() {
        let fabric = SoftFabric::new();
        let (mut a, mut b) = (endpoint(&fabric, 1), endpoint(&fabric, 2));
        connect(&mut a, &mut b, AccessFlags::ALL);
        let mut out_buf = *b"ping";
        let mut in_buf = [0u8; 16];
        let (_lk_mr, lk) = register(&a, &mut out_buf, AccessFlags::LOCAL_WRITE);
        let (_rk_mr, rk) = register(&b, &mut in_buf, AccessFlags::LOCAL_WRITE);
        b.verbs
            .post_recv(
                &mut b.qp,
                &[RecvWr {
                    wr_id: 77,
                    sg_list: vec![Sge { addr: rk.addr, length: 16, lkey: rk.lkey }],
                }],
            )
            .unwrap();
        let wr = SendWr::new(5, WrOpcode::Send, Sge { addr: lk.addr, length: 4, lkey: lk.lkey });
        a.verbs.post_send(&mut a.qp, &[wr.clone()]).unwrap();
        assert!(poll_one(&a).status.is_success());
        let wc = poll_one(&b);
        assert_eq!((wc.wr_id, wc.opcode, wc.byte_len), (77, WcOpcode::Recv, 4));
        assert_eq!(&in_buf[..4], b"ping");

        // No receive posted: receiver-not-ready.
        a.verbs.post_send(&mut a.qp, &[wr]).unwrap();
        assert_eq!(poll_one(&a).status, WcStatus::RnrRetryExceeded);
    }

    #[test]
    fn atomics() {
        let fabric = SoftFabric::new();
        let (mut a, mut b) = (endpoint(&fabric, 1), endpoint(&fabric, 2));
        connect(&mut a, &mut b, AccessFlags::ALL);
        let mut result = [0u64; 1];
        let mut counter = [40u64; 1];
        let lk = unsafe { a.verbs.register(&a.pd, result.as_mut_ptr().cast(), 8, AccessFlags::ALL) }.unwrap();
        let rk = unsafe { b.verbs.register(&b.pd, counter.as_mut_ptr().cast(), 8, AccessFlags::ALL) }.unwrap();
        let (lk, rk) = (a.verbs.mr_keys(&lk), b.verbs.mr_keys(&rk));
        let sge = Sge { addr: lk.addr, length: 8, lkey: lk.lkey };

        let add = SendWr::new(1, WrOpcode::FetchAdd { remote_addr: rk.addr, rkey: rk.rkey, add: 2 }, sge);
        a.verbs.post_send(&mut a.qp, &[add]).unwrap();
        assert!(poll_one(&a).status.is_success());
        assert_eq!((result[0], counter[0]), (40, 42));

        let cas = SendWr::new(
            2,
            WrOpcode::CompareSwap { remote_addr: rk.addr, rkey: rk.rkey, compare: 42, swap: 7 },
            sge,
        );
        a.verbs.post_send(&mut a.qp, &[cas]).unwrap();
        assert!(poll_one(&a).status.is_success());
        assert_eq!((result[0], counter[0]), (42, 7));
    }

    #[test]
    fn transitions_only_move_forward() {
        let fabric = SoftFabric::new();
        let mut a = endpoint(&fabric, 1);
        let rts = QpTransition::Rts {
            timeout: 14,
            retry_count: 7,
            rnr_retry: 7,
            sq_psn: 0,
            max_rd_atomic: 1,
        };
        assert!(a.verbs.modify_qp(&mut a.qp, &rts).is_err());
        let init = QpTransition::Init { port: 1, pkey_index: 0, access: AccessFlags::ALL };
        a.verbs.modify_qp(&mut a.qp, &init).unwrap();
        assert!(a.verbs.modify_qp(&mut a.qp, &init).is_err());
    }

    #[test]
    fn dropped_region_keys_are_rejected() {
        let fabric = SoftFabric::new();
        let (mut a, mut b) = (endpoint(&fabric, 1), endpoint(&fabric, 2));
        connect(&mut a, &mut b, AccessFlags::ALL);
        let mut local = vec![0u8; 8];
        let (_lk_mr, lk) = register(&a, &mut local, AccessFlags::ALL);
        let mut remote = vec![7u8; 8];
        let (rk_mr, rk) = register(&b, &mut remote, AccessFlags::ALL);
        drop(rk_mr);
        drop(remote);

        let read = SendWr::new(
            1,
            WrOpcode::RdmaRead { remote_addr: rk.addr, rkey: rk.rkey },
            Sge { addr: lk.addr, length: 8, lkey: lk.lkey },
        );
        a.verbs.post_send(&mut a.qp, &[read]).unwrap();
        assert_eq!(poll_one(&a).status, WcStatus::RemoteAccessError);
        assert_eq!(local, vec![0u8; 8]);
    }

    #[test]
    fn dropped_local_region_is_a_protection_error() {
        let fabric = SoftFabric::new();
        let (mut a, mut b) = (endpoint(&fabric, 1), endpoint(&fabric, 2));
        connect(&mut a, &mut b, AccessFlags::ALL);
        let mut local = vec![0u8; 8];
        let (lk_mr, lk) = register(&a, &mut local, AccessFlags::ALL);
        let mut remote = vec![0u8; 8];
        let (_rk_mr, rk) = register(&b, &mut remote, AccessFlags::ALL);
        drop(lk_mr);

        let write = SendWr::new(
            1,
            WrOpcode::RdmaWrite { remote_addr: rk.addr, rkey: rk.rkey },
            Sge { addr: lk.addr, length: 8, lkey: lk.lkey },
        );
        a.verbs.post_send(&mut a.qp, &[write]).unwrap();
        assert_eq!(poll_one(&a).status, WcStatus::LocalProtectionError);
    }

    #[test]
    fn dropped_handles_leave_the_switch() {
        let fabric = SoftFabric::new();
        let a = endpoint(&fabric, 1);
        let mut buf = vec![0u8; 8];
        let (mr, _) = register(&a, &mut buf, AccessFlags::ALL);
        {
            let state = fabric.state.lock();
            assert_eq!((state.qps.len(), state.cqs.len(), state.mrs.len(), state.rkeys.len()), (1, 1, 1, 1));
        }
        drop(mr);
        drop(a);
        let state = fabric.state.lock();
        assert!(state.qps.is_empty() && state.cqs.is_empty() && state.mrs.is_empty() && state.rkeys.is_empty());
    }
}
