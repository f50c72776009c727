//! Full mesh of RC queue pairs, one per ordered pair of cores.
//!
//! Every core opens the first device, creates one completion queue shared by
//! all of its queue pairs, and one queue pair per core of the job (itself
//! included). Addressing information is exchanged over the two-sided
//! collectives, after which each queue pair is walked through
//! Init -> Rtr -> Rts.

use amsg::{Collectives, Core};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::verbs::{
    AccessFlags, DeviceAttr, MrKeys, PortAttr, PortState, QpCaps, QpTransition, RecvWr, SendWr, Verbs,
    WorkCompletion,
};

/// Fabric constants applied to every queue pair.
pub mod link {
    /// Port every queue pair is bound to.
    pub const PORT: u8 = 1;
    pub const PKEY_INDEX: u16 = 0;
    /// Local ACK timeout exponent (4.096us * 2^14, about 67ms).
    pub const TIMEOUT: u8 = 14;
    pub const RETRY_COUNT: u8 = 7;
    /// 7 means retry forever.
    pub const RNR_RETRY: u8 = 7;
    /// Encoded RNR NAK delay (0.64ms).
    pub const MIN_RNR_TIMER: u8 = 12;
    pub const RQ_PSN: u32 = 0;
    pub const SQ_PSN: u32 = 0;
    /// Upper bound on outstanding RDMA reads/atomics; the device limit wins if lower.
    pub const MAX_RD_ATOMIC: u32 = 16;
}

/// Queue sizing for the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshConfig {
    /// Outstanding send WRs per queue pair. One extra slot is reserved.
    ///
    /// Default: 100
    pub max_send_wr: u32,
    /// Outstanding receive WRs per queue pair.
    ///
    /// Default: 16
    pub recv_depth: u32,
    /// Completion queue depth.
    ///
    /// Default: 256
    pub cq_depth: u32,
    /// Scatter/gather entries per WR, send and receive.
    ///
    /// Default: 1
    pub max_sge: u32,
    /// Default: 16
    pub max_inline_data: u32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_send_wr: 100,
            recv_depth: 16,
            cq_depth: 256,
            max_sge: 1,
            max_inline_data: 16,
        }
    }
}

impl MeshConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_send_wr(mut self, n: u32) -> Self {
        self.max_send_wr = n;
        self
    }

    pub fn with_recv_depth(mut self, n: u32) -> Self {
        self.recv_depth = n;
        self
    }

    pub fn with_cq_depth(mut self, n: u32) -> Self {
        self.cq_depth = n;
        self
    }

    pub fn with_max_sge(mut self, n: u32) -> Self {
        self.max_sge = n;
        self
    }

    pub fn with_max_inline_data(mut self, n: u32) -> Self {
        self.max_inline_data = n;
        self
    }

    fn qp_caps(&self) -> QpCaps {
        QpCaps {
            max_send_wr: self.max_send_wr + 1,
            max_recv_wr: self.recv_depth,
            max_send_sge: self.max_sge,
            max_recv_sge: self.max_sge,
            max_inline_data: self.max_inline_data,
        }
    }
}

/// This core's queue pair to one peer.
pub struct Endpoint<Q> {
    /// Peer's LID.
    pub lid: u16,
    /// Number of the peer's queue pair that talks back to this core.
    pub qp_num: u32,
    pub qp: Q,
}

/// One core's side of the mesh.
pub struct Mesh<V: Verbs> {
    // Queue pairs go before the CQ, PD and context.
    endpoints: Vec<Endpoint<V::Qp>>,
    cq: V::Cq,
    pd: V::Pd,
    ctx: V::Context,
    verbs: V,
    config: MeshConfig,
    port: PortAttr,
    device: DeviceAttr,
    max_rd_atomic: u8,
    completions: Vec<WorkCompletion>,
}

fn decode<const N: usize>(what: &str, core: Core, bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| Error::Bootstrap(format!("core {core} sent {} bytes for its {what}", bytes.len())))
}

impl<V: Verbs> Mesh<V> {
    /// Opens the first device and port 1, and allocates one protection domain.
    pub fn open_device(verbs: V, config: MeshConfig) -> Result<Self> {
        let devices = verbs.devices()?;
        let device = devices.first().ok_or(Error::NoDevice)?;
        if devices.len() > 1 {
            warn!(count = devices.len(), using = %device.name, "multiple RDMA devices found");
        }
        let ctx = verbs.open_device(device)?;
        let attr = verbs.query_device(&ctx)?;
        if attr.phys_port_cnt > 1 {
            warn!(ports = attr.phys_port_cnt, using = link::PORT, "multiple ports found");
        }
        let port = verbs.query_port(&ctx, link::PORT)?;
        if port.state != PortState::Active {
            return Err(Error::PortDown { port: link::PORT });
        }
        let max_rd_atomic = attr.max_qp_rd_atom.min(link::MAX_RD_ATOMIC) as u8;
        debug!(
            device = %device.name,
            lid = port.lid,
            mtu = port.active_mtu.bytes(),
            max_qp_rd_atom = attr.max_qp_rd_atom,
            "RDMA device opened"
        );
        let pd = verbs.alloc_pd(&ctx)?;
        let cq = verbs.create_cq(&ctx, config.cq_depth)?;
        Ok(Self {
            endpoints: Vec::new(),
            cq,
            pd,
            ctx,
            verbs,
            config,
            port,
            device: attr,
            max_rd_atomic,
            completions: Vec::with_capacity(1),
        })
    }

    /// Connects one queue pair to every core. Collective.
    pub fn connect<C: Collectives + ?Sized>(&mut self, comm: &mut C) -> Result<()> {
        if !self.endpoints.is_empty() {
            return Err(Error::AlreadyConnected);
        }
        let cores = comm.cores();
        let mycore = comm.mycore();
        let caps = self.config.qp_caps();
        let qps = (0..cores)
            .map(|_| self.verbs.create_rc_qp(&self.pd, &self.cq, &caps))
            .collect::<std::io::Result<Vec<_>>>()?;

        let lids = comm.all_gather(&self.port.lid.to_le_bytes())?;
        let outgoing: Vec<Vec<u8>> = qps
            .iter()
            .map(|qp| self.verbs.qp_num(qp).to_le_bytes().to_vec())
            .collect();
        let incoming = comm.all_to_all(&outgoing)?;
        if lids.len() != cores || incoming.len() != cores {
            return Err(Error::Bootstrap(format!(
                "expected {cores} entries, got {} LIDs and {} QP numbers",
                lids.len(),
                incoming.len()
            )));
        }

        let mut endpoints = Vec::with_capacity(cores);
        for (core, mut qp) in qps.into_iter().enumerate() {
            let lid = u16::from_le_bytes(decode("LID", core, &lids[core])?);
            let qp_num = u32::from_le_bytes(decode("QP number", core, &incoming[core])?);
            self.bring_up(&mut qp, lid, qp_num)?;
            debug!(
                core = mycore,
                peer = core,
                local_qp = self.verbs.qp_num(&qp),
                remote_qp = qp_num,
                lid,
                "queue pair connected"
            );
            endpoints.push(Endpoint { lid, qp_num, qp });
        }
        self.endpoints = endpoints;

        comm.barrier()?;
        info!(core = mycore, peers = cores, lid = self.port.lid, "RDMA mesh connected");
        Ok(())
    }

    fn bring_up(&self, qp: &mut V::Qp, dest_lid: u16, dest_qp_num: u32) -> Result<()> {
        let transitions = [
            QpTransition::Init {
                port: link::PORT,
                pkey_index: link::PKEY_INDEX,
                access: AccessFlags::ALL,
            },
            QpTransition::Rtr {
                path_mtu: self.port.active_mtu,
                dest_qp_num,
                rq_psn: link::RQ_PSN,
                max_dest_rd_atomic: self.max_rd_atomic,
                min_rnr_timer: link::MIN_RNR_TIMER,
                dest_lid,
                port: link::PORT,
            },
            QpTransition::Rts {
                timeout: link::TIMEOUT,
                retry_count: link::RETRY_COUNT,
                rnr_retry: link::RNR_RETRY,
                sq_psn: link::SQ_PSN,
                max_rd_atomic: self.max_rd_atomic,
            },
        ];
        for t in &transitions {
            self.verbs.modify_qp(qp, t)?;
        }
        Ok(())
    }

    /// Registers `len` bytes at `addr` for local write and every remote access.
    ///
    /// # Safety
    /// The range must stay mapped until the returned region is dropped, and
    /// peers may read or write it at any time.
    pub unsafe fn register(&self, addr: *mut u8, len: usize) -> Result<V::Mr> {
        Ok(unsafe { self.verbs.register(&self.pd, addr, len, AccessFlags::ALL) }?)
    }

    pub fn mr_keys(&self, mr: &V::Mr) -> MrKeys {
        self.verbs.mr_keys(mr)
    }

    /// Posts send work requests on the queue pair to `core`.
    pub fn post_send(&mut self, core: Core, wrs: &[SendWr]) -> Result<()> {
        let verbs = &self.verbs;
        let cores = self.endpoints.len();
        if cores == 0 {
            return Err(Error::NotConnected);
        }
        let ep = self.endpoints.get_mut(core).ok_or(Error::InvalidCore { core, cores })?;
        Ok(verbs.post_send(&mut ep.qp, wrs)?)
    }

    /// Posts receive work requests on the queue pair from `core`.
    pub fn post_receive(&mut self, core: Core, wrs: &[RecvWr]) -> Result<()> {
        let verbs = &self.verbs;
        let cores = self.endpoints.len();
        if cores == 0 {
            return Err(Error::NotConnected);
        }
        let ep = self.endpoints.get_mut(core).ok_or(Error::InvalidCore { core, cores })?;
        Ok(verbs.post_recv(&mut ep.qp, wrs)?)
    }

    /// Takes at most one completion off the shared completion queue.
    ///
    /// Failed completions are logged and returned; the caller decides what
    /// a failure means.
    pub fn poll(&mut self) -> Result<Option<WorkCompletion>> {
        self.completions.clear();
        if self.verbs.poll_cq(&self.cq, 1, &mut self.completions)? == 0 {
            return Ok(None);
        }
        let wc = self.completions.pop();
        if let Some(wc) = &wc
            && !wc.status.is_success()
        {
            error!(
                wr_id = wc.wr_id,
                qp = wc.qp_num,
                status = ?wc.status,
                opcode = ?wc.opcode,
                "work completion failed"
            );
        }
        Ok(wc)
    }

    /// Polls until a completion arrives.
    pub fn wait(&mut self) -> Result<WorkCompletion> {
        loop {
            if let Some(wc) = self.poll()? {
                return Ok(wc);
            }
            std::hint::spin_loop();
        }
    }

    /// Number of the queue pair `core` created for this core.
    pub fn remote_qp_num(&self, core: Core) -> Option<u32> {
        self.endpoints.get(core).map(|ep| ep.qp_num)
    }

    /// Number of this core's queue pair to `core`.
    pub fn local_qp_num(&self, core: Core) -> Option<u32> {
        self.endpoints.get(core).map(|ep| self.verbs.qp_num(&ep.qp))
    }

    pub fn remote_lid(&self, core: Core) -> Option<u16> {
        self.endpoints.get(core).map(|ep| ep.lid)
    }

    pub fn lid(&self) -> u16 {
        self.port.lid
    }

    pub fn max_rd_atomic(&self) -> u8 {
        self.max_rd_atomic
    }

    pub fn device_attr(&self) -> DeviceAttr {
        self.device
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        !self.endpoints.is_empty()
    }

    pub fn cores(&self) -> usize {
        self.endpoints.len()
    }

    pub fn verbs(&self) -> &V {
        &self.verbs
    }

    pub fn context(&self) -> &V::Context {
        &self.ctx
    }
}
