//! One-sided RDMA over a full mesh of reliable-connected queue pairs.
//!
//! - [`verbs`]: the provider seam ([`Verbs`]) and its plain-data types
//! - [`soft`]: an in-process software provider
//! - `ibv`: libibverbs hardware provider (feature `ibverbs`)
//! - [`Mesh`]: device setup and the collective connection bootstrap
//! - [`PinnedRegion`]: registered memory with every peer's keys on hand

pub mod error;
#[cfg(feature = "ibverbs")]
pub mod ibv;
pub mod mesh;
pub mod pinned;
pub mod soft;
pub mod verbs;

pub use error::{Error, Result};
#[cfg(feature = "ibverbs")]
pub use ibv::IbVerbs;
pub use mesh::{Endpoint, Mesh, MeshConfig, link};
pub use pinned::{PinnedRegion, Placement, RemoteAddr};
pub use soft::{SoftFabric, SoftVerbs};
pub use verbs::{
    AccessFlags, DeviceAttr, DeviceInfo, MrKeys, Mtu, PortAttr, PortState, QpCaps, QpState, QpTransition, RecvWr,
    SendWr, Sge, Verbs, WcOpcode, WcStatus, WorkCompletion, WrOpcode,
};
