//! Runtime configuration and its environment overrides.

use std::fmt::Display;
use std::str::FromStr;

use amsg::{CommConfig, Environment};
use rcmesh::MeshConfig;
use shmheap::{HeapConfig, HeapSize};

use crate::error::{Error, Result};

/// Base address of the RDMA scratch mapping.
pub const DEFAULT_SCRATCH_BASE: usize = 0x0000_1000_0000_0000;

/// Default size of the RDMA scratch mapping.
pub const DEFAULT_SCRATCH_BYTES: usize = 64 << 20;

pub const ENV_SEND_CONTEXTS_LOG2: &str = "DSM_SEND_CONTEXTS_LOG2";
pub const ENV_RECV_CONTEXTS_LOG2: &str = "DSM_RECV_CONTEXTS_LOG2";
pub const ENV_RECV_BUFFER_SIZE: &str = "DSM_RECV_BUFFER_SIZE";
pub const ENV_MAX_SEND_WR: &str = "DSM_MAX_SEND_WR";
pub const ENV_HEAP_BYTES: &str = "DSM_HEAP_BYTES";
pub const ENV_HEAP_FRACTION: &str = "DSM_HEAP_FRACTION";
pub const ENV_HEAP_BASE: &str = "DSM_HEAP_BASE";
pub const ENV_SCRATCH_BYTES: &str = "DSM_SCRATCH_BYTES";
pub const ENV_JOB_ID: &str = "DSM_JOB_ID";

/// Everything the runtime needs to come up.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub comm: CommConfig,
    pub mesh: MeshConfig,
    pub heap: HeapConfig,
    /// Size of the RDMA scratch mapping.
    ///
    /// Default: 64 MiB
    pub scratch_bytes: usize,
    /// Fixed base of the RDMA scratch mapping, identical on every core.
    /// `None` lets the kernel choose, which is what cores sharing a process
    /// need.
    ///
    /// Default: `Some(0x0000_1000_0000_0000)`
    pub scratch_base: Option<usize>,
    /// Register the locale heap for one-sided access as well.
    ///
    /// Default: true
    pub register_heap: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            comm: CommConfig::default(),
            mesh: MeshConfig::default(),
            heap: HeapConfig::default(),
            scratch_bytes: DEFAULT_SCRATCH_BYTES,
            scratch_base: Some(DEFAULT_SCRATCH_BASE),
            register_heap: true,
        }
    }
}

fn parse<T>(env: &dyn Environment, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    env.var(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}")))
        })
        .transpose()
}

/// Decimal or `0x`-prefixed hexadecimal.
fn parse_address(env: &dyn Environment, key: &str) -> Result<Option<usize>> {
    let Some(raw) = env.var(key) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    let parsed = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(&hex.replace('_', ""), 16),
        None => trimmed.parse(),
    };
    parsed
        .map(Some)
        .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}")))
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by the `DSM_*` variables found in `env`.
    pub fn from_env(env: &dyn Environment) -> Result<Self> {
        Self::default().with_env(env)
    }

    /// Applies the `DSM_*` variables found in `env` on top of `self`.
    pub fn with_env(mut self, env: &dyn Environment) -> Result<Self> {
        if let Some(v) = parse(env, ENV_SEND_CONTEXTS_LOG2)? {
            self.comm.log2_send_contexts = v;
        }
        if let Some(v) = parse(env, ENV_RECV_CONTEXTS_LOG2)? {
            self.comm.log2_recv_contexts = v;
        }
        if let Some(v) = parse(env, ENV_RECV_BUFFER_SIZE)? {
            self.comm.recv_buffer_size = v;
        }
        if let Some(v) = parse(env, ENV_MAX_SEND_WR)? {
            self.mesh.max_send_wr = v;
        }
        match (parse::<usize>(env, ENV_HEAP_BYTES)?, parse::<f64>(env, ENV_HEAP_FRACTION)?) {
            (Some(_), Some(_)) => {
                return Err(Error::Config(format!(
                    "{ENV_HEAP_BYTES} and {ENV_HEAP_FRACTION} are mutually exclusive"
                )));
            }
            (Some(bytes), None) => self.heap.size = HeapSize::Bytes(bytes),
            (None, Some(fraction)) => self.heap.size = HeapSize::FractionOfNode(fraction),
            (None, None) => {}
        }
        if let Some(base) = parse_address(env, ENV_HEAP_BASE)? {
            self.heap.base_address = base;
        }
        if let Some(bytes) = parse(env, ENV_SCRATCH_BYTES)? {
            self.scratch_bytes = bytes;
        }
        if let Some(job) = env.var(ENV_JOB_ID).or_else(|| env.var("SLURM_JOB_ID")) {
            self.heap = self.heap.with_job_id(job.trim());
        }
        self.validate()?;
        Ok(self)
    }

    pub fn with_comm(mut self, comm: CommConfig) -> Self {
        self.comm = comm;
        self
    }

    pub fn with_mesh(mut self, mesh: MeshConfig) -> Self {
        self.mesh = mesh;
        self
    }

    pub fn with_heap(mut self, heap: HeapConfig) -> Self {
        self.heap = heap;
        self
    }

    pub fn with_scratch_bytes(mut self, bytes: usize) -> Self {
        self.scratch_bytes = bytes;
        self
    }

    pub fn with_scratch_base(mut self, base: Option<usize>) -> Self {
        self.scratch_base = base;
        self
    }

    pub fn with_register_heap(mut self, register: bool) -> Self {
        self.register_heap = register;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.scratch_bytes == 0 {
            return Err(Error::Config("scratch region must be non-empty".into()));
        }
        if self.mesh.max_send_wr == 0 {
            return Err(Error::Config("max_send_wr must be non-zero".into()));
        }
        if let HeapSize::FractionOfNode(f) = self.heap.size
            && !(f > 0.0 && f <= 1.0)
        {
            return Err(Error::Config(format!("heap fraction {f} is outside (0, 1]")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_env_keeps_defaults() {
        let env: &[(&str, &str)] = &[];
        assert_eq!(Config::from_env(&env).unwrap(), Config::default());
    }

    #[test]
    fn overrides_apply() {
        let env: &[(&str, &str)] = &[
            (ENV_SEND_CONTEXTS_LOG2, "3"),
            (ENV_RECV_CONTEXTS_LOG2, "4"),
            (ENV_RECV_BUFFER_SIZE, "16384"),
            (ENV_MAX_SEND_WR, "200"),
            (ENV_HEAP_FRACTION, "0.5"),
            (ENV_HEAP_BASE, "0x5000_0000_0000"),
            (ENV_SCRATCH_BYTES, "1048576"),
            ("SLURM_JOB_ID", "4242"),
        ];
        let config = Config::from_env(&env).unwrap();
        assert_eq!(config.comm.log2_send_contexts, 3);
        assert_eq!(config.comm.log2_recv_contexts, 4);
        assert_eq!(config.comm.recv_buffer_size, 16384);
        assert_eq!(config.mesh.max_send_wr, 200);
        assert_eq!(config.heap.size, HeapSize::FractionOfNode(0.5));
        assert_eq!(config.heap.base_address, 0x5000_0000_0000);
        assert_eq!(config.scratch_bytes, 1 << 20);
        assert_eq!(config.heap.name, "/dsm_locale_heap.4242");
    }

    #[test]
    fn explicit_job_id_wins() {
        let env: &[(&str, &str)] = &[(ENV_JOB_ID, "mine"), ("SLURM_JOB_ID", "4242")];
        assert_eq!(Config::from_env(&env).unwrap().heap.name, "/dsm_locale_heap.mine");
    }

    #[test]
    fn bad_values_are_config_errors() {
        for env in [
            &[(ENV_MAX_SEND_WR, "lots")][..],
            &[(ENV_HEAP_BASE, "0xnope")][..],
            &[(ENV_HEAP_FRACTION, "1.5")][..],
            &[(ENV_SCRATCH_BYTES, "0")][..],
            &[(ENV_HEAP_BYTES, "4096"), (ENV_HEAP_FRACTION, "0.1")][..],
        ] {
            assert!(matches!(Config::from_env(&env), Err(Error::Config(_))), "{env:?}");
        }
    }
}
