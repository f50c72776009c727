//! Launcher probing.
//!
//! Each launcher exports a core's position within its node differently. A
//! [`SiteAdapter`] knows one convention; the communicator asks an ordered
//! list of adapters and takes the first answer.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::geometry::Core;

/// A core's position inside its node as reported by the launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteGeometry {
    /// Index of this core among the cores of its node.
    pub local_rank: usize,
    /// Number of cores on the node.
    pub local_size: usize,
}

/// Source of launcher variables.
pub trait Environment {
    fn var(&self, key: &str) -> Option<String>;
}

/// The real process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl Environment for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl Environment for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

impl Environment for &[(&str, &str)] {
    fn var(&self, key: &str) -> Option<String> {
        self.iter().find(|(k, _)| *k == key).map(|(_, v)| (*v).to_owned())
    }
}

/// One launcher convention.
pub trait SiteAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns `Ok(None)` if this launcher's variables are absent, and an
    /// error if they are present but malformed.
    fn detect(&self, rank: Core, env: &dyn Environment) -> Result<Option<SiteGeometry>>;
}

/// Adapter reading a pair of integer variables (local rank, local size).
#[derive(Debug, Clone, Copy)]
pub struct EnvPair {
    name: &'static str,
    rank_var: &'static str,
    size_var: &'static str,
}

impl EnvPair {
    pub const fn new(name: &'static str, rank_var: &'static str, size_var: &'static str) -> Self {
        Self {
            name,
            rank_var,
            size_var,
        }
    }
}

/// MVAPICH2.
pub const MVAPICH: EnvPair = EnvPair::new(
    "mvapich",
    "MV2_COMM_WORLD_LOCAL_RANK",
    "MV2_COMM_WORLD_LOCAL_SIZE",
);

/// Open MPI.
pub const OPEN_MPI: EnvPair = EnvPair::new(
    "openmpi",
    "OMPI_COMM_WORLD_LOCAL_RANK",
    "OMPI_COMM_WORLD_LOCAL_SIZE",
);

impl SiteAdapter for EnvPair {
    fn name(&self) -> &'static str {
        self.name
    }

    fn detect(&self, _rank: Core, env: &dyn Environment) -> Result<Option<SiteGeometry>> {
        let (Some(rank), Some(size)) = (env.var(self.rank_var), env.var(self.size_var)) else {
            return Ok(None);
        };
        let local_rank = parse_count(self.name, self.rank_var, &rank)?;
        let local_size = parse_count(self.name, self.size_var, &size)?;
        checked(self.name, local_rank, local_size).map(Some)
    }
}

/// SLURM `srun`: `SLURM_LOCALID` plus the leading count of
/// `SLURM_TASKS_PER_NODE` (formatted like `4(x2),3`).
#[derive(Debug, Clone, Copy, Default)]
pub struct Slurm;

impl SiteAdapter for Slurm {
    fn name(&self) -> &'static str {
        "slurm"
    }

    fn detect(&self, _rank: Core, env: &dyn Environment) -> Result<Option<SiteGeometry>> {
        let (Some(local_id), Some(tasks)) = (env.var("SLURM_LOCALID"), env.var("SLURM_TASKS_PER_NODE"))
        else {
            return Ok(None);
        };
        let local_rank = parse_count("slurm", "SLURM_LOCALID", &local_id)?;
        let leading: String = tasks.trim().chars().take_while(char::is_ascii_digit).collect();
        let local_size = parse_count("slurm", "SLURM_TASKS_PER_NODE", &leading)?;
        checked("slurm", local_rank, local_size).map(Some)
    }
}

/// Fixed locale size for jobs that do not come from a launcher, such as
/// the in-process fabric. Local rank follows the contiguous layout.
#[derive(Debug, Clone, Copy)]
pub struct Fixed {
    pub locale_size: usize,
}

impl Fixed {
    pub fn new(locale_size: usize) -> Self {
        Self { locale_size }
    }
}

impl SiteAdapter for Fixed {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn detect(&self, rank: Core, _env: &dyn Environment) -> Result<Option<SiteGeometry>> {
        if self.locale_size == 0 {
            return Err(Error::Site {
                adapter: "fixed",
                message: "locale size must be non-zero".into(),
            });
        }
        Ok(Some(SiteGeometry {
            local_rank: rank % self.locale_size,
            local_size: self.locale_size,
        }))
    }
}

/// The launcher adapters, in priority order.
pub fn default_adapters() -> Vec<Box<dyn SiteAdapter>> {
    vec![Box::new(MVAPICH), Box::new(OPEN_MPI), Box::new(Slurm)]
}

/// Asks each adapter in turn and returns the first report along with the
/// adapter's name.
pub fn detect_site(
    adapters: &[Box<dyn SiteAdapter>],
    rank: Core,
    env: &dyn Environment,
) -> Result<(&'static str, SiteGeometry)> {
    for adapter in adapters {
        if let Some(geom) = adapter.detect(rank, env)? {
            return Ok((adapter.name(), geom));
        }
    }
    Err(Error::NoSiteAdapter)
}

fn parse_count(adapter: &'static str, var: &str, value: &str) -> Result<usize> {
    value.trim().parse::<usize>().map_err(|_| Error::Site {
        adapter,
        message: format!("{var}={value:?} is not a count"),
    })
}

fn checked(adapter: &'static str, local_rank: usize, local_size: usize) -> Result<SiteGeometry> {
    if local_size == 0 || local_rank >= local_size {
        return Err(Error::Site {
            adapter,
            message: format!("local rank {local_rank} outside local size {local_size}"),
        });
    }
    Ok(SiteGeometry {
        local_rank,
        local_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mvapich_wins_over_later_adapters() {
        let env: &[(&str, &str)] = &[
            ("MV2_COMM_WORLD_LOCAL_RANK", "1"),
            ("MV2_COMM_WORLD_LOCAL_SIZE", "4"),
            ("OMPI_COMM_WORLD_LOCAL_RANK", "3"),
            ("OMPI_COMM_WORLD_LOCAL_SIZE", "8"),
        ];
        let (name, geom) = detect_site(&default_adapters(), 5, &env).unwrap();
        assert_eq!(name, "mvapich");
        assert_eq!(
            geom,
            SiteGeometry {
                local_rank: 1,
                local_size: 4
            }
        );
    }

    #[test]
    fn open_mpi() {
        let env: &[(&str, &str)] = &[
            ("OMPI_COMM_WORLD_LOCAL_RANK", "3"),
            ("OMPI_COMM_WORLD_LOCAL_SIZE", "8"),
        ];
        let (name, geom) = detect_site(&default_adapters(), 11, &env).unwrap();
        assert_eq!(name, "openmpi");
        assert_eq!(geom.local_rank, 3);
        assert_eq!(geom.local_size, 8);
    }

    #[test]
    fn slurm_takes_leading_task_count() {
        let env: &[(&str, &str)] = &[("SLURM_LOCALID", "2"), ("SLURM_TASKS_PER_NODE", "16(x4),8")];
        let (name, geom) = detect_site(&default_adapters(), 2, &env).unwrap();
        assert_eq!(name, "slurm");
        assert_eq!(geom.local_size, 16);
        assert_eq!(geom.local_rank, 2);
    }

    #[test]
    fn nothing_reported() {
        let env: &[(&str, &str)] = &[("SLURM_LOCALID", "0")];
        assert!(matches!(
            detect_site(&default_adapters(), 0, &env),
            Err(Error::NoSiteAdapter)
        ));
    }

    #[test]
    fn malformed_values_are_errors() {
        let env: &[(&str, &str)] = &[
            ("OMPI_COMM_WORLD_LOCAL_RANK", "x"),
            ("OMPI_COMM_WORLD_LOCAL_SIZE", "8"),
        ];
        assert!(matches!(
            detect_site(&default_adapters(), 0, &env),
            Err(Error::Site { adapter: "openmpi", .. })
        ));

        let env: &[(&str, &str)] = &[
            ("OMPI_COMM_WORLD_LOCAL_RANK", "8"),
            ("OMPI_COMM_WORLD_LOCAL_SIZE", "8"),
        ];
        assert!(detect_site(&default_adapters(), 0, &env).is_err());
    }

    #[test]
    fn fixed_follows_contiguous_layout() {
        let adapters: Vec<Box<dyn SiteAdapter>> = vec![Box::new(Fixed::new(3))];
        let empty: &[(&str, &str)] = &[];
        let (_, geom) = detect_site(&adapters, 7, &empty).unwrap();
        assert_eq!(
            geom,
            SiteGeometry {
                local_rank: 1,
                local_size: 3
            }
        );
    }
}
