//! # CPU Topology
//!
//! The list of logical cores the engine operates on, each tagged with its
//! socket and cluster. Produced either by platform enumeration (Linux
//! sysfs) or from a caller-supplied descriptor; immutable afterwards.
//!
//! Socket boundaries matter to the engine: CAT mask registers and the CDP
//! enable bit exist once per socket, while the association register exists
//! once per logical core.

use crate::error::{Error, Result};

// =============================================================================
// CORE DESCRIPTOR
// =============================================================================

/// One logical core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreInfo {
    /// Logical core id (OS numbering)
    pub lcore: u32,
    /// Physical package / socket id
    pub socket: u32,
    /// Cluster id within the package
    pub cluster: u32,
}

// =============================================================================
// TOPOLOGY
// =============================================================================

/// Ordered, duplicate-free list of logical cores
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuTopology {
    cores: Vec<CoreInfo>,
}

impl CpuTopology {
    /// Build from a caller-supplied descriptor
    ///
    /// The descriptor is trusted apart from structural validation: it must
    /// be non-empty and free of duplicate logical core ids. Cores are
    /// reordered by ascending `lcore` so iteration order is deterministic.
    pub fn from_cores(mut cores: Vec<CoreInfo>) -> Result<Self> {
        if cores.is_empty() {
            log::error!("topology: descriptor contains no cores");
            return Err(Error::InvalidParam);
        }
        cores.sort_by_key(|c| c.lcore);
        if cores.windows(2).any(|w| w[0].lcore == w[1].lcore) {
            log::error!("topology: duplicate logical core id in descriptor");
            return Err(Error::InvalidParam);
        }
        Ok(Self { cores })
    }

    /// Enumerate the platform topology from sysfs
    #[cfg(target_os = "linux")]
    pub fn enumerate() -> Result<Self> {
        let cores = sysfs::enumerate_cores().map_err(|e| {
            log::error!("topology: platform enumeration failed: {e}");
            Error::Generic
        })?;
        let topology = Self::from_cores(cores)?;
        log::info!(
            "topology: {} cores across {} socket(s)",
            topology.num_cores(),
            topology.sockets().len()
        );
        Ok(topology)
    }

    /// Enumerate the platform topology
    #[cfg(not(target_os = "linux"))]
    pub fn enumerate() -> Result<Self> {
        log::error!("topology: platform enumeration requires Linux");
        Err(Error::NotSupported)
    }

    /// All cores, ascending by logical id
    #[inline]
    pub fn cores(&self) -> &[CoreInfo] {
        &self.cores
    }

    /// Number of logical cores
    #[inline]
    pub fn num_cores(&self) -> usize {
        self.cores.len()
    }

    /// Highest logical core id
    pub fn max_lcore(&self) -> u32 {
        // Non-empty by construction; the last entry has the highest id.
        self.cores.last().map(|c| c.lcore).unwrap_or(0)
    }

    /// Socket ids present, ascending and deduplicated
    pub fn sockets(&self) -> Vec<u32> {
        let mut sockets: Vec<u32> = self.cores.iter().map(|c| c.socket).collect();
        sockets.sort_unstable();
        sockets.dedup();
        sockets
    }

    /// Lowest-numbered core of a socket, used as that socket's
    /// representative for per-socket registers
    pub fn first_core_of_socket(&self, socket: u32) -> Option<u32> {
        self.cores
            .iter()
            .find(|c| c.socket == socket)
            .map(|c| c.lcore)
    }
}

// =============================================================================
// SYSFS ENUMERATION
// =============================================================================

#[cfg(target_os = "linux")]
mod sysfs {
    use std::fs;
    use std::io;
    use std::path::PathBuf;

    use super::CoreInfo;

    fn cpu_path(lcore: u32, suffix: &str) -> PathBuf {
        PathBuf::from(format!("/sys/devices/system/cpu/cpu{lcore}/{suffix}"))
    }

    /// Parse a sysfs CPU range list such as `0-3,8-11,14`
    pub(super) fn parse_cpu_list(text: &str) -> io::Result<Vec<u32>> {
        let bad = |part: &str| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed cpu list entry: {part:?}"),
            )
        };

        let mut cpus = Vec::new();
        for part in text.trim().split(',') {
            if part.is_empty() {
                continue;
            }
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo: u32 = lo.parse().map_err(|_| bad(part))?;
                    let hi: u32 = hi.parse().map_err(|_| bad(part))?;
                    if hi < lo {
                        return Err(bad(part));
                    }
                    cpus.extend(lo..=hi);
                }
                None => cpus.push(part.parse().map_err(|_| bad(part))?),
            }
        }
        Ok(cpus)
    }

    fn read_id(lcore: u32, suffix: &str) -> io::Result<u32> {
        let text = fs::read_to_string(cpu_path(lcore, suffix))?;
        let id: i64 = text.trim().parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed id in cpu{lcore}/{suffix}: {:?}", text.trim()),
            )
        })?;
        // Some platforms report -1 for ids they do not implement.
        Ok(id.max(0) as u32)
    }

    pub(super) fn enumerate_cores() -> io::Result<Vec<CoreInfo>> {
        let online = fs::read_to_string("/sys/devices/system/cpu/online")?;
        let mut cores = Vec::new();
        for lcore in parse_cpu_list(&online)? {
            let socket = read_id(lcore, "topology/physical_package_id")?;
            // cluster_id is a newer attribute; fall back to die_id, then 0.
            let cluster = read_id(lcore, "topology/cluster_id")
                .or_else(|_| read_id(lcore, "topology/die_id"))
                .unwrap_or(0);
            cores.push(CoreInfo {
                lcore,
                socket,
                cluster,
            });
        }
        Ok(cores)
    }
}

// =============================================================================
// TESTS
// =============================================================================
