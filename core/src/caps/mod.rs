//! # Capability Discovery
//!
//! The engine that interrogates CPUID, reconciles the requested CDP state
//! against the machine, and publishes the immutable capability snapshot
//! the monitoring and allocation subsystems consume.
//!
//! Discovery order matters: the L3 geometry probe runs first because both
//! the monitoring capability (occupancy upper bound) and the allocation
//! capability (way size, and the way count on the brand-string path)
//! depend on it.

pub mod l3ca;
pub mod monitor;

use rdtk_hal::cpuid::{leaf, Vendor, CACHE_PARAMS_L3_SUBLEAF};
use rdtk_hal::Hardware;

use crate::cdp;
use crate::config::CdpConfig;
use crate::error::{Error, Result};
use crate::topology::CpuTopology;

pub use l3ca::L3CaCapability;
pub use monitor::{EventType, MonCapability, MonitorEvent};

// =============================================================================
// L3 GEOMETRY
// =============================================================================

/// L3 cache geometry from the deterministic cache parameters leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L3Geometry {
    /// Associativity
    pub num_ways: u32,
    /// Line size in bytes
    pub line_size: u32,
    /// Physical line partitions
    pub num_partitions: u32,
    /// Number of sets
    pub num_sets: u32,
    /// Total cache size in bytes
    pub l3_size: u32,
    /// Bytes per way
    pub way_size: u32,
}

/// Probe the L3 geometry from `cpuid(0x4, 0x3)`
pub(crate) fn probe_geometry(hw: &dyn Hardware) -> Result<L3Geometry> {
    let regs = hw.cpuid(leaf::CACHE_PARAMS, CACHE_PARAMS_L3_SUBLEAF).map_err(|e| {
        log::error!("cap: L3 geometry probe failed: {e}");
        Error::Hardware(e)
    })?;

    let num_ways = ((regs.ebx >> 22) & 0x3FF) + 1;
    let line_size = (regs.ebx & 0xFFF) + 1;
    let num_partitions = ((regs.ebx >> 12) & 0x3FF) + 1;
    let num_sets = regs.ecx + 1;
    let l3_size = num_ways * num_partitions * line_size * num_sets;

    Ok(L3Geometry {
        num_ways,
        line_size,
        num_partitions,
        num_sets,
        l3_size,
        way_size: l3_size / num_ways,
    })
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Snapshot layout version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Immutable aggregate of everything discovery found
///
/// Built exactly once per initialization; consumers borrow it until the
/// library value is finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySnapshot {
    mon: Option<MonCapability>,
    l3ca: Option<L3CaCapability>,
    version: u32,
}

impl CapabilitySnapshot {
    /// Monitoring capability, when discovered
    #[inline]
    pub fn monitoring(&self) -> Option<&MonCapability> {
        self.mon.as_ref()
    }

    /// L3 allocation capability, when discovered
    #[inline]
    pub fn l3ca(&self) -> Option<&L3CaCapability> {
        self.l3ca.as_ref()
    }

    /// Snapshot layout version
    #[inline]
    pub fn version(&self) -> u32 {
        self.version
    }
}

// =============================================================================
// DISCOVERY + CDP RECONCILIATION
// =============================================================================

/// Run full discovery and build the snapshot
///
/// May invoke the configurator when `cdp_cfg` demands a state the machine
/// is not in; that is the only situation in which discovery mutates
/// hardware.
pub(crate) fn discover(
    hw: &dyn Hardware,
    topology: &CpuTopology,
    cdp_cfg: CdpConfig,
) -> Result<CapabilitySnapshot> {
    let ident = hw.cpuid(leaf::VENDOR, 0).map_err(|e| {
        log::error!("cap: CPUID unavailable: {e}");
        Error::Hardware(e)
    })?;
    log::debug!(
        "cap: vendor {}, max basic leaf {:#x}",
        Vendor::from_cpuid(ident).as_str(),
        ident.eax
    );

    let geometry = probe_geometry(hw)?;

    let mon = monitor::discover(hw, geometry.l3_size)?;
    let l3ca = match l3ca::discover(hw, &geometry)? {
        Some((cap, _path)) => Some(reconcile_cdp(hw, topology, cap, cdp_cfg)?),
        None => {
            if cdp_cfg == CdpConfig::RequireOn {
                // Nothing to enable CDP on; treat like any other platform
                // that cannot satisfy the request.
                log::error!("cap: CDP required but L3 allocation is absent");
                return Err(Error::InvalidParam);
            }
            None
        }
    };

    if mon.is_none() && l3ca.is_none() {
        log::error!("cap: neither monitoring nor allocation discovered");
        return Err(Error::NotSupported);
    }

    Ok(CapabilitySnapshot {
        mon,
        l3ca,
        version: SNAPSHOT_VERSION,
    })
}

/// Bring the machine's CDP state in line with the request and finalize
/// the allocation capability
fn reconcile_cdp(
    hw: &dyn Hardware,
    topology: &CpuTopology,
    mut cap: L3CaCapability,
    cdp_cfg: CdpConfig,
) -> Result<L3CaCapability> {
    if cap.cdp_supported {
        cap.cdp_on = cdp::cdp_is_enabled(hw, topology)?;

        match (cdp_cfg, cap.cdp_on) {
            (CdpConfig::RequireOn, false) => {
                cdp::cat_reset(hw, topology, cap.num_classes, cap.num_ways)?;
                cdp::cdp_enable(hw, topology, true)?;
                cap.cdp_on = true;
            }
            (CdpConfig::RequireOff, true) => {
                cdp::cat_reset(hw, topology, cap.num_classes, cap.num_ways)?;
                cdp::cdp_enable(hw, topology, false)?;
                cap.cdp_on = false;
            }
            // Observe only: Any, or the machine already satisfies the
            // request.
            _ => {}
        }
    } else if cdp_cfg == CdpConfig::RequireOn {
        log::error!("cap: CDP required but not supported on this platform");
        return Err(Error::InvalidParam);
    }

    if cap.cdp_on {
        // Each logical class pairs a code and a data mask in hardware.
        cap.num_classes /= 2;
    }
    Ok(cap)
}

// =============================================================================
// TESTS
// =============================================================================
