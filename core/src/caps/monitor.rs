//! # Monitoring Capability
//!
//! CMT/MBM discovery: which per-RMID events the package can count and how
//! many RMIDs exist.
//!
//! Discovery walks three CPUID stops:
//!
//! 1. leaf 0x7 subleaf 0, EBX bit 12: monitoring present at all
//! 2. leaf 0xF subleaf 0: package-wide RMID range, L3 resource present
//! 3. leaf 0xF subleaf 1: the concrete event set, per-event RMID range
//!    and the occupancy scale factor
//!
//! Remote memory bandwidth has no hardware counter; it is synthesized as
//! total minus local whenever both of those are counted, and inherits
//! their RMID range and scale factor.

use std::fmt;

use arrayvec::ArrayVec;
use rdtk_hal::cpuid::leaf;
use rdtk_hal::Hardware;

use crate::error::{Error, Result};

// =============================================================================
// EVENT TYPES
// =============================================================================

/// Monitoring event type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// L3 cache occupancy (CMT)
    L3Occupancy,
    /// Local memory bandwidth (MBM)
    LocalMemBw,
    /// Total memory bandwidth (MBM)
    TotalMemBw,
    /// Remote memory bandwidth, synthesized as total minus local
    RemoteMemBw,
}

impl EventType {
    /// Hardware event id programmed into the event-selection register;
    /// `None` for the synthesized event
    pub const fn hw_event_id(self) -> Option<u8> {
        match self {
            EventType::L3Occupancy => Some(1),
            EventType::TotalMemBw => Some(2),
            EventType::LocalMemBw => Some(3),
            EventType::RemoteMemBw => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::L3Occupancy => "l3-occupancy",
            EventType::LocalMemBw => "local-mem-bw",
            EventType::TotalMemBw => "total-mem-bw",
            EventType::RemoteMemBw => "remote-mem-bw",
        };
        f.write_str(name)
    }
}

// =============================================================================
// CAPABILITY
// =============================================================================

/// One discovered monitoring event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorEvent {
    /// Event type
    pub event: EventType,
    /// Number of usable RMIDs for this event
    pub max_rmid: u32,
    /// Counter-to-bytes upscaling factor
    pub scale_factor: u32,
}

/// Maximum number of distinct monitoring events
pub const MAX_MON_EVENTS: usize = 4;

/// Monitoring capability of the package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonCapability {
    /// Package-wide RMID range
    pub max_rmid: u32,
    /// L3 cache size in bytes (occupancy upper bound)
    pub l3_size: u32,
    events: ArrayVec<MonitorEvent, MAX_MON_EVENTS>,
}

impl MonCapability {
    /// All discovered events
    #[inline]
    pub fn events(&self) -> &[MonitorEvent] {
        &self.events
    }

    /// Look up one event by type
    pub fn event(&self, event: EventType) -> Option<&MonitorEvent> {
        self.events.iter().find(|e| e.event == event)
    }

    /// Whether an event type was discovered
    #[inline]
    pub fn has_event(&self, event: EventType) -> bool {
        self.event(event).is_some()
    }
}

// =============================================================================
// DISCOVERY
// =============================================================================

/// Leaf 0x7 subleaf 0 EBX bit: RDT monitoring supported
const FEAT_EBX_PQM: u32 = 1 << 12;
/// Leaf 0xF subleaf 0 EDX bit: L3 monitoring resource present
const MON_EDX_L3: u32 = 1 << 1;
/// Leaf 0xF subleaf 1 EDX bit: L3 occupancy counted
const MON_EVT_L3_OCCUP: u32 = 1 << 0;
/// Leaf 0xF subleaf 1 EDX bit: local memory bandwidth counted
const MON_EVT_LMEM_BW: u32 = 1 << 1;
/// Leaf 0xF subleaf 1 EDX bit: total memory bandwidth counted
const MON_EVT_TMEM_BW: u32 = 1 << 2;

/// Discover the monitoring capability, or `None` when the platform has no
/// usable monitoring (which is not an error by itself)
pub(crate) fn discover(hw: &dyn Hardware, l3_size: u32) -> Result<Option<MonCapability>> {
    let features = hw.cpuid(leaf::STRUCT_EXT_FEATURES, 0).map_err(hw_err)?;
    if features.ebx & FEAT_EBX_PQM == 0 {
        log::debug!("mon: monitoring not advertised");
        return Ok(None);
    }

    let mon = hw.cpuid(leaf::RDT_MONITOR, 0).map_err(hw_err)?;
    let max_rmid = mon.ebx + 1;
    if mon.edx & MON_EDX_L3 == 0 {
        log::debug!("mon: no L3 monitoring resource");
        return Ok(None);
    }

    let l3mon = hw.cpuid(leaf::RDT_MONITOR, 1).map_err(hw_err)?;
    let event_rmid = l3mon.ecx + 1;
    // A zero upscaling factor would make every counter read zero; treat it
    // as the identity.
    let scale_factor = l3mon.ebx.max(1);

    let mut events: ArrayVec<MonitorEvent, MAX_MON_EVENTS> = ArrayVec::new();
    let mut add = |event: EventType| -> Result<()> {
        events
            .try_push(MonitorEvent {
                event,
                max_rmid: event_rmid,
                scale_factor,
            })
            .map_err(|_| {
                log::error!("mon: event table overflow");
                Error::OutOfMemory
            })
    };

    if l3mon.edx & MON_EVT_L3_OCCUP != 0 {
        add(EventType::L3Occupancy)?;
    }
    if l3mon.edx & MON_EVT_LMEM_BW != 0 {
        add(EventType::LocalMemBw)?;
    }
    if l3mon.edx & MON_EVT_TMEM_BW != 0 {
        add(EventType::TotalMemBw)?;
    }
    // Remote bandwidth is computable exactly when both halves are counted.
    if l3mon.edx & MON_EVT_TMEM_BW != 0 && l3mon.edx & MON_EVT_LMEM_BW != 0 {
        add(EventType::RemoteMemBw)?;
    }

    if events.is_empty() {
        log::debug!("mon: monitoring advertised but no events implemented");
        return Ok(None);
    }

    log::info!(
        "mon: {} event(s), {} RMIDs, scale factor {}",
        events.len(),
        max_rmid,
        scale_factor
    );
    Ok(Some(MonCapability {
        max_rmid,
        l3_size,
        events,
    }))
}

fn hw_err(e: rdtk_hal::HwError) -> Error {
    log::error!("mon: capability probe failed: {e}");
    Error::Hardware(e)
}

// =============================================================================
// TESTS
// =============================================================================
