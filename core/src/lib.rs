//! # rdtk Capability Engine
//!
//! Discovery, configuration and monitoring of x86-64 platform QoS
//! features: Cache Monitoring Technology (CMT), Memory Bandwidth
//! Monitoring (MBM) and Cache Allocation Technology (CAT) with Code/Data
//! Prioritization (CDP).
//!
//! ## Lifecycle
//!
//! All state lives in an [`Rdtk`] value owned by the caller. At most one
//! value can be live per process; the hardware being configured is
//! machine-global, so a second initialization fails with
//! [`Error::InitState`] until the first value is finalized or dropped.
//!
//! Bring-up order: log sink, topology, hardware primitives, capability
//! discovery (which may run a CDP transition), then the monitoring and
//! allocation subsystems. A failure at any stage unwinds the stages
//! before it and releases the instance slot. Tear-down runs in reverse
//! and is best-effort: every stage runs, the first error is reported.
//!
//! ## Concurrency
//!
//! Public operations serialize on one internal lock; the capability
//! snapshot is immutable after init and safe to read concurrently.
//! MSR device I/O happens while the lock is held; configuration is
//! deliberately not concurrent.
//!
//! ## Example
//!
//! ```rust,no_run
//! use rdtk_core::{Config, Rdtk};
//!
//! let lib = Rdtk::init(Config::default())?;
//! let (caps, topology) = lib.capabilities();
//! if let Some(mon) = caps.monitoring() {
//!     println!("{} RMIDs on {} cores", mon.max_rmid, topology.num_cores());
//! }
//! lib.fini()?;
//! # Ok::<(), rdtk_core::Error>(())
//! ```

mod alloc;
mod caps;
mod cdp;
mod config;
mod error;
mod logger;
mod mon;
#[cfg(test)]
mod testhw;
mod topology;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub use rdtk_hal::{Hardware, HostHardware, HwError};

pub use alloc::ClassMask;
pub use caps::{CapabilitySnapshot, EventType, L3CaCapability, MonCapability, MonitorEvent};
pub use config::{CdpConfig, Config, LogConfig, LogSink};
pub use error::{Error, Result};
pub use topology::{CoreInfo, CpuTopology};

use alloc::Allocation;
use mon::Monitoring;

// =============================================================================
// INSTANCE GATE
// =============================================================================

/// Whether a library value is live in this process
static INSTANCE_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Claim on the process-wide instance slot; released on drop
#[derive(Debug)]
struct InstanceGate;

impl InstanceGate {
    fn acquire() -> Result<Self> {
        if INSTANCE_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Ok(Self)
        } else {
            log::error!("lib: already initialized in this process");
            Err(Error::InitState)
        }
    }
}

impl Drop for InstanceGate {
    fn drop(&mut self) {
        INSTANCE_ACTIVE.store(false, Ordering::Release);
    }
}

// =============================================================================
// LIBRARY VALUE
// =============================================================================

/// The initialized library
///
/// Owns the topology, the capability snapshot and the hardware primitives
/// until [`Rdtk::fini`] consumes it (or it is dropped).
pub struct Rdtk {
    hw: Box<dyn Hardware>,
    topology: CpuTopology,
    snapshot: CapabilitySnapshot,
    mon: Option<Monitoring>,
    alloc: Option<Allocation>,
    api_lock: Mutex<()>,
    _gate: InstanceGate,
}

impl std::fmt::Debug for Rdtk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rdtk")
            .field("topology", &self.topology)
            .field("snapshot", &self.snapshot)
            .field("mon", &self.mon.is_some())
            .field("alloc", &self.alloc.is_some())
            .finish_non_exhaustive()
    }
}

impl Rdtk {
    /// Initialize against the running machine
    pub fn init(config: Config) -> Result<Self> {
        Self::init_inner(config, |topology| {
            let anchor = topology.cores()[0].lcore;
            let hw = HostHardware::probe(topology.max_lcore())?.with_anchor(anchor);
            Ok(Box::new(hw))
        })
    }

    /// Initialize against caller-supplied hardware primitives
    ///
    /// This is the seam for exercising the engine without touching the
    /// machine; the lifecycle is identical to [`Rdtk::init`].
    pub fn init_with_hardware(config: Config, hw: Box<dyn Hardware>) -> Result<Self> {
        Self::init_inner(config, move |_| Ok(hw))
    }

    fn init_inner(
        config: Config,
        make_hw: impl FnOnce(&CpuTopology) -> Result<Box<dyn Hardware>>,
    ) -> Result<Self> {
        // Stage 1: claim the instance slot. Dropping the gate on any
        // failure below releases it again.
        let gate = InstanceGate::acquire()?;

        // Stage 2: log sink.
        logger::install(&config.log).map_err(|e| {
            log::error!("lib: cannot open log sink: {e}");
            Error::Generic
        })?;

        // Stage 3: topology, injected or enumerated.
        let topology = match config.topology {
            Some(cores) => CpuTopology::from_cores(cores)?,
            None => CpuTopology::enumerate()?,
        };

        // Stage 4: hardware primitives sized for the topology.
        let hw = make_hw(&topology)?;

        // Stage 5: capability discovery (may run a CDP transition).
        let snapshot = caps::discover(hw.as_ref(), &topology, config.cdp)?;

        // Stages 6 and 7: runtime subsystems. Each needs its capability;
        // a platform is usable as long as one of them comes up.
        let mon = Monitoring::init(&topology, &snapshot);
        let alloc = Allocation::init(&topology, &snapshot);
        if mon.is_err() && alloc.is_err() {
            log::error!("lib: neither monitoring nor allocation came up");
            return Err(Error::Generic);
        }

        log::info!(
            "lib: initialized ({} cores, monitoring {}, allocation {})",
            topology.num_cores(),
            if mon.is_ok() { "up" } else { "down" },
            if alloc.is_ok() { "up" } else { "down" },
        );

        Ok(Self {
            hw,
            topology,
            snapshot,
            mon: mon.ok(),
            alloc: alloc.ok(),
            api_lock: Mutex::new(()),
            _gate: gate,
        })
    }

    /// Finalize, tearing subsystems down in reverse bring-up order
    ///
    /// Best-effort: every stage runs even if an earlier one failed; the
    /// first error is returned. The instance slot is released either way.
    pub fn fini(mut self) -> Result<()> {
        let mut first_err: Option<Error> = None;

        if let Some(alloc) = self.alloc.take() {
            alloc.fini();
        }
        if let Some(mon) = self.mon.take() {
            if let Err(e) = mon.fini(self.hw.as_ref()) {
                first_err.get_or_insert(e);
            }
        }

        log::info!("lib: finalized");
        first_err.map_or(Ok(()), Err)
    }

    // =========================================================================
    // CAPABILITY ACCESS
    // =========================================================================

    /// The capability snapshot and topology, borrowed until fini
    pub fn capabilities(&self) -> (&CapabilitySnapshot, &CpuTopology) {
        (&self.snapshot, &self.topology)
    }

    // =========================================================================
    // MONITORING OPERATIONS
    // =========================================================================

    /// Tag a core's traffic with an RMID
    pub fn mon_assoc_set(&self, lcore: u32, rmid: u32) -> Result<()> {
        let _lock = self.lock();
        self.monitoring()?.assoc_set(self.hw.as_ref(), lcore, rmid)
    }

    /// Read the RMID a core's traffic is tagged with
    pub fn mon_assoc_get(&self, lcore: u32) -> Result<u32> {
        let _lock = self.lock();
        self.monitoring()?.assoc_get(self.hw.as_ref(), lcore)
    }

    /// Read one event's counter for an RMID, scaled to bytes
    pub fn mon_read_event(&self, lcore: u32, rmid: u32, event: EventType) -> Result<u64> {
        let _lock = self.lock();
        self.monitoring()?
            .read_event(self.hw.as_ref(), lcore, rmid, event)
    }

    // =========================================================================
    // ALLOCATION OPERATIONS
    // =========================================================================

    /// Program one class's way mask on one socket
    pub fn l3ca_set(&self, socket: u32, class_id: u32, mask: u64) -> Result<()> {
        let _lock = self.lock();
        self.allocation()?
            .set_class_mask(self.hw.as_ref(), socket, class_id, mask)
    }

    /// Program one class's code and data masks on one socket (CDP only)
    pub fn l3ca_set_cdp(&self, socket: u32, class_id: u32, code: u64, data: u64) -> Result<()> {
        let _lock = self.lock();
        self.allocation()?
            .set_class_masks_cdp(self.hw.as_ref(), socket, class_id, code, data)
    }

    /// Read one class's masks back from a socket
    pub fn l3ca_get(&self, socket: u32, class_id: u32) -> Result<ClassMask> {
        let _lock = self.lock();
        self.allocation()?
            .class_mask(self.hw.as_ref(), socket, class_id)
    }

    /// Associate a core with a class of service
    pub fn alloc_assoc_set(&self, lcore: u32, class_id: u32) -> Result<()> {
        let _lock = self.lock();
        self.allocation()?
            .assoc_set(self.hw.as_ref(), lcore, class_id)
    }

    /// Read the class of service a core is associated with
    pub fn alloc_assoc_get(&self, lcore: u32) -> Result<u32> {
        let _lock = self.lock();
        self.allocation()?.assoc_get(self.hw.as_ref(), lcore)
    }

    // =========================================================================
    // INTERNAL
    // =========================================================================

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.api_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn monitoring(&self) -> Result<&Monitoring> {
        self.mon.as_ref().ok_or_else(|| {
            log::error!("lib: monitoring subsystem is down");
            Error::NotSupported
        })
    }

    fn allocation(&self) -> Result<&Allocation> {
        self.alloc.as_ref().ok_or_else(|| {
            log::error!("lib: allocation subsystem is down");
            Error::NotSupported
        })
    }
}

impl Drop for Rdtk {
    fn drop(&mut self) {
        // Silent best-effort teardown for values abandoned without fini.
        if let Some(alloc) = self.alloc.take() {
            alloc.fini();
        }
        if let Some(mon) = self.mon.take() {
            let _ = mon.fini(self.hw.as_ref());
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
