//! # Hardware Interface
//!
//! The seam between the capability engine and the machine: CPUID execution
//! plus per-core MSR reads and writes.
//!
//! The engine consumes the [`Hardware`] trait so that discovery and
//! configuration logic can be exercised against scripted register state.
//! [`HostHardware`] is the production implementation: CPUID through the
//! instruction itself (pinned to an anchor core for deterministic answers)
//! and MSRs through the kernel's per-core device endpoints.
//!
//! Primitive failures are not retried; one failure aborts the enclosing
//! discovery or configuration operation.

use std::fmt;
use std::io;

use crate::cpuid::CpuIdResult;

// =============================================================================
// ERRORS
// =============================================================================

/// Hardware primitive failure
///
/// All variants surface as a single semantic error kind to library callers;
/// the variants exist so the log can say which endpoint failed and why.
#[derive(Debug)]
pub enum HwError {
    /// The platform does not expose the required primitives at all
    Unsupported,
    /// A logical core outside the probed range was addressed
    CoreOutOfRange {
        /// Requested logical core
        lcore: u32,
        /// Highest logical core the layer was initialized for
        max_lcore: u32,
    },
    /// An MSR device endpoint could not be opened
    DeviceOpen {
        /// Logical core of the endpoint
        lcore: u32,
        /// Underlying I/O error
        source: io::Error,
    },
    /// An MSR device read or write failed
    DeviceIo {
        /// Logical core of the endpoint
        lcore: u32,
        /// Register address
        reg: u32,
        /// Underlying I/O error
        source: io::Error,
    },
    /// The calling thread could not be pinned for CPUID execution
    Affinity {
        /// Target logical core
        lcore: u32,
        /// Underlying OS error
        source: io::Error,
    },
    /// Per-socket copies of a register disagree; software will not force
    /// convergence
    Inconsistent {
        /// Register address
        reg: u32,
    },
}

impl fmt::Display for HwError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HwError::Unsupported => {
                write!(f, "platform does not expose CPUID/MSR primitives")
            }
            HwError::CoreOutOfRange { lcore, max_lcore } => {
                write!(f, "logical core {lcore} outside probed range 0..={max_lcore}")
            }
            HwError::DeviceOpen { lcore, source } => {
                write!(f, "cannot open MSR endpoint for core {lcore}: {source}")
            }
            HwError::DeviceIo { lcore, reg, source } => {
                write!(f, "MSR {reg:#x} I/O failed on core {lcore}: {source}")
            }
            HwError::Affinity { lcore, source } => {
                write!(f, "cannot pin to core {lcore} for CPUID: {source}")
            }
            HwError::Inconsistent { reg } => {
                write!(f, "register {reg:#x} differs across sockets (reboot required)")
            }
        }
    }
}

impl std::error::Error for HwError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HwError::DeviceOpen { source, .. }
            | HwError::DeviceIo { source, .. }
            | HwError::Affinity { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result alias for hardware primitives
pub type HwResult<T> = Result<T, HwError>;

// =============================================================================
// HARDWARE TRAIT
// =============================================================================

/// CPUID and MSR primitives consumed by the capability engine
///
/// MSR operations take effect on the addressed logical core; CPUID answers
/// come from one well-defined core of the implementation's choosing.
pub trait Hardware: Send {
    /// Execute CPUID for a leaf/subleaf pair
    fn cpuid(&self, leaf: u32, subleaf: u32) -> HwResult<CpuIdResult>;

    /// Read an MSR on a logical core
    fn msr_read(&self, lcore: u32, reg: u32) -> HwResult<u64>;

    /// Write an MSR on a logical core
    fn msr_write(&self, lcore: u32, reg: u32, value: u64) -> HwResult<()>;
}

// =============================================================================
// HOST IMPLEMENTATION
// =============================================================================

/// Production [`Hardware`] backed by the running machine
///
/// MSRs are reached through `/dev/cpu/<N>/msr`, which executes the access
/// on the owning core; endpoints are opened per operation and never
/// retried. CPUID is executed with the calling thread temporarily pinned
/// to the anchor core so that repeated probes answer from the same
/// package.
#[derive(Debug)]
pub struct HostHardware {
    max_lcore: u32,
    anchor_lcore: u32,
}

impl HostHardware {
    /// Probe the platform and build the primitive layer
    ///
    /// `max_lcore` is the highest logical core id the topology reports;
    /// later MSR operations outside that range are rejected without
    /// touching a device.
    pub fn probe(max_lcore: u32) -> HwResult<Self> {
        cfg_if::cfg_if! {
            if #[cfg(all(target_arch = "x86_64", target_os = "linux"))] {
                if !std::path::Path::new("/dev/cpu").is_dir() {
                    log::error!("hw: /dev/cpu missing (is the msr driver loaded?)");
                    return Err(HwError::Unsupported);
                }
                log::debug!("hw: primitives ready, cores 0..={max_lcore}");
                Ok(Self {
                    max_lcore,
                    anchor_lcore: 0,
                })
            } else {
                let _ = max_lcore;
                log::error!("hw: x86-64 Linux required for CPUID/MSR access");
                Err(HwError::Unsupported)
            }
        }
    }

    /// Pick the core CPUID executes on (defaults to core 0)
    #[must_use]
    pub fn with_anchor(mut self, lcore: u32) -> Self {
        self.anchor_lcore = lcore;
        self
    }

    /// Highest logical core this layer was probed for
    #[inline]
    pub fn max_lcore(&self) -> u32 {
        self.max_lcore
    }

    fn check_lcore(&self, lcore: u32) -> HwResult<()> {
        if lcore > self.max_lcore {
            return Err(HwError::CoreOutOfRange {
                lcore,
                max_lcore: self.max_lcore,
            });
        }
        Ok(())
    }
}

/// Run a closure with the calling thread pinned to one core
///
/// The previous affinity mask is restored afterwards on a best-effort
/// basis.
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
fn with_affinity<T>(lcore: u32, f: impl FnOnce() -> T) -> HwResult<T> {
    use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let errno_to_io = |e: nix::errno::Errno| io::Error::from_raw_os_error(e as i32);
    let pid = Pid::from_raw(0);

    let previous = sched_getaffinity(pid).map_err(|e| HwError::Affinity {
        lcore,
        source: errno_to_io(e),
    })?;

    let mut target = CpuSet::new();
    target.set(lcore as usize).map_err(|e| HwError::Affinity {
        lcore,
        source: errno_to_io(e),
    })?;
    sched_setaffinity(pid, &target).map_err(|e| HwError::Affinity {
        lcore,
        source: errno_to_io(e),
    })?;

    let out = f();
    let _ = sched_setaffinity(pid, &previous);
    Ok(out)
}

impl Hardware for HostHardware {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> HwResult<CpuIdResult> {
        cfg_if::cfg_if! {
            if #[cfg(all(target_arch = "x86_64", target_os = "linux"))] {
                with_affinity(self.anchor_lcore, || {
                    crate::cpuid::cpuid_count(leaf, subleaf)
                })
            } else {
                let _ = (leaf, subleaf);
                Err(HwError::Unsupported)
            }
        }
    }

    fn msr_read(&self, lcore: u32, reg: u32) -> HwResult<u64> {
        self.check_lcore(lcore)?;
        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                let dev = crate::msr::MsrDevice::open(lcore)
                    .map_err(|source| HwError::DeviceOpen { lcore, source })?;
                dev.read(reg)
                    .map_err(|source| HwError::DeviceIo { lcore, reg, source })
            } else {
                let _ = reg;
                Err(HwError::Unsupported)
            }
        }
    }

    fn msr_write(&self, lcore: u32, reg: u32, value: u64) -> HwResult<()> {
        self.check_lcore(lcore)?;
        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                let dev = crate::msr::MsrDevice::open(lcore)
                    .map_err(|source| HwError::DeviceOpen { lcore, source })?;
                dev.write(reg, value)
                    .map_err(|source| HwError::DeviceIo { lcore, reg, source })
            } else {
                let _ = (reg, value);
                Err(HwError::Unsupported)
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_core_is_rejected_before_device_access() {
        let hw = HostHardware {
            max_lcore: 3,
            anchor_lcore: 0,
        };
        match hw.msr_read(4, crate::msr::addr::IA32_PQR_ASSOC) {
            Err(HwError::CoreOutOfRange { lcore: 4, max_lcore: 3 }) => {}
            other => panic!("expected CoreOutOfRange, got {other:?}"),
        }
        match hw.msr_write(100, crate::msr::addr::IA32_L3_QOS_CFG, 0) {
            Err(HwError::CoreOutOfRange { lcore: 100, .. }) => {}
            other => panic!("expected CoreOutOfRange, got {other:?}"),
        }
    }

    #[test]
    fn error_display_names_the_endpoint() {
        let err = HwError::DeviceIo {
            lcore: 2,
            reg: 0xC8F,
            source: io::Error::from_raw_os_error(5),
        };
        let text = err.to_string();
        assert!(text.contains("0xc8f"), "{text}");
        assert!(text.contains("core 2"), "{text}");
    }
}
