//! # CAT/CDP Configurator
//!
//! The low-level register sequences behind allocation configuration
//! transitions. These mutate machine-global state affecting every process
//! on the host; they run only when the requested CDP state differs from
//! the observed one.
//!
//! Partial progress is never rolled back: an MSR failure mid-walk leaves
//! the machine in a mixed configuration, the log names the abort point,
//! and the caller must treat the platform's QoS state as undefined.

use rdtk_hal::msr::{addr, l3ca_mask_addr, L3QosCfg, PqrAssoc};
use rdtk_hal::{Hardware, HwError};

use crate::error::{Error, Result};
use crate::topology::CpuTopology;

// =============================================================================
// CAT RESET
// =============================================================================

/// Reset allocation state: every class mask opens all ways, every core
/// associates with class 0
///
/// Class mask registers exist once per socket and are written through one
/// representative core; the association register exists per logical core.
/// `num_classes` is the hardware class count (before any CDP halving).
pub(crate) fn cat_reset(
    hw: &dyn Hardware,
    topology: &CpuTopology,
    num_classes: u32,
    num_ways: u32,
) -> Result<()> {
    let ways_mask = (1u64 << num_ways) - 1;

    for socket in topology.sockets() {
        let Some(lcore) = topology.first_core_of_socket(socket) else {
            continue;
        };
        for class_id in 0..num_classes {
            hw.msr_write(lcore, l3ca_mask_addr(class_id), ways_mask)
                .map_err(|e| {
                    log::error!(
                        "alloc: CAT reset aborted at socket {socket} class {class_id}: {e}; \
                         machine left partially configured"
                    );
                    Error::Hardware(e)
                })?;
        }
    }

    for core in topology.cores() {
        let lcore = core.lcore;
        let assoc = hw
            .msr_read(lcore, addr::IA32_PQR_ASSOC)
            .map_err(|e| abort_assoc(lcore, e))?;
        hw.msr_write(
            lcore,
            addr::IA32_PQR_ASSOC,
            PqrAssoc(assoc).with_class_id(0).0,
        )
        .map_err(|e| abort_assoc(lcore, e))?;
    }

    log::info!(
        "alloc: CAT reset complete ({num_classes} classes, ways mask {ways_mask:#x})"
    );
    Ok(())
}

fn abort_assoc(lcore: u32, e: HwError) -> Error {
    log::error!(
        "alloc: CAT reset aborted at core {lcore} association: {e}; \
         machine left partially configured"
    );
    Error::Hardware(e)
}

// =============================================================================
// CDP ENABLE / DISABLE
// =============================================================================

/// Set or clear the CDP enable bit on every socket
pub(crate) fn cdp_enable(hw: &dyn Hardware, topology: &CpuTopology, on: bool) -> Result<()> {
    for socket in topology.sockets() {
        let Some(lcore) = topology.first_core_of_socket(socket) else {
            continue;
        };
        let raw = hw
            .msr_read(lcore, addr::IA32_L3_QOS_CFG)
            .map_err(|e| abort_cdp(socket, e))?;
        let mut cfg = L3QosCfg::from_bits_retain(raw);
        cfg.set(L3QosCfg::CDP_EN, on);
        hw.msr_write(lcore, addr::IA32_L3_QOS_CFG, cfg.bits())
            .map_err(|e| abort_cdp(socket, e))?;
    }

    log::info!("alloc: CDP {}", if on { "enabled" } else { "disabled" });
    Ok(())
}

fn abort_cdp(socket: u32, e: HwError) -> Error {
    log::error!("alloc: CDP transition aborted at socket {socket}: {e}");
    Error::Hardware(e)
}

// =============================================================================
// CDP STATE QUERY
// =============================================================================

/// Read the CDP enable bit from every socket
///
/// Sockets must agree; software will not force convergence, so a mixed
/// state is reported as a hardware error and the operator has to reboot.
pub(crate) fn cdp_is_enabled(hw: &dyn Hardware, topology: &CpuTopology) -> Result<bool> {
    let mut state: Option<bool> = None;

    for socket in topology.sockets() {
        let Some(lcore) = topology.first_core_of_socket(socket) else {
            continue;
        };
        let raw = hw.msr_read(lcore, addr::IA32_L3_QOS_CFG).map_err(|e| {
            log::error!("alloc: CDP state read failed on socket {socket}: {e}");
            Error::Hardware(e)
        })?;
        let enabled = L3QosCfg::from_bits_retain(raw).contains(L3QosCfg::CDP_EN);

        match state {
            None => state = Some(enabled),
            Some(prev) if prev != enabled => {
                log::error!(
                    "alloc: CDP enable differs across sockets; \
                     reboot the machine to converge the state"
                );
                return Err(Error::Hardware(HwError::Inconsistent {
                    reg: addr::IA32_L3_QOS_CFG,
                }));
            }
            Some(_) => {}
        }
    }

    Ok(state.unwrap_or(false))
}

// =============================================================================
// TESTS
// =============================================================================
