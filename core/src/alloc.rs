//! # Allocation Runtime
//!
//! Class-of-service programming atop the discovered L3 CAT capability:
//! per-socket way masks and per-core class association.
//!
//! With CDP enabled each logical class owns a register pair: the data
//! mask at the even address, the code mask at the odd one.

use rdtk_hal::msr::{addr, l3ca_mask_addr, PqrAssoc};
use rdtk_hal::Hardware;

use crate::caps::{CapabilitySnapshot, L3CaCapability};
use crate::error::{Error, Result};
use crate::topology::CpuTopology;

// =============================================================================
// CLASS MASKS
// =============================================================================

/// Way masks of one class of service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassMask {
    /// CDP off: one mask covers code and data
    Unified(u64),
    /// CDP on: separate code and data masks
    CodeData {
        /// Ways granted to instruction fetches
        code: u64,
        /// Ways granted to data accesses
        data: u64,
    },
}

// =============================================================================
// SUBSYSTEM
// =============================================================================

/// Allocation subsystem state
#[derive(Debug)]
pub(crate) struct Allocation {
    cap: L3CaCapability,
    socket_reps: Vec<(u32, u32)>,
    lcores: Vec<u32>,
}

impl Allocation {
    /// Bring up allocation from the snapshot
    pub(crate) fn init(topology: &CpuTopology, snapshot: &CapabilitySnapshot) -> Result<Self> {
        let Some(cap) = snapshot.l3ca() else {
            log::debug!("alloc: no L3 allocation capability, subsystem stays down");
            return Err(Error::NotSupported);
        };
        let socket_reps = topology
            .sockets()
            .iter()
            .filter_map(|&s| topology.first_core_of_socket(s).map(|c| (s, c)))
            .collect();
        log::debug!(
            "alloc: subsystem up ({} classes x {} ways)",
            cap.num_classes,
            cap.num_ways
        );
        Ok(Self {
            cap: *cap,
            socket_reps,
            lcores: topology.cores().iter().map(|c| c.lcore).collect(),
        })
    }

    fn socket_rep(&self, socket: u32) -> Result<u32> {
        self.socket_reps
            .iter()
            .find(|&&(s, _)| s == socket)
            .map(|&(_, lcore)| lcore)
            .ok_or_else(|| {
                log::error!("alloc: socket {socket} is not part of the topology");
                Error::InvalidParam
            })
    }

    fn check_class(&self, class_id: u32) -> Result<()> {
        if class_id >= self.cap.num_classes {
            log::error!(
                "alloc: class {class_id} outside 0..{}",
                self.cap.num_classes
            );
            return Err(Error::InvalidParam);
        }
        Ok(())
    }

    /// A usable mask is non-empty, within the way range, and contiguous
    fn check_mask(&self, mask: u64) -> Result<()> {
        if mask == 0 || mask >= 1u64 << self.cap.num_ways {
            log::error!("alloc: mask {mask:#x} outside {} ways", self.cap.num_ways);
            return Err(Error::InvalidParam);
        }
        let shifted = mask >> mask.trailing_zeros();
        if shifted & (shifted + 1) != 0 {
            log::error!("alloc: mask {mask:#x} is not contiguous");
            return Err(Error::InvalidParam);
        }
        Ok(())
    }

    /// Program one class on one socket with a single mask
    ///
    /// With CDP on, code and data both receive `mask`.
    pub(crate) fn set_class_mask(
        &self,
        hw: &dyn Hardware,
        socket: u32,
        class_id: u32,
        mask: u64,
    ) -> Result<()> {
        self.set_class_masks(hw, socket, class_id, mask, mask)
    }

    /// Program one class on one socket with separate code and data masks
    ///
    /// Requires CDP to be enabled.
    pub(crate) fn set_class_masks_cdp(
        &self,
        hw: &dyn Hardware,
        socket: u32,
        class_id: u32,
        code: u64,
        data: u64,
    ) -> Result<()> {
        if !self.cap.cdp_on {
            log::error!("alloc: code/data masks need CDP enabled");
            return Err(Error::InvalidParam);
        }
        self.set_class_masks(hw, socket, class_id, code, data)
    }

    fn set_class_masks(
        &self,
        hw: &dyn Hardware,
        socket: u32,
        class_id: u32,
        code: u64,
        data: u64,
    ) -> Result<()> {
        self.check_class(class_id)?;
        self.check_mask(code)?;
        self.check_mask(data)?;
        let lcore = self.socket_rep(socket)?;

        if self.cap.cdp_on {
            hw.msr_write(lcore, l3ca_mask_addr(2 * class_id), data)
                .map_err(hw_err)?;
            hw.msr_write(lcore, l3ca_mask_addr(2 * class_id + 1), code)
                .map_err(hw_err)?;
        } else {
            hw.msr_write(lcore, l3ca_mask_addr(class_id), data)
                .map_err(hw_err)?;
        }
        Ok(())
    }

    /// Read one class's masks back from a socket
    pub(crate) fn class_mask(
        &self,
        hw: &dyn Hardware,
        socket: u32,
        class_id: u32,
    ) -> Result<ClassMask> {
        self.check_class(class_id)?;
        let lcore = self.socket_rep(socket)?;

        if self.cap.cdp_on {
            let data = hw
                .msr_read(lcore, l3ca_mask_addr(2 * class_id))
                .map_err(hw_err)?;
            let code = hw
                .msr_read(lcore, l3ca_mask_addr(2 * class_id + 1))
                .map_err(hw_err)?;
            Ok(ClassMask::CodeData { code, data })
        } else {
            let mask = hw
                .msr_read(lcore, l3ca_mask_addr(class_id))
                .map_err(hw_err)?;
            Ok(ClassMask::Unified(mask))
        }
    }

    /// Associate a core's accesses with a class of service, preserving
    /// its RMID
    pub(crate) fn assoc_set(&self, hw: &dyn Hardware, lcore: u32, class_id: u32) -> Result<()> {
        self.check_class(class_id)?;
        if !self.lcores.contains(&lcore) {
            log::error!("alloc: core {lcore} is not part of the topology");
            return Err(Error::InvalidParam);
        }

        let raw = hw.msr_read(lcore, addr::IA32_PQR_ASSOC).map_err(hw_err)?;
        hw.msr_write(
            lcore,
            addr::IA32_PQR_ASSOC,
            PqrAssoc(raw).with_class_id(class_id).0,
        )
        .map_err(hw_err)?;
        Ok(())
    }

    /// Read the class of service a core is associated with
    pub(crate) fn assoc_get(&self, hw: &dyn Hardware, lcore: u32) -> Result<u32> {
        if !self.lcores.contains(&lcore) {
            log::error!("alloc: core {lcore} is not part of the topology");
            return Err(Error::InvalidParam);
        }
        let raw = hw.msr_read(lcore, addr::IA32_PQR_ASSOC).map_err(hw_err)?;
        Ok(PqrAssoc(raw).class_id())
    }

    /// Tear down
    ///
    /// Programmed masks deliberately persist; only a CAT reset reverts
    /// them.
    pub(crate) fn fini(self) {
        log::debug!("alloc: subsystem down");
    }
}

fn hw_err(e: rdtk_hal::HwError) -> Error {
    log::error!("alloc: register access failed: {e}");
    Error::Hardware(e)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps;
    use crate::config::CdpConfig;
    use crate::testhw::{fixtures, FakeHw};
    use crate::topology::CoreInfo;

    fn topo() -> CpuTopology {
        CpuTopology::from_cores(vec![
            CoreInfo { lcore: 0, socket: 0, cluster: 0 },
            CoreInfo { lcore: 1, socket: 0, cluster: 0 },
            CoreInfo { lcore: 2, socket: 1, cluster: 0 },
        ])
        .unwrap()
    }

    fn setup(hw: &FakeHw, cdp: CdpConfig) -> Allocation {
        fixtures::add_l3_geometry(hw);
        fixtures::add_cat_cpuid(hw, true);
        let topo = topo();
        let snap = caps::discover(hw, &topo, cdp).unwrap();
        Allocation::init(&topo, &snap).unwrap()
    }

    #[test]
    fn init_requires_the_capability() {
        let hw = FakeHw::new();
        fixtures::add_l3_geometry(&hw);
        fixtures::add_monitoring(&hw, fixtures::MON_OCCUP_ONLY);
        let topo = topo();
        let snap = caps::discover(&hw, &topo, CdpConfig::Any).unwrap();
        assert!(matches!(
            Allocation::init(&topo, &snap),
            Err(Error::NotSupported)
        ));
    }

    #[test]
    fn unified_mask_programming() {
        let hw = FakeHw::new();
        let alloc = setup(&hw, CdpConfig::Any);

        alloc.set_class_mask(&hw, 1, 2, 0xF0).unwrap();
        assert_eq!(hw.msr(2, l3ca_mask_addr(2)), 0xF0);
        assert_eq!(
            alloc.class_mask(&hw, 1, 2).unwrap(),
            ClassMask::Unified(0xF0)
        );
    }

    #[test]
    fn cdp_mask_programming_uses_register_pairs() {
        let hw = FakeHw::new();
        let alloc = setup(&hw, CdpConfig::RequireOn);

        alloc.set_class_masks_cdp(&hw, 0, 3, 0x3, 0xFC).unwrap();
        // Logical class 3: data at even register 6, code at odd register 7.
        assert_eq!(hw.msr(0, l3ca_mask_addr(6)), 0xFC);
        assert_eq!(hw.msr(0, l3ca_mask_addr(7)), 0x3);
        assert_eq!(
            alloc.class_mask(&hw, 0, 3).unwrap(),
            ClassMask::CodeData { code: 0x3, data: 0xFC }
        );
    }

    #[test]
    fn cdp_split_masks_require_cdp() {
        let hw = FakeHw::new();
        let alloc = setup(&hw, CdpConfig::Any);
        assert!(matches!(
            alloc.set_class_masks_cdp(&hw, 0, 0, 0x1, 0x2),
            Err(Error::InvalidParam)
        ));
    }

    #[test]
    fn mask_validation() {
        let hw = FakeHw::new();
        let alloc = setup(&hw, CdpConfig::Any);

        // Empty.
        assert!(alloc.set_class_mask(&hw, 0, 0, 0).is_err());
        // Wider than 20 ways.
        assert!(alloc.set_class_mask(&hw, 0, 0, 1 << 20).is_err());
        // Non-contiguous.
        assert!(alloc.set_class_mask(&hw, 0, 0, 0b101).is_err());
        // Contiguous, in range.
        assert!(alloc.set_class_mask(&hw, 0, 0, 0b1110).is_ok());
    }

    #[test]
    fn class_range_depends_on_cdp() {
        let hw = FakeHw::new();
        let alloc = setup(&hw, CdpConfig::Any);
        // 16 hardware classes without CDP.
        assert!(alloc.set_class_mask(&hw, 0, 15, 0x1).is_ok());
        assert!(alloc.set_class_mask(&hw, 0, 16, 0x1).is_err());

        let hw = FakeHw::new();
        let alloc = setup(&hw, CdpConfig::RequireOn);
        // 8 logical classes with CDP on.
        assert!(alloc.set_class_mask(&hw, 0, 7, 0x1).is_ok());
        assert!(alloc.set_class_mask(&hw, 0, 8, 0x1).is_err());
    }

    #[test]
    fn class_association_preserves_rmid() {
        let hw = FakeHw::new();
        let alloc = setup(&hw, CdpConfig::Any);
        hw.set_msr(1, addr::IA32_PQR_ASSOC, PqrAssoc(0).with_rmid(9).0);

        alloc.assoc_set(&hw, 1, 4).unwrap();
        let reg = PqrAssoc(hw.msr(1, addr::IA32_PQR_ASSOC));
        assert_eq!(reg.class_id(), 4);
        assert_eq!(reg.rmid(), 9);
        assert_eq!(alloc.assoc_get(&hw, 1).unwrap(), 4);
    }

    #[test]
    fn unknown_socket_and_core_are_rejected() {
        let hw = FakeHw::new();
        let alloc = setup(&hw, CdpConfig::Any);
        assert!(alloc.set_class_mask(&hw, 7, 0, 0x1).is_err());
        assert!(alloc.assoc_set(&hw, 42, 0).is_err());
    }
}
