//! Scripted [`Hardware`] used by the engine's tests: CPUID answers come
//! from a table, MSRs from a register file keyed by (core, address).
//! Unscripted CPUID leaves read as zero, like unimplemented leaves on
//! real hardware; unscripted MSRs read as zero as well.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rdtk_hal::{CpuIdResult, Hardware, HwError, HwResult};

#[derive(Default)]
struct Inner {
    cpuid: Mutex<HashMap<(u32, u32), CpuIdResult>>,
    msrs: Mutex<HashMap<(u32, u32), u64>>,
    fail_writes: Mutex<Vec<(u32, u32)>>,
    fail_reads: Mutex<Vec<(u32, u32)>>,
    writes: Mutex<u32>,
}

/// Clones share the same scripted state, so a test can keep a handle for
/// inspection while the library owns another.
#[derive(Clone, Default)]
pub(crate) struct FakeHw {
    inner: Arc<Inner>,
}

impl FakeHw {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Script a CPUID answer, replacing any previous one
    pub(crate) fn set_cpuid(&self, leaf: u32, subleaf: u32, regs: CpuIdResult) {
        self.inner.cpuid.lock().unwrap().insert((leaf, subleaf), regs);
    }

    /// Script a CPUID answer by OR-ing into the existing one, so feature
    /// fixtures compose
    pub(crate) fn merge_cpuid(&self, leaf: u32, subleaf: u32, regs: CpuIdResult) {
        let mut table = self.inner.cpuid.lock().unwrap();
        let entry = table.entry((leaf, subleaf)).or_insert(CpuIdResult::zero());
        entry.eax |= regs.eax;
        entry.ebx |= regs.ebx;
        entry.ecx |= regs.ecx;
        entry.edx |= regs.edx;
    }

    /// Seed a register value
    pub(crate) fn set_msr(&self, lcore: u32, reg: u32, value: u64) {
        self.inner.msrs.lock().unwrap().insert((lcore, reg), value);
    }

    /// Current register value (zero when never written)
    pub(crate) fn msr(&self, lcore: u32, reg: u32) -> u64 {
        self.inner
            .msrs
            .lock()
            .unwrap()
            .get(&(lcore, reg))
            .copied()
            .unwrap_or(0)
    }

    /// Make one register's writes fail
    pub(crate) fn fail_msr_write(&self, lcore: u32, reg: u32) {
        self.inner.fail_writes.lock().unwrap().push((lcore, reg));
    }

    /// Make one register's reads fail
    #[allow(dead_code)]
    pub(crate) fn fail_msr_read(&self, lcore: u32, reg: u32) {
        self.inner.fail_reads.lock().unwrap().push((lcore, reg));
    }

    /// Number of MSR writes issued so far
    pub(crate) fn write_count(&self) -> u32 {
        *self.inner.writes.lock().unwrap()
    }

    fn io_err(lcore: u32, reg: u32) -> HwError {
        HwError::DeviceIo {
            lcore,
            reg,
            source: std::io::Error::from_raw_os_error(5),
        }
    }
}

impl Hardware for FakeHw {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> HwResult<CpuIdResult> {
        Ok(self
            .inner
            .cpuid
            .lock()
            .unwrap()
            .get(&(leaf, subleaf))
            .copied()
            .unwrap_or(CpuIdResult::zero()))
    }

    fn msr_read(&self, lcore: u32, reg: u32) -> HwResult<u64> {
        if self.inner.fail_reads.lock().unwrap().contains(&(lcore, reg)) {
            return Err(Self::io_err(lcore, reg));
        }
        Ok(self.msr(lcore, reg))
    }

    fn msr_write(&self, lcore: u32, reg: u32, value: u64) -> HwResult<()> {
        if self.inner.fail_writes.lock().unwrap().contains(&(lcore, reg)) {
            return Err(Self::io_err(lcore, reg));
        }
        *self.inner.writes.lock().unwrap() += 1;
        self.set_msr(lcore, reg, value);
        Ok(())
    }
}

/// Ready-made platform fragments for scenario tests
pub(crate) mod fixtures {
    use super::FakeHw;
    use rdtk_hal::cpuid::{leaf, CACHE_PARAMS_L3_SUBLEAF};
    use rdtk_hal::CpuIdResult;

    /// Event mask: occupancy only
    pub(crate) const MON_OCCUP_ONLY: u32 = 0b001;
    /// Event mask: occupancy + total + local bandwidth
    pub(crate) const MON_ALL_EVENTS: u32 = 0b111;

    /// 20-way, 10 MiB L3: 64-byte lines, one partition, 8192 sets
    pub(crate) fn add_l3_geometry(hw: &FakeHw) {
        hw.set_cpuid(
            leaf::CACHE_PARAMS,
            CACHE_PARAMS_L3_SUBLEAF,
            CpuIdResult {
                eax: 0,
                ebx: (19 << 22) | 63,
                ecx: 8191,
                edx: 0,
            },
        );
    }

    /// Monitoring: 128 RMIDs, scale factor 65536, the given event mask
    pub(crate) fn add_monitoring(hw: &FakeHw, events: u32) {
        hw.merge_cpuid(
            leaf::STRUCT_EXT_FEATURES,
            0,
            CpuIdResult {
                ebx: 1 << 12,
                ..CpuIdResult::zero()
            },
        );
        hw.set_cpuid(
            leaf::RDT_MONITOR,
            0,
            CpuIdResult {
                ebx: 127,
                edx: 1 << 1,
                ..CpuIdResult::zero()
            },
        );
        hw.set_cpuid(
            leaf::RDT_MONITOR,
            1,
            CpuIdResult {
                ebx: 65536,
                ecx: 127,
                edx: events,
                ..CpuIdResult::zero()
            },
        );
    }

    /// CAT via CPUID: 16 hardware classes, 20 ways, contention 0x600
    pub(crate) fn add_cat_cpuid(hw: &FakeHw, cdp_supported: bool) {
        hw.merge_cpuid(
            leaf::STRUCT_EXT_FEATURES,
            0,
            CpuIdResult {
                ebx: 1 << 15,
                ..CpuIdResult::zero()
            },
        );
        hw.set_cpuid(
            leaf::RDT_ALLOC,
            0,
            CpuIdResult {
                ebx: 1 << 1,
                ..CpuIdResult::zero()
            },
        );
        hw.set_cpuid(
            leaf::RDT_ALLOC,
            1,
            CpuIdResult {
                eax: 19,
                ebx: 0x600,
                ecx: if cdp_supported { 1 << 2 } else { 0 },
                edx: 15,
            },
        );
    }

    /// CAT via the brand-string fallback only
    pub(crate) fn add_cat_brand(hw: &FakeHw, brand: &str) {
        hw.set_cpuid(
            leaf::EXT_MAX,
            0,
            CpuIdResult {
                eax: leaf::BRAND_3,
                ..CpuIdResult::zero()
            },
        );
        let mut raw = [0u8; 48];
        raw[..brand.len()].copy_from_slice(brand.as_bytes());
        for (i, chunk) in raw.chunks(16).enumerate() {
            hw.set_cpuid(
                leaf::BRAND_1 + i as u32,
                0,
                CpuIdResult {
                    eax: u32::from_le_bytes(chunk[0..4].try_into().unwrap()),
                    ebx: u32::from_le_bytes(chunk[4..8].try_into().unwrap()),
                    ecx: u32::from_le_bytes(chunk[8..12].try_into().unwrap()),
                    edx: u32::from_le_bytes(chunk[12..16].try_into().unwrap()),
                },
            );
        }
    }
}
