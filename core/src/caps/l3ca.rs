//! # L3 Allocation Capability
//!
//! CAT discovery. Two paths, tried in order:
//!
//! 1. **CPUID**: leaf 0x7 advertises allocation, leaf 0x10 subleaf 0
//!    names the resources, leaf 0x10 subleaf 1 parameterizes the L3
//!    resource (classes, ways, contention mask, CDP support).
//! 2. **Brand string**: early platforms implement L3 CAT without
//!    enumerating it; a fixed allow-list of SKU substrings identifies
//!    them. Those platforms have four classes and no CDP.
//!
//! The cache geometry (ways, way size) always comes from the geometry
//! probe, independent of which path detected the feature.

use rdtk_hal::cpuid::{brand_string, brand_string_str, leaf};
use rdtk_hal::Hardware;

use crate::caps::L3Geometry;
use crate::error::{Error, Result};

// =============================================================================
// CAPABILITY
// =============================================================================

/// L3 Cache Allocation Technology capability
///
/// `num_classes` is the usable class count: the hardware count while CDP
/// is off, half of it while CDP is on (each logical class then pairs a
/// code and a data mask).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L3CaCapability {
    /// Usable classes of service
    pub num_classes: u32,
    /// Cache ways per class mask
    pub num_ways: u32,
    /// Bytes per way
    pub way_size: u32,
    /// Ways the platform reserves or prefers for other agents
    pub way_contention_mask: u64,
    /// Whether Code/Data Prioritization exists
    pub cdp_supported: bool,
    /// Whether Code/Data Prioritization is currently enabled
    pub cdp_on: bool,
}

/// Which path detected the capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DetectionPath {
    /// Enumerated through leaf 0x10
    Cpuid,
    /// Matched the brand-string allow-list
    BrandString,
}

// =============================================================================
// DISCOVERY
// =============================================================================

/// Leaf 0x7 subleaf 0 EBX bit: RDT allocation supported
const FEAT_EBX_PQE: u32 = 1 << 15;
/// Leaf 0x10 subleaf 0 EBX bit: L3 allocation resource id
const ALLOC_EBX_L3: u32 = 1 << 1;
/// Leaf 0x10 subleaf 1 ECX bit: CDP supported
const ALLOC_ECX_CDP: u32 = 1 << 2;

/// Class count on allow-listed platforms that predate enumeration
const BRAND_FALLBACK_CLASSES: u32 = 4;

/// SKUs known to implement L3 CAT without CPUID enumeration.
///
/// Frozen: matched as substrings of the 48-byte processor brand string.
const CAT_CAPABLE_BRANDS: &[&str] = &[
    "E5-2658 v3",
    "E5-2658A v3",
    "E5-2648L v3",
    "E5-2628L v3",
    "E5-2618L v3",
    "E5-2608L v3",
];

/// Discover the L3 allocation capability, or `None` when neither path
/// detects it (not an error by itself)
///
/// `cdp_on` is left `false` here; reconciliation against the machine
/// state happens in the capability engine once the configurator has been
/// consulted.
pub(crate) fn discover(
    hw: &dyn Hardware,
    geometry: &L3Geometry,
) -> Result<Option<(L3CaCapability, DetectionPath)>> {
    let features = hw.cpuid(leaf::STRUCT_EXT_FEATURES, 0).map_err(hw_err)?;
    if features.ebx & FEAT_EBX_PQE != 0 {
        let resources = hw.cpuid(leaf::RDT_ALLOC, 0).map_err(hw_err)?;
        let unknown = resources.ebx & !ALLOC_EBX_L3;
        if unknown != 0 {
            log::warn!("alloc: unsupported allocation resources advertised: {unknown:#x}");
        }
        if resources.ebx & ALLOC_EBX_L3 != 0 {
            let l3 = hw.cpuid(leaf::RDT_ALLOC, 1).map_err(hw_err)?;
            let cap = L3CaCapability {
                num_classes: l3.edx + 1,
                num_ways: l3.eax + 1,
                way_size: geometry.way_size,
                way_contention_mask: u64::from(l3.ebx),
                cdp_supported: l3.ecx & ALLOC_ECX_CDP != 0,
                cdp_on: false,
            };
            log::info!(
                "alloc: L3 CAT: {} classes, {} ways, cdp {}",
                cap.num_classes,
                cap.num_ways,
                if cap.cdp_supported { "supported" } else { "absent" }
            );
            return Ok(Some((cap, DetectionPath::Cpuid)));
        }
        log::debug!("alloc: allocation advertised without an L3 resource");
    }

    discover_by_brand(hw, geometry)
}

/// Brand-string fallback for platforms that implement CAT without
/// enumerating it
fn discover_by_brand(
    hw: &dyn Hardware,
    geometry: &L3Geometry,
) -> Result<Option<(L3CaCapability, DetectionPath)>> {
    let ext_max = hw.cpuid(leaf::EXT_MAX, 0).map_err(hw_err)?;
    if ext_max.eax < leaf::BRAND_3 {
        log::debug!("alloc: no brand string to match against");
        return Ok(None);
    }

    let parts = [
        hw.cpuid(leaf::BRAND_1, 0).map_err(hw_err)?,
        hw.cpuid(leaf::BRAND_2, 0).map_err(hw_err)?,
        hw.cpuid(leaf::BRAND_3, 0).map_err(hw_err)?,
    ];
    let Some(brand) = brand_string(parts) else {
        log::debug!("alloc: empty brand string");
        return Ok(None);
    };
    let brand = brand_string_str(&brand);

    if !CAT_CAPABLE_BRANDS.iter().any(|sku| brand.contains(sku)) {
        log::debug!("alloc: brand {brand:?} not in the CAT allow-list");
        return Ok(None);
    }

    log::info!("alloc: L3 CAT detected from brand string ({brand})");
    let cap = L3CaCapability {
        num_classes: BRAND_FALLBACK_CLASSES,
        num_ways: geometry.num_ways,
        way_size: geometry.way_size,
        way_contention_mask: 0,
        cdp_supported: false,
        cdp_on: false,
    };
    Ok(Some((cap, DetectionPath::BrandString)))
}

fn hw_err(e: rdtk_hal::HwError) -> Error {
    log::error!("alloc: capability probe failed: {e}");
    Error::Hardware(e)
}

// =============================================================================
// TESTS
// =============================================================================
