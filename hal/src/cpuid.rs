//! # CPUID Access
//!
//! Raw CPUID execution and decoding helpers for the capability engine.
//!
//! ## Overview
//!
//! CPUID is the primary mechanism for detecting the QoS features this
//! library manages. This module provides:
//!
//! - Raw CPUID access (leaf / subleaf)
//! - The leaf numbers the engine probes
//! - Vendor identification
//! - Processor brand-string assembly
//!
//! Only the leaves the capability engine actually consumes are named here;
//! arbitrary leaves can still be executed through [`cpuid_count`].

// In inline assembly, we intentionally use rbx with a 32-bit output
// since we save/restore the full register but only use the lower bits
#![cfg_attr(target_arch = "x86_64", allow(asm_sub_register))]

// =============================================================================
// RAW CPUID ACCESS
// =============================================================================

/// Raw CPUID result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct CpuIdResult {
    /// EAX register value
    pub eax: u32,
    /// EBX register value
    pub ebx: u32,
    /// ECX register value
    pub ecx: u32,
    /// EDX register value
    pub edx: u32,
}

impl CpuIdResult {
    /// Create a zeroed result
    pub const fn zero() -> Self {
        Self {
            eax: 0,
            ebx: 0,
            ecx: 0,
            edx: 0,
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        use core::arch::asm;

        /// Execute CPUID with an explicit subleaf
        ///
        /// # Arguments
        /// * `leaf` - CPUID leaf (EAX input)
        /// * `subleaf` - CPUID subleaf (ECX input)
        ///
        /// # Returns
        /// Raw CPUID result with EAX, EBX, ECX, EDX values
        #[inline]
        pub fn cpuid_count(leaf: u32, subleaf: u32) -> CpuIdResult {
            let (eax, ebx, ecx, edx): (u32, u32, u32, u32);
            unsafe {
                asm!(
                    "mov {tmp}, rbx",
                    "cpuid",
                    "xchg {tmp}, rbx",
                    tmp = out(reg) ebx,
                    inout("eax") leaf => eax,
                    inout("ecx") subleaf => ecx,
                    out("edx") edx,
                    options(nomem, nostack, preserves_flags)
                );
            }
            CpuIdResult { eax, ebx, ecx, edx }
        }
    } else {
        /// Execute CPUID with an explicit subleaf
        ///
        /// Stub for non-x86-64 targets so the crate still builds; always
        /// returns a zeroed result, which the engine reports as
        /// "not supported".
        #[inline]
        pub fn cpuid_count(_leaf: u32, _subleaf: u32) -> CpuIdResult {
            CpuIdResult::zero()
        }
    }
}

/// Execute CPUID with subleaf 0
#[inline]
pub fn cpuid(leaf: u32) -> CpuIdResult {
    cpuid_count(leaf, 0)
}

// =============================================================================
// CPUID LEAVES
// =============================================================================

/// CPUID leaf numbers probed by the capability engine
pub mod leaf {
    /// Basic CPUID Information (vendor, max leaf)
    pub const VENDOR: u32 = 0x00;
    /// Deterministic Cache Parameters
    pub const CACHE_PARAMS: u32 = 0x04;
    /// Structured Extended Feature Flags
    pub const STRUCT_EXT_FEATURES: u32 = 0x07;
    /// Intel RDT Monitoring
    pub const RDT_MONITOR: u32 = 0x0F;
    /// Intel RDT Allocation
    pub const RDT_ALLOC: u32 = 0x10;

    /// Extended Maximum Input Value
    pub const EXT_MAX: u32 = 0x8000_0000;
    /// Processor Brand String (part 1)
    pub const BRAND_1: u32 = 0x8000_0002;
    /// Processor Brand String (part 2)
    pub const BRAND_2: u32 = 0x8000_0003;
    /// Processor Brand String (part 3)
    pub const BRAND_3: u32 = 0x8000_0004;
}

/// Subleaf of [`leaf::CACHE_PARAMS`] describing the L3 cache
pub const CACHE_PARAMS_L3_SUBLEAF: u32 = 0x3;

// =============================================================================
// VENDOR IDENTIFICATION
// =============================================================================

/// CPU vendor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    /// Intel Corporation
    Intel,
    /// Advanced Micro Devices
    Amd,
    /// Unknown vendor
    Unknown([u8; 12]),
}

impl Vendor {
    /// Intel vendor string
    const INTEL: &'static [u8] = b"GenuineIntel";
    /// AMD vendor string
    const AMD: &'static [u8] = b"AuthenticAMD";

    /// Parse vendor from the leaf 0 CPUID result
    pub fn from_cpuid(result: CpuIdResult) -> Self {
        let mut vendor = [0u8; 12];
        vendor[0..4].copy_from_slice(&result.ebx.to_le_bytes());
        vendor[4..8].copy_from_slice(&result.edx.to_le_bytes());
        vendor[8..12].copy_from_slice(&result.ecx.to_le_bytes());

        if vendor == *Self::INTEL {
            Vendor::Intel
        } else if vendor == *Self::AMD {
            Vendor::Amd
        } else {
            Vendor::Unknown(vendor)
        }
    }

    /// Get vendor string
    pub fn as_str(&self) -> &str {
        match self {
            Vendor::Intel => "GenuineIntel",
            Vendor::Amd => "AuthenticAMD",
            Vendor::Unknown(bytes) => core::str::from_utf8(bytes).unwrap_or("Unknown"),
        }
    }
}

// =============================================================================
// BRAND STRING
// =============================================================================

/// Length of the processor brand string in bytes
pub const BRAND_STRING_LEN: usize = 48;

/// Assemble the 48-byte processor brand string from three CPUID results
///
/// The three results must come from leaves 0x80000002..0x80000004 in order.
/// Returns `None` when the extended leaves are not implemented (all-zero
/// first result).
pub fn brand_string(parts: [CpuIdResult; 3]) -> Option<[u8; BRAND_STRING_LEN]> {
    if parts[0] == CpuIdResult::zero() {
        return None;
    }

    let mut brand = [0u8; BRAND_STRING_LEN];
    for (i, part) in parts.iter().enumerate() {
        let base = i * 16;
        brand[base..base + 4].copy_from_slice(&part.eax.to_le_bytes());
        brand[base + 4..base + 8].copy_from_slice(&part.ebx.to_le_bytes());
        brand[base + 8..base + 12].copy_from_slice(&part.ecx.to_le_bytes());
        brand[base + 12..base + 16].copy_from_slice(&part.edx.to_le_bytes());
    }
    Some(brand)
}

/// View a brand string as trimmed UTF-8
///
/// Drops the NUL padding and surrounding whitespace the hardware pads
/// the string with.
pub fn brand_string_str(brand: &[u8; BRAND_STRING_LEN]) -> &str {
    let end = brand.iter().position(|&b| b == 0).unwrap_or(brand.len());
    core::str::from_utf8(&brand[..end])
        .unwrap_or("")
        .trim_matches(' ')
}

// =============================================================================
// TESTS
// =============================================================================
