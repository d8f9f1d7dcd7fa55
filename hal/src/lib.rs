//! # rdtk Hardware Access Layer
//!
//! The thin layer between the capability engine and the machine.
//!
//! ## Overview
//!
//! Everything the engine knows about the platform flows through two
//! primitives:
//!
//! - **CPUID**: feature enumeration ([`cpuid`] module)
//! - **MSR**: per-core control and counter registers ([`msr`] module)
//!
//! The [`Hardware`] trait bundles both behind one seam; [`HostHardware`]
//! implements it on the running machine, and the engine's tests implement
//! it over scripted register state.
//!
//! ## Register encodings
//!
//! CPUID leaf numbers and MSR field layouts are kept as data (named
//! constants and mask/shift tables) rather than inline shifts, so the
//! encodings can be tested in isolation.

pub mod cpuid;
pub mod hw;
pub mod msr;

pub use cpuid::{cpuid, cpuid_count, CpuIdResult, Vendor};
pub use hw::{Hardware, HostHardware, HwError, HwResult};
