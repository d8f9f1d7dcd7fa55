//! # Library Configuration
//!
//! Caller-owned settings read once during [`crate::Rdtk::init`].

use std::path::PathBuf;

use crate::topology::CoreInfo;

// =============================================================================
// CDP REQUEST
// =============================================================================

/// Requested Code/Data Prioritization state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CdpConfig {
    /// Accept whatever state the hardware is in (observe only)
    #[default]
    Any,
    /// CDP must end up enabled; a transition is performed if needed
    RequireOn,
    /// CDP must end up disabled; a transition is performed if needed
    RequireOff,
}

// =============================================================================
// LOGGING
// =============================================================================

/// Log destination
#[derive(Debug, Clone, Default)]
pub enum LogSink {
    /// Standard error
    #[default]
    Stderr,
    /// Append to a file
    File(PathBuf),
}

/// Log sink and verbosity settings
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Where messages go
    pub sink: LogSink,
    /// Promote debug-level detail into the sink
    pub verbose: bool,
}

// =============================================================================
// TOP-LEVEL CONFIG
// =============================================================================

/// Library configuration
///
/// `topology` bypasses platform enumeration when supplied; the descriptor
/// is trusted apart from structural validation (non-empty, unique core
/// ids), which happens during init.
#[derive(Debug, Default)]
pub struct Config {
    /// Requested CDP state
    pub cdp: CdpConfig,
    /// Caller-supplied core descriptors, or `None` to enumerate the
    /// platform
    pub topology: Option<Vec<CoreInfo>>,
    /// Log sink and verbosity
    pub log: LogConfig,
}
