//! Process-wide scope configuration.
//!
//! Configuration only changes how the engine reports misuse; it never changes
//! scoping semantics. Install it once at startup, before the first context is
//! opened:
//!
//! ```
//! use taskscope::config::{MisorderedDrop, ScopeConfig};
//!
//! let config = ScopeConfig::new()
//!     .with_report_unfired_callbacks(false)
//!     .with_misordered_drop(MisorderedDrop::Log);
//! assert!(!config.report_unfired_callbacks());
//! ```

use std::sync::OnceLock;

static INSTALLED: OnceLock<ScopeConfig> = OnceLock::new();
static DEFAULT: ScopeConfig = ScopeConfig::new();

/// What to do when a [`Context`](crate::Context) handle is dropped while it
/// is not the innermost open context.
///
/// The stack is never modified in that case; this only selects how loudly the
/// violation is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MisorderedDrop {
    /// Emit an `error`-level log event.
    #[default]
    Log,
    /// Panic, unless the thread is already unwinding.
    Panic,
}

/// Scope engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeConfig {
    /// Warn when a context closes with destruction callbacks that never ran.
    report_unfired_callbacks: bool,
    /// Handling of out-of-order drops.
    misordered_drop: MisorderedDrop,
}

impl ScopeConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            report_unfired_callbacks: true,
            misordered_drop: MisorderedDrop::Log,
        }
    }

    /// Sets whether closing a context with pending destruction callbacks logs
    /// a warning.
    #[must_use]
    pub const fn with_report_unfired_callbacks(mut self, enabled: bool) -> Self {
        self.report_unfired_callbacks = enabled;
        self
    }

    /// Sets how out-of-order handle drops are reported.
    #[must_use]
    pub const fn with_misordered_drop(mut self, policy: MisorderedDrop) -> Self {
        self.misordered_drop = policy;
        self
    }

    /// Returns whether unfired destruction callbacks are reported on close.
    #[must_use]
    pub const fn report_unfired_callbacks(&self) -> bool {
        self.report_unfired_callbacks
    }

    /// Returns the out-of-order drop policy.
    #[must_use]
    pub const fn misordered_drop(&self) -> MisorderedDrop {
        self.misordered_drop
    }

    /// Installs this configuration for the whole process.
    ///
    /// Only the first call succeeds.
    pub fn install(self) -> Result<(), ConfigError> {
        INSTALLED
            .set(self)
            .map_err(|_| ConfigError::AlreadyInstalled)
    }

    /// Returns the installed configuration, or the defaults.
    #[must_use]
    pub fn current() -> &'static Self {
        INSTALLED.get().unwrap_or(&DEFAULT)
    }
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors raised while configuring the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A configuration was already installed for this process.
    #[error("scope configuration is already installed")]
    AlreadyInstalled,
}
