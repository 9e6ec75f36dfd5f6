//! Bridge error taxonomy
//!
//! Every failure a host can observe from the bridge is one of these
//! variants. `NameCollision` and `ImportFailure` are raised once per
//! failing path and then replayed from the module cache; `HostFailure`
//! is the unified signal for any uncontrolled interpreter error that
//! escapes an entry point. A capability-resolution miss is not an error
//! at all and is modeled as `Ok(None)`.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias for host-facing bridge operations
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Host-visible bridge failures
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// A logical module name is already bound to a different file
    #[error(
        "error loading plugin '{}': module name '{name}' has already been used by '{}'",
        .requested.display(),
        .existing.display()
    )]
    NameCollision {
        name: String,
        existing: PathBuf,
        requested: PathBuf,
    },

    /// The module import itself failed (syntax error, missing dependency,
    /// error at module top level, or a non-table module value)
    #[error("error importing plugin '{}':\n{trace}", .path.display())]
    ImportFailure { path: PathBuf, trace: String },

    /// An uncontrolled interpreter error escaped a bridge entry point
    #[error("plugin operation '{operation}' failed:\n{trace}")]
    HostFailure { operation: String, trace: String },

    /// A capability type was registered with a parent the host never declared
    #[error("unknown parent capability '{parent}' for '{name}'")]
    UnknownParent { name: String, parent: String },
}
