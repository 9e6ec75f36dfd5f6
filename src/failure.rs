//! Failure bridge
//!
//! The single place where raw interpreter errors become the host's
//! error contract. Every host-invoked entry point runs inside
//! [`guard`]: a deliberate bridge signal ([`BridgeError`]) propagates
//! unchanged, while any other interpreter error is formatted with
//! internal bridge frames stripped and re-raised as a unified
//! `HostFailure` carrying the operation name.

use crate::error::BridgeError;

/// Marker embedded in the chunk name of every internally generated
/// chunk. Traceback lines mentioning it are bridge plumbing, not
/// plugin code, and are removed before the host sees the trace.
pub(crate) const INTERNAL_CHUNK: &str = "[crucible]";

/// Intermediate failure inside an entry point: either a deliberate
/// bridge signal or an uncontrolled interpreter error.
#[derive(Debug)]
pub(crate) enum Fault {
    Signal(BridgeError),
    Interpreter(mlua::Error),
}

impl From<BridgeError> for Fault {
    fn from(err: BridgeError) -> Self {
        Fault::Signal(err)
    }
}

impl From<mlua::Error> for Fault {
    fn from(err: mlua::Error) -> Self {
        Fault::Interpreter(err)
    }
}

/// Wrap one host-invoked operation.
///
/// Result-type expectations are part of the same contract: a value that
/// converts to the wrong Lua type surfaces as a conversion error naming
/// the expected and actual types, which lands here like any other
/// interpreter error.
pub(crate) fn guard<T>(
    operation: &str,
    body: impl FnOnce() -> Result<T, Fault>,
) -> Result<T, BridgeError> {
    match body() {
        Ok(value) => Ok(value),
        Err(Fault::Signal(err)) => Err(err),
        Err(Fault::Interpreter(err)) => Err(BridgeError::HostFailure {
            operation: operation.to_string(),
            trace: format_trace(&err),
        }),
    }
}

/// Render an interpreter error chain with internal bridge frames removed.
///
/// Plugin authors should see their own stack, not the bridge's loader
/// chunks.
pub fn format_trace(err: &mlua::Error) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        parts.push(e.to_string());
        current = e.source();
    }

    let rendered = parts.join("\ncaused by: ");
    rendered
        .lines()
        .filter(|line| !line.contains(INTERNAL_CHUNK))
        .collect::<Vec<_>>()
        .join("\n")
}

/// One-line message for console error reporting.
///
/// Follows the error chain to its root cause and drops any appended
/// stack traceback, so one failed evaluation produces exactly one
/// concise line on the error sink.
pub fn brief_message(err: &mlua::Error) -> String {
    let mut root: &(dyn std::error::Error + 'static) = err;
    while let Some(source) = root.source() {
        root = source;
    }

    let message = root.to_string();
    let message = match message.find("\nstack traceback:") {
        Some(at) => &message[..at],
        None => &message[..],
    };
    message.trim_end().to_string()
}
