//! Typed error taxonomy for the parts of the engine that hand errors to a
//! downstream `onFatalError` callback. Everything else stays `anyhow::Result`,
//! the same mix the teacher uses (stringly-typed RPC classification, contextual
//! `anyhow::Error` everywhere else).

use std::fmt;

/// The four categories from the error-handling design: configuration problems
/// are logged and skipped, transient RPC errors are retried, data invariant
/// violations and downstream handler errors stop the affected chain.
#[derive(Debug)]
pub enum SyncError {
    /// A configured filter/network disagrees with what the chain reports
    /// (e.g. unexpected `eth_chainId`). Logged, the chain does not start.
    ConfigMismatch(anyhow::Error),
    /// A reorg walked back further than `reorg_scan_depth` without finding a
    /// common ancestor, or a checkpoint/interval invariant was violated.
    DataInvariant(anyhow::Error),
    /// The downstream indexing function returned an error from its callback.
    Downstream(anyhow::Error),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::ConfigMismatch(e) => write!(f, "configuration mismatch: {e}"),
            SyncError::DataInvariant(e) => write!(f, "data invariant violated: {e}"),
            SyncError::Downstream(e) => write!(f, "downstream handler error: {e}"),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::ConfigMismatch(e) | SyncError::DataInvariant(e) | SyncError::Downstream(e) => {
                e.source()
            }
        }
    }
}
