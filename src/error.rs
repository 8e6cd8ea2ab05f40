use std::io;

/// Errors produced by the pod-network binding core.
///
/// `CriticalNetworkError` from the distilled design is not a separate variant
/// here; it is a property of *where* an error occurred rather than *what* it
/// is, so it is represented as a marker bit set via [`Error::into_critical`] at
/// the single Phase-1 call site that needs it (see `orchestrator::plug_phase1`).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("discovery failed for interface {iface}: {reason}")]
    Discovery { iface: String, reason: String },

    #[error("failed to prepare pod network interface {iface}: {reason}")]
    Prepare {
        iface: String,
        reason: String,
        critical: bool,
    },

    #[error("cache operation failed for interface {iface}: {reason}")]
    Cache { iface: String, reason: String },

    #[error("firewall programming failed for interface {iface}: {reason}")]
    Firewall { iface: String, reason: String },

    #[error("DHCP failed for interface {iface}: {reason}")]
    Dhcp { iface: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("binding variant not implemented: {0}")]
    NotImplemented(String),

    #[error("filesystem I/O: {0}")]
    Io(#[from] io::Error),

    #[error("(de)serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// Tag a failure as a `CriticalNetworkError`: a Phase-1 kernel mutation or
    /// cache-write failure occurring strictly after discovery completed.
    /// Signals to the caller that the sandbox is unusable.
    pub fn into_critical(self) -> Self {
        match self {
            Error::Prepare { iface, reason, .. } => Error::Prepare {
                iface,
                reason,
                critical: true,
            },
            other => other,
        }
    }

    /// Whether this error is a `CriticalNetworkError` per §7.
    pub fn is_critical(&self) -> bool {
        matches!(self, Error::Prepare { critical: true, .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
