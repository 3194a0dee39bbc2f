//! Crate-wide error type.
//!
//! Every public operation returns [`Result`]. The variants follow the error
//! taxonomy of the engine: validation and conflict errors are reported before
//! any kernel state changes; kernel errors carry the name of the failing
//! operation so the caller can tell *what* broke, not just *that* it broke.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad flag, unknown name, port out of range, malformed argument.
    #[error("invalid argument: {0}")]
    Validation(String),

    /// Name in use, port in use, image still referenced.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no such {kind}: {name}")]
    NotFound { kind: &'static str, name: String },

    /// A syscall failed; `op` names the failing operation.
    #[error("{op}: {source}")]
    Kernel {
        op: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("storage: {0}")]
    Storage(String),

    #[error("network: {0}")]
    Network(String),

    #[error("cgroup: {0}")]
    Cgroup(String),

    #[error("image: {0}")]
    Image(String),

    #[error("no free ip address in subnet {0}")]
    SubnetExhausted(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn kernel(op: &'static str, source: nix::Error) -> Self {
        Error::Kernel { op, source }
    }

    pub(crate) fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }
}
