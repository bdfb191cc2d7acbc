use thiserror::Error;

pub type Result<T> = std::result::Result<T, FmvError>;

/// Errors surfaced by the engine's address-based entry points.
///
/// Lookup failures are fully recoverable and leave no state behind. Adapter
/// failures are outside this model: platform and architecture adapters are
/// expected to succeed or abort the process.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FmvError {
    #[error("no multiversioned function registered at {0:#x}")]
    UnknownFunction(usize),

    #[error("no tracked variable registered at {0:#x}")]
    UnknownVariable(usize),

    #[error("variable at {0:#x} is not tracked")]
    UntrackedVariable(usize),
}
