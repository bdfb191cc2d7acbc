//! Runtime function multiversioning: the commit/revert/patch engine.
//!
//! A multiversioned function ships with several pre-compiled variants of its
//! body, each valid for a value range of one or more tracked global
//! variables. Committing a function picks the variant matching the variables'
//! live values and rewrites the function's call sites in executable memory so
//! control flow reaches that variant directly; reverting restores the
//! default body. Both happen in the running process, without recompilation.
//!
//! This crate provides:
//!
//! - [`Registry`] / [`RegistryBuilder`]: the descriptor tables (functions,
//!   variants, patch points, tracked variables), built once at startup by the
//!   build-time collaborator and referenced through stable handles
//! - [`Engine`]: commit/revert for one function, for every function
//!   referencing a variable, or for all functions; variable binding
//! - [`PatchSet`] + [`ApplyStrategy`]: one function's rewrite set, submitted
//!   to executable memory as a single batch ([`DirectApply`] writes
//!   in-process)
//! - [`ArchAdapter`] / [`PlatformAdapter`]: the seams to the
//!   architecture-specific patch-point encoding and the OS page-protection /
//!   instruction-cache primitives
//!
//! The engine performs no internal locking: concurrent commits, or a commit
//! racing a thread executing the function being patched, must be serialized
//! by the caller.

mod arch;
mod engine;
mod error;
mod patch;
mod platform;
mod registry;
mod select;
mod transaction;

pub use arch::ArchAdapter;
pub use engine::{Commit, Engine};
pub use error::{FmvError, Result};
pub use patch::{ApplyStrategy, DirectApply, PatchRecord, PatchSet};
pub use platform::PlatformAdapter;
pub use registry::{
    FnId, Function, PatchKind, PatchPoint, RangeAssignment, Registry, RegistryBuilder, VarId,
    Variable, Variant, VariantSet,
};
pub use transaction::TransactionStats;
