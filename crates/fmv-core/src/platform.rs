//! OS collaborator interface: page protection and instruction caches.

use fmv_types::{CodeAddr, PageId};

/// Page protection and instruction-cache control.
///
/// Implementations must succeed or abort the process; protection faults are
/// not part of the engine's error model. All calls happen inside one public
/// engine operation, so implementations may assume they run on a single
/// thread.
pub trait PlatformAdapter {
    /// Identifier of the page containing `addr`.
    fn page_of(&self, addr: CodeAddr) -> PageId;

    /// Makes `page` writable.
    fn unprotect(&mut self, page: PageId);

    /// Restores execute-only protection on `page`.
    fn protect(&mut self, page: PageId);

    /// Synchronizes instruction caches with patched bytes. Called once per
    /// public engine operation, after all pages are re-protected.
    fn flush_instruction_caches(&mut self);
}
