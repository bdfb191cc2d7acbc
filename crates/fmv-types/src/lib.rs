//! Plain shared types for the fmv crates.
//!
//! Kept dependency-free so the core engine, adapter implementations, and test
//! fixtures can all use these without pulling anything else in.

use core::fmt;

/// Storage width of a tracked variable.
///
/// Only 1-, 2- and 4-byte scalars participate in multiversioning; any other
/// width in a descriptor table is a build/toolchain defect, rejected at
/// registry construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Width {
    W8,
    W16,
    W32,
}

impl Width {
    /// Width in bytes.
    #[inline]
    pub const fn bytes(self) -> usize {
        match self {
            Width::W8 => 1,
            Width::W16 => 2,
            Width::W32 => 4,
        }
    }

    /// Maps a descriptor-table byte count to a width.
    ///
    /// Returns `None` for any count other than 1, 2 or 4.
    #[inline]
    pub const fn from_bytes(bytes: usize) -> Option<Width> {
        match bytes {
            1 => Some(Width::W8),
            2 => Some(Width::W16),
            4 => Some(Width::W32),
            _ => None,
        }
    }
}

/// Value of a tracked variable, widened from its storage width.
pub type VarValue = u64;

/// Address of a data object: a tracked variable or a function-pointer slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataAddr(pub usize);

impl fmt::Debug for DataAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataAddr({:#x})", self.0)
    }
}

/// Address inside executable code: a function entry or a patch point.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeAddr(pub usize);

impl CodeAddr {
    /// The unset location. Patch points carrying it are skipped permanently.
    pub const NULL: CodeAddr = CodeAddr(0);

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `delta` bytes past `self`.
    #[inline]
    pub const fn offset(self, delta: usize) -> CodeAddr {
        CodeAddr(self.0 + delta)
    }
}

impl fmt::Debug for CodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodeAddr({:#x})", self.0)
    }
}

/// Opaque page identifier handed out by the platform adapter.
///
/// The engine never interprets it; equality is all that matters for the
/// unprotect cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId(pub usize);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_round_trips_through_bytes() {
        for width in [Width::W8, Width::W16, Width::W32] {
            assert_eq!(Width::from_bytes(width.bytes()), Some(width));
        }
    }

    #[test]
    fn width_rejects_unsupported_counts() {
        for bytes in [0, 3, 5, 8, 16] {
            assert_eq!(Width::from_bytes(bytes), None);
        }
    }

    #[test]
    fn null_code_addr() {
        assert!(CodeAddr::NULL.is_null());
        assert!(!CodeAddr(0x1000).is_null());
        assert_eq!(CodeAddr(0x1000).offset(5), CodeAddr(0x1005));
    }
}
