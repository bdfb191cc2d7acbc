//! Variant selection over live variable values.

use fmv_types::{VarValue, Width};

use crate::registry::{RangeAssignment, Registry, Variable, Variant};

/// Reads a variable's live value, widened to [`VarValue`].
///
/// Volatile because the storage is a process global mutated outside the
/// engine's knowledge.
pub(crate) fn read_variable(var: &Variable) -> VarValue {
    let addr = var.location().0;
    // Safety: the registry admits only variables whose location points at live
    // process storage of exactly `width` bytes for the process lifetime.
    unsafe {
        match var.width() {
            Width::W8 => (addr as *const u8).read_volatile() as VarValue,
            Width::W16 => (addr as *const u16).read_volatile() as VarValue,
            Width::W32 => (addr as *const u32).read_volatile() as VarValue,
        }
    }
}

fn assignment_holds(registry: &Registry, assignment: &RangeAssignment) -> bool {
    let var = registry.variable(assignment.var);
    // An assignment on an unbound variable disqualifies the variant; the
    // value is not even read.
    if !var.bound() {
        return false;
    }
    let value = read_variable(var);
    assignment.lo <= value && value <= assignment.hi
}

/// Picks the variant to install for a static variant list, or `None` if no
/// variant's assignments all hold.
///
/// Later candidates override earlier ones (last match wins), so callers
/// wanting priority must register variants in ascending priority order. The
/// pass is read-only.
pub(crate) fn select_variant(registry: &Registry, variants: &[Variant]) -> Option<u32> {
    let mut selected = None;
    for (idx, variant) in variants.iter().enumerate() {
        if variant
            .assignments
            .iter()
            .all(|assignment| assignment_holds(registry, assignment))
        {
            selected = Some(idx as u32);
        }
    }
    selected
}
