//! Descriptor registry: functions, variants, patch points, tracked variables.
//!
//! The build-time collaborator discovers multiversioned functions and
//! variables and registers them here once, at startup, through
//! [`RegistryBuilder`]. Afterwards the registry is structurally immutable;
//! the engine only flips a function's active-variant slot and a variable's
//! bound flag. Everything is referenced through copyable index handles, so
//! descriptor lifetime is the registry's lifetime.

use fmv_types::{CodeAddr, DataAddr, VarValue, Width};
use rustc_hash::FxHashMap;

/// Handle to a registered function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FnId(pub(crate) u32);

/// Handle to a registered variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(pub(crate) u32);

/// One tracked process-global scalar.
#[derive(Debug)]
pub struct Variable {
    location: DataAddr,
    width: Width,
    tracked: bool,
    pub(crate) bound: bool,
    /// Functions with at least one assignment on this variable, in
    /// registration order.
    functions: Vec<FnId>,
}

impl Variable {
    #[inline]
    pub fn location(&self) -> DataAddr {
        self.location
    }

    #[inline]
    pub fn width(&self) -> Width {
        self.width
    }

    /// Whether the variable participates in multiversioning at all.
    #[inline]
    pub fn tracked(&self) -> bool {
        self.tracked
    }

    /// Whether the variable's live value is currently trusted for matching.
    #[inline]
    pub fn bound(&self) -> bool {
        self.bound
    }

    /// Functions that must be re-committed when this variable changes.
    #[inline]
    pub fn functions(&self) -> &[FnId] {
        &self.functions
    }
}

/// Inclusive value-range constraint of one variant on one variable.
#[derive(Debug, Clone)]
pub struct RangeAssignment {
    pub var: VarId,
    pub lo: VarValue,
    pub hi: VarValue,
}

/// One pre-compiled specialized function body.
///
/// A variant is a selection candidate only while every one of its assignments
/// holds; a variant with no assignments is always a candidate.
#[derive(Debug, Clone)]
pub struct Variant {
    pub body: CodeAddr,
    pub assignments: Vec<RangeAssignment>,
}

/// A function's variant list, or the function-pointer mode marker.
#[derive(Debug)]
pub enum VariantSet {
    /// Ordinary multiversioned function with a statically known variant list.
    Static(Vec<Variant>),
    /// Multiversioned function pointer: `slot` holds the live pointer value;
    /// the engine maintains one synthetic variant mirroring its target.
    FnPointer {
        slot: DataAddr,
        synthetic: Option<Variant>,
    },
}

/// Kind of a single patch point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    /// Direct call to the multiversioned function.
    Call,
    /// Tail jump / branch to the multiversioned function.
    Jump,
    /// Permanently skipped; the location is never rewritten.
    Invalid,
}

/// One rewritable location inside a function's machine code.
#[derive(Debug, Clone, Copy)]
pub struct PatchPoint {
    pub location: CodeAddr,
    pub kind: PatchKind,
}

impl PatchPoint {
    /// Invalid points and points with an unset location are skipped.
    #[inline]
    pub(crate) fn is_patchable(&self) -> bool {
        self.kind != PatchKind::Invalid && !self.location.is_null()
    }
}

/// One multiversioned call-site aggregate.
#[derive(Debug)]
pub struct Function {
    entry: CodeAddr,
    pub(crate) variants: VariantSet,
    patch_points: Vec<PatchPoint>,
    /// Index into the variant list; `None` means the default body is live.
    pub(crate) active: Option<u32>,
}

impl Function {
    #[inline]
    pub fn entry(&self) -> CodeAddr {
        self.entry
    }

    #[inline]
    pub fn variants(&self) -> &VariantSet {
        &self.variants
    }

    #[inline]
    pub fn patch_points(&self) -> &[PatchPoint] {
        &self.patch_points
    }

    /// Index of the currently installed variant, if any.
    #[inline]
    pub fn active(&self) -> Option<u32> {
        self.active
    }

    /// The currently installed variant, if any.
    pub fn active_variant(&self) -> Option<&Variant> {
        self.active.map(|idx| self.variant(idx))
    }

    pub(crate) fn variant(&self, idx: u32) -> &Variant {
        match &self.variants {
            VariantSet::Static(variants) => &variants[idx as usize],
            VariantSet::FnPointer { synthetic, .. } => synthetic
                .as_ref()
                .expect("active function-pointer variant missing"),
        }
    }
}

/// The descriptor tables, constructed once and handed to the engine.
#[derive(Debug)]
pub struct Registry {
    functions: Vec<Function>,
    variables: Vec<Variable>,
    fn_by_addr: FxHashMap<usize, FnId>,
    var_by_addr: FxHashMap<usize, VarId>,
}

impl Registry {
    /// Handle of the function registered at `entry`.
    pub fn lookup_fn(&self, entry: CodeAddr) -> Option<FnId> {
        self.fn_by_addr.get(&entry.0).copied()
    }

    /// Handle of the variable registered at `location`.
    pub fn lookup_var(&self, location: DataAddr) -> Option<VarId> {
        self.var_by_addr.get(&location.0).copied()
    }

    #[inline]
    pub fn function(&self, id: FnId) -> &Function {
        &self.functions[id.0 as usize]
    }

    #[inline]
    pub(crate) fn function_mut(&mut self, id: FnId) -> &mut Function {
        &mut self.functions[id.0 as usize]
    }

    #[inline]
    pub fn variable(&self, id: VarId) -> &Variable {
        &self.variables[id.0 as usize]
    }

    #[inline]
    pub(crate) fn variable_mut(&mut self, id: VarId) -> &mut Variable {
        &mut self.variables[id.0 as usize]
    }

    /// Every registered function handle, in registration order.
    pub fn fn_ids(&self) -> impl Iterator<Item = FnId> + '_ {
        (0..self.functions.len() as u32).map(FnId)
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn variable_count(&self) -> usize {
        self.variables.len()
    }
}

/// Builds the descriptor [`Registry`].
///
/// Registration order is selection order: later variants override earlier
/// candidates, and bulk commits walk functions in registration order.
///
/// The builder is also where invalid configuration dies: an unsupported
/// variable width or an assignment on an unregistered variable panics
/// immediately, since both signal a build-time defect rather than a runtime
/// condition.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    functions: Vec<Function>,
    variables: Vec<Variable>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a variable.
    ///
    /// `width_bytes` is the raw storage width out of the descriptor table and
    /// must be 1, 2 or 4. A tracked variable starts bound: its live value is
    /// trusted until `bind(var, false)`.
    pub fn variable(&mut self, location: DataAddr, width_bytes: usize, tracked: bool) -> VarId {
        let width = Width::from_bytes(width_bytes).unwrap_or_else(|| {
            panic!(
                "variable at {:#x} has unsupported width {width_bytes} (must be 1, 2 or 4 bytes)",
                location.0
            )
        });
        let id = VarId(self.variables.len() as u32);
        self.variables.push(Variable {
            location,
            width,
            tracked,
            bound: tracked,
            functions: Vec::new(),
        });
        id
    }

    /// Registers a function with a static variant list.
    pub fn function(
        &mut self,
        entry: CodeAddr,
        variants: Vec<Variant>,
        patch_points: Vec<PatchPoint>,
    ) -> FnId {
        let id = FnId(self.functions.len() as u32);
        for variant in &variants {
            for assignment in &variant.assignments {
                let var = self
                    .variables
                    .get_mut(assignment.var.0 as usize)
                    .unwrap_or_else(|| {
                        panic!(
                            "function at {:#x} references an unregistered variable",
                            entry.0
                        )
                    });
                if !var.functions.contains(&id) {
                    var.functions.push(id);
                }
            }
        }
        self.functions.push(Function {
            entry,
            variants: VariantSet::Static(variants),
            patch_points,
            active: None,
        });
        id
    }

    /// Registers a multiversioned function pointer.
    ///
    /// `slot` is the storage holding the live pointer value; each commit
    /// mirrors its current target into the function's synthetic variant.
    pub fn function_pointer(
        &mut self,
        entry: CodeAddr,
        slot: DataAddr,
        patch_points: Vec<PatchPoint>,
    ) -> FnId {
        let id = FnId(self.functions.len() as u32);
        self.functions.push(Function {
            entry,
            variants: VariantSet::FnPointer {
                slot,
                synthetic: None,
            },
            patch_points,
            active: None,
        });
        id
    }

    pub fn build(self) -> Registry {
        let fn_by_addr = self
            .functions
            .iter()
            .enumerate()
            .map(|(i, f)| (f.entry.0, FnId(i as u32)))
            .collect();
        let var_by_addr = self
            .variables
            .iter()
            .enumerate()
            .map(|(i, v)| (v.location.0, VarId(i as u32)))
            .collect();
        Registry {
            functions: self.functions,
            variables: self.variables,
            fn_by_addr,
            var_by_addr,
        }
    }
}
