//! The commit/revert engine.
//!
//! Every public operation opens exactly one transaction, does its work, and
//! closes it, so page protections are restored and instruction caches are
//! flushed once per call rather than once per function.

use fmv_types::{CodeAddr, DataAddr};
use log::debug;

use crate::arch::ArchAdapter;
use crate::error::{FmvError, Result};
use crate::patch::{ApplyStrategy, PatchRecord, PatchSet};
use crate::platform::PlatformAdapter;
use crate::registry::{FnId, Registry, VarId, Variant, VariantSet};
use crate::select;
use crate::transaction::{Transaction, TransactionStats};

/// Outcome of committing or reverting a single function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    /// Patch points were rewritten and the active variant changed.
    Changed,
    /// The selected variant was already installed.
    Unchanged,
}

impl Commit {
    #[inline]
    pub fn changed(self) -> bool {
        matches!(self, Commit::Changed)
    }
}

/// Selects and installs variants for the functions in a [`Registry`].
///
/// The engine owns the registry and the three collaborator seams. It performs
/// no internal locking; callers must serialize concurrent commit/revert calls
/// and quiesce threads executing a function while it is being patched.
pub struct Engine<A, P, S> {
    registry: Registry,
    arch: A,
    platform: P,
    apply: S,
    last_stats: TransactionStats,
}

impl<A: ArchAdapter, P: PlatformAdapter, S: ApplyStrategy> Engine<A, P, S> {
    pub fn new(registry: Registry, arch: A, platform: P, apply: S) -> Self {
        Self {
            registry,
            arch,
            platform,
            apply,
            last_stats: TransactionStats::default(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn arch(&self) -> &A {
        &self.arch
    }

    pub fn arch_mut(&mut self) -> &mut A {
        &mut self.arch
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn strategy(&self) -> &S {
        &self.apply
    }

    pub fn strategy_mut(&mut self) -> &mut S {
        &mut self.apply
    }

    /// Page-cache counters of the most recently closed transaction.
    pub fn last_transaction_stats(&self) -> TransactionStats {
        self.last_stats
    }

    /// Commits the function registered at `function`: selects the variant
    /// matching the tracked variables' live values and installs it.
    pub fn commit(&mut self, function: CodeAddr) -> Result<Commit> {
        let id = self.lookup_fn(function)?;
        Ok(self.commit_fn(id))
    }

    /// [`Engine::commit`] for a captured handle.
    pub fn commit_fn(&mut self, id: FnId) -> Commit {
        self.with_transaction(|engine, txn| engine.commit_one(txn, id))
    }

    /// Re-commits every function referencing the variable at `variable`.
    /// Returns how many functions changed.
    pub fn commit_var(&mut self, variable: DataAddr) -> Result<usize> {
        let id = self.lookup_var(variable)?;
        Ok(self.commit_var_refs(id))
    }

    /// [`Engine::commit_var`] for a captured handle.
    pub fn commit_var_refs(&mut self, id: VarId) -> usize {
        self.with_transaction(|engine, txn| {
            let refs = engine.registry.variable(id).functions().to_vec();
            let mut changed = 0;
            for f in refs {
                if engine.commit_one(txn, f).changed() {
                    changed += 1;
                }
            }
            changed
        })
    }

    /// Commits every registered function, in registration order. Returns how
    /// many functions changed.
    pub fn commit_all(&mut self) -> usize {
        self.with_transaction(|engine, txn| {
            let ids: Vec<FnId> = engine.registry.fn_ids().collect();
            let mut changed = 0;
            for id in ids {
                if engine.commit_one(txn, id).changed() {
                    changed += 1;
                }
            }
            changed
        })
    }

    /// Forces the function registered at `function` back to its default body.
    pub fn revert(&mut self, function: CodeAddr) -> Result<Commit> {
        let id = self.lookup_fn(function)?;
        Ok(self.revert_fn(id))
    }

    /// [`Engine::revert`] for a captured handle.
    pub fn revert_fn(&mut self, id: FnId) -> Commit {
        self.with_transaction(|engine, txn| engine.install(txn, id, None))
    }

    /// Reverts every function referencing the variable at `variable`.
    pub fn revert_var(&mut self, variable: DataAddr) -> Result<usize> {
        let id = self.lookup_var(variable)?;
        Ok(self.revert_var_refs(id))
    }

    /// [`Engine::revert_var`] for a captured handle.
    pub fn revert_var_refs(&mut self, id: VarId) -> usize {
        self.with_transaction(|engine, txn| {
            let refs = engine.registry.variable(id).functions().to_vec();
            let mut changed = 0;
            for f in refs {
                if engine.install(txn, f, None).changed() {
                    changed += 1;
                }
            }
            changed
        })
    }

    /// Reverts every registered function.
    pub fn revert_all(&mut self) -> usize {
        self.with_transaction(|engine, txn| {
            let ids: Vec<FnId> = engine.registry.fn_ids().collect();
            let mut changed = 0;
            for id in ids {
                if engine.install(txn, id, None).changed() {
                    changed += 1;
                }
            }
            changed
        })
    }

    /// Whether the function registered at `function` currently has a variant
    /// installed.
    pub fn is_committed(&self, function: CodeAddr) -> Result<bool> {
        let id = self.lookup_fn(function)?;
        Ok(self.registry.function(id).active().is_some())
    }

    /// Marks whether the variable's live value is trusted for selection.
    ///
    /// The variable must be tracked. Binding only changes eligibility for
    /// future selections; it does not re-patch anything by itself — follow up
    /// with [`Engine::commit_var`].
    pub fn bind(&mut self, variable: DataAddr, bound: bool) -> Result<bool> {
        let id = self.lookup_var(variable)?;
        let var = self.registry.variable_mut(id);
        if !var.tracked() {
            return Err(FmvError::UntrackedVariable(variable.0));
        }
        var.bound = bound;
        Ok(var.bound)
    }

    /// Current bound flag of the variable at `variable`.
    pub fn is_bound(&self, variable: DataAddr) -> Result<bool> {
        let id = self.lookup_var(variable)?;
        Ok(self.registry.variable(id).bound())
    }

    fn lookup_fn(&self, function: CodeAddr) -> Result<FnId> {
        self.registry
            .lookup_fn(function)
            .ok_or(FmvError::UnknownFunction(function.0))
    }

    fn lookup_var(&self, variable: DataAddr) -> Result<VarId> {
        self.registry
            .lookup_var(variable)
            .ok_or(FmvError::UnknownVariable(variable.0))
    }

    fn with_transaction<R>(&mut self, body: impl FnOnce(&mut Self, &mut Transaction) -> R) -> R {
        let mut txn = Transaction::open();
        let result = body(self, &mut txn);
        self.last_stats = txn.close(&mut self.platform);
        result
    }

    /// Selects and installs the variant for one function.
    fn commit_one(&mut self, txn: &mut Transaction, id: FnId) -> Commit {
        let is_pointer = matches!(
            self.registry.function(id).variants(),
            VariantSet::FnPointer { .. }
        );
        let target = if is_pointer {
            // The synthetic variant mirrors the pointer slot and is always
            // the selection.
            self.refresh_synthetic(id);
            Some(0)
        } else {
            let function = self.registry.function(id);
            let VariantSet::Static(variants) = function.variants() else {
                unreachable!()
            };
            select::select_variant(&self.registry, variants)
        };
        self.install(txn, id, target)
    }

    /// Mirrors a function-pointer slot into the function's synthetic variant.
    ///
    /// A retargeted (or first-seen) body clears the active slot so the
    /// generic install path re-applies every patch point, and is handed to
    /// the architecture adapter for body analysis.
    fn refresh_synthetic(&mut self, id: FnId) {
        let function = self.registry.function_mut(id);
        let VariantSet::FnPointer { slot, synthetic } = &mut function.variants else {
            unreachable!("refresh_synthetic on a static function")
        };
        // Safety: the builder admits only slots that hold a live function
        // pointer for the process lifetime.
        let new_body = CodeAddr(unsafe { (slot.0 as *const usize).read_volatile() });

        let old_body = if function.active.is_some() {
            synthetic.as_ref().map(|v| v.body)
        } else {
            None
        };
        match synthetic.as_mut() {
            Some(v) => v.body = new_body,
            None => {
                *synthetic = Some(Variant {
                    body: new_body,
                    assignments: Vec::new(),
                })
            }
        }
        if old_body != Some(new_body) {
            function.active = None;
            self.arch
                .decode_variant_body(synthetic.as_ref().expect("synthetic variant just set"));
        }
    }

    /// Installs `target` as the active variant, rewriting every valid patch
    /// point and submitting the rewrite set as one batch.
    fn install(&mut self, txn: &mut Transaction, id: FnId, target: Option<u32>) -> Commit {
        if self.registry.function(id).active() == target {
            return Commit::Unchanged;
        }

        let mut set = PatchSet::default();
        let function = self.registry.function(id);
        for pp in function.patch_points() {
            if !pp.is_patchable() {
                continue;
            }
            let (from, to) = self.arch.patchpoint_extent(pp);
            debug_assert!(from.0 <= to.0);
            txn.ensure_writable_range(&mut self.platform, from, to);

            let mut bytes = Vec::with_capacity(to.0 - from.0);
            match target {
                Some(idx) => {
                    let variant = function.variant(idx);
                    self.arch.encode_apply(function, variant, pp, &mut bytes);
                }
                None => self.arch.encode_revert(pp, &mut bytes),
            }
            debug_assert_eq!(
                bytes.len(),
                to.0 - from.0,
                "adapter encoding length mismatch"
            );
            set.push(PatchRecord { pos: from, bytes });
        }

        for record in set.records() {
            debug!("patch: pos={:#x} len={}", record.pos.0, record.bytes.len());
        }
        self.apply.apply(&set);

        self.registry.function_mut(id).active = target;
        Commit::Changed
    }
}
