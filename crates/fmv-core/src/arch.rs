//! Architecture collaborator interface: byte-level patch-point encoding.

use fmv_types::CodeAddr;

use crate::registry::{Function, PatchPoint, Variant};

/// Encoding and decoding of individual patch points.
///
/// The engine never interprets machine code itself. It asks the adapter
/// which bytes a variant switch touches and for the replacement encodings;
/// the encodings land in a [`crate::PatchSet`] and reach memory through the
/// engine's [`crate::ApplyStrategy`].
pub trait ArchAdapter {
    /// `[from, to)` byte range rewritten when `pp` switches variants.
    fn patchpoint_extent(&self, pp: &PatchPoint) -> (CodeAddr, CodeAddr);

    /// Appends to `out` the encoding that redirects `pp` to `variant`'s body.
    ///
    /// Must append exactly the extent's `to - from` bytes.
    fn encode_apply(
        &mut self,
        function: &Function,
        variant: &Variant,
        pp: &PatchPoint,
        out: &mut Vec<u8>,
    );

    /// Appends to `out` the original (default-body) encoding of `pp`.
    ///
    /// Must append exactly the extent's `to - from` bytes.
    fn encode_revert(&mut self, pp: &PatchPoint, out: &mut Vec<u8>);

    /// Inspects a variant body before its first installation.
    ///
    /// Called for the synthetic variant of a function-pointer commit whenever
    /// the pointer retargets; static variants are decoded ahead of time by
    /// the build-time collaborator. Adapters keep any derived metadata on
    /// their side, keyed by body address.
    fn decode_variant_body(&mut self, variant: &Variant);
}
