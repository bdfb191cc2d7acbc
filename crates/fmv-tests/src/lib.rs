//! Shared fixtures for exercising the engine against in-memory code.
//!
//! The fakes here stand in for the three external collaborators: a
//! [`FakeArch`] with a fixed-size pseudo-call encoding, a [`FakePlatform`]
//! recording every protection call, and a [`CountingApply`] strategy that
//! observes batch submissions while still writing bytes like the real
//! in-process strategy.

use std::collections::HashMap;

use fmv_core::{
    ApplyStrategy, ArchAdapter, DirectApply, Function, PatchKind, PatchPoint, PatchSet,
    PlatformAdapter, Variant,
};
use fmv_types::{CodeAddr, DataAddr, PageId};

/// Opcode byte of the pseudo call emitted by [`FakeArch`].
pub const CALL_OPCODE: u8 = 0xc5;

/// Encoded size of a pseudo call: opcode plus little-endian body address.
pub const CALL_LEN: usize = 1 + core::mem::size_of::<usize>();

/// Alignment of a [`CodeImage`] allocation. Page-aligned so platforms with
/// tiny test pages see deterministic page boundaries at fixed offsets.
const IMAGE_ALIGN: usize = 4096;

/// Heap-backed stand-in for a function's executable code.
///
/// The allocation is held through a raw pointer so the engine may patch it in
/// place through the addresses the fixture hands out; accessors reborrow it
/// only between engine calls.
pub struct CodeImage {
    ptr: *mut u8,
    len: usize,
}

impl CodeImage {
    /// A fresh image filled with a position-dependent byte pattern, so
    /// reverts can be checked byte for byte.
    pub fn new(len: usize) -> Self {
        assert!(len > 0, "image must not be empty");
        let layout = std::alloc::Layout::from_size_align(len, IMAGE_ALIGN).expect("image layout");
        // Safety: the layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        assert!(!ptr.is_null(), "image allocation failed");
        for i in 0..len {
            // Safety: i < len, inside the fresh allocation.
            unsafe { ptr.add(i).write(i as u8) };
        }
        Self { ptr, len }
    }

    /// Address of the byte at `offset`.
    pub fn addr(&self, offset: usize) -> CodeAddr {
        assert!(offset < self.len, "offset {offset} outside the image");
        CodeAddr(self.ptr as usize + offset)
    }

    /// Address of the first byte; used as the function's entry for lookup.
    pub fn base(&self) -> CodeAddr {
        self.addr(0)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &[u8] {
        // Safety: the allocation lives until drop and nothing writes to it
        // while this shared borrow is held.
        unsafe { core::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes().to_vec()
    }

    /// A `Call` patch point at each of `offsets`.
    pub fn call_points(&self, offsets: &[usize]) -> Vec<PatchPoint> {
        offsets
            .iter()
            .map(|&offset| PatchPoint {
                location: self.addr(offset),
                kind: PatchKind::Call,
            })
            .collect()
    }
}

impl Drop for CodeImage {
    fn drop(&mut self) {
        let layout =
            std::alloc::Layout::from_size_align(self.len, IMAGE_ALIGN).expect("image layout");
        // Safety: ptr was allocated in `new` with this exact layout.
        unsafe { std::alloc::dealloc(self.ptr, layout) };
    }
}

/// Target body encoded by the pseudo call at `offset`, or `None` if the
/// bytes there are not a pseudo call.
pub fn decode_call(image: &CodeImage, offset: usize) -> Option<CodeAddr> {
    let bytes = &image.bytes()[offset..offset + CALL_LEN];
    if bytes[0] != CALL_OPCODE {
        return None;
    }
    let mut raw = [0u8; core::mem::size_of::<usize>()];
    raw.copy_from_slice(&bytes[1..]);
    Some(CodeAddr(usize::from_le_bytes(raw)))
}

/// Heap cell standing in for a tracked process global (or a function-pointer
/// slot, as `VarCell<usize>`).
pub struct VarCell<T> {
    ptr: *mut T,
}

impl<T: Copy> VarCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            ptr: Box::into_raw(Box::new(value)),
        }
    }

    pub fn set(&self, value: T) {
        // Safety: the allocation lives until drop; reads/writes are volatile
        // because the engine reads it through its registered address.
        unsafe { self.ptr.write_volatile(value) }
    }

    pub fn get(&self) -> T {
        // Safety: as above.
        unsafe { self.ptr.read_volatile() }
    }

    pub fn addr(&self) -> DataAddr {
        DataAddr(self.ptr as usize)
    }

    /// Storage width in bytes, as the registry builder expects it.
    pub fn width(&self) -> usize {
        core::mem::size_of::<T>()
    }
}

impl<T> Drop for VarCell<T> {
    fn drop(&mut self) {
        // Safety: ptr came from `Box::into_raw`.
        unsafe { drop(Box::from_raw(self.ptr)) };
    }
}

/// Architecture adapter where every patch point is a fixed-size pseudo call.
///
/// Original bytes are captured the first time a point is patched so reverts
/// restore them exactly; a point reverted before ever being patched keeps
/// whatever is already there.
#[derive(Debug, Default)]
pub struct FakeArch {
    originals: HashMap<usize, Vec<u8>>,
    decoded: Vec<CodeAddr>,
}

impl FakeArch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bodies handed to `decode_variant_body`, in call order.
    pub fn decoded(&self) -> &[CodeAddr] {
        &self.decoded
    }

    fn current_bytes(pp: &PatchPoint) -> Vec<u8> {
        // Safety: fixture patch points always live inside a `CodeImage` that
        // outlives the engine call.
        unsafe { core::slice::from_raw_parts(pp.location.0 as *const u8, CALL_LEN) }.to_vec()
    }
}

impl ArchAdapter for FakeArch {
    fn patchpoint_extent(&self, pp: &PatchPoint) -> (CodeAddr, CodeAddr) {
        (pp.location, pp.location.offset(CALL_LEN))
    }

    fn encode_apply(
        &mut self,
        _function: &Function,
        variant: &Variant,
        pp: &PatchPoint,
        out: &mut Vec<u8>,
    ) {
        self.originals
            .entry(pp.location.0)
            .or_insert_with(|| Self::current_bytes(pp));
        out.push(CALL_OPCODE);
        out.extend_from_slice(&variant.body.0.to_le_bytes());
    }

    fn encode_revert(&mut self, pp: &PatchPoint, out: &mut Vec<u8>) {
        match self.originals.get(&pp.location.0) {
            Some(original) => out.extend_from_slice(original),
            None => out.extend_from_slice(&Self::current_bytes(pp)),
        }
    }

    fn decode_variant_body(&mut self, variant: &Variant) {
        self.decoded.push(variant.body);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformEvent {
    Unprotect(PageId),
    Protect(PageId),
    Flush,
}

/// Platform adapter that records every call it receives.
#[derive(Debug)]
pub struct FakePlatform {
    page_shift: u32,
    events: Vec<PlatformEvent>,
}

impl FakePlatform {
    /// Standard 4 KiB pages.
    pub fn new() -> Self {
        Self::with_page_shift(12)
    }

    /// Tiny pages make page-cache behavior observable with a small image.
    pub fn with_page_shift(page_shift: u32) -> Self {
        Self {
            page_shift,
            events: Vec::new(),
        }
    }

    pub fn events(&self) -> &[PlatformEvent] {
        &self.events
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    pub fn unprotect_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, PlatformEvent::Unprotect(_)))
            .count()
    }

    pub fn flush_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, PlatformEvent::Flush))
            .count()
    }

    /// Every page that was made writable has been re-protected.
    pub fn all_reprotected(&self) -> bool {
        let mut writable: HashMap<PageId, i64> = HashMap::new();
        for event in &self.events {
            match event {
                PlatformEvent::Unprotect(page) => *writable.entry(*page).or_default() += 1,
                PlatformEvent::Protect(page) => *writable.entry(*page).or_default() -= 1,
                PlatformEvent::Flush => {}
            }
        }
        writable.values().all(|&balance| balance == 0)
    }
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformAdapter for FakePlatform {
    fn page_of(&self, addr: CodeAddr) -> PageId {
        PageId(addr.0 >> self.page_shift)
    }

    fn unprotect(&mut self, page: PageId) {
        self.events.push(PlatformEvent::Unprotect(page));
    }

    fn protect(&mut self, page: PageId) {
        self.events.push(PlatformEvent::Protect(page));
    }

    fn flush_instruction_caches(&mut self) {
        self.events.push(PlatformEvent::Flush);
    }
}

/// Apply strategy that records batch sizes and delegates to [`DirectApply`].
#[derive(Debug, Default)]
pub struct CountingApply {
    inner: DirectApply,
    batches: Vec<usize>,
}

impl CountingApply {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record count of each submitted batch, in submission order.
    pub fn batches(&self) -> &[usize] {
        &self.batches
    }
}

impl ApplyStrategy for CountingApply {
    fn apply(&mut self, set: &PatchSet) {
        self.batches.push(set.len());
        self.inner.apply(set);
    }
}
