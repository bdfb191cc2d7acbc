//! Unprotect-cache behavior observed through the engine, with tiny test
//! pages so a small image spans many of them.

use fmv_core::{Commit, Engine, RangeAssignment, Registry, RegistryBuilder, Variant};
use fmv_tests::{CodeImage, CountingApply, FakeArch, FakePlatform, PlatformEvent, VarCell};
use fmv_types::CodeAddr;

fn tiny_page_engine(
    registry: Registry,
    page_shift: u32,
) -> Engine<FakeArch, FakePlatform, CountingApply> {
    Engine::new(
        registry,
        FakeArch::new(),
        FakePlatform::with_page_shift(page_shift),
        CountingApply::new(),
    )
}

fn single_variant_function(
    builder: &mut RegistryBuilder,
    image: &CodeImage,
    config: &VarCell<u32>,
    offsets: &[usize],
) {
    let var = builder.variable(config.addr(), config.width(), true);
    builder.function(
        image.base(),
        vec![Variant {
            body: CodeAddr(0x5000),
            assignments: vec![RangeAssignment { var, lo: 0, hi: 0 }],
        }],
        image.call_points(offsets),
    );
}

#[test]
fn patch_points_sharing_a_page_unprotect_it_once() {
    // 64-byte pages: three patch points, one page.
    let image = CodeImage::new(64);
    let config = VarCell::new(0u32);
    let mut builder = RegistryBuilder::new();
    single_variant_function(&mut builder, &image, &config, &[0, 16, 32]);
    let mut engine = tiny_page_engine(builder.build(), 6);

    assert_eq!(engine.commit(image.base()), Ok(Commit::Changed));
    assert_eq!(engine.platform().unprotect_count(), 1);

    let stats = engine.last_transaction_stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.evictions, 0);
}

#[test]
fn more_pages_than_capacity_evict_the_coldest() {
    // 16-byte pages: twelve patch points on twelve distinct pages, two more
    // than the cache holds.
    let image = CodeImage::new(192);
    let config = VarCell::new(0u32);
    let offsets: Vec<usize> = (0..12).map(|i| i * 16).collect();
    let mut builder = RegistryBuilder::new();
    single_variant_function(&mut builder, &image, &config, &offsets);
    let mut engine = tiny_page_engine(builder.build(), 4);

    assert_eq!(engine.commit(image.base()), Ok(Commit::Changed));

    let stats = engine.last_transaction_stats();
    assert_eq!(stats.misses, 12);
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.evictions, 2);

    // The two coldest pages (the first two patched) were re-protected early.
    let base_page = image.base().0 >> 4;
    let early_protects: Vec<PlatformEvent> = engine
        .platform()
        .events()
        .iter()
        .copied()
        .filter(|e| matches!(e, PlatformEvent::Protect(_)))
        .take(2)
        .collect();
    assert_eq!(
        early_protects,
        vec![
            PlatformEvent::Protect(fmv_types::PageId(base_page)),
            PlatformEvent::Protect(fmv_types::PageId(base_page + 1)),
        ]
    );

    assert_eq!(engine.platform().unprotect_count(), 12);
    assert_eq!(engine.platform().flush_count(), 1);
    assert!(engine.platform().all_reprotected());
}

#[test]
fn extent_straddling_a_page_boundary_unprotects_both_pages() {
    // 16-byte pages: a pseudo call at offset 12 spans bytes 12..21.
    let image = CodeImage::new(32);
    let config = VarCell::new(0u32);
    let mut builder = RegistryBuilder::new();
    single_variant_function(&mut builder, &image, &config, &[12]);
    let mut engine = tiny_page_engine(builder.build(), 4);

    assert_eq!(engine.commit(image.base()), Ok(Commit::Changed));
    assert_eq!(engine.platform().unprotect_count(), 2);
    assert!(engine.platform().all_reprotected());
}

#[test]
fn pages_stay_writable_across_functions_within_one_bulk_call() {
    // Two functions whose patch points share one 64-byte page: the second
    // function's rewrite hits the cache instead of unprotecting again.
    let image = CodeImage::new(64);
    let config = VarCell::new(0u32);
    let mut builder = RegistryBuilder::new();
    let var = builder.variable(config.addr(), config.width(), true);
    for offset in [0usize, 16] {
        builder.function(
            image.addr(offset),
            vec![Variant {
                body: CodeAddr(0x5000 + offset),
                assignments: vec![RangeAssignment { var, lo: 0, hi: 0 }],
            }],
            image.call_points(&[offset]),
        );
    }
    let mut engine = tiny_page_engine(builder.build(), 6);

    assert_eq!(engine.commit_all(), 2);
    assert_eq!(engine.platform().unprotect_count(), 1);
    assert_eq!(engine.platform().flush_count(), 1);
    assert!(engine.platform().all_reprotected());
}
