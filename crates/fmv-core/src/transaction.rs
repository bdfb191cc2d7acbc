//! Page-unprotect transaction: the scope across which touched code pages are
//! kept writable and batch-restored.

use std::num::NonZeroUsize;

use fmv_types::{CodeAddr, PageId};
use log::trace;
use lru::LruCache;

use crate::platform::PlatformAdapter;

/// Pages kept writable at once within one transaction.
const UNPROTECT_CACHE_PAGES: usize = 10;

/// Counters for one transaction's page-cache behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// An MRU-first cache of pages currently made writable.
///
/// Patch points of one function usually share a page, so caching unprotected
/// pages amortizes the protect/unprotect cycles across the whole commit
/// instead of paying them per patch point. Closing the transaction restores
/// protection on every cached page and flushes instruction caches once.
pub(crate) struct Transaction {
    unprotected: LruCache<PageId, ()>,
    stats: TransactionStats,
}

impl Transaction {
    pub(crate) fn open() -> Self {
        Self {
            unprotected: LruCache::new(
                NonZeroUsize::new(UNPROTECT_CACHE_PAGES).expect("capacity is non-zero"),
            ),
            stats: TransactionStats::default(),
        }
    }

    /// Makes the page containing `addr` writable.
    ///
    /// A cached page is promoted to most-recently-used without a platform
    /// call; a new page is unprotected and inserted, evicting (and
    /// re-protecting) the least-recently-used page if the cache is full.
    pub(crate) fn ensure_writable<P: PlatformAdapter>(&mut self, platform: &mut P, addr: CodeAddr) {
        let page = platform.page_of(addr);
        if self.unprotected.get(&page).is_some() {
            self.stats.hits += 1;
            return;
        }
        self.stats.misses += 1;
        platform.unprotect(page);
        if self.unprotected.len() == UNPROTECT_CACHE_PAGES {
            let (coldest, ()) = self.unprotected.pop_lru().expect("cache is full");
            trace!("unprotect cache full, re-protecting {coldest:?}");
            platform.protect(coldest);
            self.stats.evictions += 1;
        }
        self.unprotected.put(page, ());
    }

    /// Makes every page overlapping `[from, to)` writable.
    pub(crate) fn ensure_writable_range<P: PlatformAdapter>(
        &mut self,
        platform: &mut P,
        from: CodeAddr,
        to: CodeAddr,
    ) {
        self.ensure_writable(platform, from);
        if to.0 > from.0 {
            let last = CodeAddr(to.0 - 1);
            // Supported patch extents touch at most two pages.
            if platform.page_of(last) != platform.page_of(from) {
                self.ensure_writable(platform, last);
            }
        }
    }

    /// Restores protection on every cached page, then flushes instruction
    /// caches.
    pub(crate) fn close<P: PlatformAdapter>(self, platform: &mut P) -> TransactionStats {
        for (page, _) in self.unprotected.iter() {
            platform.protect(*page);
        }
        platform.flush_instruction_caches();
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Unprotect(usize),
        Protect(usize),
        Flush,
    }

    /// 16-byte pages so a handful of addresses spans many pages.
    struct RecordingPlatform {
        events: Vec<Event>,
    }

    impl RecordingPlatform {
        fn new() -> Self {
            Self { events: Vec::new() }
        }

        fn unprotects(&self) -> usize {
            self.events
                .iter()
                .filter(|e| matches!(e, Event::Unprotect(_)))
                .count()
        }
    }

    impl PlatformAdapter for RecordingPlatform {
        fn page_of(&self, addr: CodeAddr) -> PageId {
            PageId(addr.0 >> 4)
        }
        fn unprotect(&mut self, page: PageId) {
            self.events.push(Event::Unprotect(page.0));
        }
        fn protect(&mut self, page: PageId) {
            self.events.push(Event::Protect(page.0));
        }
        fn flush_instruction_caches(&mut self) {
            self.events.push(Event::Flush);
        }
    }

    fn page(n: usize) -> CodeAddr {
        CodeAddr(n << 4)
    }

    #[test]
    fn shared_page_is_unprotected_once() {
        let mut platform = RecordingPlatform::new();
        let mut txn = Transaction::open();
        txn.ensure_writable(&mut platform, CodeAddr(0x100));
        txn.ensure_writable(&mut platform, CodeAddr(0x105));
        txn.ensure_writable(&mut platform, CodeAddr(0x10f));
        let stats = txn.close(&mut platform);

        assert_eq!(platform.unprotects(), 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 0);
    }

    #[test]
    fn overflow_evicts_least_recently_used_first() {
        let mut platform = RecordingPlatform::new();
        let mut txn = Transaction::open();
        for n in 0..UNPROTECT_CACHE_PAGES {
            txn.ensure_writable(&mut platform, page(n));
        }
        platform.events.clear();

        txn.ensure_writable(&mut platform, page(100));
        // Page 0 was the coldest entry; it is re-protected to make room.
        assert_eq!(
            platform.events,
            vec![Event::Unprotect(100), Event::Protect(0)]
        );
    }

    #[test]
    fn retouching_promotes_without_redundant_unprotect() {
        let mut platform = RecordingPlatform::new();
        let mut txn = Transaction::open();
        for n in 0..UNPROTECT_CACHE_PAGES {
            txn.ensure_writable(&mut platform, page(n));
        }
        // Touch page 0 again: a hit, no platform call, now most-recently-used.
        platform.events.clear();
        txn.ensure_writable(&mut platform, page(0));
        assert!(platform.events.is_empty());

        // The next insertion evicts page 1, not the promoted page 0.
        txn.ensure_writable(&mut platform, page(100));
        assert_eq!(
            platform.events,
            vec![Event::Unprotect(100), Event::Protect(1)]
        );
        let stats = txn.close(&mut platform);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, UNPROTECT_CACHE_PAGES as u64 + 1);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn close_reprotects_all_cached_pages_then_flushes() {
        let mut platform = RecordingPlatform::new();
        let mut txn = Transaction::open();
        txn.ensure_writable(&mut platform, page(1));
        txn.ensure_writable(&mut platform, page(2));
        platform.events.clear();
        txn.close(&mut platform);

        let (flush, protects) = platform.events.split_last().unwrap();
        assert_eq!(*flush, Event::Flush);
        let mut protected: Vec<usize> = protects
            .iter()
            .map(|e| match e {
                Event::Protect(p) => *p,
                other => panic!("unexpected event before flush: {other:?}"),
            })
            .collect();
        protected.sort_unstable();
        assert_eq!(protected, vec![1, 2]);
    }

    #[test]
    fn range_straddling_a_page_boundary_touches_both_pages() {
        let mut platform = RecordingPlatform::new();
        let mut txn = Transaction::open();
        txn.ensure_writable_range(&mut platform, CodeAddr(0x1e), CodeAddr(0x23));
        assert_eq!(platform.unprotects(), 2);

        // Entirely inside one page: a single unprotect.
        let mut platform = RecordingPlatform::new();
        let mut txn2 = Transaction::open();
        txn2.ensure_writable_range(&mut platform, CodeAddr(0x40), CodeAddr(0x45));
        assert_eq!(platform.unprotects(), 1);
    }
}
