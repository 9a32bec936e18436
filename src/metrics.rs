//! Lightweight global metrics for StreamDb.
//!
//! Потокобезопасные атомарные счётчики для подсистем:
//! - Page cache (hits/misses)
//! - Allocator (fresh/reused/freed, rebuild)
//! - Root rotations и откаты на prior-слот
//! - Recovery (подобранные orphan-страницы)
//! - Path index (персист trie)

use std::sync::atomic::{AtomicU64, Ordering};

// ----- Page cache -----
static PAGE_CACHE_HITS: AtomicU64 = AtomicU64::new(0);
static PAGE_CACHE_MISSES: AtomicU64 = AtomicU64::new(0);

// ----- Allocator -----
static PAGES_ALLOCATED_FRESH: AtomicU64 = AtomicU64::new(0);
static PAGES_REUSED: AtomicU64 = AtomicU64::new(0);
static PAGES_FREED: AtomicU64 = AtomicU64::new(0);
static FREELIST_REBUILDS: AtomicU64 = AtomicU64::new(0);

// ----- Versioned links -----
static ROOT_ROTATIONS: AtomicU64 = AtomicU64::new(0);
static PRIOR_FALLBACKS: AtomicU64 = AtomicU64::new(0);

// ----- Recovery -----
static ORPHANS_RECLAIMED: AtomicU64 = AtomicU64::new(0);

// ----- Path index -----
static TRIE_PERSISTS: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub page_cache_hits: u64,
    pub page_cache_misses: u64,

    pub pages_allocated_fresh: u64,
    pub pages_reused: u64,
    pub pages_freed: u64,
    pub freelist_rebuilds: u64,

    pub root_rotations: u64,
    pub prior_fallbacks: u64,

    pub orphans_reclaimed: u64,

    pub trie_persists: u64,
}

impl MetricsSnapshot {
    pub fn cache_hit_ratio(&self) -> f64 {
        let total = self.page_cache_hits + self.page_cache_misses;
        if total == 0 {
            0.0
        } else {
            self.page_cache_hits as f64 / total as f64
        }
    }
}

pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        page_cache_hits: PAGE_CACHE_HITS.load(Ordering::Relaxed),
        page_cache_misses: PAGE_CACHE_MISSES.load(Ordering::Relaxed),
        pages_allocated_fresh: PAGES_ALLOCATED_FRESH.load(Ordering::Relaxed),
        pages_reused: PAGES_REUSED.load(Ordering::Relaxed),
        pages_freed: PAGES_FREED.load(Ordering::Relaxed),
        freelist_rebuilds: FREELIST_REBUILDS.load(Ordering::Relaxed),
        root_rotations: ROOT_ROTATIONS.load(Ordering::Relaxed),
        prior_fallbacks: PRIOR_FALLBACKS.load(Ordering::Relaxed),
        orphans_reclaimed: ORPHANS_RECLAIMED.load(Ordering::Relaxed),
        trie_persists: TRIE_PERSISTS.load(Ordering::Relaxed),
    }
}

#[inline]
pub fn record_cache_hit() {
    PAGE_CACHE_HITS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_cache_miss() {
    PAGE_CACHE_MISSES.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_page_fresh() {
    PAGES_ALLOCATED_FRESH.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_page_reused() {
    PAGES_REUSED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_page_freed() {
    PAGES_FREED.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_freelist_rebuild() {
    FREELIST_REBUILDS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_root_rotation() {
    ROOT_ROTATIONS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_prior_fallback() {
    PRIOR_FALLBACKS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn record_orphans_reclaimed(n: u64) {
    ORPHANS_RECLAIMED.fetch_add(n, Ordering::Relaxed);
}

#[inline]
pub fn record_trie_persist() {
    TRIE_PERSISTS.fetch_add(1, Ordering::Relaxed);
}
