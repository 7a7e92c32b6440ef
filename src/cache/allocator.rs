//! Tiered page allocator: placement, migration, and eviction.
//!
//! The allocator is the central coordinator for the tiered cache. It:
//! - carves virtual ranges out of per-tier monotonic cursors
//! - tracks every page's tier, recency, access count, and hotness
//! - promotes pages into L1, evicting strict-LRU victims to make room
//! - demotes pages to L3, writing Modified data back through the coherence
//!   manager first
//!
//! Lock order: allocation cursors, then page table. Tier changes are mirrored
//! into the coherence directory so the page tier and the directory tier of
//! its lines never diverge.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::page::{page_align, pages_for, Page, PageState, Tier};
use crate::coherence::CoherenceManager;
use crate::config::TierConfig;

const VIRTUAL_BASE: u64 = 0x1_0000_0000;
const PHYSICAL_BASE_L1: u64 = 0x80_0000_0000;
const PHYSICAL_BASE_L2: u64 = 0x100_0000_0000;
const PHYSICAL_BASE_L3: u64 = 0x200_0000_0000;

#[derive(Error, Debug)]
pub enum AllocError {
    #[error("zero-byte allocation")]
    ZeroSize,

    #[error("allocation of {bytes} bytes does not fit in any tier")]
    Exhausted { bytes: u64 },
}

/// Allocator statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocatorStats {
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub l3_accesses: u64,
    pub migrations_l1_to_l3: u64,
    pub migrations_l3_to_l1: u64,
}

impl AllocatorStats {
    pub fn l1_hit_rate(&self) -> f64 {
        let total = self.l1_hits + self.l1_misses;
        if total > 0 {
            self.l1_hits as f64 / total as f64
        } else {
            0.0
        }
    }

    pub fn l2_hit_rate(&self) -> f64 {
        let total = self.l2_hits + self.l2_misses;
        if total > 0 {
            self.l2_hits as f64 / total as f64
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct AllocationInfo {
    num_pages: u64,
    layer_id: u32,
}

#[derive(Debug, Default)]
struct Cursors {
    next_virtual: u64,
    next_physical_l1: u64,
    next_physical_l2: u64,
    next_physical_l3: u64,
}

#[derive(Debug, Default)]
struct PageTable {
    pages: HashMap<u64, Page>,
    l1_pages: Vec<u64>,
    l2_pages: Vec<u64>,
    l3_pages: Vec<u64>,
    /// L1 recency list, most recently used last. Contains exactly the set of
    /// pages currently in L1.
    l1_lru: Vec<u64>,
    allocations: HashMap<u64, AllocationInfo>,
}

impl PageTable {
    fn tier_list(&mut self, tier: Tier) -> &mut Vec<u64> {
        match tier {
            Tier::L1 => &mut self.l1_pages,
            Tier::L2 => &mut self.l2_pages,
            Tier::L3 => &mut self.l3_pages,
        }
    }

    fn tier_page_count(&self, tier: Tier) -> usize {
        match tier {
            Tier::L1 => self.l1_pages.len(),
            Tier::L2 => self.l2_pages.len(),
            Tier::L3 => self.l3_pages.len(),
        }
    }

    fn touch_lru(&mut self, virtual_addr: u64) {
        self.l1_lru.retain(|&va| va != virtual_addr);
        self.l1_lru.push(virtual_addr);
    }
}

/// The tiered page allocator.
pub struct TieredAllocator {
    config: TierConfig,
    coherence: Arc<CoherenceManager>,
    cursors: Mutex<Cursors>,
    table: Mutex<PageTable>,
    stats: Mutex<AllocatorStats>,
    clock: AtomicU64,
}

impl TieredAllocator {
    pub fn new(config: TierConfig, coherence: Arc<CoherenceManager>) -> Self {
        Self {
            config,
            coherence,
            cursors: Mutex::new(Cursors {
                next_virtual: VIRTUAL_BASE,
                next_physical_l1: PHYSICAL_BASE_L1,
                next_physical_l2: PHYSICAL_BASE_L2,
                next_physical_l3: PHYSICAL_BASE_L3,
            }),
            table: Mutex::new(PageTable::default()),
            stats: Mutex::new(AllocatorStats::default()),
            clock: AtomicU64::new(0),
        }
    }

    pub fn page_size(&self) -> u64 {
        self.config.page_size
    }

    /// The coherence manager this allocator writes back through.
    pub fn coherence(&self) -> &CoherenceManager {
        &self.coherence
    }

    fn lock_table(&self) -> MutexGuard<'_, PageTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_stats(&self) -> MutexGuard<'_, AllocatorStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn capacity(&self, tier: Tier) -> u64 {
        match tier {
            Tier::L1 => self.config.l1_capacity,
            Tier::L2 => self.config.l2_capacity,
            Tier::L3 => self.config.l3_capacity,
        }
    }

    fn can_fit(&self, table: &PageTable, tier: Tier, bytes: u64) -> bool {
        let used = table.tier_page_count(tier) as u64 * self.config.page_size;
        used + bytes <= self.capacity(tier)
    }

    /// Allocate a contiguous virtual range of whole pages.
    ///
    /// A preferred-L1 request that does not fit L1 falls back to L3 whole,
    /// never L2 (reserved for prefetch landings), and never split across
    /// tiers.
    /// L3 exhaustion is the only hard failure.
    pub fn allocate(
        &self,
        bytes: u64,
        layer_id: u32,
        preferred_tier: Tier,
    ) -> Result<u64, AllocError> {
        if bytes == 0 {
            return Err(AllocError::ZeroSize);
        }

        let num_pages = pages_for(bytes, self.config.page_size);
        let required = num_pages * self.config.page_size;

        let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        let mut table = self.lock_table();

        let tier = match preferred_tier {
            tier if self.can_fit(&table, tier, required) => tier,
            Tier::L3 => return Err(AllocError::Exhausted { bytes }),
            _ => {
                if !self.can_fit(&table, Tier::L3, required) {
                    return Err(AllocError::Exhausted { bytes });
                }
                Tier::L3
            }
        };

        let virtual_base = cursors.next_virtual;
        cursors.next_virtual += required;

        let physical_cursor = match tier {
            Tier::L1 => &mut cursors.next_physical_l1,
            Tier::L2 => &mut cursors.next_physical_l2,
            Tier::L3 => &mut cursors.next_physical_l3,
        };
        let physical_base = *physical_cursor;
        *physical_cursor += required;

        for i in 0..num_pages {
            let va = virtual_base + i * self.config.page_size;
            let pa = physical_base + i * self.config.page_size;
            table.pages.insert(va, Page::new(va, pa, tier, layer_id));
            table.tier_list(tier).push(va);
            if tier == Tier::L1 {
                table.l1_lru.push(va);
            }
        }

        table.allocations.insert(
            virtual_base,
            AllocationInfo {
                num_pages,
                layer_id,
            },
        );

        debug!(
            virtual_base = %format_args!("{virtual_base:#x}"),
            num_pages,
            tier = %tier,
            layer = layer_id,
            "allocated range"
        );

        Ok(virtual_base)
    }

    /// Release every page of the allocation rooted at `virtual_base`.
    /// Unknown bases are a no-op. The coherence directory is deliberately
    /// untouched; stale entries are overwritten on the next touch of the
    /// same line.
    pub fn deallocate(&self, virtual_base: u64) {
        let mut table = self.lock_table();
        let Some(info) = table.allocations.remove(&virtual_base) else {
            return;
        };

        for i in 0..info.num_pages {
            let va = virtual_base + i * self.config.page_size;
            if let Some(page) = table.pages.remove(&va) {
                table.tier_list(page.tier).retain(|&p| p != va);
                if page.tier == Tier::L1 {
                    table.l1_lru.retain(|&p| p != va);
                }
            }
        }

        debug!(
            virtual_base = %format_args!("{virtual_base:#x}"),
            num_pages = info.num_pages,
            layer = info.layer_id,
            "deallocated range"
        );
    }

    /// Physical address for `virtual_addr`, or 0 when the page is unknown.
    pub fn translate_va_to_pa(&self, virtual_addr: u64) -> u64 {
        let table = self.lock_table();
        let page_addr = page_align(virtual_addr, self.config.page_size);
        match table.pages.get(&page_addr) {
            Some(page) => page.physical_addr + (virtual_addr - page_addr),
            None => 0,
        }
    }

    pub fn is_in_tier(&self, virtual_addr: u64, tier: Tier) -> bool {
        let table = self.lock_table();
        let page_addr = page_align(virtual_addr, self.config.page_size);
        table
            .pages
            .get(&page_addr)
            .map(|p| p.tier == tier)
            .unwrap_or(false)
    }

    /// Pull the page covering `virtual_addr` into L1, evicting strict-LRU
    /// victims until it fits. Returns false for unknown pages and when
    /// eviction cannot free enough space.
    pub fn promote_to_l1(&self, virtual_addr: u64) -> bool {
        let mut table = self.lock_table();
        let page_addr = page_align(virtual_addr, self.config.page_size);

        let old_tier = match table.pages.get(&page_addr) {
            Some(page) => page.tier,
            None => return false,
        };
        if old_tier == Tier::L1 {
            table.touch_lru(page_addr);
            return true;
        }

        while !self.can_fit(&table, Tier::L1, self.config.page_size) {
            let Some(&victim) = table.l1_lru.first() else {
                return false;
            };
            if !self.demote_locked(&mut table, victim) {
                warn!(
                    victim = %format_args!("{victim:#x}"),
                    "eviction writeback failed, promotion aborted"
                );
                return false;
            }
        }

        table.tier_list(old_tier).retain(|&p| p != page_addr);
        table.l1_pages.push(page_addr);
        table.touch_lru(page_addr);
        if let Some(page) = table.pages.get_mut(&page_addr) {
            page.tier = Tier::L1;
        }

        self.coherence
            .set_tier_range(page_addr, self.config.page_size, Tier::L1);

        if old_tier == Tier::L3 {
            self.lock_stats().migrations_l3_to_l1 += 1;
        }

        debug!(
            page = %format_args!("{page_addr:#x}"),
            from = %old_tier,
            "promoted page to L1"
        );
        true
    }

    /// Retire the page covering `virtual_addr` to L3, writing Modified data
    /// back first. Returns false for unknown pages or a failed writeback.
    pub fn demote_to_l3(&self, virtual_addr: u64) -> bool {
        let mut table = self.lock_table();
        let page_addr = page_align(virtual_addr, self.config.page_size);

        let tier = match table.pages.get(&page_addr) {
            Some(page) => page.tier,
            None => return false,
        };
        if tier == Tier::L3 {
            return true;
        }
        self.demote_locked(&mut table, page_addr)
    }

    /// Demotion body shared by the public call and LRU eviction; assumes the
    /// page exists and is not already L3.
    fn demote_locked(&self, table: &mut PageTable, page_addr: u64) -> bool {
        let (old_tier, state) = match table.pages.get(&page_addr) {
            Some(page) => (page.tier, page.state),
            None => return false,
        };

        if state == PageState::Modified {
            if let Err(e) = self
                .coherence
                .writeback_range(page_addr, self.config.page_size)
            {
                warn!(
                    page = %format_args!("{page_addr:#x}"),
                    error = %e,
                    "writeback before demotion failed"
                );
                return false;
            }
            if let Some(page) = table.pages.get_mut(&page_addr) {
                page.state = PageState::Shared;
            }
        }

        table.tier_list(old_tier).retain(|&p| p != page_addr);
        if old_tier == Tier::L1 {
            table.l1_lru.retain(|&p| p != page_addr);
        }
        table.l3_pages.push(page_addr);
        if let Some(page) = table.pages.get_mut(&page_addr) {
            page.tier = Tier::L3;
        }

        self.coherence
            .set_tier_range(page_addr, self.config.page_size, Tier::L3);

        if old_tier == Tier::L1 {
            self.lock_stats().migrations_l1_to_l3 += 1;
        }

        debug!(
            page = %format_args!("{page_addr:#x}"),
            from = %old_tier,
            "demoted page to L3"
        );
        true
    }

    /// Mark the page's state mirror Invalid.
    pub fn invalidate_page(&self, virtual_addr: u64) {
        let mut table = self.lock_table();
        let page_addr = page_align(virtual_addr, self.config.page_size);
        if let Some(page) = table.pages.get_mut(&page_addr) {
            page.state = PageState::Invalid;
        }
    }

    /// Mark the page's state mirror Modified.
    pub fn mark_modified(&self, virtual_addr: u64) {
        let mut table = self.lock_table();
        let page_addr = page_align(virtual_addr, self.config.page_size);
        if let Some(page) = table.pages.get_mut(&page_addr) {
            page.state = PageState::Modified;
        }
    }

    /// Page-level state mirror; Invalid for unknown pages.
    pub fn page_state(&self, virtual_addr: u64) -> PageState {
        let table = self.lock_table();
        let page_addr = page_align(virtual_addr, self.config.page_size);
        table
            .pages
            .get(&page_addr)
            .map(|p| p.state)
            .unwrap_or(PageState::Invalid)
    }

    /// Record an access: bump the saturating counter, stamp the clock,
    /// classify tier hit/miss counters, refresh L1 recency.
    pub fn update_access_tracking(&self, virtual_addr: u64) {
        let mut table = self.lock_table();
        let page_addr = page_align(virtual_addr, self.config.page_size);
        let tick = self.tick();

        let Some(page) = table.pages.get_mut(&page_addr) else {
            return;
        };
        page.access_count = page.access_count.saturating_add(1);
        page.last_access_time = tick;
        let tier = page.tier;

        {
            let mut stats = self.lock_stats();
            match tier {
                Tier::L1 => stats.l1_hits += 1,
                Tier::L2 => {
                    stats.l2_hits += 1;
                    stats.l1_misses += 1;
                }
                Tier::L3 => {
                    stats.l3_accesses += 1;
                    stats.l1_misses += 1;
                    stats.l2_misses += 1;
                }
            }
        }

        if tier == Tier::L1 {
            table.touch_lru(page_addr);
        }
    }

    /// Update and return the page's hot flag.
    pub fn is_hot_page(&self, virtual_addr: u64) -> bool {
        let mut table = self.lock_table();
        let page_addr = page_align(virtual_addr, self.config.page_size);
        match table.pages.get_mut(&page_addr) {
            Some(page) => {
                page.is_hot = page.access_count > self.config.hot_threshold;
                page.is_hot
            }
            None => false,
        }
    }

    /// Bytes resident in a tier. Authoritative for capacity accounting.
    pub fn tier_usage(&self, tier: Tier) -> u64 {
        self.lock_table().tier_page_count(tier) as u64 * self.config.page_size
    }

    /// The L1 recency list, least recently used first. Test observability.
    pub fn l1_lru_snapshot(&self) -> Vec<u64> {
        self.lock_table().l1_lru.clone()
    }

    /// Number of live pages across all tiers.
    pub fn page_count(&self) -> usize {
        self.lock_table().pages.len()
    }

    pub fn stats(&self) -> AllocatorStats {
        *self.lock_stats()
    }

    pub fn reset_stats(&self) {
        *self.lock_stats() = AllocatorStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn allocator(l1_pages: u64, l3_pages: u64) -> TieredAllocator {
        let config = TierConfig {
            l1_capacity: l1_pages * 4096,
            l2_capacity: 4 * 4096,
            l3_capacity: l3_pages * 4096,
            page_size: 4096,
            cache_line_size: 64,
            hot_threshold: 10,
        };
        let transport = Arc::new(MockTransport::new());
        let coherence = Arc::new(CoherenceManager::new(transport, 64));
        TieredAllocator::new(config, coherence)
    }

    #[test]
    fn test_allocate_rounds_to_pages() {
        let alloc = allocator(4, 64);
        let base = alloc.allocate(5000, 0, Tier::L3).unwrap();

        assert_eq!(alloc.page_count(), 2);
        assert_eq!(alloc.tier_usage(Tier::L3), 2 * 4096);
        assert!(alloc.is_in_tier(base, Tier::L3));
        assert!(alloc.is_in_tier(base + 4096, Tier::L3));
    }

    #[test]
    fn test_l1_fallback_to_l3_never_splits() {
        // L1 holds 2 pages; a 3-page request must land entirely in L3.
        let alloc = allocator(2, 64);
        let base = alloc.allocate(3 * 4096, 0, Tier::L1).unwrap();

        for i in 0..3 {
            assert!(alloc.is_in_tier(base + i * 4096, Tier::L3));
        }
        assert_eq!(alloc.tier_usage(Tier::L1), 0);
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let alloc = allocator(2, 4);
        assert!(matches!(
            alloc.allocate(5 * 4096, 0, Tier::L3),
            Err(AllocError::Exhausted { .. })
        ));
    }

    #[test]
    fn test_zero_byte_allocation_rejected() {
        let alloc = allocator(2, 4);
        assert!(matches!(alloc.allocate(0, 0, Tier::L3), Err(AllocError::ZeroSize)));
    }

    #[test]
    fn test_translate_va_to_pa() {
        let alloc = allocator(4, 64);
        let base = alloc.allocate(2 * 4096, 0, Tier::L3).unwrap();

        let pa_base = alloc.translate_va_to_pa(base);
        assert_ne!(pa_base, 0);
        assert_eq!(alloc.translate_va_to_pa(base + 4096 + 17), pa_base + 4096 + 17);
        assert_eq!(alloc.translate_va_to_pa(0xdead_0000), 0);
    }

    #[test]
    fn test_deallocate_removes_all_pages() {
        let alloc = allocator(4, 64);
        let base = alloc.allocate(3 * 4096, 1, Tier::L3).unwrap();
        assert_eq!(alloc.page_count(), 3);

        alloc.deallocate(base);
        assert_eq!(alloc.page_count(), 0);
        assert_eq!(alloc.tier_usage(Tier::L3), 0);
        assert_eq!(alloc.translate_va_to_pa(base), 0);

        // Idempotent on unknown bases.
        alloc.deallocate(base);
        alloc.deallocate(0x42);
    }

    #[test]
    fn test_promote_and_lru_eviction() {
        let alloc = allocator(2, 64);
        let a = alloc.allocate(4096, 0, Tier::L3).unwrap();
        let b = alloc.allocate(4096, 0, Tier::L3).unwrap();
        let c = alloc.allocate(4096, 0, Tier::L3).unwrap();

        assert!(alloc.promote_to_l1(a));
        assert!(alloc.promote_to_l1(b));
        assert!(alloc.promote_to_l1(a)); // refreshes recency
        assert!(alloc.promote_to_l1(c)); // evicts b (LRU)

        assert!(alloc.is_in_tier(a, Tier::L1));
        assert!(alloc.is_in_tier(c, Tier::L1));
        assert!(alloc.is_in_tier(b, Tier::L3));
        assert_eq!(alloc.l1_lru_snapshot(), vec![a, c]);
        assert_eq!(alloc.stats().migrations_l1_to_l3, 1);
        assert_eq!(alloc.stats().migrations_l3_to_l1, 3);
    }

    #[test]
    fn test_promote_unknown_page_fails() {
        let alloc = allocator(2, 4);
        assert!(!alloc.promote_to_l1(0x7777_0000));
    }

    #[test]
    fn test_demote_writes_back_modified() {
        let alloc = allocator(2, 64);
        let a = alloc.allocate(4096, 0, Tier::L3).unwrap();
        assert!(alloc.promote_to_l1(a));

        alloc.mark_modified(a);
        assert!(alloc.demote_to_l3(a));
        assert_eq!(alloc.page_state(a), PageState::Shared);
        assert!(alloc.is_in_tier(a, Tier::L3));
    }

    #[test]
    fn test_access_tracking_counters() {
        let alloc = allocator(2, 64);
        let a = alloc.allocate(4096, 0, Tier::L3).unwrap();

        alloc.update_access_tracking(a);
        alloc.update_access_tracking(a);
        assert!(alloc.promote_to_l1(a));
        alloc.update_access_tracking(a);

        let stats = alloc.stats();
        assert_eq!(stats.l3_accesses, 2);
        assert_eq!(stats.l1_misses, 2);
        assert_eq!(stats.l2_misses, 2);
        assert_eq!(stats.l1_hits, 1);
        assert!((stats.l1_hit_rate() - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_hot_classification() {
        let alloc = allocator(2, 64);
        let a = alloc.allocate(4096, 0, Tier::L3).unwrap();

        for _ in 0..10 {
            alloc.update_access_tracking(a);
        }
        assert!(!alloc.is_hot_page(a)); // threshold is strict
        alloc.update_access_tracking(a);
        assert!(alloc.is_hot_page(a));
        assert!(!alloc.is_hot_page(0x1234_0000));
    }

    #[test]
    fn test_lru_matches_l1_set() {
        let alloc = allocator(3, 64);
        let a = alloc.allocate(4096, 0, Tier::L1).unwrap();
        let b = alloc.allocate(4096, 0, Tier::L1).unwrap();

        assert_eq!(alloc.l1_lru_snapshot(), vec![a, b]);
        alloc.update_access_tracking(a);
        assert_eq!(alloc.l1_lru_snapshot(), vec![b, a]);

        alloc.deallocate(a);
        assert_eq!(alloc.l1_lru_snapshot(), vec![b]);
    }
}
