//! Direct-mapped address-translation cache.
//!
//! Fronts virtual→physical translation for every component that needs a
//! physical address. Entries are pure lookups with no dirty state, so an
//! index collision simply overwrites. A single mutex serializes the whole
//! structure; the cache is small enough that contention is not the target.

use std::sync::Mutex;

/// Resolves a virtual address to a physical page on a cache miss.
pub type PageWalkFn = Box<dyn Fn(u64) -> u64 + Send + Sync>;

const DEFAULT_WALK_BASE: u64 = 0x40_0000_0000;

#[derive(Debug, Clone, Copy, Default)]
struct TlbSlot {
    virtual_page: u64,
    physical_page: u64,
    valid: bool,
}

/// Translation statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct TranslationStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

struct TlbState {
    slots: Vec<TlbSlot>,
    hits: u64,
    misses: u64,
}

/// Direct-mapped translation cache, indexed by virtual page number modulo
/// the configured size.
pub struct TranslationCache {
    state: Mutex<TlbState>,
    tlb_size: usize,
    page_size: u64,
    page_shift: u32,
    walker: PageWalkFn,
}

impl TranslationCache {
    /// Create a cache with the default linear page walk (fixed base offset,
    /// adequate for the mock device; real backing substitutes a walker).
    pub fn new(tlb_size: usize, page_size: u64) -> Self {
        let mask = !(page_size - 1);
        Self::with_walker(
            tlb_size,
            page_size,
            Box::new(move |va| (DEFAULT_WALK_BASE + (va & 0xFFFF_FFFF_FFFF)) & mask),
        )
    }

    /// Create a cache with a caller-supplied page walk.
    pub fn with_walker(tlb_size: usize, page_size: u64, walker: PageWalkFn) -> Self {
        assert!(page_size.is_power_of_two());
        Self {
            state: Mutex::new(TlbState {
                slots: vec![TlbSlot::default(); tlb_size],
                hits: 0,
                misses: 0,
            }),
            tlb_size,
            page_size,
            page_shift: page_size.trailing_zeros(),
            walker,
        }
    }

    fn slot_index(&self, virtual_page: u64) -> usize {
        ((virtual_page >> self.page_shift) % self.tlb_size as u64) as usize
    }

    /// Translate a virtual address to a physical address, filling the slot on
    /// a miss.
    pub fn translate(&self, virtual_addr: u64) -> u64 {
        let virtual_page = virtual_addr & !(self.page_size - 1);
        let offset = virtual_addr & (self.page_size - 1);
        let index = self.slot_index(virtual_page);

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let slot = &mut state.slots[index];

        if slot.valid && slot.virtual_page == virtual_page {
            let physical_page = slot.physical_page;
            state.hits += 1;
            return physical_page | offset;
        }

        let physical_page = (self.walker)(virtual_addr) & !(self.page_size - 1);
        let slot = &mut state.slots[index];
        slot.virtual_page = virtual_page;
        slot.physical_page = physical_page;
        slot.valid = true;
        state.misses += 1;

        physical_page | offset
    }

    /// Drop the slot covering `virtual_addr`, if it is the one cached there.
    pub fn invalidate(&self, virtual_addr: u64) {
        let virtual_page = virtual_addr & !(self.page_size - 1);
        let index = self.slot_index(virtual_page);

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let slot = &mut state.slots[index];
        if slot.virtual_page == virtual_page {
            slot.valid = false;
        }
    }

    /// Drop every cached translation.
    pub fn invalidate_all(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for slot in &mut state.slots {
            slot.valid = false;
        }
    }

    /// Hit/miss counters with derived rate.
    pub fn stats(&self) -> TranslationStats {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let total = state.hits + state.misses;
        TranslationStats {
            hits: state.hits,
            misses: state.misses,
            hit_rate: if total > 0 {
                state.hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    pub fn reset_stats(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.hits = 0;
        state.misses = 0;
    }
}
