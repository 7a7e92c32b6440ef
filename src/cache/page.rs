//! Page types and alignment helpers.
//!
//! A page is the allocation unit and the unit of tier movement. Pages carry
//! their own coherence state mirror; the authoritative line-granular state
//! lives in the coherence directory.

use serde::{Deserialize, Serialize};

/// The three logical memory tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Hot tier: device-local, small, LRU-managed.
    L1,
    /// Prefetch landing buffer.
    L2,
    /// Pooled far memory.
    L3,
}

impl Tier {
    /// Numeric tier level (lower = faster).
    pub fn level(&self) -> u8 {
        match self {
            Tier::L1 => 0,
            Tier::L2 => 1,
            Tier::L3 => 2,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::L1 => write!(f, "L1"),
            Tier::L2 => write!(f, "L2"),
            Tier::L3 => write!(f, "L3"),
        }
    }
}

/// MESI state, shared between the page table and the coherence directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageState {
    Invalid,
    Shared,
    Exclusive,
    Modified,
}

/// One allocation-granularity page.
#[derive(Debug, Clone)]
pub struct Page {
    /// Page-aligned virtual address.
    pub virtual_addr: u64,

    /// Page-aligned physical address.
    pub physical_addr: u64,

    /// Current tier.
    pub tier: Tier,

    /// Page-level coherence state mirror.
    pub state: PageState,

    /// Saturating access counter.
    pub access_count: u32,

    /// Monotonic tick of the last access.
    pub last_access_time: u64,

    /// Whether `access_count` has crossed the hot threshold.
    pub is_hot: bool,

    /// Model layer that owns this page.
    pub layer_id: u32,
}

impl Page {
    pub fn new(virtual_addr: u64, physical_addr: u64, tier: Tier, layer_id: u32) -> Self {
        Self {
            virtual_addr,
            physical_addr,
            tier,
            state: PageState::Exclusive,
            access_count: 0,
            last_access_time: 0,
            is_hot: false,
            layer_id,
        }
    }
}

/// Round an address down to its page boundary. `page_size` must be a power
/// of two.
pub fn page_align(addr: u64, page_size: u64) -> u64 {
    addr & !(page_size - 1)
}

/// Round a byte count up to whole pages.
pub fn pages_for(bytes: u64, page_size: u64) -> u64 {
    bytes.div_ceil(page_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_levels() {
        assert_eq!(Tier::L1.level(), 0);
        assert_eq!(Tier::L2.level(), 1);
        assert_eq!(Tier::L3.level(), 2);
    }

    #[test]
    fn test_page_align() {
        assert_eq!(page_align(0x1234, 4096), 0x1000);
        assert_eq!(page_align(0x1000, 4096), 0x1000);
        assert_eq!(page_align(0xFFF, 4096), 0);
    }

    #[test]
    fn test_pages_for() {
        assert_eq!(pages_for(1, 4096), 1);
        assert_eq!(pages_for(4096, 4096), 1);
        assert_eq!(pages_for(4097, 4096), 2);
        assert_eq!(pages_for(0, 4096), 0);
    }

    #[test]
    fn test_new_page_starts_exclusive_and_cold() {
        let page = Page::new(0x1000, 0x8000_0000, Tier::L3, 7);
        assert_eq!(page.state, PageState::Exclusive);
        assert_eq!(page.access_count, 0);
        assert!(!page.is_hot);
        assert_eq!(page.layer_id, 7);
    }
}
