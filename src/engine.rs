//! Engine facade: one handle-based surface over the allocator, coherence
//! manager, prefetcher, codec, and translation cache.
//!
//! The facade owns every component; the prefetcher reaches back to the
//! allocator through a weak reference only, keeping ownership acyclic.
//! Every public function returns a structured status; the facade never
//! panics, and statistics stay valid after errors.
//!
//! Crate-wide lock order, outermost first: handle map, allocator cursors,
//! allocator page table, coherence directory, coherence stats, prefetcher
//! FIFO, prefetcher stats, compression stats, translation cache. A thread
//! holding a lock may only take locks later in this list.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tracing::{debug, info};

use crate::cache::allocator::{AllocError, AllocatorStats, TieredAllocator};
use crate::cache::page::Tier;
use crate::cache::prefetcher::{PrefetchStats, Prefetcher};
use crate::coherence::{CoherenceManager, CoherenceStats};
use crate::compress::{CompressError, CompressedPage, CompressionEngine, CompressionStats};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::predict::RecurrentPredictor;
use crate::translate::{TranslationCache, TranslationStats};
use crate::transport::{
    CompressionScheme, DmaDescriptor, Transport, DMA_FLAG_COMPRESSED, PARAM_COMPRESSION_SCHEME,
    PARAM_PREFETCH_DEPTH,
};

/// Opaque allocation handle. Zero is the null sentinel; live handles are
/// never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle {
    pub const NULL: Handle = Handle(0);

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Opaque device pointer. Its numeric value is the computed virtual address;
/// it is not dereferenceable on the host. Round-trip it through
/// [`Engine::access`] or the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(u64);

impl DevicePtr {
    pub fn addr(self) -> u64 {
        self.0
    }
}

/// Facade-level usage accounting.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageStats {
    pub total_allocations: u64,
    pub total_deallocations: u64,
    pub current_allocated_bytes: u64,
    pub peak_allocated_bytes: u64,
    pub prefetch_hit_rate: f64,
}

/// Aggregated counters from every component, copied out under their own
/// locks.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStatistics {
    pub usage: UsageStats,
    pub allocator: AllocatorStats,
    pub coherence: CoherenceStats,
    pub prefetch: PrefetchStats,
    pub compression: CompressionStats,
    pub translation: TranslationStats,
}

#[derive(Debug, Clone, Copy)]
struct HandleInfo {
    size_bytes: u64,
    layer_id: u32,
}

struct EngineCore {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    allocator: Arc<TieredAllocator>,
    prefetcher: Prefetcher,
    compression: CompressionEngine,
    translation: TranslationCache,
    handles: Mutex<HashMap<u64, HandleInfo>>,
    usage: Mutex<UsageStats>,
}

/// The tiered-cache engine.
pub struct Engine {
    core: RwLock<Option<EngineCore>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// An engine starts uninitialized; every call except
    /// [`Self::initialize`] fails with `NotInitialized` until then.
    pub fn new() -> Self {
        Self {
            core: RwLock::new(None),
        }
    }

    /// Build all components and push initial device parameters.
    pub fn initialize(&self, config: EngineConfig, transport: Arc<dyn Transport>) -> Result<()> {
        config.validate()?;

        let coherence = Arc::new(CoherenceManager::new(
            transport.clone(),
            config.tiers.cache_line_size,
        ));
        let allocator = Arc::new(TieredAllocator::new(config.tiers.clone(), coherence));
        let predictor = RecurrentPredictor::with_defaults(config.prefetch.history_length);
        let prefetcher = Prefetcher::new(
            Arc::downgrade(&allocator),
            Box::new(predictor),
            transport.clone(),
            &config.prefetch,
            config.tiers.page_size as u32,
        );
        let compression = CompressionEngine::new(&config.compression);
        let translation =
            TranslationCache::new(config.translation.tlb_size, config.tiers.page_size);

        transport.set_parameter(PARAM_PREFETCH_DEPTH, config.prefetch.depth as u32)?;
        transport.set_parameter(
            PARAM_COMPRESSION_SCHEME,
            CompressionScheme::Int8DeltaRle as u32,
        )?;

        info!(
            l1 = config.tiers.l1_capacity,
            l2 = config.tiers.l2_capacity,
            l3 = config.tiers.l3_capacity,
            page_size = config.tiers.page_size,
            prefetch_depth = config.prefetch.depth,
            "engine initialized"
        );

        let core = EngineCore {
            config,
            transport,
            allocator,
            prefetcher,
            compression,
            translation,
            handles: Mutex::new(HashMap::new()),
            usage: Mutex::new(UsageStats::default()),
        };

        let mut slot = self.core.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(core);
        Ok(())
    }

    /// Tear the engine down. Dropping the coherence manager flushes all
    /// Modified lines (best effort).
    pub fn shutdown(&self) -> Result<()> {
        let mut slot = self.core.write().unwrap_or_else(|e| e.into_inner());
        match slot.take() {
            Some(_) => Ok(()),
            None => Err(EngineError::NotInitialized),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.core
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn with_core<T>(&self, f: impl FnOnce(&EngineCore) -> Result<T>) -> Result<T> {
        let guard = self.core.read().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(core) => f(core),
            None => Err(EngineError::NotInitialized),
        }
    }

    /// Allocate `bytes` for a model layer. Lands in L3 by default; pages
    /// migrate toward L1 as they get touched.
    pub fn alloc(&self, bytes: u64, layer_id: u32) -> Result<Handle> {
        self.with_core(|core| {
            if bytes == 0 {
                return Err(EngineError::InvalidArgument(
                    "zero-byte allocation".to_string(),
                ));
            }

            let mut handles = core.lock_handles();
            let base = core.allocator.allocate(bytes, layer_id, Tier::L3)?;
            handles.insert(
                base,
                HandleInfo {
                    size_bytes: bytes,
                    layer_id,
                },
            );

            let mut usage = core.lock_usage();
            usage.total_allocations += 1;
            usage.current_allocated_bytes += bytes;
            usage.peak_allocated_bytes = usage
                .peak_allocated_bytes
                .max(usage.current_allocated_bytes);

            debug!(handle = %format_args!("{base:#x}"), bytes, layer_id, "alloc");
            Ok(Handle(base))
        })
    }

    /// Release an allocation. Unknown or already-freed handles are an error
    /// but never fatal.
    pub fn free(&self, handle: Handle) -> Result<()> {
        self.with_core(|core| {
            let mut handles = core.lock_handles();
            let Some(info) = handles.remove(&handle.0) else {
                return Err(EngineError::UnknownHandle(handle.0));
            };
            core.allocator.deallocate(handle.0);

            let mut usage = core.lock_usage();
            usage.total_deallocations += 1;
            usage.current_allocated_bytes =
                usage.current_allocated_bytes.saturating_sub(info.size_bytes);

            debug!(
                handle = %format_args!("{:#x}", handle.0),
                layer = info.layer_id,
                "free"
            );
            Ok(())
        })
    }

    /// Touch `[offset, offset + length)` of an allocation and return its
    /// opaque device pointer.
    ///
    /// The touched page migrates: L2 pages promote once hot, L3 pages
    /// promote immediately; the promotion pulls the page through a demand
    /// DMA fetch.
    pub fn access(&self, handle: Handle, offset: u64, length: u64) -> Result<DevicePtr> {
        self.with_core(|core| {
            let info = {
                let handles = core.lock_handles();
                match handles.get(&handle.0) {
                    Some(info) => *info,
                    None => return Err(EngineError::UnknownHandle(handle.0)),
                }
            };
            match offset.checked_add(length) {
                Some(end) if end <= info.size_bytes => {}
                _ => {
                    return Err(EngineError::InvalidArgument(format!(
                        "access of {length} bytes at offset {offset} outside allocation of {} bytes",
                        info.size_bytes
                    )));
                }
            }

            let virtual_addr = handle.0 + offset;
            core.allocator.update_access_tracking(virtual_addr);

            if core.allocator.is_in_tier(virtual_addr, Tier::L1) {
                core.allocator_coherence().read(virtual_addr)?;
                return Ok(DevicePtr(virtual_addr));
            }

            if core.allocator.is_in_tier(virtual_addr, Tier::L2) {
                // A page sitting in L2 is a prefetch that paid off. It only
                // enters the coherent L1 working set once it runs hot.
                core.prefetcher.record_prefetch_hit();
                if core.allocator.is_hot_page(virtual_addr) {
                    core.fetch_and_promote(virtual_addr)?;
                    core.allocator_coherence().read(virtual_addr)?;
                }
            } else {
                core.fetch_and_promote(virtual_addr)?;
                core.allocator_coherence().read(virtual_addr)?;
            }

            Ok(DevicePtr(virtual_addr))
        })
    }

    /// Feed the current token history to the speculative prefetcher.
    /// Returns the number of fetches issued.
    pub fn prefetch_hint(&self, token_history: &[u32], layer_id: u32) -> Result<usize> {
        self.with_core(|core| {
            let issued = core.prefetcher.prefetch(token_history, layer_id, 0);
            core.lock_usage().prefetch_hit_rate = core.prefetcher.stats().hit_rate();
            Ok(issued.len())
        })
    }

    /// Report a prediction outcome to the adaptive depth controller.
    pub fn update_prediction_accuracy(&self, request_id: u32, was_correct: bool) -> Result<()> {
        self.with_core(|core| {
            core.prefetcher
                .update_prediction_accuracy(request_id, was_correct);
            Ok(())
        })
    }

    /// Report the actually generated token against the predicted set.
    pub fn handle_misprediction(&self, actual_token: u32, predicted: &[u32]) -> Result<()> {
        self.with_core(|core| {
            core.prefetcher.handle_misprediction(actual_token, predicted);
            Ok(())
        })
    }

    /// Current adaptive prefetch depth.
    pub fn adaptive_depth(&self) -> Result<usize> {
        self.with_core(|core| Ok(core.prefetcher.adaptive_depth()))
    }

    /// Compress one page of KV values for a compressed tier transfer.
    pub fn compress_page(
        &self,
        values: &[f32],
        num_tokens: usize,
        hidden_dim: usize,
        layer_id: u32,
    ) -> Result<CompressedPage> {
        self.with_core(|core| {
            core.compression
                .compress(values, num_tokens, hidden_dim, layer_id)
                .map_err(|e: CompressError| EngineError::InvalidArgument(e.to_string()))
        })
    }

    /// Decompress a page received from a compressed tier transfer.
    pub fn decompress_page(
        &self,
        compressed: &CompressedPage,
        num_tokens: usize,
        hidden_dim: usize,
    ) -> Result<Vec<f32>> {
        self.with_core(|core| Ok(core.compression.decompress(compressed, num_tokens, hidden_dim)))
    }

    /// Translate a virtual address through the translation cache.
    pub fn translate(&self, virtual_addr: u64) -> Result<u64> {
        self.with_core(|core| Ok(core.translation.translate(virtual_addr)))
    }

    /// Aggregate statistics from every component, by copy.
    pub fn statistics(&self) -> Result<EngineStatistics> {
        self.with_core(|core| {
            Ok(EngineStatistics {
                usage: *core.lock_usage(),
                allocator: core.allocator.stats(),
                coherence: core.allocator_coherence().stats(),
                prefetch: core.prefetcher.stats(),
                compression: core.compression.stats(),
                translation: core.translation.stats(),
            })
        })
    }

    pub fn reset_statistics(&self) -> Result<()> {
        self.with_core(|core| {
            *core.lock_usage() = UsageStats::default();
            core.allocator.reset_stats();
            core.allocator_coherence().reset_stats();
            core.prefetcher.reset_stats();
            core.compression.reset_stats();
            core.translation.reset_stats();
            Ok(())
        })
    }
}

impl EngineCore {
    fn lock_handles(&self) -> MutexGuard<'_, HashMap<u64, HandleInfo>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_usage(&self) -> MutexGuard<'_, UsageStats> {
        self.usage.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn allocator_coherence(&self) -> &CoherenceManager {
        self.allocator.coherence()
    }

    /// Promote a page into L1, pulling its contents through a demand DMA
    /// fetch addressed via the translation cache.
    fn fetch_and_promote(&self, virtual_addr: u64) -> Result<()> {
        let page_size = self.config.tiers.page_size;
        let page_addr = virtual_addr & !(page_size - 1);

        if !self.allocator.promote_to_l1(page_addr) {
            return Err(EngineError::ResourceExhausted(format!(
                "cannot promote page {page_addr:#x} into L1"
            )));
        }

        let descriptor = DmaDescriptor {
            fpga_addr: self.translation.translate(page_addr),
            gpu_addr: page_addr,
            bytes: page_size as u32,
            flags: DMA_FLAG_COMPRESSED,
        };
        self.transport.submit_dma_batch(&[descriptor])?;
        Ok(())
    }
}

impl From<AllocError> for EngineError {
    fn from(e: AllocError) -> Self {
        match e {
            AllocError::ZeroSize => EngineError::InvalidArgument(e.to_string()),
            AllocError::Exhausted { .. } => EngineError::ResourceExhausted(e.to_string()),
        }
    }
}
