//! Speculative prefetch: turns token history into bounded sets of
//! non-blocking fetches.
//!
//! The predictor ranks likely next tokens; each candidate maps to a KV-cache
//! address which, unless already resident in L1 or L2, is enqueued and issued
//! through the transport as a speculative DMA. Prediction quality feeds an
//! adaptive depth controller. Mispredicted data is never evicted eagerly;
//! it ages out through LRU and FIFO overflow (lazy invalidation).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use tracing::debug;

use crate::cache::allocator::TieredAllocator;
use crate::cache::page::Tier;
use crate::config::PrefetchConfig;
use crate::predict::TokenPredictor;
use crate::transport::{
    DmaDescriptor, PrefetchCommand, Transport, DMA_FLAG_COMPRESSED, DMA_FLAG_PREFETCH,
};

/// Depth bounds for the adaptive controller.
const MIN_DEPTH: usize = 2;
const MAX_DEPTH: usize = 8;
/// Samples required before the controller may adjust.
const MIN_SAMPLES: usize = 10;
const RAISE_THRESHOLD: f64 = 0.95;
const LOWER_THRESHOLD: f64 = 0.85;

/// Maps `(request_id, layer, next_position)` to a KV-cache virtual address.
pub type AddressFn = Box<dyn Fn(u32, u32, u32) -> u64 + Send + Sync>;

/// One issued speculative fetch.
#[derive(Debug, Clone)]
pub struct PrefetchRequest {
    pub virtual_addr: u64,
    pub layer_id: u32,
    pub predicted_token_id: u32,
    pub confidence: f32,
    pub timestamp: u64,
}

/// Prefetch statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefetchStats {
    pub total_prefetches: u64,
    pub successful_prefetches: u64,
    pub mispredictions: u64,
    pub transport_errors: u64,
    pub avg_prediction_latency_us: f64,
}

impl PrefetchStats {
    pub fn hit_rate(&self) -> f64 {
        if self.total_prefetches > 0 {
            self.successful_prefetches as f64 / self.total_prefetches as f64
        } else {
            0.0
        }
    }

    pub fn precision(&self) -> f64 {
        let denominator = self.successful_prefetches + self.mispredictions + 1;
        self.successful_prefetches as f64 / denominator as f64
    }
}

/// The speculative prefetcher.
///
/// Holds a weak back-reference to the allocator (it only queries tier
/// membership); the allocator never references the prefetcher, keeping the
/// ownership graph acyclic.
pub struct Prefetcher {
    allocator: Weak<TieredAllocator>,
    predictor: Box<dyn TokenPredictor>,
    transport: Arc<dyn Transport>,
    address_fn: AddressFn,

    configured_depth: AtomicUsize,
    adaptive_depth: AtomicUsize,
    outstanding_capacity: usize,
    accuracy_capacity: usize,
    page_bytes: u32,
    compressed_transfers: AtomicBool,

    next_req_id: AtomicU32,
    prefetch_calls: AtomicU64,
    clock: AtomicU64,

    outstanding: Mutex<VecDeque<PrefetchRequest>>,
    accuracy: Mutex<VecDeque<bool>>,
    stats: Mutex<PrefetchStats>,
}

impl Prefetcher {
    pub fn new(
        allocator: Weak<TieredAllocator>,
        predictor: Box<dyn TokenPredictor>,
        transport: Arc<dyn Transport>,
        config: &PrefetchConfig,
        page_bytes: u32,
    ) -> Self {
        Self {
            allocator,
            predictor,
            transport,
            address_fn: Box::new(pack_kv_address),
            configured_depth: AtomicUsize::new(config.depth),
            adaptive_depth: AtomicUsize::new(config.depth),
            outstanding_capacity: config.outstanding_capacity,
            accuracy_capacity: config.accuracy_window,
            page_bytes,
            compressed_transfers: AtomicBool::new(true),
            next_req_id: AtomicU32::new(1),
            prefetch_calls: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            outstanding: Mutex::new(VecDeque::new()),
            accuracy: Mutex::new(VecDeque::new()),
            stats: Mutex::new(PrefetchStats::default()),
        }
    }

    /// Replace the address-construction function (tests and custom layouts).
    pub fn with_address_fn(mut self, address_fn: AddressFn) -> Self {
        self.address_fn = address_fn;
        self
    }

    /// Whether issued DMA descriptors carry the compressed flag.
    pub fn set_compressed_transfers(&self, on: bool) {
        self.compressed_transfers.store(on, Ordering::Relaxed);
    }

    fn lock_outstanding(&self) -> MutexGuard<'_, VecDeque<PrefetchRequest>> {
        self.outstanding.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_stats(&self) -> MutexGuard<'_, PrefetchStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Issue speculative fetches for the given history and layer.
    ///
    /// `depth` overrides the adaptive depth when positive. Candidates already
    /// resident in L1 or L2 are skipped. Returns the requests actually
    /// issued; transport errors are counted, not propagated, so the call
    /// stays non-blocking from the caller's perspective.
    pub fn prefetch(
        &self,
        token_history: &[u32],
        layer_id: u32,
        depth: usize,
    ) -> Vec<PrefetchRequest> {
        let start = Instant::now();
        let depth = if depth > 0 {
            depth
        } else {
            self.adaptive_depth.load(Ordering::Relaxed)
        };

        let predictions = self.predictor.predict_top_k(token_history, depth);
        let req_id = self.next_req_id.fetch_add(1, Ordering::Relaxed);
        let allocator = self.allocator.upgrade();

        let mut flags = DMA_FLAG_PREFETCH;
        if self.compressed_transfers.load(Ordering::Relaxed) {
            flags |= DMA_FLAG_COMPRESSED;
        }

        let mut issued = Vec::with_capacity(predictions.len());
        let mut descriptors = Vec::with_capacity(predictions.len());
        {
            let mut outstanding = self.lock_outstanding();
            for (i, prediction) in predictions.iter().enumerate() {
                let next_position = (i + 1) as u32;
                let virtual_addr = (self.address_fn)(req_id, layer_id, next_position);

                if let Some(allocator) = allocator.as_deref() {
                    if allocator.is_in_tier(virtual_addr, Tier::L1)
                        || allocator.is_in_tier(virtual_addr, Tier::L2)
                    {
                        continue;
                    }
                }

                let request = PrefetchRequest {
                    virtual_addr,
                    layer_id,
                    predicted_token_id: prediction.token_id,
                    confidence: prediction.confidence,
                    timestamp: self.clock.fetch_add(1, Ordering::Relaxed) + 1,
                };

                outstanding.push_back(request.clone());
                while outstanding.len() > self.outstanding_capacity {
                    outstanding.pop_front();
                }

                descriptors.push(DmaDescriptor {
                    fpga_addr: virtual_addr,
                    gpu_addr: virtual_addr,
                    bytes: self.page_bytes,
                    flags,
                });
                issued.push(request);
            }
        }

        if !issued.is_empty() {
            let command = PrefetchCommand {
                req_id,
                layer: layer_id as u16,
                cur_pos: token_history.len() as u32,
                depth_k: depth as u32,
            };
            let tokens: Vec<i32> = token_history.iter().map(|&t| t as i32).collect();

            if let Err(e) = self.transport.submit_prefetch(&command, &tokens) {
                debug!(error = %e, "prefetch submission failed");
                self.lock_stats().transport_errors += 1;
            }
            if let Err(e) = self.transport.submit_dma_batch(&descriptors) {
                debug!(error = %e, "speculative DMA batch failed");
                self.lock_stats().transport_errors += 1;
            }
        }

        let latency_us = start.elapsed().as_micros() as f64;
        let calls = self.prefetch_calls.fetch_add(1, Ordering::Relaxed) + 1;
        let mut stats = self.lock_stats();
        stats.total_prefetches += issued.len() as u64;
        stats.avg_prediction_latency_us =
            (stats.avg_prediction_latency_us * (calls - 1) as f64 + latency_us) / calls as f64;

        issued
    }

    /// Feed one prediction outcome into the adaptive depth controller.
    ///
    /// The window is evaluated before the new sample lands; an adjustment
    /// clears the window, so a full window must accumulate again before the
    /// depth moves a second time.
    pub fn update_prediction_accuracy(&self, _request_id: u32, was_correct: bool) {
        let mut window = self.accuracy.lock().unwrap_or_else(|e| e.into_inner());

        if window.len() >= MIN_SAMPLES {
            let recent: f64 = window
                .iter()
                .rev()
                .take(MIN_SAMPLES)
                .map(|&ok| if ok { 1.0 } else { 0.0 })
                .sum::<f64>()
                / MIN_SAMPLES as f64;

            let depth = self.adaptive_depth.load(Ordering::Relaxed);
            if recent > RAISE_THRESHOLD && depth < MAX_DEPTH {
                self.adaptive_depth.store(depth + 1, Ordering::Relaxed);
                window.clear();
                debug!(depth = depth + 1, accuracy = recent, "raised prefetch depth");
            } else if recent < LOWER_THRESHOLD && depth > MIN_DEPTH {
                self.adaptive_depth.store(depth - 1, Ordering::Relaxed);
                window.clear();
                debug!(depth = depth - 1, accuracy = recent, "lowered prefetch depth");
            }
        }

        window.push_back(was_correct);
        while window.len() > self.accuracy_capacity {
            window.pop_front();
        }
    }

    /// Count a misprediction when the actual token was not among the
    /// predictions. Prefetched entries are left to age out (lazy
    /// invalidation).
    pub fn handle_misprediction(&self, actual_token: u32, predicted_tokens: &[u32]) {
        if !predicted_tokens.contains(&actual_token) {
            self.lock_stats().mispredictions += 1;
        }
    }

    /// Credit a prefetch whose page was later actually used.
    pub fn record_prefetch_hit(&self) {
        self.lock_stats().successful_prefetches += 1;
    }

    /// Whether a speculative fetch for this address is still outstanding.
    pub fn is_outstanding(&self, virtual_addr: u64) -> bool {
        self.lock_outstanding()
            .iter()
            .any(|r| r.virtual_addr == virtual_addr)
    }

    pub fn outstanding_len(&self) -> usize {
        self.lock_outstanding().len()
    }

    pub fn adaptive_depth(&self) -> usize {
        self.adaptive_depth.load(Ordering::Relaxed)
    }

    /// Reset both the configured and the adaptive depth.
    pub fn set_prefetch_depth(&self, depth: usize) {
        self.configured_depth.store(depth, Ordering::Relaxed);
        self.adaptive_depth.store(depth, Ordering::Relaxed);
    }

    pub fn prefetch_depth(&self) -> usize {
        self.configured_depth.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> PrefetchStats {
        *self.lock_stats()
    }

    pub fn reset_stats(&self) {
        *self.lock_stats() = PrefetchStats::default();
    }
}

/// Default KV address layout: `[req_id:32][layer:16][position:16]`.
fn pack_kv_address(req_id: u32, layer_id: u32, next_position: u32) -> u64 {
    ((req_id as u64) << 32) | ((layer_id as u64 & 0xFFFF) << 16) | (next_position as u64 & 0xFFFF)
}
