//! In-memory mock transport.
//!
//! Records every operation it receives and completes them immediately, so
//! tests can assert on the exact traffic the engine generates. Failure
//! injection covers the "device said no" paths without real hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use tracing::debug;

use super::{
    CoherenceOp, DmaDescriptor, PrefetchCommand, Transport, TransportError, MAX_DMA_BATCH,
    PARAM_COMPRESSION_SCHEME, PARAM_PREFETCH_DEPTH,
};

/// A recorded coherence operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCoherenceOp {
    pub op: CoherenceOp,
    pub addr: u64,
    pub data_len: usize,
}

/// A recorded prefetch submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPrefetch {
    pub command: PrefetchCommand,
    pub tokens: Vec<i32>,
}

#[derive(Debug, Default)]
struct MockLog {
    dma_batches: Vec<Vec<DmaDescriptor>>,
    prefetches: Vec<RecordedPrefetch>,
    coherence_ops: Vec<RecordedCoherenceOp>,
    parameters: HashMap<u32, u32>,
}

/// Mock home agent: every operation succeeds unless a failure is armed.
#[derive(Default)]
pub struct MockTransport {
    log: Mutex<MockLog>,
    completed: AtomicU32,
    fail_all: AtomicBool,
    fail_next: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail until [`Self::recover`].
    pub fn fail_all(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }

    /// Make only the next operation fail.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Clear armed failures.
    pub fn recover(&self) {
        self.fail_all.store(false, Ordering::SeqCst);
        self.fail_next.store(false, Ordering::SeqCst);
    }

    fn check_failure(&self, op: &'static str) -> Result<(), TransportError> {
        if self.fail_next.swap(false, Ordering::SeqCst) || self.fail_all.load(Ordering::SeqCst) {
            return Err(TransportError::DeviceError {
                op,
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn lock_log(&self) -> std::sync::MutexGuard<'_, MockLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of DMA batches submitted so far.
    pub fn dma_batch_count(&self) -> usize {
        self.lock_log().dma_batches.len()
    }

    /// All descriptors submitted so far, flattened across batches.
    pub fn dma_descriptors(&self) -> Vec<DmaDescriptor> {
        self.lock_log()
            .dma_batches
            .iter()
            .flatten()
            .copied()
            .collect()
    }

    /// All prefetch submissions so far.
    pub fn prefetches(&self) -> Vec<RecordedPrefetch> {
        self.lock_log().prefetches.clone()
    }

    /// All coherence operations so far, in issue order.
    pub fn coherence_ops(&self) -> Vec<RecordedCoherenceOp> {
        self.lock_log().coherence_ops.clone()
    }

    /// Count of coherence operations of one kind.
    pub fn coherence_op_count(&self, op: CoherenceOp) -> usize {
        self.lock_log()
            .coherence_ops
            .iter()
            .filter(|r| r.op == op)
            .count()
    }

    /// Last value written for a parameter key, if any.
    pub fn parameter(&self, key: u32) -> Option<u32> {
        self.lock_log().parameters.get(&key).copied()
    }
}

impl Transport for MockTransport {
    fn submit_dma_batch(&self, descriptors: &[DmaDescriptor]) -> Result<(), TransportError> {
        self.check_failure("submit_dma_batch")?;
        if descriptors.len() > MAX_DMA_BATCH {
            return Err(TransportError::BatchTooLarge(descriptors.len()));
        }
        debug!(count = descriptors.len(), "mock DMA batch");
        self.lock_log().dma_batches.push(descriptors.to_vec());
        self.completed
            .fetch_add(descriptors.len() as u32, Ordering::SeqCst);
        Ok(())
    }

    fn submit_prefetch(
        &self,
        request: &PrefetchCommand,
        tokens: &[i32],
    ) -> Result<(), TransportError> {
        self.check_failure("submit_prefetch")?;
        debug!(
            req_id = request.req_id,
            layer = request.layer,
            depth = request.depth_k,
            "mock prefetch submission"
        );
        self.lock_log().prefetches.push(RecordedPrefetch {
            command: *request,
            tokens: tokens.to_vec(),
        });
        Ok(())
    }

    fn poll_completion(&self) -> Result<u32, TransportError> {
        self.check_failure("poll_completion")?;
        Ok(self.completed.swap(0, Ordering::SeqCst))
    }

    fn set_parameter(&self, key: u32, value: u32) -> Result<(), TransportError> {
        self.check_failure("set_parameter")?;
        match key {
            PARAM_PREFETCH_DEPTH | PARAM_COMPRESSION_SCHEME => {
                self.lock_log().parameters.insert(key, value);
                Ok(())
            }
            other => Err(TransportError::UnknownParameter(other)),
        }
    }

    fn coherence_request(
        &self,
        op: CoherenceOp,
        addr: u64,
        data: Option<&[u8]>,
    ) -> Result<(), TransportError> {
        self.check_failure("coherence_request")?;
        self.lock_log().coherence_ops.push(RecordedCoherenceOp {
            op,
            addr,
            data_len: data.map(<[u8]>::len).unwrap_or(0),
        });
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn coherence_wait_complete(&self) -> Result<(), TransportError> {
        self.check_failure("coherence_wait_complete")
    }
}
