//! Integration tests for the engine facade.

use std::sync::Arc;

use speckv::transport::{MockTransport, PARAM_COMPRESSION_SCHEME, PARAM_PREFETCH_DEPTH};
use speckv::{Engine, EngineConfig, EngineError};

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.tiers.l1_capacity = 8 * 4096;
    config.tiers.l2_capacity = 4 * 4096;
    config.tiers.l3_capacity = 1024 * 4096;
    config
}

fn engine() -> (Arc<MockTransport>, Engine) {
    init_tracing();
    let transport = Arc::new(MockTransport::new());
    let engine = Engine::new();
    engine.initialize(test_config(), transport.clone()).unwrap();
    (transport, engine)
}

#[test]
fn test_uninitialized_engine_rejects_calls() {
    let engine = Engine::new();
    assert!(!engine.is_initialized());

    assert!(matches!(
        engine.alloc(4096, 0),
        Err(EngineError::NotInitialized)
    ));
    assert!(matches!(
        engine.prefetch_hint(&[1, 2], 0),
        Err(EngineError::NotInitialized)
    ));
    assert!(matches!(
        engine.statistics(),
        Err(EngineError::NotInitialized)
    ));
    assert!(matches!(
        engine.shutdown(),
        Err(EngineError::NotInitialized)
    ));
}

#[test]
fn test_initialize_rejects_bad_config() {
    let mut config = test_config();
    config.tiers.page_size = 1000; // not a power of two

    let engine = Engine::new();
    let result = engine.initialize(config, Arc::new(MockTransport::new()));
    assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
    assert!(!engine.is_initialized());
}

#[test]
fn test_initialize_pushes_device_parameters() {
    let (transport, _engine) = engine();
    assert_eq!(transport.parameter(PARAM_PREFETCH_DEPTH), Some(4));
    assert_eq!(transport.parameter(PARAM_COMPRESSION_SCHEME), Some(2));
}

#[test]
fn test_alloc_access_free_lifecycle() {
    let (_, engine) = engine();

    let handle = engine.alloc(2 * 4096, 1).unwrap();
    assert!(!handle.is_null());

    let ptr = engine.access(handle, 100, 64).unwrap();
    assert_eq!(ptr.addr(), handle.raw() + 100);

    engine.free(handle).unwrap();
    assert!(matches!(
        engine.access(handle, 0, 1),
        Err(EngineError::UnknownHandle(_))
    ));
    assert!(matches!(
        engine.free(handle),
        Err(EngineError::UnknownHandle(_))
    ));
}

#[test]
fn test_zero_byte_alloc_rejected() {
    let (_, engine) = engine();
    assert!(matches!(
        engine.alloc(0, 0),
        Err(EngineError::InvalidArgument(_))
    ));
}

#[test]
fn test_out_of_bounds_access_rejected() {
    let (_, engine) = engine();
    let handle = engine.alloc(4096, 0).unwrap();

    assert!(engine.access(handle, 4000, 96).is_ok());
    assert!(matches!(
        engine.access(handle, 4000, 97),
        Err(EngineError::InvalidArgument(_))
    ));
    assert!(matches!(
        engine.access(handle, u64::MAX, 2),
        Err(EngineError::InvalidArgument(_))
    ));
}

#[test]
fn test_access_promotes_cold_page_into_l1() {
    let (_, engine) = engine();
    let handle = engine.alloc(4096, 0).unwrap();

    engine.access(handle, 0, 64).unwrap();

    let stats = engine.statistics().unwrap();
    assert_eq!(stats.allocator.migrations_l3_to_l1, 1);
    assert_eq!(stats.allocator.l3_accesses, 1);

    // The second touch hits L1 and the line directory.
    engine.access(handle, 0, 64).unwrap();
    let stats = engine.statistics().unwrap();
    assert_eq!(stats.allocator.l1_hits, 1);
    assert_eq!(stats.coherence.directory_hits, 1);
    assert_eq!(
        stats.coherence.directory_hits + stats.coherence.directory_misses,
        stats.coherence.total_reads + stats.coherence.total_writes
    );
}

#[test]
fn test_prefetch_skips_resident_candidates() {
    let (_, engine) = engine();

    // The first allocation starts at the virtual base, which is exactly
    // where request id 1 packs its candidate addresses. Promote that page
    // into L1 and every candidate of the first hint is already resident.
    let handle = engine.alloc(4096, 0).unwrap();
    engine.access(handle, 0, 64).unwrap();

    let issued = engine.prefetch_hint(&[10, 20, 30], 0).unwrap();
    assert_eq!(issued, 0);
    let stats = engine.statistics().unwrap();
    assert_eq!(stats.prefetch.total_prefetches, 0);

    // The second hint uses request id 2, whose addresses are not resident.
    let issued = engine.prefetch_hint(&[10, 20, 30], 0).unwrap();
    assert_eq!(issued, 4);
    let stats = engine.statistics().unwrap();
    assert_eq!(stats.prefetch.total_prefetches, 4);
}

#[test]
fn test_adaptive_depth_raises_once_per_window() {
    let (_, engine) = engine();
    assert_eq!(engine.adaptive_depth().unwrap(), 4);

    for _ in 0..20 {
        engine.update_prediction_accuracy(0, true).unwrap();
    }
    assert_eq!(engine.adaptive_depth().unwrap(), 5);
}

#[test]
fn test_misprediction_reporting() {
    let (_, engine) = engine();

    engine.handle_misprediction(42, &[1, 2, 3]).unwrap();
    engine.handle_misprediction(2, &[1, 2, 3]).unwrap();

    let stats = engine.statistics().unwrap();
    assert_eq!(stats.prefetch.mispredictions, 1);
}

#[test]
fn test_compression_passthrough() {
    let (_, engine) = engine();

    let values = vec![1.0f32, 1.0, 1.0, 2.0, 2.0, -1.0];
    let compressed = engine.compress_page(&values, 2, 3, 0).unwrap();
    assert_eq!(compressed.original_size, 24);

    let restored = engine.decompress_page(&compressed, 2, 3).unwrap();
    assert_eq!(restored.len(), values.len());
    for (a, b) in values.iter().zip(&restored) {
        assert!((a - b).abs() <= 2.0 / 127.0);
    }

    assert!(matches!(
        engine.compress_page(&values, 7, 3, 0),
        Err(EngineError::InvalidArgument(_))
    ));
}

#[test]
fn test_translate_is_stable() {
    let (_, engine) = engine();
    let handle = engine.alloc(4096, 0).unwrap();

    let pa1 = engine.translate(handle.raw() + 8).unwrap();
    let pa2 = engine.translate(handle.raw() + 8).unwrap();
    assert_eq!(pa1, pa2);

    let stats = engine.statistics().unwrap();
    assert!(stats.translation.hits >= 1);
}

#[test]
fn test_usage_accounting() {
    let (_, engine) = engine();

    let a = engine.alloc(10_000, 0).unwrap();
    let b = engine.alloc(5_000, 1).unwrap();

    let usage = engine.statistics().unwrap().usage;
    assert_eq!(usage.total_allocations, 2);
    assert_eq!(usage.current_allocated_bytes, 15_000);
    assert_eq!(usage.peak_allocated_bytes, 15_000);

    engine.free(a).unwrap();
    let usage = engine.statistics().unwrap().usage;
    assert_eq!(usage.total_deallocations, 1);
    assert_eq!(usage.current_allocated_bytes, 5_000);
    assert_eq!(usage.peak_allocated_bytes, 15_000);

    engine.free(b).unwrap();
}

#[test]
fn test_reset_statistics() {
    let (_, engine) = engine();
    let handle = engine.alloc(4096, 0).unwrap();
    engine.access(handle, 0, 64).unwrap();
    engine.prefetch_hint(&[1, 2, 3], 9).unwrap();

    engine.reset_statistics().unwrap();

    let stats = engine.statistics().unwrap();
    assert_eq!(stats.allocator.l1_hits + stats.allocator.l3_accesses, 0);
    assert_eq!(stats.coherence.total_reads, 0);
    assert_eq!(stats.prefetch.total_prefetches, 0);
    assert_eq!(stats.usage.total_allocations, 0);

    // Statistics remain live after the reset.
    engine.access(handle, 0, 64).unwrap();
    assert_eq!(engine.statistics().unwrap().allocator.l1_hits, 1);
}

#[test]
fn test_statistics_survive_errors() {
    let (_, engine) = engine();
    let handle = engine.alloc(4096, 0).unwrap();
    engine.access(handle, 0, 64).unwrap();

    assert!(engine.access(handle, 9000, 1).is_err());
    assert!(engine.free(speckv::Handle::NULL).is_err());

    let stats = engine.statistics().unwrap();
    assert_eq!(stats.usage.total_allocations, 1);
    assert_eq!(stats.allocator.migrations_l3_to_l1, 1);
}

#[test]
fn test_shutdown_then_not_initialized() {
    let (_, engine) = engine();
    let handle = engine.alloc(4096, 0).unwrap();

    engine.shutdown().unwrap();
    assert!(!engine.is_initialized());
    assert!(matches!(
        engine.access(handle, 0, 1),
        Err(EngineError::NotInitialized)
    ));

    // Reinitialization brings up a fresh engine.
    engine
        .initialize(test_config(), Arc::new(MockTransport::new()))
        .unwrap();
    assert!(engine.is_initialized());
    assert_eq!(engine.statistics().unwrap().usage.total_allocations, 0);
}

#[test]
fn test_transport_failure_surfaces_from_access() {
    let (transport, engine) = engine();
    let handle = engine.alloc(4096, 0).unwrap();

    transport.fail_all();
    assert!(matches!(
        engine.access(handle, 0, 64),
        Err(EngineError::TransportFailure(_))
    ));

    transport.recover();
    engine.access(handle, 0, 64).unwrap();
}
