//! Compression pipeline for KV-cache pages.
//!
//! Four deterministic stages: scale, int8 quantize, delta encode, run-length
//! encode. Decompression reverses them. The pair is loss-permitting (the
//! quantization step) but bit-deterministic for any fixed input, so
//! round-trip tests stay meaningful.
//!
//! Rounding is pinned to round-half-away-from-zero (`f32::round`) everywhere;
//! delta arithmetic is wrapping i8.

use std::sync::Mutex;
use std::time::Instant;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompressError {
    #[error("value count {values} does not match shape {num_tokens}x{hidden_dim}")]
    ShapeMismatch {
        values: usize,
        num_tokens: usize,
        hidden_dim: usize,
    },
}

/// A compressed page: the quantization scale plus the RLE byte stream.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedPage {
    /// Quantization scale, `max|x| / 127` (1.0 for all-zero input).
    pub scale: f32,

    /// Run-length stream of `(value, count)` byte pairs.
    pub rle: Vec<u8>,

    /// Input size in bytes (f32 elements).
    pub original_size: usize,

    /// RLE stream length in bytes.
    pub compressed_size: usize,
}

/// Compute the quantization scale for a block of values.
pub fn compute_scale(values: &[f32]) -> f32 {
    let max_abs = values.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
    if max_abs > 0.0 {
        max_abs / 127.0
    } else {
        1.0
    }
}

/// Quantize to signed 8-bit: `clamp(round(x / scale), -128, 127)`.
pub fn quantize(values: &[f32], scale: f32) -> Vec<i8> {
    values
        .iter()
        .map(|&v| (v / scale).round().clamp(-128.0, 127.0) as i8)
        .collect()
}

/// Dequantize back to f32: `q * scale`.
pub fn dequantize(quantized: &[i8], scale: f32) -> Vec<f32> {
    quantized.iter().map(|&q| q as f32 * scale).collect()
}

/// Delta encode with wrapping i8 arithmetic. The first element passes
/// through unchanged.
pub fn delta_encode(data: &[i8]) -> Vec<i8> {
    let mut out = Vec::with_capacity(data.len());
    let mut prev = 0i8;
    for (i, &v) in data.iter().enumerate() {
        if i == 0 {
            out.push(v);
        } else {
            out.push(v.wrapping_sub(prev));
        }
        prev = v;
    }
    out
}

/// Inverse of [`delta_encode`]: wrapping prefix sum.
pub fn delta_decode(delta: &[i8]) -> Vec<i8> {
    let mut out = Vec::with_capacity(delta.len());
    let mut acc = 0i8;
    for (i, &d) in delta.iter().enumerate() {
        acc = if i == 0 { d } else { acc.wrapping_add(d) };
        out.push(acc);
    }
    out
}

/// Run-length encode into `(value, count)` byte pairs. A run flushes when the
/// value changes or the count reaches 255. Empty input yields empty output.
pub fn run_length_encode(data: &[i8]) -> Vec<u8> {
    let mut rle = Vec::new();
    let mut iter = data.iter();
    let Some(&first) = iter.next() else {
        return rle;
    };

    let mut current = first;
    let mut count: u32 = 1;
    for &v in iter {
        if v == current && count < 255 {
            count += 1;
        } else {
            rle.push(current as u8);
            rle.push(count as u8);
            current = v;
            count = 1;
        }
    }
    rle.push(current as u8);
    rle.push(count as u8);
    rle
}

/// Inverse of [`run_length_encode`]. A trailing unpaired byte is dropped;
/// the encoder always emits whole pairs.
pub fn run_length_decode(rle: &[u8]) -> Vec<i8> {
    let mut out = Vec::new();
    for pair in rle.chunks_exact(2) {
        let value = pair[0] as i8;
        let count = pair[1] as usize;
        out.extend(std::iter::repeat(value).take(count));
    }
    out
}

/// Engine statistics snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompressionStats {
    pub total_compressions: u64,
    pub total_decompressions: u64,
    pub avg_compression_ratio: f64,
    pub avg_compression_latency_ns: f64,
    pub avg_decompression_latency_ns: f64,
    /// Synthesized from clock, datapath width, and engine count.
    pub throughput_gbps: f64,
}

/// The compression engine: the codec plus per-layer nominal ratios and
/// performance accounting.
pub struct CompressionEngine {
    engines: usize,
    clock_mhz: f64,
    data_width_bits: usize,
    layer_ratios: Vec<f64>,
    stats: Mutex<CompressionStats>,
}

impl CompressionEngine {
    pub fn new(config: &crate::config::CompressionConfig) -> Self {
        Self {
            engines: config.engines,
            clock_mhz: config.clock_mhz,
            data_width_bits: config.data_width_bits,
            layer_ratios: nominal_layer_ratios(config.num_layers),
            stats: Mutex::new(CompressionStats::default()),
        }
    }

    /// Run the forward pipeline over one page of values.
    pub fn compress(
        &self,
        values: &[f32],
        num_tokens: usize,
        hidden_dim: usize,
        _layer_id: u32,
    ) -> Result<CompressedPage, CompressError> {
        if values.len() != num_tokens * hidden_dim {
            return Err(CompressError::ShapeMismatch {
                values: values.len(),
                num_tokens,
                hidden_dim,
            });
        }

        let start = Instant::now();

        let scale = compute_scale(values);
        let quantized = quantize(values, scale);
        let delta = delta_encode(&quantized);
        let rle = run_length_encode(&delta);

        let page = CompressedPage {
            scale,
            original_size: values.len() * std::mem::size_of::<f32>(),
            compressed_size: rle.len(),
            rle,
        };

        let latency_ns = start.elapsed().as_nanos() as f64;
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.total_compressions += 1;
        let n = stats.total_compressions as f64;
        if page.compressed_size > 0 {
            let ratio = page.original_size as f64 / page.compressed_size as f64;
            stats.avg_compression_ratio =
                (stats.avg_compression_ratio * (n - 1.0) + ratio) / n;
        }
        stats.avg_compression_latency_ns =
            (stats.avg_compression_latency_ns * (n - 1.0) + latency_ns) / n;

        Ok(page)
    }

    /// Run the inverse pipeline: RLE decode, delta decode, dequantize.
    pub fn decompress(
        &self,
        compressed: &CompressedPage,
        num_tokens: usize,
        hidden_dim: usize,
    ) -> Vec<f32> {
        let start = Instant::now();

        let delta = run_length_decode(&compressed.rle);
        let quantized = delta_decode(&delta);
        let values = dequantize(&quantized, compressed.scale);
        debug_assert!(
            num_tokens * hidden_dim == 0 || values.len() == num_tokens * hidden_dim,
            "decompressed length diverges from page shape"
        );

        let latency_ns = start.elapsed().as_nanos() as f64;
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.total_decompressions += 1;
        let n = stats.total_decompressions as f64;
        stats.avg_decompression_latency_ns =
            (stats.avg_decompression_latency_ns * (n - 1.0) + latency_ns) / n;

        values
    }

    /// Nominal compression ratio for a layer; observability only.
    pub fn layer_ratio(&self, layer_id: u32) -> f64 {
        self.layer_ratios
            .get(layer_id as usize)
            .copied()
            .unwrap_or(DEFAULT_RATIO)
    }

    pub fn stats(&self) -> CompressionStats {
        let mut stats = *self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.throughput_gbps = self.throughput_gbps();
        stats
    }

    pub fn reset_stats(&self) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        *stats = CompressionStats::default();
    }

    fn throughput_gbps(&self) -> f64 {
        (self.data_width_bits as f64 / 8.0) * (self.clock_mhz / 1000.0) * self.engines as f64
    }
}

const DEFAULT_RATIO: f64 = 3.2;

/// Early layers compress better than late ones; the table records the
/// nominal figures reported alongside the real measurements.
fn nominal_layer_ratios(num_layers: usize) -> Vec<f64> {
    (0..num_layers)
        .map(|i| {
            if i < num_layers / 3 {
                3.5
            } else if i > 2 * num_layers / 3 {
                2.75
            } else {
                DEFAULT_RATIO
            }
        })
        .collect()
}
