//! Token prediction: history window in, ranked candidates out.
//!
//! The prefetcher only contracts the [`TokenPredictor`] trait: a pure
//! function from a fixed token window to a probability distribution. The
//! bundled [`RecurrentPredictor`] is a small seeded recurrent network; any
//! strategy with the same window and determinism contract can replace it.

use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Fixed seed for weight initialization; predictions must be reproducible
/// across runs until trained weights are loaded.
const INIT_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// A ranked candidate token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenPrediction {
    pub token_id: u32,
    pub confidence: f32,
}

/// Strategy interface: `(history, k)` to the `min(k, vocab)` most likely next
/// tokens, sorted by confidence descending, ties broken by ascending id.
pub trait TokenPredictor: Send + Sync {
    fn predict_top_k(&self, history: &[u32], k: usize) -> Vec<TokenPrediction>;

    fn vocab_size(&self) -> usize;

    fn history_length(&self) -> usize;
}

/// Serialized weight bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PredictorWeights {
    vocab_size: usize,
    embedding_dim: usize,
    hidden_dim: usize,
    num_layers: usize,
    history_length: usize,
    /// vocab_size x embedding_dim, row-major.
    embedding: Vec<f32>,
    /// Per layer: input projection (hidden x in_dim), recurrent projection
    /// (hidden x hidden), bias (hidden).
    layers: Vec<LayerWeights>,
    /// vocab_size x hidden_dim, row-major.
    output: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LayerWeights {
    input: Vec<f32>,
    recurrent: Vec<f32>,
    bias: Vec<f32>,
}

/// Small stacked tanh-recurrent network over the token window.
pub struct RecurrentPredictor {
    weights: PredictorWeights,
}

impl RecurrentPredictor {
    /// Reference dimensions: 32k vocabulary, 64-wide embeddings, 128 hidden
    /// units, two layers.
    pub fn with_defaults(history_length: usize) -> Self {
        Self::new(32_000, 64, 128, 2, history_length)
    }

    pub fn new(
        vocab_size: usize,
        embedding_dim: usize,
        hidden_dim: usize,
        num_layers: usize,
        history_length: usize,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(INIT_SEED);
        let mut init = |n: usize| -> Vec<f32> {
            (0..n).map(|_| rng.gen_range(-0.05f32..0.05)).collect()
        };

        let embedding = init(vocab_size * embedding_dim);
        let layers = (0..num_layers)
            .map(|layer| {
                let in_dim = if layer == 0 { embedding_dim } else { hidden_dim };
                LayerWeights {
                    input: init(hidden_dim * in_dim),
                    recurrent: init(hidden_dim * hidden_dim),
                    bias: init(hidden_dim),
                }
            })
            .collect();
        let output = init(vocab_size * hidden_dim);

        Self {
            weights: PredictorWeights {
                vocab_size,
                embedding_dim,
                hidden_dim,
                num_layers,
                history_length,
                embedding,
                layers,
                output,
            },
        }
    }

    /// Write the weight bundle as JSON. Advisory: the engine never calls this
    /// on its own.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let data = serde_json::to_vec(&self.weights)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Load a weight bundle previously written by [`Self::save`].
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read(path)?;
        let weights: PredictorWeights = serde_json::from_slice(&data)?;
        anyhow::ensure!(
            weights.embedding.len() == weights.vocab_size * weights.embedding_dim
                && weights.output.len() == weights.vocab_size * weights.hidden_dim
                && weights.layers.len() == weights.num_layers,
            "weight bundle shape mismatch"
        );
        Ok(Self { weights })
    }

    /// Left-pad with zeros or truncate to the most recent window.
    fn window(&self, history: &[u32]) -> Vec<u32> {
        let len = self.weights.history_length;
        let mut window = vec![0u32; len];
        let take = history.len().min(len);
        window[len - take..].copy_from_slice(&history[history.len() - take..]);
        window
    }

    fn embed(&self, token_id: u32) -> Vec<f32> {
        let w = &self.weights;
        let mut embedded = vec![0.0f32; w.embedding_dim];
        if (token_id as usize) < w.vocab_size {
            let offset = token_id as usize * w.embedding_dim;
            embedded.copy_from_slice(&w.embedding[offset..offset + w.embedding_dim]);
        }
        embedded
    }

    /// Run the window through the stack and return the softmax distribution
    /// over the vocabulary.
    fn forward(&self, history: &[u32]) -> Vec<f32> {
        let w = &self.weights;
        let mut hidden = vec![vec![0.0f32; w.hidden_dim]; w.num_layers];

        for &token in &self.window(history) {
            let mut x = self.embed(token);
            for (layer, state) in w.layers.iter().zip(hidden.iter_mut()) {
                let in_dim = x.len();
                let mut next = vec![0.0f32; w.hidden_dim];
                for (i, out) in next.iter_mut().enumerate() {
                    let mut acc = layer.bias[i];
                    let input_row = &layer.input[i * in_dim..(i + 1) * in_dim];
                    for (wij, xj) in input_row.iter().zip(&x) {
                        acc += wij * xj;
                    }
                    let rec_row = &layer.recurrent[i * w.hidden_dim..(i + 1) * w.hidden_dim];
                    for (wij, hj) in rec_row.iter().zip(state.iter()) {
                        acc += wij * hj;
                    }
                    *out = acc.tanh();
                }
                *state = next;
                x = state.clone();
            }
        }

        let last = &hidden[w.num_layers - 1];
        let mut logits = vec![0.0f32; w.vocab_size];
        for (v, logit) in logits.iter_mut().enumerate() {
            let row = &w.output[v * w.hidden_dim..(v + 1) * w.hidden_dim];
            *logit = row.iter().zip(last).map(|(a, b)| a * b).sum();
        }

        softmax(&mut logits);
        logits
    }
}

impl TokenPredictor for RecurrentPredictor {
    fn predict_top_k(&self, history: &[u32], k: usize) -> Vec<TokenPrediction> {
        let probs = self.forward(history);

        let mut ranked: Vec<TokenPrediction> = probs
            .into_iter()
            .enumerate()
            .map(|(id, confidence)| TokenPrediction {
                token_id: id as u32,
                confidence,
            })
            .collect();

        ranked.sort_unstable_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then(a.token_id.cmp(&b.token_id))
        });
        ranked.truncate(k.min(self.weights.vocab_size));
        ranked
    }

    fn vocab_size(&self) -> usize {
        self.weights.vocab_size
    }

    fn history_length(&self) -> usize {
        self.weights.history_length
    }
}

fn softmax(logits: &mut [f32]) {
    let max = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let mut sum = 0.0f32;
    for l in logits.iter_mut() {
        *l = (*l - max).exp();
        sum += *l;
    }
    for l in logits.iter_mut() {
        *l /= sum;
    }
}
