//! Arc-discrimination forward pass
//!
//! Augments next-token prediction with a real/fake discrimination objective.
//! One training step runs the backbone twice over a shared KV cache: a plain
//! causal pass over the real tokens, then an incremental pass over an "arc"
//! sequence whose tokens are negatives sampled from the model's own
//! predictive distribution. A scalar head scores every position of both
//! passes as real or fake.
//!
//! The block-structured attention mask of the second pass guarantees that an
//! arc position sees only genuine cached context strictly before its index,
//! plus its own injected token — never the real token it is being judged
//! against, and never another arc token.

use crate::attention::KVCache;
use crate::config::ArcModelConfig;
use crate::init::init_linear_weight;
use crate::transformer::Transformer;
use anyhow::Result;
use aprender::autograd::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Label value for positions excluded from the arc loss
pub const ARC_IGNORE_INDEX: f32 = -1.0;

// --- attention-mask builder ---------------------------------------------
//
// Masks are additive: 0.0 = may attend, -inf = blocked. The four L×L
// quadrants are built separately so each one's semantics can be tested in
// isolation, then composed by concatenation.

/// NW quadrant: standard causal block (position i sees j <= i)
fn self_attending_quadrant(l: usize) -> Tensor {
    let mut data = vec![0.0; l * l];
    for i in 0..l {
        for j in 0..l {
            if j > i {
                data[i * l + j] = f32::NEG_INFINITY;
            }
        }
    }
    Tensor::new(&data, &[l, l])
}

/// SW quadrant: cross-attending causal block (position i sees j < i only)
///
/// The diagonal is blocked too: arc position i carries a sampled replacement
/// for position i-1's target, so it must not see the real token at i.
fn cross_attending_quadrant(l: usize) -> Tensor {
    let mut data = vec![0.0; l * l];
    for i in 0..l {
        for j in 0..l {
            if j >= i {
                data[i * l + j] = f32::NEG_INFINITY;
            }
        }
    }
    Tensor::new(&data, &[l, l])
}

/// NE quadrant: fully blocked (the real pass never sees arc tokens)
fn blocked_quadrant(l: usize) -> Tensor {
    Tensor::new(&vec![f32::NEG_INFINITY; l * l], &[l, l])
}

/// SE quadrant: self-only (each arc position attends to itself alone)
fn self_only_quadrant(l: usize) -> Tensor {
    let mut data = vec![f32::NEG_INFINITY; l * l];
    for i in 0..l {
        data[i * l + i] = 0.0;
    }
    Tensor::new(&data, &[l, l])
}

/// Concatenate two equal-height mask blocks side by side
fn hcat(a: &Tensor, b: &Tensor) -> Tensor {
    let (rows, a_cols) = (a.shape()[0], a.shape()[1]);
    let b_cols = b.shape()[1];
    let (a_data, b_data) = (a.data(), b.data());

    let mut data = Vec::with_capacity(rows * (a_cols + b_cols));
    for i in 0..rows {
        data.extend_from_slice(&a_data[i * a_cols..(i + 1) * a_cols]);
        data.extend_from_slice(&b_data[i * b_cols..(i + 1) * b_cols]);
    }
    Tensor::new(&data, &[rows, a_cols + b_cols])
}

/// Concatenate two equal-width mask blocks top to bottom
fn vcat(a: &Tensor, b: &Tensor) -> Tensor {
    let cols = a.shape()[1];
    let rows = a.shape()[0] + b.shape()[0];

    let mut data = a.data().to_vec();
    data.extend_from_slice(b.data());
    Tensor::new(&data, &[rows, cols])
}

/// Build the arc attention mask
///
/// # Arguments
/// * `seq_len` - Length L of the real token sequence
/// * `cached` - Incremental mode: the real half is already resolved in cache
///
/// # Returns
/// Additive mask of shape [L, 2L] (cached) or [2L, 2L] (uncached)
pub fn arc_attention_mask(seq_len: usize, cached: bool) -> Result<Tensor> {
    if seq_len == 0 {
        anyhow::bail!("seq_len must be at least 1");
    }

    let sw = cross_attending_quadrant(seq_len);
    let se = self_only_quadrant(seq_len);
    let bottom = hcat(&sw, &se);

    if cached {
        return Ok(bottom);
    }

    let nw = self_attending_quadrant(seq_len);
    let ne = blocked_quadrant(seq_len);
    let top = hcat(&nw, &ne);

    Ok(vcat(&top, &bottom))
}

// --- position-id builder ------------------------------------------------

/// Build position ids for the arc pass
///
/// Cached mode returns 0..L for the incremental tokens (they mirror the real
/// sequence's positions); uncached mode returns 0..L twice, matching the
/// concatenated layout the uncached mask describes.
pub fn arc_position_ids(seq_len: usize, cached: bool) -> Vec<usize> {
    let positions: Vec<usize> = (0..seq_len).collect();
    if cached {
        return positions;
    }

    let mut doubled = positions.clone();
    doubled.extend(positions);
    doubled
}

// --- negative sampler ---------------------------------------------------

/// Numerically stable log-softmax over the last dimension
fn log_softmax_last_dim(x: &Tensor) -> Tensor {
    let shape = x.shape();
    let last_dim = shape[shape.len() - 1];
    let rows: usize = shape[..shape.len() - 1].iter().product();
    let x_data = x.data();

    let mut output = vec![0.0; x_data.len()];
    for r in 0..rows {
        let offset = r * last_dim;
        let slice = &x_data[offset..offset + last_dim];

        let max_val = slice.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let sum: f32 = slice.iter().map(|&v| (v - max_val).exp()).sum();
        let lse = max_val + sum.ln();

        for i in 0..last_dim {
            output[offset + i] = slice[i] - lse;
        }
    }

    Tensor::new(&output, shape)
}

/// Draw one token per position from the model's predictive distribution
///
/// CDF walk over exp(log p) with a uniform coin per position. Degenerate
/// distributions (NaN log-probs) fall through to the last vocabulary entry
/// and surface downstream as a loss anomaly rather than being masked here.
///
/// # Arguments
/// * `lm_log_probs` - Log-probabilities [batch, seq_len, vocab]
/// * `rng` - Coin source
///
/// # Returns
/// Sampled token ids [batch, seq_len]
pub fn sample_negative_ids(lm_log_probs: &Tensor, rng: &mut StdRng) -> Result<Tensor> {
    let shape = lm_log_probs.shape();
    if shape.len() != 3 {
        anyhow::bail!(
            "Expected 3D log-probs [batch, seq_len, vocab], got shape {:?}",
            shape
        );
    }

    let (batch, seq_len, vocab) = (shape[0], shape[1], shape[2]);
    let data = lm_log_probs.data();

    let mut sampled = Vec::with_capacity(batch * seq_len);
    for pos in 0..batch * seq_len {
        let row = &data[pos * vocab..(pos + 1) * vocab];
        let coin: f32 = rng.gen();

        let mut cdf = 0.0;
        let mut choice = vocab - 1;
        for (token, &lp) in row.iter().enumerate() {
            cdf += lp.exp();
            if coin < cdf {
                choice = token;
                break;
            }
        }
        sampled.push(choice as f32);
    }

    Ok(Tensor::new(&sampled, &[batch, seq_len]))
}

/// Deterministic debug substitute for the negative sampler
///
/// Returns the input shifted left by one position, so the "negative" at t is
/// the real token at t+1; the last position keeps its original token. The
/// input is copied, never mutated.
pub fn shifted_negative_ids(input_ids: &Tensor) -> Result<Tensor> {
    let shape = input_ids.shape();
    if shape.len() != 2 {
        anyhow::bail!(
            "Expected 2D input [batch, seq_len], got shape {:?}",
            shape
        );
    }

    let (batch, seq_len) = (shape[0], shape[1]);
    let data = input_ids.data();

    let mut shifted = data.to_vec();
    for b in 0..batch {
        let row = b * seq_len;
        for t in 0..seq_len - 1 {
            shifted[row + t] = data[row + t + 1];
        }
    }

    Ok(Tensor::new(&shifted, &[batch, seq_len]))
}

// --- target/prediction assembler ----------------------------------------

/// Build the arc input sequence: real first token, then negatives shifted by one
///
/// arc_ids[0] = input_ids[0]; arc_ids[t] = neg_ids[t-1] for t > 0.
fn build_arc_ids(input_ids: &Tensor, neg_ids: &Tensor) -> Result<Tensor> {
    let shape = input_ids.shape();
    if neg_ids.shape() != shape {
        anyhow::bail!(
            "Negative ids shape {:?} doesn't match input shape {:?}",
            neg_ids.shape(),
            shape
        );
    }

    let (batch, seq_len) = (shape[0], shape[1]);
    let (input, neg) = (input_ids.data(), neg_ids.data());

    let mut arc = Vec::with_capacity(batch * seq_len);
    for b in 0..batch {
        let row = b * seq_len;
        arc.push(input[row]);
        arc.extend_from_slice(&neg[row..row + seq_len - 1]);
    }

    Ok(Tensor::new(&arc, &[batch, seq_len]))
}

/// Build the arc target tensor
///
/// Shape [batch, 2L]: first half labeled 0 (real), second half 1 (fake).
/// Position 0 of each half is ignored (no preceding token to score against),
/// as is any position whose original token is the pad id — checked against
/// the doubled original input, not the sampled ids.
pub fn build_arc_targets(input_ids: &Tensor, pad_token_id: u32) -> Result<Tensor> {
    let shape = input_ids.shape();
    if shape.len() != 2 {
        anyhow::bail!(
            "Expected 2D input [batch, seq_len], got shape {:?}",
            shape
        );
    }

    let (batch, seq_len) = (shape[0], shape[1]);
    let input = input_ids.data();
    let pad = pad_token_id as f32;

    let mut targets = Vec::with_capacity(batch * 2 * seq_len);
    for b in 0..batch {
        let row = b * seq_len;
        for p in 0..2 * seq_len {
            let label = if p == 0 || p == seq_len {
                ARC_IGNORE_INDEX
            } else if input[row + p % seq_len] == pad {
                ARC_IGNORE_INDEX
            } else if p < seq_len {
                0.0
            } else {
                1.0
            };
            targets.push(label);
        }
    }

    Ok(Tensor::new(&targets, &[batch, 2 * seq_len]))
}

/// Project hidden states through a bias-free weight: [b, n, e] @ W^T -> [b, n, out]
fn project(hidden: &Tensor, weight: &Tensor) -> Tensor {
    let h_shape = hidden.shape();
    let (rows, n_embd) = (h_shape[0] * h_shape[1], h_shape[2]);
    let out_features = weight.shape()[0];

    let h_data = hidden.data();
    let w_data = weight.data();

    let mut output = vec![0.0; rows * out_features];
    for r in 0..rows {
        let h_row = &h_data[r * n_embd..(r + 1) * n_embd];
        for o in 0..out_features {
            let w_row = &w_data[o * n_embd..(o + 1) * n_embd];
            let mut sum = 0.0;
            for e in 0..n_embd {
                sum += h_row[e] * w_row[e];
            }
            output[r * out_features + o] = sum;
        }
    }

    Tensor::new(&output, &[h_shape[0], h_shape[1], out_features])
}

/// Concatenate two hidden-state tensors along the sequence dimension
fn concat_seq(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (a_shape, b_shape) = (a.shape(), b.shape());
    if a_shape[0] != b_shape[0] || a_shape[2] != b_shape[2] {
        anyhow::bail!(
            "Hidden-state shapes {:?} and {:?} can't be concatenated on the sequence axis",
            a_shape,
            b_shape
        );
    }

    let (batch, n_embd) = (a_shape[0], a_shape[2]);
    let (a_len, b_len) = (a_shape[1], b_shape[1]);
    let (a_data, b_data) = (a.data(), b.data());

    let mut data = Vec::with_capacity(batch * (a_len + b_len) * n_embd);
    for bi in 0..batch {
        let a_base = bi * a_len * n_embd;
        let b_base = bi * b_len * n_embd;
        data.extend_from_slice(&a_data[a_base..a_base + a_len * n_embd]);
        data.extend_from_slice(&b_data[b_base..b_base + b_len * n_embd]);
    }

    Ok(Tensor::new(&data, &[batch, a_len + b_len, n_embd]))
}

/// Turn scalar scores [b, 2L, 1] into class-score pairs {-s/2, +s/2}
///
/// Formatted for a two-class cross-entropy loss where a positive score points
/// to class 1 (fake).
fn split_scores(scores: &Tensor) -> Tensor {
    let shape = scores.shape();
    let (batch, len) = (shape[0], shape[1]);

    let mut data = Vec::with_capacity(batch * len * 2);
    for &s in scores.data().iter() {
        data.push(-s / 2.0);
        data.push(s / 2.0);
    }

    Tensor::new(&data, &[batch, len, 2])
}

// --- dual-pass driver ---------------------------------------------------

/// Output of one arc forward pass
pub struct ArcForwardOutput {
    /// Log-softmaxed LM logits [batch, seq_len, vocab]
    pub lm_log_probs: Tensor,
    /// Arc class-score pairs [batch, 2 * seq_len, 2]; class 1 = fake
    pub arc_preds: Tensor,
    /// Arc labels [batch, 2 * seq_len]; 0 = real, 1 = fake, -1 = ignore
    pub arc_targets: Tensor,
}

/// Language model with the auxiliary arc discrimination head
///
/// Holds the shared transformer backbone plus two bias-free heads: a
/// vocabulary projection for the LM objective and a scalar projection for
/// arc scoring.
pub struct ArcLmModel {
    model: Transformer,
    /// LM head weight [vocab_size, n_embd]
    lm_head: Tensor,
    /// Arc head weight [1, n_embd]
    arc_head: Tensor,
    rng: StdRng,
}

impl ArcLmModel {
    /// Create a new model from a configuration
    pub fn new(config: ArcModelConfig) -> Result<Self> {
        let lm_head = init_linear_weight(
            config.n_embd,
            config.vocab_size,
            config.seed.map(|s| s.wrapping_add(101)),
        );
        let arc_head =
            init_linear_weight(config.n_embd, 1, config.seed.map(|s| s.wrapping_add(103)));
        let rng = match config.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let model = Transformer::new(config)?;

        Ok(Self {
            model,
            lm_head,
            arc_head,
            rng,
        })
    }

    /// Model configuration
    pub fn config(&self) -> &ArcModelConfig {
        self.model.config()
    }

    /// Training forward pass
    ///
    /// Runs the backbone over the real tokens (populating a fresh KV cache),
    /// samples negatives from the resulting distribution, re-runs the
    /// backbone over the arc sequence against the cached context, and scores
    /// every position of both passes.
    ///
    /// # Arguments
    /// * `input_ids` - Token ids [batch, seq_len]
    /// * `pad_token_id` - Id of the pad token in the vocabulary
    /// * `debug` - Replace sampling with the deterministic left-shift
    ///
    /// # Returns
    /// LM log-probs, arc predictions, and arc targets (see [`ArcForwardOutput`])
    pub fn forward(
        &mut self,
        input_ids: &Tensor,
        pad_token_id: u32,
        debug: bool,
    ) -> Result<ArcForwardOutput> {
        let shape = input_ids.shape();
        if shape.len() != 2 {
            anyhow::bail!(
                "Expected 2D input [batch, seq_len], got shape {:?}",
                shape
            );
        }
        let seq_len = shape[1];
        if seq_len == 0 {
            anyhow::bail!("Sequence length must be at least 1");
        }

        // The cache lives exactly as long as this call: the first pass
        // populates it, the arc pass extends it, nothing reuses it.
        let mut kv = KVCache::new();

        let hidden = self.model.forward(input_ids, None, None, Some(&mut kv))?;
        let lm_logits = project(&hidden, &self.lm_head);
        let lm_log_probs = log_softmax_last_dim(&lm_logits);

        let neg_ids = if debug {
            shifted_negative_ids(input_ids)?
        } else {
            sample_negative_ids(&lm_log_probs, &mut self.rng)?
        };

        let arc_ids = build_arc_ids(input_ids, &neg_ids)?;
        let arc_mask = arc_attention_mask(seq_len, true)?;
        let arc_positions = arc_position_ids(seq_len, true);
        let arc_hidden =
            self.model
                .forward(&arc_ids, Some(&arc_mask), Some(&arc_positions), Some(&mut kv))?;

        let states = concat_seq(&hidden, &arc_hidden)?;
        let scores = project(&states, &self.arc_head);
        let arc_preds = split_scores(&scores);
        let arc_targets = build_arc_targets(input_ids, pad_token_id)?;

        Ok(ArcForwardOutput {
            lm_log_probs,
            arc_preds,
            arc_targets,
        })
    }

    /// Set training mode for the backbone
    pub fn set_training(&mut self, training: bool) {
        self.model.set_training(training);
    }

    /// Immutable references to the learnable parameters
    pub fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.model.parameters();
        params.push(&self.lm_head);
        params.push(&self.arc_head);
        params
    }

    /// Mutable references to the learnable parameters
    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.model.parameters_mut();
        params.push(&mut self.lm_head);
        params.push(&mut self.arc_head);
        params
    }
}
