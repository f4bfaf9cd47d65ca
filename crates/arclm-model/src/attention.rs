//! Multi-head attention with Group-Query Attention (GQA) and KV cache
//!
//! The attention layer accepts an optional externally-built additive mask and
//! an explicit position sequence for RoPE. Both are required by the arc
//! forward pass, whose incremental tokens mirror positions already present in
//! the cache instead of extending them.

use crate::norm::rms_norm;
use crate::rope::{apply_rotary_emb, gather_rope};
use anyhow::Result;
use aprender::autograd::Tensor;
use aprender::nn::{Dropout, Linear, Module};

/// Split heads: [batch, seq, embed] -> [batch, heads, seq, head_dim]
fn split_heads(x: &Tensor, num_heads: usize, head_dim: usize) -> Tensor {
    let shape = x.shape();
    let (batch, seq_len) = (shape[0], shape[1]);
    let embed = num_heads * head_dim;
    let x_data = x.data();

    let mut output = vec![0.0; batch * num_heads * seq_len * head_dim];
    for b in 0..batch {
        for s in 0..seq_len {
            for h in 0..num_heads {
                let in_base = (b * seq_len + s) * embed + h * head_dim;
                let out_base = ((b * num_heads + h) * seq_len + s) * head_dim;
                output[out_base..out_base + head_dim]
                    .copy_from_slice(&x_data[in_base..in_base + head_dim]);
            }
        }
    }

    Tensor::new(&output, &[batch, num_heads, seq_len, head_dim])
}

/// Merge heads: [batch, heads, seq, head_dim] -> [batch, seq, heads * head_dim]
fn merge_heads(x: &Tensor) -> Tensor {
    let shape = x.shape();
    let (batch, num_heads, seq_len, head_dim) = (shape[0], shape[1], shape[2], shape[3]);
    let embed = num_heads * head_dim;
    let x_data = x.data();

    let mut output = vec![0.0; batch * seq_len * embed];
    for b in 0..batch {
        for h in 0..num_heads {
            for s in 0..seq_len {
                let in_base = ((b * num_heads + h) * seq_len + s) * head_dim;
                let out_base = (b * seq_len + s) * embed + h * head_dim;
                output[out_base..out_base + head_dim]
                    .copy_from_slice(&x_data[in_base..in_base + head_dim]);
            }
        }
    }

    Tensor::new(&output, &[batch, seq_len, embed])
}

/// Repeat KV heads to match query heads (GQA)
fn repeat_kv_heads(x: &Tensor, groups: usize) -> Tensor {
    if groups == 1 {
        return x.clone();
    }

    let shape = x.shape();
    let (batch, kv_heads, seq_len, head_dim) = (shape[0], shape[1], shape[2], shape[3]);
    let num_heads = kv_heads * groups;
    let x_data = x.data();

    let mut output = vec![0.0; batch * num_heads * seq_len * head_dim];
    for b in 0..batch {
        for kv_h in 0..kv_heads {
            let in_base = ((b * kv_heads + kv_h) * seq_len) * head_dim;
            let src = &x_data[in_base..in_base + seq_len * head_dim];
            for g in 0..groups {
                let h = kv_h * groups + g;
                let out_base = ((b * num_heads + h) * seq_len) * head_dim;
                output[out_base..out_base + seq_len * head_dim].copy_from_slice(src);
            }
        }
    }

    Tensor::new(&output, &[batch, num_heads, seq_len, head_dim])
}

/// Transpose the last two dimensions of a 4D tensor
fn transpose_last_two(x: &Tensor) -> Tensor {
    let shape = x.shape();
    let ndim = shape.len();
    let (rows, cols) = (shape[ndim - 2], shape[ndim - 1]);

    let mut new_shape = shape.to_vec();
    new_shape[ndim - 2] = cols;
    new_shape[ndim - 1] = rows;

    let batch_size: usize = shape[..ndim - 2].iter().product();
    let matrix_size = rows * cols;
    let x_data = x.data();

    let mut output = vec![0.0; x_data.len()];
    for b in 0..batch_size {
        let offset = b * matrix_size;
        for i in 0..rows {
            for j in 0..cols {
                output[offset + j * rows + i] = x_data[offset + i * cols + j];
            }
        }
    }

    Tensor::new(&output, &new_shape)
}

/// Batched matmul for [batch, heads, m, k] @ [batch, heads, k, n]
fn matmul_4d(a: &Tensor, b: &Tensor) -> Tensor {
    let a_shape = a.shape();
    let b_shape = b.shape();
    let (batch, heads, m, k) = (a_shape[0], a_shape[1], a_shape[2], a_shape[3]);
    let n = b_shape[3];

    let a_data = a.data();
    let b_data = b.data();
    let mut output = vec![0.0; batch * heads * m * n];

    for bh in 0..batch * heads {
        let a_off = bh * m * k;
        let b_off = bh * k * n;
        let out_off = bh * m * n;
        for i in 0..m {
            for k_idx in 0..k {
                let a_val = a_data[a_off + i * k + k_idx];
                if a_val == 0.0 {
                    continue;
                }
                for j in 0..n {
                    output[out_off + i * n + j] += a_val * b_data[b_off + k_idx * n + j];
                }
            }
        }
    }

    Tensor::new(&output, &[batch, heads, m, n])
}

/// Softmax over the last dimension
fn softmax_last_dim(x: &Tensor) -> Tensor {
    let shape = x.shape();
    let last_dim = shape[shape.len() - 1];
    let batch_size: usize = shape[..shape.len() - 1].iter().product();
    let x_data = x.data();

    let mut output = vec![0.0; x_data.len()];
    for b in 0..batch_size {
        let offset = b * last_dim;
        let slice = &x_data[offset..offset + last_dim];

        let max_val = slice.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let exp_vals: Vec<f32> = slice.iter().map(|&v| (v - max_val).exp()).collect();
        let sum: f32 = exp_vals.iter().sum();

        for i in 0..last_dim {
            output[offset + i] = if sum > 0.0 { exp_vals[i] / sum } else { 0.0 };
        }
    }

    Tensor::new(&output, shape)
}

/// Standard causal additive mask for queries appended after `offset` cached keys
///
/// Query row i may attend to key columns 0..=offset+i; later columns get
/// negative infinity.
fn causal_mask_with_offset(q_len: usize, k_len: usize, offset: usize) -> Tensor {
    let mut data = vec![0.0; q_len * k_len];
    for i in 0..q_len {
        for j in 0..k_len {
            if j > offset + i {
                data[i * k_len + j] = f32::NEG_INFINITY;
            }
        }
    }
    Tensor::new(&data, &[q_len, k_len])
}

/// Add a [q_len, k_len] additive mask to [batch, heads, q_len, k_len] scores
///
/// Fails fast on a geometry mismatch instead of broadcasting partial rows.
fn apply_additive_mask(scores: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let scores_shape = scores.shape();
    let mask_shape = mask.shape();
    let (q_len, k_len) = (scores_shape[2], scores_shape[3]);

    if mask_shape.len() != 2 || mask_shape[0] != q_len || mask_shape[1] != k_len {
        anyhow::bail!(
            "Attention mask shape {:?} doesn't match score geometry [{}, {}]",
            mask_shape,
            q_len,
            k_len
        );
    }

    let mask_data = mask.data();
    let data: Vec<f32> = scores
        .data()
        .iter()
        .enumerate()
        .map(|(idx, &s)| s + mask_data[idx % (q_len * k_len)])
        .collect();

    Ok(Tensor::new(&data, scores_shape))
}

/// Scaled dot-product attention over pre-roped queries and keys
fn scaled_dot_product_attention(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    mask: &Tensor,
    dropout_layer: Option<&Dropout>,
) -> Result<Tensor> {
    let d_k = query.shape()[query.shape().len() - 1] as f32;
    let scale = 1.0 / d_k.sqrt();

    let key_t = transpose_last_two(key);
    let scores = matmul_4d(query, &key_t);
    let scaled: Vec<f32> = scores.data().iter().map(|&v| v * scale).collect();
    let scores = Tensor::new(&scaled, scores.shape());

    let scores = apply_additive_mask(&scores, mask)?;
    let weights = softmax_last_dim(&scores);

    let weights = match dropout_layer {
        Some(dropout) => dropout.forward(&weights),
        None => weights,
    };

    Ok(matmul_4d(&weights, value))
}

/// Normalize queries and keys after RoPE
pub fn apply_qk_norm(q: &Tensor, k: &Tensor) -> Result<(Tensor, Tensor)> {
    let q_norm = rms_norm(q)?;
    let k_norm = rms_norm(k)?;
    Ok((q_norm, k_norm))
}

/// Grouped-query attention layer with KV cache support
///
/// RoPE and QK normalization are applied to keys before they enter the
/// cache, so cached keys keep the positions they were written with. The arc
/// pass relies on this: its incremental keys carry positions 0..L even though
/// the cache already holds L entries.
pub struct SelfAttention {
    /// Query projection: n_embd -> n_embd
    q_proj: Linear,
    /// Key projection: n_embd -> n_kv_head * head_dim
    k_proj: Linear,
    /// Value projection: n_embd -> n_kv_head * head_dim
    v_proj: Linear,
    /// Output projection: n_embd -> n_embd
    out_proj: Linear,
    n_head: usize,
    n_kv_head: usize,
    head_dim: usize,
    dropout_layer: Option<Dropout>,
    training: bool,
}

impl SelfAttention {
    /// Create a new attention layer
    ///
    /// # Arguments
    /// * `n_embd` - Embedding dimension
    /// * `n_head` - Number of query heads
    /// * `n_kv_head` - Number of key/value heads (GQA)
    /// * `dropout_p` - Attention dropout probability (0.0 = disabled)
    /// * `seed` - Optional dropout seed for reproducibility
    pub fn new(
        n_embd: usize,
        n_head: usize,
        n_kv_head: usize,
        dropout_p: Option<f32>,
        seed: Option<u64>,
    ) -> Self {
        let head_dim = n_embd / n_head;
        let kv_dim = n_kv_head * head_dim;

        let dropout_layer = match (dropout_p, seed) {
            (Some(p), Some(s)) if p > 0.0 => Some(Dropout::with_seed(p, s)),
            (Some(p), None) if p > 0.0 => Some(Dropout::new(p)),
            _ => None,
        };

        Self {
            q_proj: Linear::new(n_embd, n_embd),
            k_proj: Linear::new(n_embd, kv_dim),
            v_proj: Linear::new(n_embd, kv_dim),
            out_proj: Linear::new(n_embd, n_embd),
            n_head,
            n_kv_head,
            head_dim,
            dropout_layer,
            training: true,
        }
    }

    /// Set training mode (controls dropout)
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        if let Some(ref mut dropout) = self.dropout_layer {
            if training {
                dropout.train();
            } else {
                dropout.eval();
            }
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Input tensor [batch, seq_len, n_embd]
    /// * `mask` - Optional additive mask [seq_len, total_seq_len]; None gives
    ///   standard causal masking over cache + current tokens
    /// * `positions` - RoPE position per current token (len = seq_len)
    /// * `cos_sin` - Precomputed RoPE frequency tables
    /// * `kv_cache` - Optional KV cache; new keys/values are appended
    /// * `layer_idx` - Layer index within the cache
    ///
    /// # Returns
    /// Output tensor [batch, seq_len, n_embd]
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        positions: &[usize],
        cos_sin: (&Tensor, &Tensor),
        kv_cache: Option<&mut KVCache>,
        layer_idx: usize,
    ) -> Result<Tensor> {
        let shape = x.shape();
        if shape.len() != 3 {
            anyhow::bail!(
                "Expected 3D tensor [batch, seq_len, n_embd], got shape {:?}",
                shape
            );
        }

        let (batch_size, seq_len) = (shape[0], shape[1]);
        if positions.len() != seq_len {
            anyhow::bail!(
                "Position count {} doesn't match sequence length {}",
                positions.len(),
                seq_len
            );
        }

        let q = self.q_proj.forward(x);
        let k = self.k_proj.forward(x);
        let v = self.v_proj.forward(x);

        let q = split_heads(&q, self.n_head, self.head_dim);
        let k = split_heads(&k, self.n_kv_head, self.head_dim);
        let v = split_heads(&v, self.n_kv_head, self.head_dim);

        // RoPE at the explicit positions, then QK norm, before the cache sees
        // the keys. Cached keys must keep the positions they were written
        // with.
        let (cos, sin) = cos_sin;
        let cos_now = gather_rope(cos, positions)?;
        let sin_now = gather_rope(sin, positions)?;
        let q = apply_rotary_emb(&q, &cos_now, &sin_now)?;
        let k = apply_rotary_emb(&k, &cos_now, &sin_now)?;
        let (q, k) = apply_qk_norm(&q, &k)?;

        let (k_all, v_all, cached_len) = match kv_cache {
            Some(cache) => {
                let prior = cache.cached_len(layer_idx);
                let (k_cached, v_cached) = cache.append(layer_idx, k, v)?;
                (k_cached, v_cached, prior)
            }
            None => (k, v, 0),
        };
        let total_seq_len = k_all.shape()[2];

        let groups = self.n_head / self.n_kv_head;
        let k_expanded = repeat_kv_heads(&k_all, groups);
        let v_expanded = repeat_kv_heads(&v_all, groups);

        let default_mask;
        let mask = match mask {
            Some(m) => m,
            None => {
                default_mask = causal_mask_with_offset(seq_len, total_seq_len, cached_len);
                &default_mask
            }
        };

        let dropout_ref = if self.training {
            self.dropout_layer.as_ref()
        } else {
            None
        };
        let attn_output =
            scaled_dot_product_attention(&q, &k_expanded, &v_expanded, mask, dropout_ref)?;

        let attn_output = merge_heads(&attn_output);
        debug_assert_eq!(attn_output.shape()[0], batch_size);

        Ok(self.out_proj.forward(&attn_output))
    }

    /// Number of query heads
    pub fn n_head(&self) -> usize {
        self.n_head
    }

    /// Number of key/value heads
    pub fn n_kv_head(&self) -> usize {
        self.n_kv_head
    }

    /// Head dimension
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Immutable references to the learnable parameters
    pub fn parameters(&self) -> Vec<&Tensor> {
        let mut params = Vec::new();
        params.extend(self.q_proj.parameters());
        params.extend(self.k_proj.parameters());
        params.extend(self.v_proj.parameters());
        params.extend(self.out_proj.parameters());
        params
    }

    /// Mutable references to the learnable parameters
    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = Vec::new();
        params.extend(self.q_proj.parameters_mut());
        params.extend(self.k_proj.parameters_mut());
        params.extend(self.v_proj.parameters_mut());
        params.extend(self.out_proj.parameters_mut());
        params
    }
}

/// Append-only per-layer key/value cache
///
/// Owned exclusively by one forward invocation pair; its growth encodes the
/// masking assumptions of that invocation, so it must never outlive a
/// training step or be shared between steps.
pub struct KVCache {
    /// Cached (keys, values) per layer, shape [batch, n_kv_heads, len, head_dim]
    cache: Vec<(Tensor, Tensor)>,
}

impl KVCache {
    /// Create a new empty cache
    pub fn new() -> Self {
        Self { cache: Vec::new() }
    }

    /// Number of cached positions for a layer
    pub fn cached_len(&self, layer_idx: usize) -> usize {
        match self.cache.get(layer_idx) {
            Some((k, _)) if k.shape().len() == 4 => k.shape()[2],
            _ => 0,
        }
    }

    /// Append keys and values for a layer, returning the full concatenation
    ///
    /// # Arguments
    /// * `layer_idx` - Layer index
    /// * `k` - Key tensor [batch, n_kv_heads, seq_len, head_dim]
    /// * `v` - Value tensor [batch, n_kv_heads, seq_len, head_dim]
    ///
    /// # Returns
    /// Concatenated (k, v) including previously cached entries
    pub fn append(&mut self, layer_idx: usize, k: Tensor, v: Tensor) -> Result<(Tensor, Tensor)> {
        if k.shape().len() != 4 || v.shape().len() != 4 {
            anyhow::bail!(
                "Expected 4D K/V tensors, got shapes {:?} and {:?}",
                k.shape(),
                v.shape()
            );
        }

        while self.cache.len() <= layer_idx {
            self.cache.push((Tensor::zeros(&[0]), Tensor::zeros(&[0])));
        }

        let (cached_k, cached_v) = &self.cache[layer_idx];

        if self.cached_len(layer_idx) == 0 {
            self.cache[layer_idx] = (k.clone(), v.clone());
            return Ok((k, v));
        }

        let old_shape = cached_k.shape();
        let new_shape = k.shape();
        if old_shape[0] != new_shape[0]
            || old_shape[1] != new_shape[1]
            || old_shape[3] != new_shape[3]
        {
            anyhow::bail!(
                "KV cache shape mismatch: cached {:?} vs new {:?} (batch, heads, head_dim must match)",
                old_shape,
                new_shape
            );
        }

        // Concatenate along the sequence dimension. Data is laid out as
        // [batch, heads, seq, head_dim], so the merge has to interleave per
        // (batch, head) block rather than append flat.
        let (batch, heads, head_dim) = (old_shape[0], old_shape[1], old_shape[3]);
        let (old_len, add_len) = (old_shape[2], new_shape[2]);
        let total_len = old_len + add_len;

        let mut k_data = Vec::with_capacity(batch * heads * total_len * head_dim);
        let mut v_data = Vec::with_capacity(batch * heads * total_len * head_dim);
        let (old_k, old_v) = (cached_k.data(), cached_v.data());
        let (new_k, new_v) = (k.data(), v.data());

        for bh in 0..batch * heads {
            let old_base = bh * old_len * head_dim;
            let new_base = bh * add_len * head_dim;
            k_data.extend_from_slice(&old_k[old_base..old_base + old_len * head_dim]);
            k_data.extend_from_slice(&new_k[new_base..new_base + add_len * head_dim]);
            v_data.extend_from_slice(&old_v[old_base..old_base + old_len * head_dim]);
            v_data.extend_from_slice(&new_v[new_base..new_base + add_len * head_dim]);
        }

        let k_concat = Tensor::new(&k_data, &[batch, heads, total_len, head_dim]);
        let v_concat = Tensor::new(&v_data, &[batch, heads, total_len, head_dim]);

        self.cache[layer_idx] = (k_concat.clone(), v_concat.clone());
        Ok((k_concat, v_concat))
    }

    /// Clear all cached state
    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

impl Default for KVCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_causal_mask_no_offset() {
        let mask = causal_mask_with_offset(3, 3, 0);
        let data = mask.data();
        // Row 0 sees only column 0
        assert_eq!(data[0], 0.0);
        assert_eq!(data[1], f32::NEG_INFINITY);
        assert_eq!(data[2], f32::NEG_INFINITY);
        // Row 2 sees everything
        assert_eq!(&data[6..9], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_causal_mask_with_cache_offset() {
        // One query after two cached keys: sees all three columns
        let mask = causal_mask_with_offset(1, 3, 2);
        assert_eq!(mask.data(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_mask_geometry_mismatch_rejected() {
        let scores = Tensor::zeros(&[1, 1, 2, 2]);
        let mask = Tensor::zeros(&[3, 3]);
        assert!(apply_additive_mask(&scores, &mask).is_err());
    }

    #[test]
    fn test_kv_cache_append_tracks_length() {
        let mut cache = KVCache::new();
        assert_eq!(cache.cached_len(0), 0);

        let k = Tensor::ones(&[1, 2, 3, 4]);
        let v = Tensor::ones(&[1, 2, 3, 4]);
        let (k_all, _) = cache.append(0, k, v).unwrap();
        assert_eq!(k_all.shape(), &[1, 2, 3, 4]);
        assert_eq!(cache.cached_len(0), 3);

        let k2 = Tensor::ones(&[1, 2, 2, 4]);
        let v2 = Tensor::ones(&[1, 2, 2, 4]);
        let (k_all, v_all) = cache.append(0, k2, v2).unwrap();
        assert_eq!(k_all.shape(), &[1, 2, 5, 4]);
        assert_eq!(v_all.shape(), &[1, 2, 5, 4]);
        assert_eq!(cache.cached_len(0), 5);
    }

    #[test]
    fn test_kv_cache_batch_mismatch_rejected() {
        let mut cache = KVCache::new();
        cache
            .append(0, Tensor::ones(&[1, 2, 3, 4]), Tensor::ones(&[1, 2, 3, 4]))
            .unwrap();

        let result = cache.append(0, Tensor::ones(&[2, 2, 1, 4]), Tensor::ones(&[2, 2, 1, 4]));
        assert!(result.is_err());
    }

    #[test]
    fn test_kv_cache_append_interleaves_per_head() {
        let mut cache = KVCache::new();
        // [1, 2, 1, 1]: head 0 -> 1.0, head 1 -> 2.0
        let k1 = Tensor::new(&[1.0, 2.0], &[1, 2, 1, 1]);
        cache.append(0, k1.clone(), k1).unwrap();

        let k2 = Tensor::new(&[3.0, 4.0], &[1, 2, 1, 1]);
        let (k_all, _) = cache.append(0, k2.clone(), k2).unwrap();

        // Per-head sequences must stay contiguous: head 0 = [1, 3], head 1 = [2, 4]
        assert_eq!(k_all.data(), &[1.0, 3.0, 2.0, 4.0]);
    }
}
