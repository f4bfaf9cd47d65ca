//! Decoder-only transformer backbone
//!
//! The backbone exposes one capability: `forward(ids, mask, positions,
//! cache) -> hidden states`. The arc forward pass drives it twice per step
//! with different masks and position layouts; nothing here knows about the
//! arc objective itself.

use crate::attention::{KVCache, SelfAttention};
use crate::config::ArcModelConfig;
use crate::init::init_linear_weight;
use crate::mlp::Mlp;
use crate::norm::rms_norm;
use crate::rope::precompute_rotary_embeddings;
use anyhow::Result;
use aprender::autograd::Tensor;

/// Transformer decoder block
///
/// Pre-norm residual layout: x = x + attn(norm(x)), then x = x + mlp(norm(x)).
pub struct Block {
    attn: SelfAttention,
    mlp: Mlp,
    /// Layer index (for the KV cache)
    layer_idx: usize,
}

impl Block {
    /// Create a new decoder block
    pub fn new(config: &ArcModelConfig, layer_idx: usize) -> Self {
        let attn = SelfAttention::new(
            config.n_embd,
            config.n_head,
            config.n_kv_head,
            config.dropout,
            config.seed.map(|s| s.wrapping_add(layer_idx as u64)),
        );
        let mlp = Mlp::new(config.n_embd);

        Self {
            attn,
            mlp,
            layer_idx,
        }
    }

    /// Forward pass through the block
    ///
    /// # Arguments
    /// * `x` - Input tensor [batch, seq_len, n_embd]
    /// * `mask` - Optional additive attention mask override
    /// * `positions` - RoPE position per token
    /// * `cos_sin` - Precomputed RoPE frequency tables
    /// * `kv_cache` - Optional KV cache
    pub fn forward(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        positions: &[usize],
        cos_sin: (&Tensor, &Tensor),
        kv_cache: Option<&mut KVCache>,
    ) -> Result<Tensor> {
        let x_norm = rms_norm(x)?;
        let attn_out = self
            .attn
            .forward(&x_norm, mask, positions, cos_sin, kv_cache, self.layer_idx)?;

        if attn_out.shape() != x.shape() {
            anyhow::bail!(
                "Attention output shape {:?} doesn't match input shape {:?}",
                attn_out.shape(),
                x.shape()
            );
        }
        let x = attn_out.add(x);

        let x_norm = rms_norm(&x)?;
        let mlp_out = self.mlp.forward(&x_norm)?;

        Ok(mlp_out.add(&x))
    }

    /// Set training mode (controls attention dropout)
    pub fn set_training(&mut self, training: bool) {
        self.attn.set_training(training);
    }

    /// Immutable references to the learnable parameters
    pub fn parameters(&self) -> Vec<&Tensor> {
        let mut params = self.attn.parameters();
        params.extend(self.mlp.parameters());
        params
    }

    /// Mutable references to the learnable parameters
    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.attn.parameters_mut();
        params.extend(self.mlp.parameters_mut());
        params
    }
}

/// Transformer backbone: token embedding, decoder blocks, final RMSNorm
pub struct Transformer {
    config: ArcModelConfig,
    /// Token embedding matrix [vocab_size, n_embd]
    wte: Tensor,
    blocks: Vec<Block>,
    rope_cos: Tensor,
    rope_sin: Tensor,
}

impl Transformer {
    /// Create a new backbone from a validated configuration
    pub fn new(config: ArcModelConfig) -> Result<Self> {
        config.validate()?;

        let wte = init_linear_weight(config.n_embd, config.vocab_size, config.seed);
        let blocks = (0..config.n_layer)
            .map(|layer_idx| Block::new(&config, layer_idx))
            .collect();
        let (rope_cos, rope_sin) =
            precompute_rotary_embeddings(config.sequence_len, config.head_dim(), 10000.0)?;

        Ok(Self {
            config,
            wte,
            blocks,
            rope_cos,
            rope_sin,
        })
    }

    /// Model configuration
    pub fn config(&self) -> &ArcModelConfig {
        &self.config
    }

    /// Look up token embeddings: [batch, seq_len] -> [batch, seq_len, n_embd]
    fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        let shape = input_ids.shape();
        let (batch, seq_len) = (shape[0], shape[1]);
        let n_embd = self.config.n_embd;
        let vocab_size = self.config.vocab_size;

        let ids = input_ids.data();
        let wte = self.wte.data();
        let mut output = Vec::with_capacity(batch * seq_len * n_embd);

        for &id in ids.iter() {
            let token = id as usize;
            if id < 0.0 || token >= vocab_size {
                anyhow::bail!(
                    "Token id {} out of vocabulary range 0..{}",
                    id,
                    vocab_size
                );
            }
            output.extend_from_slice(&wte[token * n_embd..(token + 1) * n_embd]);
        }

        Ok(Tensor::new(&output, &[batch, seq_len, n_embd]))
    }

    /// Forward pass producing hidden states
    ///
    /// # Arguments
    /// * `input_ids` - Token ids [batch, seq_len]
    /// * `mask` - Optional additive attention mask [seq_len, total_seq_len];
    ///   None gives standard causal attention over cache + current tokens
    /// * `positions` - Optional RoPE position override per token; None gives
    ///   cache_len..cache_len+seq_len
    /// * `cache` - Optional KV cache, mutated in place with append semantics
    ///
    /// # Returns
    /// Hidden states [batch, seq_len, n_embd] after the final RMSNorm
    pub fn forward(
        &self,
        input_ids: &Tensor,
        mask: Option<&Tensor>,
        positions: Option<&[usize]>,
        mut cache: Option<&mut KVCache>,
    ) -> Result<Tensor> {
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
        if seq_len > self.config.sequence_len {
            anyhow::bail!(
                "Sequence length {} exceeds configured maximum {}",
                seq_len,
                self.config.sequence_len
            );
        }

        let cached_len = match cache.as_ref() {
            Some(c) => c.cached_len(0),
            None => 0,
        };
        let default_positions;
        let positions = match positions {
            Some(p) => p,
            None => {
                default_positions = (cached_len..cached_len + seq_len).collect::<Vec<usize>>();
                default_positions.as_slice()
            }
        };

        let mut x = self.embed(input_ids)?;
        let cos_sin = (&self.rope_cos, &self.rope_sin);

        for block in &self.blocks {
            x = block.forward(&x, mask, positions, cos_sin, cache.as_deref_mut())?;
        }

        rms_norm(&x)
    }

    /// Set training mode for all blocks
    pub fn set_training(&mut self, training: bool) {
        for block in &mut self.blocks {
            block.set_training(training);
        }
    }

    /// Immutable references to the learnable parameters
    pub fn parameters(&self) -> Vec<&Tensor> {
        let mut params: Vec<&Tensor> = vec![&self.wte];
        for block in &self.blocks {
            params.extend(block.parameters());
        }
        params
    }

    /// Mutable references to the learnable parameters
    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params: Vec<&mut Tensor> = vec![&mut self.wte];
        for block in &mut self.blocks {
            params.extend(block.parameters_mut());
        }
        params
    }
}
