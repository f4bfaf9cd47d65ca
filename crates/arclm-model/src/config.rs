//! Model configuration

use anyhow::Result;

/// Configuration for the arc language model
#[derive(Debug, Clone)]
pub struct ArcModelConfig {
    /// Maximum sequence length
    pub sequence_len: usize,
    /// Vocabulary size
    pub vocab_size: usize,
    /// Number of transformer layers
    pub n_layer: usize,
    /// Number of query heads
    pub n_head: usize,
    /// Number of key/value heads (for GQA)
    pub n_kv_head: usize,
    /// Embedding dimension
    pub n_embd: usize,
    /// Attention dropout probability (None or 0.0 = disabled)
    pub dropout: Option<f32>,
    /// Random seed for weight init and negative sampling (None = non-deterministic)
    pub seed: Option<u64>,
}

impl Default for ArcModelConfig {
    fn default() -> Self {
        Self {
            sequence_len: 1024,
            vocab_size: 50304,
            n_layer: 12,
            n_head: 6,
            n_kv_head: 6,
            n_embd: 768,
            dropout: None,
            seed: None,
        }
    }
}

impl ArcModelConfig {
    /// Validate internal consistency of the configuration
    ///
    /// # Returns
    /// Error if the head/embedding geometry is inconsistent
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            anyhow::bail!("vocab_size must be at least 1");
        }
        if self.sequence_len == 0 {
            anyhow::bail!("sequence_len must be at least 1");
        }
        if self.n_head == 0 || self.n_kv_head == 0 {
            anyhow::bail!("n_head and n_kv_head must be at least 1");
        }
        if !self.n_embd.is_multiple_of(self.n_head) {
            anyhow::bail!(
                "n_embd {} must be divisible by n_head {}",
                self.n_embd,
                self.n_head
            );
        }
        if !self.n_head.is_multiple_of(self.n_kv_head) {
            anyhow::bail!(
                "n_head {} must be divisible by n_kv_head {}",
                self.n_head,
                self.n_kv_head
            );
        }
        let head_dim = self.n_embd / self.n_head;
        if !head_dim.is_multiple_of(2) {
            anyhow::bail!("head_dim {} must be even for RoPE", head_dim);
        }
        Ok(())
    }

    /// Head dimension derived from embedding size and head count
    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }
}
