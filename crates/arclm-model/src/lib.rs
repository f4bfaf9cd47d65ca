//! Transformer backbone and arc-forward subsystem for arclm
//!
//! This crate implements a decoder-only transformer and the arc pretraining
//! forward pass built on top of it:
//! - Multi-head attention with Group-Query Attention (GQA) and a KV cache
//!   that accepts external mask and position overrides
//! - MLP with ReLU² activation, RMSNorm, Rotary Position Embeddings (RoPE)
//! - The dual-pass arc forward: LM pass, negative sampling from the model's
//!   own distribution, a masked incremental pass over the shared cache, and
//!   real/fake target assembly
//!
//! # Example
//!
//! ```no_run
//! use arclm_model::{ArcLmModel, ArcModelConfig};
//! use aprender::autograd::Tensor;
//!
//! let config = ArcModelConfig {
//!     sequence_len: 16,
//!     vocab_size: 64,
//!     n_layer: 2,
//!     n_head: 2,
//!     n_kv_head: 2,
//!     n_embd: 8,
//!     dropout: None,
//!     seed: Some(42),
//! };
//! let mut model = ArcLmModel::new(config)?;
//!
//! // One training batch of token ids [batch=1, seq_len=4]
//! let input_ids = Tensor::new(&[5.0, 6.0, 7.0, 0.0], &[1, 4]);
//!
//! let out = model.forward(&input_ids, 0, false)?;
//! // out.lm_log_probs: [1, 4, 64]
//! // out.arc_preds:    [1, 8, 2]
//! // out.arc_targets:  [1, 8]
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod arc;
pub mod attention;
pub mod config;
mod init;
pub mod mlp;
pub mod norm;
pub mod rope;
pub mod stability;
pub mod transformer;

/// Arc forward pass
///
/// The dual-pass driver plus its builders: attention mask, position ids,
/// negative sampler, and target assembler.
pub use arc::{
    arc_attention_mask, arc_position_ids, build_arc_targets, sample_negative_ids,
    shifted_negative_ids, ArcForwardOutput, ArcLmModel, ARC_IGNORE_INDEX,
};

/// Model configuration
pub use config::ArcModelConfig;

/// Transformer backbone
pub use transformer::Transformer;

/// Attention components
pub use attention::{KVCache, SelfAttention};

// Re-export common types for convenience
/// Result type alias for error handling
pub use anyhow::Result;
/// Error type alias for error handling
pub use anyhow::Error;
