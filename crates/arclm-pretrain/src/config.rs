//! Training configuration loading
//!
//! Hyperparameters are loaded from a JSON file with three sections: model
//! architecture, training loop, and optimizer.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete training configuration loaded from file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfigFile {
    /// Model configuration
    pub model: ModelSection,
    /// Training hyperparameters
    pub training: TrainingSection,
    /// Optimizer configuration
    pub optimizer: OptimizerSection,
}

/// Model architecture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    /// Vocabulary size
    pub vocab_size: usize,
    /// Number of transformer layers
    pub n_layer: usize,
    /// Number of attention heads
    pub n_head: usize,
    /// Number of key-value heads (GQA)
    pub n_kv_head: usize,
    /// Embedding dimension
    pub n_embd: usize,
    /// Maximum sequence length
    pub sequence_len: usize,
}

/// Training loop hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSection {
    /// Batch size
    pub batch_size: usize,
    /// Sequence length
    pub seq_len: usize,
    /// Gradient accumulation steps
    pub gradient_accumulation_steps: usize,
    /// Maximum training steps
    pub max_steps: usize,
    /// Logging interval (steps)
    pub log_interval: usize,
    /// Id of the pad token in the vocabulary
    pub pad_token_id: u32,
    /// Use the deterministic shift-based negative sampler
    #[serde(default)]
    pub debug_negatives: bool,
    /// Random seed for model init and sampling
    pub seed: Option<u64>,
}

/// Optimizer hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSection {
    /// Peak learning rate
    pub learning_rate: f32,
    /// Weight decay
    pub weight_decay: f32,
    /// AdamW beta1
    pub beta1: f32,
    /// AdamW beta2
    pub beta2: f32,
    /// AdamW epsilon
    pub eps: f32,
    /// Warmup steps
    pub warmup_steps: usize,
    /// Maximum steps (for the schedule)
    pub max_steps: usize,
    /// Warmup ratio (overrides warmup_steps when set)
    pub warmup_ratio: Option<f32>,
    /// Warmdown ratio for the linear decay phase
    pub warmdown_ratio: Option<f32>,
    /// Final LR as a fraction of the peak LR
    pub final_lr_frac: Option<f32>,
}

impl TrainingConfigFile {
    /// Load configuration from a JSON file
    ///
    /// # Arguments
    /// * `path` - Path to the JSON configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: TrainingConfigFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Default configuration for smoke runs
    #[allow(clippy::should_implement_trait)]
    pub fn default() -> Self {
        Self {
            model: ModelSection {
                vocab_size: 50304,
                n_layer: 12,
                n_head: 6,
                n_kv_head: 6,
                n_embd: 768,
                sequence_len: 1024,
            },
            training: TrainingSection {
                batch_size: 32,
                seq_len: 256,
                gradient_accumulation_steps: 1,
                max_steps: 10000,
                log_interval: 100,
                pad_token_id: 0,
                debug_negatives: false,
                seed: Some(42),
            },
            optimizer: OptimizerSection {
                learning_rate: 1e-4,
                weight_decay: 0.1,
                beta1: 0.9,
                beta2: 0.95,
                eps: 1e-8,
                warmup_steps: 1000,
                max_steps: 10000,
                warmup_ratio: None,
                warmdown_ratio: Some(0.2),
                final_lr_frac: Some(0.0),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_default() {
        let config = TrainingConfigFile::default();
        assert_eq!(config.model.vocab_size, 50304);
        assert_eq!(config.training.pad_token_id, 0);
        assert!(!config.training.debug_negatives);
    }

    #[test]
    fn test_config_from_file() {
        let config_json = r#"{
            "model": {
                "vocab_size": 1000,
                "n_layer": 4,
                "n_head": 2,
                "n_kv_head": 2,
                "n_embd": 128,
                "sequence_len": 512
            },
            "training": {
                "batch_size": 16,
                "seq_len": 128,
                "gradient_accumulation_steps": 2,
                "max_steps": 5000,
                "log_interval": 50,
                "pad_token_id": 3,
                "debug_negatives": true,
                "seed": 7
            },
            "optimizer": {
                "learning_rate": 0.0002,
                "weight_decay": 0.05,
                "beta1": 0.85,
                "beta2": 0.99,
                "eps": 1e-7,
                "warmup_steps": 500,
                "max_steps": 5000,
                "warmup_ratio": null,
                "warmdown_ratio": 0.1,
                "final_lr_frac": 0.1
            }
        }"#;

        let mut file = NamedTempFile::new().expect("Failed to create temp file");
        file.write_all(config_json.as_bytes()).expect("Failed to write config");
        file.flush().expect("Failed to flush");

        let config = TrainingConfigFile::from_file(file.path()).expect("Failed to load config");

        assert_eq!(config.model.vocab_size, 1000);
        assert_eq!(config.training.pad_token_id, 3);
        assert!(config.training.debug_negatives);
        assert_eq!(config.optimizer.learning_rate, 0.0002);
    }

    #[test]
    fn test_config_debug_negatives_defaults_false() {
        let config_json = r#"{
            "model": {
                "vocab_size": 100,
                "n_layer": 1,
                "n_head": 2,
                "n_kv_head": 2,
                "n_embd": 8,
                "sequence_len": 32
            },
            "training": {
                "batch_size": 2,
                "seq_len": 8,
                "gradient_accumulation_steps": 1,
                "max_steps": 10,
                "log_interval": 1,
                "pad_token_id": 0,
                "seed": null
            },
            "optimizer": {
                "learning_rate": 0.001,
                "weight_decay": 0.0,
                "beta1": 0.9,
                "beta2": 0.95,
                "eps": 1e-8,
                "warmup_steps": 1,
                "max_steps": 10,
                "warmup_ratio": null,
                "warmdown_ratio": null,
                "final_lr_frac": null
            }
        }"#;

        let mut file = NamedTempFile::new().expect("Failed to create temp file");
        file.write_all(config_json.as_bytes()).expect("Failed to write config");
        file.flush().expect("Failed to flush");

        let config = TrainingConfigFile::from_file(file.path()).expect("Failed to load config");
        assert!(!config.training.debug_negatives);
    }
}
