//! Pretraining binary for the arc language model
//!
//! Runs the training loop against synthetic in-memory batches. Corpus
//! ingestion and tokenization are external concerns; this binary exists to
//! drive and smoke-test the training stack end to end.
//!
//! # Usage
//!
//! ```bash
//! arclm-pretrain \
//!   [--config config.json] \
//!   [--steps 100] \
//!   [--seed 42] \
//!   [--debug-negatives] \
//!   [--quiet]
//! ```

use anyhow::{Context, Result};
use aprender::autograd::Tensor;
use arclm_model::{ArcLmModel, ArcModelConfig};
use arclm_pretrain::{
    config::TrainingConfigFile,
    optimizer::OptimizerConfig,
    train::{train, TrainingConfig},
};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;

/// Pretraining stage for the arc language model
#[derive(Parser, Debug)]
#[command(name = "arclm-pretrain")]
#[command(about = "Arc-discrimination pretraining for the base language model", long_about = None)]
struct Args {
    /// Path to training configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the number of training steps
    #[arg(long)]
    steps: Option<usize>,

    /// Override the random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Use the deterministic shift-based negative sampler
    #[arg(long)]
    debug_negatives: bool,

    /// Suppress progress output
    #[arg(long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config_file = match &args.config {
        Some(path) => TrainingConfigFile::from_file(path).context("Failed to load config file")?,
        None => TrainingConfigFile::default(),
    };

    let seed = args.seed.or(config_file.training.seed);

    let model_config = ArcModelConfig {
        sequence_len: config_file.model.sequence_len,
        vocab_size: config_file.model.vocab_size,
        n_layer: config_file.model.n_layer,
        n_head: config_file.model.n_head,
        n_kv_head: config_file.model.n_kv_head,
        n_embd: config_file.model.n_embd,
        dropout: None,
        seed,
    };
    let mut model = ArcLmModel::new(model_config).context("Failed to create model")?;

    let training_config = TrainingConfig {
        batch_size: config_file.training.batch_size,
        seq_len: config_file.training.seq_len,
        gradient_accumulation_steps: config_file.training.gradient_accumulation_steps,
        max_steps: args.steps.unwrap_or(config_file.training.max_steps),
        log_interval: config_file.training.log_interval,
        pad_token_id: config_file.training.pad_token_id,
        debug_negatives: args.debug_negatives || config_file.training.debug_negatives,
    };

    let optimizer_config = OptimizerConfig {
        learning_rate: config_file.optimizer.learning_rate,
        weight_decay: config_file.optimizer.weight_decay,
        beta1: config_file.optimizer.beta1,
        beta2: config_file.optimizer.beta2,
        eps: config_file.optimizer.eps,
        warmup_steps: config_file.optimizer.warmup_steps,
        max_steps: config_file.optimizer.max_steps,
        warmup_ratio: config_file.optimizer.warmup_ratio,
        warmdown_ratio: config_file.optimizer.warmdown_ratio,
        final_lr_frac: config_file.optimizer.final_lr_frac,
    };

    // Synthetic batch source: uniform token ids over the vocabulary
    let vocab_size = config_file.model.vocab_size;
    let batch_size = training_config.batch_size;
    let seq_len = training_config.seq_len;
    let mut rng = StdRng::seed_from_u64(seed.unwrap_or(0));
    let next_batch = move || -> Result<Option<Tensor>> {
        let data: Vec<f32> = (0..batch_size * seq_len)
            .map(|_| rng.gen_range(0..vocab_size) as f32)
            .collect();
        Ok(Some(Tensor::new(&data, &[batch_size, seq_len])))
    };

    train(&mut model, next_batch, &training_config, &optimizer_config)
        .context("Training failed")?;

    if !args.quiet {
        println!("Training completed successfully!");
    }

    Ok(())
}
