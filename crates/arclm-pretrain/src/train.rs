//! Training loop for arc pretraining

use crate::metrics::{acc, loss, pcorr, ppl, MetricsLogger, TrainStepResults};
use crate::optimizer::{apply_update, OptimizerConfig};
use anyhow::{Context, Result};
use aprender::autograd::Tensor;
use arclm_model::{ArcLmModel, ARC_IGNORE_INDEX};
use std::time::Instant;

/// Training configuration
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    /// Batch size
    pub batch_size: usize,
    /// Sequence length
    pub seq_len: usize,
    /// Gradient accumulation steps
    pub gradient_accumulation_steps: usize,
    /// Maximum number of training steps
    pub max_steps: usize,
    /// Logging interval (in steps)
    pub log_interval: usize,
    /// Id of the pad token in the vocabulary
    pub pad_token_id: u32,
    /// Use the deterministic shift-based negative sampler
    pub debug_negatives: bool,
}

/// Build next-token targets from an input batch
///
/// targets[t] = input[t+1]; the final position has no successor and is set to
/// the pad id, which the LM metrics treat as ignored.
pub fn next_token_targets(batch: &Tensor, pad_token_id: u32) -> Result<Tensor> {
    let shape = batch.shape();
    if shape.len() != 2 {
        anyhow::bail!(
            "Expected 2D batch [batch_size, seq_len], got shape {:?}",
            shape
        );
    }

    let (batch_size, seq_len) = (shape[0], shape[1]);
    let data = batch.data();

    let mut targets = Vec::with_capacity(batch_size * seq_len);
    for b in 0..batch_size {
        let row = b * seq_len;
        targets.extend_from_slice(&data[row + 1..row + seq_len]);
        targets.push(pad_token_id as f32);
    }

    Ok(Tensor::new(&targets, &[batch_size, seq_len]))
}

/// Run one training step: forward pass plus loss/metric aggregation
///
/// # Arguments
/// * `model` - The arc LM model
/// * `batch` - Input token ids [batch_size, seq_len]
/// * `pad_token_id` - Id of the pad token
/// * `debug` - Use the deterministic negative sampler
///
/// # Returns
/// LM and arc metrics for the step; combined loss = lm_loss + arc_loss
pub fn train_step(
    model: &mut ArcLmModel,
    batch: &Tensor,
    pad_token_id: u32,
    debug: bool,
) -> Result<TrainStepResults> {
    let out = model
        .forward(batch, pad_token_id, debug)
        .context("Arc forward pass failed")?;

    let lm_targets = next_token_targets(batch, pad_token_id)?;
    let pad = pad_token_id as f32;

    let lm_loss = loss(&out.lm_log_probs, &lm_targets, pad)?;
    let lm_ppl = ppl(&out.lm_log_probs, &lm_targets, pad)?;
    let lm_acc = acc(&out.lm_log_probs, &lm_targets, pad)?;
    let lm_pcorr = pcorr(&out.lm_log_probs, &lm_targets, pad)?;

    let arc_loss = loss(&out.arc_preds, &out.arc_targets, ARC_IGNORE_INDEX)?;
    let arc_ppl = ppl(&out.arc_preds, &out.arc_targets, ARC_IGNORE_INDEX)?;
    let arc_acc = acc(&out.arc_preds, &out.arc_targets, ARC_IGNORE_INDEX)?;
    let arc_pcorr = pcorr(&out.arc_preds, &out.arc_targets, ARC_IGNORE_INDEX)?;

    Ok(TrainStepResults {
        lm_loss,
        lm_ppl,
        lm_acc,
        lm_pcorr,
        arc_loss,
        arc_ppl,
        arc_acc,
        arc_pcorr,
        loss: lm_loss + arc_loss,
    })
}

/// Run the full training loop
///
/// Batch supply is the caller's concern: `next_batch` yields token-id
/// batches of shape [batch_size, seq_len] and `None` when exhausted.
///
/// # Arguments
/// * `model` - The arc LM model
/// * `next_batch` - Batch source
/// * `training_config` - Training configuration
/// * `optimizer_config` - Optimizer configuration
pub fn train<F>(
    model: &mut ArcLmModel,
    mut next_batch: F,
    training_config: &TrainingConfig,
    optimizer_config: &OptimizerConfig,
) -> Result<()>
where
    F: FnMut() -> Result<Option<Tensor>>,
{
    model.set_training(true);

    let mut metrics_logger = MetricsLogger::new(training_config.log_interval);
    let mut step = 0;
    let mut accumulation_count = 0;
    let mut learning_rate = 0.0;
    let mut window_start = Instant::now();

    while step < training_config.max_steps {
        let batch = match next_batch().context("Batch source failed")? {
            Some(b) => b,
            None => break,
        };

        let results = train_step(
            model,
            &batch,
            training_config.pad_token_id,
            training_config.debug_negatives,
        )
        .with_context(|| format!("Training step {} failed", step))?;

        if !results.loss.is_finite() {
            eprintln!(
                "Warning: non-finite loss {} at step {} (lm={}, arc={})",
                results.loss, step, results.lm_loss, results.arc_loss
            );
        }

        accumulation_count += 1;
        if accumulation_count >= training_config.gradient_accumulation_steps {
            learning_rate = apply_update(model, optimizer_config, step)
                .context("Optimizer update failed")?;
            accumulation_count = 0;
        }

        let elapsed = window_start.elapsed().as_secs_f32();
        let tokens = training_config.batch_size * training_config.seq_len;
        let throughput = if elapsed > 0.0 {
            tokens as f32 / elapsed
        } else {
            0.0
        };
        metrics_logger.log_step(&results, learning_rate, throughput);
        window_start = Instant::now();

        step += 1;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_token_targets_shift() {
        let batch = Tensor::new(&[1.0, 2.0, 3.0, 4.0], &[1, 4]);
        let targets = next_token_targets(&batch, 0).unwrap();

        assert_eq!(targets.data(), &[2.0, 3.0, 4.0, 0.0]);
    }

    #[test]
    fn test_next_token_targets_per_row() {
        let batch = Tensor::new(&[1.0, 2.0, 5.0, 6.0], &[2, 2]);
        let targets = next_token_targets(&batch, 9).unwrap();

        assert_eq!(targets.data(), &[2.0, 9.0, 6.0, 9.0]);
    }

    #[test]
    fn test_next_token_targets_rejects_bad_rank() {
        let batch = Tensor::new(&[1.0, 2.0], &[2]);
        assert!(next_token_targets(&batch, 0).is_err());
    }
}
