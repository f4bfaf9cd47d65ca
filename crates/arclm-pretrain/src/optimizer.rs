//! Optimizer and learning-rate schedule for pretraining

use anyhow::Result;
use aprender::nn::optim::{AdamW, Optimizer};
use arclm_model::ArcLmModel;

/// Optimizer configuration
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
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
    /// Number of warmup steps
    pub warmup_steps: usize,
    /// Total number of training steps
    pub max_steps: usize,
    /// Warmup ratio; overrides warmup_steps when set
    pub warmup_ratio: Option<f32>,
    /// Warmdown ratio of max_steps spent on linear decay
    pub warmdown_ratio: Option<f32>,
    /// Final LR as a fraction of the peak LR
    pub final_lr_frac: Option<f32>,
}

/// Learning-rate multiplier for a given step
///
/// Linear warmup to 1.0, constant plateau, then linear warmdown to
/// `final_lr_frac`.
///
/// # Arguments
/// * `step` - Current training step (0-indexed)
/// * `warmup_steps` - Number of warmup steps
/// * `warmdown_steps` - Number of warmdown steps
/// * `total_steps` - Total number of training steps
/// * `final_lr_frac` - Final learning rate as a fraction of the initial LR
pub fn get_lr_multiplier(
    step: usize,
    warmup_steps: usize,
    warmdown_steps: usize,
    total_steps: usize,
    final_lr_frac: f32,
) -> f32 {
    if step < warmup_steps {
        (step + 1) as f32 / warmup_steps as f32
    } else if step <= total_steps.saturating_sub(warmdown_steps) {
        1.0
    } else {
        let progress = (total_steps - step) as f32 / warmdown_steps as f32;
        progress + (1.0 - progress) * final_lr_frac
    }
}

/// Scheduled learning rate for a step, derived from the config
pub fn scheduled_lr(config: &OptimizerConfig, step: usize) -> f32 {
    let warmup_steps = match config.warmup_ratio {
        Some(ratio) => (ratio * config.max_steps as f32) as usize,
        None => config.warmup_steps,
    };
    let warmdown_steps = (config.warmdown_ratio.unwrap_or(0.0) * config.max_steps as f32) as usize;
    let final_lr_frac = config.final_lr_frac.unwrap_or(0.0);

    let multiplier = get_lr_multiplier(
        step,
        warmup_steps.max(1),
        warmdown_steps,
        config.max_steps,
        final_lr_frac,
    );

    config.learning_rate * multiplier
}

/// Apply one optimizer update at the scheduled learning rate
///
/// The optimizer borrows the model's parameters only for the duration of the
/// update, so the model stays free for the next forward pass.
///
/// # Arguments
/// * `model` - The model whose parameters are updated
/// * `config` - Optimizer configuration
/// * `step` - Current training step (drives the LR schedule)
///
/// # Returns
/// The learning rate that was applied
pub fn apply_update(model: &mut ArcLmModel, config: &OptimizerConfig, step: usize) -> Result<f32> {
    let lr = scheduled_lr(config, step);

    let parameters = model.parameters_mut();
    if parameters.is_empty() {
        anyhow::bail!("Model has no parameters to optimize");
    }

    let mut optimizer = AdamW::new(parameters, config.learning_rate);
    optimizer.set_lr(lr);
    optimizer.step();
    optimizer.zero_grad();

    Ok(lr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup_ramps_linearly() {
        assert!((get_lr_multiplier(0, 10, 0, 100, 0.0) - 0.1).abs() < 1e-6);
        assert!((get_lr_multiplier(4, 10, 0, 100, 0.0) - 0.5).abs() < 1e-6);
        assert!((get_lr_multiplier(9, 10, 0, 100, 0.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_plateau_is_constant() {
        assert_eq!(get_lr_multiplier(50, 10, 20, 100, 0.0), 1.0);
        assert_eq!(get_lr_multiplier(80, 10, 20, 100, 0.0), 1.0);
    }

    #[test]
    fn test_warmdown_reaches_final_fraction() {
        let final_frac = 0.1;
        let end = get_lr_multiplier(100, 10, 20, 100, final_frac);
        assert!((end - final_frac).abs() < 1e-6);
    }

    #[test]
    fn test_scheduled_lr_scales_peak() {
        let config = OptimizerConfig {
            learning_rate: 1e-3,
            weight_decay: 0.1,
            beta1: 0.9,
            beta2: 0.95,
            eps: 1e-8,
            warmup_steps: 10,
            max_steps: 100,
            warmup_ratio: None,
            warmdown_ratio: Some(0.2),
            final_lr_frac: Some(0.0),
        };

        assert!((scheduled_lr(&config, 0) - 1e-4).abs() < 1e-9);
        assert!((scheduled_lr(&config, 50) - 1e-3).abs() < 1e-9);
    }
}
