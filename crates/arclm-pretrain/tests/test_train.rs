//! Integration tests for the training loop

use aprender::autograd::Tensor;
use arclm_model::{ArcLmModel, ArcModelConfig};
use arclm_pretrain::optimizer::OptimizerConfig;
use arclm_pretrain::train::{train, train_step, TrainingConfig};

fn tiny_model() -> ArcLmModel {
    let config = ArcModelConfig {
        sequence_len: 16,
        vocab_size: 32,
        n_layer: 1,
        n_head: 2,
        n_kv_head: 2,
        n_embd: 8,
        dropout: None,
        seed: Some(42),
    };
    ArcLmModel::new(config).expect("Failed to create model")
}

fn tiny_optimizer_config(max_steps: usize) -> OptimizerConfig {
    OptimizerConfig {
        learning_rate: 1e-3,
        weight_decay: 0.0,
        beta1: 0.9,
        beta2: 0.95,
        eps: 1e-8,
        warmup_steps: 1,
        max_steps,
        warmup_ratio: None,
        warmdown_ratio: None,
        final_lr_frac: None,
    }
}

#[test]
fn test_train_step_metrics_finite() {
    let mut model = tiny_model();
    let batch = Tensor::new(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0], &[2, 4]);

    let results = train_step(&mut model, &batch, 0, true).expect("Training step failed");

    assert!(results.lm_loss.is_finite());
    assert!(results.arc_loss.is_finite());
    assert!(results.lm_loss >= 0.0);
    assert!(results.arc_loss >= 0.0);
    assert!(results.lm_acc >= 0.0 && results.lm_acc <= 1.0);
    assert!(results.arc_acc >= 0.0 && results.arc_acc <= 1.0);
    assert!(results.lm_pcorr >= 0.0 && results.lm_pcorr <= 1.0);
    assert!(results.arc_pcorr >= 0.0 && results.arc_pcorr <= 1.0);
}

#[test]
fn test_train_step_combines_losses() {
    let mut model = tiny_model();
    let batch = Tensor::new(&[1.0, 2.0, 3.0, 4.0], &[1, 4]);

    let results = train_step(&mut model, &batch, 0, true).expect("Training step failed");

    let combined = results.lm_loss + results.arc_loss;
    assert!((results.loss - combined).abs() < 1e-6);
}

#[test]
fn test_train_step_debug_deterministic() {
    let mut model = tiny_model();
    let batch = Tensor::new(&[3.0, 1.0, 4.0, 1.0], &[1, 4]);

    let first = train_step(&mut model, &batch, 0, true).expect("Training step failed");
    let second = train_step(&mut model, &batch, 0, true).expect("Training step failed");

    assert_eq!(first.lm_loss, second.lm_loss);
    assert_eq!(first.arc_loss, second.arc_loss);
}

#[test]
fn test_train_step_with_padded_batch() {
    let mut model = tiny_model();
    let batch = Tensor::new(&[5.0, 6.0, 7.0, 0.0], &[1, 4]);

    let results = train_step(&mut model, &batch, 0, true).expect("Training step failed");

    assert!(results.loss.is_finite());
}

#[test]
fn test_train_loop_consumes_batch_source() {
    let mut model = tiny_model();

    let training_config = TrainingConfig {
        batch_size: 1,
        seq_len: 4,
        gradient_accumulation_steps: 2,
        max_steps: 4,
        log_interval: 1,
        pad_token_id: 0,
        debug_negatives: true,
    };

    let mut supplied = 0;
    let next_batch = move || {
        supplied += 1;
        if supplied > 10 {
            return Ok(None);
        }
        Ok(Some(Tensor::new(&[1.0, 2.0, 3.0, 4.0], &[1, 4])))
    };

    train(
        &mut model,
        next_batch,
        &training_config,
        &tiny_optimizer_config(4),
    )
    .expect("Training failed");
}

#[test]
fn test_train_loop_stops_when_source_dries_up() {
    let mut model = tiny_model();

    let training_config = TrainingConfig {
        batch_size: 1,
        seq_len: 4,
        gradient_accumulation_steps: 1,
        max_steps: 100,
        log_interval: 10,
        pad_token_id: 0,
        debug_negatives: true,
    };

    let mut remaining = 3;
    let next_batch = move || {
        if remaining == 0 {
            return Ok(None);
        }
        remaining -= 1;
        Ok(Some(Tensor::new(&[1.0, 2.0, 3.0, 4.0], &[1, 4])))
    };

    // Must terminate despite max_steps being far larger than the batch count
    train(
        &mut model,
        next_batch,
        &training_config,
        &tiny_optimizer_config(100),
    )
    .expect("Training failed");
}
