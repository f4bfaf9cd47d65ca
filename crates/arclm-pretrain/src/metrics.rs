//! Loss and metric computation for the LM and arc objectives
//!
//! All metric functions take unnormalized (or log-softmaxed; log-softmax is
//! idempotent) class scores of shape [batch, len, classes] and integer-valued
//! targets of shape [batch, len]. Positions whose target equals the ignore
//! index contribute nothing.

use anyhow::Result;
use aprender::autograd::Tensor;

/// Validate score/target geometry, returning (batch, len, classes)
fn validate_pair(scores: &Tensor, targets: &Tensor) -> Result<(usize, usize, usize)> {
    let s_shape = scores.shape();
    let t_shape = targets.shape();

    if s_shape.len() != 3 {
        anyhow::bail!(
            "Expected 3D scores [batch, len, classes], got shape {:?}",
            s_shape
        );
    }
    if t_shape.len() != 2 || t_shape[0] != s_shape[0] || t_shape[1] != s_shape[1] {
        anyhow::bail!(
            "Target shape {:?} doesn't match score shape {:?}",
            t_shape,
            s_shape
        );
    }

    Ok((s_shape[0], s_shape[1], s_shape[2]))
}

/// Log-softmax over the class dimension
fn log_softmax(scores: &Tensor, classes: usize) -> Vec<f32> {
    let data = scores.data();
    let rows = data.len() / classes;

    let mut output = vec![0.0; data.len()];
    for r in 0..rows {
        let offset = r * classes;
        let slice = &data[offset..offset + classes];

        let max_val = slice.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let sum: f32 = slice.iter().map(|&v| (v - max_val).exp()).sum();
        let lse = max_val + sum.ln();

        for i in 0..classes {
            output[offset + i] = slice[i] - lse;
        }
    }

    output
}

/// Resolve a target value to a class index, or None if ignored
fn class_index(target: f32, classes: usize, ignore_index: f32) -> Result<Option<usize>> {
    if target == ignore_index {
        return Ok(None);
    }
    let class = target as usize;
    if target < 0.0 || class >= classes {
        anyhow::bail!(
            "Target {} out of class range 0..{} (ignore index {})",
            target,
            classes,
            ignore_index
        );
    }
    Ok(Some(class))
}

/// Mean negative log-likelihood over non-ignored positions
pub fn loss(scores: &Tensor, targets: &Tensor, ignore_index: f32) -> Result<f32> {
    let (_, _, classes) = validate_pair(scores, targets)?;
    let log_probs = log_softmax(scores, classes);

    let mut total = 0.0;
    let mut count = 0;
    for (pos, &t) in targets.data().iter().enumerate() {
        if let Some(class) = class_index(t, classes, ignore_index)? {
            total -= log_probs[pos * classes + class];
            count += 1;
        }
    }

    // A batch where every position is ignored has nothing to score
    Ok(if count == 0 { 0.0 } else { total / count as f32 })
}

/// Perplexity: exp of the mean NLL
pub fn ppl(scores: &Tensor, targets: &Tensor, ignore_index: f32) -> Result<f32> {
    Ok(loss(scores, targets, ignore_index)?.exp())
}

/// Fraction of non-ignored positions where the argmax class is the target
pub fn acc(scores: &Tensor, targets: &Tensor, ignore_index: f32) -> Result<f32> {
    let (_, _, classes) = validate_pair(scores, targets)?;
    let data = scores.data();

    let mut correct = 0;
    let mut count = 0;
    for (pos, &t) in targets.data().iter().enumerate() {
        if let Some(class) = class_index(t, classes, ignore_index)? {
            let row = &data[pos * classes..(pos + 1) * classes];
            let mut argmax = 0;
            for (i, &v) in row.iter().enumerate() {
                if v > row[argmax] {
                    argmax = i;
                }
            }
            if argmax == class {
                correct += 1;
            }
            count += 1;
        }
    }

    Ok(if count == 0 { 0.0 } else { correct as f32 / count as f32 })
}

/// Mean probability assigned to the target class over non-ignored positions
pub fn pcorr(scores: &Tensor, targets: &Tensor, ignore_index: f32) -> Result<f32> {
    let (_, _, classes) = validate_pair(scores, targets)?;
    let log_probs = log_softmax(scores, classes);

    let mut total = 0.0;
    let mut count = 0;
    for (pos, &t) in targets.data().iter().enumerate() {
        if let Some(class) = class_index(t, classes, ignore_index)? {
            total += log_probs[pos * classes + class].exp();
            count += 1;
        }
    }

    Ok(if count == 0 { 0.0 } else { total / count as f32 })
}

/// Metrics for a single training step: LM and arc objectives side by side
#[derive(Debug, Clone)]
pub struct TrainStepResults {
    /// LM cross-entropy loss
    pub lm_loss: f32,
    /// LM perplexity
    pub lm_ppl: f32,
    /// LM next-token accuracy
    pub lm_acc: f32,
    /// Mean probability assigned to the true next token
    pub lm_pcorr: f32,
    /// Arc discrimination loss
    pub arc_loss: f32,
    /// Arc perplexity
    pub arc_ppl: f32,
    /// Arc real/fake accuracy
    pub arc_acc: f32,
    /// Mean probability assigned to the true arc label
    pub arc_pcorr: f32,
    /// Combined step loss: lm_loss + arc_loss
    pub loss: f32,
}

/// Step-interval metrics logger
pub struct MetricsLogger {
    log_interval: usize,
    step: usize,
}

impl MetricsLogger {
    /// Create a new logger that prints every `log_interval` steps
    pub fn new(log_interval: usize) -> Self {
        Self {
            log_interval,
            step: 0,
        }
    }

    /// Record one step, printing at the configured interval
    pub fn log_step(&mut self, results: &TrainStepResults, learning_rate: f32, throughput: f32) {
        self.step += 1;

        if self.step.is_multiple_of(self.log_interval) {
            println!(
                "Step {:05} | loss={:.4} (lm={:.4} arc={:.4}) | lm_ppl={:.2} lm_acc={:.3} | \
                 arc_acc={:.3} arc_pcorr={:.3} | lr={:.2e} | {:.0} tokens/s",
                self.step,
                results.loss,
                results.lm_loss,
                results.arc_loss,
                results.lm_ppl,
                results.lm_acc,
                results.arc_acc,
                results.arc_pcorr,
                learning_rate,
                throughput
            );
        }
    }

    /// Current step count
    pub fn step(&self) -> usize {
        self.step
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_uniform_scores() {
        // Uniform scores over 2 classes: NLL = ln(2) everywhere
        let scores = Tensor::zeros(&[1, 3, 2]);
        let targets = Tensor::new(&[0.0, 1.0, 0.0], &[1, 3]);

        let value = loss(&scores, &targets, -1.0).unwrap();
        assert!((value - 2.0_f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_loss_ignores_masked_positions() {
        // Position 1 has a wildly wrong score but is ignored
        let scores = Tensor::new(&[5.0, 0.0, -100.0, 100.0, 5.0, 0.0], &[1, 3, 2]);
        let targets = Tensor::new(&[0.0, -1.0, 0.0], &[1, 3]);

        let with_ignore = loss(&scores, &targets, -1.0).unwrap();
        let only_good = loss(
            &Tensor::new(&[5.0, 0.0, 5.0, 0.0], &[1, 2, 2]),
            &Tensor::new(&[0.0, 0.0], &[1, 2]),
            -1.0,
        )
        .unwrap();

        assert!((with_ignore - only_good).abs() < 1e-6);
    }

    #[test]
    fn test_loss_rejects_out_of_range_target() {
        let scores = Tensor::zeros(&[1, 1, 2]);
        let targets = Tensor::new(&[3.0], &[1, 1]);

        assert!(loss(&scores, &targets, -1.0).is_err());
    }

    #[test]
    fn test_ppl_is_exp_loss() {
        let scores = Tensor::zeros(&[1, 2, 4]);
        let targets = Tensor::new(&[1.0, 2.0], &[1, 2]);

        let l = loss(&scores, &targets, -1.0).unwrap();
        let p = ppl(&scores, &targets, -1.0).unwrap();
        assert!((p - l.exp()).abs() < 1e-5);
    }

    #[test]
    fn test_acc_counts_argmax_matches() {
        let scores = Tensor::new(
            &[
                1.0, 0.0, // argmax 0, target 0: correct
                0.0, 1.0, // argmax 1, target 0: wrong
                0.0, 1.0, // argmax 1, ignored
            ],
            &[1, 3, 2],
        );
        let targets = Tensor::new(&[0.0, 0.0, -1.0], &[1, 3]);

        let value = acc(&scores, &targets, -1.0).unwrap();
        assert!((value - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_pcorr_uniform_is_half() {
        let scores = Tensor::zeros(&[1, 4, 2]);
        let targets = Tensor::new(&[0.0, 1.0, 0.0, 1.0], &[1, 4]);

        let value = pcorr(&scores, &targets, -1.0).unwrap();
        assert!((value - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_all_ignored_yields_zero() {
        let scores = Tensor::zeros(&[1, 2, 2]);
        let targets = Tensor::new(&[-1.0, -1.0], &[1, 2]);

        assert_eq!(loss(&scores, &targets, -1.0).unwrap(), 0.0);
        assert_eq!(acc(&scores, &targets, -1.0).unwrap(), 0.0);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let scores = Tensor::zeros(&[1, 2, 2]);
        let targets = Tensor::zeros(&[1, 3]);

        assert!(loss(&scores, &targets, -1.0).is_err());
    }
}
