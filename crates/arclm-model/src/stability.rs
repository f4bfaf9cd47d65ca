//! Numerical stability checks
//!
//! Degenerate values are not masked inside the forward pass; these helpers
//! let the trainer detect them in losses and metrics after the fact.

use anyhow::Result;
use aprender::autograd::Tensor;

/// Check if a tensor contains any NaN values
pub fn has_nan(tensor: &Tensor) -> bool {
    tensor.data().iter().any(|&x| x.is_nan())
}

/// Check if a tensor contains any Inf values
pub fn has_inf(tensor: &Tensor) -> bool {
    tensor.data().iter().any(|&x| x.is_infinite())
}

/// Validate that a tensor contains neither NaN nor Inf
///
/// # Arguments
/// * `tensor` - Tensor to validate
/// * `name` - Name used in the error message
pub fn validate_tensor(tensor: &Tensor, name: &str) -> Result<()> {
    if has_nan(tensor) {
        anyhow::bail!("Tensor '{}' contains NaN values", name);
    }
    if has_inf(tensor) {
        anyhow::bail!("Tensor '{}' contains Inf values", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_tensor_passes() {
        let tensor = Tensor::ones(&[2, 3]);
        assert!(validate_tensor(&tensor, "test").is_ok());
    }

    #[test]
    fn test_nan_detected() {
        let tensor = Tensor::new(&[1.0, f32::NAN], &[2]);
        assert!(has_nan(&tensor));
        assert!(validate_tensor(&tensor, "test").is_err());
    }

    #[test]
    fn test_inf_detected() {
        let tensor = Tensor::new(&[1.0, f32::INFINITY], &[2]);
        assert!(has_inf(&tensor));
        assert!(validate_tensor(&tensor, "test").is_err());
    }
}
