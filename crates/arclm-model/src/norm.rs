//! RMSNorm normalization

use anyhow::Result;
use aprender::autograd::Tensor;
use aprender::nn::{Module, RMSNorm};

/// Apply RMSNorm over the last dimension (no learnable parameters)
///
/// RMSNorm: x / sqrt(mean(x^2) + eps). Unlike LayerNorm there is no mean
/// subtraction.
///
/// # Arguments
/// * `x` - Input tensor of shape [..., hidden_dim]
///
/// # Returns
/// Normalized tensor with the same shape as the input
pub fn rms_norm(x: &Tensor) -> Result<Tensor> {
    let shape = x.shape();
    if shape.is_empty() {
        anyhow::bail!("Input tensor must have at least one dimension");
    }

    let hidden_dim = shape[shape.len() - 1];
    let norm = RMSNorm::without_affine(&[hidden_dim]);

    Ok(norm.forward(x))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_norm_shape() {
        let x = Tensor::ones(&[2, 4]);
        let result = rms_norm(&x).expect("RMSNorm failed");
        assert_eq!(result.shape(), x.shape());
    }

    #[test]
    fn test_rms_norm_zero_input() {
        let x = Tensor::zeros(&[2, 4]);
        // Zero input may produce NaN/Inf but must not panic
        assert!(rms_norm(&x).is_ok());
    }
}
