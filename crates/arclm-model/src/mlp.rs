//! MLP with ReLU² activation

use anyhow::Result;
use aprender::autograd::Tensor;
use aprender::nn::{Linear, Module, ReLU};

/// MLP layer with ReLU² activation
///
/// Expansion n_embd -> 4 * n_embd, ReLU² (relu(x) squared), projection back
/// to n_embd.
pub struct Mlp {
    /// Expansion layer: n_embd -> 4 * n_embd
    c_fc: Linear,
    /// Projection layer: 4 * n_embd -> n_embd
    c_proj: Linear,
    relu: ReLU,
}

impl Mlp {
    /// Create a new MLP layer
    pub fn new(n_embd: usize) -> Self {
        Self {
            c_fc: Linear::new(n_embd, 4 * n_embd),
            c_proj: Linear::new(4 * n_embd, n_embd),
            relu: ReLU::new(),
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Input tensor [batch, seq_len, n_embd]
    ///
    /// # Returns
    /// Output tensor [batch, seq_len, n_embd]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.c_fc.forward(x);

        // ReLU²: relu(x) * relu(x)
        let x = self.relu.forward(&x);
        let squared: Vec<f32> = x.data().iter().map(|&v| v * v).collect();
        let x = Tensor::new(&squared, x.shape());

        Ok(self.c_proj.forward(&x))
    }

    /// Immutable references to the learnable parameters
    pub fn parameters(&self) -> Vec<&Tensor> {
        let mut params = Vec::new();
        params.extend(self.c_fc.parameters());
        params.extend(self.c_proj.parameters());
        params
    }

    /// Mutable references to the learnable parameters
    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = Vec::new();
        params.extend(self.c_fc.parameters_mut());
        params.extend(self.c_proj.parameters_mut());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mlp_forward_shape() {
        let mlp = Mlp::new(16);
        let x = Tensor::ones(&[1, 10, 16]);

        let output = mlp.forward(&x).unwrap();

        assert_eq!(output.shape(), &[1, 10, 16]);
    }

    #[test]
    fn test_mlp_finite_output() {
        let mlp = Mlp::new(4);
        let x = Tensor::new(&[-1.0, 0.0, 1.0, 2.0], &[1, 1, 4]);

        let output = mlp.forward(&x).unwrap();

        assert!(!output.data().iter().any(|&v| v.is_nan() || v.is_infinite()));
    }
}
