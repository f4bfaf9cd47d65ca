//! Weight initialization helpers
//!
//! Normal init with std = 1/sqrt(fan_in) * min(1, sqrt(fan_out/fan_in)),
//! drawn via a Box-Muller transform over a seeded `StdRng`.

use aprender::autograd::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Initialize a weight matrix of shape [out_features, in_features]
///
/// # Arguments
/// * `in_features` - Number of input features (fan_in)
/// * `out_features` - Number of output features (fan_out)
/// * `seed` - Optional random seed for reproducibility
pub(crate) fn init_linear_weight(
    in_features: usize,
    out_features: usize,
    seed: Option<u64>,
) -> Tensor {
    let fan_in = in_features as f32;
    let fan_out = out_features as f32;
    let std = (1.0 / fan_in.sqrt()) * 1.0_f32.min((fan_out / fan_in).sqrt());

    let mut rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };

    let numel = out_features * in_features;
    let data: Vec<f32> = (0..numel)
        .map(|_| {
            let u1: f32 = rng.gen_range(0.0001_f32..1.0_f32);
            let u2: f32 = rng.gen_range(0.0_f32..1.0_f32);
            let z = (-2.0_f32 * u1.ln()).sqrt() * (2.0_f32 * std::f32::consts::PI * u2).cos();
            std * z
        })
        .collect();

    Tensor::new(&data, &[out_features, in_features])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_shape() {
        let weight = init_linear_weight(10, 20, Some(42));
        assert_eq!(weight.shape(), &[20, 10]);
    }

    #[test]
    fn test_init_reproducible() {
        let a = init_linear_weight(10, 20, Some(123));
        let b = init_linear_weight(10, 20, Some(123));
        assert_eq!(a.data(), b.data());
    }
}
