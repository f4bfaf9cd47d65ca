//! Rotary Position Embeddings (RoPE)

use anyhow::Result;
use aprender::autograd::Tensor;

/// Precompute rotary cos/sin frequencies for every position up to `max_seq_len`
///
/// # Arguments
/// * `max_seq_len` - Maximum position to precompute
/// * `head_dim` - Attention head dimension (must be even)
/// * `base` - Base frequency (10000.0 in the standard formulation)
///
/// # Returns
/// Tuple of (cos, sin) tensors with shape [1, max_seq_len, 1, head_dim/2]
pub fn precompute_rotary_embeddings(
    max_seq_len: usize,
    head_dim: usize,
    base: f32,
) -> Result<(Tensor, Tensor)> {
    if !head_dim.is_multiple_of(2) {
        anyhow::bail!("head_dim must be even for RoPE, got {}", head_dim);
    }

    let half_dim = head_dim / 2;

    // Inverse frequencies: 1 / base^(2i/d)
    let inv_freq: Vec<f32> = (0..half_dim)
        .map(|i| 1.0 / base.powf(2.0 * i as f32 / head_dim as f32))
        .collect();

    let mut cos_data = Vec::with_capacity(max_seq_len * half_dim);
    let mut sin_data = Vec::with_capacity(max_seq_len * half_dim);

    for pos in 0..max_seq_len {
        for &freq in &inv_freq {
            let angle = pos as f32 * freq;
            cos_data.push(angle.cos());
            sin_data.push(angle.sin());
        }
    }

    let cos = Tensor::new(&cos_data, &[1, max_seq_len, 1, half_dim]);
    let sin = Tensor::new(&sin_data, &[1, max_seq_len, 1, half_dim]);

    Ok((cos, sin))
}

/// Gather precomputed RoPE rows for an explicit position sequence
///
/// Unlike a prefix slice, this supports non-monotonic position layouts such as
/// the arc pass, where the incremental tokens mirror positions 0..L already
/// present in the cache.
///
/// # Arguments
/// * `rope` - Precomputed cos or sin tensor [1, max_seq_len, 1, half_dim]
/// * `positions` - Position index per token
///
/// # Returns
/// Tensor of shape [1, positions.len(), 1, half_dim]
pub fn gather_rope(rope: &Tensor, positions: &[usize]) -> Result<Tensor> {
    let shape = rope.shape();
    if shape.len() != 4 {
        anyhow::bail!("Expected 4D RoPE tensor, got shape {:?}", shape);
    }

    let max_seq_len = shape[1];
    let half_dim = shape[3];
    let rope_data = rope.data();

    let mut gathered = Vec::with_capacity(positions.len() * half_dim);
    for &pos in positions {
        if pos >= max_seq_len {
            anyhow::bail!(
                "Position {} exceeds precomputed max_seq_len {}",
                pos,
                max_seq_len
            );
        }
        gathered.extend_from_slice(&rope_data[pos * half_dim..(pos + 1) * half_dim]);
    }

    Ok(Tensor::new(&gathered, &[1, positions.len(), 1, half_dim]))
}

/// Apply rotary embeddings to a [batch, n_heads, seq_len, head_dim] tensor
///
/// Splits the head dimension into two halves and rotates each pair:
/// y1 = x1 * cos + x2 * sin, y2 = -x1 * sin + x2 * cos.
///
/// # Arguments
/// * `x` - Input tensor [batch, n_heads, seq_len, head_dim]
/// * `cos` - Cosine frequencies [1, seq_len, 1, head_dim/2]
/// * `sin` - Sine frequencies [1, seq_len, 1, head_dim/2]
///
/// # Returns
/// Rotated tensor, same shape as the input
pub fn apply_rotary_emb(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let shape = x.shape();
    if shape.len() != 4 {
        anyhow::bail!(
            "Expected 4D tensor [batch, n_heads, seq_len, head_dim], got shape {:?}",
            shape
        );
    }

    let (batch, n_heads, seq_len, head_dim) = (shape[0], shape[1], shape[2], shape[3]);
    if !head_dim.is_multiple_of(2) {
        anyhow::bail!("head_dim must be even, got {}", head_dim);
    }
    let half_dim = head_dim / 2;

    let cos_shape = cos.shape();
    let sin_shape = sin.shape();
    if cos_shape.len() != 4 || sin_shape.len() != 4 {
        anyhow::bail!("cos and sin must be 4D tensors");
    }
    if cos_shape[1] != seq_len || sin_shape[1] != seq_len {
        anyhow::bail!(
            "cos/sin sequence length {} doesn't match input sequence length {}",
            cos_shape[1],
            seq_len
        );
    }
    if cos_shape[3] != half_dim || sin_shape[3] != half_dim {
        anyhow::bail!(
            "cos/sin half_dim {} doesn't match expected {}",
            cos_shape[3],
            half_dim
        );
    }

    let x_data = x.data();
    let cos_data = cos.data();
    let sin_data = sin.data();

    let mut output = vec![0.0; x_data.len()];

    for b in 0..batch {
        for h in 0..n_heads {
            for s in 0..seq_len {
                let x_offset =
                    (b * n_heads * seq_len + h * seq_len + s) * head_dim;
                let freq_offset = s * half_dim;

                let x1 = &x_data[x_offset..x_offset + half_dim];
                let x2 = &x_data[x_offset + half_dim..x_offset + head_dim];
                let cos_vals = &cos_data[freq_offset..freq_offset + half_dim];
                let sin_vals = &sin_data[freq_offset..freq_offset + half_dim];

                for i in 0..half_dim {
                    output[x_offset + i] = x1[i] * cos_vals[i] + x2[i] * sin_vals[i];
                    output[x_offset + half_dim + i] =
                        -x1[i] * sin_vals[i] + x2[i] * cos_vals[i];
                }
            }
        }
    }

    Ok(Tensor::new(&output, shape))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rope_precompute_shapes() {
        let (cos, sin) =
            precompute_rotary_embeddings(10, 64, 10000.0).expect("Failed to precompute RoPE");

        assert_eq!(cos.shape(), &[1, 10, 1, 32]);
        assert_eq!(sin.shape(), &[1, 10, 1, 32]);
    }

    #[test]
    fn test_rope_precompute_odd_head_dim() {
        assert!(precompute_rotary_embeddings(10, 65, 10000.0).is_err());
    }

    #[test]
    fn test_gather_rope_mirrored_positions() {
        let (cos, _) = precompute_rotary_embeddings(4, 4, 10000.0).unwrap();
        let gathered = gather_rope(&cos, &[0, 1, 0, 1]).unwrap();

        assert_eq!(gathered.shape(), &[1, 4, 1, 2]);
        // Rows 0/2 and 1/3 must be identical after mirroring
        let data = gathered.data();
        assert_eq!(data[0..2], data[4..6]);
        assert_eq!(data[2..4], data[6..8]);
    }

    #[test]
    fn test_gather_rope_out_of_range() {
        let (cos, _) = precompute_rotary_embeddings(4, 4, 10000.0).unwrap();
        assert!(gather_rope(&cos, &[4]).is_err());
    }

    #[test]
    fn test_rope_apply_shape() {
        let x = Tensor::ones(&[1, 2, 3, 4]);
        let (cos, sin) = precompute_rotary_embeddings(3, 4, 10000.0).unwrap();

        let result = apply_rotary_emb(&x, &cos, &sin).expect("RoPE application failed");

        assert_eq!(result.shape(), x.shape());
    }

    #[test]
    fn test_rope_position_zero_is_identity() {
        let x = Tensor::new(&[1.0, 2.0, 3.0, 4.0], &[1, 1, 1, 4]);
        let (cos, sin) = precompute_rotary_embeddings(1, 4, 10000.0).unwrap();

        let result = apply_rotary_emb(&x, &cos, &sin).unwrap();

        // At position 0 all angles are zero: cos=1, sin=0
        for (a, b) in result.data().iter().zip(x.data().iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }
}
