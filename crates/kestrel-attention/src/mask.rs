//! Additive attention masks: padding, causal, and conversion from 0/1 masks.
//!
//! All masks are additive: `0.0` keeps a position, a large negative value
//! (or `-inf`) removes it. They broadcast against scores
//! `[batch, heads, q_len, k_len]`.

use kestrel_core::{KestrelError, Result, Tensor};

/// Value written for dropped positions by [`extended_attention_mask`].
pub const MASKED_VALUE: f32 = -10000.0;

/// `[batch, 1, 1, max_len]` mask hiding positions at or past each length.
pub fn padding_mask(lengths: &[usize], max_len: usize) -> Tensor {
    let batch = lengths.len();
    let mut data = vec![f32::NEG_INFINITY; batch * max_len];
    for (b, &len) in lengths.iter().enumerate() {
        data[b * max_len..b * max_len + len.min(max_len)].fill(0.0);
    }
    Tensor::from_f32(&data, &[batch, 1, 1, max_len])
}

/// `[batch, 1, seq, seq]` lower-triangular mask for autoregressive attention.
pub fn causal_mask(batch: usize, seq_len: usize) -> Tensor {
    let mut row_block = vec![f32::NEG_INFINITY; seq_len * seq_len];
    for i in 0..seq_len {
        row_block[i * seq_len..=i * seq_len + i].fill(0.0);
    }
    let data = row_block.repeat(batch);
    Tensor::from_f32(&data, &[batch, 1, seq_len, seq_len])
}

/// Convert a `[batch, k_len]` keep-mask of 0/1 values into the additive
/// `[batch, 1, 1, k_len]` form: `(1 - m) * -10000`.
pub fn extended_attention_mask(binary: &Tensor) -> Result<Tensor> {
    let &[batch, k_len] = binary.dims() else {
        return Err(KestrelError::shape(
            "extended_attention_mask",
            format!("expected [batch, k_len], got {}", binary.shape()),
        ));
    };
    let binary = binary.to_f32()?;
    let data: Vec<f32> = binary
        .as_f32_slice()
        .ok_or(KestrelError::UnsupportedDType(binary.dtype()))?
        .iter()
        .map(|&m| (1.0 - m) * MASKED_VALUE)
        .collect();
    let out = Tensor::from_f32(&data, &[batch, 1, 1, k_len]);
    out.to_device(binary.device())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::Device;

    #[test]
    fn test_padding_mask() {
        let mask = padding_mask(&[2, 4], 3);
        assert_eq!(mask.dims(), &[2, 1, 1, 3]);
        let d = mask.as_f32_slice().unwrap();
        assert_eq!(&d[..2], &[0.0, 0.0]);
        assert!(d[2].is_infinite());
        assert_eq!(&d[3..], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_causal_mask() {
        let mask = causal_mask(2, 3);
        assert_eq!(mask.dims(), &[2, 1, 3, 3]);
        let d = mask.as_f32_slice().unwrap();
        // Row 0: [0, -inf, -inf]
        assert_eq!(d[0], 0.0);
        assert!(d[1].is_infinite() && d[2].is_infinite());
        // Row 2: all visible
        assert_eq!(&d[6..9], &[0.0, 0.0, 0.0]);
        // Second batch repeats the pattern.
        assert_eq!(&d[..9], &d[9..]);
    }

    #[test]
    fn test_extended_attention_mask() {
        let binary = Tensor::from_f32(&[1.0, 1.0, 0.0], &[1, 3]);
        let ext = extended_attention_mask(&binary).unwrap();
        assert_eq!(ext.dims(), &[1, 1, 1, 3]);
        assert_eq!(ext.as_f32_slice().unwrap(), &[0.0, 0.0, -10000.0]);
        assert_eq!(ext.device(), Device::Cpu(0));

        let bad = Tensor::zeros(&[3], kestrel_core::DType::F32);
        assert!(extended_attention_mask(&bad).is_err());
    }
}
