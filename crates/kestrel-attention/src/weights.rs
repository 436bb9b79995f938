//! Projection parameters of one attention layer.

use kestrel_core::{DType, Device, KestrelError, Result, Tensor};

/// Weights are stored `[in, out]` and applied as `x @ W`.
#[derive(Clone, Debug)]
pub struct AttentionWeights {
    /// `[hidden, hidden]`
    pub q_weight: Tensor,
    /// `[hidden]`
    pub q_bias: Tensor,
    pub k_weight: Tensor,
    pub k_bias: Tensor,
    pub v_weight: Tensor,
    pub v_bias: Tensor,
    /// Output projection `[hidden, hidden]`.
    pub dense_weight: Tensor,
    pub dense_bias: Tensor,
    /// Fused self-attention projection `[hidden, 3 * hidden]`, columns
    /// ordered Q, K, V.
    pub qkv_weight: Tensor,
    /// `[3 * hidden]`
    pub qkv_bias: Tensor,
    /// Query pre-normalization gain `[hidden]`.
    pub layernorm_gamma: Tensor,
    /// Query pre-normalization shift `[hidden]`.
    pub layernorm_beta: Tensor,
}

impl AttentionWeights {
    /// Randomly initialized weights (scaled N(0, 1/hidden)), unit gain and
    /// zero shift. The fused QKV pair is derived from the separate ones.
    pub fn random(hidden: usize) -> Self {
        let scale = (1.0 / hidden.max(1) as f64).sqrt() as f32;
        let w = || scaled_randn(hidden * hidden, scale);
        let b = || scaled_randn(hidden, scale);
        let (wq, wk, wv, wd) = (w(), w(), w(), w());
        let (bq, bk, bv, bd) = (b(), b(), b(), b());
        let qkv_weight = interleave_columns(&wq, &wk, &wv, hidden);
        let qkv_bias = [bq.as_slice(), bk.as_slice(), bv.as_slice()].concat();
        Self {
            q_weight: Tensor::from_f32(&wq, &[hidden, hidden]),
            q_bias: Tensor::from_f32(&bq, &[hidden]),
            k_weight: Tensor::from_f32(&wk, &[hidden, hidden]),
            k_bias: Tensor::from_f32(&bk, &[hidden]),
            v_weight: Tensor::from_f32(&wv, &[hidden, hidden]),
            v_bias: Tensor::from_f32(&bv, &[hidden]),
            dense_weight: Tensor::from_f32(&wd, &[hidden, hidden]),
            dense_bias: Tensor::from_f32(&bd, &[hidden]),
            qkv_weight: Tensor::from_f32(&qkv_weight, &[hidden, 3 * hidden]),
            qkv_bias: Tensor::from_f32(&qkv_bias, &[3 * hidden]),
            layernorm_gamma: Tensor::ones(&[hidden]),
            layernorm_beta: Tensor::zeros(&[hidden], DType::F32),
        }
    }

    /// Rebuild `qkv_weight` and `qkv_bias` from the separate Q, K and V
    /// parameters, so both modes compute the same projections.
    pub fn fuse_qkv(&mut self) -> Result<()> {
        let hidden = self.q_weight.shape().last_dim();
        let device = self.device();
        let (wq, wk, wv) = (self.q_weight.view()?, self.k_weight.view()?, self.v_weight.view()?);
        let (bq, bk, bv) = (self.q_bias.view()?, self.k_bias.view()?, self.v_bias.view()?);
        for (name, w) in [("q_weight", &wq), ("k_weight", &wk), ("v_weight", &wv)] {
            if w.dims() != [hidden, hidden] {
                return Err(KestrelError::shape(
                    name,
                    format!("expected [{hidden}, {hidden}] to fuse, got {}", w.shape()),
                ));
            }
        }
        for (name, b) in [("q_bias", &bq), ("k_bias", &bk), ("v_bias", &bv)] {
            if b.numel() != hidden {
                return Err(KestrelError::shape(
                    name,
                    format!("expected {hidden} elements to fuse, got {}", b.shape()),
                ));
            }
        }

        let weight = interleave_columns(wq.as_slice(), wk.as_slice(), wv.as_slice(), hidden);
        let bias = [bq.as_slice(), bk.as_slice(), bv.as_slice()].concat();
        self.qkv_weight = Tensor::from_f32(&weight, &[hidden, 3 * hidden]).to_device(device)?;
        self.qkv_bias = Tensor::from_f32(&bias, &[3 * hidden]).to_device(device)?;
        Ok(())
    }

    /// Widen every parameter to F32 (half-precision checkpoints).
    pub fn into_f32(self) -> Result<Self> {
        Ok(Self {
            q_weight: self.q_weight.to_f32()?,
            q_bias: self.q_bias.to_f32()?,
            k_weight: self.k_weight.to_f32()?,
            k_bias: self.k_bias.to_f32()?,
            v_weight: self.v_weight.to_f32()?,
            v_bias: self.v_bias.to_f32()?,
            dense_weight: self.dense_weight.to_f32()?,
            dense_bias: self.dense_bias.to_f32()?,
            qkv_weight: self.qkv_weight.to_f32()?,
            qkv_bias: self.qkv_bias.to_f32()?,
            layernorm_gamma: self.layernorm_gamma.to_f32()?,
            layernorm_beta: self.layernorm_beta.to_f32()?,
        })
    }

    /// Device every parameter lives on.
    pub fn device(&self) -> Device {
        self.q_weight.device()
    }

    /// Verify every parameter is F32, shaped for `hidden` and on one device.
    pub fn check_shapes(&self, hidden: usize) -> Result<()> {
        let device = self.device();
        for (name, tensor, expected) in self.named(hidden) {
            if tensor.dims() != expected.as_slice() {
                return Err(KestrelError::shape(
                    name,
                    format!("expected {expected:?}, got {}", tensor.shape()),
                ));
            }
            if tensor.dtype() != DType::F32 {
                return Err(KestrelError::UnsupportedDType(tensor.dtype()));
            }
            if tensor.device() != device {
                return Err(KestrelError::DeviceMismatch {
                    context: format!("{name} vs q_weight"),
                    left: tensor.device(),
                    right: device,
                });
            }
        }
        Ok(())
    }

    /// Emit every parameter at TRACE level.
    pub(crate) fn trace_dump(&self) {
        for (name, tensor, _) in self.named(0) {
            tracing::trace!(name, %tensor, "attention weight");
        }
    }

    fn named(&self, hidden: usize) -> [(&'static str, &Tensor, Vec<usize>); 12] {
        let h = hidden;
        [
            ("q_weight", &self.q_weight, vec![h, h]),
            ("q_bias", &self.q_bias, vec![h]),
            ("k_weight", &self.k_weight, vec![h, h]),
            ("k_bias", &self.k_bias, vec![h]),
            ("v_weight", &self.v_weight, vec![h, h]),
            ("v_bias", &self.v_bias, vec![h]),
            ("dense_weight", &self.dense_weight, vec![h, h]),
            ("dense_bias", &self.dense_bias, vec![h]),
            ("qkv_weight", &self.qkv_weight, vec![h, 3 * h]),
            ("qkv_bias", &self.qkv_bias, vec![3 * h]),
            ("layernorm_gamma", &self.layernorm_gamma, vec![h]),
            ("layernorm_beta", &self.layernorm_beta, vec![h]),
        ]
    }
}

fn scaled_randn(numel: usize, scale: f32) -> Vec<f32> {
    let t = Tensor::randn(&[numel]);
    t.as_f32_slice()
        .unwrap_or_default()
        .iter()
        .map(|v| v * scale)
        .collect()
}

/// Row-wise concatenation of three `[rows, cols]` matrices into `[rows, 3 * cols]`.
fn interleave_columns(a: &[f32], b: &[f32], c: &[f32], cols: usize) -> Vec<f32> {
    let mut fused = Vec::with_capacity(3 * a.len());
    if cols == 0 {
        return fused;
    }
    for ((ra, rb), rc) in a.chunks(cols).zip(b.chunks(cols)).zip(c.chunks(cols)) {
        fused.extend_from_slice(ra);
        fused.extend_from_slice(rb);
        fused.extend_from_slice(rc);
    }
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    #[test]
    fn test_random_shapes() {
        let w = AttentionWeights::random(8);
        assert!(w.check_shapes(8).is_ok());
        assert!(w.check_shapes(4).is_err());
    }

    #[test]
    fn test_fuse_qkv_layout() {
        let mut w = AttentionWeights::random(2);
        w.q_weight = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        w.k_weight = Tensor::from_f32(&[5.0, 6.0, 7.0, 8.0], &[2, 2]);
        w.v_weight = Tensor::from_f32(&[9.0, 10.0, 11.0, 12.0], &[2, 2]);
        w.q_bias = Tensor::from_f32(&[0.1, 0.2], &[2]);
        w.k_bias = Tensor::from_f32(&[0.3, 0.4], &[2]);
        w.v_bias = Tensor::from_f32(&[0.5, 0.6], &[2]);
        w.fuse_qkv().unwrap();

        assert_eq!(w.qkv_weight.dims(), &[2, 6]);
        assert_eq!(
            w.qkv_weight.as_f32_slice().unwrap(),
            &[1.0, 2.0, 5.0, 6.0, 9.0, 10.0, 3.0, 4.0, 7.0, 8.0, 11.0, 12.0]
        );
        assert_eq!(w.qkv_bias.as_f32_slice().unwrap(), &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
    }

    #[test]
    fn test_fuse_qkv_rejects_mismatched_parts() {
        let mut w = AttentionWeights::random(2);
        w.k_bias = Tensor::zeros(&[3], DType::F32);
        assert!(w.fuse_qkv().is_err());
    }

    #[test]
    fn test_check_shapes_rejects_half() {
        let mut w = AttentionWeights::random(2);
        let half: Vec<f16> = [1.0f32, 2.0].iter().map(|&v| f16::from_f32(v)).collect();
        w.dense_bias = Tensor::from_f16(&half, &[2]).unwrap();
        assert!(matches!(w.check_shapes(2), Err(KestrelError::UnsupportedDType(DType::F16))));

        let w = w.into_f32().unwrap();
        assert!(w.check_shapes(2).is_ok());
        assert_eq!(w.dense_bias.as_f32_slice().unwrap(), &[1.0, 2.0]);
    }

    #[test]
    fn test_check_shapes_rejects_mixed_devices() {
        let mut w = AttentionWeights::random(2);
        w.v_bias = w.v_bias.to_device(Device::Cpu(1)).unwrap();
        assert!(matches!(w.check_shapes(2), Err(KestrelError::DeviceMismatch { .. })));
    }
}
