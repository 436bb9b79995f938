//! Row-wise fused element kernels: layer norm and bias epilogues.
//!
//! Each kernel makes a single pass over its output and writes in place,
//! so no intermediate tensor is materialized.

use kestrel_core::prelude::*;
use rayon::prelude::*;

use crate::common::{expect_bias, output_f32};

/// In-place layer normalization over the last axis:
/// `x = (x - mean) / sqrt(var + eps) * gamma + beta`.
pub fn layer_norm(
    gamma: &TensorView<'_>,
    beta: &TensorView<'_>,
    x: &mut Tensor,
    eps: f32,
) -> Result<()> {
    let width = x.shape().last_dim();
    expect_bias("layer_norm gamma", gamma, width)?;
    expect_bias("layer_norm beta", beta, width)?;
    if width == 0 {
        return Ok(());
    }
    let (g, b) = (gamma.as_slice(), beta.as_slice());
    let data = output_f32(x, "layer_norm input")?;

    data.par_chunks_mut(width).for_each(|row| {
        // Welford's online algorithm for mean and variance in one pass
        let mut mean = 0.0f32;
        let mut m2 = 0.0f32;
        for (i, &v) in row.iter().enumerate() {
            let delta = v - mean;
            mean += delta / (i + 1) as f32;
            m2 += delta * (v - mean);
        }
        let inv_std = 1.0 / (m2 / width as f32 + eps).sqrt();

        for ((v, &gi), &bi) in row.iter_mut().zip(g).zip(b) {
            *v = (*v - mean) * inv_std * gi + bi;
        }
    });
    Ok(())
}

/// `out += bias`, broadcast over every row.
pub fn add_bias(bias: &TensorView<'_>, out: &mut Tensor) -> Result<()> {
    let width = out.shape().last_dim();
    expect_bias("add_bias", bias, width)?;
    if width == 0 {
        return Ok(());
    }
    let b = bias.as_slice();
    let data = output_f32(out, "add_bias output")?;
    data.par_chunks_mut(width).for_each(|row| {
        for (v, &bi) in row.iter_mut().zip(b) {
            *v += bi;
        }
    });
    Ok(())
}

/// `out += residual + bias` in one pass. `residual` must have the shape of `out`.
pub fn add_input_bias(
    residual: &TensorView<'_>,
    bias: &TensorView<'_>,
    out: &mut Tensor,
) -> Result<()> {
    if residual.dims() != out.dims() {
        return Err(KestrelError::shape(
            "add_input_bias residual",
            format!("residual {} vs output {}", residual.shape(), out.shape()),
        ));
    }
    let width = out.shape().last_dim();
    expect_bias("add_input_bias", bias, width)?;
    if width == 0 {
        return Ok(());
    }
    let (r, b) = (residual.as_slice(), bias.as_slice());
    let data = output_f32(out, "add_input_bias output")?;
    data.par_chunks_mut(width)
        .zip(r.par_chunks(width))
        .for_each(|(row, res)| {
            for ((v, &ri), &bi) in row.iter_mut().zip(res).zip(b) {
                *v += ri + bi;
            }
        });
    Ok(())
}
