//! Argument checks shared by every kernel.

use kestrel_core::prelude::*;

/// Mutable f32 elements of a host output tensor.
pub(crate) fn output_f32<'a>(out: &'a mut Tensor, name: &str) -> Result<&'a mut [f32]> {
    if !out.device().is_cpu() {
        return Err(KestrelError::UnsupportedDevice(out.device()));
    }
    let dtype = out.dtype();
    out.as_f32_slice_mut().ok_or_else(|| {
        tracing::trace!(name, %dtype, "kernel output has unsupported dtype");
        KestrelError::UnsupportedDType(dtype)
    })
}

/// Fail unless `view` lives on a host context.
pub(crate) fn host(view: &TensorView<'_>) -> Result<()> {
    if view.device().is_cpu() {
        Ok(())
    } else {
        Err(KestrelError::UnsupportedDevice(view.device()))
    }
}

/// Fail unless `dims` equals `expected`.
pub(crate) fn expect_dims(name: &str, dims: &[usize], expected: &[usize]) -> Result<()> {
    if dims == expected {
        Ok(())
    } else {
        Err(KestrelError::shape(
            name,
            format!("expected {expected:?}, got {dims:?}"),
        ))
    }
}

/// Fail unless `dims` has `rank` axes.
pub(crate) fn expect_rank(name: &str, dims: &[usize], rank: usize) -> Result<()> {
    if dims.len() == rank {
        Ok(())
    } else {
        Err(KestrelError::shape(
            name,
            format!("expected rank {rank}, got {dims:?}"),
        ))
    }
}

/// Fail unless a bias vector has `len` elements.
pub(crate) fn expect_bias(name: &str, bias: &TensorView<'_>, len: usize) -> Result<()> {
    host(bias)?;
    if bias.numel() == len {
        Ok(())
    } else {
        Err(KestrelError::shape(
            name,
            format!("bias has {} elements, expected {len}", bias.numel()),
        ))
    }
}
