//! Dense and batched GEMM: `out = alpha * op(a) @ op(b) + beta * out`.
//!
//! `op(x)` is `x` or `x^T` depending on the transpose flag. The plain
//! (non-transposed) case runs a cache-tiled loop with an AVX2+FMA inner
//! kernel when available; transposed operands go through a dot-product
//! loop, which is contiguous for the `a @ b^T` shape attention scores use.
//!
//! Outputs are written in place and must already carry their final shape.

use kestrel_core::prelude::*;
use rayon::prelude::*;

use crate::common::{expect_rank, host, output_f32};
use crate::simd::SimdCapability;

/// Tile size for cache-friendly blocking.
/// 64×64 tiles fit comfortably in L1 cache (~32KB for f32).
const TILE_M: usize = 64;
const TILE_N: usize = 64;
const TILE_K: usize = 64;

/// Dense matrix multiply.
///
/// `a` is `[.., m, k]` with every leading axis folded into rows (or `[k, m]`
/// when `trans_a`), `b` is `[k, n]` (or `[n, k]` when `trans_b`). `out` must
/// hold `m * n` elements with a last axis of `n`.
pub fn mat_mul(
    a: &TensorView<'_>,
    trans_a: bool,
    b: &TensorView<'_>,
    trans_b: bool,
    alpha: f32,
    out: &mut Tensor,
    beta: f32,
) -> Result<()> {
    host(a)?;
    host(b)?;
    expect_rank("mat_mul rhs", b.dims(), 2)?;
    if trans_a {
        expect_rank("mat_mul lhs", a.dims(), 2)?;
    }

    let (m, k) = if trans_a {
        (a.dims()[1], a.dims()[0])
    } else {
        (a.shape().rows(), a.shape().last_dim())
    };
    let (k2, n) = if trans_b {
        (b.dims()[1], b.dims()[0])
    } else {
        (b.dims()[0], b.dims()[1])
    };
    if k != k2 {
        return Err(KestrelError::MatmulDimMismatch { m, k1: k, k2, n });
    }
    if out.shape().rows() != m || out.shape().last_dim() != n {
        return Err(KestrelError::shape(
            "mat_mul output",
            format!("expected {m} rows of {n}, got {}", out.shape()),
        ));
    }

    let c = output_f32(out, "mat_mul output")?;
    gemm(a.as_slice(), trans_a, b.as_slice(), trans_b, c, m, n, k, alpha, beta);
    Ok(())
}

/// Batched matrix multiply over every leading (batch, head, ...) index.
///
/// `a` is `[.., m, k]` (`[.., k, m]` when `trans_a`), `b` is `[.., k, n]`
/// (`[.., n, k]` when `trans_b`), `out` is `[.., m, n]`; the leading axes
/// of all three must agree. Independent slices run in parallel.
pub fn batch_mat_mul(
    a: &TensorView<'_>,
    trans_a: bool,
    b: &TensorView<'_>,
    trans_b: bool,
    alpha: f32,
    out: &mut Tensor,
    beta: f32,
) -> Result<()> {
    host(a)?;
    host(b)?;
    let (a_dims, b_dims) = (a.dims(), b.dims());
    if a_dims.len() < 3 || a_dims.len() != b_dims.len() || out.ndim() != a_dims.len() {
        return Err(KestrelError::shape(
            "batch_mat_mul",
            format!(
                "operands must share a rank >= 3, got {a_dims:?} x {b_dims:?} -> {}",
                out.shape()
            ),
        ));
    }
    let lead = a_dims.len() - 2;
    if a_dims[..lead] != b_dims[..lead] || a_dims[..lead] != out.dims()[..lead] {
        return Err(KestrelError::shape(
            "batch_mat_mul",
            format!(
                "leading axes differ: {a_dims:?} x {b_dims:?} -> {}",
                out.shape()
            ),
        ));
    }

    let (m, k) = if trans_a {
        (a_dims[lead + 1], a_dims[lead])
    } else {
        (a_dims[lead], a_dims[lead + 1])
    };
    let (k2, n) = if trans_b {
        (b_dims[lead + 1], b_dims[lead])
    } else {
        (b_dims[lead], b_dims[lead + 1])
    };
    if k != k2 {
        return Err(KestrelError::MatmulDimMismatch { m, k1: k, k2, n });
    }
    if out.dims()[lead..] != [m, n] {
        return Err(KestrelError::shape(
            "batch_mat_mul output",
            format!("expected trailing [{m}, {n}], got {}", out.shape()),
        ));
    }
    if m * n == 0 {
        return Ok(());
    }

    let (a_data, b_data) = (a.as_slice(), b.as_slice());
    let c = output_f32(out, "batch_mat_mul output")?;
    c.par_chunks_mut(m * n).enumerate().for_each(|(i, c_i)| {
        let a_i = &a_data[i * m * k..(i + 1) * m * k];
        let b_i = &b_data[i * k * n..(i + 1) * k * n];
        gemm(a_i, trans_a, b_i, trans_b, c_i, m, n, k, alpha, beta);
    });
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn gemm(
    a: &[f32],
    trans_a: bool,
    b: &[f32],
    trans_b: bool,
    c: &mut [f32],
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    beta: f32,
) {
    // beta == 0 must discard stale contents, including NaNs from reused buffers.
    if beta == 0.0 {
        c.fill(0.0);
    } else if beta != 1.0 {
        c.iter_mut().for_each(|v| *v *= beta);
    }

    match (trans_a, trans_b) {
        (false, false) => {
            if SimdCapability::detect().fma_gemm() {
                tiled_gemm_avx2(a, b, c, m, n, k, alpha);
            } else {
                tiled_gemm_scalar(a, b, c, m, n, k, alpha);
            }
        }
        _ => {
            let a_at = |i: usize, p: usize| if trans_a { a[p * m + i] } else { a[i * k + p] };
            let b_at = |p: usize, j: usize| if trans_b { b[j * k + p] } else { b[p * n + j] };
            for i in 0..m {
                for j in 0..n {
                    let mut acc = 0.0f32;
                    for p in 0..k {
                        acc += a_at(i, p) * b_at(p, j);
                    }
                    c[i * n + j] += alpha * acc;
                }
            }
        }
    }
}

/// Scalar tiled matmul (fallback).
fn tiled_gemm_scalar(
    a: &[f32],
    b: &[f32],
    c: &mut [f32],
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
) {
    for i0 in (0..m).step_by(TILE_M) {
        let i_end = (i0 + TILE_M).min(m);
        for j0 in (0..n).step_by(TILE_N) {
            let j_end = (j0 + TILE_N).min(n);
            for p0 in (0..k).step_by(TILE_K) {
                let p_end = (p0 + TILE_K).min(k);

                for i in i0..i_end {
                    for p in p0..p_end {
                        let a_val = alpha * a[i * k + p];
                        for j in j0..j_end {
                            c[i * n + j] += a_val * b[p * n + j];
                        }
                    }
                }
            }
        }
    }
}

/// AVX2-accelerated tiled matmul.
///
/// Processes 8 floats at a time in the inner loop using 256-bit SIMD.
#[cfg(target_arch = "x86_64")]
fn tiled_gemm_avx2(a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize, alpha: f32) {
    // Safety: callers only get here when AVX2 and FMA were detected.
    unsafe { tiled_gemm_avx2_inner(a, b, c, m, n, k, alpha) }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn tiled_gemm_avx2_inner(
    a: &[f32],
    b: &[f32],
    c: &mut [f32],
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
) {
    use std::arch::x86_64::*;

    for i0 in (0..m).step_by(TILE_M) {
        let i_end = (i0 + TILE_M).min(m);
        for j0 in (0..n).step_by(TILE_N) {
            let j_end = (j0 + TILE_N).min(n);
            for p0 in (0..k).step_by(TILE_K) {
                let p_end = (p0 + TILE_K).min(k);

                for i in i0..i_end {
                    for p in p0..p_end {
                        let a_scalar = alpha * a[i * k + p];
                        let a_val = _mm256_set1_ps(a_scalar);

                        let mut j = j0;
                        while j + 8 <= j_end {
                            let c_ptr = c.as_mut_ptr().add(i * n + j);
                            let b_ptr = b.as_ptr().add(p * n + j);

                            let c_vec = _mm256_loadu_ps(c_ptr);
                            let b_vec = _mm256_loadu_ps(b_ptr);
                            _mm256_storeu_ps(c_ptr, _mm256_fmadd_ps(a_val, b_vec, c_vec));

                            j += 8;
                        }

                        // Scalar tail
                        while j < j_end {
                            c[i * n + j] += a_scalar * b[p * n + j];
                            j += 1;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn tiled_gemm_avx2(a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize, alpha: f32) {
    tiled_gemm_scalar(a, b, c, m, n, k, alpha);
}
