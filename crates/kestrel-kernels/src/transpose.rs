//! Head layout transforms between `[batch, seq, heads, head_dim]` and
//! `[batch, heads, seq, head_dim]`, with the projection bias folded in.

use kestrel_core::prelude::*;
use rayon::prelude::*;

use crate::common::{expect_bias, expect_dims, expect_rank, host, output_f32};

/// `out[b, h, s, :] = input[b, s, h, :] + bias[h, :]`.
///
/// `input` is `[batch, seq, heads, head_dim]`, `bias` has `heads * head_dim`
/// elements and `out` must already be `[batch, heads, seq, head_dim]`.
pub fn add_bias_transpose_for_score(
    input: &TensorView<'_>,
    bias: &TensorView<'_>,
    out: &mut Tensor,
) -> Result<()> {
    host(input)?;
    expect_rank("add_bias_transpose_for_score input", input.dims(), 4)?;
    let [batch, seq, heads, head_dim] = [
        input.dims()[0],
        input.dims()[1],
        input.dims()[2],
        input.dims()[3],
    ];
    expect_bias("add_bias_transpose_for_score", bias, heads * head_dim)?;
    expect_dims(
        "add_bias_transpose_for_score output",
        out.dims(),
        &[batch, heads, seq, head_dim],
    )?;
    if out.numel() == 0 {
        return Ok(());
    }

    let (src, b) = (input.as_slice(), bias.as_slice());
    let dst = output_f32(out, "add_bias_transpose_for_score output")?;
    dst.par_chunks_mut(seq * head_dim)
        .enumerate()
        .for_each(|(bh, block)| {
            let (bi, h) = (bh / heads, bh % heads);
            let bias_h = &b[h * head_dim..(h + 1) * head_dim];
            for (s, row) in block.chunks_mut(head_dim).enumerate() {
                let at = ((bi * seq + s) * heads + h) * head_dim;
                for ((o, &x), &bv) in row.iter_mut().zip(&src[at..at + head_dim]).zip(bias_h) {
                    *o = x + bv;
                }
            }
        });
    Ok(())
}

/// Split a fused QKV projection into three head-major blocks in one pass.
///
/// `input` is `[batch, seq, 3, heads, head_dim]` (the `[batch, seq, 3 * hidden]`
/// output of a fused projection), `bias` has `3 * heads * head_dim` elements
/// and `out` must already be `[3, batch, heads, seq, head_dim]`:
/// `out[i, b, h, s, :] = input[b, s, i, h, :] + bias[i, h, :]`.
pub fn split_add_bias_transpose_for_score(
    input: &TensorView<'_>,
    bias: &TensorView<'_>,
    out: &mut Tensor,
) -> Result<()> {
    host(input)?;
    expect_rank("split_add_bias_transpose_for_score input", input.dims(), 5)?;
    let d = input.dims();
    let (batch, seq, parts, heads, head_dim) = (d[0], d[1], d[2], d[3], d[4]);
    if parts != 3 {
        return Err(KestrelError::shape(
            "split_add_bias_transpose_for_score input",
            format!("expected 3 fused projections, got {}", input.shape()),
        ));
    }
    let hidden = heads * head_dim;
    expect_bias("split_add_bias_transpose_for_score", bias, 3 * hidden)?;
    expect_dims(
        "split_add_bias_transpose_for_score output",
        out.dims(),
        &[3, batch, heads, seq, head_dim],
    )?;
    if out.numel() == 0 {
        return Ok(());
    }

    let (src, b) = (input.as_slice(), bias.as_slice());
    let dst = output_f32(out, "split_add_bias_transpose_for_score output")?;
    dst.par_chunks_mut(seq * head_dim)
        .enumerate()
        .for_each(|(ibh, block)| {
            let h = ibh % heads;
            let bi = (ibh / heads) % batch;
            let i = ibh / (heads * batch);
            let bias_ih = &b[i * hidden + h * head_dim..i * hidden + (h + 1) * head_dim];
            for (s, row) in block.chunks_mut(head_dim).enumerate() {
                let at = (((bi * seq + s) * 3 + i) * heads + h) * head_dim;
                for ((o, &x), &bv) in row.iter_mut().zip(&src[at..at + head_dim]).zip(bias_ih) {
                    *o = x + bv;
                }
            }
        });
    Ok(())
}

/// `out[b, s, h, :] = input[b, h, s, :]`.
///
/// `input` is `[batch, heads, seq, head_dim]`; `out` must already be
/// `[batch, seq, heads, head_dim]` or the merged `[batch, seq, heads * head_dim]`.
pub fn transpose_for_score(input: &TensorView<'_>, out: &mut Tensor) -> Result<()> {
    host(input)?;
    expect_rank("transpose_for_score input", input.dims(), 4)?;
    let d = input.dims();
    let (batch, heads, seq, head_dim) = (d[0], d[1], d[2], d[3]);
    let split = [batch, seq, heads, head_dim];
    let merged = [batch, seq, heads * head_dim];
    if out.dims() != split && out.dims() != merged {
        return Err(KestrelError::shape(
            "transpose_for_score output",
            format!("expected {split:?} or {merged:?}, got {}", out.shape()),
        ));
    }
    if out.numel() == 0 {
        return Ok(());
    }

    let src = input.as_slice();
    let dst = output_f32(out, "transpose_for_score output")?;
    dst.par_chunks_mut(heads * head_dim)
        .enumerate()
        .for_each(|(bs, row)| {
            let (bi, s) = (bs / seq, bs % seq);
            for (h, chunk) in row.chunks_mut(head_dim).enumerate() {
                let at = ((bi * heads + h) * seq + s) * head_dim;
                chunk.copy_from_slice(&src[at..at + head_dim]);
            }
        });
    Ok(())
}
