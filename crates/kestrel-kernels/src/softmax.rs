//! Masked softmax over attention scores, in place.

use kestrel_core::prelude::*;
use rayon::prelude::*;

use crate::common::{expect_rank, host, output_f32};

/// Add `mask_scale * mask` to `scores` and replace every row with its
/// softmax over the last axis.
///
/// `scores` is `[batch, heads, q_len, k_len]`. The mask is additive (0 to
/// keep a position, a large negative value or `-inf` to drop it) and is
/// broadcast from `[batch, 1 | heads, 1 | q_len, k_len]`; a `[batch, k_len]`
/// mask is read as `[batch, 1, 1, k_len]`. A `-inf` mask entry drops its
/// position whatever `mask_scale` is; only finite entries are scaled.
///
/// A row in which every position ends up at `-inf` has no defined softmax;
/// it is given the uniform distribution `1 / k_len` instead of NaNs.
pub fn apply_mask_and_softmax(
    scores: &mut Tensor,
    mask: &TensorView<'_>,
    mask_scale: f32,
) -> Result<()> {
    host(mask)?;
    expect_rank("attention scores", scores.dims(), 4)?;
    let (batch, heads, q_len, k_len) = {
        let d = scores.dims();
        (d[0], d[1], d[2], d[3])
    };

    let mask_dims: [usize; 4] = match *mask.dims() {
        [b, k] => [b, 1, 1, k],
        [b, h, q, k] => [b, h, q, k],
        _ => {
            return Err(KestrelError::shape(
                "attention_mask",
                format!("expected rank 2 or 4, got {}", mask.shape()),
            ))
        }
    };
    let broadcastable = mask_dims[0] == batch
        && (mask_dims[1] == 1 || mask_dims[1] == heads)
        && (mask_dims[2] == 1 || mask_dims[2] == q_len)
        && mask_dims[3] == k_len;
    if !broadcastable {
        return Err(KestrelError::shape(
            "attention_mask",
            format!(
                "{:?} does not broadcast to scores [{batch}, {heads}, {q_len}, {k_len}]",
                mask.dims()
            ),
        ));
    }
    if k_len == 0 {
        return Ok(());
    }

    let m = mask.as_slice();
    let (mh, mq) = (mask_dims[1], mask_dims[2]);
    let data = output_f32(scores, "attention scores")?;
    data.par_chunks_mut(k_len).enumerate().for_each(|(row, x)| {
        let q = row % q_len;
        let h = (row / q_len) % heads;
        let b = row / (q_len * heads);
        let mrow = ((b * mh + h % mh) * mq + q % mq) * k_len;
        masked_softmax_row(x, &m[mrow..mrow + k_len], mask_scale);
    });
    Ok(())
}

fn masked_softmax_row(x: &mut [f32], mask: &[f32], mask_scale: f32) {
    let mut max_val = f32::NEG_INFINITY;
    for (v, &mv) in x.iter_mut().zip(mask) {
        if mv == f32::NEG_INFINITY {
            *v = f32::NEG_INFINITY;
        } else {
            *v += mask_scale * mv;
        }
        max_val = max_val.max(*v);
    }

    if max_val == f32::NEG_INFINITY {
        x.fill(1.0 / x.len() as f32);
        return;
    }

    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max_val).exp();
        sum += *v;
    }
    let inv_sum = 1.0 / sum;
    for v in x.iter_mut() {
        *v *= inv_sum;
    }
}
