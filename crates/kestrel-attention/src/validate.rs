//! Input checks run before any projection.

use kestrel_core::{KestrelError, Result, Tensor};

use crate::mode::AttentionMode;

/// Shapes resolved from validated inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Dims {
    pub batch: usize,
    pub q_len: usize,
    pub k_len: usize,
    pub hidden: usize,
}

/// Caller-side checks: the mask shares the key's device, key/value/query
/// are `[batch, seq, hidden]` and key and value agree on hidden size.
pub fn validate_inputs(key: &Tensor, value: &Tensor, query: &Tensor, mask: &Tensor) -> Result<()> {
    if !mask.same_device(key) {
        return Err(KestrelError::DeviceMismatch {
            context: "attention_mask vs key".into(),
            left: mask.device(),
            right: key.device(),
        });
    }
    for (name, t) in [("key", key), ("value", value), ("query", query)] {
        if t.ndim() != 3 {
            return Err(KestrelError::shape(
                name,
                format!("expected rank 3 [batch, seq, hidden], got {}", t.shape()),
            ));
        }
    }
    if key.dims()[2] != value.dims()[2] {
        return Err(KestrelError::shape(
            "key vs value",
            format!("hidden sizes differ: {} vs {}", key.dims()[2], value.dims()[2]),
        ));
    }
    Ok(())
}

/// Layer-side checks against the configured width, plus the sequence and
/// mask agreement the selected mode needs. Assumes [`validate_inputs`] passed.
pub(crate) fn resolve_dims(
    key: &Tensor,
    value: &Tensor,
    query: &Tensor,
    mask: &Tensor,
    mode: AttentionMode,
    hidden: usize,
    heads: usize,
) -> Result<Dims> {
    let (batch, q_len) = (query.dims()[0], query.dims()[1]);
    if query.dims()[2] != hidden {
        return Err(KestrelError::shape(
            "query",
            format!("hidden size {} does not match layer width {hidden}", query.dims()[2]),
        ));
    }

    let k_len = match mode {
        AttentionMode::SelfAttention => q_len,
        AttentionMode::Context => {
            if key.dims()[2] != hidden {
                return Err(KestrelError::shape(
                    "key",
                    format!("hidden size {} does not match layer width {hidden}", key.dims()[2]),
                ));
            }
            if key.dims()[..2] != value.dims()[..2] {
                return Err(KestrelError::shape(
                    "key vs value",
                    format!("{} vs {}", key.shape(), value.shape()),
                ));
            }
            if key.dims()[0] != batch {
                return Err(KestrelError::shape(
                    "key vs query",
                    format!("batch sizes differ: {} vs {batch}", key.dims()[0]),
                ));
            }
            key.dims()[1]
        }
    };

    let mask_dims: Option<[usize; 4]> = match *mask.dims() {
        [b, k] => Some([b, 1, 1, k]),
        [b, h, q, k] => Some([b, h, q, k]),
        _ => None,
    };
    let fits = mask_dims.is_some_and(|[b, h, q, k]| {
        b == batch && (h == 1 || h == heads) && (q == 1 || q == q_len) && k == k_len
    });
    if !fits {
        return Err(KestrelError::shape(
            "attention_mask",
            format!(
                "{} does not broadcast to scores [{batch}, {heads}, {q_len}, {k_len}]",
                mask.shape()
            ),
        ));
    }

    Ok(Dims {
        batch,
        q_len,
        k_len,
        hidden,
    })
}
