//! Multi-headed attention forward pass.
//!
//! ```text
//! query ─(LayerNorm copy)─┐
//!                         ├─ project ─ bias+transpose ─ Q,K,V [B, H, S, D]
//! key, value ─────────────┘
//! scores  = Q @ K^T / sqrt(D)            [B, H, Sq, Sk]
//! probs   = softmax(scores + s * mask)
//! context = probs @ V → [B, Sq, hidden]
//! output  = context @ W_dense + bias (+ query)
//! ```
//!
//! Every intermediate lives in a scratch slot owned by the layer, so repeat
//! calls with the same shapes do not allocate beyond the returned output.

use kestrel_core::{
    DType, Device, KestrelError, Result, ScratchGuard, ScratchPool, Tensor, TensorView,
};
use kestrel_kernels::{
    add_bias, add_bias_transpose_for_score, add_input_bias, apply_mask_and_softmax,
    batch_mat_mul, layer_norm, mat_mul, split_add_bias_transpose_for_score, transpose_for_score,
};
use parking_lot::Mutex;
use tracing::Level;

use crate::config::AttentionConfig;
use crate::mode::AttentionMode;
use crate::validate::{resolve_dims, validate_inputs, Dims};
use crate::weights::AttentionWeights;

/// One scratch slot per intermediate, so no two stages alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScratchSlot {
    NormedQuery,
    QProj,
    KProj,
    VProj,
    QHeads,
    KHeads,
    VHeads,
    QkvProj,
    QkvHeads,
    Scores,
    Context,
    Merged,
}

type Guard<'a> = ScratchGuard<'a, ScratchSlot>;

/// Multi-headed attention layer with fixed weights and its own scratch pool.
///
/// `forward` takes `&self` and may be called from several threads; calls on
/// one instance run one at a time. Separate instances never contend.
pub struct MultiHeadedAttention {
    config: AttentionConfig,
    weights: AttentionWeights,
    scratch: ScratchPool<ScratchSlot>,
    serial: Mutex<()>,
}

impl MultiHeadedAttention {
    /// Validate the config and weight shapes once; forward calls rely on them.
    pub fn new(config: AttentionConfig, weights: AttentionWeights) -> Result<Self> {
        config.validate()?;
        weights.check_shapes(config.hidden_size)?;
        tracing::debug!(
            hidden = config.hidden_size,
            heads = config.num_heads,
            device = %weights.device(),
            "attention layer ready"
        );
        Ok(Self {
            config,
            weights,
            scratch: ScratchPool::new(),
            serial: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    pub fn weights(&self) -> &AttentionWeights {
        &self.weights
    }

    pub fn scratch(&self) -> &ScratchPool<ScratchSlot> {
        &self.scratch
    }

    /// Attend `query` over `key`/`value` and return `[batch, q_len, hidden]`.
    ///
    /// In [`AttentionMode::SelfAttention`] Q, K and V all come from `query`
    /// (key and value are validated only). `pre_normalize` layer-normalizes
    /// a copy of the query before projecting; `query` itself is never
    /// written. With `fuse_residual_bias` the un-normalized query is added
    /// to the output together with the dense bias.
    ///
    /// Fails before any numeric work on malformed inputs; no output is
    /// produced on error.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        key: &Tensor,
        value: &Tensor,
        query: &Tensor,
        attention_mask: &Tensor,
        mode: AttentionMode,
        pre_normalize: bool,
        fuse_residual_bias: bool,
    ) -> Result<Tensor> {
        let _serial = self.serial.lock();

        validate_inputs(key, value, query, attention_mask)?;
        let heads = self.config.num_heads;
        let dims = resolve_dims(
            key,
            value,
            query,
            attention_mask,
            mode,
            self.config.hidden_size,
            heads,
        )?;
        let device = query.device();
        if device != self.weights.device() {
            return Err(KestrelError::DeviceMismatch {
                context: "query vs layer weights".into(),
                left: device,
                right: self.weights.device(),
            });
        }
        if tracing::enabled!(Level::TRACE) {
            self.weights.trace_dump();
        }
        let Dims { batch, q_len, k_len, hidden } = dims;
        let head_dim = hidden / heads;
        tracing::debug!(
            %mode,
            batch,
            q_len,
            k_len,
            heads,
            head_dim,
            pre_normalize,
            fuse_residual_bias,
            "attention forward"
        );

        let query_view = query.view()?;
        let mask_view = attention_mask.view()?;
        let mut normed = self.scratch.checkout(ScratchSlot::NormedQuery, device)?;
        if pre_normalize {
            normed.copy_from(&query_view)?;
            layer_norm(
                &self.weights.layernorm_gamma.view()?,
                &self.weights.layernorm_beta.view()?,
                &mut normed,
                self.config.layer_norm_eps,
            )?;
        }
        let input = if pre_normalize { normed.view()? } else { query_view.clone() };

        let separate: [Guard<'_>; 3];
        let fused: Guard<'_>;
        let [q, k, v] = match mode {
            AttentionMode::Context => {
                separate = self.project_context(&input, key, value, dims, heads, device)?;
                [separate[0].view()?, separate[1].view()?, separate[2].view()?]
            }
            AttentionMode::SelfAttention => {
                fused = self.project_fused(&input, dims, heads, device)?;
                fused.view()?.split_leading::<3>()?
            }
        };

        let mut scores =
            self.checkout(ScratchSlot::Scores, &[batch, heads, q_len, k_len], device)?;
        let scale = 1.0 / (head_dim as f32).sqrt();
        batch_mat_mul(&q, false, &k, true, scale, &mut scores, 0.0)?;
        apply_mask_and_softmax(&mut scores, &mask_view, self.config.mask_scale)?;

        let mut context =
            self.checkout(ScratchSlot::Context, &[batch, heads, q_len, head_dim], device)?;
        batch_mat_mul(&scores.view()?, false, &v, false, 1.0, &mut context, 0.0)?;
        let mut merged = self.checkout(ScratchSlot::Merged, &[batch, q_len, hidden], device)?;
        transpose_for_score(&context.view()?, &mut merged)?;

        let mut output = Tensor::zeros_on(&[batch, q_len, hidden], DType::F32, device)?;
        let dense_weight = self.weights.dense_weight.view()?;
        mat_mul(&merged.view()?, false, &dense_weight, false, 1.0, &mut output, 0.0)?;
        let dense_bias = self.weights.dense_bias.view()?;
        if fuse_residual_bias {
            add_input_bias(&query_view, &dense_bias, &mut output)?;
        } else {
            add_bias(&dense_bias, &mut output)?;
        }
        Ok(output)
    }

    /// Three independent projections, each bias-added into `[B, H, S, D]`.
    fn project_context(
        &self,
        input: &TensorView<'_>,
        key: &Tensor,
        value: &Tensor,
        dims: Dims,
        heads: usize,
        device: Device,
    ) -> Result<[Guard<'_>; 3]> {
        let Dims { batch, q_len, k_len, .. } = dims;
        let w = &self.weights;
        let q = self.project_one(
            input,
            (&w.q_weight, &w.q_bias),
            [batch, q_len, heads],
            (ScratchSlot::QProj, ScratchSlot::QHeads),
            device,
        )?;
        let k = self.project_one(
            &key.view()?,
            (&w.k_weight, &w.k_bias),
            [batch, k_len, heads],
            (ScratchSlot::KProj, ScratchSlot::KHeads),
            device,
        )?;
        let v = self.project_one(
            &value.view()?,
            (&w.v_weight, &w.v_bias),
            [batch, k_len, heads],
            (ScratchSlot::VProj, ScratchSlot::VHeads),
            device,
        )?;
        Ok([q, k, v])
    }

    /// `x @ weight`, then bias-add and transpose into `[batch, heads, seq, head_dim]`.
    fn project_one(
        &self,
        x: &TensorView<'_>,
        (weight, bias): (&Tensor, &Tensor),
        [batch, seq, heads]: [usize; 3],
        (proj_slot, heads_slot): (ScratchSlot, ScratchSlot),
        device: Device,
    ) -> Result<Guard<'_>> {
        let hidden = self.config.hidden_size;
        let head_dim = hidden / heads;
        let mut proj = self.checkout(proj_slot, &[batch, seq, hidden], device)?;
        mat_mul(x, false, &weight.view()?, false, 1.0, &mut proj, 0.0)?;

        let mut split = self.checkout(heads_slot, &[batch, heads, seq, head_dim], device)?;
        let proj_heads = proj.view()?.reshape(&[batch, seq, heads, head_dim])?;
        add_bias_transpose_for_score(&proj_heads, &bias.view()?, &mut split)?;
        Ok(split)
    }

    /// One fused projection split into `[3, B, H, S, D]` in a single pass.
    fn project_fused(
        &self,
        input: &TensorView<'_>,
        dims: Dims,
        heads: usize,
        device: Device,
    ) -> Result<Guard<'_>> {
        let Dims { batch, q_len, hidden, .. } = dims;
        let head_dim = hidden / heads;
        let mut proj = self.checkout(ScratchSlot::QkvProj, &[batch, q_len, 3 * hidden], device)?;
        mat_mul(input, false, &self.weights.qkv_weight.view()?, false, 1.0, &mut proj, 0.0)?;

        let mut split =
            self.checkout(ScratchSlot::QkvHeads, &[3, batch, heads, q_len, head_dim], device)?;
        let parts = proj.view()?.reshape(&[batch, q_len, 3, heads, head_dim])?;
        split_add_bias_transpose_for_score(&parts, &self.weights.qkv_bias.view()?, &mut split)?;
        Ok(split)
    }

    /// Check out `slot` and size it to `dims`, growing only when needed.
    fn checkout(&self, slot: ScratchSlot, dims: &[usize], device: Device) -> Result<Guard<'_>> {
        let mut guard = self.scratch.checkout(slot, device)?;
        guard.reshape_in_place(dims, DType::F32, device)?;
        Ok(guard)
    }
}

impl std::fmt::Debug for MultiHeadedAttention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiHeadedAttention")
            .field("config", &self.config)
            .field("scratch", &self.scratch)
            .finish()
    }
}
