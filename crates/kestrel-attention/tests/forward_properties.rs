//! End-to-end properties of `MultiHeadedAttention::forward`.

use std::io;
use std::sync::{Arc, Mutex};

use kestrel_attention::mask::{extended_attention_mask, padding_mask};
use kestrel_attention::{AttentionConfig, AttentionMode, AttentionWeights, MultiHeadedAttention};
use kestrel_core::{DType, Device, KestrelError, Tensor};

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch");
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() < tol, "index {}: {} vs {} (tol {})", i, x, y, tol);
    }
}

fn layer(hidden: usize, heads: usize) -> MultiHeadedAttention {
    MultiHeadedAttention::new(AttentionConfig::new(hidden, heads), AttentionWeights::random(hidden))
        .unwrap()
}

fn zero_mask(batch: usize, k_len: usize) -> Tensor {
    Tensor::zeros(&[batch, 1, 1, k_len], DType::F32)
}

#[test]
fn output_shape_in_both_modes() {
    let attn = layer(16, 4);
    let query = Tensor::randn(&[3, 5, 16]);
    let kv = Tensor::randn(&[3, 9, 16]);

    for pre_normalize in [false, true] {
        for fuse in [false, true] {
            let out = attn
                .forward(
                    &kv,
                    &kv,
                    &query,
                    &zero_mask(3, 9),
                    AttentionMode::Context,
                    pre_normalize,
                    fuse,
                )
                .unwrap();
            assert_eq!(out.dims(), &[3, 5, 16]);

            let out = attn
                .forward(
                    &kv,
                    &kv,
                    &query,
                    &zero_mask(3, 5),
                    AttentionMode::SelfAttention,
                    pre_normalize,
                    fuse,
                )
                .unwrap();
            assert_eq!(out.dims(), &[3, 5, 16]);
        }
    }
}

#[test]
fn self_mode_matches_context_mode_on_shared_input() {
    let attn = layer(32, 4);
    let x = Tensor::randn(&[2, 6, 32]);
    let mask = padding_mask(&[6, 4], 6);

    let ctx = attn
        .forward(&x, &x, &x, &mask, AttentionMode::Context, false, false)
        .unwrap();
    let fused = attn
        .forward(&x, &x, &x, &mask, AttentionMode::SelfAttention, false, false)
        .unwrap();
    assert_close(ctx.as_f32_slice().unwrap(), fused.as_f32_slice().unwrap(), 1e-4);
}

#[test]
fn attention_rows_sum_to_one() {
    // With a constant value projection, every output row is dense(c) + bias
    // exactly when each softmax row sums to 1.
    let hidden = 8;
    let mut w = AttentionWeights::random(hidden);
    w.v_weight = Tensor::zeros(&[hidden, hidden], DType::F32);
    w.v_bias = Tensor::from_f32(&[1.0, -2.0, 0.5, 3.0, 0.0, 1.5, -1.0, 2.0], &[hidden]);
    w.fuse_qkv().unwrap();
    let expected_row = dense(&w, w.v_bias.as_f32_slice().unwrap());
    let attn = MultiHeadedAttention::new(AttentionConfig::new(hidden, 2), w).unwrap();

    let query = Tensor::randn(&[2, 3, hidden]);
    let kv = Tensor::randn(&[2, 5, hidden]);
    let mask = padding_mask(&[5, 2], 5);
    for mode in [AttentionMode::Context, AttentionMode::SelfAttention] {
        let mask = if mode == AttentionMode::Context { mask.clone() } else { zero_mask(2, 3) };
        let out = attn.forward(&kv, &kv, &query, &mask, mode, false, false).unwrap();
        for row in out.as_f32_slice().unwrap().chunks(hidden) {
            assert_close(row, &expected_row, 1e-4);
        }
    }
}

#[test]
fn masked_keys_get_no_weight() {
    let attn = layer(8, 2);
    let query = Tensor::randn(&[1, 3, 8]);
    let key = Tensor::randn(&[1, 4, 8]);
    let value = Tensor::randn(&[1, 4, 8]);
    let mask = padding_mask(&[2], 4);

    let base = attn
        .forward(&key, &value, &query, &mask, AttentionMode::Context, false, false)
        .unwrap();

    // Rewrite the masked key/value positions; the output must not move.
    let mut k2 = key.as_f32_slice().unwrap().to_vec();
    let mut v2 = value.as_f32_slice().unwrap().to_vec();
    for x in k2[2 * 8..].iter_mut().chain(v2[2 * 8..].iter_mut()) {
        *x = 100.0;
    }
    let key2 = Tensor::from_f32(&k2, &[1, 4, 8]);
    let value2 = Tensor::from_f32(&v2, &[1, 4, 8]);
    let moved = attn
        .forward(&key2, &value2, &query, &mask, AttentionMode::Context, false, false)
        .unwrap();
    assert_close(base.as_f32_slice().unwrap(), moved.as_f32_slice().unwrap(), 1e-5);
}

#[test]
fn mask_scale_invariance() {
    let weights = AttentionWeights::random(16);
    let plain = MultiHeadedAttention::new(AttentionConfig::new(16, 4), weights.clone()).unwrap();
    let halved_cfg = AttentionConfig::new(16, 4).with_mask_scale(0.5);
    let halved = MultiHeadedAttention::new(halved_cfg, weights).unwrap();

    let query = Tensor::randn(&[2, 3, 16]);
    let kv = Tensor::randn(&[2, 4, 16]);
    let mask = Tensor::rand_uniform(&[2, 1, 1, 4], -5.0, 0.0);
    let doubled: Vec<f32> = mask.as_f32_slice().unwrap().iter().map(|m| m * 2.0).collect();
    let doubled = Tensor::from_f32(&doubled, &[2, 1, 1, 4]);

    let a = plain
        .forward(&kv, &kv, &query, &mask, AttentionMode::Context, false, false)
        .unwrap();
    let b = halved
        .forward(&kv, &kv, &query, &doubled, AttentionMode::Context, false, false)
        .unwrap();
    assert_close(a.as_f32_slice().unwrap(), b.as_f32_slice().unwrap(), 1e-5);
}

#[test]
fn padding_mask_holds_under_other_scales() {
    let weights = AttentionWeights::random(8);
    let plain = MultiHeadedAttention::new(AttentionConfig::new(8, 2), weights.clone()).unwrap();
    let scaled_cfg = AttentionConfig::new(8, 2).with_mask_scale(0.25);
    let scaled = MultiHeadedAttention::new(scaled_cfg, weights.clone()).unwrap();

    let query = Tensor::randn(&[1, 4, 8]);
    let kv = Tensor::randn(&[1, 4, 8]);
    let mask = padding_mask(&[2], 4);
    let a = plain
        .forward(&kv, &kv, &query, &mask, AttentionMode::Context, false, false)
        .unwrap();
    let b = scaled
        .forward(&kv, &kv, &query, &mask, AttentionMode::Context, false, false)
        .unwrap();
    assert!(b.as_f32_slice().unwrap().iter().all(|x| x.is_finite()));
    // Padding is 0 or -inf, so the scale has nothing finite to stretch.
    assert_close(a.as_f32_slice().unwrap(), b.as_f32_slice().unwrap(), 1e-5);

    for bad in [0.0, -1.0] {
        let err = MultiHeadedAttention::new(
            AttentionConfig::new(8, 2).with_mask_scale(bad),
            weights.clone(),
        )
        .unwrap_err();
        assert!(matches!(err, KestrelError::InvalidConfig(_)), "{err}");
    }
}

#[test]
fn extended_mask_drops_positions() {
    let attn = layer(8, 2);
    let query = Tensor::randn(&[1, 2, 8]);
    let kv = Tensor::randn(&[1, 3, 8]);
    let keep = Tensor::from_f32(&[1.0, 1.0, 0.0], &[1, 3]);
    let additive = extended_attention_mask(&keep).unwrap();

    let full = attn
        .forward(&kv, &kv, &query, &additive, AttentionMode::Context, false, false)
        .unwrap();
    let trimmed_kv = Tensor::from_f32(&kv.as_f32_slice().unwrap()[..16], &[1, 2, 8]);
    let trimmed = attn
        .forward(
            &trimmed_kv,
            &trimmed_kv,
            &query,
            &zero_mask(1, 2),
            AttentionMode::Context,
            false,
            false,
        )
        .unwrap();
    assert_close(full.as_f32_slice().unwrap(), trimmed.as_f32_slice().unwrap(), 1e-4);
}

#[test]
fn pre_normalize_leaves_query_untouched() {
    let attn = layer(16, 4);
    let query = Tensor::randn(&[2, 5, 16]);
    let before = query.as_f32_slice().unwrap().to_vec();
    let kv = Tensor::randn(&[2, 3, 16]);

    for mode in [AttentionMode::Context, AttentionMode::SelfAttention] {
        let mask = if mode == AttentionMode::Context { zero_mask(2, 3) } else { zero_mask(2, 5) };
        attn.forward(&kv, &kv, &query, &mask, mode, true, true).unwrap();
        assert_eq!(query.as_f32_slice().unwrap(), before.as_slice());
    }
}

#[test]
fn pre_normalize_changes_projection_input() {
    let attn = layer(8, 2);
    // Large, offset query so normalization visibly changes it.
    let query = Tensor::rand_uniform(&[1, 4, 8], 10.0, 50.0);
    let mask = zero_mask(1, 4);
    let raw = attn
        .forward(&query, &query, &query, &mask, AttentionMode::SelfAttention, false, false)
        .unwrap();
    let normed = attn
        .forward(&query, &query, &query, &mask, AttentionMode::SelfAttention, true, false)
        .unwrap();
    let diff: f32 = raw
        .as_f32_slice()
        .unwrap()
        .iter()
        .zip(normed.as_f32_slice().unwrap())
        .map(|(a, b)| (a - b).abs())
        .sum();
    assert!(diff > 1e-3);
}

#[test]
fn residual_fusion_adds_query() {
    let attn = layer(16, 2);
    let query = Tensor::randn(&[2, 4, 16]);
    let kv = Tensor::randn(&[2, 6, 16]);
    let mask = padding_mask(&[6, 3], 6);

    for pre_normalize in [false, true] {
        let plain = attn
            .forward(&kv, &kv, &query, &mask, AttentionMode::Context, pre_normalize, false)
            .unwrap();
        let fused = attn
            .forward(&kv, &kv, &query, &mask, AttentionMode::Context, pre_normalize, true)
            .unwrap();
        let expected: Vec<f32> = plain
            .as_f32_slice()
            .unwrap()
            .iter()
            .zip(query.as_f32_slice().unwrap())
            .map(|(o, q)| o + q)
            .collect();
        assert_close(fused.as_f32_slice().unwrap(), &expected, 1e-5);
    }
}

#[test]
fn key_rank_two_is_a_shape_mismatch() {
    let attn = layer(8, 2);
    let query = Tensor::randn(&[1, 3, 8]);
    let key = Tensor::randn(&[4, 8]);
    let value = Tensor::randn(&[1, 4, 8]);
    let err = attn
        .forward(&key, &value, &query, &zero_mask(1, 4), AttentionMode::Context, false, false)
        .unwrap_err();
    match err {
        KestrelError::ShapeMismatch { context, .. } => assert_eq!(context, "key"),
        other => panic!("expected ShapeMismatch, got {other:?}"),
    }
    assert_eq!(attn.scratch().in_use(), 0);
}

#[test]
fn mask_on_other_device_is_a_device_mismatch() {
    let attn = layer(8, 2);
    let query = Tensor::randn(&[1, 3, 8]);
    let kv = Tensor::randn(&[1, 4, 8]);
    let mask = zero_mask(1, 4).to_device(Device::Cpu(1)).unwrap();
    let err = attn
        .forward(&kv, &kv, &query, &mask, AttentionMode::Context, false, false)
        .unwrap_err();
    assert!(matches!(err, KestrelError::DeviceMismatch { .. }), "{err}");
    // Nothing ran, so nothing was checked out.
    assert!(attn.scratch().is_empty());
}

#[test]
fn mask_shape_is_checked_before_projection() {
    let attn = layer(8, 2);
    let query = Tensor::randn(&[1, 3, 8]);
    let kv = Tensor::randn(&[1, 4, 8]);
    let err = attn
        .forward(&kv, &kv, &query, &zero_mask(1, 5), AttentionMode::Context, false, false)
        .unwrap_err();
    assert!(
        matches!(err, KestrelError::ShapeMismatch { ref context, .. } if context == "attention_mask")
    );
    assert!(attn.scratch().is_empty());
}

#[test]
fn unknown_mode_string() {
    let err = "cross".parse::<AttentionMode>().unwrap_err();
    assert!(matches!(err, KestrelError::UnsupportedMode(_)));
}

#[test]
fn uniform_scores_give_dense_of_mean_value() {
    let (batch, heads, head_dim, q_len, k_len) = (2, 4, 8, 5, 7);
    let hidden = heads * head_dim;

    let mut w = AttentionWeights::random(hidden);
    w.q_weight = Tensor::zeros(&[hidden, hidden], DType::F32);
    w.q_bias = Tensor::zeros(&[hidden], DType::F32);
    w.k_weight = Tensor::zeros(&[hidden, hidden], DType::F32);
    w.k_bias = Tensor::zeros(&[hidden], DType::F32);
    w.fuse_qkv().unwrap();

    let query = Tensor::randn(&[batch, q_len, hidden]);
    let key = Tensor::randn(&[batch, k_len, hidden]);
    let value = Tensor::randn(&[batch, k_len, hidden]);

    // Closed form: mean over keys of (value @ Wv + bv), then @ Wd + bd.
    let v = value.as_f32_slice().unwrap();
    let mut expected = Vec::with_capacity(batch * q_len * hidden);
    for b in 0..batch {
        let mut mean = vec![0.0f32; hidden];
        for j in 0..k_len {
            let row = &v[(b * k_len + j) * hidden..(b * k_len + j + 1) * hidden];
            let proj = linear(row, &w.v_weight, &w.v_bias);
            for (m, p) in mean.iter_mut().zip(&proj) {
                *m += p / k_len as f32;
            }
        }
        let out_row = dense(&w, &mean);
        for _ in 0..q_len {
            expected.extend_from_slice(&out_row);
        }
    }

    let attn = MultiHeadedAttention::new(AttentionConfig::new(hidden, heads), w).unwrap();
    let out = attn
        .forward(
            &key,
            &value,
            &query,
            &zero_mask(batch, k_len),
            AttentionMode::Context,
            false,
            false,
        )
        .unwrap();
    assert_eq!(out.dims(), &[2, 5, 32]);
    assert_close(out.as_f32_slice().unwrap(), &expected, 1e-4);
}

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn forward_emits_trace_dump() {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    tracing::subscriber::with_default(subscriber, || {
        let attn = layer(4, 2);
        let x = Tensor::randn(&[1, 2, 4]);
        let out = attn
            .forward(&x, &x, &x, &zero_mask(1, 2), AttentionMode::SelfAttention, false, false)
            .unwrap();
        assert_eq!(out.dims(), &[1, 2, 4]);
    });

    let log = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
    let dumped: Vec<&str> = log.lines().filter(|l| l.contains("attention weight")).collect();
    assert_eq!(dumped.len(), 12, "{log}");
    assert!(dumped.iter().any(|l| l.contains("q_weight")), "{log}");
    assert!(dumped.iter().all(|l| l.contains("TRACE")));
}

#[test]
fn no_trace_dump_below_trace_level() {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    tracing::subscriber::with_default(subscriber, || {
        let attn = layer(4, 2);
        let x = Tensor::randn(&[1, 2, 4]);
        attn.forward(&x, &x, &x, &zero_mask(1, 2), AttentionMode::SelfAttention, false, false)
            .unwrap();
    });

    let log = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
    assert!(log.contains("attention forward"), "{log}");
    assert!(!log.contains("q_weight"), "{log}");
}

/// `x @ weight + bias` for one row.
fn linear(x: &[f32], weight: &Tensor, bias: &Tensor) -> Vec<f32> {
    let w = weight.as_f32_slice().unwrap();
    let n = weight.dims()[1];
    let mut out = bias.as_f32_slice().unwrap().to_vec();
    for (i, &xi) in x.iter().enumerate() {
        for (o, &wij) in out.iter_mut().zip(&w[i * n..(i + 1) * n]) {
            *o += xi * wij;
        }
    }
    out
}

fn dense(w: &AttentionWeights, x: &[f32]) -> Vec<f32> {
    linear(x, &w.dense_weight, &w.dense_bias)
}
