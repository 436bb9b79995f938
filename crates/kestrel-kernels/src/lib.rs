//! # kestrel-kernels
//!
//! CPU reference kernels for Kestrel.
//!
//! Provides:
//! - Runtime SIMD capability detection (AVX2, AVX-512, NEON)
//! - Tiled dense and batched GEMM with transpose flags and alpha/beta
//! - Masked softmax with broadcast additive masks
//! - Fused epilogues (LayerNorm, bias add, residual + bias add)
//! - Head layout transforms with folded bias
//!
//! Every kernel reads borrowed [`kestrel_core::TensorView`]s and writes into a
//! caller-shaped output tensor; none of them allocate their result.

pub mod simd;
mod common;
pub mod matmul;
pub mod softmax;
pub mod fused;
pub mod transpose;

pub use simd::SimdCapability;
pub use matmul::{batch_mat_mul, mat_mul};
pub use softmax::apply_mask_and_softmax;
pub use fused::{add_bias, add_input_bias, layer_norm};
pub use transpose::{
    add_bias_transpose_for_score, split_add_bias_transpose_for_score, transpose_for_score,
};
