//! # kestrel-attention
//!
//! Multi-headed attention forward orchestration for Kestrel.
//!
//! Provides:
//! - `MultiHeadedAttention`: validated, serialized forward pass over
//!   fused (self) or separate (context) Q/K/V projections
//! - Optional query pre-normalization and residual-fused output bias
//! - Per-layer scratch pool so steady-state calls reuse intermediates
//! - `AttentionConfig` (serde) and `AttentionWeights` with QKV fusion
//! - Padding, causal and extended (0/1 → additive) mask builders

pub mod mode;
pub mod config;
pub mod weights;
pub mod validate;
pub mod multi_headed;
pub mod mask;

pub use mode::AttentionMode;
pub use config::AttentionConfig;
pub use weights::AttentionWeights;
pub use validate::validate_inputs;
pub use multi_headed::{MultiHeadedAttention, ScratchSlot};
