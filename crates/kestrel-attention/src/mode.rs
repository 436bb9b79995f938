//! Attention mode: how Q, K and V are projected.

use std::fmt;
use std::str::FromStr;

use kestrel_core::KestrelError;

/// Selects between one fused QKV projection and three independent ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttentionMode {
    /// Q, K and V all come from the query through the fused `qkv_weight`.
    /// The key and value arguments are validated but not read.
    SelfAttention,
    /// Q comes from the query, K and V from the key and value tensors,
    /// each through its own projection.
    Context,
}

impl AttentionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttentionMode::SelfAttention => "self",
            AttentionMode::Context => "context",
        }
    }
}

impl FromStr for AttentionMode {
    type Err = KestrelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "self" => Ok(AttentionMode::SelfAttention),
            "context" => Ok(AttentionMode::Context),
            other => Err(KestrelError::UnsupportedMode(other.to_string())),
        }
    }
}

impl fmt::Display for AttentionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
