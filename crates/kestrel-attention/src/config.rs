//! Attention layer hyperparameters.

use kestrel_core::{KestrelError, Result};
use serde::{Deserialize, Serialize};

/// Configuration for a [`crate::MultiHeadedAttention`] layer.
///
/// Field names follow the usual checkpoint `config.json` keys, so a model
/// config can be deserialized directly:
///
/// ```
/// use kestrel_attention::AttentionConfig;
///
/// let json = r#"{"hidden_size": 768, "num_attention_heads": 12}"#;
/// let cfg = AttentionConfig::from_json(json).unwrap();
/// assert_eq!(cfg.head_dim(), 64);
/// assert_eq!(cfg.mask_scale, 1.0);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttentionConfig {
    pub hidden_size: usize,
    #[serde(alias = "num_attention_heads")]
    pub num_heads: usize,
    /// Epsilon of the optional query pre-normalization.
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f32,
    /// Multiplier applied to finite additive mask entries. Must be positive.
    #[serde(default = "default_mask_scale")]
    pub mask_scale: f32,
}

fn default_layer_norm_eps() -> f32 {
    1e-6
}

fn default_mask_scale() -> f32 {
    1.0
}

impl AttentionConfig {
    pub fn new(hidden_size: usize, num_heads: usize) -> Self {
        Self {
            hidden_size,
            num_heads,
            layer_norm_eps: default_layer_norm_eps(),
            mask_scale: default_mask_scale(),
        }
    }

    /// Parse and validate a JSON config.
    pub fn from_json(text: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_layer_norm_eps(mut self, eps: f32) -> Self {
        self.layer_norm_eps = eps;
        self
    }

    pub fn with_mask_scale(mut self, scale: f32) -> Self {
        self.mask_scale = scale;
        self
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads.max(1)
    }

    /// Check the head split. Done once at construction; forward calls
    /// assume it holds.
    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 || self.hidden_size == 0 {
            return Err(KestrelError::InvalidConfig(format!(
                "hidden_size ({}) and num_heads ({}) must be non-zero",
                self.hidden_size, self.num_heads
            )));
        }
        if self.hidden_size % self.num_heads != 0 {
            return Err(KestrelError::InvalidConfig(format!(
                "hidden_size {} is not divisible by num_heads {}",
                self.hidden_size, self.num_heads
            )));
        }
        if self.layer_norm_eps.is_nan() || self.layer_norm_eps <= 0.0 {
            return Err(KestrelError::InvalidConfig(format!(
                "layer_norm_eps must be positive, got {}",
                self.layer_norm_eps
            )));
        }
        if !self.mask_scale.is_finite() || self.mask_scale <= 0.0 {
            return Err(KestrelError::InvalidConfig(format!(
                "mask_scale must be positive and finite, got {}",
                self.mask_scale
            )));
        }
        Ok(())
    }
}
