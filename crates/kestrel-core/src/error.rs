use crate::{DType, Device};

/// Errors raised by Kestrel tensors, kernels and layers.
///
/// Every variant carries enough context to tell which tensor (or which
/// pair of tensors) broke which precondition.
#[derive(Debug, thiserror::Error)]
pub enum KestrelError {
    #[error("shape mismatch in {context}: {detail}")]
    ShapeMismatch { context: String, detail: String },

    #[error("device mismatch in {context}: {left} vs {right}")]
    DeviceMismatch {
        context: String,
        left: Device,
        right: Device,
    },

    #[error("unsupported attention mode '{0}' (expected 'self' or 'context')")]
    UnsupportedMode(String),

    #[error("unsupported dtype: {0}")]
    UnsupportedDType(DType),

    #[error("unsupported device: {0} (only CPU kernels are available)")]
    UnsupportedDevice(Device),

    #[error("matmul dimension mismatch: [{m}, {k1}] x [{k2}, {n}]")]
    MatmulDimMismatch { m: usize, k1: usize, k2: usize, n: usize },

    #[error("cannot reshape {numel} elements into {shape:?}")]
    InvalidReshape { numel: usize, shape: Vec<usize> },

    #[error("scratch slot '{0}' is already checked out")]
    ScratchInUse(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("config parse error: {0}")]
    Config(#[from] serde_json::Error),
}

impl KestrelError {
    /// Shorthand for a [`KestrelError::ShapeMismatch`].
    pub fn shape(context: impl Into<String>, detail: impl Into<String>) -> Self {
        KestrelError::ShapeMismatch {
            context: context.into(),
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_tensor() {
        let e = KestrelError::shape("key_tensor", "expected rank 3, got [2, 4]");
        assert_eq!(
            e.to_string(),
            "shape mismatch in key_tensor: expected rank 3, got [2, 4]"
        );

        let e = KestrelError::DeviceMismatch {
            context: "key_tensor/attention_mask".into(),
            left: Device::Cpu(0),
            right: Device::Cpu(1),
        };
        assert!(e.to_string().contains("cpu:0 vs cpu:1"));
    }

    #[test]
    fn test_config_error_from_json() {
        let err: KestrelError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, KestrelError::Config(_)));
    }
}
