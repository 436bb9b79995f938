//! Convenience re-exports for common kestrel-core types.
//!
//! ```rust
//! use kestrel_core::prelude::*;
//! ```

pub use crate::Tensor;
pub use crate::TensorView;
pub use crate::DType;
pub use crate::Device;
pub use crate::Shape;
pub use crate::KestrelError;
pub use crate::Result;
