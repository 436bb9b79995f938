//! # kestrel-core
//!
//! Tensor abstraction for the Kestrel inference engine.
//!
//! Provides:
//! - `Tensor`: dense row-major storage tagged with dtype and device
//! - `TensorView`: borrowed, allocation-free views and leading-axis splits
//! - In-place reshape that reuses buffers, for scratch tensors
//! - `ScratchPool`: per-instance reusable intermediates keyed by call site
//! - Half-precision widening for checkpoint weights

pub mod dtype;
pub mod device;
pub mod storage;
pub mod shape;
pub mod tensor;
pub mod view;
pub mod scratch;
pub mod error;
pub mod prelude;

pub use dtype::DType;
pub use device::Device;
pub use storage::Storage;
pub use shape::Shape;
pub use tensor::Tensor;
pub use view::TensorView;
pub use scratch::{ScratchGuard, ScratchPool};
pub use error::KestrelError;

pub type Result<T> = std::result::Result<T, KestrelError>;
