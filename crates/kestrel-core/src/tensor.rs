use std::fmt;

use half::{bf16, f16};

use crate::dtype::DType;
use crate::device::Device;
use crate::error::KestrelError;
use crate::shape::Shape;
use crate::storage::Storage;
use crate::view::TensorView;
use crate::Result;

/// A dense, row-major, multi-dimensional array.
///
/// Tensors always address their storage contiguously from offset 0.
/// Strided or sliced access goes through borrowed [`TensorView`]s, which
/// never own or allocate.
///
/// # Examples
///
/// ```
/// use kestrel_core::Tensor;
///
/// let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
/// assert_eq!(t.dims(), &[2, 2]);
/// assert_eq!(t.numel(), 4);
///
/// let flat = t.reshape(&[4]).unwrap();
/// assert_eq!(flat.dims(), &[4]);
/// ```
#[derive(Clone)]
pub struct Tensor {
    storage: Storage,
    shape: Shape,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Create a tensor from f32 data with the given shape on `cpu:0`.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        assert_eq!(
            s.numel(),
            data.len(),
            "Shape {:?} requires {} elements, got {}",
            shape,
            s.numel(),
            data.len()
        );
        let storage = Storage::from_f32(data, Device::default())
            .expect("host storage allocation cannot fail for cpu:0");
        Self { storage, shape: s }
    }

    /// Create an F16-tagged tensor from half-precision data.
    pub fn from_f16(data: &[f16], shape: &[usize]) -> Result<Self> {
        Self::from_raw(DType::F16, bytemuck::cast_slice(data), shape)
    }

    /// Create a BF16-tagged tensor from bfloat16 data.
    pub fn from_bf16(data: &[bf16], shape: &[usize]) -> Result<Self> {
        Self::from_raw(DType::BF16, bytemuck::cast_slice(data), shape)
    }

    fn from_raw(dtype: DType, bytes: &[u8], shape: &[usize]) -> Result<Self> {
        let s = Shape::new(shape);
        let storage = Storage::from_bytes(dtype, s.numel(), bytes, Device::default())?;
        Ok(Self { storage, shape: s })
    }

    /// Create a tensor of zeros on `cpu:0`.
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        Self::zeros_on(shape, dtype, Device::default())
            .expect("host storage allocation cannot fail for cpu:0")
    }

    /// Create a tensor of zeros on the given device.
    pub fn zeros_on(shape: &[usize], dtype: DType, device: Device) -> Result<Self> {
        let s = Shape::new(shape);
        Ok(Self {
            storage: Storage::zeros(dtype, s.numel(), device)?,
            shape: s,
        })
    }

    /// An empty F32 tensor with no capacity, ready to be grown by
    /// [`Tensor::reshape_in_place`].
    pub fn empty(device: Device) -> Result<Self> {
        Self::zeros_on(&[0], DType::F32, device)
    }

    /// Create a tensor of ones (f32).
    pub fn ones(shape: &[usize]) -> Self {
        let numel = Shape::new(shape).numel();
        Self::from_f32(&vec![1.0; numel], shape)
    }

    /// Create a tensor filled with `value` (f32).
    pub fn full(shape: &[usize], value: f32) -> Self {
        let numel = Shape::new(shape).numel();
        Self::from_f32(&vec![value; numel], shape)
    }

    /// Create a tensor with random values from standard normal distribution N(0,1).
    pub fn randn(shape: &[usize]) -> Self {
        use rand::Rng;
        let numel = Shape::new(shape).numel();
        let mut rng = rand::thread_rng();
        // Box-Muller transform for normal distribution
        let data: Vec<f32> = (0..numel)
            .map(|_| {
                let u1: f32 = rng.gen_range(1e-7f32..1.0f32);
                let u2: f32 = rng.gen_range(0.0f32..std::f32::consts::TAU);
                (-2.0 * u1.ln()).sqrt() * u2.cos()
            })
            .collect();
        Self::from_f32(&data, shape)
    }

    /// Create a tensor with random values uniformly distributed in [low, high).
    pub fn rand_uniform(shape: &[usize], low: f32, high: f32) -> Self {
        use rand::Rng;
        let numel = Shape::new(shape).numel();
        let mut rng = rand::thread_rng();
        let data: Vec<f32> = (0..numel).map(|_| rng.gen_range(low..high)).collect();
        Self::from_f32(&data, shape)
    }

    /// Get a reference to the underlying storage.
    pub fn storage_ref(&self) -> &Storage {
        &self.storage
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Shape of the tensor.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Dimension sizes.
    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Number of elements the backing buffer can hold without reallocating.
    pub fn capacity(&self) -> usize {
        self.storage.capacity()
    }

    /// Data type.
    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    /// Device.
    pub fn device(&self) -> Device {
        self.storage.device()
    }

    /// Whether both tensors live on the same execution context.
    pub fn same_device(&self, other: &Tensor) -> bool {
        self.device().same_context(&other.device())
    }

    // =========================================================================
    // Data access
    // =========================================================================

    /// The tensor's f32 elements. `None` for other dtypes.
    pub fn as_f32_slice(&self) -> Option<&[f32]> {
        let numel = self.numel();
        self.storage.as_f32_slice().map(|s| &s[..numel])
    }

    /// Mutable f32 elements (copy-on-write if the buffer is shared).
    pub fn as_f32_slice_mut(&mut self) -> Option<&mut [f32]> {
        let numel = self.numel();
        self.storage.as_f32_slice_mut().map(|s| &mut s[..numel])
    }

    /// Borrow the tensor as a read-only view.
    pub fn view(&self) -> Result<TensorView<'_>> {
        let data = self
            .as_f32_slice()
            .ok_or(KestrelError::UnsupportedDType(self.dtype()))?;
        TensorView::new(data, self.shape.clone(), self.device())
    }

    // =========================================================================
    // Shape operations
    // =========================================================================

    /// Reshape (zero-copy, shares storage).
    pub fn reshape(&self, dims: &[usize]) -> Result<Tensor> {
        let shape = Shape::new(dims);
        if shape.numel() != self.numel() {
            return Err(KestrelError::InvalidReshape {
                numel: self.numel(),
                shape: dims.to_vec(),
            });
        }
        Ok(Tensor {
            storage: self.storage.clone(), // Arc clone, shared data
            shape,
        })
    }

    /// Re-label this tensor with a new shape, dtype and device.
    ///
    /// The existing buffer is kept when it is unshared, of the same dtype
    /// and device, and large enough; its contents are then unspecified.
    /// Otherwise a fresh zeroed buffer is allocated. Never shrinks.
    pub fn reshape_in_place(&mut self, dims: &[usize], dtype: DType, device: Device) -> Result<()> {
        let shape = Shape::new(dims);
        let needed = shape.numel();
        let reusable = self.storage.is_unique()
            && self.storage.dtype() == dtype
            && self.storage.device() == device
            && self.storage.capacity() >= needed;
        if !reusable {
            let capacity = if self.storage.dtype() == dtype && self.storage.device() == device {
                needed.max(self.storage.capacity())
            } else {
                needed
            };
            tracing::debug!(
                from = self.storage.capacity(),
                to = capacity,
                %dtype,
                %device,
                "growing tensor buffer"
            );
            self.storage = Storage::zeros(dtype, capacity, device)?;
        }
        self.shape = shape;
        Ok(())
    }

    /// Deep-copy `src` into this tensor's own buffer, adopting its shape.
    pub fn copy_from(&mut self, src: &TensorView<'_>) -> Result<()> {
        self.reshape_in_place(src.dims(), DType::F32, self.device())?;
        let dst = self
            .as_f32_slice_mut()
            .ok_or(KestrelError::UnsupportedDType(DType::F32))?;
        dst.copy_from_slice(src.as_slice());
        Ok(())
    }

    /// Copy this tensor onto another execution context. Returns a shared
    /// clone when it already lives there.
    pub fn to_device(&self, device: Device) -> Result<Tensor> {
        if self.device() == device {
            return Ok(self.clone());
        }
        Ok(Tensor {
            storage: self.storage.to_device(device)?,
            shape: self.shape.clone(),
        })
    }

    /// Widen to an F32 tensor on the same device.
    pub fn to_f32(&self) -> Result<Tensor> {
        let bytes = &self.storage.as_bytes()[..self.dtype().storage_bytes(self.numel())];
        let data: Vec<f32> = match self.dtype() {
            DType::F32 => return Ok(self.clone()),
            DType::F16 => bytemuck::cast_slice::<u8, u16>(bytes)
                .iter()
                .map(|&b| f16::from_bits(b).to_f32())
                .collect(),
            DType::BF16 => bytemuck::cast_slice::<u8, u16>(bytes)
                .iter()
                .map(|&b| bf16::from_bits(b).to_f32())
                .collect(),
            DType::F64 => bytemuck::cast_slice::<u8, f64>(bytes)
                .iter()
                .map(|&v| v as f32)
                .collect(),
            other => return Err(KestrelError::UnsupportedDType(other)),
        };
        Ok(Tensor {
            storage: Storage::from_f32(&data, self.device())?,
            shape: self.shape.clone(),
        })
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(shape={}, dtype={}, device={}, capacity={})",
            self.shape,
            self.dtype(),
            self.device(),
            self.capacity(),
        )
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_f32_slice() {
            Some(data) if data.len() <= 20 => {
                write!(f, "tensor({:?}, shape={})", data, self.shape)
            }
            Some(data) => write!(
                f,
                "tensor([{:.4}, {:.4}, ..., {:.4}], shape={})",
                data[0],
                data[1],
                data[data.len() - 1],
                self.shape
            ),
            None => write!(f, "tensor(shape={}, dtype={})", self.shape, self.dtype()),
        }
    }
}
