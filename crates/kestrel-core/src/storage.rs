use std::sync::Arc;

use crate::{DType, Device, KestrelError, Result};

/// Shared, reference-counted host tensor storage.
///
/// Bytes live in a `u64`-word buffer so every reinterpretation as `f32`
/// is aligned. Storage is copy-on-write: views created by cloning share
/// the buffer until one of them is mutated.
///
/// The buffer may hold more elements than the tensor currently using it
/// (`capacity >= numel`). Scratch tensors rely on that to shrink and grow
/// between calls without reallocating.
#[derive(Debug, Clone)]
pub struct Storage {
    words: Arc<Vec<u64>>,
    dtype: DType,
    device: Device,
    /// Number of logical elements the buffer can hold.
    capacity: usize,
}

fn words_for(nbytes: usize) -> usize {
    nbytes.div_ceil(8)
}

fn check_host(device: Device) -> Result<()> {
    if device.is_cpu() {
        Ok(())
    } else {
        Err(KestrelError::UnsupportedDevice(device))
    }
}

impl Storage {
    /// Allocate zeroed storage for `capacity` elements on a host context.
    pub fn zeros(dtype: DType, capacity: usize, device: Device) -> Result<Self> {
        check_host(device)?;
        Ok(Self {
            words: Arc::new(vec![0u64; words_for(dtype.storage_bytes(capacity))]),
            dtype,
            device,
            capacity,
        })
    }

    /// Create storage from raw bytes.
    pub fn from_bytes(dtype: DType, numel: usize, bytes: &[u8], device: Device) -> Result<Self> {
        let expected = dtype.storage_bytes(numel);
        if bytes.len() != expected {
            return Err(KestrelError::shape(
                "storage",
                format!(
                    "expected {expected} bytes for {numel} elements of {dtype}, got {}",
                    bytes.len()
                ),
            ));
        }
        let mut s = Self::zeros(dtype, numel, device)?;
        s.as_bytes_mut().copy_from_slice(bytes);
        Ok(s)
    }

    /// Create CPU storage from a slice of f32 values.
    pub fn from_f32(data: &[f32], device: Device) -> Result<Self> {
        Self::from_bytes(DType::F32, data.len(), bytemuck::cast_slice(data), device)
    }

    /// Get the dtype of this storage.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Get the device of this storage.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Number of elements the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Size in bytes of the logical contents.
    pub fn nbytes(&self) -> usize {
        self.dtype.storage_bytes(self.capacity)
    }

    /// Read-only view of the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        let nbytes = self.nbytes();
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..nbytes]
    }

    /// Mutable view of the raw bytes.
    /// Clones the buffer first if it is shared (copy-on-write).
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let nbytes = self.nbytes();
        let words = Arc::make_mut(&mut self.words);
        &mut bytemuck::cast_slice_mut::<u64, u8>(words)[..nbytes]
    }

    /// Interpret storage as f32 values. `None` if the dtype is not F32.
    pub fn as_f32_slice(&self) -> Option<&[f32]> {
        if self.dtype != DType::F32 {
            return None;
        }
        Some(bytemuck::cast_slice(self.as_bytes()))
    }

    /// Interpret storage as mutable f32 values (copy-on-write).
    pub fn as_f32_slice_mut(&mut self) -> Option<&mut [f32]> {
        if self.dtype != DType::F32 {
            return None;
        }
        Some(bytemuck::cast_slice_mut(self.as_bytes_mut()))
    }

    /// Whether this storage is uniquely owned (no other Arc references).
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.words) == 1
    }

    /// Whether two storages share the same buffer.
    pub fn ptr_eq(&self, other: &Storage) -> bool {
        Arc::ptr_eq(&self.words, &other.words)
    }

    /// Deep copy into a buffer tagged for another host context.
    pub fn to_device(&self, device: Device) -> Result<Self> {
        check_host(device)?;
        Ok(Self {
            words: Arc::new(self.words.as_ref().clone()),
            dtype: self.dtype,
            device,
            capacity: self.capacity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeros() {
        let s = Storage::zeros(DType::F32, 10, Device::Cpu(0)).unwrap();
        assert_eq!(s.dtype(), DType::F32);
        assert_eq!(s.device(), Device::Cpu(0));
        assert_eq!(s.capacity(), 10);
        assert_eq!(s.nbytes(), 40);
        assert!(s.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_from_f32() {
        let s = Storage::from_f32(&[1.0, 2.0, 3.0], Device::Cpu(0)).unwrap();
        assert_eq!(s.as_f32_slice().unwrap(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_odd_byte_lengths() {
        let s = Storage::zeros(DType::F16, 3, Device::Cpu(0)).unwrap();
        assert_eq!(s.as_bytes().len(), 6);
        assert!(s.as_f32_slice().is_none());
    }

    #[test]
    fn test_copy_on_write() {
        let s1 = Storage::from_f32(&[1.0, 2.0, 3.0], Device::Cpu(0)).unwrap();
        let mut s2 = s1.clone();
        assert!(!s1.is_unique());
        assert!(s1.ptr_eq(&s2));

        s2.as_f32_slice_mut().unwrap()[0] = 99.0;

        assert_eq!(s1.as_f32_slice().unwrap()[0], 1.0);
        assert_eq!(s2.as_f32_slice().unwrap()[0], 99.0);
        assert!(!s1.ptr_eq(&s2));
    }

    #[test]
    fn test_from_bytes_validation() {
        assert!(Storage::from_bytes(DType::F32, 3, &[0u8; 11], Device::Cpu(0)).is_err());
        assert!(Storage::from_bytes(DType::F32, 3, &[0u8; 12], Device::Cpu(0)).is_ok());
    }

    #[test]
    fn test_cuda_storage_rejected() {
        let err = Storage::zeros(DType::F32, 4, Device::Cuda(0)).unwrap_err();
        assert!(matches!(err, KestrelError::UnsupportedDevice(Device::Cuda(0))));
    }

    #[test]
    fn test_to_device_copies() {
        let s = Storage::from_f32(&[1.0, 2.0], Device::Cpu(0)).unwrap();
        let moved = s.to_device(Device::Cpu(1)).unwrap();
        assert_eq!(moved.device(), Device::Cpu(1));
        assert!(!moved.ptr_eq(&s));
        assert_eq!(moved.as_f32_slice().unwrap(), &[1.0, 2.0]);
    }
}
