//! Borrowed, non-owning tensor views.
//!
//! A [`TensorView`] is a shape plus a borrowed `f32` slice. Creating one,
//! reshaping one or splitting one never allocates, and nothing has to be
//! released afterwards: the borrow checker ties the view to the tensor it
//! was taken from.

use crate::{Device, KestrelError, Result, Shape};

/// Read-only contiguous f32 view into a tensor's storage.
#[derive(Clone)]
pub struct TensorView<'a> {
    data: &'a [f32],
    shape: Shape,
    device: Device,
}

impl<'a> TensorView<'a> {
    /// Wrap a slice with a shape. The slice length must equal the shape's numel.
    pub fn new(data: &'a [f32], shape: impl Into<Shape>, device: Device) -> Result<Self> {
        let shape = shape.into();
        if shape.numel() != data.len() {
            return Err(KestrelError::InvalidReshape {
                numel: data.len(),
                shape: shape.dims().to_vec(),
            });
        }
        Ok(Self { data, shape, device })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// The viewed elements in row-major order.
    pub fn as_slice(&self) -> &'a [f32] {
        self.data
    }

    /// Reinterpret the same elements under another shape.
    pub fn reshape(&self, dims: &[usize]) -> Result<TensorView<'a>> {
        TensorView::new(self.data, dims, self.device)
    }

    /// Sub-view at `index` along the leading axis.
    pub fn index(&self, index: usize) -> Result<TensorView<'a>> {
        let lead = self.shape.dim(0).ok_or_else(|| {
            KestrelError::shape("view index", "cannot index a scalar view")
        })?;
        if index >= lead {
            return Err(KestrelError::shape(
                "view index",
                format!("index {index} out of range for leading axis of {}", self.shape),
            ));
        }
        let inner = self.numel() / lead;
        let shape = self.shape.drop_leading().unwrap_or_else(Shape::scalar);
        Ok(TensorView {
            data: &self.data[index * inner..(index + 1) * inner],
            shape,
            device: self.device,
        })
    }

    /// Split the leading axis (which must have size `N`) into `N`
    /// non-overlapping views.
    pub fn split_leading<const N: usize>(&self) -> Result<[TensorView<'a>; N]> {
        if self.shape.dim(0) != Some(N) {
            return Err(KestrelError::shape(
                "split_leading",
                format!("expected leading axis of {N}, got shape {}", self.shape),
            ));
        }
        let inner = self.numel() / N;
        let shape = self.shape.drop_leading().unwrap_or_else(Shape::scalar);
        let data = self.data;
        let device = self.device;
        Ok(std::array::from_fn(|i| TensorView {
            data: &data[i * inner..(i + 1) * inner],
            shape: shape.clone(),
            device,
        }))
    }
}

impl std::fmt::Debug for TensorView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TensorView(shape={}, device={})", self.shape, self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iota(n: usize) -> Vec<f32> {
        (0..n).map(|i| i as f32).collect()
    }

    #[test]
    fn test_new_checks_numel() {
        let data = iota(6);
        assert!(TensorView::new(&data, [2, 3], Device::Cpu(0)).is_ok());
        assert!(TensorView::new(&data, [4, 2], Device::Cpu(0)).is_err());
    }

    #[test]
    fn test_split_leading_is_disjoint() {
        let data = iota(3 * 4);
        let v = TensorView::new(&data, [3, 2, 2], Device::Cpu(0)).unwrap();
        let [q, k, vv] = v.split_leading::<3>().unwrap();
        assert_eq!(q.dims(), &[2, 2]);
        assert_eq!(q.as_slice(), &[0.0, 1.0, 2.0, 3.0]);
        assert_eq!(k.as_slice(), &[4.0, 5.0, 6.0, 7.0]);
        assert_eq!(vv.as_slice(), &[8.0, 9.0, 10.0, 11.0]);

        let q_end = q.as_slice().as_ptr_range().end;
        assert!(q_end <= k.as_slice().as_ptr());
    }

    #[test]
    fn test_split_leading_wrong_size() {
        let data = iota(8);
        let v = TensorView::new(&data, [2, 4], Device::Cpu(0)).unwrap();
        assert!(v.split_leading::<3>().is_err());
    }

    #[test]
    fn test_index_and_reshape() {
        let data = iota(12);
        let v = TensorView::new(&data, [2, 6], Device::Cpu(0)).unwrap();
        let row = v.index(1).unwrap();
        assert_eq!(row.dims(), &[6]);
        assert_eq!(row.as_slice()[0], 6.0);
        assert!(v.index(2).is_err());

        let r = v.reshape(&[3, 4]).unwrap();
        assert_eq!(r.dims(), &[3, 4]);
        assert!(v.reshape(&[5, 2]).is_err());
    }
}
