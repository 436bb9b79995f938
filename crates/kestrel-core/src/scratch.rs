//! Reusable scratch tensors keyed by call site and device.
//!
//! A [`ScratchPool`] keeps one tensor per `(slot, device)` pair. Layers
//! check a slot out for the duration of a computation, reshape it in place
//! (which only reallocates when the slot has to grow) and hand it back when
//! the [`ScratchGuard`] is dropped. Steady-state inference therefore runs
//! without per-call allocation of intermediates.
//!
//! While a slot is checked out it is absent from the pool, so a second
//! checkout of the same slot fails instead of aliasing the first.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

use crate::{Device, KestrelError, Result, Tensor};

struct PoolInner<K> {
    idle: HashMap<(K, Device), Tensor>,
    checked_out: HashSet<(K, Device)>,
}

/// Pool of scratch tensors indexed by `(K, Device)`.
pub struct ScratchPool<K> {
    inner: Mutex<PoolInner<K>>,
}

impl<K> ScratchPool<K>
where
    K: Copy + Eq + Hash + Debug,
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                idle: HashMap::new(),
                checked_out: HashSet::new(),
            }),
        }
    }

    /// Check out the tensor for `slot` on `device`, creating an empty one
    /// on first use. The tensor returns to the pool when the guard drops.
    pub fn checkout(&self, slot: K, device: Device) -> Result<ScratchGuard<'_, K>> {
        let key = (slot, device);
        let mut inner = self.inner.lock();
        if inner.checked_out.contains(&key) {
            return Err(KestrelError::ScratchInUse(format!("{slot:?}@{device}")));
        }
        let tensor = match inner.idle.remove(&key) {
            Some(t) => t,
            None => {
                tracing::debug!(?slot, %device, "creating scratch slot");
                Tensor::empty(device)?
            }
        };
        inner.checked_out.insert(key);
        Ok(ScratchGuard {
            pool: self,
            key,
            tensor: Some(tensor),
        })
    }

    /// Number of slots currently held by the pool (idle or checked out).
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.idle.len() + inner.checked_out.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots currently checked out.
    pub fn in_use(&self) -> usize {
        self.inner.lock().checked_out.len()
    }

    /// Bytes held by idle slots.
    pub fn resident_bytes(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .idle
            .values()
            .map(|t| t.storage_ref().nbytes())
            .sum()
    }

    /// Drop every idle slot, releasing its memory.
    pub fn clear(&self) {
        self.inner.lock().idle.clear();
    }

    fn release(&self, key: (K, Device), tensor: Tensor) {
        let mut inner = self.inner.lock();
        inner.checked_out.remove(&key);
        inner.idle.insert(key, tensor);
    }
}

impl<K> Default for ScratchPool<K>
where
    K: Copy + Eq + Hash + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Debug for ScratchPool<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ScratchPool")
            .field("idle", &inner.idle.len())
            .field("checked_out", &inner.checked_out.len())
            .finish()
    }
}

/// Exclusive handle to a checked-out scratch tensor.
pub struct ScratchGuard<'a, K>
where
    K: Copy + Eq + Hash + Debug,
{
    pool: &'a ScratchPool<K>,
    key: (K, Device),
    tensor: Option<Tensor>,
}

impl<K> Deref for ScratchGuard<'_, K>
where
    K: Copy + Eq + Hash + Debug,
{
    type Target = Tensor;

    fn deref(&self) -> &Tensor {
        self.tensor.as_ref().expect("scratch tensor present until drop")
    }
}

impl<K> DerefMut for ScratchGuard<'_, K>
where
    K: Copy + Eq + Hash + Debug,
{
    fn deref_mut(&mut self) -> &mut Tensor {
        self.tensor.as_mut().expect("scratch tensor present until drop")
    }
}

impl<K> Debug for ScratchGuard<'_, K>
where
    K: Copy + Eq + Hash + Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchGuard")
            .field("slot", &self.key.0)
            .field("device", &self.key.1)
            .field("dims", &self.tensor.as_ref().map(|t| t.dims()))
            .finish()
    }
}

impl<K> Drop for ScratchGuard<'_, K>
where
    K: Copy + Eq + Hash + Debug,
{
    fn drop(&mut self) {
        if let Some(tensor) = self.tensor.take() {
            self.pool.release(self.key, tensor);
        }
    }
}
