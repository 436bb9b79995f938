use std::fmt;

/// Execution context a tensor is placed on: device type plus device id.
///
/// Two tensors may only be combined by a kernel when their devices compare
/// equal. CPU ids distinguish independent host execution contexts (for
/// example one per NUMA node or per serving worker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    /// Host execution context with an id.
    Cpu(usize),
    /// CUDA GPU with device index.
    Cuda(usize),
}

impl Default for Device {
    fn default() -> Self {
        Device::Cpu(0)
    }
}

impl Device {
    /// Whether this is a CPU device.
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu(_))
    }

    /// Whether this is a CUDA device.
    pub fn is_cuda(&self) -> bool {
        matches!(self, Device::Cuda(_))
    }

    /// Device id within its type.
    pub fn id(&self) -> usize {
        match self {
            Device::Cpu(id) | Device::Cuda(id) => *id,
        }
    }

    /// Whether `self` and `other` are the same type and id.
    pub fn same_context(&self, other: &Device) -> bool {
        self == other
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu(idx) => write!(f, "cpu:{idx}"),
            Device::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}
