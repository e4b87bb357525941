//! Compute backend trait and device tensor abstraction.
//!
//! Defines the [`ComputeBackend`] trait: the underlying allocator the memory
//! manager draws from, plus the kernels ordinary graph operations dispatch to.
//! [`DeviceTensor`] is the opaque array handle the engine passes around.

pub mod cpu;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::error::SessionError;
use crate::tensor::{Tensor, TensorDtype};

/// Device an array buffer lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Device {
    Cpu,
    /// Accelerator by ordinal. No backend for this ships with the crate; it
    /// exists so multi-device memory keys can be expressed and tested.
    Accelerator(u16),
}

/// Process-unique identity of one allocated buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

impl BufferId {
    pub(crate) fn fresh() -> Self {
        BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A tensor that lives on a compute device.
///
/// The handle keeps its buffer identity across reshapes, which is what lets
/// the memory manager hand the same allocation back out for a new shape.
#[derive(Debug)]
pub struct DeviceTensor {
    id: BufferId,
    device: Device,
    tensor: Tensor,
}

impl DeviceTensor {
    /// Wrap a host tensor as a fresh device buffer on `device`.
    pub fn new(tensor: Tensor, device: Device) -> Self {
        Self {
            id: BufferId::fresh(),
            device,
            tensor,
        }
    }

    /// Buffer identity.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Device this buffer lives on.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Returns the shape of this tensor.
    pub fn shape(&self) -> &[usize] {
        self.tensor.shape()
    }

    /// Returns the data type of this tensor.
    pub fn dtype(&self) -> TensorDtype {
        self.tensor.dtype()
    }

    /// Total number of elements.
    pub fn n_elements(&self) -> usize {
        self.tensor.n_elements()
    }

    /// Byte size of the underlying buffer.
    pub fn byte_size(&self) -> usize {
        self.n_elements() * self.dtype().element_size()
    }

    /// Reshape this tensor in place (no data copy).
    ///
    /// The new shape must have the same total number of elements.
    pub fn reshape(&mut self, new_shape: &[usize]) {
        self.tensor.reshape_in_place(new_shape);
    }

    /// Read-only view of the backing tensor.
    pub fn as_tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// Mutable view of the backing tensor, for kernels writing outputs.
    pub fn as_tensor_mut(&mut self) -> &mut Tensor {
        &mut self.tensor
    }
}

/// Compute backend trait: allocation plus every kernel ordinary ops need.
///
/// Kernels write into a pre-acquired output buffer. Shapes and dtypes are
/// validated by shape inference before dispatch, so kernels only assert.
pub trait ComputeBackend: Send + Sync {
    /// Short human-readable backend name.
    fn name(&self) -> &str;

    /// Device buffers from this backend live on.
    fn device(&self) -> Device;

    /// Allocate a new zero-filled buffer. This is the "true" allocation the
    /// memory manager tries to avoid.
    fn allocate(&self, shape: &[usize], dtype: TensorDtype) -> Result<DeviceTensor, SessionError>;

    /// Return a buffer to the device allocator.
    fn free(&self, tensor: DeviceTensor);

    /// Upload a host tensor to the device.
    fn upload(&self, tensor: &Tensor) -> DeviceTensor;

    /// Download a device tensor back to the host.
    fn download(&self, tensor: &DeviceTensor) -> Tensor;

    /// Copy `src` into `out` (same element count and dtype).
    fn copy(&self, src: &DeviceTensor, out: &mut DeviceTensor);

    /// Element-wise a + b. Either side may be a single element.
    fn add(&self, a: &DeviceTensor, b: &DeviceTensor, out: &mut DeviceTensor);

    /// Element-wise a - b.
    fn sub(&self, a: &DeviceTensor, b: &DeviceTensor, out: &mut DeviceTensor);

    /// Element-wise a * b.
    fn mul(&self, a: &DeviceTensor, b: &DeviceTensor, out: &mut DeviceTensor);

    /// Element-wise a / b.
    fn div(&self, a: &DeviceTensor, b: &DeviceTensor, out: &mut DeviceTensor);

    /// Matrix multiplication: [M, K] x [K, N] -> [M, N]
    fn matmul(&self, a: &DeviceTensor, b: &DeviceTensor, out: &mut DeviceTensor);

    /// Element-wise negation.
    fn neg(&self, t: &DeviceTensor, out: &mut DeviceTensor);

    /// ReLU activation.
    fn relu(&self, t: &DeviceTensor, out: &mut DeviceTensor);

    /// GELU activation (exact erf form).
    fn gelu(&self, t: &DeviceTensor, out: &mut DeviceTensor);

    /// SiLU activation: x * sigmoid(x)
    fn silu(&self, t: &DeviceTensor, out: &mut DeviceTensor);

    /// Tanh activation (element-wise).
    fn tanh(&self, t: &DeviceTensor, out: &mut DeviceTensor);

    /// Softmax over last dimension (per row for 2D).
    fn softmax(&self, t: &DeviceTensor, out: &mut DeviceTensor);

    /// Scale every element of the tensor by a scalar factor.
    fn scale(&self, t: &DeviceTensor, factor: f32, out: &mut DeviceTensor);

    /// Add a scalar to every element.
    fn add_scalar(&self, t: &DeviceTensor, value: f32, out: &mut DeviceTensor);

    /// Element-wise a < b into a Bool buffer.
    fn less(&self, a: &DeviceTensor, b: &DeviceTensor, out: &mut DeviceTensor);

    /// Element-wise a > b into a Bool buffer.
    fn greater(&self, a: &DeviceTensor, b: &DeviceTensor, out: &mut DeviceTensor);

    /// Convert `t` to the dtype of `out`.
    fn cast(&self, t: &DeviceTensor, out: &mut DeviceTensor);

    /// Sum of all elements into a `[1]` buffer.
    fn sum(&self, t: &DeviceTensor, out: &mut DeviceTensor);
}

/// Auto-detect and return the best available compute backend.
///
/// Only the CPU backend ships with this crate.
pub fn select_backend() -> Arc<dyn ComputeBackend> {
    info!("Selected CPU backend");
    Arc::new(cpu::CpuBackend::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_tensor_reshape_keeps_identity() {
        let mut dt = DeviceTensor::new(Tensor::zeros(&[2, 3]), Device::Cpu);
        let id = dt.id();
        dt.reshape(&[3, 2]);
        assert_eq!(dt.shape(), &[3, 2]);
        assert_eq!(dt.id(), id);
    }

    #[test]
    fn test_buffer_ids_are_unique() {
        let a = DeviceTensor::new(Tensor::zeros(&[1]), Device::Cpu);
        let b = DeviceTensor::new(Tensor::zeros(&[1]), Device::Cpu);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_byte_size() {
        let dt = DeviceTensor::new(Tensor::zeros_of(&[4, 2], TensorDtype::F16), Device::Cpu);
        assert_eq!(dt.byte_size(), 16);
    }

    #[test]
    fn test_select_backend_is_cpu() {
        let backend = select_backend();
        assert_eq!(backend.device(), Device::Cpu);
        assert_eq!(backend.name(), "cpu");
    }
}
