//! CPU compute backend implementation.
//!
//! Implements all [`ComputeBackend`] operations using pure Rust on the CPU.
//! No unsafe code. No external C dependencies.

use tracing::{debug, trace};

use crate::error::SessionError;
use crate::tensor::{Tensor, TensorDtype};

use super::{ComputeBackend, Device, DeviceTensor};

/// CPU compute backend. All operations run on the host CPU.
pub struct CpuBackend {
    device: Device,
}

impl CpuBackend {
    /// Create a new CPU backend.
    pub fn new() -> Self {
        debug!("Initialized CpuBackend");
        Self {
            device: Device::Cpu,
        }
    }

    /// CPU backend that labels its buffers with another device. Lets
    /// multi-device memory keys be exercised without real hardware.
    pub fn for_device(device: Device) -> Self {
        debug!(?device, "Initialized CpuBackend for device");
        Self { device }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply `f` element-wise with single-element broadcast on either side.
fn broadcast_binary(
    name: &str,
    a: &DeviceTensor,
    b: &DeviceTensor,
    out: &mut DeviceTensor,
    f: impl Fn(f32, f32) -> f32,
) {
    let a_data = a.as_tensor().as_f32();
    let b_data = b.as_tensor().as_f32();
    let n = out.n_elements();
    assert!(
        (a_data.len() == n || a_data.len() == 1) && (b_data.len() == n || b_data.len() == 1),
        "{}: incompatible shapes {:?} and {:?} for output {:?}",
        name,
        a.shape(),
        b.shape(),
        out.shape()
    );

    trace!(shape = ?out.shape(), "CPU {}", name);

    let result = out.as_tensor_mut().as_f32_mut();
    for (i, r) in result.iter_mut().enumerate() {
        let x = if a_data.len() == 1 { a_data[0] } else { a_data[i] };
        let y = if b_data.len() == 1 { b_data[0] } else { b_data[i] };
        *r = f(x, y);
    }
}

/// Element-wise comparison into a Bool buffer, same broadcast rule.
fn broadcast_compare(
    name: &str,
    a: &DeviceTensor,
    b: &DeviceTensor,
    out: &mut DeviceTensor,
    f: impl Fn(f32, f32) -> bool,
) {
    let a_t = a.as_tensor();
    let b_t = b.as_tensor();
    let n = out.n_elements();
    assert!(
        (a_t.n_elements() == n || a_t.n_elements() == 1)
            && (b_t.n_elements() == n || b_t.n_elements() == 1),
        "{}: incompatible shapes {:?} and {:?}",
        name,
        a.shape(),
        b.shape()
    );

    trace!(shape = ?out.shape(), "CPU {}", name);

    let a_len = a_t.n_elements();
    let b_len = b_t.n_elements();
    let result = out.as_tensor_mut().as_bool_mut();
    for (i, r) in result.iter_mut().enumerate() {
        let x = a_t.get_f32(if a_len == 1 { 0 } else { i });
        let y = b_t.get_f32(if b_len == 1 { 0 } else { i });
        *r = f(x, y);
    }
}

/// Apply `f` element-wise from `t` into `out`.
fn map_unary(name: &str, t: &DeviceTensor, out: &mut DeviceTensor, f: impl Fn(f32) -> f32) {
    let data = t.as_tensor().as_f32();
    trace!(n_elements = data.len(), "CPU {}", name);
    let result = out.as_tensor_mut().as_f32_mut();
    assert_eq!(
        data.len(),
        result.len(),
        "{}: output has {} elements, input has {}",
        name,
        result.len(),
        data.len()
    );
    for (r, &x) in result.iter_mut().zip(data.iter()) {
        *r = f(x);
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn device(&self) -> Device {
        self.device
    }

    fn allocate(&self, shape: &[usize], dtype: TensorDtype) -> Result<DeviceTensor, SessionError> {
        trace!(?shape, ?dtype, "CPU allocate");
        Ok(DeviceTensor::new(Tensor::zeros_of(shape, dtype), self.device))
    }

    fn free(&self, tensor: DeviceTensor) {
        trace!(id = tensor.id().0, shape = ?tensor.shape(), "CPU free");
        drop(tensor);
    }

    fn upload(&self, tensor: &Tensor) -> DeviceTensor {
        trace!(shape = ?tensor.shape(), dtype = ?tensor.dtype(), "CPU upload (clone)");
        DeviceTensor::new(tensor.clone(), self.device)
    }

    fn download(&self, tensor: &DeviceTensor) -> Tensor {
        trace!(shape = ?tensor.shape(), dtype = ?tensor.dtype(), "CPU download (clone)");
        tensor.as_tensor().clone()
    }

    fn copy(&self, src: &DeviceTensor, out: &mut DeviceTensor) {
        assert_eq!(
            src.dtype(),
            out.dtype(),
            "copy: dtype mismatch {:?} vs {:?}",
            src.dtype(),
            out.dtype()
        );
        let shape = out.shape().to_vec();
        let mut data = src.as_tensor().clone();
        data.reshape_in_place(&shape);
        *out.as_tensor_mut().storage_mut() = data.storage().clone();
    }

    fn add(&self, a: &DeviceTensor, b: &DeviceTensor, out: &mut DeviceTensor) {
        broadcast_binary("add", a, b, out, |x, y| x + y);
    }

    fn sub(&self, a: &DeviceTensor, b: &DeviceTensor, out: &mut DeviceTensor) {
        broadcast_binary("sub", a, b, out, |x, y| x - y);
    }

    fn mul(&self, a: &DeviceTensor, b: &DeviceTensor, out: &mut DeviceTensor) {
        broadcast_binary("mul", a, b, out, |x, y| x * y);
    }

    fn div(&self, a: &DeviceTensor, b: &DeviceTensor, out: &mut DeviceTensor) {
        broadcast_binary("div", a, b, out, |x, y| x / y);
    }

    fn matmul(&self, a: &DeviceTensor, b: &DeviceTensor, out: &mut DeviceTensor) {
        // [M, K] x [K, N] -> [M, N]
        let a_data = a.as_tensor().as_f32();
        let b_data = b.as_tensor().as_f32();
        let a_shape = a.shape();
        let b_shape = b.shape();

        assert_eq!(a_shape.len(), 2, "matmul: a must be 2D, got shape {:?}", a_shape);
        assert_eq!(b_shape.len(), 2, "matmul: b must be 2D, got shape {:?}", b_shape);

        let m = a_shape[0];
        let k = a_shape[1];
        let n = b_shape[1];

        assert_eq!(
            k, b_shape[0],
            "matmul: inner dimensions must match: a is [{}, {}], b is [{}, {}]",
            m, k, b_shape[0], n
        );

        trace!(m, k, n, "CPU matmul");

        let result = out.as_tensor_mut().as_f32_mut();
        assert_eq!(result.len(), m * n, "matmul: output must hold {} elements", m * n);
        for i in 0..m {
            for j in 0..n {
                let mut sum = 0.0f32;
                for p in 0..k {
                    sum += a_data[i * k + p] * b_data[p * n + j];
                }
                result[i * n + j] = sum;
            }
        }
    }

    fn neg(&self, t: &DeviceTensor, out: &mut DeviceTensor) {
        map_unary("neg", t, out, |x| -x);
    }

    fn relu(&self, t: &DeviceTensor, out: &mut DeviceTensor) {
        map_unary("relu", t, out, |x| x.max(0.0));
    }

    fn gelu(&self, t: &DeviceTensor, out: &mut DeviceTensor) {
        // Exact GELU: 0.5 * x * (1.0 + erf(x / sqrt(2)))
        let sqrt_2_inv: f32 = std::f32::consts::FRAC_1_SQRT_2;
        map_unary("gelu", t, out, |x| 0.5 * x * (1.0 + libm::erff(x * sqrt_2_inv)));
    }

    fn silu(&self, t: &DeviceTensor, out: &mut DeviceTensor) {
        // SiLU: x * sigmoid(x) = x / (1 + exp(-x))
        map_unary("silu", t, out, |x| x * (1.0 / (1.0 + (-x).exp())));
    }

    fn tanh(&self, t: &DeviceTensor, out: &mut DeviceTensor) {
        map_unary("tanh", t, out, |x| x.tanh());
    }

    fn softmax(&self, t: &DeviceTensor, out: &mut DeviceTensor) {
        // Per-row softmax (last dimension)
        let data = t.as_tensor().as_f32();
        let shape = t.shape();

        let ndim = shape.len();
        assert!(ndim >= 1, "softmax: tensor must be at least 1D");

        let last_dim = shape[ndim - 1];
        let n_rows: usize = shape[..ndim - 1].iter().product::<usize>().max(1);

        trace!(n_rows, last_dim, "CPU softmax");

        let result = out.as_tensor_mut().as_f32_mut();

        for row in 0..n_rows {
            let start = row * last_dim;
            let end = start + last_dim;
            let row_data = &data[start..end];

            // Numerical stability: subtract max
            let max_val = row_data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);

            let mut sum = 0.0f32;
            for i in 0..last_dim {
                let exp_val = (row_data[i] - max_val).exp();
                result[start + i] = exp_val;
                sum += exp_val;
            }

            if sum > 0.0 {
                for i in 0..last_dim {
                    result[start + i] /= sum;
                }
            }
        }
    }

    fn scale(&self, t: &DeviceTensor, factor: f32, out: &mut DeviceTensor) {
        map_unary("scale", t, out, |x| x * factor);
    }

    fn add_scalar(&self, t: &DeviceTensor, value: f32, out: &mut DeviceTensor) {
        map_unary("add_scalar", t, out, |x| x + value);
    }

    fn less(&self, a: &DeviceTensor, b: &DeviceTensor, out: &mut DeviceTensor) {
        broadcast_compare("less", a, b, out, |x, y| x < y);
    }

    fn greater(&self, a: &DeviceTensor, b: &DeviceTensor, out: &mut DeviceTensor) {
        broadcast_compare("greater", a, b, out, |x, y| x > y);
    }

    fn cast(&self, t: &DeviceTensor, out: &mut DeviceTensor) {
        trace!(from = ?t.dtype(), to = ?out.dtype(), "CPU cast");
        out.as_tensor_mut().assign_converted(t.as_tensor());
    }

    fn sum(&self, t: &DeviceTensor, out: &mut DeviceTensor) {
        let data = t.as_tensor().as_f32();
        trace!(n_elements = data.len(), "CPU sum");
        let total: f32 = data.iter().sum();
        out.as_tensor_mut().as_f32_mut()[0] = total;
    }
}
