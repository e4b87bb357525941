//! N-dimensional host tensor with mixed dtype support.
//!
//! Provides the [`Tensor`] type that backs every array handle the engine moves
//! around. The engine itself never looks inside the storage; only backend
//! kernels and the predicate check of `Switch` do.

use tracing::debug;

/// Data type of tensor elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TensorDtype {
    F32,
    F16,
    I32,
    Bool,
}

impl TensorDtype {
    /// Size in bytes of one element.
    pub fn element_size(&self) -> usize {
        match self {
            TensorDtype::F32 => 4,
            TensorDtype::F16 => 2,
            TensorDtype::I32 => 4,
            TensorDtype::Bool => 1,
        }
    }

    /// Parse a dtype name as used on the command line and in input files.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "f32" | "float" | "float32" => Some(TensorDtype::F32),
            "f16" | "half" | "float16" => Some(TensorDtype::F16),
            "i32" | "int" | "int32" => Some(TensorDtype::I32),
            "bool" => Some(TensorDtype::Bool),
            _ => None,
        }
    }
}

/// Storage for tensor data, varying by dtype.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorStorage {
    /// 32-bit floating point values.
    F32(Vec<f32>),
    /// 16-bit floating point values stored as raw u16 bits.
    F16(Vec<u16>),
    /// 32-bit signed integers.
    I32(Vec<i32>),
    /// Booleans, one byte each.
    Bool(Vec<bool>),
}

impl TensorStorage {
    fn zeroed(dtype: TensorDtype, n_elements: usize) -> Self {
        match dtype {
            TensorDtype::F32 => TensorStorage::F32(vec![0.0; n_elements]),
            TensorDtype::F16 => TensorStorage::F16(vec![0; n_elements]),
            TensorDtype::I32 => TensorStorage::I32(vec![0; n_elements]),
            TensorDtype::Bool => TensorStorage::Bool(vec![false; n_elements]),
        }
    }

    fn len(&self) -> usize {
        match self {
            TensorStorage::F32(d) => d.len(),
            TensorStorage::F16(d) => d.len(),
            TensorStorage::I32(d) => d.len(),
            TensorStorage::Bool(d) => d.len(),
        }
    }
}

/// N-dimensional tensor with dtype and storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    strides: Vec<usize>,
    dtype: TensorDtype,
    storage: TensorStorage,
}

/// Compute row-major strides from shape.
/// strides[i] = product of shape[i+1..]
fn compute_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0usize; shape.len()];
    if shape.is_empty() {
        return strides;
    }
    strides[shape.len() - 1] = 1;
    for i in (0..shape.len() - 1).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

impl Tensor {
    /// Create an F32 tensor from shape and data.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the product of `shape`.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self::from_storage(shape, TensorStorage::F32(data))
    }

    /// Create a tensor from shape and any storage variant.
    ///
    /// # Panics
    /// Panics if the storage length does not match the product of `shape`.
    pub fn from_storage(shape: Vec<usize>, storage: TensorStorage) -> Self {
        let n_elements: usize = shape.iter().product();
        assert_eq!(
            storage.len(),
            n_elements,
            "Data length {} does not match shape {:?} (expected {})",
            storage.len(),
            shape,
            n_elements
        );
        let dtype = match &storage {
            TensorStorage::F32(_) => TensorDtype::F32,
            TensorStorage::F16(_) => TensorDtype::F16,
            TensorStorage::I32(_) => TensorDtype::I32,
            TensorStorage::Bool(_) => TensorDtype::Bool,
        };
        let strides = compute_strides(&shape);
        debug!(?dtype, ?shape, "Created tensor");
        Self {
            shape,
            strides,
            dtype,
            storage,
        }
    }

    /// Create a zero-filled F32 tensor.
    pub fn zeros(shape: &[usize]) -> Self {
        Self::zeros_of(shape, TensorDtype::F32)
    }

    /// Create a zero-filled tensor of any dtype.
    pub fn zeros_of(shape: &[usize], dtype: TensorDtype) -> Self {
        let n_elements: usize = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            strides: compute_strides(shape),
            dtype,
            storage: TensorStorage::zeroed(dtype, n_elements),
        }
    }

    /// Create an F16 tensor from shape and raw u16 bit data.
    pub fn from_f16(shape: Vec<usize>, data: Vec<u16>) -> Self {
        Self::from_storage(shape, TensorStorage::F16(data))
    }

    /// Create an I32 tensor.
    pub fn from_i32(shape: Vec<usize>, data: Vec<i32>) -> Self {
        Self::from_storage(shape, TensorStorage::I32(data))
    }

    /// Create a Bool tensor.
    pub fn from_bool(shape: Vec<usize>, data: Vec<bool>) -> Self {
        Self::from_storage(shape, TensorStorage::Bool(data))
    }

    /// Single-element F32 tensor of shape `[1]`.
    pub fn scalar(value: f32) -> Self {
        Self::new(vec![1], vec![value])
    }

    /// Single-element Bool tensor of shape `[1]`.
    pub fn scalar_bool(value: bool) -> Self {
        Self::from_bool(vec![1], vec![value])
    }

    /// Returns the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the strides of the tensor.
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Returns the data type of the tensor.
    pub fn dtype(&self) -> TensorDtype {
        self.dtype
    }

    /// Returns the storage of the tensor.
    pub fn storage(&self) -> &TensorStorage {
        &self.storage
    }

    /// Mutable access to the storage. The variant must not be changed.
    pub(crate) fn storage_mut(&mut self) -> &mut TensorStorage {
        &mut self.storage
    }

    /// Returns the total number of elements in the tensor.
    pub fn n_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Returns a reference to the underlying F32 data.
    ///
    /// # Panics
    /// Panics if the tensor is not F32 dtype.
    pub fn as_f32(&self) -> &[f32] {
        match &self.storage {
            TensorStorage::F32(data) => data,
            _ => panic!("Tensor is {:?}, not F32", self.dtype),
        }
    }

    /// Returns a mutable reference to the underlying F32 data.
    ///
    /// # Panics
    /// Panics if the tensor is not F32 dtype.
    pub fn as_f32_mut(&mut self) -> &mut [f32] {
        match &mut self.storage {
            TensorStorage::F32(data) => data,
            _ => panic!("Tensor is {:?}, not F32", self.dtype),
        }
    }

    /// Returns a reference to the underlying I32 data.
    ///
    /// # Panics
    /// Panics if the tensor is not I32 dtype.
    pub fn as_i32(&self) -> &[i32] {
        match &self.storage {
            TensorStorage::I32(data) => data,
            _ => panic!("Tensor is {:?}, not I32", self.dtype),
        }
    }

    /// Returns a reference to the underlying Bool data.
    ///
    /// # Panics
    /// Panics if the tensor is not Bool dtype.
    pub fn as_bool(&self) -> &[bool] {
        match &self.storage {
            TensorStorage::Bool(data) => data,
            _ => panic!("Tensor is {:?}, not Bool", self.dtype),
        }
    }

    /// Returns a mutable reference to the underlying Bool data.
    ///
    /// # Panics
    /// Panics if the tensor is not Bool dtype.
    pub fn as_bool_mut(&mut self) -> &mut [bool] {
        match &mut self.storage {
            TensorStorage::Bool(data) => data,
            _ => panic!("Tensor is {:?}, not Bool", self.dtype),
        }
    }

    /// Read element `i` as f32 regardless of dtype.
    pub fn get_f32(&self, i: usize) -> f32 {
        match &self.storage {
            TensorStorage::F32(d) => d[i],
            TensorStorage::F16(d) => half::f16::from_bits(d[i]).to_f32(),
            TensorStorage::I32(d) => d[i] as f32,
            TensorStorage::Bool(d) => {
                if d[i] {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Convert the tensor to F32.
    ///
    /// - F32 tensors are cloned as-is.
    /// - F16 tensors are converted element-wise using the `half` crate.
    /// - I32 and Bool tensors are widened (`true` becomes 1.0).
    pub fn to_f32(&self) -> Tensor {
        if self.dtype == TensorDtype::F32 {
            return self.clone();
        }
        let data = (0..self.n_elements()).map(|i| self.get_f32(i)).collect();
        Tensor {
            shape: self.shape.clone(),
            strides: self.strides.clone(),
            dtype: TensorDtype::F32,
            storage: TensorStorage::F32(data),
        }
    }

    /// Write `src` converted to this tensor's dtype into this tensor.
    ///
    /// # Panics
    /// Panics if the element counts differ.
    pub(crate) fn assign_converted(&mut self, src: &Tensor) {
        assert_eq!(
            self.n_elements(),
            src.n_elements(),
            "assign_converted: element count mismatch {} vs {}",
            self.n_elements(),
            src.n_elements()
        );
        let n = src.n_elements();
        match &mut self.storage {
            TensorStorage::F32(d) => {
                for (i, v) in d.iter_mut().enumerate().take(n) {
                    *v = src.get_f32(i);
                }
            }
            TensorStorage::F16(d) => {
                for (i, v) in d.iter_mut().enumerate().take(n) {
                    *v = half::f16::from_f32(src.get_f32(i)).to_bits();
                }
            }
            TensorStorage::I32(d) => {
                for (i, v) in d.iter_mut().enumerate().take(n) {
                    *v = src.get_f32(i) as i32;
                }
            }
            TensorStorage::Bool(d) => {
                for (i, v) in d.iter_mut().enumerate().take(n) {
                    *v = src.get_f32(i) != 0.0;
                }
            }
        }
    }

    /// Reshape the tensor to a new shape. The total number of elements must remain the same.
    /// Returns a new tensor with the same data but different shape.
    ///
    /// # Panics
    /// Panics if the new shape has a different number of elements.
    pub fn reshape(&self, new_shape: &[usize]) -> Tensor {
        let mut out = self.clone();
        out.reshape_in_place(new_shape);
        out
    }

    /// Reshape without copying storage.
    ///
    /// # Panics
    /// Panics if the new shape has a different number of elements.
    pub fn reshape_in_place(&mut self, new_shape: &[usize]) {
        let new_n_elements: usize = new_shape.iter().product();
        assert_eq!(
            self.n_elements(),
            new_n_elements,
            "Cannot reshape tensor of {} elements to shape {:?} ({} elements)",
            self.n_elements(),
            new_shape,
            new_n_elements
        );
        self.shape = new_shape.to_vec();
        self.strides = compute_strides(new_shape);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_strides() {
        assert_eq!(compute_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(compute_strides(&[3, 5]), vec![5, 1]);
        assert_eq!(compute_strides(&[10]), vec![1]);
        assert_eq!(compute_strides(&[]), Vec::<usize>::new());
    }

    #[test]
    fn test_new_f32_tensor() {
        let t = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(t.shape(), &[2, 3]);
        assert_eq!(t.dtype(), TensorDtype::F32);
        assert_eq!(t.n_elements(), 6);
        assert_eq!(t.strides(), &[3, 1]);
        assert_eq!(t.as_f32(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    #[should_panic(expected = "Data length")]
    fn test_new_shape_mismatch() {
        Tensor::new(vec![2, 3], vec![1.0, 2.0]); // only 2 elements, need 6
    }

    #[test]
    fn test_zeros_of_each_dtype() {
        for dtype in [TensorDtype::F32, TensorDtype::F16, TensorDtype::I32, TensorDtype::Bool] {
            let t = Tensor::zeros_of(&[3, 4], dtype);
            assert_eq!(t.dtype(), dtype);
            assert_eq!(t.n_elements(), 12);
            assert!((0..12).all(|i| t.get_f32(i) == 0.0));
        }
    }

    #[test]
    fn test_zeros_empty() {
        let t = Tensor::zeros(&[0]);
        assert_eq!(t.n_elements(), 0);
        assert!(t.as_f32().is_empty());
    }

    #[test]
    fn test_f16_to_f32() {
        let vals: Vec<f32> = vec![1.0, -0.5, 3.14, 0.0];
        let bits: Vec<u16> = vals.iter().map(|&v| half::f16::from_f32(v).to_bits()).collect();
        let t = Tensor::from_f16(vec![4], bits);
        let converted = t.to_f32();
        assert_eq!(converted.dtype(), TensorDtype::F32);
        let data = converted.as_f32();
        for (i, &expected) in vals.iter().enumerate() {
            let diff = (data[i] - expected).abs();
            assert!(diff < 0.01, "F16 round-trip failed at index {}: expected {}, got {}", i, expected, data[i]);
        }
    }

    #[test]
    fn test_bool_and_i32_widen_to_f32() {
        let b = Tensor::from_bool(vec![3], vec![true, false, true]);
        assert_eq!(b.to_f32().as_f32(), &[1.0, 0.0, 1.0]);
        let i = Tensor::from_i32(vec![2], vec![-3, 7]);
        assert_eq!(i.to_f32().as_f32(), &[-3.0, 7.0]);
    }

    #[test]
    fn test_assign_converted_to_bool() {
        let src = Tensor::new(vec![3], vec![0.0, 2.5, -1.0]);
        let mut dst = Tensor::zeros_of(&[3], TensorDtype::Bool);
        dst.assign_converted(&src);
        assert_eq!(dst.as_bool(), &[false, true, true]);
    }

    #[test]
    fn test_reshape() {
        let t = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let reshaped = t.reshape(&[3, 2]);
        assert_eq!(reshaped.shape(), &[3, 2]);
        assert_eq!(reshaped.n_elements(), 6);
        assert_eq!(reshaped.as_f32(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(reshaped.strides(), &[2, 1]);
    }

    #[test]
    #[should_panic(expected = "Cannot reshape")]
    fn test_reshape_wrong_count() {
        let t = Tensor::zeros(&[2, 3]);
        t.reshape(&[4, 2]);
    }

    #[test]
    fn test_dtype_from_name() {
        assert_eq!(TensorDtype::from_name("F32"), Some(TensorDtype::F32));
        assert_eq!(TensorDtype::from_name("bool"), Some(TensorDtype::Bool));
        assert_eq!(TensorDtype::from_name("q4"), None);
    }
}
