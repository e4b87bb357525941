//! Array buffer cache sitting between the executor and the device allocator.
//!
//! Released buffers are parked on a bounded free list keyed by
//! (element count, dtype, device) and handed back out by the next `acquire`
//! with a matching key, reshaped in place to the requested shape. Only when a
//! list is full does a release go back to the allocator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::backend::{ComputeBackend, Device, DeviceTensor};
use crate::config::{SessionConfig, DEFAULT_FREE_LIST_DEPTH};
use crate::error::SessionError;
use crate::tensor::TensorDtype;

/// Free-list key. Shapes are normalized to their element count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferKey {
    pub elements: usize,
    pub dtype: TensorDtype,
    pub device: Device,
}

impl BufferKey {
    pub fn new(shape: &[usize], dtype: TensorDtype, device: Device) -> Self {
        Self {
            elements: shape.iter().product(),
            dtype,
            device,
        }
    }

    fn of(tensor: &DeviceTensor) -> Self {
        Self::new(tensor.shape(), tensor.dtype(), tensor.device())
    }
}

/// Snapshot of memory manager counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    /// Buffers obtained from the underlying allocator.
    pub allocations: u64,
    /// `acquire` calls served from a free list.
    pub reuses: u64,
    /// Releases parked on a free list.
    pub cached_releases: u64,
    /// Releases returned to the allocator because the list was full.
    pub freed_releases: u64,
    /// Buffers dropped by `purge`.
    pub purged: u64,
}

type FreeList = Arc<Mutex<Vec<DeviceTensor>>>;

/// Buffer cache with per-key locking.
///
/// Concurrent executions may share one manager: the key map is behind a
/// read-write lock and each free list has its own mutex, so two threads only
/// contend when they touch the same key.
pub struct MemoryManager {
    allocator: Arc<dyn ComputeBackend>,
    free_list_depth: usize,
    free_lists: RwLock<HashMap<BufferKey, FreeList>>,
    allocations: AtomicU64,
    reuses: AtomicU64,
    cached_releases: AtomicU64,
    freed_releases: AtomicU64,
    purged: AtomicU64,
    active_executions: AtomicUsize,
}

static GLOBAL: OnceLock<Arc<MemoryManager>> = OnceLock::new();

impl MemoryManager {
    /// Manager with the default free-list depth.
    pub fn new(allocator: Arc<dyn ComputeBackend>) -> Self {
        Self::with_depth(allocator, DEFAULT_FREE_LIST_DEPTH)
    }

    /// Manager with an explicit free-list depth (zero disables caching).
    pub fn with_depth(allocator: Arc<dyn ComputeBackend>, free_list_depth: usize) -> Self {
        debug!(
            backend = allocator.name(),
            device = ?allocator.device(),
            free_list_depth,
            "Created memory manager"
        );
        Self {
            allocator,
            free_list_depth,
            free_lists: RwLock::new(HashMap::new()),
            allocations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
            cached_releases: AtomicU64::new(0),
            freed_releases: AtomicU64::new(0),
            purged: AtomicU64::new(0),
            active_executions: AtomicUsize::new(0),
        }
    }

    /// Manager configured from a [`SessionConfig`].
    pub fn from_config(allocator: Arc<dyn ComputeBackend>, config: &SessionConfig) -> Self {
        Self::with_depth(allocator, config.free_list_depth)
    }

    /// Process-wide default manager over the CPU backend.
    ///
    /// Only meant for the topmost convenience entry point; everything below it
    /// takes the manager as an explicit argument.
    pub fn global() -> Arc<MemoryManager> {
        Arc::clone(GLOBAL.get_or_init(|| {
            let config = SessionConfig::from_env().unwrap_or_else(|e| {
                warn!(error = %e, "Ignoring invalid environment config for global memory manager");
                SessionConfig::default()
            });
            Arc::new(MemoryManager::from_config(
                crate::backend::select_backend(),
                &config,
            ))
        }))
    }

    /// The allocator this manager draws from.
    pub fn allocator(&self) -> &Arc<dyn ComputeBackend> {
        &self.allocator
    }

    /// Configured per-key free-list depth.
    pub fn free_list_depth(&self) -> usize {
        self.free_list_depth
    }

    fn list_for(&self, key: &BufferKey) -> Option<FreeList> {
        let lists = self.free_lists.read().unwrap_or_else(PoisonError::into_inner);
        lists.get(key).cloned()
    }

    fn list_for_or_insert(&self, key: BufferKey) -> FreeList {
        if let Some(list) = self.list_for(&key) {
            return list;
        }
        let mut lists = self.free_lists.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(lists.entry(key).or_default())
    }

    /// Get a buffer of the given shape, dtype and device.
    ///
    /// Contents of a reused buffer are unspecified; kernels overwrite them.
    pub fn acquire(
        &self,
        shape: &[usize],
        dtype: TensorDtype,
        device: Device,
    ) -> Result<DeviceTensor, SessionError> {
        if device != self.allocator.device() {
            return Err(SessionError::Memory(format!(
                "no allocator for device {:?} (manager allocates on {:?})",
                device,
                self.allocator.device()
            )));
        }

        let key = BufferKey::new(shape, dtype, device);
        if let Some(list) = self.list_for(&key) {
            let cached = list.lock().unwrap_or_else(PoisonError::into_inner).pop();
            if let Some(mut tensor) = cached {
                tensor.reshape(shape);
                self.reuses.fetch_add(1, Ordering::Relaxed);
                trace!(id = tensor.id().0, ?shape, ?dtype, "Reused cached buffer");
                return Ok(tensor);
            }
        }

        let tensor = self.allocator.allocate(shape, dtype)?;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        trace!(id = tensor.id().0, ?shape, ?dtype, "Allocated new buffer");
        Ok(tensor)
    }

    /// Return a buffer. It is cached for reuse unless its free list is full.
    pub fn release(&self, tensor: DeviceTensor) {
        let key = BufferKey::of(&tensor);
        if self.free_list_depth > 0 {
            let list = self.list_for_or_insert(key);
            let mut guard = list.lock().unwrap_or_else(PoisonError::into_inner);
            if guard.len() < self.free_list_depth {
                trace!(id = tensor.id().0, ?key, "Cached released buffer");
                guard.push(tensor);
                self.cached_releases.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        trace!(id = tensor.id().0, ?key, "Free list full, returning buffer to allocator");
        self.freed_releases.fetch_add(1, Ordering::Relaxed);
        self.allocator.free(tensor);
    }

    /// Drop every cached buffer back to the allocator. Returns how many were freed.
    ///
    /// Refuses while any execution using this manager is in flight.
    pub fn purge(&self) -> Result<usize, SessionError> {
        let active = self.active_executions();
        if active > 0 {
            return Err(SessionError::Memory(format!(
                "cannot purge while {} execution(s) are in flight",
                active
            )));
        }

        let mut lists = self.free_lists.write().unwrap_or_else(PoisonError::into_inner);
        let mut freed = 0usize;
        for (_, list) in lists.drain() {
            let mut guard = list.lock().unwrap_or_else(PoisonError::into_inner);
            for tensor in guard.drain(..) {
                self.allocator.free(tensor);
                freed += 1;
            }
        }
        self.purged.fetch_add(freed as u64, Ordering::Relaxed);
        debug!(freed, "Purged memory manager");
        Ok(freed)
    }

    /// Total number of cached buffers across all keys.
    pub fn cached_len(&self) -> usize {
        let lists = self.free_lists.read().unwrap_or_else(PoisonError::into_inner);
        lists
            .values()
            .map(|list| list.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    /// Number of cached buffers for one key.
    pub fn cached_len_for(&self, shape: &[usize], dtype: TensorDtype, device: Device) -> usize {
        self.list_for(&BufferKey::new(shape, dtype, device))
            .map(|list| list.lock().unwrap_or_else(PoisonError::into_inner).len())
            .unwrap_or(0)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
            cached_releases: self.cached_releases.load(Ordering::Relaxed),
            freed_releases: self.freed_releases.load(Ordering::Relaxed),
            purged: self.purged.load(Ordering::Relaxed),
        }
    }

    /// Number of executions currently holding bindings from this manager.
    pub fn active_executions(&self) -> usize {
        self.active_executions.load(Ordering::Acquire)
    }

    /// Mark an execution as in flight until the guard drops.
    pub(crate) fn begin_execution(&self) -> ExecutionGuard<'_> {
        self.active_executions.fetch_add(1, Ordering::AcqRel);
        ExecutionGuard { manager: self }
    }
}

/// Keeps [`MemoryManager::purge`] locked out while an execution runs.
pub(crate) struct ExecutionGuard<'a> {
    manager: &'a MemoryManager,
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        self.manager.active_executions.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::cpu::CpuBackend;
    use crate::tensor::Tensor;

    /// Backend wrapper counting true allocations and frees.
    pub(crate) struct CountingBackend {
        inner: CpuBackend,
        pub(crate) allocs: AtomicUsize,
        pub(crate) frees: AtomicUsize,
    }

    impl CountingBackend {
        pub(crate) fn new() -> Self {
            Self {
                inner: CpuBackend::new(),
                allocs: AtomicUsize::new(0),
                frees: AtomicUsize::new(0),
            }
        }

        pub(crate) fn allocs(&self) -> usize {
            self.allocs.load(Ordering::SeqCst)
        }

        pub(crate) fn frees(&self) -> usize {
            self.frees.load(Ordering::SeqCst)
        }
    }

    impl ComputeBackend for CountingBackend {
        fn name(&self) -> &str {
            "cpu-counting"
        }
        fn device(&self) -> Device {
            self.inner.device()
        }
        fn allocate(&self, shape: &[usize], dtype: TensorDtype) -> Result<DeviceTensor, SessionError> {
            self.allocs.fetch_add(1, Ordering::SeqCst);
            self.inner.allocate(shape, dtype)
        }
        fn free(&self, tensor: DeviceTensor) {
            self.frees.fetch_add(1, Ordering::SeqCst);
            self.inner.free(tensor)
        }
        fn upload(&self, tensor: &Tensor) -> DeviceTensor {
            self.inner.upload(tensor)
        }
        fn download(&self, tensor: &DeviceTensor) -> Tensor {
            self.inner.download(tensor)
        }
        fn copy(&self, src: &DeviceTensor, out: &mut DeviceTensor) {
            self.inner.copy(src, out)
        }
        fn add(&self, a: &DeviceTensor, b: &DeviceTensor, out: &mut DeviceTensor) {
            self.inner.add(a, b, out)
        }
        fn sub(&self, a: &DeviceTensor, b: &DeviceTensor, out: &mut DeviceTensor) {
            self.inner.sub(a, b, out)
        }
        fn mul(&self, a: &DeviceTensor, b: &DeviceTensor, out: &mut DeviceTensor) {
            self.inner.mul(a, b, out)
        }
        fn div(&self, a: &DeviceTensor, b: &DeviceTensor, out: &mut DeviceTensor) {
            self.inner.div(a, b, out)
        }
        fn matmul(&self, a: &DeviceTensor, b: &DeviceTensor, out: &mut DeviceTensor) {
            self.inner.matmul(a, b, out)
        }
        fn neg(&self, t: &DeviceTensor, out: &mut DeviceTensor) {
            self.inner.neg(t, out)
        }
        fn relu(&self, t: &DeviceTensor, out: &mut DeviceTensor) {
            self.inner.relu(t, out)
        }
        fn gelu(&self, t: &DeviceTensor, out: &mut DeviceTensor) {
            self.inner.gelu(t, out)
        }
        fn silu(&self, t: &DeviceTensor, out: &mut DeviceTensor) {
            self.inner.silu(t, out)
        }
        fn tanh(&self, t: &DeviceTensor, out: &mut DeviceTensor) {
            self.inner.tanh(t, out)
        }
        fn softmax(&self, t: &DeviceTensor, out: &mut DeviceTensor) {
            self.inner.softmax(t, out)
        }
        fn scale(&self, t: &DeviceTensor, factor: f32, out: &mut DeviceTensor) {
            self.inner.scale(t, factor, out)
        }
        fn add_scalar(&self, t: &DeviceTensor, value: f32, out: &mut DeviceTensor) {
            self.inner.add_scalar(t, value, out)
        }
        fn less(&self, a: &DeviceTensor, b: &DeviceTensor, out: &mut DeviceTensor) {
            self.inner.less(a, b, out)
        }
        fn greater(&self, a: &DeviceTensor, b: &DeviceTensor, out: &mut DeviceTensor) {
            self.inner.greater(a, b, out)
        }
        fn cast(&self, t: &DeviceTensor, out: &mut DeviceTensor) {
            self.inner.cast(t, out)
        }
        fn sum(&self, t: &DeviceTensor, out: &mut DeviceTensor) {
            self.inner.sum(t, out)
        }
    }

    fn manager(depth: usize) -> (Arc<CountingBackend>, MemoryManager) {
        let backend = Arc::new(CountingBackend::new());
        let mm = MemoryManager::with_depth(backend.clone(), depth);
        (backend, mm)
    }

    #[test]
    fn test_release_then_acquire_reuses_buffer() {
        let (backend, mm) = manager(5);
        let a = mm.acquire(&[2, 2], TensorDtype::F32, Device::Cpu).unwrap();
        let id = a.id();
        mm.release(a);
        let b = mm.acquire(&[2, 2], TensorDtype::F32, Device::Cpu).unwrap();
        assert_eq!(b.id(), id);
        assert_eq!(backend.allocs(), 1);
        assert_eq!(mm.stats().reuses, 1);
    }

    #[test]
    fn test_reuse_reshapes_to_requested_shape() {
        let (backend, mm) = manager(5);
        let a = mm.acquire(&[2, 3], TensorDtype::F32, Device::Cpu).unwrap();
        mm.release(a);
        let b = mm.acquire(&[6], TensorDtype::F32, Device::Cpu).unwrap();
        assert_eq!(b.shape(), &[6]);
        assert_eq!(backend.allocs(), 1);
    }

    #[test]
    fn test_different_dtype_does_not_reuse() {
        let (backend, mm) = manager(5);
        let a = mm.acquire(&[4], TensorDtype::F32, Device::Cpu).unwrap();
        mm.release(a);
        let _b = mm.acquire(&[4], TensorDtype::I32, Device::Cpu).unwrap();
        assert_eq!(backend.allocs(), 2);
        assert_eq!(mm.cached_len_for(&[4], TensorDtype::F32, Device::Cpu), 1);
    }

    #[test]
    fn test_free_list_is_bounded() {
        let (backend, mm) = manager(2);
        let bufs: Vec<_> = (0..4)
            .map(|_| mm.acquire(&[8], TensorDtype::F32, Device::Cpu).unwrap())
            .collect();
        for b in bufs {
            mm.release(b);
        }
        assert_eq!(mm.cached_len(), 2);
        assert_eq!(backend.frees(), 2);
        let stats = mm.stats();
        assert_eq!(stats.cached_releases, 2);
        assert_eq!(stats.freed_releases, 2);
    }

    #[test]
    fn test_zero_depth_never_caches() {
        let (backend, mm) = manager(0);
        let a = mm.acquire(&[1], TensorDtype::F32, Device::Cpu).unwrap();
        mm.release(a);
        assert_eq!(mm.cached_len(), 0);
        assert_eq!(backend.frees(), 1);
    }

    #[test]
    fn test_reuse_up_to_depth() {
        let (backend, mm) = manager(3);
        let bufs: Vec<_> = (0..3)
            .map(|_| mm.acquire(&[5], TensorDtype::F32, Device::Cpu).unwrap())
            .collect();
        for b in bufs {
            mm.release(b);
        }
        let again: Vec<_> = (0..4)
            .map(|_| mm.acquire(&[5], TensorDtype::F32, Device::Cpu).unwrap())
            .collect();
        assert_eq!(again.len(), 4);
        // 3 original + 1 beyond the cached depth
        assert_eq!(backend.allocs(), 4);
        assert_eq!(mm.stats().reuses, 3);
    }

    #[test]
    fn test_purge_frees_cached() {
        let (backend, mm) = manager(5);
        for _ in 0..3 {
            let a = mm.acquire(&[3], TensorDtype::F32, Device::Cpu).unwrap();
            let b = mm.acquire(&[3], TensorDtype::F32, Device::Cpu).unwrap();
            mm.release(a);
            mm.release(b);
        }
        assert_eq!(mm.cached_len(), 2);
        assert_eq!(mm.purge().unwrap(), 2);
        assert_eq!(mm.cached_len(), 0);
        assert_eq!(backend.frees(), 2);
        assert_eq!(mm.stats().purged, 2);
    }

    #[test]
    fn test_purge_refused_while_execution_in_flight() {
        let (_backend, mm) = manager(5);
        let guard = mm.begin_execution();
        assert_eq!(mm.active_executions(), 1);
        assert!(matches!(mm.purge(), Err(SessionError::Memory(_))));
        drop(guard);
        assert_eq!(mm.purge().unwrap(), 0);
    }

    #[test]
    fn test_wrong_device_is_memory_error() {
        let (_backend, mm) = manager(5);
        let err = mm
            .acquire(&[1], TensorDtype::F32, Device::Accelerator(0))
            .unwrap_err();
        assert!(matches!(err, SessionError::Memory(_)));
    }

    #[test]
    fn test_keys_separate_devices() {
        let backend: Arc<dyn ComputeBackend> = Arc::new(CpuBackend::for_device(Device::Accelerator(1)));
        let mm = MemoryManager::new(backend);
        let a = mm.acquire(&[2], TensorDtype::F32, Device::Accelerator(1)).unwrap();
        mm.release(a);
        assert_eq!(mm.cached_len_for(&[2], TensorDtype::F32, Device::Accelerator(1)), 1);
        assert_eq!(mm.cached_len_for(&[2], TensorDtype::F32, Device::Cpu), 0);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let (backend, mm) = manager(4);
        let mm = Arc::new(mm);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let mm = Arc::clone(&mm);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let shape = [t + 1, 2];
                        let buf = mm.acquire(&shape, TensorDtype::F32, Device::Cpu).unwrap();
                        mm.release(buf);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        // each thread owns a distinct key and keeps at most one buffer live
        assert_eq!(backend.allocs(), 4);
        assert_eq!(mm.cached_len(), 4);
    }
}
