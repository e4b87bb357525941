//! Runtime values and the reference-counted binding map.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::backend::DeviceTensor;
use crate::frame::Scope;
use crate::graph::VariableId;
use crate::memory::MemoryManager;

/// A live value flowing between operations.
///
/// Arrays are shared handles: forwarding operations alias them instead of
/// copying, and the buffer goes back to the memory manager when the last
/// holder lets go.
#[derive(Debug, Clone)]
pub enum Value {
    Array(Arc<DeviceTensor>),
    List(Vec<Arc<DeviceTensor>>),
}

impl Value {
    pub fn array(tensor: DeviceTensor) -> Self {
        Value::Array(Arc::new(tensor))
    }

    pub fn as_array(&self) -> Option<&DeviceTensor> {
        match self {
            Value::Array(t) => Some(t),
            Value::List(_) => None,
        }
    }

    /// Identity of every underlying buffer handle, in order.
    pub(crate) fn handle_ptrs(&self) -> Vec<usize> {
        match self {
            Value::Array(t) => vec![Arc::as_ptr(t) as usize],
            Value::List(items) => items.iter().map(|t| Arc::as_ptr(t) as usize).collect(),
        }
    }
}

/// Give up one hold on `value`. Buffers with no other holder are returned
/// to `memory`.
pub(crate) fn release_value(memory: &MemoryManager, value: Value) {
    let handles = match value {
        Value::Array(t) => vec![t],
        Value::List(items) => items,
    };
    for handle in handles {
        if let Ok(tensor) = Arc::try_unwrap(handle) {
            memory.release(tensor);
        }
    }
}

/// Address of one live value: variable plus frame and iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BindingKey {
    pub var: VariableId,
    pub scope: Scope,
}

impl BindingKey {
    pub fn new(var: VariableId, scope: Scope) -> Self {
        Self { var, scope }
    }
}

#[derive(Debug)]
struct Binding {
    value: Value,
    /// Consumers that have not read the value yet.
    refs: usize,
    /// Requested outputs and loop invariants are released explicitly.
    pinned: bool,
}

/// All live bindings of one execution.
#[derive(Debug, Default)]
pub(crate) struct BindingTable {
    bindings: HashMap<BindingKey, Binding>,
    peak: usize,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a produced value. Returns it back if nothing will ever read it.
    pub fn insert(&mut self, key: BindingKey, value: Value, refs: usize, pinned: bool) -> Option<Value> {
        if refs == 0 && !pinned {
            return Some(value);
        }
        trace!(var = key.var.0, frame = key.scope.frame.0, iteration = key.scope.iteration, refs, pinned, "Bound value");
        if let Some(old) = self.bindings.insert(key, Binding { value, refs, pinned }) {
            // a key is only ever produced once per scope
            return Some(old.value);
        }
        self.peak = self.peak.max(self.bindings.len());
        None
    }

    pub fn get(&self, key: &BindingKey) -> Option<&Value> {
        self.bindings.get(key).map(|b| &b.value)
    }

    pub fn contains(&self, key: &BindingKey) -> bool {
        self.bindings.contains_key(key)
    }

    /// A consumer finished reading `key`. Returns the value once the last
    /// consumer is done and the binding is not pinned.
    pub fn consume(&mut self, key: &BindingKey) -> Option<Value> {
        let binding = self.bindings.get_mut(key)?;
        binding.refs = binding.refs.saturating_sub(1);
        if binding.refs == 0 && !binding.pinned {
            return self.bindings.remove(key).map(|b| b.value);
        }
        None
    }

    /// Remove a binding regardless of its count.
    pub fn take(&mut self, key: &BindingKey) -> Option<Value> {
        self.bindings.remove(key).map(|b| b.value)
    }

    /// Remove everything still bound.
    pub fn drain(&mut self) -> Vec<Value> {
        self.bindings.drain().map(|(_, b)| b.value).collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Most bindings live at once.
    pub fn peak(&self) -> usize {
        self.peak
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Device;
    use crate::frame::FrameId;
    use crate::memory::tests::CountingBackend;
    use crate::tensor::Tensor;

    fn value() -> Value {
        Value::array(DeviceTensor::new(Tensor::zeros(&[2]), Device::Cpu))
    }

    fn key(var: usize, iteration: u64) -> BindingKey {
        BindingKey::new(VariableId(var), Scope::new(FrameId(1), iteration))
    }

    #[test]
    fn test_consume_releases_at_zero() {
        let mut table = BindingTable::new();
        assert!(table.insert(key(0, 0), value(), 2, false).is_none());
        assert!(table.consume(&key(0, 0)).is_none());
        assert!(table.consume(&key(0, 0)).is_some());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_pinned_survives_consumers() {
        let mut table = BindingTable::new();
        table.insert(key(0, 0), value(), 1, true);
        assert!(table.consume(&key(0, 0)).is_none());
        assert!(table.contains(&key(0, 0)));
        assert!(table.take(&key(0, 0)).is_some());
    }

    #[test]
    fn test_unread_value_is_returned() {
        let mut table = BindingTable::new();
        assert!(table.insert(key(0, 0), value(), 0, false).is_some());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_same_variable_different_iterations() {
        let mut table = BindingTable::new();
        table.insert(key(0, 0), value(), 1, false);
        table.insert(key(0, 1), value(), 1, false);
        assert_eq!(table.len(), 2);
        assert_eq!(table.peak(), 2);
        table.consume(&key(0, 0));
        assert!(!table.contains(&key(0, 0)));
        assert!(table.contains(&key(0, 1)));
    }

    #[test]
    fn test_release_value_waits_for_last_holder() {
        let backend = Arc::new(CountingBackend::new());
        let memory = MemoryManager::new(backend);
        let v = value();
        let alias = v.clone();
        release_value(&memory, v);
        assert_eq!(memory.cached_len(), 0);
        release_value(&memory, alias);
        assert_eq!(memory.cached_len(), 1);
    }

    #[test]
    fn test_list_handles() {
        let a = Arc::new(DeviceTensor::new(Tensor::zeros(&[1]), Device::Cpu));
        let list = Value::List(vec![Arc::clone(&a), Arc::clone(&a)]);
        let ptrs = list.handle_ptrs();
        assert_eq!(ptrs.len(), 2);
        assert_eq!(ptrs[0], ptrs[1]);
        assert!(list.as_array().is_none());
    }
}
