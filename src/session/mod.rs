//! Session: executes a graph for requested outputs against supplied inputs.
//!
//! ```no_run
//! use std::collections::HashMap;
//! use strata_session::graph::{GraphBuilder, Kernel, OperationSpec};
//! use strata_session::session::Session;
//! use strata_session::tensor::Tensor;
//!
//! let mut b = GraphBuilder::new("add");
//! b.placeholder("x")?;
//! b.placeholder("y")?;
//! b.computed("out")?;
//! b.add_operation(OperationSpec::kernel("add", Kernel::Add).inputs(["x", "y"]).outputs(["out"]))?;
//! let session = Session::new(b.build()?);
//!
//! let mut inputs = HashMap::new();
//! inputs.insert("x".to_string(), Tensor::new(vec![2], vec![1.0, 2.0]));
//! inputs.insert("y".to_string(), Tensor::new(vec![2], vec![1.0, 1.0]));
//! let result = session.execute(&["out"], &inputs)?;
//! assert_eq!(result.array("out").unwrap().as_f32(), &[2.0, 3.0]);
//! # Ok::<(), strata_session::error::SessionError>(())
//! ```

mod binding;
pub(crate) mod exec;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::debug;

use crate::backend::{select_backend, BufferId, ComputeBackend};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::frame::FrameId;
use crate::graph::{Graph, VariableId, VariableKind};
use crate::invoke::{FunctionLibrary, RecursionContext};
use crate::memory::MemoryManager;
use crate::tensor::Tensor;

pub use binding::Value;
pub(crate) use binding::release_value;

use exec::{ExecEnv, Executor};

/// Cooperative cancellation flag, checked before every operation dispatch.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A requested output as returned to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputValue {
    Array(Tensor),
    List(Vec<Tensor>),
    /// Never produced, e.g. it lives on an untaken branch.
    Empty,
}

impl OutputValue {
    pub fn as_array(&self) -> Option<&Tensor> {
        match self {
            OutputValue::Array(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Tensor]> {
        match self {
            OutputValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, OutputValue::Empty)
    }
}

/// One executed operation. Operations run inside an invoked function are
/// named `function/op`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutedOp {
    pub name: String,
    pub frame: FrameId,
    pub iteration: u64,
}

/// Counters for one execution, invocations included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub ops_executed: usize,
    pub ops_pruned: usize,
    pub buffers_acquired: usize,
    pub peak_live_bindings: usize,
    pub iterations: u64,
    pub frames: usize,
    pub invocations: usize,
}

impl SessionStats {
    pub(crate) fn absorb(&mut self, child: &SessionStats) {
        self.ops_executed += child.ops_executed;
        self.ops_pruned += child.ops_pruned;
        self.buffers_acquired += child.buffers_acquired;
        self.peak_live_bindings = self.peak_live_bindings.max(child.peak_live_bindings);
        self.iterations += child.iterations;
        self.frames += child.frames;
        self.invocations += child.invocations + 1;
    }
}

/// Outputs of one `execute` call, owned by the caller.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    outputs: Vec<(String, OutputValue)>,
    trace: Vec<ExecutedOp>,
    stats: SessionStats,
}

impl ExecutionResult {
    /// Requested outputs in request order.
    pub fn outputs(&self) -> &[(String, OutputValue)] {
        &self.outputs
    }

    pub fn get(&self, name: &str) -> Option<&OutputValue> {
        self.outputs.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// The named output if it is an array.
    pub fn array(&self, name: &str) -> Option<&Tensor> {
        self.get(name).and_then(OutputValue::as_array)
    }

    pub fn trace(&self) -> &[ExecutedOp] {
        &self.trace
    }

    /// Whether an operation with this name ran, in any frame.
    pub fn executed(&self, op: &str) -> bool {
        self.trace.iter().any(|e| e.name == op)
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn into_outputs(self) -> Vec<(String, OutputValue)> {
        self.outputs
    }
}

/// Constants uploaded once and reused by every execution of a graph.
#[derive(Debug, Default)]
pub(crate) struct ConstantCache {
    values: Mutex<HashMap<VariableId, Value>>,
}

impl ConstantCache {
    pub fn resolve(
        &self,
        graph: &Graph,
        backend: &dyn ComputeBackend,
        ids: &[VariableId],
    ) -> HashMap<VariableId, Value> {
        let mut cache = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        ids.iter()
            .filter_map(|&id| {
                if let Some(value) = cache.get(&id) {
                    return Some((id, value.clone()));
                }
                let VariableKind::Constant(tensor) = graph.variable(id).kind() else {
                    return None;
                };
                let value = Value::array(backend.upload(tensor));
                cache.insert(id, value.clone());
                Some((id, value))
            })
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.values.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// A graph bound to a backend, a memory manager and a function library.
///
/// `execute` takes `&self`, so one session can serve concurrent callers.
pub struct Session {
    graph: Arc<Graph>,
    backend: Arc<dyn ComputeBackend>,
    memory: Arc<MemoryManager>,
    library: Arc<FunctionLibrary>,
    config: SessionConfig,
    constants: ConstantCache,
}

impl Session {
    /// Session on the default backend and the process-wide memory manager.
    pub fn new(graph: impl Into<Arc<Graph>>) -> Self {
        Self {
            graph: graph.into(),
            backend: select_backend(),
            memory: MemoryManager::global(),
            library: Arc::new(FunctionLibrary::new()),
            config: SessionConfig::default(),
            constants: ConstantCache::default(),
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn ComputeBackend>) -> Self {
        self.backend = backend;
        self.constants = ConstantCache::default();
        self
    }

    pub fn with_memory(mut self, memory: Arc<MemoryManager>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_library(mut self, library: impl Into<Arc<FunctionLibrary>>) -> Self {
        self.library = library.into();
        self
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn backend(&self) -> &Arc<dyn ComputeBackend> {
        &self.backend
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Compute `outputs` from `inputs` using the session's memory manager.
    pub fn execute<S: AsRef<str>>(
        &self,
        outputs: &[S],
        inputs: &HashMap<String, Tensor>,
    ) -> Result<ExecutionResult, SessionError> {
        self.execute_with(outputs, inputs, &self.memory, &RecursionContext::new())
    }

    /// Compute `outputs` from `inputs` with an explicit memory manager and
    /// recursion context (which also carries the cancellation token).
    pub fn execute_with<S: AsRef<str>>(
        &self,
        outputs: &[S],
        inputs: &HashMap<String, Tensor>,
        memory: &MemoryManager,
        recursion: &RecursionContext,
    ) -> Result<ExecutionResult, SessionError> {
        let graph = &*self.graph;
        let requested = outputs
            .iter()
            .map(|name| {
                let name = name.as_ref();
                graph.variable_id(name).ok_or_else(|| {
                    SessionError::integrity(format!(
                        "requested output '{}' is not a variable of graph '{}'",
                        name,
                        graph.name()
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut names: Vec<&String> = inputs.keys().collect();
        names.sort();
        let mut supplied = HashMap::with_capacity(inputs.len());
        for name in names {
            let id = graph.variable_id(name).ok_or_else(|| {
                SessionError::integrity(format!(
                    "input '{}' is not a variable of graph '{}'",
                    name,
                    graph.name()
                ))
            })?;
            if !matches!(graph.variable(id).kind(), VariableKind::Placeholder { .. }) {
                return Err(SessionError::integrity(format!(
                    "input '{}' is not a placeholder",
                    name
                )));
            }
            supplied.insert(id, Value::array(self.backend.upload(&inputs[name])));
        }

        debug!(
            graph = %graph.name(),
            outputs = requested.len(),
            inputs = supplied.len(),
            "Executing"
        );

        let env = ExecEnv {
            backend: &*self.backend,
            memory,
            library: &self.library,
            config: &self.config,
            recursion,
        };
        let uploaded: HashSet<BufferId> = supplied
            .values()
            .filter_map(Value::as_array)
            .map(|t| t.id())
            .collect();
        let run = Executor::new(graph, env, &self.constants).run(&requested, supplied)?;

        let mut results = Vec::with_capacity(run.values.len());
        for (name, value) in outputs.iter().zip(run.values) {
            let output = match &value {
                Some(Value::Array(t)) => OutputValue::Array(self.backend.download(t)),
                Some(Value::List(items)) => {
                    OutputValue::List(items.iter().map(|t| self.backend.download(t)).collect())
                }
                None => OutputValue::Empty,
            };
            if let Some(value) = value {
                release_output(memory, value, &uploaded);
            }
            results.push((name.as_ref().to_string(), output));
        }

        Ok(ExecutionResult {
            outputs: results,
            trace: run.trace,
            stats: run.stats,
        })
    }
}

/// Return computed output buffers to `memory`. Uploaded inputs are dropped.
fn release_output(memory: &MemoryManager, value: Value, uploaded: &HashSet<BufferId>) {
    let handles = match value {
        Value::Array(t) => vec![t],
        Value::List(items) => items,
    };
    for handle in handles {
        if !uploaded.contains(&handle.id()) {
            release_value(memory, Value::Array(handle));
        }
    }
}
