//! Sub-graph invocation: function library and recursion tracking.
//!
//! An `Invoke` operation runs a named graph from the [`FunctionLibrary`] as an
//! independent execution sharing the caller's backend and memory manager.
//! Inputs map onto the function's placeholders and its declared outputs map
//! back onto the operation's outputs, both by position.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::SessionError;
use crate::graph::Graph;
use crate::session::exec::{ExecEnv, Executor, RunOutput};
use crate::session::{CancellationToken, ConstantCache, Value};

/// A graph registered for invocation.
#[derive(Debug)]
pub struct Function {
    graph: Arc<Graph>,
    constants: ConstantCache,
}

impl Function {
    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }
}

/// Named graphs available to `Invoke` operations.
#[derive(Debug, Default)]
pub struct FunctionLibrary {
    functions: HashMap<String, Function>,
}

impl FunctionLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `graph` under `name`. Names are unique.
    pub fn register(&mut self, name: impl Into<String>, graph: impl Into<Arc<Graph>>) -> Result<(), SessionError> {
        let name = name.into();
        if self.functions.contains_key(&name) {
            return Err(SessionError::integrity(format!(
                "function '{}' registered twice",
                name
            )));
        }
        let graph = graph.into();
        debug!(
            function = %name,
            inputs = graph.placeholders().len(),
            outputs = graph.declared_outputs().len(),
            "Registered function"
        );
        self.functions.insert(
            name,
            Function {
                graph,
                constants: ConstantCache::default(),
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[derive(Debug)]
struct ActiveCall {
    function: String,
    inputs: Vec<usize>,
    depth: usize,
    parent: Option<Arc<ActiveCall>>,
}

/// The chain of invocations leading to the current execution.
///
/// Top-level callers start from [`RecursionContext::new`]; each `Invoke`
/// pushes a link. The context also carries the cancellation token so a
/// cancel reaches nested invocations.
#[derive(Debug, Clone, Default)]
pub struct RecursionContext {
    top: Option<Arc<ActiveCall>>,
    depth: usize,
    cancellation: Option<CancellationToken>,
}

impl RecursionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Number of invocations above the current execution.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Functions on the stack, innermost first.
    pub fn stack(&self) -> Vec<&str> {
        let mut names = Vec::with_capacity(self.depth);
        let mut cur = self.top.as_deref();
        while let Some(call) = cur {
            names.push(call.function.as_str());
            cur = call.parent.as_deref();
        }
        names
    }

    /// Push an invocation of `function`. Fails if the same function is
    /// already running on identical input handles (no progress is possible)
    /// or if `max_depth` would be exceeded.
    pub(crate) fn enter(
        &self,
        function: &str,
        inputs: &[Value],
        max_depth: Option<usize>,
    ) -> Result<RecursionContext, SessionError> {
        let handles: Vec<usize> = inputs.iter().flat_map(Value::handle_ptrs).collect();

        let mut cur = self.top.as_deref();
        while let Some(call) = cur {
            if call.function == function && call.inputs == handles {
                return Err(SessionError::Recursion(format!(
                    "function '{}' invoked again with the same inputs as at depth {}",
                    function, call.depth
                )));
            }
            cur = call.parent.as_deref();
        }

        let depth = self.depth + 1;
        if let Some(max) = max_depth {
            if depth > max {
                return Err(SessionError::Recursion(format!(
                    "invoking '{}' would reach depth {} (limit {})",
                    function, depth, max
                )));
            }
        }

        Ok(RecursionContext {
            top: Some(Arc::new(ActiveCall {
                function: function.to_string(),
                inputs: handles,
                depth,
                parent: self.top.clone(),
            })),
            depth,
            cancellation: self.cancellation.clone(),
        })
    }
}

/// Run `function` for the `Invoke` operation `op`.
pub(crate) fn invoke(
    env: ExecEnv<'_>,
    function: &str,
    op: &str,
    n_outputs: usize,
    inputs: Vec<Value>,
) -> Result<RunOutput, SessionError> {
    let entry = env.library.get(function).ok_or_else(|| {
        SessionError::integrity(format!(
            "operation '{}' invokes unknown function '{}'",
            op, function
        ))
    })?;
    let graph = &*entry.graph;

    let placeholders = graph.placeholders();
    if placeholders.len() != inputs.len() {
        return Err(SessionError::integrity(format!(
            "operation '{}' passes {} input(s) to '{}', which takes {}",
            op,
            inputs.len(),
            function,
            placeholders.len()
        )));
    }
    if graph.declared_outputs().len() != n_outputs {
        return Err(SessionError::integrity(format!(
            "operation '{}' expects {} output(s) from '{}', which declares {}",
            op,
            n_outputs,
            function,
            graph.declared_outputs().len()
        )));
    }

    let recursion = env.recursion.enter(function, &inputs, env.config.max_invoke_depth)?;
    debug!(function, op, depth = recursion.depth(), "Invoking function");

    let child_env = ExecEnv {
        recursion: &recursion,
        ..env
    };
    let supplied = placeholders.into_iter().zip(inputs).collect();
    let output = Executor::new(graph, child_env, &entry.constants).run(graph.declared_outputs(), supplied)?;

    debug!(
        function,
        depth = recursion.depth(),
        executed = output.stats.ops_executed,
        "Function returned"
    );
    Ok(output)
}
