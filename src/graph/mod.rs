//! Graph model: variables, operations and their data/control dependencies.
//!
//! Graphs are assembled with [`GraphBuilder`] and validated once in
//! [`GraphBuilder::build`]. A built [`Graph`] is immutable and can be shared
//! across sessions and threads.
//!
//! Dependency planning walks backwards from the requested variables through
//! producers and control dependencies, then orders the reachable operations
//! topologically. Loop back-edges (a `NextIteration` output feeding a `Merge`)
//! are the only cycles a graph may contain; they are ignored for ordering.

pub mod op;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use tracing::debug;

use crate::error::SessionError;
use crate::tensor::{Tensor, TensorDtype};

pub use op::{Kernel, OpKind, OutputPlan};

/// Index of a variable in its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableId(pub usize);

/// Index of an operation in its graph. Also its declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub usize);

/// How a variable gets its value.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableKind {
    /// Supplied per execution. Optional hints are checked against the supplied array.
    Placeholder {
        dtype: Option<TensorDtype>,
        shape: Option<Vec<usize>>,
    },
    /// Fixed value, identical across executions.
    Constant(Tensor),
    /// Produced by exactly one operation.
    Computed,
    /// Reassigned once per loop iteration (`Merge` or `NextIteration` output).
    LoopCarried,
}

impl VariableKind {
    /// Placeholders and constants are frame-independent.
    pub fn is_global(&self) -> bool {
        matches!(self, VariableKind::Placeholder { .. } | VariableKind::Constant(_))
    }

    fn label(&self) -> &'static str {
        match self {
            VariableKind::Placeholder { .. } => "placeholder",
            VariableKind::Constant(_) => "constant",
            VariableKind::Computed => "computed",
            VariableKind::LoopCarried => "loop-carried",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Variable {
    name: String,
    kind: VariableKind,
    producer: Option<OpId>,
}

impl Variable {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &VariableKind {
        &self.kind
    }

    /// The operation writing this variable, if any.
    pub fn producer(&self) -> Option<OpId> {
        self.producer
    }
}

#[derive(Debug, Clone)]
pub struct Operation {
    name: String,
    kind: OpKind,
    inputs: Vec<VariableId>,
    outputs: Vec<VariableId>,
    control_deps: Vec<OpId>,
}

impl Operation {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    pub fn inputs(&self) -> &[VariableId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[VariableId] {
        &self.outputs
    }

    /// Operations that must finish in the same frame and iteration first.
    pub fn control_deps(&self) -> &[OpId] {
        &self.control_deps
    }
}

/// One consuming input slot of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consumer {
    pub op: OpId,
    pub slot: usize,
}

/// Declaration of an operation by variable and operation names.
#[derive(Debug, Clone)]
pub struct OperationSpec {
    name: String,
    kind: OpKind,
    inputs: Vec<String>,
    outputs: Vec<String>,
    control_deps: Vec<String>,
}

impl OperationSpec {
    pub fn new(name: impl Into<String>, kind: OpKind) -> Self {
        Self {
            name: name.into(),
            kind,
            inputs: Vec::new(),
            outputs: Vec::new(),
            control_deps: Vec::new(),
        }
    }

    /// Shorthand for an ordinary operation.
    pub fn kernel(name: impl Into<String>, kernel: Kernel) -> Self {
        Self::new(name, OpKind::Kernel(kernel))
    }

    pub fn inputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn outputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = names.into_iter().map(Into::into).collect();
        self
    }

    /// Names of operations that must finish before this one runs.
    pub fn control_deps<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.control_deps = names.into_iter().map(Into::into).collect();
        self
    }
}

/// Incremental graph construction. Variables must be declared before any
/// operation references them; control dependencies may name operations
/// declared later.
pub struct GraphBuilder {
    name: String,
    variables: Vec<Variable>,
    variable_ids: HashMap<String, VariableId>,
    operations: Vec<Operation>,
    operation_ids: HashMap<String, OpId>,
    pending_control: Vec<Vec<String>>,
    outputs: Vec<VariableId>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            variables: Vec::new(),
            variable_ids: HashMap::new(),
            operations: Vec::new(),
            operation_ids: HashMap::new(),
            pending_control: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Declare a variable. Names are unique within a graph.
    pub fn add_variable(
        &mut self,
        name: impl Into<String>,
        kind: VariableKind,
    ) -> Result<VariableId, SessionError> {
        let name = name.into();
        if self.variable_ids.contains_key(&name) {
            return Err(SessionError::integrity(format!(
                "variable '{}' declared twice",
                name
            )));
        }
        let id = VariableId(self.variables.len());
        self.variable_ids.insert(name.clone(), id);
        self.variables.push(Variable {
            name,
            kind,
            producer: None,
        });
        Ok(id)
    }

    /// Placeholder without shape or dtype hints.
    pub fn placeholder(&mut self, name: impl Into<String>) -> Result<VariableId, SessionError> {
        self.add_variable(
            name,
            VariableKind::Placeholder {
                dtype: None,
                shape: None,
            },
        )
    }

    /// Placeholder whose supplied arrays must match `dtype` and `shape`.
    pub fn typed_placeholder(
        &mut self,
        name: impl Into<String>,
        dtype: TensorDtype,
        shape: &[usize],
    ) -> Result<VariableId, SessionError> {
        self.add_variable(
            name,
            VariableKind::Placeholder {
                dtype: Some(dtype),
                shape: Some(shape.to_vec()),
            },
        )
    }

    pub fn constant(&mut self, name: impl Into<String>, value: Tensor) -> Result<VariableId, SessionError> {
        self.add_variable(name, VariableKind::Constant(value))
    }

    pub fn computed(&mut self, name: impl Into<String>) -> Result<VariableId, SessionError> {
        self.add_variable(name, VariableKind::Computed)
    }

    pub fn loop_carried(&mut self, name: impl Into<String>) -> Result<VariableId, SessionError> {
        self.add_variable(name, VariableKind::LoopCarried)
    }

    fn resolve(&self, op: &str, name: &str) -> Result<VariableId, SessionError> {
        self.variable_ids.get(name).copied().ok_or_else(|| {
            SessionError::integrity(format!(
                "operation '{}' references undeclared variable '{}'",
                op, name
            ))
        })
    }

    /// Declare an operation. Its output variables must be computed or
    /// loop-carried and not already produced by another operation.
    pub fn add_operation(&mut self, spec: OperationSpec) -> Result<OpId, SessionError> {
        if self.operation_ids.contains_key(&spec.name) {
            return Err(SessionError::integrity(format!(
                "operation '{}' declared twice",
                spec.name
            )));
        }
        spec.kind
            .check_arity(spec.inputs.len(), spec.outputs.len())
            .map_err(|msg| SessionError::integrity(format!("operation '{}': {}", spec.name, msg)))?;
        if let OpKind::Enter { frame, .. } = &spec.kind {
            if frame.is_empty() {
                return Err(SessionError::integrity(format!(
                    "operation '{}' enters a frame with an empty name",
                    spec.name
                )));
            }
        }

        let inputs = spec
            .inputs
            .iter()
            .map(|n| self.resolve(&spec.name, n))
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = spec
            .outputs
            .iter()
            .map(|n| self.resolve(&spec.name, n))
            .collect::<Result<Vec<_>, _>>()?;

        let id = OpId(self.operations.len());
        for (i, &out) in outputs.iter().enumerate() {
            if outputs[..i].contains(&out) {
                return Err(SessionError::integrity(format!(
                    "operation '{}' lists output '{}' twice",
                    spec.name, self.variables[out.0].name
                )));
            }
            let var = &self.variables[out.0];
            if var.kind.is_global() {
                return Err(SessionError::integrity(format!(
                    "operation '{}' cannot produce {} variable '{}'",
                    spec.name,
                    var.kind.label(),
                    var.name
                )));
            }
            if let Some(other) = var.producer {
                return Err(SessionError::integrity(format!(
                    "variable '{}' is produced by both '{}' and '{}'",
                    var.name, self.operations[other.0].name, spec.name
                )));
            }
        }
        for &out in &outputs {
            self.variables[out.0].producer = Some(id);
        }

        self.operation_ids.insert(spec.name.clone(), id);
        self.pending_control.push(spec.control_deps);
        self.operations.push(Operation {
            name: spec.name,
            kind: spec.kind,
            inputs,
            outputs,
            control_deps: Vec::new(),
        });
        Ok(id)
    }

    /// Declare the graph's outputs, in order. Used when the graph is invoked
    /// as a function.
    pub fn declare_outputs<I, S>(&mut self, names: I) -> Result<(), SessionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut outputs = Vec::new();
        for name in names {
            let name = name.as_ref();
            let id = self.variable_ids.get(name).copied().ok_or_else(|| {
                SessionError::integrity(format!("declared output '{}' is not a variable", name))
            })?;
            outputs.push(id);
        }
        self.outputs = outputs;
        Ok(())
    }

    /// Validate and freeze the graph.
    pub fn build(mut self) -> Result<Graph, SessionError> {
        for (i, names) in std::mem::take(&mut self.pending_control).into_iter().enumerate() {
            let mut deps = Vec::with_capacity(names.len());
            for name in names {
                let dep = self.operation_ids.get(&name).copied().ok_or_else(|| {
                    SessionError::integrity(format!(
                        "operation '{}' has a control dependency on unknown operation '{}'",
                        self.operations[i].name, name
                    ))
                })?;
                if dep.0 == i {
                    return Err(SessionError::integrity(format!(
                        "operation '{}' depends on itself",
                        self.operations[i].name
                    )));
                }
                deps.push(dep);
            }
            self.operations[i].control_deps = deps;
        }

        for var in &self.variables {
            let needs_producer = matches!(var.kind, VariableKind::Computed | VariableKind::LoopCarried);
            if needs_producer && var.producer.is_none() {
                return Err(SessionError::integrity(format!(
                    "{} variable '{}' has no producing operation",
                    var.kind.label(),
                    var.name
                )));
            }
            if var.kind == VariableKind::LoopCarried {
                if let Some(p) = var.producer {
                    let kind = &self.operations[p.0].kind;
                    if !kind.is_merge() && !kind.is_next_iteration() {
                        return Err(SessionError::integrity(format!(
                            "loop-carried variable '{}' must be produced by Merge or NextIteration, not {}",
                            var.name,
                            kind.name()
                        )));
                    }
                }
            }
        }

        let mut consumers = vec![Vec::new(); self.variables.len()];
        let mut control_dependents = vec![Vec::new(); self.operations.len()];
        for (i, op) in self.operations.iter().enumerate() {
            for (slot, &input) in op.inputs.iter().enumerate() {
                consumers[input.0].push(Consumer { op: OpId(i), slot });
            }
            for &dep in &op.control_deps {
                control_dependents[dep.0].push(OpId(i));
            }
        }

        for op in &self.operations {
            if !op.kind.is_next_iteration() {
                continue;
            }
            let out = op.outputs[0];
            let var = &self.variables[out.0];
            if var.kind != VariableKind::LoopCarried {
                return Err(SessionError::integrity(format!(
                    "NextIteration '{}' must produce a loop-carried variable, '{}' is {}",
                    op.name,
                    var.name,
                    var.kind.label()
                )));
            }
            for c in &consumers[out.0] {
                let consumer = &self.operations[c.op.0];
                if !consumer.kind.is_merge() {
                    return Err(SessionError::integrity(format!(
                        "NextIteration output '{}' is consumed by {} '{}'; only Merge may consume it",
                        var.name,
                        consumer.kind.name(),
                        consumer.name
                    )));
                }
            }
        }

        for op in &self.operations {
            if !op.kind.is_merge() {
                continue;
            }
            let has_back_edge = op.inputs.iter().any(|v| {
                self.variables[v.0]
                    .producer
                    .is_some_and(|p| self.operations[p.0].kind.is_next_iteration())
            });
            let out = &self.variables[op.outputs[0].0];
            if has_back_edge && out.kind != VariableKind::LoopCarried {
                return Err(SessionError::integrity(format!(
                    "loop Merge '{}' must produce a loop-carried variable, '{}' is {}",
                    op.name,
                    out.name,
                    out.kind.label()
                )));
            }
        }

        let graph = Graph {
            name: self.name,
            variables: self.variables,
            variable_ids: self.variable_ids,
            operations: self.operations,
            operation_ids: self.operation_ids,
            consumers,
            control_dependents,
            outputs: self.outputs,
        };

        let all = vec![true; graph.operations.len()];
        let order = graph.topological_order(&all);
        if order.len() != graph.operations.len() {
            let mut placed = vec![false; graph.operations.len()];
            for id in &order {
                placed[id.0] = true;
            }
            let stuck: Vec<&str> = graph
                .operations
                .iter()
                .enumerate()
                .filter(|(i, _)| !placed[*i])
                .map(|(_, op)| op.name.as_str())
                .collect();
            return Err(SessionError::integrity(format!(
                "cycle outside of a loop construct involving {:?}",
                stuck
            )));
        }

        debug!(
            graph = %graph.name,
            n_variables = graph.variables.len(),
            n_operations = graph.operations.len(),
            "Built graph"
        );
        Ok(graph)
    }
}

/// Immutable, validated graph.
#[derive(Debug, Clone)]
pub struct Graph {
    name: String,
    variables: Vec<Variable>,
    variable_ids: HashMap<String, VariableId>,
    operations: Vec<Operation>,
    operation_ids: HashMap<String, OpId>,
    consumers: Vec<Vec<Consumer>>,
    control_dependents: Vec<Vec<OpId>>,
    outputs: Vec<VariableId>,
}

impl Graph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn variable(&self, id: VariableId) -> &Variable {
        &self.variables[id.0]
    }

    pub fn operation(&self, id: OpId) -> &Operation {
        &self.operations[id.0]
    }

    pub fn variable_id(&self, name: &str) -> Option<VariableId> {
        self.variable_ids.get(name).copied()
    }

    pub fn operation_id(&self, name: &str) -> Option<OpId> {
        self.operation_ids.get(name).copied()
    }

    pub fn producer_of(&self, var: VariableId) -> Option<OpId> {
        self.variables[var.0].producer
    }

    /// Every input slot reading `var`, in declaration order.
    pub fn consumers_of(&self, var: VariableId) -> &[Consumer] {
        &self.consumers[var.0]
    }

    /// Operations with a control dependency on `op`.
    pub fn control_dependents_of(&self, op: OpId) -> &[OpId] {
        &self.control_dependents[op.0]
    }

    /// Placeholders in declaration order. These are a function's positional inputs.
    pub fn placeholders(&self) -> Vec<VariableId> {
        self.variables
            .iter()
            .enumerate()
            .filter(|(_, v)| matches!(v.kind, VariableKind::Placeholder { .. }))
            .map(|(i, _)| VariableId(i))
            .collect()
    }

    /// Declared outputs in order. These are a function's positional outputs.
    pub fn declared_outputs(&self) -> &[VariableId] {
        &self.outputs
    }

    /// True if input `slot` of `op` is a loop back-edge.
    pub fn is_back_edge(&self, op: OpId, slot: usize) -> bool {
        let operation = &self.operations[op.0];
        operation.kind.is_merge()
            && operation
                .inputs
                .get(slot)
                .and_then(|v| self.variables[v.0].producer)
                .is_some_and(|p| self.operations[p.0].kind.is_next_iteration())
    }

    /// True if `var` is written by a constant `Enter`.
    pub fn is_loop_invariant(&self, var: VariableId) -> bool {
        self.variables[var.0].producer.is_some_and(|p| {
            matches!(
                self.operations[p.0].kind,
                OpKind::Enter {
                    is_constant: true,
                    ..
                }
            )
        })
    }

    /// Operations needed for the named outputs, in execution order.
    pub fn dependencies_of<S: AsRef<str>>(&self, outputs: &[S]) -> Result<Vec<OpId>, SessionError> {
        let ids = outputs
            .iter()
            .map(|name| {
                let name = name.as_ref();
                self.variable_id(name).ok_or_else(|| {
                    SessionError::integrity(format!(
                        "requested output '{}' is not a variable of graph '{}'",
                        name, self.name
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.plan(&ids))
    }

    /// Operations that can influence `outputs`, topologically ordered with
    /// ties broken by declaration order.
    pub fn plan(&self, outputs: &[VariableId]) -> Vec<OpId> {
        let required = self.required_ops(outputs);
        let order = self.topological_order(&required);
        debug!(
            graph = %self.name,
            requested = outputs.len(),
            planned = order.len(),
            total = self.operations.len(),
            "Planned execution"
        );
        order
    }

    /// Reverse reachability from `outputs` through producers and control deps.
    pub(crate) fn required_ops(&self, outputs: &[VariableId]) -> Vec<bool> {
        let mut required = vec![false; self.operations.len()];
        let mut stack: Vec<OpId> = outputs.iter().filter_map(|v| self.producer_of(*v)).collect();
        while let Some(id) = stack.pop() {
            if required[id.0] {
                continue;
            }
            required[id.0] = true;
            let op = &self.operations[id.0];
            for input in &op.inputs {
                if let Some(p) = self.producer_of(*input) {
                    if !required[p.0] {
                        stack.push(p);
                    }
                }
            }
            for dep in &op.control_deps {
                if !required[dep.0] {
                    stack.push(*dep);
                }
            }
        }
        required
    }

    /// Kahn's algorithm over the included operations, skipping loop back-edges.
    /// Returns fewer operations than included if a cycle remains.
    fn topological_order(&self, include: &[bool]) -> Vec<OpId> {
        let n = self.operations.len();
        let mut indegree = vec![0usize; n];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (i, op) in self.operations.iter().enumerate() {
            if !include[i] {
                continue;
            }
            for (slot, input) in op.inputs.iter().enumerate() {
                if self.is_back_edge(OpId(i), slot) {
                    continue;
                }
                if let Some(p) = self.producer_of(*input) {
                    if include[p.0] {
                        successors[p.0].push(i);
                        indegree[i] += 1;
                    }
                }
            }
            for dep in &op.control_deps {
                if include[dep.0] {
                    successors[dep.0].push(i);
                    indegree[i] += 1;
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
            .filter(|&i| include[i] && indegree[i] == 0)
            .map(Reverse)
            .collect();
        let mut order = Vec::with_capacity(n);
        while let Some(Reverse(i)) = ready.pop() {
            order.push(OpId(i));
            for &s in &successors[i] {
                indegree[s] -= 1;
                if indegree[s] == 0 {
                    ready.push(Reverse(s));
                }
            }
        }
        order
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn names(graph: &Graph, ops: &[OpId]) -> Vec<String> {
        ops.iter().map(|id| graph.operation(*id).name().to_string()).collect()
    }

    /// `out = add(x, y)` plus an unrelated `neg(y)`.
    fn add_graph() -> Graph {
        let mut b = GraphBuilder::new("add");
        b.placeholder("x").unwrap();
        b.placeholder("y").unwrap();
        b.computed("out").unwrap();
        b.computed("unused").unwrap();
        b.add_operation(OperationSpec::kernel("add", Kernel::Add).inputs(["x", "y"]).outputs(["out"]))
            .unwrap();
        b.add_operation(OperationSpec::kernel("neg", Kernel::Neg).inputs(["y"]).outputs(["unused"]))
            .unwrap();
        b.build().unwrap()
    }

    /// Counting loop: `while i < n { i += 1; x *= 2 }`, outputs `x_out`.
    pub(crate) fn counting_loop() -> Graph {
        let mut b = GraphBuilder::new("loop");
        for p in ["i0", "n", "x0"] {
            b.placeholder(p).unwrap();
        }
        for v in [
            "i_enter", "x_enter", "n_enter", "pred", "i_true", "i_false", "x_true", "x_false", "i_body",
            "x_body", "i_out", "x_out",
        ] {
            b.computed(v).unwrap();
        }
        for v in ["i_cur", "x_cur", "i_next", "x_next"] {
            b.loop_carried(v).unwrap();
        }
        let enter = |name: &str, is_constant: bool, input: &str, output: &str| {
            OperationSpec::new(
                name,
                OpKind::Enter {
                    frame: "while".into(),
                    is_constant,
                },
            )
            .inputs([input])
            .outputs([output])
        };
        let specs = vec![
            enter("enter_i", false, "i0", "i_enter"),
            enter("enter_x", false, "x0", "x_enter"),
            enter("enter_n", true, "n", "n_enter"),
            OperationSpec::new("merge_i", OpKind::Merge).inputs(["i_enter", "i_next"]).outputs(["i_cur"]),
            OperationSpec::new("merge_x", OpKind::Merge).inputs(["x_enter", "x_next"]).outputs(["x_cur"]),
            OperationSpec::kernel("cond", Kernel::Less).inputs(["i_cur", "n_enter"]).outputs(["pred"]),
            OperationSpec::new("switch_i", OpKind::Switch)
                .inputs(["pred", "i_cur"])
                .outputs(["i_true", "i_false"]),
            OperationSpec::new("switch_x", OpKind::Switch)
                .inputs(["pred", "x_cur"])
                .outputs(["x_true", "x_false"]),
            OperationSpec::kernel("inc", Kernel::AddScalar(1.0)).inputs(["i_true"]).outputs(["i_body"]),
            OperationSpec::kernel("dbl", Kernel::Scale(2.0)).inputs(["x_true"]).outputs(["x_body"]),
            OperationSpec::new("next_i", OpKind::NextIteration).inputs(["i_body"]).outputs(["i_next"]),
            OperationSpec::new("next_x", OpKind::NextIteration).inputs(["x_body"]).outputs(["x_next"]),
            OperationSpec::new("exit_i", OpKind::Exit).inputs(["i_false"]).outputs(["i_out"]),
            OperationSpec::new("exit_x", OpKind::Exit).inputs(["x_false"]).outputs(["x_out"]),
        ];
        for spec in specs {
            b.add_operation(spec).unwrap();
        }
        b.build().unwrap()
    }

    #[test]
    fn test_dependencies_prune_unreachable() {
        let g = add_graph();
        let plan = g.dependencies_of(&["out"]).unwrap();
        assert_eq!(names(&g, &plan), vec!["add"]);
        let both = g.dependencies_of(&["out", "unused"]).unwrap();
        assert_eq!(names(&g, &both), vec!["add", "neg"]);
    }

    #[test]
    fn test_dependencies_of_placeholder_is_empty() {
        let g = add_graph();
        assert!(g.dependencies_of(&["x"]).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_output_is_integrity_error() {
        let g = add_graph();
        assert!(matches!(
            g.dependencies_of(&["nope"]),
            Err(SessionError::GraphIntegrity(_))
        ));
    }

    #[test]
    fn test_topological_order_respects_data_and_declaration_order() {
        let mut b = GraphBuilder::new("chain");
        b.placeholder("x").unwrap();
        for v in ["a", "b", "c"] {
            b.computed(v).unwrap();
        }
        // declared out of dependency order
        b.add_operation(OperationSpec::kernel("third", Kernel::Add).inputs(["a", "b"]).outputs(["c"]))
            .unwrap();
        b.add_operation(OperationSpec::kernel("second", Kernel::Relu).inputs(["x"]).outputs(["b"]))
            .unwrap();
        b.add_operation(OperationSpec::kernel("first", Kernel::Neg).inputs(["x"]).outputs(["a"]))
            .unwrap();
        let g = b.build().unwrap();
        let plan = g.dependencies_of(&["c"]).unwrap();
        assert_eq!(names(&g, &plan), vec!["second", "first", "third"]);
    }

    #[test]
    fn test_control_deps_are_followed() {
        let mut b = GraphBuilder::new("ctrl");
        b.placeholder("x").unwrap();
        b.computed("a").unwrap();
        b.computed("b").unwrap();
        b.add_operation(
            OperationSpec::kernel("after", Kernel::Neg)
                .inputs(["x"])
                .outputs(["b"])
                .control_deps(["before"]),
        )
        .unwrap();
        b.add_operation(OperationSpec::kernel("before", Kernel::Relu).inputs(["x"]).outputs(["a"]))
            .unwrap();
        let g = b.build().unwrap();
        let plan = g.dependencies_of(&["b"]).unwrap();
        assert_eq!(names(&g, &plan), vec!["before", "after"]);
        assert_eq!(g.control_dependents_of(g.operation_id("before").unwrap()).len(), 1);
    }

    #[test]
    fn test_loop_graph_builds_and_orders() {
        let g = counting_loop();
        let plan = g.dependencies_of(&["x_out"]).unwrap();
        let planned = names(&g, &plan);
        assert!(!planned.contains(&"exit_i".to_string()));
        let pos = |n: &str| planned.iter().position(|p| p == n).unwrap();
        assert!(pos("enter_x") < pos("merge_x"));
        assert!(pos("merge_x") < pos("switch_x"));
        assert!(pos("dbl") < pos("next_x"));
        assert!(pos("cond") < pos("switch_i"));
        assert!(g.is_loop_invariant(g.variable_id("n_enter").unwrap()));
        let merge_x = g.operation_id("merge_x").unwrap();
        assert!(!g.is_back_edge(merge_x, 0));
        assert!(g.is_back_edge(merge_x, 1));
    }

    #[test]
    fn test_consumers_of() {
        let g = counting_loop();
        let pred = g.variable_id("pred").unwrap();
        let consumers: Vec<String> = g
            .consumers_of(pred)
            .iter()
            .map(|c| g.operation(c.op).name().to_string())
            .collect();
        assert_eq!(consumers, vec!["switch_i", "switch_x"]);
    }

    #[test]
    fn test_undeclared_variable_rejected() {
        let mut b = GraphBuilder::new("bad");
        b.computed("out").unwrap();
        let err = b
            .add_operation(OperationSpec::kernel("neg", Kernel::Neg).inputs(["ghost"]).outputs(["out"]))
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_duplicate_producer_rejected() {
        let mut b = GraphBuilder::new("bad");
        b.placeholder("x").unwrap();
        b.computed("out").unwrap();
        b.add_operation(OperationSpec::kernel("a", Kernel::Neg).inputs(["x"]).outputs(["out"]))
            .unwrap();
        let err = b
            .add_operation(OperationSpec::kernel("b", Kernel::Relu).inputs(["x"]).outputs(["out"]))
            .unwrap_err();
        assert!(matches!(err, SessionError::GraphIntegrity(_)));
    }

    #[test]
    fn test_duplicate_variable_rejected() {
        let mut b = GraphBuilder::new("bad");
        b.placeholder("x").unwrap();
        assert!(b.computed("x").is_err());
    }

    #[test]
    fn test_producing_placeholder_rejected() {
        let mut b = GraphBuilder::new("bad");
        b.placeholder("x").unwrap();
        b.placeholder("y").unwrap();
        assert!(b
            .add_operation(OperationSpec::kernel("neg", Kernel::Neg).inputs(["x"]).outputs(["y"]))
            .is_err());
    }

    #[test]
    fn test_missing_producer_rejected() {
        let mut b = GraphBuilder::new("bad");
        b.computed("orphan").unwrap();
        assert!(matches!(b.build(), Err(SessionError::GraphIntegrity(_))));
    }

    #[test]
    fn test_arity_rejected() {
        let mut b = GraphBuilder::new("bad");
        b.placeholder("x").unwrap();
        b.computed("out").unwrap();
        let err = b
            .add_operation(OperationSpec::kernel("add", Kernel::Add).inputs(["x"]).outputs(["out"]))
            .unwrap_err();
        assert!(err.to_string().contains("expects"));
    }

    #[test]
    fn test_cycle_outside_loop_rejected() {
        let mut b = GraphBuilder::new("cyclic");
        b.computed("a").unwrap();
        b.computed("b").unwrap();
        b.add_operation(OperationSpec::kernel("f", Kernel::Neg).inputs(["b"]).outputs(["a"]))
            .unwrap();
        b.add_operation(OperationSpec::kernel("g", Kernel::Neg).inputs(["a"]).outputs(["b"]))
            .unwrap();
        let err = b.build().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_next_iteration_must_feed_merge() {
        let mut b = GraphBuilder::new("bad_loop");
        b.placeholder("x").unwrap();
        b.loop_carried("nx").unwrap();
        b.computed("y").unwrap();
        b.add_operation(OperationSpec::new("next", OpKind::NextIteration).inputs(["x"]).outputs(["nx"]))
            .unwrap();
        b.add_operation(OperationSpec::kernel("neg", Kernel::Neg).inputs(["nx"]).outputs(["y"]))
            .unwrap();
        let err = b.build().unwrap_err();
        assert!(err.to_string().contains("only Merge"));
    }

    #[test]
    fn test_loop_carried_requires_loop_producer() {
        let mut b = GraphBuilder::new("bad");
        b.placeholder("x").unwrap();
        b.loop_carried("y").unwrap();
        b.add_operation(OperationSpec::kernel("neg", Kernel::Neg).inputs(["x"]).outputs(["y"]))
            .unwrap();
        assert!(b.build().is_err());
    }

    #[test]
    fn test_unknown_control_dep_rejected() {
        let mut b = GraphBuilder::new("bad");
        b.placeholder("x").unwrap();
        b.computed("y").unwrap();
        b.add_operation(
            OperationSpec::kernel("neg", Kernel::Neg)
                .inputs(["x"])
                .outputs(["y"])
                .control_deps(["ghost"]),
        )
        .unwrap();
        assert!(b.build().is_err());
    }

    #[test]
    fn test_placeholders_and_declared_outputs_in_order() {
        let mut b = GraphBuilder::new("f");
        b.placeholder("b").unwrap();
        b.placeholder("a").unwrap();
        b.computed("c").unwrap();
        b.add_operation(OperationSpec::kernel("add", Kernel::Add).inputs(["a", "b"]).outputs(["c"]))
            .unwrap();
        b.declare_outputs(["c"]).unwrap();
        let g = b.build().unwrap();
        let ph: Vec<&str> = g.placeholders().iter().map(|v| g.variable(*v).name()).collect();
        assert_eq!(ph, vec!["b", "a"]);
        assert_eq!(g.declared_outputs(), &[g.variable_id("c").unwrap()]);
    }
}
