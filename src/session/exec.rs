//! Dataflow scheduler behind [`Session::execute`](super::Session::execute).
//!
//! Every (operation, frame, iteration) triple that receives an input becomes
//! an instance. An instance is queued once it can either run or be pruned, and
//! the queue is drained in (scope path, plan position) order so one loop
//! iteration, nested loops included, finishes before the next begins.
//!
//! Each input slot of an instance is pending, live, dead or global. A dead
//! slot means the producing path was not taken: ordinary operations with a
//! dead input are pruned and publish dead outputs, `Merge` only waits for
//! one live input.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};

use tracing::{debug, trace};

use crate::backend::{ComputeBackend, DeviceTensor};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::frame::{FrameId, FrameManager, Scope};
use crate::graph::{Graph, Kernel, OpId, OpKind, OutputPlan, VariableId, VariableKind};
use crate::invoke::{self, FunctionLibrary, RecursionContext};
use crate::memory::MemoryManager;

use super::binding::{release_value, BindingKey, BindingTable, Value};
use super::{ConstantCache, ExecutedOp, SessionStats};

/// Collaborators shared by a top-level execution and every invocation under it.
#[derive(Clone, Copy)]
pub(crate) struct ExecEnv<'a> {
    pub backend: &'a dyn ComputeBackend,
    pub memory: &'a MemoryManager,
    pub library: &'a FunctionLibrary,
    pub config: &'a SessionConfig,
    pub recursion: &'a RecursionContext,
}

/// What one run hands back: values for the requested variables (`None` when
/// never produced) plus its trace.
pub(crate) struct RunOutput {
    pub values: Vec<Option<Value>>,
    pub trace: Vec<ExecutedOp>,
    pub stats: SessionStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pending,
    Live,
    Dead,
    Global,
}

impl Slot {
    fn is_live(self) -> bool {
        matches!(self, Slot::Live | Slot::Global)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct InstanceKey {
    op: OpId,
    scope: Scope,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyKey {
    path: Vec<(FrameId, u64)>,
    position: usize,
    key: InstanceKey,
}

#[derive(Debug)]
struct Instance {
    slots: Vec<Slot>,
    control_pending: usize,
    control_dead: bool,
    queued: bool,
    finished: bool,
}

impl Instance {
    fn is_ready(&self, is_merge: bool) -> bool {
        if self.control_dead {
            return true;
        }
        if is_merge {
            let any_live = self.slots.iter().any(|s| s.is_live());
            let all_dead = self.slots.iter().all(|s| *s == Slot::Dead);
            all_dead || (any_live && self.control_pending == 0)
        } else {
            self.slots.contains(&Slot::Dead)
                || (!self.slots.contains(&Slot::Pending) && self.control_pending == 0)
        }
    }

    fn is_pruned(&self, is_merge: bool) -> bool {
        if self.control_dead {
            return true;
        }
        if is_merge {
            !self.slots.iter().any(|s| s.is_live())
        } else {
            self.slots.contains(&Slot::Dead)
        }
    }
}

pub(crate) struct Executor<'a> {
    graph: &'a Graph,
    env: ExecEnv<'a>,
    constants: &'a ConstantCache,
    globals: HashMap<VariableId, Value>,
    required: Vec<bool>,
    position: Vec<usize>,
    requested: Vec<VariableId>,
    frames: FrameManager,
    bindings: BindingTable,
    instances: HashMap<InstanceKey, Instance>,
    ready: BTreeSet<ReadyKey>,
    trace: Vec<ExecutedOp>,
    stats: SessionStats,
}

fn new_instance(
    graph: &Graph,
    bindings: &BindingTable,
    frames: &FrameManager,
    key: InstanceKey,
) -> Instance {
    let op = graph.operation(key.op);
    let loop_merge =
        op.kind().is_merge() && (0..op.inputs().len()).any(|slot| graph.is_back_edge(key.op, slot));
    let slots = op
        .inputs()
        .iter()
        .enumerate()
        .map(|(slot, &var)| {
            if graph.variable(var).kind().is_global() {
                return Slot::Global;
            }
            if loop_merge {
                // iteration 0 is fed by the forward edge, later ones by the back-edge
                let back_edge = graph.is_back_edge(key.op, slot);
                if back_edge == (key.scope.iteration == 0) {
                    return Slot::Dead;
                }
            }
            if graph.is_loop_invariant(var) {
                let source = BindingKey::new(var, Scope::new(key.scope.frame, 0));
                if bindings.contains(&source) {
                    return Slot::Live;
                }
                if frames.is_dead(key.scope.frame) {
                    return Slot::Dead;
                }
            }
            Slot::Pending
        })
        .collect();
    Instance {
        slots,
        control_pending: op.control_deps().len(),
        control_dead: false,
        queued: false,
        finished: false,
    }
}

impl<'a> Executor<'a> {
    pub fn new(graph: &'a Graph, env: ExecEnv<'a>, constants: &'a ConstantCache) -> Self {
        Self {
            graph,
            env,
            constants,
            globals: HashMap::new(),
            required: vec![false; graph.operations().len()],
            position: vec![0; graph.operations().len()],
            requested: Vec::new(),
            frames: FrameManager::new(),
            bindings: BindingTable::new(),
            instances: HashMap::new(),
            ready: BTreeSet::new(),
            trace: Vec::new(),
            stats: SessionStats::default(),
        }
    }

    /// Produce `requested` from `supplied` placeholder values. Everything the
    /// run bound is released before returning, on success and on error.
    pub fn run(
        mut self,
        requested: &[VariableId],
        supplied: HashMap<VariableId, Value>,
    ) -> Result<RunOutput, SessionError> {
        let memory = self.env.memory;
        let _guard = memory.begin_execution();
        let outcome = self.drive(requested, supplied);
        self.teardown();
        let values = outcome?;

        self.stats.peak_live_bindings = self.stats.peak_live_bindings.max(self.bindings.peak());
        self.stats.frames = self.stats.frames.max(self.frames.len() - 1);
        debug!(
            graph = %self.graph.name(),
            executed = self.stats.ops_executed,
            pruned = self.stats.ops_pruned,
            acquired = self.stats.buffers_acquired,
            iterations = self.stats.iterations,
            "Execution finished"
        );
        Ok(RunOutput {
            values,
            trace: self.trace,
            stats: self.stats,
        })
    }

    fn drive(
        &mut self,
        requested: &[VariableId],
        supplied: HashMap<VariableId, Value>,
    ) -> Result<Vec<Option<Value>>, SessionError> {
        let graph = self.graph;
        self.requested = requested.to_vec();

        let order = graph.plan(requested);
        for (position, id) in order.iter().enumerate() {
            self.required[id.0] = true;
            self.position[id.0] = position;
        }

        self.bind_globals(&order, supplied)?;

        for &id in &order {
            let op = graph.operation(id);
            let seeded = op.control_deps().is_empty()
                && op
                    .inputs()
                    .iter()
                    .all(|v| graph.variable(*v).kind().is_global());
            if seeded {
                let key = InstanceKey {
                    op: id,
                    scope: Scope::ROOT,
                };
                self.instance(key);
                self.schedule_if_ready(key);
            }
        }

        while let Some(next) = self.ready.pop_first() {
            if self.env.recursion.is_cancelled() {
                debug!(graph = %graph.name(), "Execution cancelled");
                return Err(SessionError::Cancelled);
            }
            self.dispatch(next.key)?;
        }
        self.check_stalled()?;

        let values = requested
            .iter()
            .map(|&var| {
                if graph.variable(var).kind().is_global() {
                    self.globals.get(&var).cloned()
                } else {
                    self.bindings.take(&BindingKey::new(var, Scope::ROOT))
                }
            })
            .collect();
        Ok(values)
    }

    /// Fails if the queue drained while a live instance still waits on an
    /// input or a control dependency.
    fn check_stalled(&self) -> Result<(), SessionError> {
        let mut stalled: Vec<(&InstanceKey, &Instance)> = self
            .instances
            .iter()
            .filter(|(key, inst)| {
                !inst.finished
                    && !self.frames.is_dead(key.scope.frame)
                    && (inst.slots.contains(&Slot::Pending) || inst.control_pending > 0)
            })
            .collect();
        stalled.sort_by_key(|(key, _)| (self.position[key.op.0], **key));
        let Some((key, inst)) = stalled.first() else {
            return Ok(());
        };
        let op = self.graph.operation(key.op);
        let waiting: Vec<&str> = op
            .inputs()
            .iter()
            .zip(&inst.slots)
            .filter(|(_, slot)| **slot == Slot::Pending)
            .map(|(&var, _)| self.graph.variable(var).name())
            .collect();
        debug!(graph = %self.graph.name(), stalled = stalled.len(), "Execution stalled");
        Err(SessionError::FrameState(format!(
            "'{}' in frame {} iteration {} never received {:?} ({} control deps outstanding)",
            op.name(),
            key.scope.frame.0,
            key.scope.iteration,
            waiting,
            inst.control_pending
        )))
    }

    /// Check supplied placeholders, report the first missing one, and load constants.
    fn bind_globals(
        &mut self,
        order: &[OpId],
        supplied: HashMap<VariableId, Value>,
    ) -> Result<(), SessionError> {
        let graph = self.graph;

        for (&var, value) in &supplied {
            let variable = graph.variable(var);
            let VariableKind::Placeholder { dtype, shape } = variable.kind() else {
                return Err(SessionError::integrity(format!(
                    "'{}' is not a placeholder and cannot be supplied",
                    variable.name()
                )));
            };
            if let Some(array) = value.as_array() {
                if let Some(expected) = shape {
                    if array.shape() != expected.as_slice() {
                        return Err(SessionError::shape(variable.name(), expected, array.shape()));
                    }
                }
                if let Some(expected) = dtype {
                    if array.dtype() != *expected {
                        return Err(SessionError::DTypeMismatch {
                            op: variable.name().to_string(),
                            expected: *expected,
                            actual: array.dtype(),
                        });
                    }
                }
            }
        }

        let mut needed: Vec<VariableId> = order
            .iter()
            .flat_map(|id| graph.operation(*id).inputs().iter().copied())
            .chain(self.requested.iter().copied())
            .filter(|v| graph.variable(*v).kind().is_global())
            .collect();
        needed.sort();
        needed.dedup();

        let mut constants = Vec::new();
        for &var in &needed {
            match graph.variable(var).kind() {
                VariableKind::Placeholder { .. } if !supplied.contains_key(&var) => {
                    return Err(SessionError::UnresolvedInput {
                        name: graph.variable(var).name().to_string(),
                    });
                }
                VariableKind::Constant(_) => constants.push(var),
                _ => {}
            }
        }

        self.globals = supplied;
        self.globals
            .extend(self.constants.resolve(graph, self.env.backend, &constants));
        Ok(())
    }

    fn instance(&mut self, key: InstanceKey) -> &mut Instance {
        match self.instances.entry(key) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                if key.scope.frame != FrameId::ROOT {
                    self.frames.track_instance(key.scope.frame);
                }
                e.insert(new_instance(self.graph, &self.bindings, &self.frames, key))
            }
        }
    }

    fn schedule_if_ready(&mut self, key: InstanceKey) {
        let is_merge = self.graph.operation(key.op).kind().is_merge();
        let Some(inst) = self.instances.get_mut(&key) else {
            return;
        };
        if inst.queued || inst.finished || !inst.is_ready(is_merge) {
            return;
        }
        inst.queued = true;
        let path = self.frames.scope_path(key.scope);
        self.ready.insert(ReadyKey {
            path,
            position: self.position[key.op.0],
            key,
        });
    }

    /// Deliver a value (or a dead marker) to one input slot. Returns whether
    /// the instance will read it.
    fn fill(&mut self, key: InstanceKey, slot: usize, state: Slot) -> bool {
        let inst = self.instance(key);
        if inst.finished || inst.slots[slot] != Slot::Pending {
            return false;
        }
        inst.slots[slot] = state;
        self.schedule_if_ready(key);
        state == Slot::Live
    }

    /// Bind `value` as `var` at `target` and notify every required consumer.
    fn publish(&mut self, var: VariableId, target: Scope, value: Option<Value>) {
        let graph = self.graph;
        let state = if value.is_some() { Slot::Live } else { Slot::Dead };
        let invariant = graph.is_loop_invariant(var);

        let mut refs = 0;
        for consumer in graph.consumers_of(var) {
            if !self.required[consumer.op.0] {
                continue;
            }
            if invariant {
                // visible to every iteration of the frame
                let mut keys: Vec<InstanceKey> = self
                    .instances
                    .keys()
                    .filter(|k| k.op == consumer.op && k.scope.frame == target.frame)
                    .copied()
                    .collect();
                let first = InstanceKey {
                    op: consumer.op,
                    scope: target,
                };
                if !keys.contains(&first) {
                    keys.push(first);
                }
                for k in keys {
                    if self.fill(k, consumer.slot, state) {
                        refs += 1;
                    }
                }
            } else {
                let k = InstanceKey {
                    op: consumer.op,
                    scope: target,
                };
                if self.fill(k, consumer.slot, state) {
                    refs += 1;
                }
            }
        }

        if let Some(value) = value {
            let requested = target == Scope::ROOT && self.requested.contains(&var);
            let pinned = requested || (invariant && self.frames.hold_invariant(target.frame, var));
            if let Some(unread) = self.bindings.insert(BindingKey::new(var, target), value, refs, pinned) {
                release_value(self.env.memory, unread);
            }
        }
    }

    fn source_key(&self, var: VariableId, scope: Scope) -> BindingKey {
        if self.graph.is_loop_invariant(var) {
            BindingKey::new(var, Scope::new(scope.frame, 0))
        } else {
            BindingKey::new(var, scope)
        }
    }

    fn input_values(&self, key: InstanceKey, slots: &[Slot]) -> Result<Vec<Option<Value>>, SessionError> {
        let op = self.graph.operation(key.op);
        op.inputs()
            .iter()
            .zip(slots)
            .map(|(&var, slot)| match slot {
                Slot::Global => self.globals.get(&var).cloned().map(Some).ok_or_else(|| {
                    SessionError::integrity(format!(
                        "value of '{}' is not available",
                        self.graph.variable(var).name()
                    ))
                }),
                Slot::Live => self
                    .bindings
                    .get(&self.source_key(var, key.scope))
                    .cloned()
                    .map(Some)
                    .ok_or_else(|| {
                        SessionError::integrity(format!(
                            "value of '{}' was released before '{}' read it",
                            self.graph.variable(var).name(),
                            op.name()
                        ))
                    }),
                Slot::Dead | Slot::Pending => Ok(None),
            })
            .collect()
    }

    fn dispatch(&mut self, key: InstanceKey) -> Result<(), SessionError> {
        let is_merge = self.graph.operation(key.op).kind().is_merge();
        let (slots, pruned) = match self.instances.get_mut(&key) {
            Some(inst) if !inst.finished => {
                inst.queued = false;
                (inst.slots.clone(), inst.is_pruned(is_merge))
            }
            _ => return Ok(()),
        };

        if pruned {
            self.prune(key)?;
        } else {
            self.execute(key, &slots)?;
        }
        self.finish(key, !pruned, &slots);
        Ok(())
    }

    fn prune(&mut self, key: InstanceKey) -> Result<(), SessionError> {
        let graph = self.graph;
        let op = graph.operation(key.op);
        trace!(
            op = op.name(),
            frame = key.scope.frame.0,
            iteration = key.scope.iteration,
            "Pruned"
        );
        self.stats.ops_pruned += 1;
        match op.kind() {
            OpKind::Enter { frame, .. } => {
                let child = self.frames.enter(frame, key.scope)?;
                self.frames.mark_dead(child)?;
                self.publish(op.outputs()[0], Scope::new(child, 0), None);
            }
            OpKind::Exit => {
                // a live iteration ended; only a loop entered dead exits dead
                if self.frames.is_dead(key.scope.frame) {
                    let parent = self.frames.exit(key.scope.frame)?;
                    self.publish(op.outputs()[0], parent, None);
                }
            }
            OpKind::NextIteration => {}
            _ => {
                for &out in op.outputs() {
                    self.publish(out, key.scope, None);
                }
            }
        }
        Ok(())
    }

    fn execute(&mut self, key: InstanceKey, slots: &[Slot]) -> Result<(), SessionError> {
        let graph = self.graph;
        let op = graph.operation(key.op);
        let mut inputs = self.input_values(key, slots)?;
        trace!(
            op = op.name(),
            kind = op.kind().name(),
            frame = key.scope.frame.0,
            iteration = key.scope.iteration,
            "Dispatch"
        );

        let mut take = |i: usize| {
            inputs.get_mut(i).and_then(Option::take).ok_or_else(|| {
                SessionError::integrity(format!("'{}' dispatched without input {}", op.name(), i))
            })
        };

        match op.kind() {
            OpKind::Kernel(kernel) => {
                let values = (0..op.inputs().len()).map(&mut take).collect::<Result<Vec<_>, _>>()?;
                let output = self.run_kernel(op.name(), kernel, &values)?;
                drop(values);
                self.publish(op.outputs()[0], key.scope, Some(output));
            }
            OpKind::Switch => {
                let predicate = take(0)?;
                let value = take(1)?;
                let array = predicate.as_array().ok_or_else(|| {
                    SessionError::integrity(format!("'{}' predicate must be an array", op.name()))
                })?;
                let taken = FrameManager::resolve_switch(op.name(), array)?;
                drop(predicate);
                let (if_true, if_false) = if taken { (Some(value), None) } else { (None, Some(value)) };
                self.publish(op.outputs()[0], key.scope, if_true);
                self.publish(op.outputs()[1], key.scope, if_false);
            }
            OpKind::Merge => {
                let live: Vec<bool> = slots.iter().map(|s| s.is_live()).collect();
                let chosen = FrameManager::resolve_merge(&live).ok_or_else(|| {
                    SessionError::integrity(format!("'{}' has no live input", op.name()))
                })?;
                let value = take(chosen)?;
                self.publish(op.outputs()[0], key.scope, Some(value));
            }
            OpKind::Enter { frame, .. } => {
                let value = take(0)?;
                let child = self.frames.enter(frame, key.scope)?;
                self.publish(op.outputs()[0], Scope::new(child, 0), Some(value));
            }
            OpKind::Exit => {
                let value = take(0)?;
                let parent = self.frames.exit(key.scope.frame)?;
                self.publish(op.outputs()[0], parent, Some(value));
            }
            OpKind::NextIteration => {
                let value = take(0)?;
                let next = self.frames.next_iteration(key.scope)?;
                self.stats.iterations += 1;
                self.publish(op.outputs()[0], next, Some(value));
            }
            OpKind::Invoke { function } => {
                let values = (0..op.inputs().len()).map(&mut take).collect::<Result<Vec<_>, _>>()?;
                let child = invoke::invoke(self.env, function, op.name(), op.outputs().len(), values)?;
                self.stats.absorb(&child.stats);
                if self.env.config.record_trace {
                    self.trace.extend(child.trace.into_iter().map(|mut e| {
                        e.name = format!("{}/{}", function, e.name);
                        e
                    }));
                }
                for (&out, value) in op.outputs().iter().zip(child.values) {
                    self.publish(out, key.scope, value);
                }
            }
        }

        self.stats.ops_executed += 1;
        if self.env.config.record_trace {
            self.trace.push(ExecutedOp {
                name: op.name().to_string(),
                frame: key.scope.frame,
                iteration: key.scope.iteration,
            });
        }
        Ok(())
    }

    fn run_kernel(
        &mut self,
        op: &str,
        kernel: &Kernel,
        values: &[Value],
    ) -> Result<Value, SessionError> {
        let refs: Vec<&Value> = values.iter().collect();
        match kernel.infer(op, &refs)? {
            OutputPlan::Alias(value) => Ok(value),
            OutputPlan::Alloc { shape, dtype } => {
                let arrays: Vec<&DeviceTensor> = values.iter().filter_map(Value::as_array).collect();
                let mut out = self.env.memory.acquire(&shape, dtype, self.env.backend.device())?;
                self.stats.buffers_acquired += 1;
                if let Err(e) = kernel.execute(self.env.backend, &arrays, &mut out) {
                    self.env.memory.release(out);
                    return Err(e);
                }
                Ok(Value::array(out))
            }
        }
    }

    /// Mark `key` done: release inputs it held, signal control dependents,
    /// and let its frame drop loop invariants once drained.
    fn finish(&mut self, key: InstanceKey, executed: bool, slots: &[Slot]) {
        let graph = self.graph;
        if let Some(inst) = self.instances.get_mut(&key) {
            inst.finished = true;
        }

        let op = graph.operation(key.op);
        for (&var, slot) in op.inputs().iter().zip(slots) {
            if *slot == Slot::Live {
                let source = self.source_key(var, key.scope);
                if let Some(value) = self.bindings.consume(&source) {
                    release_value(self.env.memory, value);
                }
            }
        }

        for &dep in graph.control_dependents_of(key.op) {
            if !self.required[dep.0] {
                continue;
            }
            let dep_key = InstanceKey {
                op: dep,
                scope: key.scope,
            };
            let inst = self.instance(dep_key);
            if inst.finished {
                continue;
            }
            inst.control_pending = inst.control_pending.saturating_sub(1);
            if !executed {
                inst.control_dead = true;
            }
            self.schedule_if_ready(dep_key);
        }

        if key.scope.frame != FrameId::ROOT {
            for var in self.frames.finish_instance(key.scope.frame) {
                let invariant = BindingKey::new(var, Scope::new(key.scope.frame, 0));
                if let Some(value) = self.bindings.take(&invariant) {
                    release_value(self.env.memory, value);
                }
            }
        }
    }

    fn teardown(&mut self) {
        let leftover = self.bindings.len();
        for value in self.bindings.drain() {
            release_value(self.env.memory, value);
        }
        if leftover > 0 {
            trace!(leftover, "Released remaining bindings");
        }
        self.instances.clear();
        self.ready.clear();
        self.globals.clear();
    }
}
