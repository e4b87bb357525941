//! Frame manager: loop activation records and control-flow decisions.
//!
//! A frame is created the first time an `Enter` fires for a given frame name
//! under a given parent scope, so each outer iteration of a nested loop gets
//! its own child frame. Values are addressed by [`Scope`], the pair
//! (frame, iteration). Frame ids are local to one execution.

use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use crate::backend::DeviceTensor;
use crate::error::SessionError;
use crate::graph::VariableId;
use crate::tensor::TensorStorage;

/// Frame identity within one execution. The root frame is 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FrameId(pub u32);

impl FrameId {
    pub const ROOT: FrameId = FrameId(0);
}

/// One (frame, iteration) activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scope {
    pub frame: FrameId,
    pub iteration: u64,
}

impl Scope {
    pub const ROOT: Scope = Scope {
        frame: FrameId::ROOT,
        iteration: 0,
    };

    pub fn new(frame: FrameId, iteration: u64) -> Self {
        Self { frame, iteration }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Accepting new iterations.
    Active,
    /// An `Exit` fired; no further iterations.
    Closed,
}

#[derive(Debug)]
struct FrameRecord {
    name: String,
    parent: Option<Scope>,
    state: FrameState,
    /// Entered with a dead value: the loop sits on an untaken branch.
    dead: bool,
    /// Highest iteration reached.
    iterations: u64,
    /// Scheduled but unfinished operation instances in this frame.
    outstanding: usize,
    /// Loop-invariant values held until the frame is done.
    invariants: Vec<VariableId>,
    /// Ancestor scopes from the root down to this frame's parent.
    parent_path: Vec<(FrameId, u64)>,
}

/// Per-execution frame table.
#[derive(Debug)]
pub struct FrameManager {
    frames: Vec<FrameRecord>,
    by_parent: HashMap<(String, Scope), FrameId>,
}

impl Default for FrameManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameManager {
    pub fn new() -> Self {
        Self {
            frames: vec![FrameRecord {
                name: "root".to_string(),
                parent: None,
                state: FrameState::Active,
                dead: false,
                iterations: 0,
                outstanding: 0,
                invariants: Vec::new(),
                parent_path: Vec::new(),
            }],
            by_parent: HashMap::new(),
        }
    }

    fn record(&self, frame: FrameId) -> Result<&FrameRecord, SessionError> {
        self.frames
            .get(frame.0 as usize)
            .ok_or_else(|| SessionError::FrameState(format!("unknown frame {}", frame.0)))
    }

    fn record_mut(&mut self, frame: FrameId) -> Result<&mut FrameRecord, SessionError> {
        self.frames
            .get_mut(frame.0 as usize)
            .ok_or_else(|| SessionError::FrameState(format!("unknown frame {}", frame.0)))
    }

    /// Find or create the child frame `name` entered from `parent`.
    pub fn enter(&mut self, name: &str, parent: Scope) -> Result<FrameId, SessionError> {
        if let Some(&id) = self.by_parent.get(&(name.to_string(), parent)) {
            return Ok(id);
        }
        let mut parent_path = self.record(parent.frame)?.parent_path.clone();
        if parent.frame != FrameId::ROOT {
            parent_path.push((parent.frame, parent.iteration));
        }
        let id = FrameId(self.frames.len() as u32);
        self.frames.push(FrameRecord {
            name: name.to_string(),
            parent: Some(parent),
            state: FrameState::Active,
            dead: false,
            iterations: 0,
            outstanding: 0,
            invariants: Vec::new(),
            parent_path,
        });
        self.by_parent.insert((name.to_string(), parent), id);
        debug!(
            frame = id.0,
            name,
            parent_frame = parent.frame.0,
            parent_iteration = parent.iteration,
            "Entered frame"
        );
        Ok(id)
    }

    /// Advance `scope` to its next iteration. The frame must be active.
    pub fn next_iteration(&mut self, scope: Scope) -> Result<Scope, SessionError> {
        if scope.frame == FrameId::ROOT {
            return Err(SessionError::FrameState(
                "NextIteration outside of a loop frame".to_string(),
            ));
        }
        let record = self.record_mut(scope.frame)?;
        if record.state != FrameState::Active {
            return Err(SessionError::FrameState(format!(
                "NextIteration on closed frame '{}' at iteration {}",
                record.name, scope.iteration
            )));
        }
        let next = Scope::new(scope.frame, scope.iteration + 1);
        record.iterations = record.iterations.max(next.iteration);
        Ok(next)
    }

    /// Close `frame` and return the parent scope exiting values go to.
    pub fn exit(&mut self, frame: FrameId) -> Result<Scope, SessionError> {
        let record = self.record_mut(frame)?;
        let parent = record.parent.ok_or_else(|| {
            SessionError::FrameState("Exit outside of a loop frame".to_string())
        })?;
        if record.state == FrameState::Active {
            record.state = FrameState::Closed;
            debug!(
                frame = frame.0,
                name = %record.name,
                iterations = record.iterations + 1,
                "Closed frame"
            );
        }
        Ok(parent)
    }

    pub fn state(&self, frame: FrameId) -> Option<FrameState> {
        self.frames.get(frame.0 as usize).map(|r| r.state)
    }

    pub fn parent(&self, frame: FrameId) -> Option<Scope> {
        self.frames.get(frame.0 as usize).and_then(|r| r.parent)
    }

    pub fn name(&self, frame: FrameId) -> Option<&str> {
        self.frames.get(frame.0 as usize).map(|r| r.name.as_str())
    }

    /// Number of frames created so far, including the root.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Highest iteration reached in `frame`.
    pub fn iterations(&self, frame: FrameId) -> u64 {
        self.frames.get(frame.0 as usize).map(|r| r.iterations).unwrap_or(0)
    }

    pub fn mark_dead(&mut self, frame: FrameId) -> Result<(), SessionError> {
        self.record_mut(frame)?.dead = true;
        Ok(())
    }

    pub fn is_dead(&self, frame: FrameId) -> bool {
        self.frames.get(frame.0 as usize).is_some_and(|r| r.dead)
    }

    /// Ordering key that finishes one iteration (nested loops included)
    /// before the next one starts.
    pub fn scope_path(&self, scope: Scope) -> Vec<(FrameId, u64)> {
        if scope.frame == FrameId::ROOT {
            return Vec::new();
        }
        let mut path = self
            .frames
            .get(scope.frame.0 as usize)
            .map(|r| r.parent_path.clone())
            .unwrap_or_default();
        path.push((scope.frame, scope.iteration));
        path
    }

    /// An operation instance was scheduled in `frame`.
    pub fn track_instance(&mut self, frame: FrameId) {
        if let Some(r) = self.frames.get_mut(frame.0 as usize) {
            r.outstanding += 1;
        }
    }

    /// An operation instance in `frame` finished. Returns the loop-invariant
    /// variables that can be released now that the frame is done.
    pub fn finish_instance(&mut self, frame: FrameId) -> Vec<VariableId> {
        match self.frames.get_mut(frame.0 as usize) {
            Some(r) => {
                r.outstanding = r.outstanding.saturating_sub(1);
                if r.outstanding == 0 && r.state == FrameState::Closed {
                    std::mem::take(&mut r.invariants)
                } else {
                    Vec::new()
                }
            }
            None => Vec::new(),
        }
    }

    /// Hold a loop-invariant value until `frame` is done. Returns false if
    /// the frame is already done and the value can go immediately.
    pub fn hold_invariant(&mut self, frame: FrameId, var: VariableId) -> bool {
        match self.frames.get_mut(frame.0 as usize) {
            Some(r) if r.state == FrameState::Active || r.outstanding > 0 => {
                r.invariants.push(var);
                true
            }
            _ => false,
        }
    }

    /// Evaluate a `Switch` predicate. It must be a single element; Bool is
    /// taken as-is, numbers are true when non-zero.
    pub fn resolve_switch(op: &str, predicate: &DeviceTensor) -> Result<bool, SessionError> {
        if predicate.n_elements() != 1 {
            return Err(SessionError::shape(op, &[1], predicate.shape()));
        }
        let tensor = predicate.as_tensor();
        Ok(match tensor.storage() {
            TensorStorage::Bool(d) => d[0],
            _ => tensor.get_f32(0) != 0.0,
        })
    }

    /// Pick the `Merge` input to forward: the earliest-declared live input.
    pub fn resolve_merge(live: &[bool]) -> Option<usize> {
        live.iter().position(|&l| l)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Device;
    use crate::tensor::Tensor;

    fn dt(t: Tensor) -> DeviceTensor {
        DeviceTensor::new(t, Device::Cpu)
    }

    #[test]
    fn test_enter_creates_child_at_iteration_zero() {
        let mut fm = FrameManager::new();
        let f = fm.enter("while", Scope::ROOT).unwrap();
        assert_ne!(f, FrameId::ROOT);
        assert_eq!(fm.state(f), Some(FrameState::Active));
        assert_eq!(fm.parent(f), Some(Scope::ROOT));
        assert_eq!(fm.iterations(f), 0);
        // entering again from the same parent scope finds the same frame
        assert_eq!(fm.enter("while", Scope::ROOT).unwrap(), f);
    }

    #[test]
    fn test_nested_frames_per_outer_iteration() {
        let mut fm = FrameManager::new();
        let outer = fm.enter("outer", Scope::ROOT).unwrap();
        let inner0 = fm.enter("inner", Scope::new(outer, 0)).unwrap();
        let inner1 = fm.enter("inner", Scope::new(outer, 1)).unwrap();
        assert_ne!(inner0, inner1);
        assert_eq!(
            fm.scope_path(Scope::new(inner1, 2)),
            vec![(outer, 1), (inner1, 2)]
        );
        // outer iteration 0 (nested work included) sorts before outer iteration 1
        assert!(fm.scope_path(Scope::new(inner0, 7)) < fm.scope_path(Scope::new(outer, 1)));
        assert!(fm.scope_path(Scope::ROOT).is_empty());
    }

    #[test]
    fn test_next_iteration_and_exit() {
        let mut fm = FrameManager::new();
        let f = fm.enter("while", Scope::ROOT).unwrap();
        let s1 = fm.next_iteration(Scope::new(f, 0)).unwrap();
        let s2 = fm.next_iteration(s1).unwrap();
        assert_eq!(s2, Scope::new(f, 2));
        assert_eq!(fm.iterations(f), 2);
        assert_eq!(fm.exit(f).unwrap(), Scope::ROOT);
        assert_eq!(fm.state(f), Some(FrameState::Closed));
        // a second exit from the same frame still publishes to the parent
        assert_eq!(fm.exit(f).unwrap(), Scope::ROOT);
    }

    #[test]
    fn test_next_iteration_on_closed_frame_fails() {
        let mut fm = FrameManager::new();
        let f = fm.enter("while", Scope::ROOT).unwrap();
        fm.exit(f).unwrap();
        assert!(matches!(
            fm.next_iteration(Scope::new(f, 0)),
            Err(SessionError::FrameState(_))
        ));
    }

    #[test]
    fn test_root_frame_transitions_fail() {
        let mut fm = FrameManager::new();
        assert!(fm.next_iteration(Scope::ROOT).is_err());
        assert!(fm.exit(FrameId::ROOT).is_err());
    }

    #[test]
    fn test_invariants_released_when_closed_frame_drains() {
        let mut fm = FrameManager::new();
        let f = fm.enter("while", Scope::ROOT).unwrap();
        fm.track_instance(f);
        assert!(fm.hold_invariant(f, VariableId(3)));
        fm.exit(f).unwrap();
        assert_eq!(fm.finish_instance(f), vec![VariableId(3)]);
        // nothing left to hold once drained
        assert!(!fm.hold_invariant(f, VariableId(4)));
    }

    #[test]
    fn test_invariants_kept_while_active() {
        let mut fm = FrameManager::new();
        let f = fm.enter("while", Scope::ROOT).unwrap();
        fm.track_instance(f);
        fm.hold_invariant(f, VariableId(1));
        assert!(fm.finish_instance(f).is_empty());
    }

    #[test]
    fn test_dead_frames() {
        let mut fm = FrameManager::new();
        let f = fm.enter("while", Scope::ROOT).unwrap();
        assert!(!fm.is_dead(f));
        fm.mark_dead(f).unwrap();
        assert!(fm.is_dead(f));
    }

    #[test]
    fn test_resolve_switch() {
        assert!(FrameManager::resolve_switch("s", &dt(Tensor::scalar_bool(true))).unwrap());
        assert!(!FrameManager::resolve_switch("s", &dt(Tensor::scalar(0.0))).unwrap());
        assert!(FrameManager::resolve_switch("s", &dt(Tensor::from_i32(vec![1], vec![-2]))).unwrap());
        let err = FrameManager::resolve_switch("s", &dt(Tensor::zeros(&[2]))).unwrap_err();
        assert!(matches!(err, SessionError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_resolve_merge_prefers_earlier_input() {
        assert_eq!(FrameManager::resolve_merge(&[true, true]), Some(0));
        assert_eq!(FrameManager::resolve_merge(&[false, true]), Some(1));
        assert_eq!(FrameManager::resolve_merge(&[false, false]), None);
    }
}
