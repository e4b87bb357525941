//! Operation kinds and the kernels behind ordinary operations.
//!
//! Control-flow kinds (`Switch`, `Merge`, `Enter`, `Exit`, `NextIteration`)
//! and `Invoke` are interpreted by the executor. Everything else is a
//! [`Kernel`], which exposes shape inference and execution against a
//! [`ComputeBackend`] and never sees frames or bindings.

use std::sync::Arc;

use crate::backend::{ComputeBackend, DeviceTensor};
use crate::error::SessionError;
use crate::session::Value;
use crate::tensor::TensorDtype;

/// What an operation does.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// Ordinary computation.
    Kernel(Kernel),
    /// Inputs `[predicate, value]`. Outputs `[if_true, if_false]`; only one is live.
    Switch,
    /// Forwards the first live input. Dead only if every input is dead.
    Merge,
    /// Moves a value into the child frame `frame`. A constant enter makes the
    /// value visible to every iteration of that frame.
    Enter { frame: String, is_constant: bool },
    /// Publishes a value into the parent frame and closes the current one.
    Exit,
    /// Publishes a value into the next iteration of the current frame.
    NextIteration,
    /// Runs a named sub-graph from the session's function library.
    Invoke { function: String },
}

impl OpKind {
    /// Short kind name used in logs and error messages.
    pub fn name(&self) -> &str {
        match self {
            OpKind::Kernel(k) => k.name(),
            OpKind::Switch => "Switch",
            OpKind::Merge => "Merge",
            OpKind::Enter { .. } => "Enter",
            OpKind::Exit => "Exit",
            OpKind::NextIteration => "NextIteration",
            OpKind::Invoke { .. } => "Invoke",
        }
    }

    pub fn is_merge(&self) -> bool {
        matches!(self, OpKind::Merge)
    }

    pub fn is_next_iteration(&self) -> bool {
        matches!(self, OpKind::NextIteration)
    }

    /// Check declared input/output counts. Returns a description of the violation.
    pub(crate) fn check_arity(&self, n_inputs: usize, n_outputs: usize) -> Result<(), String> {
        let (inputs_ok, outputs_ok, expected) = match self {
            OpKind::Kernel(k) => match k.arity() {
                Some(n) => (n_inputs == n, n_outputs == 1, format!("{} input(s) and 1 output", n)),
                None => (n_inputs >= 1, n_outputs == 1, "at least 1 input and 1 output".to_string()),
            },
            OpKind::Switch => (n_inputs == 2, n_outputs == 2, "2 inputs and 2 outputs".to_string()),
            OpKind::Merge => (n_inputs >= 2, n_outputs == 1, "at least 2 inputs and 1 output".to_string()),
            OpKind::Enter { .. } | OpKind::Exit | OpKind::NextIteration => {
                (n_inputs == 1, n_outputs == 1, "1 input and 1 output".to_string())
            }
            OpKind::Invoke { .. } => (true, true, String::new()),
        };
        if inputs_ok && outputs_ok {
            Ok(())
        } else {
            Err(format!(
                "{} expects {}, got {} input(s) and {} output(s)",
                self.name(),
                expected,
                n_inputs,
                n_outputs
            ))
        }
    }
}

/// Ordinary operations. Parameters live inside the variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Kernel {
    Identity,
    Add,
    Sub,
    Mul,
    Div,
    MatMul,
    Neg,
    Relu,
    Gelu,
    Silu,
    Tanh,
    /// Softmax over the last dimension.
    Softmax,
    Scale(f32),
    AddScalar(f32),
    Less,
    Greater,
    Cast(TensorDtype),
    /// Sum of all elements, shape `[1]`.
    Sum,
    /// Build a list value from every input. No copy.
    Pack,
    /// Extract one element of a list value.
    ListGet { index: usize },
}

/// How a kernel produces its single output.
#[derive(Debug, Clone)]
pub enum OutputPlan {
    /// Acquire a fresh buffer and run the kernel into it.
    Alloc { shape: Vec<usize>, dtype: TensorDtype },
    /// Reuse an existing value without copying.
    Alias(Value),
}

fn array_input<'a>(op: &str, inputs: &'a [&Value], i: usize) -> Result<&'a Arc<DeviceTensor>, SessionError> {
    match inputs.get(i) {
        Some(Value::Array(t)) => Ok(t),
        Some(Value::List(_)) => Err(SessionError::integrity(format!(
            "'{}' expects an array at input {}, got a list",
            op, i
        ))),
        None => Err(SessionError::integrity(format!("'{}' is missing input {}", op, i))),
    }
}

fn require_dtype(op: &str, t: &DeviceTensor, expected: TensorDtype) -> Result<(), SessionError> {
    if t.dtype() != expected {
        return Err(SessionError::DTypeMismatch {
            op: op.to_string(),
            expected,
            actual: t.dtype(),
        });
    }
    Ok(())
}

/// Same shape, or either side a single element. Returns the output shape.
fn broadcast_shape(op: &str, a: &DeviceTensor, b: &DeviceTensor) -> Result<Vec<usize>, SessionError> {
    if a.shape() == b.shape() {
        Ok(a.shape().to_vec())
    } else if b.n_elements() == 1 {
        Ok(a.shape().to_vec())
    } else if a.n_elements() == 1 {
        Ok(b.shape().to_vec())
    } else {
        Err(SessionError::shape(op, a.shape(), b.shape()))
    }
}

impl Kernel {
    pub fn name(&self) -> &'static str {
        match self {
            Kernel::Identity => "Identity",
            Kernel::Add => "Add",
            Kernel::Sub => "Sub",
            Kernel::Mul => "Mul",
            Kernel::Div => "Div",
            Kernel::MatMul => "MatMul",
            Kernel::Neg => "Neg",
            Kernel::Relu => "Relu",
            Kernel::Gelu => "Gelu",
            Kernel::Silu => "Silu",
            Kernel::Tanh => "Tanh",
            Kernel::Softmax => "Softmax",
            Kernel::Scale(_) => "Scale",
            Kernel::AddScalar(_) => "AddScalar",
            Kernel::Less => "Less",
            Kernel::Greater => "Greater",
            Kernel::Cast(_) => "Cast",
            Kernel::Sum => "Sum",
            Kernel::Pack => "Pack",
            Kernel::ListGet { .. } => "ListGet",
        }
    }

    /// Fixed input count, or `None` for variadic kernels.
    pub fn arity(&self) -> Option<usize> {
        match self {
            Kernel::Add
            | Kernel::Sub
            | Kernel::Mul
            | Kernel::Div
            | Kernel::MatMul
            | Kernel::Less
            | Kernel::Greater => Some(2),
            Kernel::Pack => None,
            _ => Some(1),
        }
    }

    /// Shape inference. `op` names the operation for error messages.
    pub fn infer(&self, op: &str, inputs: &[&Value]) -> Result<OutputPlan, SessionError> {
        match self {
            Kernel::Identity => {
                let v = inputs
                    .first()
                    .ok_or_else(|| SessionError::integrity(format!("'{}' is missing input 0", op)))?;
                Ok(OutputPlan::Alias((*v).clone()))
            }
            Kernel::Add | Kernel::Sub | Kernel::Mul | Kernel::Div => {
                let a = array_input(op, inputs, 0)?;
                let b = array_input(op, inputs, 1)?;
                require_dtype(op, a, TensorDtype::F32)?;
                require_dtype(op, b, TensorDtype::F32)?;
                let shape = broadcast_shape(op, a, b)?;
                Ok(OutputPlan::Alloc {
                    shape,
                    dtype: TensorDtype::F32,
                })
            }
            Kernel::MatMul => {
                let a = array_input(op, inputs, 0)?;
                let b = array_input(op, inputs, 1)?;
                require_dtype(op, a, TensorDtype::F32)?;
                require_dtype(op, b, TensorDtype::F32)?;
                if a.shape().len() != 2 {
                    return Err(SessionError::shape(op, &[a.n_elements(), 1], a.shape()));
                }
                if b.shape().len() != 2 {
                    return Err(SessionError::shape(op, &[a.shape()[1], b.n_elements()], b.shape()));
                }
                let (m, k) = (a.shape()[0], a.shape()[1]);
                let (k2, n) = (b.shape()[0], b.shape()[1]);
                if k != k2 {
                    return Err(SessionError::shape(op, &[k, n], b.shape()));
                }
                Ok(OutputPlan::Alloc {
                    shape: vec![m, n],
                    dtype: TensorDtype::F32,
                })
            }
            Kernel::Neg
            | Kernel::Relu
            | Kernel::Gelu
            | Kernel::Silu
            | Kernel::Tanh
            | Kernel::Softmax
            | Kernel::Scale(_)
            | Kernel::AddScalar(_) => {
                let t = array_input(op, inputs, 0)?;
                require_dtype(op, t, TensorDtype::F32)?;
                if matches!(self, Kernel::Softmax) && t.shape().is_empty() {
                    return Err(SessionError::shape(op, &[1], t.shape()));
                }
                Ok(OutputPlan::Alloc {
                    shape: t.shape().to_vec(),
                    dtype: TensorDtype::F32,
                })
            }
            Kernel::Less | Kernel::Greater => {
                let a = array_input(op, inputs, 0)?;
                let b = array_input(op, inputs, 1)?;
                let shape = broadcast_shape(op, a, b)?;
                Ok(OutputPlan::Alloc {
                    shape,
                    dtype: TensorDtype::Bool,
                })
            }
            Kernel::Cast(dtype) => {
                let t = array_input(op, inputs, 0)?;
                if t.dtype() == *dtype {
                    return Ok(OutputPlan::Alias(Value::Array(Arc::clone(t))));
                }
                Ok(OutputPlan::Alloc {
                    shape: t.shape().to_vec(),
                    dtype: *dtype,
                })
            }
            Kernel::Sum => {
                let t = array_input(op, inputs, 0)?;
                require_dtype(op, t, TensorDtype::F32)?;
                Ok(OutputPlan::Alloc {
                    shape: vec![1],
                    dtype: TensorDtype::F32,
                })
            }
            Kernel::Pack => {
                let items = (0..inputs.len())
                    .map(|i| array_input(op, inputs, i).map(Arc::clone))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(OutputPlan::Alias(Value::List(items)))
            }
            Kernel::ListGet { index } => match inputs.first() {
                Some(Value::List(items)) => items
                    .get(*index)
                    .map(|t| OutputPlan::Alias(Value::Array(Arc::clone(t))))
                    .ok_or_else(|| {
                        SessionError::integrity(format!(
                            "'{}' index {} out of range for list of {}",
                            op,
                            index,
                            items.len()
                        ))
                    }),
                Some(Value::Array(_)) => Err(SessionError::integrity(format!(
                    "'{}' expects a list, got an array",
                    op
                ))),
                None => Err(SessionError::integrity(format!("'{}' is missing input 0", op))),
            },
        }
    }

    /// Run the kernel into `out`, which was acquired per [`OutputPlan::Alloc`].
    pub fn execute(
        &self,
        backend: &dyn ComputeBackend,
        inputs: &[&DeviceTensor],
        out: &mut DeviceTensor,
    ) -> Result<(), SessionError> {
        let input = |i: usize| {
            inputs
                .get(i)
                .copied()
                .ok_or_else(|| SessionError::Backend(format!("{} is missing input {}", self.name(), i)))
        };
        match self {
            Kernel::Add => backend.add(input(0)?, input(1)?, out),
            Kernel::Sub => backend.sub(input(0)?, input(1)?, out),
            Kernel::Mul => backend.mul(input(0)?, input(1)?, out),
            Kernel::Div => backend.div(input(0)?, input(1)?, out),
            Kernel::MatMul => backend.matmul(input(0)?, input(1)?, out),
            Kernel::Neg => backend.neg(input(0)?, out),
            Kernel::Relu => backend.relu(input(0)?, out),
            Kernel::Gelu => backend.gelu(input(0)?, out),
            Kernel::Silu => backend.silu(input(0)?, out),
            Kernel::Tanh => backend.tanh(input(0)?, out),
            Kernel::Softmax => backend.softmax(input(0)?, out),
            Kernel::Scale(factor) => backend.scale(input(0)?, *factor, out),
            Kernel::AddScalar(value) => backend.add_scalar(input(0)?, *value, out),
            Kernel::Less => backend.less(input(0)?, input(1)?, out),
            Kernel::Greater => backend.greater(input(0)?, input(1)?, out),
            Kernel::Cast(_) => backend.cast(input(0)?, out),
            Kernel::Sum => backend.sum(input(0)?, out),
            Kernel::Identity | Kernel::Pack | Kernel::ListGet { .. } => {
                return Err(SessionError::Backend(format!(
                    "{} forwards its input and has no kernel",
                    self.name()
                )))
            }
        }
        Ok(())
    }
}
