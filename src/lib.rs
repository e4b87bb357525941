pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod frame;
pub mod graph;
pub mod invoke;
pub mod memory;
pub mod session;
pub mod tensor;

pub use backend::select_backend;
pub use config::SessionConfig;
pub use error::SessionError;
pub use graph::{Graph, GraphBuilder, Kernel, OpKind, OperationSpec};
pub use invoke::{FunctionLibrary, RecursionContext};
pub use memory::MemoryManager;
pub use session::{CancellationToken, ExecutionResult, OutputValue, Session};
pub use tensor::{Tensor, TensorDtype};
