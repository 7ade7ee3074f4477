//! Workflow instance model: states, inputs, decisions and the generator seam.

mod generator;
mod input;
mod instance;
mod signal;
mod state;

pub use generator::{DraftGenerator, GenerationError};
pub use input::{WorkflowInput, WorkflowKind, MAX_FIELD_CHARS};
pub use instance::{DraftResult, InstanceUpdate, WorkflowInstance};
pub use signal::Decision;
pub use state::WorkflowState;
