use thiserror::Error;
use trialbench_core::{ActionError, ContextError, HardwareError};
use trialbench_signal::{FactoryError, QueueError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OutputError {
    #[error(transparent)]
    Hardware(#[from] HardwareError),
    #[error(transparent)]
    Factory(#[from] FactoryError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Action(#[from] ActionError),
    /// `activate` was called before anything was prepared.
    #[error("output {0} has nothing prepared")]
    NotReady(String),
    #[error("output {name} asked for samples from {offset} but its buffer covers {lb}..{ub}")]
    OffsetMismatch {
        name: String,
        offset: u64,
        lb: u64,
        ub: u64,
    },
    #[error("output {output} is bound to engine {engine}, which is not in this group")]
    UnknownEngine { output: String, engine: String },
}

impl OutputError {
    pub fn is_buffer_underrun(&self) -> bool {
        matches!(self, OutputError::Hardware(HardwareError::BufferUnderrun { .. }))
    }
}

impl From<OutputError> for ActionError {
    fn from(e: OutputError) -> Self {
        match e {
            OutputError::Hardware(e) => ActionError::Hardware(e),
            OutputError::Context(e) => ActionError::Context(e),
            OutputError::Action(e) => e,
            other => ActionError::command("output", other),
        }
    }
}
