use crate::value::Value;
use thiserror::Error;

/// Failures reported by a hardware engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HardwareError {
    /// Not enough lead time to write at the requested offset.
    #[error("buffer underrun on {channel}: offset {offset} is before the earliest writable sample {earliest}")]
    BufferUnderrun {
        channel: String,
        offset: u64,
        earliest: u64,
    },
    #[error("unknown channel {0}")]
    UnknownChannel(String),
    #[error("write at {offset} on {channel} does not line up with the buffered upper bound {upper_bound}")]
    OffsetMismatch {
        channel: String,
        offset: u64,
        upper_bound: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ContextError {
    #[error("unknown parameter {0}")]
    UnknownParameter(String),
    #[error("unknown selector {0}")]
    UnknownSelector(String),
    #[error("selector {0} has no settings")]
    EmptySelector(String),
    #[error("parameter {name} should be {expected} but is {found:?}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        found: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActionError {
    #[error(transparent)]
    Hardware(#[from] HardwareError),
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("no handler registered for command {0}")]
    UnknownCommand(String),
    #[error("invalid action expression {0:?}")]
    InvalidExpression(String),
    #[error("command {command} failed: {message}")]
    Command { command: String, message: String },
}

impl ActionError {
    pub fn command(command: impl Into<String>, message: impl ToString) -> Self {
        ActionError::Command {
            command: command.into(),
            message: message.to_string(),
        }
    }

    pub fn is_buffer_underrun(&self) -> bool {
        matches!(self, ActionError::Hardware(HardwareError::BufferUnderrun { .. }))
    }
}
