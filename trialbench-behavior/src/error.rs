use thiserror::Error;
use trialbench_core::{ActionError, ContextError, ExperimentState};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BehaviorError {
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error("trial type {0} cannot be scored")]
    UnscoredTrialType(String),
    #[error("cannot {request} while the experiment is {state:?}")]
    Lifecycle {
        state: ExperimentState,
        request: &'static str,
    },
    #[error("event channel closed")]
    Disconnected,
}

impl BehaviorError {
    /// Configuration problems that should stop the session. Everything else
    /// only spoils the event that raised it.
    pub fn is_fatal(&self) -> bool {
        match self {
            BehaviorError::Context(_) | BehaviorError::UnscoredTrialType(_) => true,
            BehaviorError::Action(ActionError::Context(_))
            | BehaviorError::Action(ActionError::UnknownCommand(_))
            | BehaviorError::Action(ActionError::InvalidExpression(_)) => true,
            BehaviorError::Action(_) | BehaviorError::Lifecycle { .. } => false,
            BehaviorError::Disconnected => true,
        }
    }
}
