pub mod action;
pub mod context;
pub mod error;
pub mod event;
pub mod experiment;
pub mod trial;
pub mod value;

pub use action::{
    ActionCall, ActionDispatcher, ActionRegistry, CommandHandler, Condition, FollowUp, FollowUps,
    EVENT_LOG_LIMIT, EXPERIMENT_EVENT,
};
pub use context::{ContextStore, MemoryContext, Order, Selector};
pub use error::{ActionError, ContextError, HardwareError};
pub use event::{Edge, Event, EventMap, EventMapping};
pub use experiment::ExperimentState;
pub use trial::{Response, TrialResult, TrialScore, TrialState};
pub use value::{Setting, SettingKey, Value};
