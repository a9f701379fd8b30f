//! Go/nogo trial logic: the trial state machine, its selection policy and
//! the serialized worker that feeds it hardware edges.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod state;
pub mod trial;

pub use config::{BehaviorConfig, TimerDuration};
pub use dispatch::{DispatchMessage, EventDispatch, EventSender, Request};
pub use error::BehaviorError;
pub use state::TrialStateMachine;
pub use trial::{TrialInfo, TrialType};
