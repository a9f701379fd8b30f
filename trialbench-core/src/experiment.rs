use serde::{Deserialize, Serialize};

/// Lifecycle of an experiment session.
#[derive(Copy, Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentState {
    #[default]
    Initialized,
    Running,
    Paused,
    Stopped,
}

impl ExperimentState {
    /// Whether hardware and timer events should reach the trial logic.
    pub fn accepts_events(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}
