use serde::{Deserialize, Serialize};
use trialbench_core::{ContextError, ContextStore, EventMap, EventMapping};

/// Duration of a trial timer: a literal number of seconds, or the name of a
/// context parameter looked up each time the timer starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimerDuration {
    Seconds(f64),
    Parameter(String),
}

impl TimerDuration {
    pub fn parameter(name: impl Into<String>) -> Self {
        TimerDuration::Parameter(name.into())
    }

    pub fn resolve<C: ContextStore + ?Sized>(&self, context: &C) -> Result<f64, ContextError> {
        match self {
            TimerDuration::Seconds(s) => Ok(*s),
            TimerDuration::Parameter(name) => context.get_f64(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Seeds the trial-type generator once per configuration.
    pub seed: u64,
    pub event_map: Vec<EventMapping>,
    pub np_duration: TimerDuration,
    pub hold_duration: TimerDuration,
    pub response_duration: TimerDuration,
    pub to_duration: TimerDuration,
    pub iti_duration: TimerDuration,
    /// Let a poke held across the end of the ITI count towards the next trial.
    pub carry_over_poke: bool,
}

impl BehaviorConfig {
    pub fn event_map(&self) -> EventMap {
        self.event_map.iter().cloned().collect()
    }
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            event_map: EventMap::digital("np", "reward").mappings(),
            np_duration: TimerDuration::parameter("np_duration"),
            hold_duration: TimerDuration::parameter("hold_duration"),
            response_duration: TimerDuration::parameter("response_duration"),
            to_duration: TimerDuration::parameter("to_duration"),
            iti_duration: TimerDuration::parameter("iti_duration"),
            carry_over_poke: true,
        }
    }
}
