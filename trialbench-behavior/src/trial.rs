use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of trial chosen by the selector policy. Each maps onto the context
/// selector that supplies its stimulus setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialType {
    GoRemind,
    GoManual,
    GoWarmup,
    NogoWarmup,
    GoForced,
    NogoRepeat,
    Go,
    Nogo,
}

impl TrialType {
    pub fn name(&self) -> &'static str {
        match self {
            TrialType::GoRemind => "go_remind",
            TrialType::GoManual => "go_manual",
            TrialType::GoWarmup => "go_warmup",
            TrialType::NogoWarmup => "nogo_warmup",
            TrialType::GoForced => "go_forced",
            TrialType::NogoRepeat => "nogo_repeat",
            TrialType::Go => "go",
            TrialType::Nogo => "nogo",
        }
    }

    /// Context selector the next setting is drawn from.
    pub fn selector(&self) -> &'static str {
        match self {
            TrialType::GoRemind | TrialType::GoManual | TrialType::GoWarmup => "remind",
            TrialType::GoForced | TrialType::Go => "go",
            TrialType::NogoWarmup | TrialType::NogoRepeat | TrialType::Nogo => "nogo",
        }
    }

    pub fn is_go(&self) -> bool {
        self.name().starts_with("go")
    }
}

impl fmt::Display for TrialType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Timestamps collected while a trial is in progress.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrialInfo {
    pub np_start: Option<f64>,
    pub np_end: Option<f64>,
    pub trial_start: Option<f64>,
    pub response_start: Option<f64>,
    pub response_ts: Option<f64>,
}

impl TrialInfo {
    /// `response_ts - trial_start`, NaN if either is missing.
    pub fn response_time(&self) -> f64 {
        difference(self.response_ts, self.trial_start)
    }

    /// `np_end - np_start`, NaN if either is missing.
    pub fn reaction_time(&self) -> f64 {
        difference(self.np_end, self.np_start)
    }

    /// Records the first withdrawal only.
    pub fn record_np_end(&mut self, ts: f64) {
        self.np_end.get_or_insert(ts);
    }

    pub fn clear(&mut self) {
        *self = TrialInfo::default();
    }
}

fn difference(a: Option<f64>, b: Option<f64>) -> f64 {
    match (a, b) {
        (Some(a), Some(b)) => a - b,
        _ => f64::NAN,
    }
}
