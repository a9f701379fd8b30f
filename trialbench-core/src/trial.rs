use crate::value::Setting;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Trial state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialState {
    WaitingForResume,
    WaitingForNpStart,
    WaitingForNpDuration,
    WaitingForHoldPeriod,
    WaitingForResponse,
    WaitingForReward,
    WaitingForTo,
    WaitingForIti,
}

impl TrialState {
    pub fn name(&self) -> &'static str {
        match self {
            TrialState::WaitingForResume => "waiting_for_resume",
            TrialState::WaitingForNpStart => "waiting_for_np_start",
            TrialState::WaitingForNpDuration => "waiting_for_np_duration",
            TrialState::WaitingForHoldPeriod => "waiting_for_hold_period",
            TrialState::WaitingForResponse => "waiting_for_response",
            TrialState::WaitingForReward => "waiting_for_reward",
            TrialState::WaitingForTo => "waiting_for_to",
            TrialState::WaitingForIti => "waiting_for_iti",
        }
    }
}

impl fmt::Display for TrialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the animal did in the response window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Response {
    #[serde(rename = "poke")]
    Poke,
    #[serde(rename = "reward")]
    Reward,
    #[serde(rename = "no response")]
    NoResponse,
}

impl Response {
    pub fn name(&self) -> &'static str {
        match self {
            Response::Poke => "poke",
            Response::Reward => "reward",
            Response::NoResponse => "no response",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialScore {
    Hit,
    Miss,
    CorrectReject,
    FalseAlarm,
}

impl TrialScore {
    /// Scores a response against the trial type. Only the text before the
    /// first `_` of the trial type matters (`go_remind` scores as `go`).
    /// Returns `None` for a trial type that is neither go nor nogo.
    pub fn from_response(trial_type: &str, response: Response) -> Option<Self> {
        let prefix = trial_type.split('_').next().unwrap_or_default();
        let score = match (prefix, response) {
            ("go", Response::Reward) => TrialScore::Hit,
            ("go", Response::Poke) | ("go", Response::NoResponse) => TrialScore::Miss,
            ("nogo", Response::Reward) => TrialScore::FalseAlarm,
            ("nogo", Response::Poke) | ("nogo", Response::NoResponse) => {
                TrialScore::CorrectReject
            }
            _ => return None,
        };
        Some(score)
    }

    pub fn is_correct(&self) -> bool {
        matches!(self, TrialScore::Hit | TrialScore::CorrectReject)
    }

    pub fn name(&self) -> &'static str {
        match self {
            TrialScore::Hit => "hit",
            TrialScore::Miss => "miss",
            TrialScore::CorrectReject => "correct_reject",
            TrialScore::FalseAlarm => "false_alarm",
        }
    }
}

impl fmt::Display for TrialScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Recorded result per trial
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialResult {
    pub trial: usize,
    pub trial_type: String,
    pub response: Response,
    pub score: TrialScore,
    pub correct: bool,
    pub np_start: Option<f64>,
    pub np_end: Option<f64>,
    pub trial_start: Option<f64>,
    pub response_start: Option<f64>,
    pub response_ts: Option<f64>,
    #[serde(with = "nan_as_null")]
    pub response_time: f64,
    #[serde(with = "nan_as_null")]
    pub reaction_time: f64,
    pub setting: Setting,
}

impl TrialResult {
    /// Flattens the result into a plain mapping: the trial's setting plus
    /// one entry per outcome field. Missing timestamps are left out.
    pub fn to_setting(&self) -> Setting {
        let mut out = self.setting.clone();
        out.insert("trial", self.trial);
        out.insert("trial_type", self.trial_type.as_str());
        out.insert("response", self.response.name());
        out.insert("score", self.score.name());
        out.insert("correct", self.correct);
        let stamps = [
            ("np_start", self.np_start),
            ("np_end", self.np_end),
            ("trial_start", self.trial_start),
            ("response_start", self.response_start),
            ("response_ts", self.response_ts),
        ];
        for (name, ts) in stamps {
            if let Some(ts) = ts {
                out.insert(name, ts);
            }
        }
        out.insert("response_time", self.response_time);
        out.insert("reaction_time", self.reaction_time);
        out
    }
}

mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
        if v.is_nan() {
            s.serialize_none()
        } else {
            s.serialize_some(v)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(d)?.unwrap_or(f64::NAN))
    }
}

#[cfg(test)]
mod tests {
    use super::{Response, TrialResult, TrialScore};
    use crate::value::Setting;

    #[test]
    /// Test the fixed scoring table.
    fn test_score_lookup() {
        use Response::*;
        use TrialScore::*;
        assert_eq!(TrialScore::from_response("go", Reward), Some(Hit));
        assert_eq!(TrialScore::from_response("go_remind", Reward), Some(Hit));
        assert_eq!(TrialScore::from_response("go", Poke), Some(Miss));
        assert_eq!(TrialScore::from_response("go_warmup", NoResponse), Some(Miss));
        assert_eq!(TrialScore::from_response("nogo", Reward), Some(FalseAlarm));
        assert_eq!(TrialScore::from_response("nogo_repeat", Poke), Some(CorrectReject));
        assert_eq!(TrialScore::from_response("nogo", NoResponse), Some(CorrectReject));
        assert_eq!(TrialScore::from_response("catch", Reward), None);
    }

    #[test]
    /// Test that NaN times survive a JSON round trip as null.
    fn test_result_nan_times_serialize_as_null() {
        let result = TrialResult {
            trial: 3,
            trial_type: "go".into(),
            response: Response::NoResponse,
            score: TrialScore::Miss,
            correct: false,
            np_start: Some(1.0),
            np_end: None,
            trial_start: Some(1.2),
            response_start: Some(1.5),
            response_ts: None,
            response_time: f64::NAN,
            reaction_time: f64::NAN,
            setting: Setting::new().with("level", 60.0),
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"response_time\":null"));
        assert!(json.contains("\"response\":\"no response\""));
        let back: TrialResult = serde_json::from_str(&json).unwrap();
        assert!(back.response_time.is_nan());
        assert_eq!(back.trial, 3);

        let flat = result.to_setting();
        assert_eq!(flat.get("score").and_then(|v| v.as_str()), Some("miss"));
        assert!(!flat.contains("np_end"));
    }
}
