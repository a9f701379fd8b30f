use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use trialbench_behavior::BehaviorConfig;
use trialbench_core::{MemoryContext, Order, Selector, Setting, Value};
use trialbench_output::OutputConfig;
use trialbench_signal::{Block, CalibrationSpec, FactoryKind};

/// How the simulated animal behaves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnimalConfig {
    pub seed: u64,
    /// Probability of licking the spout on a go trial.
    pub p_hit: f64,
    /// Probability of licking the spout on a nogo trial.
    pub p_fa: f64,
    /// Probability of leaving the poke well before the trial starts.
    pub p_early: f64,
    /// Seconds a full poke is held.
    pub poke_hold: f64,
    /// Seconds from the response window opening to spout contact.
    pub reaction_time: f64,
    /// Longest wait before poking again once a trial can start.
    pub max_wait: f64,
    pub np_channel: String,
    pub reward_channel: String,
}

impl Default for AnimalConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            p_hit: 0.85,
            p_fa: 0.2,
            p_early: 0.1,
            poke_hold: 0.4,
            reaction_time: 0.35,
            max_wait: 1.0,
            np_channel: "np".into(),
            reward_channel: "reward".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Engine sample rate.
    pub fs: f64,
    /// Samples ahead of the playback position that can no longer be rewritten.
    pub min_lead: u64,
    /// Seconds of samples kept queued ahead of playback.
    pub buffer_lead: f64,
    pub output: OutputConfig,
    pub block: Block,
    pub calibration: CalibrationSpec,
    pub parameters: BTreeMap<String, Value>,
    pub selectors: BTreeMap<String, Selector>,
    pub behavior: BehaviorConfig,
    /// Trials to run before the session stops.
    pub trials: usize,
    pub animal: AnimalConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let fs = 10_000.0;
        let parameters = [
            ("np_duration", Value::from(0.2)),
            ("hold_duration", Value::from(0.1)),
            ("response_duration", Value::from(1.5)),
            ("to_duration", Value::from(1.0)),
            ("iti_duration", Value::from(0.5)),
            ("remind_trials", Value::from(3)),
            ("warmup_trials", Value::from(2)),
            ("go_probability", Value::from(0.5)),
            ("max_nogo", Value::from(3)),
            ("repeat_fa", Value::from(true)),
            ("target_envelope_rise_time", Value::from(0.005)),
            ("target_envelope_duration", Value::from(0.1)),
            ("target_tone_frequency", Value::from(1000.0)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let level = |db: f64| Setting::new().with("target_tone_level", db);
        let selectors = [
            ("remind", Selector::with_settings(Order::Exact, [level(0.0)])),
            (
                "go",
                Selector::with_settings(Order::Shuffled(1), [level(-10.0), level(-20.0), level(-30.0)]),
            ),
            ("nogo", Selector::with_settings(Order::Exact, [level(-400.0)])),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            fs,
            min_lead: 50,
            buffer_lead: 0.2,
            output: OutputConfig {
                name: "target".into(),
                channel: "speaker".into(),
                engine: "NI".into(),
                fs,
                filter_delay: 0.0,
                buffer_size: 10.0,
            },
            block: Block::new(FactoryKind::Cos2Envelope, "envelope_")
                .with_input(Block::new(FactoryKind::Tone, "tone_")),
            calibration: CalibrationSpec::Attenuation,
            parameters,
            selectors,
            behavior: BehaviorConfig::default(),
            trials: 20,
            animal: AnimalConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read session config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("invalid session config {}", path.display()))
    }

    pub fn context(&self) -> MemoryContext {
        let mut context = MemoryContext::new();
        for (name, value) in &self.parameters {
            context.set_parameter(name.clone(), value.clone());
        }
        for (name, selector) in &self.selectors {
            context.add_selector(name.clone(), selector.clone());
        }
        context
    }
}
