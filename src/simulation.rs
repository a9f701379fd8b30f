use crate::session::{AnimalConfig, SessionConfig};
use anyhow::Context;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use trialbench_behavior::{EventDispatch, Request, TrialStateMachine, TrialType};
use trialbench_core::{ActionRegistry, Edge, Setting, TrialResult, TrialScore, TrialState};
use trialbench_output::{Engine, EpochOutput, SimulatedEngine};
use trialbench_timing::{ManualTimer, Timer};

const STEPS_PER_SECOND: f64 = 100.0;
/// Simulated seconds allowed per requested trial before giving up.
const SECONDS_PER_TRIAL_LIMIT: f64 = 60.0;

/// Scripted subject: pokes whenever a trial can start, and answers the
/// response window with the configured probabilities.
struct Animal {
    config: AnimalConfig,
    rng: StdRng,
    pending: Vec<(f64, Edge, String)>,
    last_state: TrialState,
}

impl Animal {
    fn new(config: AnimalConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            rng,
            pending: Vec::new(),
            last_state: TrialState::WaitingForNpStart,
        }
    }

    fn schedule(&mut self, at: f64, edge: Edge, channel: String) {
        self.pending.push((at, edge, channel));
        self.pending.sort_by(|a, b| a.0.total_cmp(&b.0));
    }

    fn observe(&mut self, now: f64, state: TrialState, trial_type: Option<TrialType>) {
        let entered = state != self.last_state;
        self.last_state = state;
        match state {
            TrialState::WaitingForNpStart if self.pending.is_empty() => {
                let poke = now + self.rng.random_range(0.05..self.config.max_wait.max(0.1));
                let hold = if self.rng.random::<f64>() < self.config.p_early {
                    0.05
                } else {
                    self.config.poke_hold
                };
                let channel = self.config.np_channel.clone();
                self.schedule(poke, Edge::Rising, channel.clone());
                self.schedule(poke + hold, Edge::Falling, channel);
            }
            TrialState::WaitingForResponse if entered => {
                let p = match trial_type {
                    Some(t) if t.is_go() => self.config.p_hit,
                    _ => self.config.p_fa,
                };
                if self.rng.random::<f64>() < p {
                    let contact = now + self.config.reaction_time;
                    let channel = self.config.reward_channel.clone();
                    self.schedule(contact, Edge::Rising, channel.clone());
                    self.schedule(contact + 0.05, Edge::Falling, channel);
                }
            }
            _ => {}
        }
    }

    fn due(&mut self, now: f64) -> Vec<(Edge, String)> {
        let split = self.pending.partition_point(|(at, _, _)| *at <= now);
        self.pending
            .drain(..split)
            .map(|(_, edge, channel)| (edge, channel))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub results: Vec<TrialResult>,
    pub hits: usize,
    pub misses: usize,
    pub false_alarms: usize,
    pub correct_rejects: usize,
    pub mean_response_time: Option<f64>,
}

impl Summary {
    pub fn from_results(results: Vec<TrialResult>) -> Self {
        let count = |score: TrialScore| results.iter().filter(|r| r.score == score).count();
        let times: Vec<f64> = results
            .iter()
            .map(|r| r.response_time)
            .filter(|t| t.is_finite())
            .collect();
        Self {
            hits: count(TrialScore::Hit),
            misses: count(TrialScore::Miss),
            false_alarms: count(TrialScore::FalseAlarm),
            correct_rejects: count(TrialScore::CorrectReject),
            mean_response_time: (!times.is_empty())
                .then(|| times.iter().sum::<f64>() / times.len() as f64),
            results,
        }
    }

    fn rate(a: usize, b: usize) -> f64 {
        if a + b == 0 {
            0.0
        } else {
            a as f64 / (a + b) as f64 * 100.0
        }
    }

    pub fn print(&self) {
        println!("Session Results:");
        println!(
            "Trials: {}, Hit rate: {:.1}%, False alarm rate: {:.1}%",
            self.results.len(),
            Self::rate(self.hits, self.misses),
            Self::rate(self.false_alarms, self.correct_rejects)
        );
        match self.mean_response_time {
            Some(t) => println!("Response time: mean {:.3} s", t),
            None => println!("Response time: no responses"),
        }
    }
}

/// Runs a complete session on a simulated clock.
pub fn run(config: &SessionConfig) -> anyhow::Result<Summary> {
    let timer = ManualTimer::new();
    let engine = Arc::new(
        SimulatedEngine::new(config.output.engine.clone(), config.fs, timer.clone())
            .with_min_lead(config.min_lead)
            .with_channel(config.output.channel.clone(), config.output.buffer_size),
    );
    let calibration = config
        .calibration
        .build()
        .context("invalid calibration")?;
    let output = EpochOutput::new(config.output.clone(), config.block.clone(), calibration)
        .context("invalid output block")?;
    let output = Arc::new(Mutex::new(output));

    let lead_samples = (config.buffer_lead * config.fs).round() as usize;
    output.lock().write_next(engine.as_ref(), lead_samples)?;
    engine.start();

    let mut registry = ActionRegistry::new();
    {
        let output = output.clone();
        registry.register_command("prepare_target", move |call, _| {
            output.lock().prepare_setting(&call.kwargs)?;
            Ok(())
        });
    }
    {
        let output = output.clone();
        let engine = engine.clone();
        registry.register_command("start_target", move |_, follow_ups| {
            let offset = engine.earliest_offset();
            output.lock().activate(engine.as_ref(), offset, follow_ups)?;
            Ok(())
        });
    }
    registry.register_command("deliver_reward", |call, _| {
        debug!(ts = ?call.timestamp, "reward delivered");
        Ok(())
    });
    registry.register_action("trial_prepare", "prepare_target", Setting::new(), 0)?;
    registry.register_action("trial_start", "start_target", Setting::new(), 0)?;
    registry.register_action("deliver_reward", "deliver_reward", Setting::new(), 0)?;

    let event_map = config.behavior.event_map();
    let mut machine = TrialStateMachine::seeded(
        config.behavior.clone(),
        config.context(),
        registry,
        timer.clone(),
    );
    machine.start_experiment()?;
    let (mut dispatch, sender) = EventDispatch::new(machine, event_map);
    let mut animal = Animal::new(config.animal.clone());

    let step_samples = (config.fs / STEPS_PER_SECOND).round() as usize;
    let limit = config.trials as f64 * SECONDS_PER_TRIAL_LIMIT;
    let mut step: u64 = 0;
    while dispatch.machine().results().len() < config.trials {
        step += 1;
        let now = step as f64 / STEPS_PER_SECOND;
        if now > limit {
            warn!(now, trials = dispatch.machine().results().len(), "session ran out of time");
            break;
        }
        timer.set(now);
        output.lock().write_next(engine.as_ref(), step_samples)?;
        for (edge, channel) in animal.due(now) {
            sender.send_edge(edge, channel, Some(now))?;
        }
        if dispatch.process_pending()? {
            break;
        }
        let machine = dispatch.machine();
        animal.observe(now, machine.trial_state(), machine.trial_type());
    }

    sender.request(Request::Stop)?;
    dispatch.process_pending()?;
    info!(seconds = timer.now(), "session finished");
    let results = dispatch.into_machine().results().to_vec();
    Ok(Summary::from_results(results))
}

pub fn save_results(path: &Path, results: &[TrialResult]) -> anyhow::Result<()> {
    let file = File::create(path)
        .with_context(|| format!("cannot create result file {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), results)
        .with_context(|| format!("failed to write results to {}", path.display()))?;
    Ok(())
}
