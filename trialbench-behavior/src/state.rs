use crate::config::BehaviorConfig;
use crate::error::BehaviorError;
use crate::trial::{TrialInfo, TrialType};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info, trace, warn};
use trialbench_core::{
    ActionDispatcher, ContextError, ContextStore, Event, ExperimentState, Response, TrialResult,
    TrialScore, TrialState,
};
use trialbench_timing::{Timer, TimerQueue};

const EVENT_TIMER: &str = "event";

fn or_default<V>(result: Result<V, ContextError>, default: V) -> Result<V, ContextError> {
    match result {
        Err(ContextError::UnknownParameter(_)) => Ok(default),
        other => other,
    }
}

/// Go/nogo behavioral paradigm: nose-poke to start a trial, hold, then
/// respond at the reward spout or withhold.
///
/// Events are handled one at a time to completion. Timers never call back
/// into the machine; they are collected by [`poll`](Self::poll) on the
/// caller's thread.
pub struct TrialStateMachine<C, D, T, R>
where
    C: ContextStore,
    D: ActionDispatcher,
    T: Timer,
    R: Rng,
{
    pub config: BehaviorConfig,
    context: C,
    dispatcher: D,
    timer: T,
    rng: R,
    timers: TimerQueue<Event>,
    experiment_state: ExperimentState,
    trial_state: TrialState,
    trial_info: TrialInfo,
    trial: usize,
    trial_type: Option<TrialType>,
    consecutive_nogo: usize,
    prior_score: Option<TrialScore>,
    pause_requested: bool,
    remind_requested: bool,
    apply_requested: bool,
    results: Vec<TrialResult>,
}

impl<C, D, T> TrialStateMachine<C, D, T, StdRng>
where
    C: ContextStore,
    D: ActionDispatcher,
    T: Timer,
{
    /// Seeds the trial-type generator from `config.seed`.
    pub fn seeded(config: BehaviorConfig, context: C, dispatcher: D, timer: T) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self::new(config, context, dispatcher, timer, rng)
    }
}

impl<C, D, T, R> TrialStateMachine<C, D, T, R>
where
    C: ContextStore,
    D: ActionDispatcher,
    T: Timer,
    R: Rng,
{
    pub fn new(config: BehaviorConfig, context: C, dispatcher: D, timer: T, rng: R) -> Self {
        Self {
            config,
            context,
            dispatcher,
            timer,
            rng,
            timers: TimerQueue::new(),
            experiment_state: ExperimentState::Initialized,
            trial_state: TrialState::WaitingForNpStart,
            trial_info: TrialInfo::default(),
            trial: 1,
            trial_type: None,
            consecutive_nogo: 0,
            prior_score: None,
            pause_requested: false,
            remind_requested: false,
            apply_requested: false,
            results: Vec::new(),
        }
    }

    pub fn get_ts(&self) -> f64 {
        self.timer.now()
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut D {
        &mut self.dispatcher
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    pub fn experiment_state(&self) -> ExperimentState {
        self.experiment_state
    }

    pub fn trial_state(&self) -> TrialState {
        self.trial_state
    }

    pub fn trial_info(&self) -> &TrialInfo {
        &self.trial_info
    }

    /// Number of the trial being prepared or run, starting at 1.
    pub fn trial(&self) -> usize {
        self.trial
    }

    pub fn trial_type(&self) -> Option<TrialType> {
        self.trial_type
    }

    pub fn consecutive_nogo(&self) -> usize {
        self.consecutive_nogo
    }

    pub fn is_pause_requested(&self) -> bool {
        self.pause_requested
    }

    pub fn results(&self) -> &[TrialResult] {
        &self.results
    }

    /// Trial-state timer currently pending, with its due time.
    pub fn pending_timer(&self) -> Option<(Event, f64)> {
        self.timers.get(EVENT_TIMER).map(|d| (d.payload, d.due))
    }

    /// Earliest time at which [`poll`](Self::poll) has work to do.
    pub fn next_deadline(&self) -> Option<f64> {
        match (self.timers.next_due(), self.dispatcher.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn transition(&mut self, next: TrialState) {
        if next != self.trial_state {
            debug!(trial = self.trial, from = %self.trial_state, to = %next, "trial state");
        }
        self.trial_state = next;
    }

    fn invoke(&mut self, event: &str, ts: f64) -> Result<(), BehaviorError> {
        self.dispatcher.invoke(event, Some(ts))?;
        Ok(())
    }

    fn start_event_timer(&mut self, seconds: f64, event: Event, ts: f64) {
        trace!(%event, seconds, "starting event timer");
        self.timers.start(EVENT_TIMER, ts + seconds, event);
    }

    fn stop_event_timer(&mut self) {
        if let Some(event) = self.timers.stop(EVENT_TIMER) {
            trace!(%event, "stopped event timer");
        }
    }

    pub fn start_experiment(&mut self) -> Result<(), BehaviorError> {
        if self.experiment_state != ExperimentState::Initialized {
            return Err(BehaviorError::Lifecycle {
                state: self.experiment_state,
                request: "start",
            });
        }
        info!(seed = self.config.seed, "starting experiment");
        self.dispatcher.invoke("experiment_initialize", None)?;
        self.dispatcher.invoke("experiment_prepare", None)?;
        self.dispatcher.invoke("experiment_start", None)?;
        self.experiment_state = ExperimentState::Running;
        self.prepare_next(false)?;
        self.transition(TrialState::WaitingForNpStart);
        Ok(())
    }

    /// Ends the session. Later events are ignored. The session stops even
    /// when an `experiment_end` action fails; the failure is still returned.
    pub fn stop_experiment(&mut self) -> Result<(), BehaviorError> {
        if self.experiment_state.is_stopped() {
            return Ok(());
        }
        let ts = self.get_ts();
        let result = self.invoke("experiment_end", ts);
        self.timers.clear();
        self.experiment_state = ExperimentState::Stopped;
        info!(trials = self.results.len(), "experiment stopped");
        result
    }

    /// Pauses now if waiting for a poke, otherwise at the end of the ITI.
    /// Returns whether the pause took effect immediately.
    pub fn request_pause(&mut self) -> Result<bool, BehaviorError> {
        match self.experiment_state {
            ExperimentState::Paused => return Ok(true),
            ExperimentState::Running => {}
            state => {
                return Err(BehaviorError::Lifecycle {
                    state,
                    request: "pause",
                })
            }
        }
        if self.trial_state == TrialState::WaitingForNpStart {
            self.pause_now(self.get_ts())?;
            Ok(true)
        } else {
            debug!("pause requested");
            self.pause_requested = true;
            Ok(false)
        }
    }

    pub fn pause_experiment(&mut self) -> Result<(), BehaviorError> {
        self.request_pause().map(|_| ())
    }

    fn pause_now(&mut self, ts: f64) -> Result<(), BehaviorError> {
        self.pause_requested = false;
        self.stop_event_timer();
        self.experiment_state = ExperimentState::Paused;
        self.transition(TrialState::WaitingForResume);
        self.invoke("experiment_paused", ts)
    }

    pub fn request_resume(&mut self) -> Result<(), BehaviorError> {
        self.pause_requested = false;
        if self.trial_state == TrialState::WaitingForResume {
            self.experiment_state = ExperimentState::Running;
            self.transition(TrialState::WaitingForNpStart);
            let ts = self.get_ts();
            self.invoke("experiment_resumed", ts)?;
        }
        Ok(())
    }

    /// The next selection gets a manual remind trial.
    pub fn request_remind(&mut self) {
        self.remind_requested = true;
    }

    /// Applies staged context changes if no trial is in progress and
    /// reselects the upcoming trial with them. Returns false otherwise.
    pub fn apply_changes(&mut self) -> Result<bool, BehaviorError> {
        if !matches!(
            self.trial_state,
            TrialState::WaitingForNpStart | TrialState::WaitingForResume
        ) {
            return Ok(false);
        }
        self.context.apply_changes()?;
        if self.experiment_state.accepts_events() {
            self.prepare_next(false)?;
        }
        Ok(true)
    }

    /// Like [`apply_changes`](Self::apply_changes), but defers to the end of
    /// the current trial instead of refusing.
    pub fn request_apply(&mut self) -> Result<(), BehaviorError> {
        if !self.apply_changes()? {
            debug!("apply requested");
            self.apply_requested = true;
        }
        Ok(())
    }

    /// Chooses the next trial type, in priority order: remind quota, manual
    /// remind, warmup, forced go after too many nogos, false alarm repeat,
    /// then a go/nogo draw.
    pub fn next_selector(&mut self) -> Result<TrialType, BehaviorError> {
        let ctx = &self.context;
        let n_remind = or_default(ctx.get_usize("remind_trials"), 0)?;
        let n_warmup = or_default(ctx.get_usize("warmup_trials"), 0)?;
        let max_nogo = or_default(ctx.get_usize("max_nogo"), usize::MAX)?;
        let repeat_fa = or_default(ctx.get_bool("repeat_fa"), true)?;
        let go_probability = ctx.get_f64("go_probability")?;

        let trial_type = if self.trial <= n_remind {
            TrialType::GoRemind
        } else if std::mem::take(&mut self.remind_requested) {
            TrialType::GoManual
        } else if self.trial <= n_remind + n_warmup {
            if self.rng.random::<f64>() < go_probability {
                TrialType::GoWarmup
            } else {
                TrialType::NogoWarmup
            }
        } else if self.consecutive_nogo >= max_nogo {
            TrialType::GoForced
        } else if repeat_fa && self.prior_score == Some(TrialScore::FalseAlarm) {
            TrialType::NogoRepeat
        } else if self.rng.random::<f64>() < go_probability {
            TrialType::Go
        } else {
            TrialType::Nogo
        };
        self.trial_type = Some(trial_type);
        Ok(trial_type)
    }

    fn prepare_next(&mut self, save_prior: bool) -> Result<(), BehaviorError> {
        let trial_type = self.next_selector()?;
        self.context.next_setting(trial_type.selector(), save_prior)?;
        debug!(trial = self.trial, %trial_type, "prepared next trial");
        self.invoke_trial_prepare()
    }

    fn invoke_trial_prepare(&mut self) -> Result<(), BehaviorError> {
        let mut setting = self.context.current_setting();
        if let Some(trial_type) = self.trial_type {
            setting.insert("trial_type", trial_type.name());
        }
        let ts = self.get_ts();
        self.dispatcher
            .invoke_actions("trial_prepare", Some(ts), setting)?;
        Ok(())
    }

    /// Entry point for hardware edges and timer expirations. Events that
    /// arrive outside a running session are dropped.
    pub fn handle_event(&mut self, event: Event, timestamp: Option<f64>) -> Result<(), BehaviorError> {
        let ts = timestamp.unwrap_or_else(|| self.get_ts());
        if !self.experiment_state.accepts_events() {
            trace!(%event, ts, state = self.experiment_state.name(), "event ignored");
            return Ok(());
        }
        debug!(%event, ts, state = %self.trial_state, "handling event");
        if event.is_hardware() {
            self.invoke(event.name(), ts)?;
        }
        match self.trial_state {
            TrialState::WaitingForResume | TrialState::WaitingForReward => Ok(()),
            TrialState::WaitingForNpStart => self.handle_waiting_for_np_start(event, ts),
            TrialState::WaitingForNpDuration => self.handle_waiting_for_np_duration(event, ts),
            TrialState::WaitingForHoldPeriod => self.handle_waiting_for_hold_period(event, ts),
            TrialState::WaitingForResponse => self.handle_waiting_for_response(event, ts),
            TrialState::WaitingForTo => self.handle_waiting_for_to(event, ts),
            TrialState::WaitingForIti => self.handle_waiting_for_iti(event, ts),
        }
    }

    /// Fires every timer and delayed action due by `now`, earliest first.
    /// Delayed actions run before trial timers due at the same instant.
    pub fn poll(&mut self, now: f64) -> Result<usize, BehaviorError> {
        let mut handled = 0;
        while let Some(due) = self.next_deadline().filter(|&d| d <= now) {
            if self.dispatcher.next_deadline().is_some_and(|d| d <= due) {
                handled += self.dispatcher.fire_due(due)?;
            }
            for deadline in self.timers.pop_due(due) {
                self.handle_event(deadline.payload, Some(deadline.due))?;
                handled += 1;
            }
        }
        Ok(handled)
    }

    fn handle_waiting_for_np_start(&mut self, event: Event, ts: f64) -> Result<(), BehaviorError> {
        if event.is_poke_start() {
            self.trial_info.np_start = Some(ts);
            self.transition(TrialState::WaitingForNpDuration);
            let seconds = self.config.np_duration.resolve(&self.context)?;
            self.start_event_timer(seconds, Event::NpDurationElapsed, ts);
        }
        Ok(())
    }

    fn handle_waiting_for_np_duration(&mut self, event: Event, ts: f64) -> Result<(), BehaviorError> {
        if event.is_poke_end() {
            debug!(ts, "withdrew before the poke duration");
            self.stop_event_timer();
            self.trial_info.np_start = None;
            self.transition(TrialState::WaitingForNpStart);
        } else if event == Event::NpDurationElapsed {
            self.start_trial(ts)?;
        }
        Ok(())
    }

    fn start_trial(&mut self, ts: f64) -> Result<(), BehaviorError> {
        info!(trial = self.trial, trial_type = ?self.trial_type.map(|t| t.name()), "starting trial");
        match self.dispatcher.invoke(Event::TrialStart.name(), Some(ts)) {
            Ok(()) => {}
            Err(e) if e.is_buffer_underrun() => {
                error!(trial = self.trial, error = %e, "unable to start trial");
                self.trial_info.clear();
                self.transition(TrialState::WaitingForNpStart);
                return self.invoke_trial_prepare();
            }
            Err(e) => return Err(e.into()),
        }
        self.trial_info.trial_start = Some(ts);
        self.transition(TrialState::WaitingForHoldPeriod);
        self.invoke(Event::HoldStart.name(), ts)?;
        let seconds = self.config.hold_duration.resolve(&self.context)?;
        self.start_event_timer(seconds, Event::HoldDurationElapsed, ts);
        Ok(())
    }

    fn handle_waiting_for_hold_period(&mut self, event: Event, ts: f64) -> Result<(), BehaviorError> {
        if event.is_poke_end() {
            self.trial_info.record_np_end(ts);
        } else if event == Event::HoldDurationElapsed {
            self.transition(TrialState::WaitingForResponse);
            self.trial_info.response_start = Some(ts);
            self.invoke(Event::ResponseStart.name(), ts)?;
            let seconds = self.config.response_duration.resolve(&self.context)?;
            self.start_event_timer(seconds, Event::ResponseDurationElapsed, ts);
        }
        Ok(())
    }

    fn handle_waiting_for_response(&mut self, event: Event, ts: f64) -> Result<(), BehaviorError> {
        if self.trial_info.response_start.is_some_and(|start| ts <= start) {
            warn!(%event, ts, "ignoring event from before the response window");
            return Ok(());
        }
        if event.is_poke_end() {
            self.trial_info.record_np_end(ts);
            return Ok(());
        }
        let response = if event.is_poke_start() {
            Response::Poke
        } else if event.is_reward_start() {
            Response::Reward
        } else if event == Event::ResponseDurationElapsed {
            Response::NoResponse
        } else {
            return Ok(());
        };
        self.stop_event_timer();
        self.invoke(Event::ResponseEnd.name(), ts)?;
        if response != Response::NoResponse {
            self.trial_info.response_ts = Some(ts);
        }
        self.end_trial(response, ts)
    }

    /// Scores and records the trial, starts the timeout or ITI, and
    /// prepares the next trial.
    fn end_trial(&mut self, response: Response, ts: f64) -> Result<(), BehaviorError> {
        self.stop_event_timer();
        let now = self.get_ts();
        let trial_type = self
            .trial_type
            .ok_or_else(|| BehaviorError::UnscoredTrialType("none".into()))?;
        let score = TrialScore::from_response(trial_type.name(), response)
            .ok_or_else(|| BehaviorError::UnscoredTrialType(trial_type.name().into()))?;

        self.consecutive_nogo = if trial_type == TrialType::Nogo {
            self.consecutive_nogo + 1
        } else {
            0
        };

        let info = self.trial_info;
        let result = TrialResult {
            trial: self.trial,
            trial_type: trial_type.name().into(),
            response,
            score,
            correct: score.is_correct(),
            np_start: info.np_start,
            np_end: info.np_end,
            trial_start: info.trial_start,
            response_start: info.response_start,
            response_ts: info.response_ts,
            response_time: info.response_time(),
            reaction_time: info.reaction_time(),
            setting: self.context.current_setting(),
        };
        info!(
            trial = self.trial,
            %trial_type,
            response = response.name(),
            %score,
            response_time = result.response_time,
            "trial complete"
        );
        let payload = result.to_setting();
        self.results.push(result);
        self.dispatcher
            .invoke_actions(Event::TrialEnd.name(), Some(now), payload)?;

        if score == TrialScore::FalseAlarm {
            self.start_timeout(now)?;
        } else {
            if score == TrialScore::Hit {
                let training = or_default(self.context.get_bool("training_mode"), false)?;
                if !training {
                    self.invoke("deliver_reward", now)?;
                }
            }
            self.start_iti(now)?;
        }

        self.trial_info.clear();
        if response == Response::Poke && self.config.carry_over_poke {
            self.trial_info.np_start = Some(ts);
        }
        self.trial += 1;
        if std::mem::take(&mut self.apply_requested) {
            self.context.apply_changes()?;
        }
        self.prior_score = Some(score);
        self.prepare_next(true)
    }

    fn start_timeout(&mut self, ts: f64) -> Result<(), BehaviorError> {
        self.transition(TrialState::WaitingForTo);
        self.invoke(Event::ToStart.name(), ts)?;
        let seconds = self.config.to_duration.resolve(&self.context)?;
        self.start_event_timer(seconds, Event::ToDurationElapsed, ts);
        Ok(())
    }

    fn start_iti(&mut self, ts: f64) -> Result<(), BehaviorError> {
        self.transition(TrialState::WaitingForIti);
        self.invoke(Event::ItiStart.name(), ts)?;
        let seconds = self.config.iti_duration.resolve(&self.context)?;
        self.start_event_timer(seconds, Event::ItiDurationElapsed, ts);
        Ok(())
    }

    fn handle_waiting_for_to(&mut self, event: Event, ts: f64) -> Result<(), BehaviorError> {
        if event == Event::ToDurationElapsed {
            self.invoke(Event::ToEnd.name(), ts)?;
            return self.start_iti(ts);
        }
        if event.is_poke_start() {
            self.trial_info.np_start = Some(ts);
        } else if event.is_poke_end() {
            self.trial_info.np_start = None;
        }
        if event.is_poke_start() || event.is_reward_start() {
            debug!(ts, "resetting timeout");
            self.stop_event_timer();
            let seconds = self.config.to_duration.resolve(&self.context)?;
            self.start_event_timer(seconds, Event::ToDurationElapsed, ts);
        }
        Ok(())
    }

    fn handle_waiting_for_iti(&mut self, event: Event, ts: f64) -> Result<(), BehaviorError> {
        if event.is_poke_start() {
            self.trial_info.np_start = Some(ts);
        } else if event.is_poke_end() {
            self.trial_info.np_start = None;
        } else if event == Event::ItiDurationElapsed {
            self.invoke(Event::ItiEnd.name(), ts)?;
            let np_start = self.trial_info.np_start;
            match np_start {
                _ if self.pause_requested => self.pause_now(ts)?,
                Some(np_start) if self.config.carry_over_poke => {
                    let np_duration = self.config.np_duration.resolve(&self.context)?;
                    let remaining = (np_duration - (ts - np_start)).max(0.0);
                    debug!(np_start, remaining, "poke carried over from the ITI");
                    self.transition(TrialState::WaitingForNpDuration);
                    self.start_event_timer(remaining, Event::NpDurationElapsed, ts);
                }
                _ => {
                    self.trial_info.np_start = None;
                    self.transition(TrialState::WaitingForNpStart);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::TrialStateMachine;
    use crate::config::{BehaviorConfig, TimerDuration};
    use crate::error::BehaviorError;
    use crate::trial::TrialType;
    use rand::rngs::StdRng;
    use trialbench_core::{
        ActionDispatcher, ActionError, ActionRegistry, ContextStore, Event, ExperimentState,
        HardwareError, MemoryContext, Order, Response, Selector, Setting, TrialScore, TrialState,
    };
    use trialbench_timing::ManualTimer;

    type Machine = TrialStateMachine<MemoryContext, ActionRegistry, ManualTimer, StdRng>;

    fn context(remind_trials: usize, go_probability: f64) -> MemoryContext {
        let selector = |level: f64| {
            Selector::with_settings(Order::Exact, [Setting::new().with("target_level", level)])
        };
        MemoryContext::new()
            .with_parameter("np_duration", 0.2)
            .with_parameter("hold_duration", 0.1)
            .with_parameter("response_duration", 1.0)
            .with_parameter("to_duration", 2.0)
            .with_parameter("iti_duration", 0.5)
            .with_parameter("remind_trials", remind_trials)
            .with_parameter("warmup_trials", 0)
            .with_parameter("go_probability", go_probability)
            .with_parameter("max_nogo", 3)
            .with_selector("remind", selector(60.0))
            .with_selector("go", selector(40.0))
            .with_selector("nogo", selector(0.0))
    }

    fn machine(context: MemoryContext) -> (Machine, ManualTimer) {
        let timer = ManualTimer::new();
        let mut fsm = TrialStateMachine::seeded(
            BehaviorConfig::default(),
            context,
            ActionRegistry::new(),
            timer.clone(),
        );
        fsm.start_experiment().unwrap();
        (fsm, timer)
    }

    /// Advances the clock to `t` and fires whatever came due.
    fn run_until(fsm: &mut Machine, timer: &ManualTimer, t: f64) {
        timer.set(t);
        fsm.poll(t).unwrap();
    }

    fn event(fsm: &mut Machine, timer: &ManualTimer, event: Event, t: f64) {
        run_until(fsm, timer, t);
        fsm.handle_event(event, Some(t)).unwrap();
    }

    /// Pokes, holds and waits for the response window to open.
    fn to_response_window(fsm: &mut Machine, timer: &ManualTimer, t0: f64) -> f64 {
        event(fsm, timer, Event::NpStart, t0);
        run_until(fsm, timer, t0 + 0.25);
        assert_eq!(fsm.trial_state(), TrialState::WaitingForHoldPeriod);
        run_until(fsm, timer, t0 + 0.35);
        assert_eq!(fsm.trial_state(), TrialState::WaitingForResponse);
        fsm.trial_info().response_start.unwrap()
    }

    fn logged(fsm: &Machine, name: &str) -> usize {
        fsm.dispatcher()
            .event_log()
            .iter()
            .filter(|(e, _)| e == name)
            .count()
    }

    #[test]
    /// Test the poke, hold, response, reward, ITI cycle of a hit.
    fn test_hit_runs_through_iti() {
        let (mut fsm, timer) = machine(context(1, 1.0));
        assert_eq!(fsm.trial_type(), Some(TrialType::GoRemind));
        assert_eq!(logged(&fsm, "trial_prepare"), 1);

        to_response_window(&mut fsm, &timer, 1.0);
        event(&mut fsm, &timer, Event::NpEnd, 1.32);
        event(&mut fsm, &timer, Event::RewardStart, 1.6);

        assert_eq!(fsm.trial_state(), TrialState::WaitingForIti);
        let result = &fsm.results()[0];
        assert_eq!(result.score, TrialScore::Hit);
        assert_eq!(result.response, Response::Reward);
        assert!((result.response_time - 0.4).abs() < 1e-9);
        assert!((result.reaction_time - 0.32).abs() < 1e-9);
        assert_eq!(logged(&fsm, "deliver_reward"), 1);
        assert_eq!(logged(&fsm, "reward_start"), 1);
        assert_eq!(fsm.trial(), 2);
        assert_eq!(fsm.trial_type(), Some(TrialType::Go));

        run_until(&mut fsm, &timer, 2.2);
        assert_eq!(fsm.trial_state(), TrialState::WaitingForNpStart);
        assert_eq!(logged(&fsm, "iti_end"), 1);
    }

    #[test]
    /// Test that withdrawing early cancels the poke timer.
    fn test_early_withdrawal_returns_to_np_start() {
        let (mut fsm, timer) = machine(context(1, 1.0));
        event(&mut fsm, &timer, Event::DigitalNpStart, 1.0);
        event(&mut fsm, &timer, Event::DigitalNpEnd, 1.1);
        assert_eq!(fsm.trial_state(), TrialState::WaitingForNpStart);
        assert_eq!(fsm.trial_info().np_start, None);
        run_until(&mut fsm, &timer, 5.0);
        assert_eq!(fsm.trial_state(), TrialState::WaitingForNpStart);
        assert_eq!(logged(&fsm, "trial_start"), 0);
    }

    #[test]
    /// Test that a false alarm leads to a timeout that pokes extend.
    fn test_false_alarm_timeout_resets_on_poke() {
        let (mut fsm, timer) = machine(context(0, 0.0));
        assert_eq!(fsm.trial_type(), Some(TrialType::Nogo));
        to_response_window(&mut fsm, &timer, 1.0);
        event(&mut fsm, &timer, Event::RewardStart, 1.5);

        assert_eq!(fsm.results()[0].score, TrialScore::FalseAlarm);
        assert_eq!(fsm.trial_state(), TrialState::WaitingForTo);
        assert_eq!(fsm.trial_type(), Some(TrialType::NogoRepeat));
        assert_eq!(logged(&fsm, "deliver_reward"), 0);

        event(&mut fsm, &timer, Event::RewardStart, 2.5);
        run_until(&mut fsm, &timer, 3.6);
        assert_eq!(fsm.trial_state(), TrialState::WaitingForTo);
        run_until(&mut fsm, &timer, 4.5);
        assert_eq!(fsm.trial_state(), TrialState::WaitingForIti);
        assert_eq!(logged(&fsm, "to_end"), 1);
    }

    #[test]
    /// Test that misses and correct rejects go straight to the ITI.
    fn test_no_response_scores_and_goes_to_iti() {
        let (mut fsm, timer) = machine(context(0, 0.0));
        to_response_window(&mut fsm, &timer, 1.0);
        run_until(&mut fsm, &timer, 2.35);
        let result = &fsm.results()[0];
        assert_eq!(result.response, Response::NoResponse);
        assert_eq!(result.score, TrialScore::CorrectReject);
        assert!(result.response_time.is_nan());
        assert_eq!(fsm.trial_state(), TrialState::WaitingForIti);
        assert_eq!(fsm.consecutive_nogo(), 1);
    }

    #[test]
    /// Test that events stamped before the response window are ignored.
    fn test_stale_event_in_response_window_is_ignored() {
        let (mut fsm, timer) = machine(context(1, 1.0));
        let response_start = to_response_window(&mut fsm, &timer, 1.0);
        fsm.handle_event(Event::RewardStart, Some(response_start)).unwrap();
        fsm.handle_event(Event::NpStart, Some(response_start - 0.05)).unwrap();
        assert_eq!(fsm.trial_state(), TrialState::WaitingForResponse);
        assert!(fsm.results().is_empty());
    }

    #[test]
    /// Test that the remind quota fills the first trials before go/nogo draws.
    fn test_remind_quota_then_probabilistic() {
        let (mut fsm, timer) = machine(context(2, 0.5));
        let mut selectors = vec![fsm.trial_type().map(|t| t.selector())];
        let mut t = 1.0;
        for _ in 0..2 {
            to_response_window(&mut fsm, &timer, t);
            event(&mut fsm, &timer, Event::RewardStart, t + 0.5);
            selectors.push(fsm.trial_type().map(|t| t.selector()));
            run_until(&mut fsm, &timer, t + 2.0);
            t += 3.0;
        }
        assert_eq!(selectors[0], Some("remind"));
        assert_eq!(selectors[1], Some("remind"));
        assert!(matches!(selectors[2], Some("go") | Some("nogo")));
        assert!(fsm.context().current_setting().get_f64("target_level").is_some());
    }

    #[test]
    /// Test the manual remind, forced go and false alarm repeat rules.
    fn test_selector_priority_rules() {
        let (mut fsm, _timer) = machine(context(0, 0.0));
        fsm.request_remind();
        assert_eq!(fsm.next_selector().unwrap(), TrialType::GoManual);
        assert_eq!(fsm.next_selector().unwrap(), TrialType::Nogo);

        fsm.consecutive_nogo = 3;
        assert_eq!(fsm.next_selector().unwrap(), TrialType::GoForced);

        fsm.consecutive_nogo = 0;
        fsm.prior_score = Some(TrialScore::FalseAlarm);
        assert_eq!(fsm.next_selector().unwrap(), TrialType::NogoRepeat);
        fsm.context_mut().set_parameter("repeat_fa", false);
        assert_eq!(fsm.next_selector().unwrap(), TrialType::Nogo);
    }

    #[test]
    /// Test that the same seed draws the same trial sequence.
    fn test_seeded_draws_are_reproducible() {
        let draw = || {
            let (mut fsm, _) = machine(context(0, 0.5));
            (0..20)
                .map(|_| fsm.next_selector().unwrap())
                .collect::<Vec<_>>()
        };
        let first = draw();
        assert_eq!(first, draw());
        assert!(first.contains(&TrialType::Go) && first.contains(&TrialType::Nogo));
    }

    #[test]
    /// Test that a poke held across the end of the ITI counts toward the next trial.
    fn test_poke_carries_over_iti() {
        let (mut fsm, timer) = machine(context(1, 1.0));
        to_response_window(&mut fsm, &timer, 1.0);
        event(&mut fsm, &timer, Event::RewardStart, 1.5);
        // ITI runs 1.5..2.0; poke at 1.9 has 0.1 s held when it ends
        event(&mut fsm, &timer, Event::NpStart, 1.9);
        run_until(&mut fsm, &timer, 2.0);
        assert_eq!(fsm.trial_state(), TrialState::WaitingForNpDuration);
        let (pending, due) = fsm.pending_timer().unwrap();
        assert_eq!(pending, Event::NpDurationElapsed);
        assert!((due - 2.1).abs() < 1e-9);

        run_until(&mut fsm, &timer, 2.15);
        assert_eq!(fsm.trial_state(), TrialState::WaitingForHoldPeriod);
    }

    #[test]
    /// Test that a long ITI poke carries over with no remaining duration.
    fn test_carry_over_clamps_at_zero() {
        let (mut fsm, timer) = machine(context(1, 1.0));
        to_response_window(&mut fsm, &timer, 1.0);
        event(&mut fsm, &timer, Event::RewardStart, 1.5);
        event(&mut fsm, &timer, Event::NpStart, 1.55);
        run_until(&mut fsm, &timer, 2.0);
        assert_eq!(fsm.trial_state(), TrialState::WaitingForHoldPeriod);
        assert_eq!(fsm.trial_info().trial_start, Some(2.0));
    }

    #[test]
    /// Test that a buffer underrun aborts the trial and re-prepares it.
    fn test_underrun_aborts_trial() {
        let mut registry = ActionRegistry::new();
        registry.register_command("fail", |_, _| {
            Err(ActionError::Hardware(HardwareError::BufferUnderrun {
                channel: "speaker".into(),
                offset: 0,
                earliest: 10,
            }))
        });
        registry
            .register_action("trial_start", "fail", Setting::new(), 0)
            .unwrap();
        let timer = ManualTimer::new();
        let mut fsm = TrialStateMachine::seeded(
            BehaviorConfig::default(),
            context(1, 1.0),
            registry,
            timer.clone(),
        );
        fsm.start_experiment().unwrap();
        event(&mut fsm, &timer, Event::NpStart, 1.0);
        run_until(&mut fsm, &timer, 1.25);

        assert_eq!(fsm.trial_state(), TrialState::WaitingForNpStart);
        assert_eq!(logged(&fsm, "trial_prepare"), 2);
        assert_eq!(fsm.trial(), 1);
        assert!(fsm.results().is_empty());
    }

    #[test]
    /// Test that a pause requested mid-trial waits for the end of the ITI.
    fn test_pause_waits_for_iti() {
        let (mut fsm, timer) = machine(context(1, 1.0));
        to_response_window(&mut fsm, &timer, 1.0);
        assert!(!fsm.request_pause().unwrap());
        event(&mut fsm, &timer, Event::RewardStart, 1.5);
        run_until(&mut fsm, &timer, 2.0);
        assert_eq!(fsm.trial_state(), TrialState::WaitingForResume);
        assert_eq!(fsm.experiment_state(), ExperimentState::Paused);

        fsm.handle_event(Event::NpStart, Some(2.1)).unwrap();
        assert_eq!(fsm.trial_state(), TrialState::WaitingForResume);

        fsm.request_resume().unwrap();
        assert_eq!(fsm.trial_state(), TrialState::WaitingForNpStart);
        assert_eq!(logged(&fsm, "experiment_resumed"), 1);
        assert!(fsm.request_pause().unwrap());
        assert_eq!(fsm.trial_state(), TrialState::WaitingForResume);
    }

    #[test]
    /// Test that staged changes wait for the end of a running trial.
    fn test_request_apply_defers_during_trial() {
        let (mut fsm, timer) = machine(context(1, 1.0));
        to_response_window(&mut fsm, &timer, 1.0);
        fsm.context_mut().stage_value("go_probability", 0.0);
        fsm.request_apply().unwrap();
        assert!(fsm.context().changes_pending());
        event(&mut fsm, &timer, Event::RewardStart, 1.5);
        assert!(!fsm.context().changes_pending());
        assert_eq!(fsm.trial_type(), Some(TrialType::Nogo));
    }

    #[test]
    /// Test that training mode withholds the reward on a hit.
    fn test_training_mode_suppresses_reward() {
        let (mut fsm, timer) = machine(context(1, 1.0).with_parameter("training_mode", true));
        to_response_window(&mut fsm, &timer, 1.0);
        event(&mut fsm, &timer, Event::RewardStart, 1.5);
        assert_eq!(fsm.results()[0].score, TrialScore::Hit);
        assert_eq!(logged(&fsm, "deliver_reward"), 0);
    }

    #[test]
    /// Test that a stopped session drops events and refuses to restart.
    fn test_stop_experiment() {
        let (mut fsm, timer) = machine(context(1, 1.0));
        fsm.stop_experiment().unwrap();
        event(&mut fsm, &timer, Event::NpStart, 1.0);
        assert_eq!(fsm.trial_state(), TrialState::WaitingForNpStart);
        assert!(fsm.pending_timer().is_none());
        assert!(matches!(
            fsm.start_experiment(),
            Err(BehaviorError::Lifecycle { .. })
        ));
    }

    #[test]
    fn test_literal_timer_durations() {
        let config = BehaviorConfig {
            np_duration: TimerDuration::Seconds(0.05),
            ..BehaviorConfig::default()
        };
        let timer = ManualTimer::new();
        let mut fsm =
            TrialStateMachine::seeded(config, context(1, 1.0), ActionRegistry::new(), timer.clone());
        fsm.start_experiment().unwrap();
        event(&mut fsm, &timer, Event::NpStart, 1.0);
        let (pending, due) = fsm.pending_timer().unwrap();
        assert_eq!(pending, Event::NpDurationElapsed);
        assert!((due - 1.05).abs() < 1e-9);
        assert!(fsm.dispatcher().next_deadline().is_none());
    }
}
