use crate::error::ActionError;
use crate::value::Setting;
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use tracing::{debug, trace};
use trialbench_timing::TimerQueue;

/// Event echoed with `{event, timestamp}` whenever a timestamped event is invoked.
pub const EXPERIMENT_EVENT: &str = "experiment_event";

/// Most recent dispatched events kept by `ActionRegistry::event_log`.
pub const EVENT_LOG_LIMIT: usize = 1024;

/// Bus through which the trial logic announces named events.
pub trait ActionDispatcher {
    /// Runs every action bound to `event`, in weight order.
    fn invoke_actions(
        &mut self,
        event: &str,
        timestamp: Option<f64>,
        kwargs: Setting,
    ) -> Result<(), ActionError>;

    /// Invokes `event` once the clock reaches `timestamp`.
    fn invoke_actions_at(
        &mut self,
        event: &str,
        timestamp: f64,
        now: f64,
        kwargs: Setting,
    ) -> Result<(), ActionError> {
        let _ = now;
        self.invoke_actions(event, Some(timestamp), kwargs)
    }

    fn invoke(&mut self, event: &str, timestamp: Option<f64>) -> Result<(), ActionError> {
        self.invoke_actions(event, timestamp, Setting::new())
    }

    fn cancel_delayed(&mut self, _event: &str) {}

    fn next_deadline(&self) -> Option<f64> {
        None
    }

    /// Fires delayed invocations due at `now`. Returns how many fired.
    fn fire_due(&mut self, _now: f64) -> Result<usize, ActionError> {
        Ok(0)
    }
}

/// The call a command handler receives.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionCall {
    pub event: String,
    pub command: String,
    pub timestamp: Option<f64>,
    pub kwargs: Setting,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FollowUp {
    Now {
        event: String,
        timestamp: Option<f64>,
        kwargs: Setting,
    },
    At {
        event: String,
        timestamp: f64,
        now: f64,
        kwargs: Setting,
    },
}

/// Invocations requested by a handler, run after the handler returns.
#[derive(Debug, Clone, Default)]
pub struct FollowUps {
    pending: Vec<FollowUp>,
}

impl FollowUps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&mut self) -> Vec<FollowUp> {
        std::mem::take(&mut self.pending)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl ActionDispatcher for FollowUps {
    fn invoke_actions(
        &mut self,
        event: &str,
        timestamp: Option<f64>,
        kwargs: Setting,
    ) -> Result<(), ActionError> {
        self.pending.push(FollowUp::Now {
            event: event.to_string(),
            timestamp,
            kwargs,
        });
        Ok(())
    }

    fn invoke_actions_at(
        &mut self,
        event: &str,
        timestamp: f64,
        now: f64,
        kwargs: Setting,
    ) -> Result<(), ActionError> {
        self.pending.push(FollowUp::At {
            event: event.to_string(),
            timestamp,
            now,
            kwargs,
        });
        Ok(())
    }
}

/// Conjunction of event names and `<state>_active` flags, each optionally
/// negated: `"trial_start and not training_active"`.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    terms: Vec<(String, bool)>,
}

impl Condition {
    pub fn matches(&self, flags: &HashMap<String, bool>) -> bool {
        self.terms
            .iter()
            .all(|(name, negated)| flags.get(name).copied().unwrap_or(false) != *negated)
    }

    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().map(|(name, _)| name.as_str())
    }
}

impl FromStr for Condition {
    type Err = ActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ActionError::InvalidExpression(s.to_string());
        let mut terms = Vec::new();
        let mut tokens = s.split_whitespace().peekable();
        while let Some(mut token) = tokens.next() {
            let negated = token == "not";
            if negated {
                token = tokens.next().ok_or_else(invalid)?;
            }
            let valid = token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid || token == "and" || token == "not" {
                return Err(invalid());
            }
            terms.push((token.to_string(), negated));
            match tokens.next() {
                None => break,
                Some("and") if tokens.peek().is_some() => {}
                Some(_) => return Err(invalid()),
            }
        }
        if terms.is_empty() {
            return Err(invalid());
        }
        Ok(Condition { terms })
    }
}

pub type CommandHandler =
    Box<dyn FnMut(&ActionCall, &mut FollowUps) -> Result<(), ActionError> + Send>;

struct RegisteredAction {
    condition: Condition,
    command: String,
    kwargs: Setting,
    weight: i32,
}

/// Explicit command table plus the weighted actions bound to events.
#[derive(Default)]
pub struct ActionRegistry {
    actions: Vec<RegisteredAction>,
    commands: HashMap<String, CommandHandler>,
    flags: HashMap<String, bool>,
    delayed: TimerQueue<(f64, Setting)>,
    event_log: VecDeque<(String, Option<f64>)>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_command<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: FnMut(&ActionCall, &mut FollowUps) -> Result<(), ActionError> + Send + 'static,
    {
        self.commands.insert(name.into(), Box::new(handler));
    }

    /// Binds `command` to `expression`. Lower weights run first; equal
    /// weights run in registration order.
    pub fn register_action(
        &mut self,
        expression: &str,
        command: impl Into<String>,
        kwargs: Setting,
        weight: i32,
    ) -> Result<(), ActionError> {
        let condition: Condition = expression.parse()?;
        let idx = self.actions.partition_point(|a| a.weight <= weight);
        self.actions.insert(
            idx,
            RegisteredAction {
                condition,
                command: command.into(),
                kwargs,
                weight,
            },
        );
        Ok(())
    }

    /// Whether any registered action depends on `event`.
    pub fn event_used(&self, event: &str) -> bool {
        self.actions
            .iter()
            .any(|a| a.condition.dependencies().any(|d| d == event))
    }

    pub fn is_active(&self, state: &str) -> bool {
        self.flags
            .get(&format!("{}_active", state))
            .copied()
            .unwrap_or(false)
    }

    pub fn is_delayed(&self, event: &str) -> bool {
        self.delayed.is_pending(event)
    }

    /// The last `EVENT_LOG_LIMIT` events dispatched with their timestamps,
    /// oldest first.
    pub fn event_log(&self) -> &VecDeque<(String, Option<f64>)> {
        &self.event_log
    }

    fn update_flags(&mut self, event: &str) {
        if let Some(prefix) = event.strip_suffix("_start") {
            self.flags.insert(format!("{}_active", prefix), true);
        } else if let Some(prefix) = event.strip_suffix("_end") {
            self.flags.insert(format!("{}_active", prefix), false);
        }
    }

    fn dispatch(
        &mut self,
        event: &str,
        timestamp: Option<f64>,
        kwargs: Setting,
    ) -> Result<(), ActionError> {
        debug!(event, ?timestamp, "invoking actions");
        if self.event_log.len() == EVENT_LOG_LIMIT {
            self.event_log.pop_front();
        }
        self.event_log.push_back((event.to_string(), timestamp));
        if let Some(ts) = timestamp {
            let echo = Setting::new().with("event", event).with("timestamp", ts);
            self.dispatch(EXPERIMENT_EVENT, None, echo)?;
        }
        self.update_flags(event);

        let mut context = self.flags.clone();
        context.insert(event.to_string(), true);
        let matched: Vec<(String, Setting)> = self
            .actions
            .iter()
            .filter(|a| a.condition.matches(&context))
            .map(|a| {
                let mut merged = a.kwargs.clone();
                merged.extend(&kwargs);
                (a.command.clone(), merged)
            })
            .collect();

        for (command, kwargs) in matched {
            let call = ActionCall {
                event: event.to_string(),
                command,
                timestamp,
                kwargs,
            };
            let mut follow_ups = FollowUps::new();
            let handler = self
                .commands
                .get_mut(&call.command)
                .ok_or_else(|| ActionError::UnknownCommand(call.command.clone()))?;
            trace!(command = %call.command, event, "running command");
            handler(&call, &mut follow_ups)?;
            for follow_up in follow_ups.drain() {
                match follow_up {
                    FollowUp::Now {
                        event,
                        timestamp,
                        kwargs,
                    } => self.invoke_actions(&event, timestamp, kwargs)?,
                    FollowUp::At {
                        event,
                        timestamp,
                        now,
                        kwargs,
                    } => self.invoke_actions_at(&event, timestamp, now, kwargs)?,
                }
            }
        }
        Ok(())
    }
}

impl ActionDispatcher for ActionRegistry {
    fn invoke_actions(
        &mut self,
        event: &str,
        timestamp: Option<f64>,
        kwargs: Setting,
    ) -> Result<(), ActionError> {
        self.delayed.stop(event);
        self.dispatch(event, timestamp, kwargs)
    }

    fn invoke_actions_at(
        &mut self,
        event: &str,
        timestamp: f64,
        now: f64,
        kwargs: Setting,
    ) -> Result<(), ActionError> {
        self.delayed.stop(event);
        if timestamp > now {
            debug!(event, timestamp, delay = timestamp - now, "scheduling delayed actions");
            self.delayed.start(event, timestamp, (timestamp, kwargs));
            Ok(())
        } else {
            self.dispatch(event, Some(timestamp), kwargs)
        }
    }

    fn cancel_delayed(&mut self, event: &str) {
        self.delayed.stop(event);
    }

    fn next_deadline(&self) -> Option<f64> {
        self.delayed.next_due()
    }

    fn fire_due(&mut self, now: f64) -> Result<usize, ActionError> {
        let due = self.delayed.pop_due(now);
        let fired = due.len();
        for deadline in due {
            let (timestamp, kwargs) = deadline.payload;
            self.dispatch(&deadline.name, Some(timestamp), kwargs)?;
        }
        Ok(fired)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ActionCall, ActionDispatcher, ActionRegistry, Condition, EVENT_LOG_LIMIT, EXPERIMENT_EVENT,
    };
    use crate::error::ActionError;
    use crate::value::Setting;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    fn recorder(registry: &mut ActionRegistry, name: &str) -> Arc<Mutex<Vec<ActionCall>>> {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        registry.register_command(name, move |call, _| {
            sink.lock().unwrap().push(call.clone());
            Ok(())
        });
        calls
    }

    #[test]
    /// Test parsing of conjunctions with negation.
    fn test_condition_parsing() {
        let c: Condition = "trial_start and not training_active".parse().unwrap();
        let mut flags = HashMap::new();
        flags.insert("trial_start".to_string(), true);
        assert!(c.matches(&flags));
        flags.insert("training_active".to_string(), true);
        assert!(!c.matches(&flags));
        assert_eq!(c.dependencies().collect::<Vec<_>>(), vec!["trial_start", "training_active"]);

        for bad in ["", "and", "a and", "a or b", "not", "a b", "a-b"] {
            assert!(bad.parse::<Condition>().is_err(), "{:?} should not parse", bad);
        }
    }

    #[test]
    /// Test that actions run by ascending weight, ties in registration order.
    fn test_actions_run_in_weight_order() {
        let mut registry = ActionRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b", "c"] {
            let sink = order.clone();
            registry.register_command(name, move |call, _| {
                sink.lock().unwrap().push(call.command.clone());
                Ok(())
            });
        }
        registry.register_action("trial_start", "c", Setting::new(), 100).unwrap();
        registry.register_action("trial_start", "a", Setting::new(), 10).unwrap();
        registry.register_action("trial_start", "b", Setting::new(), 100).unwrap();

        registry.invoke("trial_start", Some(1.0)).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["a", "c", "b"]);
    }

    #[test]
    /// Test that start/end events drive active flags used by conditions.
    fn test_active_flags_gate_actions() {
        let mut registry = ActionRegistry::new();
        let calls = recorder(&mut registry, "reward");
        registry
            .register_action("reward_start and not to_active", "reward", Setting::new(), 0)
            .unwrap();

        registry.invoke("to_start", Some(0.0)).unwrap();
        assert!(registry.is_active("to"));
        registry.invoke("reward_start", Some(0.5)).unwrap();
        assert!(calls.lock().unwrap().is_empty());

        registry.invoke("to_end", Some(1.0)).unwrap();
        registry.invoke("reward_start", Some(1.5)).unwrap();
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert!(registry.event_used("to_active"));
        assert!(!registry.event_used("iti_start"));
    }

    #[test]
    /// Test that timestamped events are echoed as experiment events.
    fn test_timestamped_events_are_echoed() {
        let mut registry = ActionRegistry::new();
        let echoes = recorder(&mut registry, "log");
        registry.register_action(EXPERIMENT_EVENT, "log", Setting::new(), 0).unwrap();

        registry.invoke("hold_start", Some(2.5)).unwrap();
        registry.invoke("trial_prepare", None).unwrap();
        let echoes = echoes.lock().unwrap();
        assert_eq!(echoes.len(), 1);
        assert_eq!(echoes[0].kwargs.get("event").and_then(|v| v.as_str()), Some("hold_start"));
        assert_eq!(echoes[0].kwargs.get_f64("timestamp"), Some(2.5));
    }

    #[test]
    /// Test that the event log keeps only the most recent events.
    fn test_event_log_is_bounded() {
        let mut registry = ActionRegistry::new();
        for i in 0..EVENT_LOG_LIMIT + 10 {
            registry.invoke(&format!("tick_{}", i), None).unwrap();
        }
        let log = registry.event_log();
        assert_eq!(log.len(), EVENT_LOG_LIMIT);
        assert_eq!(log.front().map(|(e, _)| e.as_str()), Some("tick_10"));
        let last = format!("tick_{}", EVENT_LOG_LIMIT + 9);
        assert_eq!(log.back().map(|(e, _)| e.as_str()), Some(last.as_str()));
    }

    #[test]
    /// Test that delayed invocations fire once due and restarting cancels the old one.
    fn test_delayed_invocations() {
        let mut registry = ActionRegistry::new();
        let calls = recorder(&mut registry, "note");
        registry.register_action("target_end", "note", Setting::new(), 0).unwrap();

        registry.invoke_actions_at("target_end", 5.0, 1.0, Setting::new()).unwrap();
        registry.invoke_actions_at("target_end", 6.0, 1.0, Setting::new()).unwrap();
        assert_eq!(registry.next_deadline(), Some(6.0));
        assert_eq!(registry.fire_due(5.5).unwrap(), 0);
        assert_eq!(registry.fire_due(6.0).unwrap(), 1);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].timestamp, Some(6.0));

        // Not in the future: fires right away.
        drop(calls);
        registry.invoke_actions_at("target_end", 3.0, 7.0, Setting::new()).unwrap();
        assert!(!registry.is_delayed("target_end"));
    }

    #[test]
    /// Test that handler follow-ups run after the handler and errors propagate.
    fn test_follow_ups_and_errors() {
        let mut registry = ActionRegistry::new();
        let seen = recorder(&mut registry, "seen");
        registry.register_command("chain", |call, follow_ups| {
            follow_ups.invoke("chained", call.timestamp)
        });
        registry.register_action("first", "chain", Setting::new(), 0).unwrap();
        registry.register_action("chained", "seen", Setting::new(), 0).unwrap();
        registry.register_action("broken", "missing", Setting::new(), 0).unwrap();

        registry.invoke("first", None).unwrap();
        assert_eq!(seen.lock().unwrap()[0].event, "chained");
        assert_eq!(
            registry.invoke("broken", None),
            Err(ActionError::UnknownCommand("missing".into()))
        );
    }

    #[test]
    fn test_kwargs_override_registered_defaults() {
        let mut registry = ActionRegistry::new();
        let calls = recorder(&mut registry, "pump");
        registry
            .register_action("deliver", "pump", Setting::new().with("volume", 10.0).with("rate", 1.0), 0)
            .unwrap();
        registry
            .invoke_actions("deliver", None, Setting::new().with("volume", 25.0))
            .unwrap();
        let calls = calls.lock().unwrap();
        let call = &calls[0];
        assert_eq!(call.kwargs.get_f64("volume"), Some(25.0));
        assert_eq!(call.kwargs.get_f64("rate"), Some(1.0));
    }
}
