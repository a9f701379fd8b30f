use crate::error::ContextError;
use crate::value::{Setting, SettingKey, Value};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Parameter store the trial logic queries for configuration values.
pub trait ContextStore {
    fn get_value(&self, name: &str) -> Result<Value, ContextError>;

    /// The selector's settings repeated `cycles` times, in selector order.
    fn iter_settings(&self, selector: &str, cycles: usize) -> Result<Vec<Setting>, ContextError>;

    /// Makes the selector's next setting current.
    fn next_setting(&mut self, selector: &str, save_prior: bool) -> Result<(), ContextError>;

    /// Applies staged changes. Returns whether anything changed.
    fn apply_changes(&mut self) -> Result<bool, ContextError>;

    fn changes_pending(&self) -> bool;

    /// Parameters with the current setting layered on top.
    fn current_setting(&self) -> Setting;

    fn get_f64(&self, name: &str) -> Result<f64, ContextError> {
        let v = self.get_value(name)?;
        v.as_f64().ok_or_else(|| ContextError::TypeMismatch {
            name: name.to_string(),
            expected: "number",
            found: v.clone(),
        })
    }

    fn get_bool(&self, name: &str) -> Result<bool, ContextError> {
        let v = self.get_value(name)?;
        v.as_bool().ok_or_else(|| ContextError::TypeMismatch {
            name: name.to_string(),
            expected: "bool",
            found: v.clone(),
        })
    }

    fn get_usize(&self, name: &str) -> Result<usize, ContextError> {
        let v = self.get_value(name)?;
        match v.as_i64() {
            Some(n) if n >= 0 => Ok(n as usize),
            _ => Err(ContextError::TypeMismatch {
                name: name.to_string(),
                expected: "non-negative integer",
                found: v,
            }),
        }
    }

    fn get_text(&self, name: &str) -> Result<String, ContextError> {
        match self.get_value(name)? {
            Value::Text(s) => Ok(s),
            other => Err(ContextError::TypeMismatch {
                name: name.to_string(),
                expected: "text",
                found: other,
            }),
        }
    }
}

/// Order in which a selector hands out its settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    Exact,
    Ascending(String),
    Descending(String),
    /// Reshuffled every cycle; cycle `c` uses seed `seed + c`.
    Shuffled(u64),
}

/// Named list of settings handed out in a fixed policy order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selector {
    pub order: Order,
    #[serde(default)]
    settings: Vec<Setting>,
    #[serde(skip)]
    position: usize,
}

impl Selector {
    pub fn new(order: Order) -> Self {
        Self {
            order,
            settings: Vec::new(),
            position: 0,
        }
    }

    pub fn with_settings(order: Order, settings: impl IntoIterator<Item = Setting>) -> Self {
        let mut selector = Self::new(order);
        for s in settings {
            selector.add_setting(s);
        }
        selector
    }

    /// Adds a setting. Its key is its insertion index.
    pub fn add_setting(&mut self, setting: Setting) -> SettingKey {
        let key = SettingKey(self.settings.len() as u64);
        self.settings.push(setting.with_key(key));
        key
    }

    pub fn settings(&self) -> &[Setting] {
        &self.settings
    }

    pub fn len(&self) -> usize {
        self.settings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }

    fn renumber(&mut self) {
        for (i, s) in self.settings.iter_mut().enumerate() {
            s.key = SettingKey(i as u64);
        }
    }

    fn cycle_order(&self, cycle: usize) -> Vec<usize> {
        let mut idx: Vec<usize> = (0..self.settings.len()).collect();
        match &self.order {
            Order::Exact => {}
            Order::Ascending(param) => idx.sort_by(|&a, &b| {
                compare_values(self.settings[a].get(param), self.settings[b].get(param))
            }),
            Order::Descending(param) => idx.sort_by(|&a, &b| {
                compare_values(self.settings[b].get(param), self.settings[a].get(param))
            }),
            Order::Shuffled(seed) => {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(cycle as u64));
                idx.shuffle(&mut rng);
            }
        }
        idx
    }

    pub fn iter_settings(&self, cycles: usize) -> Vec<Setting> {
        (0..cycles)
            .flat_map(|c| self.cycle_order(c))
            .map(|i| self.settings[i].clone())
            .collect()
    }

    /// Next setting in order, wrapping into a new cycle when exhausted.
    pub fn next_setting(&mut self) -> Option<Setting> {
        let n = self.settings.len();
        if n == 0 {
            return None;
        }
        let cycle = self.position / n;
        let idx = self.cycle_order(cycle)[self.position % n];
        self.position += 1;
        Some(self.settings[idx].clone())
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a.and_then(Value::as_f64), b.and_then(Value::as_f64)) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        _ => a.map(|v| v.to_string()).cmp(&b.map(|v| v.to_string())),
    }
}

/// In-memory context: parameters, staged edits and named selectors.
#[derive(Debug, Clone, Default)]
pub struct MemoryContext {
    parameters: BTreeMap<String, Value>,
    staged: BTreeMap<String, Value>,
    selectors: HashMap<String, Selector>,
    current: Setting,
    history: Vec<Setting>,
}

impl MemoryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_parameter(name, value);
        self
    }

    pub fn with_selector(mut self, name: impl Into<String>, selector: Selector) -> Self {
        self.add_selector(name, selector);
        self
    }

    /// Sets a parameter immediately, bypassing staging.
    pub fn set_parameter(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.parameters.insert(name.into(), value.into());
    }

    /// Stages a change that takes effect on the next `apply_changes`.
    pub fn stage_value(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.staged.insert(name.into(), value.into());
    }

    pub fn add_selector(&mut self, name: impl Into<String>, mut selector: Selector) {
        selector.renumber();
        self.selectors.insert(name.into(), selector);
    }

    pub fn selector(&self, name: &str) -> Option<&Selector> {
        self.selectors.get(name)
    }

    /// Settings that were current before each `next_setting(.., true)`.
    pub fn history(&self) -> &[Setting] {
        &self.history
    }
}

impl ContextStore for MemoryContext {
    fn get_value(&self, name: &str) -> Result<Value, ContextError> {
        self.current
            .get(name)
            .or_else(|| self.parameters.get(name))
            .cloned()
            .ok_or_else(|| ContextError::UnknownParameter(name.to_string()))
    }

    fn iter_settings(&self, selector: &str, cycles: usize) -> Result<Vec<Setting>, ContextError> {
        self.selectors
            .get(selector)
            .map(|s| s.iter_settings(cycles))
            .ok_or_else(|| ContextError::UnknownSelector(selector.to_string()))
    }

    fn next_setting(&mut self, selector: &str, save_prior: bool) -> Result<(), ContextError> {
        let sel = self
            .selectors
            .get_mut(selector)
            .ok_or_else(|| ContextError::UnknownSelector(selector.to_string()))?;
        let next = sel
            .next_setting()
            .ok_or_else(|| ContextError::EmptySelector(selector.to_string()))?;
        let prior = std::mem::replace(&mut self.current, next);
        if save_prior && !prior.is_empty() {
            self.history.push(prior);
        }
        debug!(selector, key = self.current.key.0, "advanced to next setting");
        Ok(())
    }

    fn apply_changes(&mut self) -> Result<bool, ContextError> {
        if self.staged.is_empty() {
            return Ok(false);
        }
        let staged = std::mem::take(&mut self.staged);
        debug!(count = staged.len(), "applying staged context changes");
        self.parameters.extend(staged);
        Ok(true)
    }

    fn changes_pending(&self) -> bool {
        !self.staged.is_empty()
    }

    fn current_setting(&self) -> Setting {
        let base: Setting = self
            .parameters
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.current.merged_over(&base)
    }
}

#[cfg(test)]
mod tests {
    use super::{ContextStore, MemoryContext, Order, Selector};
    use crate::error::ContextError;
    use crate::value::{Setting, Value};

    fn levels(order: Order) -> Selector {
        Selector::with_settings(
            order,
            [40.0, 60.0, 50.0].map(|l| Setting::new().with("level", l)),
        )
    }

    #[test]
    /// Test that selectors hand out settings in their configured order and wrap.
    fn test_selector_orders() {
        let asc: Vec<f64> = levels(Order::Ascending("level".into()))
            .iter_settings(2)
            .iter()
            .map(|s| s.get_f64("level").unwrap())
            .collect();
        assert_eq!(asc, vec![40.0, 50.0, 60.0, 40.0, 50.0, 60.0]);

        let mut desc = levels(Order::Descending("level".into()));
        let first = desc.next_setting().unwrap();
        assert_eq!(first.get_f64("level"), Some(60.0));
        desc.next_setting();
        desc.next_setting();
        assert_eq!(desc.next_setting().unwrap().get_f64("level"), Some(60.0));
    }

    #[test]
    /// Test that a shuffled selector is a permutation per cycle and reproducible.
    fn test_shuffled_selector_is_reproducible_permutation() {
        let a = levels(Order::Shuffled(11)).iter_settings(3);
        let b = levels(Order::Shuffled(11)).iter_settings(3);
        assert_eq!(a, b);
        for cycle in a.chunks(3) {
            let mut l: Vec<f64> = cycle.iter().map(|s| s.get_f64("level").unwrap()).collect();
            l.sort_by(f64::total_cmp);
            assert_eq!(l, vec![40.0, 50.0, 60.0]);
        }
    }

    #[test]
    /// Test that the current setting overrides parameters and history is kept.
    fn test_next_setting_layers_over_parameters() {
        let mut ctx = MemoryContext::new()
            .with_parameter("level", 30.0)
            .with_parameter("go_probability", 0.5)
            .with_selector("go", levels(Order::Exact));

        assert_eq!(ctx.get_f64("level").unwrap(), 30.0);
        ctx.next_setting("go", false).unwrap();
        assert_eq!(ctx.get_f64("level").unwrap(), 40.0);
        ctx.next_setting("go", true).unwrap();
        assert_eq!(ctx.get_f64("level").unwrap(), 60.0);
        assert_eq!(ctx.history().len(), 1);

        let current = ctx.current_setting();
        assert_eq!(current.get_f64("go_probability"), Some(0.5));
        assert_eq!(current.get_f64("level"), Some(60.0));
    }

    #[test]
    fn test_staged_values_wait_for_apply() {
        let mut ctx = MemoryContext::new().with_parameter("hold_duration", 0.2);
        ctx.stage_value("hold_duration", 0.5);
        assert!(ctx.changes_pending());
        assert_eq!(ctx.get_f64("hold_duration").unwrap(), 0.2);
        assert!(ctx.apply_changes().unwrap());
        assert_eq!(ctx.get_f64("hold_duration").unwrap(), 0.5);
        assert!(!ctx.apply_changes().unwrap());
    }

    #[test]
    fn test_unknown_names_are_errors() {
        let mut ctx = MemoryContext::new().with_parameter("training_mode", Value::Text("no".into()));
        assert_eq!(
            ctx.get_value("missing"),
            Err(ContextError::UnknownParameter("missing".into()))
        );
        assert_eq!(
            ctx.next_setting("nope", false),
            Err(ContextError::UnknownSelector("nope".into()))
        );
        assert!(matches!(
            ctx.get_bool("training_mode"),
            Err(ContextError::TypeMismatch { .. })
        ));
    }
}
