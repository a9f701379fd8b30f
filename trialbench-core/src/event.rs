use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Symbolic notifications the trial state machine reacts to.
///
/// Digital and analog detection of the same physical condition are distinct
/// values (`NpStart` vs `DigitalNpStart`); the state machine treats them alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    NpStart,
    NpEnd,
    DigitalNpStart,
    DigitalNpEnd,
    RewardStart,
    RewardEnd,
    DigitalRewardStart,
    DigitalRewardEnd,
    NpDurationElapsed,
    HoldStart,
    HoldDurationElapsed,
    ResponseStart,
    ResponseEnd,
    ResponseDurationElapsed,
    ToStart,
    ToEnd,
    ToDurationElapsed,
    ItiStart,
    ItiEnd,
    ItiDurationElapsed,
    TrialStart,
    TrialEnd,
}

impl Event {
    pub const ALL: [Event; 22] = [
        Event::NpStart,
        Event::NpEnd,
        Event::DigitalNpStart,
        Event::DigitalNpEnd,
        Event::RewardStart,
        Event::RewardEnd,
        Event::DigitalRewardStart,
        Event::DigitalRewardEnd,
        Event::NpDurationElapsed,
        Event::HoldStart,
        Event::HoldDurationElapsed,
        Event::ResponseStart,
        Event::ResponseEnd,
        Event::ResponseDurationElapsed,
        Event::ToStart,
        Event::ToEnd,
        Event::ToDurationElapsed,
        Event::ItiStart,
        Event::ItiEnd,
        Event::ItiDurationElapsed,
        Event::TrialStart,
        Event::TrialEnd,
    ];

    /// Name used when the event is forwarded to the action dispatcher.
    pub fn name(&self) -> &'static str {
        match self {
            Event::NpStart => "np_start",
            Event::NpEnd => "np_end",
            Event::DigitalNpStart => "digital_np_start",
            Event::DigitalNpEnd => "digital_np_end",
            Event::RewardStart => "reward_start",
            Event::RewardEnd => "reward_end",
            Event::DigitalRewardStart => "digital_reward_start",
            Event::DigitalRewardEnd => "digital_reward_end",
            Event::NpDurationElapsed => "np_duration_elapsed",
            Event::HoldStart => "hold_start",
            Event::HoldDurationElapsed => "hold_duration_elapsed",
            Event::ResponseStart => "response_start",
            Event::ResponseEnd => "response_end",
            Event::ResponseDurationElapsed => "response_duration_elapsed",
            Event::ToStart => "to_start",
            Event::ToEnd => "to_end",
            Event::ToDurationElapsed => "to_duration_elapsed",
            Event::ItiStart => "iti_start",
            Event::ItiEnd => "iti_end",
            Event::ItiDurationElapsed => "iti_duration_elapsed",
            Event::TrialStart => "trial_start",
            Event::TrialEnd => "trial_end",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|e| e.name() == name)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Event::NpStart => "initiated nose poke",
            Event::NpEnd => "withdrew from nose poke",
            Event::DigitalNpStart => "initiated nose poke (digital)",
            Event::DigitalNpEnd => "withdrew from nose poke (digital)",
            Event::RewardStart => "reward contact",
            Event::RewardEnd => "withdrew from reward",
            Event::DigitalRewardStart => "reward contact (digital)",
            Event::DigitalRewardEnd => "withdrew from reward (digital)",
            Event::NpDurationElapsed => "nose poke duration met",
            Event::HoldStart => "hold period started",
            Event::HoldDurationElapsed => "hold period over",
            Event::ResponseStart => "response period started",
            Event::ResponseEnd => "response timed out",
            Event::ResponseDurationElapsed => "response duration elapsed",
            Event::ToStart => "timeout started",
            Event::ToEnd => "timeout over",
            Event::ToDurationElapsed => "timeout duration elapsed",
            Event::ItiStart => "ITI started",
            Event::ItiEnd => "ITI over",
            Event::ItiDurationElapsed => "ITI duration elapsed",
            Event::TrialStart => "trial started",
            Event::TrialEnd => "trial over",
        }
    }

    /// True for events that originate from a sensor rather than a timer.
    pub fn is_hardware(&self) -> bool {
        self.is_poke_start() || self.is_poke_end() || self.is_reward_start() || self.is_reward_end()
    }

    pub fn is_poke_start(&self) -> bool {
        matches!(self, Event::NpStart | Event::DigitalNpStart)
    }

    pub fn is_poke_end(&self) -> bool {
        matches!(self, Event::NpEnd | Event::DigitalNpEnd)
    }

    pub fn is_reward_start(&self) -> bool {
        matches!(self, Event::RewardStart | Event::DigitalRewardStart)
    }

    pub fn is_reward_end(&self) -> bool {
        matches!(self, Event::RewardEnd | Event::DigitalRewardEnd)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    Rising,
    Falling,
}

/// One `(edge, channel) -> event` entry, the serializable form of an [`EventMap`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMapping {
    pub edge: Edge,
    pub channel: String,
    pub event: Event,
}

/// Normalizes hardware edges into events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventMap {
    entries: HashMap<(Edge, String), Event>,
}

impl EventMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Digital nose-poke and reward-contact lines on the given channels.
    pub fn digital(np_channel: &str, reward_channel: &str) -> Self {
        let mut map = Self::new();
        map.insert(Edge::Rising, np_channel, Event::DigitalNpStart);
        map.insert(Edge::Falling, np_channel, Event::DigitalNpEnd);
        map.insert(Edge::Rising, reward_channel, Event::DigitalRewardStart);
        map.insert(Edge::Falling, reward_channel, Event::DigitalRewardEnd);
        map
    }

    pub fn insert(&mut self, edge: Edge, channel: impl Into<String>, event: Event) -> Option<Event> {
        self.entries.insert((edge, channel.into()), event)
    }

    pub fn lookup(&self, edge: Edge, channel: &str) -> Option<Event> {
        self.entries.get(&(edge, channel.to_string())).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn mappings(&self) -> Vec<EventMapping> {
        let mut out: Vec<EventMapping> = self
            .entries
            .iter()
            .map(|((edge, channel), event)| EventMapping {
                edge: *edge,
                channel: channel.clone(),
                event: *event,
            })
            .collect();
        out.sort_by(|a, b| a.channel.cmp(&b.channel).then(a.event.name().cmp(b.event.name())));
        out
    }
}

impl FromIterator<EventMapping> for EventMap {
    fn from_iter<I: IntoIterator<Item = EventMapping>>(iter: I) -> Self {
        let mut map = EventMap::new();
        for m in iter {
            map.insert(m.edge, m.channel, m.event);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::{Edge, Event, EventMap};

    #[test]
    /// Test that every event name maps back to its event.
    fn test_names_are_unique_and_reversible() {
        for event in Event::ALL {
            assert_eq!(Event::from_name(event.name()), Some(event));
        }
        assert_eq!(Event::from_name("not_an_event"), None);
    }

    #[test]
    fn test_digital_map_normalizes_edges() {
        let map = EventMap::digital("np", "spout");
        assert_eq!(map.lookup(Edge::Rising, "np"), Some(Event::DigitalNpStart));
        assert_eq!(map.lookup(Edge::Falling, "spout"), Some(Event::DigitalRewardEnd));
        assert_eq!(map.lookup(Edge::Rising, "lick"), None);
        let rebuilt: EventMap = map.mappings().into_iter().collect();
        assert_eq!(rebuilt, map);
    }

    #[test]
    fn test_hardware_classification() {
        assert!(Event::DigitalNpStart.is_poke_start());
        assert!(Event::RewardEnd.is_hardware());
        assert!(!Event::HoldDurationElapsed.is_hardware());
    }
}
