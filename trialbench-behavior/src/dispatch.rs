use crate::error::BehaviorError;
use crate::state::TrialStateMachine;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use rand::Rng;
use std::time::Duration;
use tracing::{debug, info, warn};
use trialbench_core::{ActionDispatcher, ContextStore, Edge, Event, EventMap};
use trialbench_timing::Timer;

/// Per-event errors are logged and dropped; fatal ones are returned.
fn survive(result: Result<(), BehaviorError>) -> Result<(), BehaviorError> {
    match result {
        Err(e) if !e.is_fatal() => {
            warn!(error = %e, "event processing failed, continuing");
            Ok(())
        }
        other => other,
    }
}

/// Operator requests forwarded to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Pause,
    Resume,
    Remind,
    Apply,
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchMessage {
    /// Raw edge from an acquisition callback, normalized through the event map.
    Edge {
        edge: Edge,
        channel: String,
        timestamp: Option<f64>,
    },
    Event {
        event: Event,
        timestamp: Option<f64>,
    },
    Request(Request),
    Shutdown,
}

impl DispatchMessage {
    pub fn timestamp(&self) -> Option<f64> {
        match self {
            DispatchMessage::Edge { timestamp, .. } | DispatchMessage::Event { timestamp, .. } => {
                *timestamp
            }
            DispatchMessage::Request(_) | DispatchMessage::Shutdown => None,
        }
    }
}

/// Cloneable handle for acquisition callbacks and operator controls. Safe to
/// use from any thread; messages are processed in the order they were sent.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<DispatchMessage>,
}

impl EventSender {
    pub fn send(&self, message: DispatchMessage) -> Result<(), BehaviorError> {
        self.tx.send(message).map_err(|_| BehaviorError::Disconnected)
    }

    pub fn send_edge(
        &self,
        edge: Edge,
        channel: impl Into<String>,
        timestamp: Option<f64>,
    ) -> Result<(), BehaviorError> {
        self.send(DispatchMessage::Edge {
            edge,
            channel: channel.into(),
            timestamp,
        })
    }

    pub fn send_event(&self, event: Event, timestamp: Option<f64>) -> Result<(), BehaviorError> {
        self.send(DispatchMessage::Event { event, timestamp })
    }

    pub fn request(&self, request: Request) -> Result<(), BehaviorError> {
        self.send(DispatchMessage::Request(request))
    }

    pub fn shutdown(&self) -> Result<(), BehaviorError> {
        self.send(DispatchMessage::Shutdown)
    }
}

/// Serializes edges, requests and timer expirations into the state machine.
///
/// Each message runs to completion before the next is received, so the
/// machine never sees re-entrant events. Timers are polled between messages
/// on the same thread.
pub struct EventDispatch<C, D, T, R>
where
    C: ContextStore,
    D: ActionDispatcher,
    T: Timer,
    R: Rng,
{
    machine: TrialStateMachine<C, D, T, R>,
    event_map: EventMap,
    rx: Receiver<DispatchMessage>,
    processed: usize,
}

impl<C, D, T, R> EventDispatch<C, D, T, R>
where
    C: ContextStore,
    D: ActionDispatcher,
    T: Timer,
    R: Rng,
{
    pub fn new(machine: TrialStateMachine<C, D, T, R>, event_map: EventMap) -> (Self, EventSender) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let dispatch = Self {
            machine,
            event_map,
            rx,
            processed: 0,
        };
        (dispatch, EventSender { tx })
    }

    pub fn machine(&self) -> &TrialStateMachine<C, D, T, R> {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut TrialStateMachine<C, D, T, R> {
        &mut self.machine
    }

    pub fn into_machine(self) -> TrialStateMachine<C, D, T, R> {
        self.machine
    }

    /// Messages handled so far.
    pub fn processed(&self) -> usize {
        self.processed
    }

    /// Handles one message. Returns true when the loop should end.
    fn dispatch(&mut self, message: DispatchMessage) -> Result<bool, BehaviorError> {
        self.processed += 1;
        let result = match message {
            DispatchMessage::Edge {
                edge,
                channel,
                timestamp,
            } => match self.event_map.lookup(edge, &channel) {
                Some(event) => self.machine.handle_event(event, timestamp),
                None => {
                    warn!(?edge, channel = %channel, "no event mapped to edge");
                    Ok(())
                }
            },
            DispatchMessage::Event { event, timestamp } => self.machine.handle_event(event, timestamp),
            DispatchMessage::Request(request) => {
                debug!(?request, "operator request");
                match request {
                    Request::Pause => self.machine.request_pause().map(|_| ()),
                    Request::Resume => self.machine.request_resume(),
                    Request::Remind => {
                        self.machine.request_remind();
                        Ok(())
                    }
                    Request::Apply => self.machine.request_apply(),
                    Request::Stop => {
                        survive(self.machine.stop_experiment())?;
                        return Ok(true);
                    }
                }
            }
            DispatchMessage::Shutdown => return Ok(true),
        };
        survive(result)?;
        Ok(false)
    }

    fn poll(&mut self, now: f64) -> Result<(), BehaviorError> {
        survive(self.machine.poll(now).map(|_| ()))
    }

    /// Fires the timers due by the message's timestamp (or by now, for
    /// unstamped messages) before handling it, so a timer that expired
    /// before an edge is always seen first.
    fn deliver(&mut self, message: DispatchMessage) -> Result<bool, BehaviorError> {
        let now = self.machine.get_ts();
        let at = message.timestamp().map_or(now, |ts| ts.min(now));
        self.poll(at)?;
        self.dispatch(message)
    }

    /// Drains every queued message in arrival order, firing timers in
    /// between as they come due, then fires the rest due by the machine's
    /// clock. Returns true if a stop or shutdown was seen.
    pub fn process_pending(&mut self) -> Result<bool, BehaviorError> {
        loop {
            match self.rx.try_recv() {
                Ok(message) => {
                    if self.deliver(message)? {
                        return Ok(true);
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        let now = self.machine.get_ts();
        self.poll(now)?;
        Ok(false)
    }

    /// Blocks on the channel until shutdown, stop, or every sender is gone,
    /// waking at least every `tick` and at each pending deadline.
    pub fn run(&mut self, tick: Duration) -> Result<(), BehaviorError> {
        info!("event dispatch running");
        let rx = self.rx.clone();
        loop {
            let now = self.machine.get_ts();
            self.poll(now)?;
            let wait = self
                .machine
                .next_deadline()
                .map(|due| Duration::from_secs_f64((due - now).max(0.0)))
                .map_or(tick, |until| until.min(tick));

            crossbeam_channel::select! {
                recv(rx) -> message => match message {
                    Ok(message) => {
                        if self.deliver(message)? {
                            break;
                        }
                    }
                    Err(_) => {
                        debug!("all event senders dropped");
                        break;
                    }
                },
                default(wait) => {}
            }
        }
        info!(processed = self.processed, "event dispatch stopped");
        Ok(())
    }
}
