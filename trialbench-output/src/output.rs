use crate::engine::{Engine, EngineGuard, UpdateMethod};
use crate::error::OutputError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use trialbench_core::{ActionDispatcher, ActionError, ContextError, ContextStore, Setting};
use trialbench_signal::{
    compose, initialize_factory, Block, Calibration, ContextMap, QueueEvent, QueueKey,
    QueueOrdering, SignalBuffer, SignalQueue, UploadInfo, WaveformFactory,
};

fn default_buffer_size() -> f64 {
    10.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub name: String,
    pub channel: String,
    pub engine: String,
    pub fs: f64,
    /// Seconds between writing a sample and it reaching the transducer.
    #[serde(default)]
    pub filter_delay: f64,
    /// Seconds of generated samples kept for rewriting.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    Inactive,
    Ready,
    Active,
}

/// What a buffered output draws its samples from while active.
pub trait OutputSource: Send {
    fn is_ready(&self) -> bool;

    /// Exactly `n` samples.
    fn next_samples(&mut self, n: usize) -> Vec<f64>;

    fn is_complete(&self) -> bool;

    fn get_duration(&self) -> f64;

    fn activated(&mut self, _t0: f64) {}

    fn deactivated(&mut self) {}
}

/// Start and end of an activation, in seconds on the engine clock.
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
    pub name: String,
    pub offset: u64,
    /// Includes the filter delay.
    pub start: f64,
    /// `None` for outputs without a finite duration.
    pub end: Option<f64>,
    /// Engine time when the activation was made.
    pub now: f64,
}

impl Activation {
    /// Invokes `<name>_start` now and schedules `<name>_end`.
    pub fn notify<D: ActionDispatcher + ?Sized>(&self, dispatcher: &mut D) -> Result<(), ActionError> {
        dispatcher.invoke(&format!("{}_start", self.name), Some(self.start))?;
        if let Some(end) = self.end {
            dispatcher.invoke_actions_at(
                &format!("{}_end", self.name),
                end,
                self.now,
                Setting::new(),
            )?;
        }
        Ok(())
    }
}

/// Object-safe view used to activate several outputs together.
pub trait Output: Send {
    fn name(&self) -> &str;

    fn engine_name(&self) -> &str;

    fn state(&self) -> OutputState;

    fn activate_locked(
        &mut self,
        engine: &dyn Engine,
        guard: &mut EngineGuard<'_>,
        offset: u64,
    ) -> Result<Activation, OutputError>;

    fn deactivate_locked(
        &mut self,
        engine: &dyn Engine,
        guard: &mut EngineGuard<'_>,
        offset: u64,
    ) -> Result<(), OutputError>;
}

/// Channel writer that caches what it generated so any part of the
/// hardware buffer can be regenerated from an absolute sample offset.
pub struct BufferedOutput<S> {
    config: OutputConfig,
    source: S,
    buffer: SignalBuffer,
    offset: u64,
    active: bool,
    completed: bool,
}

impl<S: OutputSource> BufferedOutput<S> {
    pub fn with_source(config: OutputConfig, source: S) -> Self {
        let buffer = SignalBuffer::new(config.fs, config.buffer_size);
        Self {
            config,
            source,
            buffer,
            offset: 0,
            active: false,
            completed: false,
        }
    }

    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn buffer(&self) -> &SignalBuffer {
        &self.buffer
    }

    pub fn state(&self) -> OutputState {
        if self.active {
            OutputState::Active
        } else if self.source.is_ready() {
            OutputState::Ready
        } else {
            OutputState::Inactive
        }
    }

    pub fn is_ready(&self) -> bool {
        self.source.is_ready()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// True once after the source ran out while active.
    pub fn take_completed(&mut self) -> bool {
        std::mem::take(&mut self.completed)
    }

    pub fn get_duration(&self) -> f64 {
        self.source.get_duration()
    }

    fn get_next_samples(&mut self, n: usize) -> Vec<f64> {
        if !self.active {
            return vec![0.0; n];
        }
        let ub = self.buffer.get_samples_ub();
        let zero_padding = (self.offset.saturating_sub(ub) as usize).min(n);
        let mut out = vec![0.0; zero_padding];
        if n > zero_padding {
            out.extend(self.source.next_samples(n - zero_padding));
        }
        if self.source.is_complete() {
            debug!(output = %self.config.name, at = ub + n as u64, "output complete");
            self.active = false;
            self.completed = true;
            self.source.deactivated();
        }
        out
    }

    /// Samples for `[offset, offset + n)`: cached ones first, zeros before the
    /// activation offset, then newly generated ones.
    pub fn get_samples(&mut self, offset: u64, n: usize) -> Result<Vec<f64>, OutputError> {
        if self.buffer.is_empty() {
            self.buffer.clear_at(offset);
        }
        let lb = self.buffer.get_samples_lb();
        let ub = self.buffer.get_samples_ub();
        let mismatch = || OutputError::OffsetMismatch {
            name: self.config.name.clone(),
            offset,
            lb,
            ub,
        };
        if offset > ub || offset < lb {
            return Err(mismatch());
        }
        let cached_ub = (offset + n as u64).min(ub);
        let mut out = if offset < cached_ub {
            self.buffer
                .get_range_samples(offset, cached_ub)
                .ok_or_else(mismatch)?
        } else {
            Vec::with_capacity(n)
        };
        let remaining = n - out.len();
        if remaining > 0 {
            let data = self.get_next_samples(remaining);
            self.buffer.append_data(&data);
            out.extend(data);
        }
        Ok(out)
    }

    fn activate_with<E: Engine + ?Sized>(
        &mut self,
        engine: &E,
        guard: &mut EngineGuard<'_>,
        offset: u64,
    ) -> Result<Activation, OutputError> {
        if !self.source.is_ready() {
            return Err(OutputError::NotReady(self.config.name.clone()));
        }
        let hw_ub = guard.ub(&self.config.channel)?;
        debug!(output = %self.config.name, offset, hw_ub, "activating output");

        self.offset = offset;
        self.active = true;
        self.completed = false;
        self.buffer.invalidate_samples(offset);
        let fs = self.config.fs;
        self.source.activated(offset as f64 / fs);
        let duration = self.source.get_duration();

        if offset < hw_ub {
            let channel = self.config.channel.clone();
            let written = self
                .get_samples(offset, (hw_ub - offset) as usize)
                .and_then(|samples| {
                    engine
                        .update_hw_ao(guard, offset, &channel, &samples, UpdateMethod::WritePosition)
                        .map_err(OutputError::from)
                });
            if let Err(e) = written {
                warn!(output = %self.config.name, offset, error = %e, "activation failed");
                self.silence_from(offset, hw_ub);
                return Err(e);
            }
        }

        let start = offset as f64 / fs + self.config.filter_delay;
        Ok(Activation {
            name: self.config.name.clone(),
            offset,
            start,
            end: duration.is_finite().then(|| start + duration),
            now: engine.get_ts(),
        })
    }

    /// Leaves the output inactive from `offset` with zeros cached up to `prev_ub`.
    fn silence_from(&mut self, offset: u64, prev_ub: u64) {
        self.active = false;
        self.completed = false;
        self.source.deactivated();
        self.buffer.invalidate_samples(offset);
        let ub = self.buffer.get_samples_ub();
        if prev_ub > ub {
            self.buffer.append_data(&vec![0.0; (prev_ub - ub) as usize]);
        }
    }

    fn deactivate_with<E: Engine + ?Sized>(
        &mut self,
        engine: &E,
        guard: &mut EngineGuard<'_>,
        offset: u64,
    ) -> Result<(), OutputError> {
        if !self.active {
            return Ok(());
        }
        let channel = self.config.channel.clone();
        let hw_ub = guard.ub(&channel)?;
        let start = offset.max(engine.earliest_offset());
        debug!(output = %self.config.name, offset, start, hw_ub, "deactivating output");
        // The output stays active unless the silence reached the hardware.
        if start < hw_ub {
            let silence = vec![0.0; (hw_ub - start) as usize];
            engine.update_hw_ao(guard, start, &channel, &silence, UpdateMethod::WritePosition)?;
        }
        self.silence_from(start, hw_ub);
        Ok(())
    }

    /// Starts the output at `offset` (absolute sample on the channel clock).
    ///
    /// The engine lock is held while the buffer is rewritten and released
    /// before `<name>_start` and `<name>_end` are announced. On a buffer
    /// underrun the output is left inactive and the error is returned.
    pub fn activate<E, D>(
        &mut self,
        engine: &E,
        offset: u64,
        dispatcher: &mut D,
    ) -> Result<Activation, OutputError>
    where
        E: Engine + ?Sized,
        D: ActionDispatcher + ?Sized,
    {
        let activation = {
            let mut guard = engine.lock();
            self.activate_with(engine, &mut guard, offset)?
        };
        activation.notify(dispatcher)?;
        Ok(activation)
    }

    /// Stops the output from `offset` on. A no-op when already inactive.
    /// If the hardware write fails the output is left active.
    pub fn deactivate<E: Engine + ?Sized>(&mut self, engine: &E, offset: u64) -> Result<(), OutputError> {
        let mut guard = engine.lock();
        self.deactivate_with(engine, &mut guard, offset)
    }

    /// Appends the next `n` samples at the end of the engine's buffer for
    /// this channel. Returns the offset written.
    pub fn write_next<E: Engine + ?Sized>(&mut self, engine: &E, n: usize) -> Result<u64, OutputError> {
        let mut guard = engine.lock();
        let channel = self.config.channel.clone();
        let offset = guard.ub(&channel)?;
        let samples = self.get_samples(offset, n)?;
        if let Err(e) = engine.update_hw_ao(&mut guard, offset, &channel, &samples, UpdateMethod::SpaceAvailable) {
            self.buffer.invalidate_samples(offset);
            return Err(e.into());
        }
        Ok(offset)
    }
}

impl<S: OutputSource> Output for BufferedOutput<S> {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn engine_name(&self) -> &str {
        &self.config.engine
    }

    fn state(&self) -> OutputState {
        BufferedOutput::state(self)
    }

    fn activate_locked(
        &mut self,
        engine: &dyn Engine,
        guard: &mut EngineGuard<'_>,
        offset: u64,
    ) -> Result<Activation, OutputError> {
        self.activate_with(engine, guard, offset)
    }

    fn deactivate_locked(
        &mut self,
        engine: &dyn Engine,
        guard: &mut EngineGuard<'_>,
        offset: u64,
    ) -> Result<(), OutputError> {
        self.deactivate_with(engine, guard, offset)
    }
}

/// A single prepared waveform per activation.
pub struct EpochSource {
    block: Block,
    map: ContextMap,
    calibration: Arc<dyn Calibration>,
    fs: f64,
    factory: Option<Box<dyn WaveformFactory>>,
}

impl OutputSource for EpochSource {
    fn is_ready(&self) -> bool {
        self.factory.is_some()
    }

    fn next_samples(&mut self, n: usize) -> Vec<f64> {
        match self.factory.as_mut() {
            Some(factory) => factory.next(n),
            None => vec![0.0; n],
        }
    }

    fn is_complete(&self) -> bool {
        self.factory.as_ref().map_or(true, |f| f.is_complete())
    }

    fn get_duration(&self) -> f64 {
        self.factory.as_ref().map_or(0.0, |f| f.get_duration())
    }

    fn deactivated(&mut self) {
        self.factory = None;
    }
}

pub type EpochOutput = BufferedOutput<EpochSource>;

impl BufferedOutput<EpochSource> {
    /// Parameters are read from context names prefixed with `<name>_`.
    pub fn new(
        config: OutputConfig,
        block: Block,
        calibration: Arc<dyn Calibration>,
    ) -> Result<Self, OutputError> {
        let map = compose(&block, &format!("{}_", config.name))?;
        let source = EpochSource {
            block,
            map,
            calibration,
            fs: config.fs,
            factory: None,
        };
        Ok(Self::with_source(config, source))
    }

    pub fn context_names(&self) -> Vec<String> {
        self.source.map.context_names().map(str::to_string).collect()
    }

    /// Builds the waveform for the context's current setting.
    pub fn prepare<C: ContextStore + ?Sized>(&mut self, context: &C) -> Result<(), OutputError> {
        self.prepare_setting(&context.current_setting())
    }

    pub fn prepare_setting(&mut self, setting: &Setting) -> Result<(), OutputError> {
        let source = &mut self.source;
        let factory = initialize_factory(
            &source.block,
            &source.map,
            setting,
            source.fs,
            source.calibration.as_ref(),
        )?;
        debug!(output = %self.config.name, duration = factory.get_duration(), "output prepared");
        source.factory = Some(factory);
        Ok(())
    }
}

/// Streams a [`SignalQueue`].
pub struct QueuedSource {
    queue: SignalQueue,
    auto_decrement: bool,
    block: Block,
    map: ContextMap,
    calibration: Arc<dyn Calibration>,
}

impl QueuedSource {
    pub fn queue(&self) -> &SignalQueue {
        &self.queue
    }
}

impl OutputSource for QueuedSource {
    fn is_ready(&self) -> bool {
        !self.queue.is_empty()
    }

    fn next_samples(&mut self, n: usize) -> Vec<f64> {
        self.queue.pop_buffer(n, self.auto_decrement)
    }

    fn is_complete(&self) -> bool {
        self.queue.is_exhausted()
    }

    fn get_duration(&self) -> f64 {
        f64::INFINITY
    }

    fn activated(&mut self, t0: f64) {
        self.queue.set_t0(t0);
    }

    fn deactivated(&mut self) {
        self.queue.next_trial();
    }
}

pub type QueuedEpochOutput = BufferedOutput<QueuedSource>;

impl BufferedOutput<QueuedSource> {
    pub fn new(
        config: OutputConfig,
        block: Block,
        calibration: Arc<dyn Calibration>,
        ordering: QueueOrdering,
    ) -> Result<Self, OutputError> {
        let map = compose(&block, &format!("{}_", config.name))?;
        let mut queue = SignalQueue::new(ordering);
        queue.set_fs(config.fs)?;
        let source = QueuedSource {
            queue,
            auto_decrement: false,
            block,
            map,
            calibration,
        };
        Ok(Self::with_source(config, source))
    }

    pub fn with_auto_decrement(mut self, auto_decrement: bool) -> Self {
        self.source.auto_decrement = auto_decrement;
        self
    }

    pub fn queue(&self) -> &SignalQueue {
        &self.source.queue
    }

    pub fn queue_mut(&mut self) -> &mut SignalQueue {
        &mut self.source.queue
    }

    /// Queues `setting`. Missing `averages` and `iti_duration` are taken
    /// from `<name>_averages` and `<name>_iti_duration` in the setting.
    pub fn add_setting(
        &mut self,
        setting: &Setting,
        averages: Option<usize>,
        iti_duration: Option<f64>,
    ) -> Result<QueueKey, OutputError> {
        let name = &self.config.name;
        let averages = match averages {
            Some(n) => n,
            None => {
                let key = format!("{}_averages", name);
                let value = setting
                    .get(&key)
                    .ok_or_else(|| ContextError::UnknownParameter(key.clone()))?;
                match value.as_i64() {
                    Some(n) if n >= 0 => n as usize,
                    _ => {
                        return Err(ContextError::TypeMismatch {
                            name: key,
                            expected: "non-negative integer",
                            found: value.clone(),
                        }
                        .into())
                    }
                }
            }
        };
        let iti_duration = match iti_duration {
            Some(d) => d,
            None => {
                let key = format!("{}_iti_duration", name);
                setting
                    .get_f64(&key)
                    .ok_or(ContextError::UnknownParameter(key))?
            }
        };
        let source = &mut self.source;
        let factory = initialize_factory(
            &source.block,
            &source.map,
            setting,
            self.config.fs,
            source.calibration.as_ref(),
        )?;
        Ok(source
            .queue
            .append(factory, averages, &[iti_duration], setting.clone())?)
    }

    /// Calls `callback` for every waveform upload, with `t0` corrected by
    /// the filter delay.
    pub fn connect<F>(&mut self, mut callback: F)
    where
        F: FnMut(&UploadInfo) + Send + 'static,
    {
        let filter_delay = self.config.filter_delay;
        self.source.queue.connect(Box::new(move |event| {
            if let QueueEvent::Uploaded(info) = event {
                let mut info = info.clone();
                info.t0 += filter_delay;
                callback(&info);
            }
        }));
    }

    /// Pauses the queue from the earliest sample the engine can still
    /// rewrite. Waveforms buffered to start after that point are taken back
    /// into the queue and the buffer from there on is rewritten, so only the
    /// waveform already playing finishes.
    pub fn pause<E: Engine + ?Sized>(&mut self, engine: &E) -> Result<(), OutputError> {
        self.set_paused(engine, true)
    }

    /// Resumes the queue from the earliest rewritable sample, replacing the
    /// silence buffered while paused.
    pub fn resume<E: Engine + ?Sized>(&mut self, engine: &E) -> Result<(), OutputError> {
        self.set_paused(engine, false)
    }

    fn set_paused<E: Engine + ?Sized>(&mut self, engine: &E, paused: bool) -> Result<(), OutputError> {
        let mut guard = engine.lock();
        let queue = &mut self.source.queue;
        if !self.active {
            debug!(output = %self.config.name, paused, "inactive queue paused flag set");
            if paused {
                queue.pause();
            } else {
                queue.resume();
            }
            return Ok(());
        }

        let channel = self.config.channel.clone();
        let hw_ub = guard.ub(&channel)?;
        let offset = engine.earliest_offset();
        let t = offset as f64 / self.config.fs;
        debug!(output = %self.config.name, paused, offset, hw_ub, "rewriting queue output");
        if paused {
            queue.pause_at(t);
        } else {
            queue.resume_at(t);
        }
        if offset >= hw_ub {
            return Ok(());
        }
        self.buffer.invalidate_samples(offset);
        let samples = self.get_samples(offset, (hw_ub - offset) as usize)?;
        if let Err(e) = engine.update_hw_ao(&mut guard, offset, &channel, &samples, UpdateMethod::WritePosition) {
            warn!(output = %self.config.name, offset, error = %e, "queue rewrite failed");
            return Err(e.into());
        }
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        self.source.queue.is_paused()
    }
}

/// Streams an endless factory while active.
pub struct ContinuousSource {
    factory: Option<Box<dyn WaveformFactory>>,
}

impl OutputSource for ContinuousSource {
    fn is_ready(&self) -> bool {
        self.factory.is_some()
    }

    fn next_samples(&mut self, n: usize) -> Vec<f64> {
        match self.factory.as_mut() {
            Some(factory) => factory.next(n),
            None => vec![0.0; n],
        }
    }

    fn is_complete(&self) -> bool {
        false
    }

    fn get_duration(&self) -> f64 {
        f64::INFINITY
    }
}

pub type ContinuousOutput = BufferedOutput<ContinuousSource>;

impl BufferedOutput<ContinuousSource> {
    pub fn new(config: OutputConfig, factory: Box<dyn WaveformFactory>) -> Self {
        Self::with_source(
            config,
            ContinuousSource {
                factory: Some(factory),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{ContinuousOutput, EpochOutput, OutputConfig, OutputState, QueuedEpochOutput};
    use crate::engine::{Engine, EngineGuard, SimulatedEngine, UpdateMethod};
    use crate::error::OutputError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use trialbench_core::{ActionDispatcher, ActionRegistry, HardwareError, Setting};
    use trialbench_signal::{Block, FactoryKind, FlatCalibration, QueueOrdering, Silence};
    use trialbench_timing::ManualTimer;

    const FS: f64 = 1000.0;

    fn config(name: &str) -> OutputConfig {
        OutputConfig {
            name: name.into(),
            channel: "speaker".into(),
            engine: "NI".into(),
            fs: FS,
            filter_delay: 0.002,
            buffer_size: 10.0,
        }
    }

    fn engine(timer: ManualTimer) -> SimulatedEngine<ManualTimer> {
        SimulatedEngine::new("NI", FS, timer)
            .with_min_lead(5)
            .with_channel("speaker", 10.0)
    }

    fn tone_pip() -> Block {
        Block::new(FactoryKind::Cos2Envelope, "envelope_")
            .with_input(Block::new(FactoryKind::Tone, "tone_"))
    }

    fn target_setting() -> Setting {
        Setting::new()
            .with("target_envelope_rise_time", 0.01)
            .with("target_envelope_duration", 0.1)
            .with("target_tone_frequency", 100.0)
            .with("target_tone_level", 0.0)
    }

    fn epoch_output() -> EpochOutput {
        EpochOutput::new(config("target"), tone_pip(), Arc::new(FlatCalibration::as_attenuation()))
            .unwrap()
    }

    /// Simulated engine whose writes can be made to fail.
    struct FlakyEngine {
        inner: SimulatedEngine<ManualTimer>,
        failing: AtomicBool,
    }

    impl Engine for FlakyEngine {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn fs(&self) -> f64 {
            self.inner.fs()
        }

        fn lock(&self) -> EngineGuard<'_> {
            self.inner.lock()
        }

        fn get_ts(&self) -> f64 {
            self.inner.get_ts()
        }

        fn earliest_offset(&self) -> u64 {
            self.inner.earliest_offset()
        }

        fn update_hw_ao(
            &self,
            guard: &mut EngineGuard<'_>,
            offset: u64,
            channel: &str,
            samples: &[f64],
            method: UpdateMethod,
        ) -> Result<(), HardwareError> {
            if self.failing.load(Ordering::Acquire) {
                return Err(HardwareError::BufferUnderrun {
                    channel: channel.to_string(),
                    offset,
                    earliest: offset + 1,
                });
            }
            self.inner.update_hw_ao(guard, offset, channel, samples, method)
        }
    }

    /// Fills the channel with silence and starts playback.
    fn prime(engine: &SimulatedEngine<ManualTimer>, output: &mut EpochOutput, samples: usize) {
        output.write_next(engine, samples).unwrap();
        engine.start();
    }

    #[test]
    /// Test the inactive, ready, active, inactive cycle and the notifications.
    fn test_epoch_output_lifecycle() {
        let timer = ManualTimer::new();
        let engine = engine(timer.clone());
        let mut output = epoch_output();
        let mut actions = ActionRegistry::new();
        assert_eq!(output.state(), OutputState::Inactive);

        prime(&engine, &mut output, 150);
        output.prepare_setting(&target_setting()).unwrap();
        assert_eq!(output.state(), OutputState::Ready);

        let activation = output.activate(&engine, 100, &mut actions).unwrap();
        assert_eq!(output.state(), OutputState::Active);
        assert!((activation.start - 0.102).abs() < 1e-12);
        assert!((activation.end.unwrap() - 0.202).abs() < 1e-12);
        assert!(actions.is_delayed("target_end"));
        assert!(actions.is_active("target"));

        let written = engine.read("speaker", 0, 150).unwrap();
        assert!(written[..100].iter().all(|&s| s == 0.0));
        assert!(written[100..].iter().any(|&s| s != 0.0));

        output.write_next(&engine, 100).unwrap();
        assert_eq!(output.state(), OutputState::Inactive);
        assert!(output.take_completed());
        assert!(!output.take_completed());

        actions.fire_due(0.3).unwrap();
        assert!(!actions.is_active("target"));
    }

    #[test]
    /// Test that an underrun releases the lock once and zero-fills the gap.
    fn test_underrun_releases_lock_and_zero_fills() {
        let timer = ManualTimer::new();
        let engine = engine(timer.clone());
        let mut output = epoch_output();
        let mut actions = ActionRegistry::new();
        prime(&engine, &mut output, 500);
        output.prepare_setting(&target_setting()).unwrap();

        timer.set(0.3);
        let lock = engine.engine_lock();
        let before = (lock.acquired(), lock.released());
        let err = output.activate(&engine, 100, &mut actions).unwrap_err();

        assert!(err.is_buffer_underrun());
        assert!(matches!(
            err,
            OutputError::Hardware(HardwareError::BufferUnderrun { earliest: 305, .. })
        ));
        assert_eq!(lock.acquired() - before.0, 1);
        assert_eq!(lock.released() - before.1, 1);
        assert!(!lock.is_locked());
        assert_eq!(output.state(), OutputState::Inactive);
        let buffer = output.buffer();
        assert_eq!(buffer.get_samples_ub(), 500);
        assert!(buffer
            .get_range_samples(100, 500)
            .unwrap()
            .iter()
            .all(|&s| s == 0.0));
        assert!(actions.event_log().is_empty());
    }

    #[test]
    /// Test that deactivating twice is harmless.
    fn test_deactivate_is_idempotent() {
        let engine = engine(ManualTimer::new());
        let mut output = epoch_output();
        let mut actions = ActionRegistry::new();
        prime(&engine, &mut output, 100);
        output.prepare_setting(&target_setting()).unwrap();
        output.activate(&engine, 50, &mut actions).unwrap();

        output.deactivate(&engine, 60).unwrap();
        assert_eq!(output.state(), OutputState::Inactive);
        let written = engine.read("speaker", 60, 100).unwrap();
        assert!(written.iter().all(|&s| s == 0.0));

        output.deactivate(&engine, 60).unwrap();
        output.deactivate(&engine, 80).unwrap();
        assert_eq!(output.state(), OutputState::Inactive);
    }

    #[test]
    /// Test that a failed deactivation write leaves the output active and its buffer intact.
    fn test_failed_deactivation_keeps_output_active() {
        let engine = FlakyEngine {
            inner: engine(ManualTimer::new()),
            failing: AtomicBool::new(false),
        };
        let mut output = epoch_output();
        let mut actions = ActionRegistry::new();
        output.write_next(&engine, 100).unwrap();
        output.prepare_setting(&target_setting()).unwrap();
        output.activate(&engine, 50, &mut actions).unwrap();
        assert_eq!(output.state(), OutputState::Active);
        let before = engine.inner.read("speaker", 0, 100).unwrap();

        engine.failing.store(true, Ordering::Release);
        assert!(output.deactivate(&engine, 60).unwrap_err().is_buffer_underrun());
        assert_eq!(output.state(), OutputState::Active);
        assert_eq!(engine.inner.read("speaker", 0, 100).unwrap(), before);
        assert_eq!(output.buffer().get_range_samples(0, 100).unwrap(), before);

        engine.failing.store(false, Ordering::Release);
        output.deactivate(&engine, 60).unwrap();
        assert_eq!(output.state(), OutputState::Inactive);
        let written = engine.inner.read("speaker", 60, 100).unwrap();
        assert!(written.iter().all(|&s| s == 0.0));
        assert_eq!(written.len(), 40);
    }

    #[test]
    fn test_activate_requires_prepare() {
        let engine = engine(ManualTimer::new());
        let mut output = epoch_output();
        let mut actions = ActionRegistry::new();
        assert_eq!(
            output.activate(&engine, 0, &mut actions).unwrap_err(),
            OutputError::NotReady("target".into())
        );
        assert_eq!(engine.engine_lock().acquired(), engine.engine_lock().released());
    }

    #[test]
    /// Test that the queued output streams its queue and reports uploads with filter delay.
    fn test_queued_output_streams_and_completes() {
        let engine = engine(ManualTimer::new());
        let mut output = QueuedEpochOutput::new(
            config("target"),
            tone_pip(),
            Arc::new(FlatCalibration::as_attenuation()),
            QueueOrdering::Interleaved,
        )
        .unwrap()
        .with_auto_decrement(true);
        let uploads = Arc::new(Mutex::new(Vec::new()));
        let sink = uploads.clone();
        output.connect(move |info| sink.lock().unwrap().push(info.t0));

        let setting = target_setting()
            .with("target_averages", 2)
            .with("target_iti_duration", 0.05);
        let key = output.add_setting(&setting, None, None).unwrap();
        assert_eq!(output.queue().remaining(key), 2);
        assert!(output.add_setting(&target_setting(), None, None).is_err());

        let mut actions = ActionRegistry::new();
        output.activate(&engine, 10, &mut actions).unwrap();
        for _ in 0..4 {
            output.write_next(&engine, 100).unwrap();
        }
        assert!(output.take_completed());
        let uploads = uploads.lock().unwrap();
        assert_eq!(uploads.len(), 2);
        assert!((uploads[0] - 0.012).abs() < 1e-9);
        assert!((uploads[1] - 0.162).abs() < 1e-9);
        assert!(!actions.is_delayed("target_end"));
    }

    #[test]
    /// Test that pausing rewrites the buffered future and resuming fills the gap.
    fn test_queued_pause_rewrites_buffered_samples() {
        let timer = ManualTimer::new();
        let engine = engine(timer.clone());
        let mut output = QueuedEpochOutput::new(
            config("target"),
            tone_pip(),
            Arc::new(FlatCalibration::as_attenuation()),
            QueueOrdering::Fifo,
        )
        .unwrap()
        .with_auto_decrement(true);
        let key = output.add_setting(&target_setting(), Some(5), Some(0.0)).unwrap();
        let mut actions = ActionRegistry::new();
        output.activate(&engine, 0, &mut actions).unwrap();
        output.write_next(&engine, 250).unwrap();
        assert_eq!(output.queue().uploaded().len(), 3);
        assert_eq!(output.queue().remaining(key), 2);
        let before = engine.read("speaker", 0, 250).unwrap();
        assert!(before[200..].iter().any(|&s| s != 0.0));

        engine.start();
        timer.set(0.1205);
        output.pause(&engine).unwrap();
        assert!(output.is_paused());
        let paused_at = output.queue().paused_at().unwrap();
        assert!((paused_at - 0.125).abs() < 1e-12);
        assert_eq!(output.queue().uploaded().len(), 2);
        assert_eq!(output.queue().remaining(key), 3);

        let after = engine.read("speaker", 0, 250).unwrap();
        for (a, b) in after[..200].iter().zip(&before[..200]) {
            assert!((a - b).abs() < 1e-12);
        }
        assert!(after[200..].iter().all(|&s| s == 0.0));

        timer.set(0.2205);
        output.resume(&engine).unwrap();
        assert!(!output.is_paused());
        assert_eq!(output.queue().paused_at(), None);
        let resumed = engine.read("speaker", 200, 250).unwrap();
        assert!(resumed[..25].iter().all(|&s| s == 0.0));
        assert!(resumed[26..].iter().any(|&s| s != 0.0));
        let last = output.queue().uploaded().back().unwrap();
        assert!((last.t0 - 0.225).abs() < 1e-12);
        assert_eq!(output.queue().remaining(key), 2);
    }

    #[test]
    fn test_continuous_output_never_completes() {
        let engine = engine(ManualTimer::new());
        let mut output = ContinuousOutput::new(config("background"), Box::new(Silence { fill_value: 0.5 }));
        let mut actions = ActionRegistry::new();
        let activation = output.activate(&engine, 0, &mut actions).unwrap();
        assert_eq!(activation.end, None);
        output.write_next(&engine, 1000).unwrap();
        assert_eq!(output.state(), OutputState::Active);
        assert_eq!(engine.read("speaker", 999, 1000), Some(vec![0.5]));
        assert!(actions.next_deadline().is_none());
        assert_eq!(engine.get_ts(), 0.0);
    }
}
