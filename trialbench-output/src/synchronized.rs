use crate::engine::{Engine, EngineGuard};
use crate::error::OutputError;
use crate::output::{Activation, Output};
use tracing::{debug, warn};
use trialbench_core::ActionDispatcher;

/// Starts several outputs, possibly on different engines, at the same
/// sample offset.
pub struct Synchronized<'e> {
    engines: Vec<&'e dyn Engine>,
}

impl<'e> Synchronized<'e> {
    /// Engines are always locked in name order so two groups sharing
    /// engines cannot deadlock.
    pub fn new(mut engines: Vec<&'e dyn Engine>) -> Self {
        engines.sort_by(|a, b| a.name().cmp(b.name()));
        engines.dedup_by(|a, b| a.name() == b.name());
        Self { engines }
    }

    pub fn engine_names(&self) -> impl Iterator<Item = &str> {
        self.engines.iter().map(|e| e.name())
    }

    /// Activates every output at `offset` while all engine locks are held.
    /// If any output fails, the ones already started are deactivated again
    /// before the error is returned. Notifications go out after the locks
    /// are released.
    pub fn activate<D: ActionDispatcher + ?Sized>(
        &self,
        outputs: &mut [&mut dyn Output],
        offset: u64,
        dispatcher: &mut D,
    ) -> Result<Vec<Activation>, OutputError> {
        let activations = {
            let mut guards: Vec<EngineGuard<'_>> = self.engines.iter().map(|e| e.lock()).collect();
            self.activate_locked(outputs, offset, &mut guards)?
        };
        for activation in &activations {
            activation.notify(dispatcher)?;
        }
        Ok(activations)
    }

    fn engine_index(&self, output: &dyn Output) -> Result<usize, OutputError> {
        self.engines
            .iter()
            .position(|e| e.name() == output.engine_name())
            .ok_or_else(|| OutputError::UnknownEngine {
                output: output.name().to_string(),
                engine: output.engine_name().to_string(),
            })
    }

    fn activate_locked(
        &self,
        outputs: &mut [&mut dyn Output],
        offset: u64,
        guards: &mut [EngineGuard<'_>],
    ) -> Result<Vec<Activation>, OutputError> {
        let mut activations = Vec::with_capacity(outputs.len());
        let mut failure = None;
        for (i, output) in outputs.iter_mut().enumerate() {
            let result = self.engine_index(&**output).and_then(|e| {
                output.activate_locked(self.engines[e], &mut guards[e], offset)
            });
            match result {
                Ok(activation) => activations.push(activation),
                Err(e) => {
                    failure = Some((i, e));
                    break;
                }
            }
        }
        let Some((failed, error)) = failure else {
            debug!(offset, outputs = activations.len(), "synchronized activation");
            return Ok(activations);
        };

        warn!(offset, error = %error, "synchronized activation failed, rolling back");
        for output in outputs[..failed].iter_mut() {
            if let Ok(e) = self.engine_index(&**output) {
                if let Err(rollback) = output.deactivate_locked(self.engines[e], &mut guards[e], offset) {
                    warn!(output = output.name(), error = %rollback, "rollback failed");
                }
            }
        }
        Err(error)
    }
}
