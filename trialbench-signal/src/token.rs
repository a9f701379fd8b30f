//! Block trees describing a stimulus, and their conversion into factories.
//!
//! `compose` walks the tree once and assigns every block parameter the
//! context name it is read from. `initialize_factory` then builds the
//! factory tree for one setting using that map. The map is owned by the
//! caller and rebuilt whenever the block tree changes.

use crate::calibration::Calibration;
use crate::error::FactoryError;
use crate::factory::{BandpassFilter, BroadbandNoise, Cos2Envelope, Silence, Tone, WaveformFactory};
use serde::{Deserialize, Serialize};
use trialbench_core::Setting;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactoryKind {
    Tone,
    Silence,
    BroadbandNoise,
    Bandpass,
    Cos2Envelope,
}

impl FactoryKind {
    pub fn name(&self) -> &'static str {
        match self {
            FactoryKind::Tone => "tone",
            FactoryKind::Silence => "silence",
            FactoryKind::BroadbandNoise => "broadband_noise",
            FactoryKind::Bandpass => "bandpass",
            FactoryKind::Cos2Envelope => "cos2_envelope",
        }
    }

    pub fn parameters(&self) -> &'static [&'static str] {
        match self {
            FactoryKind::Tone => &["frequency", "level", "phase", "polarity"],
            FactoryKind::Silence => &[],
            FactoryKind::BroadbandNoise => &["level", "seed"],
            FactoryKind::Bandpass => &["fl", "fh"],
            FactoryKind::Cos2Envelope => &["start_time", "rise_time", "duration"],
        }
    }

    /// Number of input blocks the primitive wraps.
    pub fn inputs(&self) -> usize {
        match self {
            FactoryKind::Tone | FactoryKind::Silence | FactoryKind::BroadbandNoise => 0,
            FactoryKind::Bandpass | FactoryKind::Cos2Envelope => 1,
        }
    }

    /// Value used when the setting does not provide the parameter.
    pub fn default_value(&self, parameter: &str) -> Option<f64> {
        match (self, parameter) {
            (FactoryKind::Tone, "phase") => Some(0.0),
            (FactoryKind::Tone, "polarity") => Some(1.0),
            (FactoryKind::BroadbandNoise, "seed") => Some(1.0),
            (FactoryKind::Cos2Envelope, "start_time") => Some(0.0),
            _ => None,
        }
    }

    fn check_arity(&self, found: usize) -> Result<(), FactoryError> {
        if found == self.inputs() {
            Ok(())
        } else {
            Err(FactoryError::Arity {
                kind: self.name(),
                expected: self.inputs(),
                found,
            })
        }
    }

    /// Builds the primitive from resolved parameters and already built inputs.
    pub fn build(
        &self,
        params: &[f64],
        mut inputs: Vec<Box<dyn WaveformFactory>>,
        fs: f64,
        calibration: &dyn Calibration,
    ) -> Result<Box<dyn WaveformFactory>, FactoryError> {
        self.check_arity(inputs.len())?;
        let factory: Box<dyn WaveformFactory> = match (self, params) {
            (FactoryKind::Tone, &[frequency, level, phase, polarity]) => Box::new(Tone::new(
                fs,
                level,
                frequency,
                phase,
                polarity,
                calibration,
            )),
            (FactoryKind::Silence, &[]) => Box::new(Silence::default()),
            (FactoryKind::BroadbandNoise, &[level, seed]) => {
                Box::new(BroadbandNoise::new(level, seed.max(0.0) as u64, calibration))
            }
            (FactoryKind::Bandpass, &[fl, fh]) => {
                if !(fl > 0.0 && fl < fh) {
                    return Err(invalid("fl", fl, "must be positive and below fh"));
                }
                if fh >= fs / 2.0 {
                    return Err(invalid("fh", fh, "must be below the Nyquist frequency"));
                }
                Box::new(BandpassFilter::new(fs, fl, fh, pop_input(self, &mut inputs)?))
            }
            (FactoryKind::Cos2Envelope, &[start_time, rise_time, duration]) => {
                if rise_time < 0.0 || 2.0 * rise_time > duration {
                    return Err(invalid(
                        "rise_time",
                        rise_time,
                        "must be non-negative and at most half the duration",
                    ));
                }
                Box::new(Cos2Envelope::new(
                    fs,
                    start_time,
                    rise_time,
                    duration,
                    pop_input(self, &mut inputs)?,
                ))
            }
            _ => {
                return Err(FactoryError::MissingParameter(format!(
                    "{} expects {} parameters, got {}",
                    self.name(),
                    self.parameters().len(),
                    params.len()
                )))
            }
        };
        Ok(factory)
    }
}

fn invalid(name: &str, value: f64, reason: &'static str) -> FactoryError {
    FactoryError::InvalidParameter {
        name: name.to_string(),
        value,
        reason,
    }
}

fn pop_input(
    kind: &FactoryKind,
    inputs: &mut Vec<Box<dyn WaveformFactory>>,
) -> Result<Box<dyn WaveformFactory>, FactoryError> {
    inputs.pop().ok_or(FactoryError::Arity {
        kind: kind.name(),
        expected: kind.inputs(),
        found: 0,
    })
}

/// One node of a stimulus description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub kind: FactoryKind,
    /// Prepended to each parameter name, e.g. `tone_` gives `tone_frequency`.
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub inputs: Vec<Block>,
}

impl Block {
    pub fn new(kind: FactoryKind, prefix: impl Into<String>) -> Self {
        Self {
            kind,
            prefix: prefix.into(),
            inputs: Vec::new(),
        }
    }

    pub fn with_input(mut self, block: Block) -> Self {
        self.inputs.push(block);
        self
    }

    /// Checks input counts through the whole tree.
    pub fn validate(&self) -> Result<(), FactoryError> {
        self.kind.check_arity(self.inputs.len())?;
        self.inputs.iter().try_for_each(Block::validate)
    }

    /// Number of blocks in the tree.
    pub fn count(&self) -> usize {
        1 + self.inputs.iter().map(Block::count).sum::<usize>()
    }
}

/// Context names of block parameters, indexed by pre-order block position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextMap {
    nodes: Vec<Vec<(&'static str, String)>>,
}

impl ContextMap {
    pub fn context_name(&self, block: usize, parameter: &str) -> Option<&str> {
        self.nodes
            .get(block)?
            .iter()
            .find(|(p, _)| *p == parameter)
            .map(|(_, name)| name.as_str())
    }

    /// Every context name the tree reads, in pre-order.
    pub fn context_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().flatten().map(|(_, name)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Validates `block` and maps each parameter to `{prefix}{block.prefix}{parameter}`.
pub fn compose(block: &Block, prefix: &str) -> Result<ContextMap, FactoryError> {
    block.validate()?;
    let mut map = ContextMap::default();
    compose_into(block, prefix, &mut map);
    Ok(map)
}

fn compose_into(block: &Block, prefix: &str, map: &mut ContextMap) {
    let names = block
        .kind
        .parameters()
        .iter()
        .map(|p| (*p, format!("{}{}{}", prefix, block.prefix, p)))
        .collect();
    map.nodes.push(names);
    for input in &block.inputs {
        compose_into(input, prefix, map);
    }
}

/// Builds the factory tree for `block` with values taken from `setting`.
pub fn initialize_factory(
    block: &Block,
    map: &ContextMap,
    setting: &Setting,
    fs: f64,
    calibration: &dyn Calibration,
) -> Result<Box<dyn WaveformFactory>, FactoryError> {
    let mut position = 0;
    initialize_node(block, map, setting, fs, calibration, &mut position)
}

fn initialize_node(
    block: &Block,
    map: &ContextMap,
    setting: &Setting,
    fs: f64,
    calibration: &dyn Calibration,
    position: &mut usize,
) -> Result<Box<dyn WaveformFactory>, FactoryError> {
    let id = *position;
    *position += 1;

    let mut params = Vec::with_capacity(block.kind.parameters().len());
    for parameter in block.kind.parameters() {
        let name = map
            .context_name(id, parameter)
            .ok_or(FactoryError::UnmappedBlock(id))?;
        let value = match setting.get(name) {
            Some(v) => v
                .as_f64()
                .ok_or_else(|| FactoryError::NotNumeric(name.to_string()))?,
            None => block
                .kind
                .default_value(parameter)
                .ok_or_else(|| FactoryError::MissingParameter(name.to_string()))?,
        };
        params.push(value);
    }

    let inputs = block
        .inputs
        .iter()
        .map(|input| initialize_node(input, map, setting, fs, calibration, position))
        .collect::<Result<Vec<_>, _>>()?;
    block.kind.build(&params, inputs, fs, calibration)
}
