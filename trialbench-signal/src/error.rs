use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FactoryError {
    /// A primitive was composed with the wrong number of inputs.
    #[error("{kind} takes {expected} input(s) but was given {found}")]
    Arity {
        kind: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("missing parameter {0}")]
    MissingParameter(String),
    #[error("parameter {0} is not numeric")]
    NotNumeric(String),
    #[error("invalid value {value} for {name}: {reason}")]
    InvalidParameter {
        name: String,
        value: f64,
        reason: &'static str,
    },
    #[error("context map has no entry for block {0}")]
    UnmappedBlock(usize),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueueError {
    #[error("sample rate must be set before appending to the queue")]
    FsNotSet,
    #[error("invalid sample rate {0}")]
    InvalidSampleRate(f64),
    #[error("unknown queue ordering {0:?}")]
    UnknownOrdering(String),
    #[error("waveform has {samples} sample(s), nothing left after trimming {trim}")]
    EmptyWaveform { samples: u64, trim: usize },
    #[error("cartesian product needs at least one axis and no empty axes")]
    EmptyProduct,
    #[error(transparent)]
    Factory(#[from] FactoryError),
}
