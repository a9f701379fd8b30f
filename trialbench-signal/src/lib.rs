pub mod buffer;
pub mod calibration;
pub mod error;
pub mod factory;
pub mod queue;
pub mod token;

pub use buffer::SignalBuffer;
pub use calibration::{Calibration, CalibrationSpec, FlatCalibration, InterpCalibration};
pub use error::{FactoryError, QueueError};
pub use factory::{
    BandpassFilter, BroadbandNoise, Cos2Envelope, Recorded, Silence, Tone, WaveformFactory,
};
pub use queue::{
    QueueEvent, QueueItem, QueueKey, QueueOrdering, QueueSubscriber, SignalQueue, UploadInfo,
};
pub use token::{compose, initialize_factory, Block, ContextMap, FactoryKind};
