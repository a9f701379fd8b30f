pub mod engine;
pub mod error;
pub mod output;
pub mod synchronized;

pub use engine::{
    ChannelBuffer, Engine, EngineGuard, EngineLock, HwBuffer, SimulatedEngine, UpdateMethod,
};
pub use error::OutputError;
pub use output::{
    Activation, BufferedOutput, ContinuousOutput, ContinuousSource, EpochOutput, EpochSource,
    Output, OutputConfig, OutputSource, OutputState, QueuedEpochOutput, QueuedSource,
};
pub use synchronized::Synchronized;
