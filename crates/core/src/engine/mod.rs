//! Pipeline engine boundary.
//!
//! The control plane never touches capture hardware, codecs or RTP
//! directly — it drives a [`PipelineEngine`] that realizes a
//! [`PipelineTemplate`](crate::template::PipelineTemplate) as a running
//! stage graph. Construction is the one synchronous, fallible call; once a
//! [`PipelineHandle`] exists, lifecycle commands are issued to it and their
//! outcomes come back asynchronously as [`EngineEvent`]s on the control
//! loop's bus.
//!
//! The shipped production engine is [`process::ProcessEngine`], which runs
//! each pipeline as a helper process and reads its status stream. Tests
//! implement the trait with scripted engines.

pub mod process;

use crossbeam_channel::Sender;

use crate::clock::ReferenceClock;
use crate::error::Result;
use crate::monitor::LevelSample;
use crate::template::PipelineTemplate;

/// Coarse run state as reported by the engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Running,
    Paused,
    Stopped,
}

/// Asynchronous status posted by an engine for one pipeline instance.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineStatus {
    StateChanged(EngineState),
    /// The pipeline entered an unrecoverable error state.
    Error(String),
    /// The pipeline reached end of stream (a live source ending is a fault).
    Eos,
    /// Loudness measurement from a level-metering stage.
    Level(LevelSample),
}

/// One engine bus message, tagged with the instance it concerns.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    pub instance: String,
    pub status: EngineStatus,
}

/// Builds runnable pipelines from templates.
///
/// `build` must stamp the pipeline with `clock` so every instance in the
/// process shares one time base; the signature makes forgetting it
/// impossible. All device and codec fallibility surfaces here as
/// [`Error::EngineConstruction`](crate::error::Error::EngineConstruction).
pub trait PipelineEngine: Send + Sync {
    fn build(
        &self,
        instance_id: &str,
        template: &PipelineTemplate,
        clock: &ReferenceClock,
        bus: Sender<EngineEvent>,
    ) -> Result<Box<dyn PipelineHandle>>;
}

/// Lifecycle control over one running pipeline.
///
/// Commands return as soon as they are accepted; the actual state change is
/// observed via [`EngineStatus::StateChanged`] on the bus.
pub trait PipelineHandle: Send {
    fn play(&mut self) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
}
