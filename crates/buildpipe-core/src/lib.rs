//! Pluggable, phase-ordered build pipeline engine.
//!
//! A [`pipeline::Pipeline`] holds an ordered list of [`stage::Stage`]
//! implementations, each attached to a [`pipeline::Phase`]. Driving the
//! pipeline (`execute_async`) ticks through phase order, running every
//! requested, not-yet-completed stage in turn and halting on the first
//! failure. [`addin::PipelineAddin`] implementations attach stages at
//! pipeline construction time without the pipeline needing to know about
//! them individually.

pub mod addin;
pub mod configuration;
pub mod error;
pub mod id;
pub mod log;
pub mod pipeline;
pub mod stage;
pub mod subprocess;

pub use addin::{AddinTracker, PipelineAddin};
pub use configuration::Configuration;
pub use error::{Error, ExitDisposition, Result};
pub use id::StageId;
pub use log::{BuildLog, LogObserver, LogStream};
pub use pipeline::{Phase, Pipeline, PipelineEntry};
pub use stage::{run_launcher, Stage, StageBase, StageMkdirs, StageProcess, StageTransfer, Transfer};
pub use subprocess::{Subprocess, SubprocessFlags, SubprocessLauncher};
