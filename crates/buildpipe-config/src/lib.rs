//! Reads a project's persisted build-configuration file into
//! [`buildpipe_core::Configuration`] values.
//!
//! Kept out of `buildpipe-core` on purpose: parsing happens before any
//! pipeline exists, and failures here are configuration-file problems, not
//! pipeline-run problems, hence the separate [`ConfigError`] type.

pub mod error;
pub mod project;

pub use error::{ConfigError, ConfigResult};
pub use project::parse_project_config;
