//! The data a pipeline builds against: runtime, environment, build options.
//!
//! Populated by an external configuration provider — `buildpipe-config`'s
//! INI reader is the one shipped in this workspace — never by the pipeline
//! itself.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One named build configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub id: String,
    pub display_name: String,
    pub app_id: String,
    pub runtime_id: String,
    pub device_id: String,
    pub prefix: Option<String>,
    pub config_opts: Option<String>,
    /// `-1` = cores + 1, `0` = cores, `>0` = explicit job count.
    pub parallelism: i32,
    pub environment: HashMap<String, String>,
    pub prebuild: Vec<String>,
    pub postbuild: Vec<String>,
    pub internal: HashMap<String, String>,
}

impl Configuration {
    /// A configuration with just an id, everything else defaulted. Mainly
    /// useful for tests and for a pipeline constructed ahead of having a
    /// real configuration provider wired up.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            app_id: String::new(),
            runtime_id: String::new(),
            device_id: "local".to_string(),
            prefix: None,
            config_opts: None,
            parallelism: 0,
            environment: HashMap::new(),
            prebuild: Vec::new(),
            postbuild: Vec::new(),
            internal: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn environment(&self) -> &HashMap<String, String> {
        &self.environment
    }

    /// `None` means no runtime has been configured; `create_launcher`
    /// treats that as a configuration error.
    pub fn runtime_id(&self) -> Option<&str> {
        if self.runtime_id.is_empty() {
            None
        } else {
            Some(&self.runtime_id)
        }
    }

    /// Resolves `parallelism` against the host's available parallelism to
    /// produce a `-jN` job count for a build invocation.
    pub fn job_count(&self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        match self.parallelism {
            i32::MIN..=-1 => cores + 1,
            0 => cores,
            n => n as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_count_minus_one_is_cores_plus_one() {
        let mut config = Configuration::new("default");
        config.parallelism = -1;
        let cores = std::thread::available_parallelism().unwrap().get();
        assert_eq!(config.job_count(), cores + 1);
    }

    #[test]
    fn job_count_zero_is_cores() {
        let mut config = Configuration::new("default");
        config.parallelism = 0;
        let cores = std::thread::available_parallelism().unwrap().get();
        assert_eq!(config.job_count(), cores);
    }

    #[test]
    fn job_count_explicit_value_is_used_verbatim() {
        let mut config = Configuration::new("default");
        config.parallelism = 4;
        assert_eq!(config.job_count(), 4);
    }

    #[test]
    fn runtime_id_empty_string_reads_as_unset() {
        let config = Configuration::new("default");
        assert_eq!(config.runtime_id(), None);
    }
}
