//! Parses a project's persisted build configuration file.
//!
//! Format: one `[id]` group per configuration, plus an optional paired
//! `[id.environment]` group whose keys/values become environment overlay
//! entries. Every group not ending in `.environment` is a configuration;
//! environment groups are looked up by name, not iterated separately.

use std::collections::HashMap;

use buildpipe_core::Configuration;
use ini::Ini;

use crate::error::{ConfigError, ConfigResult};

const ENV_SUFFIX: &str = ".environment";

/// Parse the full contents of a project's build-configuration file into
/// zero or more [`Configuration`] values, in the order their groups appear
/// in the file.
pub fn parse_project_config(text: &str) -> ConfigResult<Vec<Configuration>> {
    let ini = Ini::load_from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    for (section, props) in ini.iter() {
        let Some(group) = section else {
            continue;
        };
        if group.ends_with(ENV_SUFFIX) {
            continue;
        }

        if !seen.insert(group.to_string()) {
            return Err(ConfigError::Duplicate(group.to_string()));
        }

        let mut configuration = Configuration::new(group.to_string());
        configuration.display_name = props.get("name").unwrap_or(group).to_string();
        configuration.device_id = props
            .get("device")
            .map(str::to_string)
            .unwrap_or_else(|| configuration.device_id.clone());
        configuration.runtime_id = props.get("runtime").unwrap_or("").to_string();
        configuration.prefix = props.get("prefix").map(str::to_string);
        configuration.config_opts = props.get("config-opts").map(str::to_string);
        configuration.app_id = props.get("app-id").unwrap_or("").to_string();

        if let Some(value) = props.get("prebuild") {
            configuration.prebuild = parse_list(group, "prebuild", value)?;
        }
        if let Some(value) = props.get("postbuild") {
            configuration.postbuild = parse_list(group, "postbuild", value)?;
        }

        let env_group = format!("{group}{ENV_SUFFIX}");
        if let Some(env_props) = ini.section(Some(env_group.as_str())) {
            let mut environment: HashMap<String, String> = HashMap::new();
            for (key, value) in env_props.iter() {
                environment.insert(key.to_string(), value.to_string());
            }
            configuration.environment = environment;
        }

        out.push(configuration);
    }

    Ok(out)
}

/// Comma-separated list, trimming whitespace around each element and
/// dropping empty ones.
fn parse_list(group: &str, key: &str, raw: &str) -> ConfigResult<Vec<String>> {
    let items: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    if items.is_empty() && !raw.trim().is_empty() {
        return Err(ConfigError::MalformedList {
            group: group.to_string(),
            key: key.to_string(),
            message: "value present but no items parsed".to_string(),
        });
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_configuration() {
        let text = "\
[default]
name = Default
runtime = org.gnome.Sdk
config-opts = --enable-debug
prebuild = make clean, make distclean
default = true

[default.environment]
CFLAGS = -O0 -g
";
        let configs = parse_project_config(text).unwrap();
        assert_eq!(configs.len(), 1);
        let config = &configs[0];
        assert_eq!(config.id, "default");
        assert_eq!(config.display_name, "Default");
        assert_eq!(config.runtime_id, "org.gnome.Sdk");
        assert_eq!(config.config_opts.as_deref(), Some("--enable-debug"));
        assert_eq!(config.prebuild, vec!["make clean", "make distclean"]);
        assert_eq!(config.environment.get("CFLAGS").map(String::as_str), Some("-O0 -g"));
    }

    #[test]
    fn environment_group_without_matching_configuration_is_ignored() {
        let text = "\
[orphan.environment]
FOO = bar
";
        let configs = parse_project_config(text).unwrap();
        assert!(configs.is_empty());
    }

    #[test]
    fn multiple_configurations_preserve_file_order() {
        let text = "\
[release]
name = Release

[debug]
name = Debug
";
        let configs = parse_project_config(text).unwrap();
        let ids: Vec<&str> = configs.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["release", "debug"]);
    }

    #[test]
    fn missing_optional_keys_default_sensibly() {
        let text = "[minimal]\n";
        let configs = parse_project_config(text).unwrap();
        let config = &configs[0];
        assert_eq!(config.display_name, "minimal");
        assert!(config.runtime_id.is_empty());
        assert!(config.prebuild.is_empty());
    }

    #[test]
    fn duplicate_group_id_is_rejected() {
        let text = "\
[dup]
name = First

[dup]
name = Second
";
        let err = parse_project_config(text).unwrap_err();
        assert!(matches!(err, ConfigError::Duplicate(id) if id == "dup"));
    }
}
