//! `procshift.toml` configuration.
//!
//! ```toml
//! [convert]
//! platform = "redshift"
//! manual_penalty = 10
//!
//! [vars]
//! region = "EU"
//!
//! [project]
//! name = "warehouse"
//! profile = "redshift_prod"
//! ```
//!
//! Every section is optional. Command-line flags override file values.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::engine::ConvertOptions;
use crate::error::{ConvertError, ConvertResult};
use crate::project::ProjectSettings;
use crate::scorer::DEFAULT_MANUAL_PENALTY;

pub const CONFIG_FILE: &str = "procshift.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConvertSection {
    pub platform: Option<String>,
    pub manual_penalty: u32,
}

impl Default for ConvertSection {
    fn default() -> Self {
        Self {
            platform: None,
            manual_penalty: DEFAULT_MANUAL_PENALTY,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub convert: ConvertSection,
    /// Parameter values applied to every unit.
    pub vars: BTreeMap<String, toml::Value>,
    pub project: ProjectSettings,
}

impl Config {
    pub fn from_toml(content: &str) -> ConvertResult<Self> {
        toml::from_str(content).map_err(|e| ConvertError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> ConvertResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConvertError::Config(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "loading config");
        Self::from_toml(&content)
    }

    /// Load from `explicit` if given (it must exist), else the first of
    /// `./procshift.toml` and `<config dir>/procshift/config.toml` that
    /// exists, else defaults.
    pub fn discover(explicit: Option<&Path>) -> ConvertResult<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match candidate_paths().into_iter().find(|p| p.is_file()) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// `[vars]` as conversion options. Scalars are stringified; tables and
    /// arrays are rejected.
    pub fn options(&self) -> ConvertResult<ConvertOptions> {
        let mut options = ConvertOptions::new();
        for (name, value) in &self.vars {
            let value = match value {
                toml::Value::String(s) => s.clone(),
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                toml::Value::Datetime(d) => d.to_string(),
                other => {
                    return Err(ConvertError::invalid_option(
                        name.as_str(),
                        format!("expected a scalar, found {}", other.type_str()),
                    ));
                }
            };
            options = options.with_var(name.as_str(), value);
        }
        Ok(options)
    }
}

fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE)];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("procshift").join("config.toml"));
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_when_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.convert.manual_penalty, 10);
        assert_eq!(config.project.profile, "default");
    }

    #[test]
    fn test_full_file() {
        let config = Config::from_toml(
            r#"
[convert]
platform = "athena"
manual_penalty = 25

[vars]
region = "EU"
threshold = 500
start_date = 2024-01-01

[project]
name = "warehouse"
profile = "athena_prod"
"#,
        )
        .unwrap();
        assert_eq!(config.convert.platform.as_deref(), Some("athena"));
        assert_eq!(config.convert.manual_penalty, 25);
        assert_eq!(config.project.name.as_deref(), Some("warehouse"));

        let options = config.options().unwrap();
        assert_eq!(options.get("region"), Some("EU"));
        assert_eq!(options.get("threshold"), Some("500"));
        assert_eq!(options.get("start_date"), Some("2024-01-01"));
    }

    #[test]
    fn test_rejects_unknown_section_and_nested_vars() {
        assert!(matches!(
            Config::from_toml("[postgres]\nurl = \"x\""),
            Err(ConvertError::Config(_))
        ));
        let config = Config::from_toml("[vars]\nregion = [\"EU\"]").unwrap();
        assert!(config.options().is_err());
    }

    #[test]
    fn test_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[convert]\nplatform = \"glue\"\n").unwrap();
        let config = Config::discover(Some(&path)).unwrap();
        assert_eq!(config.convert.platform.as_deref(), Some("glue"));

        let missing = dir.path().join("missing.toml");
        assert!(Config::discover(Some(&missing)).is_err());
    }
}
