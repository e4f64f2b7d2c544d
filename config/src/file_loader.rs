//! # Configuration File Loading
//!
//! Reads a single YAML file into a [`serde_yaml::Value`] mapping.
//!
//! An empty document is treated as an empty mapping so that a placeholder
//! `override.yaml` does not break a load.

use errors::ConfigFileError;
use serde_yaml::{Mapping, Value};
use std::path::Path;

/// Load a YAML file as an untyped mapping.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Produces the tree the merger folds into the working configuration set.
///
/// ## Usage
/// ```rust,no_run
/// use layered_config::load_yaml_file;
/// use std::path::Path;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let value = load_yaml_file(Path::new("config/override.yaml"))?;
///     println!("{:?}", value.get("port"));
///     Ok(())
/// }
/// ```
///
/// ## Error Handling
/// Returns `ConfigFileError` for:
/// - File not found
/// - Any other IO failure
/// - Invalid YAML syntax
/// - A top-level document that is a scalar or a sequence
pub fn load_yaml_file(path: &Path) -> Result<Value, ConfigFileError> {
    let display = path.display().to_string();

    let contents = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ConfigFileError::NotFound {
            path: display.clone(),
        },
        _ => ConfigFileError::Io {
            path: display.clone(),
            source: e,
        },
    })?;

    parse_yaml(&contents, &display)
}

/// Parse YAML text attributed to `origin` (used in error messages).
pub fn parse_yaml(contents: &str, origin: &str) -> Result<Value, ConfigFileError> {
    let value: Value =
        serde_yaml::from_str(contents).map_err(|e| ConfigFileError::YamlParse {
            path: origin.to_string(),
            reason: e.to_string(),
        })?;

    match value {
        Value::Null => Ok(Value::Mapping(Mapping::new())),
        Value::Mapping(_) => Ok(value),
        _ => Err(ConfigFileError::NotAMapping {
            path: origin.to_string(),
        }),
    }
}
