//! # Configuration Precedence
//!
//! Folds YAML files into a single working configuration set.
//!
//! # Precedence Order
//! Files are merged in the order given, so the last file wins:
//! 1. `config/tests.yaml` (highest priority)
//! 2. `config/override.yaml`
//! 3. Environment-selected files (`production`, `staging`, `local`)
//! 4. Base file (lowest priority)

use crate::file_loader::load_yaml_file;
use errors::ConfigFileError;
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// How overlay failures are treated while merging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeMode {
    /// A broken overlay is logged and skipped. Used for the initial load.
    Lenient,

    /// A broken overlay aborts the merge, so a bad edit never produces a
    /// configuration that silently lost an override.
    Strict,

    /// Strict, except for the listed overlays, which are skipped when broken.
    /// Reloads list the files already skipped by the last good cycle.
    StrictExcept(Vec<PathBuf>),
}

impl MergeMode {
    fn skips_broken(&self, path: &Path) -> bool {
        match self {
            Self::Lenient => true,
            Self::Strict => false,
            Self::StrictExcept(tolerated) => tolerated.iter().any(|t| same_file(t, path)),
        }
    }
}

/// Path equality that survives differently spelled paths to one file.
pub(crate) fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// An overlay that existed on disk but could not be merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// The merged tree of one load or reload cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingSet {
    /// Merged configuration tree (always a mapping).
    pub value: Value,

    /// Files merged, in precedence order (base first).
    pub merged: Vec<PathBuf>,

    /// Overlays that existed but failed to parse (lenient mode only).
    pub skipped: Vec<SkippedFile>,
}

/// Merge `overlay` into `base`, later values winning per key.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Implements key-level overwrite between two YAML trees.
///
/// ## Deep Merge
/// - Mapping into mapping: merged recursively, key by key
/// - Anything else: the overlay value replaces the base value wholesale
///   (sequences are not concatenated, an explicit `null` clears the key)
///
/// ## Returns
/// Dotted paths of the keys whose value changed, for logging.
///
/// ## Usage
/// ```rust
/// use layered_config::merge_values;
///
/// let mut base: serde_yaml::Value = serde_yaml::from_str("port: 8080\nname: svc").unwrap();
/// let overlay: serde_yaml::Value = serde_yaml::from_str("port: 9090").unwrap();
///
/// let changes = merge_values(&mut base, overlay);
/// assert_eq!(changes, vec!["port".to_string()]);
/// assert_eq!(base["port"].as_u64(), Some(9090));
/// assert_eq!(base["name"].as_str(), Some("svc"));
/// ```
pub fn merge_values(base: &mut Value, overlay: Value) -> Vec<String> {
    let mut changes = Vec::new();
    merge_at(base, overlay, "", &mut changes);
    changes
}

fn merge_at(base: &mut Value, overlay: Value, prefix: &str, changes: &mut Vec<String>) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                let path = join_key(prefix, &key);
                match base_map.get_mut(&key) {
                    Some(existing) => merge_at(existing, value, &path, changes),
                    None => {
                        changes.push(path);
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => {
            if *base != overlay {
                changes.push(prefix.to_string());
            }
            *base = overlay;
        }
    }
}

fn join_key(prefix: &str, key: &Value) -> String {
    let key = match key {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => format!("{:?}", other),
    };

    if prefix.is_empty() {
        key
    } else {
        format!("{}.{}", prefix, key)
    }
}

/// Build a working set from the base file and ordered overlay candidates.
///
/// The base file must exist and parse; its failure is returned regardless of
/// `mode`. Overlay candidates that do not exist are skipped silently.
pub fn merge_files(
    base_path: &Path,
    overlays: &[PathBuf],
    mode: &MergeMode,
) -> Result<WorkingSet, ConfigFileError> {
    let value = load_yaml_file(base_path)?;

    let mut working = WorkingSet {
        value,
        merged: vec![base_path.to_path_buf()],
        skipped: Vec::new(),
    };

    for path in overlays {
        if !path.is_file() {
            continue;
        }

        match load_yaml_file(path) {
            Ok(overlay) => {
                let changes = merge_values(&mut working.value, overlay);
                if !changes.is_empty() {
                    debug!("Configuration from {}: {:?}", path.display(), changes);
                }
                working.merged.push(path.clone());
            }
            Err(e) if mode.skips_broken(path) => {
                warn!(
                    file = %path.display(),
                    error = %e,
                    "Failed to merge configuration file"
                );
                working.skipped.push(SkippedFile {
                    path: path.clone(),
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }

    Ok(working)
}
