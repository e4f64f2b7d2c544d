//! # Configuration Sources
//!
//! Resolves which files take part in a load, in precedence order.
//!
//! # Naming Convention
//! - `<name>.yaml` / `<name>.yml` in the search path: base file
//! - `config/<value>.yaml`: file selected by an environment variable
//! - `config/override.yaml`: static override
//! - `config/tests.yaml`: test override, merged last

use errors::{ConfigError, ConfigFileError};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Extensions tried for the base file, in order.
pub const BASE_EXTENSIONS: [&str; 2] = ["yaml", "yml"];

/// Static overlay stems under `config/`, lowest precedence first.
pub const STATIC_OVERLAYS: [&str; 2] = ["override", "tests"];

/// Names of the environment variables that select environment files.
///
/// Checked in field order: `production`, then `staging`, then `local`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvSelectors {
    pub production: String,
    pub staging: String,
    pub local: String,
}

impl Default for EnvSelectors {
    fn default() -> Self {
        Self {
            production: "PROD_CONFIG".to_string(),
            staging: "STAGE_CONFIG".to_string(),
            local: "LOCAL_CONFIG".to_string(),
        }
    }
}

impl EnvSelectors {
    /// Selectors namespaced by `prefix`, e.g. `ACME_PROD_CONFIG`.
    pub fn with_prefix(prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('_').to_uppercase();
        let defaults = Self::default();
        Self {
            production: format!("{}_{}", prefix, defaults.production),
            staging: format!("{}_{}", prefix, defaults.staging),
            local: format!("{}_{}", prefix, defaults.local),
        }
    }

    /// Variable names in precedence order, lowest first.
    pub fn in_order(&self) -> [&str; 3] {
        [&self.production, &self.staging, &self.local]
    }
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Files participating in a load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSources {
    /// Lowercased configuration name.
    pub name: String,

    /// The base file (exists at resolve time).
    pub base: PathBuf,

    /// Overlay candidates in precedence order; may not exist.
    pub overlays: Vec<PathBuf>,
}

impl ResolvedSources {
    /// Every path that can influence the merged result, base first.
    pub fn all_paths(&self) -> Vec<PathBuf> {
        std::iter::once(self.base.clone())
            .chain(self.overlays.iter().cloned())
            .collect()
    }
}

/// Resolves base and overlay files for a configuration name.
#[derive(Clone)]
pub struct SourceResolver {
    root: PathBuf,
    search_dirs: Vec<PathBuf>,
    selectors: EnvSelectors,
    env: EnvLookup,
}

impl fmt::Debug for SourceResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceResolver")
            .field("root", &self.root)
            .field("search_dirs", &self.search_dirs)
            .field("selectors", &self.selectors)
            .finish_non_exhaustive()
    }
}

impl Default for SourceResolver {
    fn default() -> Self {
        Self::new(".")
    }
}

impl SourceResolver {
    /// Resolver rooted at `root`, searching `root` then `root/config` for the
    /// base file and reading selectors from the process environment.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            search_dirs: vec![PathBuf::from("."), PathBuf::from("config")],
            selectors: EnvSelectors::default(),
            env: Arc::new(|key| std::env::var(key).ok()),
        }
    }

    /// Replace the base-file search path. Relative entries are joined to the root.
    pub fn with_search_dirs<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.search_dirs = dirs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_selectors(mut self, selectors: EnvSelectors) -> Self {
        self.selectors = selectors;
        self
    }

    /// Replace the environment lookup used for the selectors.
    pub fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Arc::new(lookup);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve the files for `name`.
    ///
    /// # M-CANONICAL-DOCS
    ///
    /// ## Purpose
    /// Locates the base file and lists overlay candidates, lowest precedence
    /// first: environment files (production, staging, local), then
    /// `override.yaml`, then `tests.yaml`.
    ///
    /// ## Error Handling
    /// - `ConfigError::InvalidName` when `name` is not a usable file stem
    /// - `ConfigError::Read` wrapping `ConfigFileError::NotFound` when no
    ///   base file exists in the search path
    pub fn resolve(&self, name: &str) -> Result<ResolvedSources, ConfigError> {
        let stem = normalize_name(name)?;
        let base = self.find_base(&stem).ok_or_else(|| ConfigError::Read {
            name: stem.clone(),
            source: ConfigFileError::NotFound {
                path: self.describe_search(&stem),
            },
        })?;

        let config_dir = self.root.join("config");
        let mut overlays = Vec::new();

        for var in self.selectors.in_order() {
            let Some(value) = (self.env)(var) else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            overlays.push(config_dir.join(format!("{}.yaml", value)));
        }

        for overlay in STATIC_OVERLAYS {
            overlays.push(config_dir.join(format!("{}.yaml", overlay)));
        }

        overlays.retain(|path| path != &base);

        Ok(ResolvedSources {
            name: stem,
            base,
            overlays,
        })
    }

    fn base_candidates(&self, stem: &str) -> Vec<PathBuf> {
        self.search_dirs
            .iter()
            .flat_map(|dir| {
                let dir = if dir.as_os_str() == "." {
                    self.root.clone()
                } else {
                    self.root.join(dir)
                };
                BASE_EXTENSIONS
                    .iter()
                    .map(move |ext| dir.join(format!("{}.{}", stem, ext)))
            })
            .collect()
    }

    fn find_base(&self, stem: &str) -> Option<PathBuf> {
        self.base_candidates(stem)
            .into_iter()
            .find(|path| path.is_file())
    }

    fn describe_search(&self, stem: &str) -> String {
        self.base_candidates(stem)
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Lowercase `name` and check it can be used as a file stem.
pub fn normalize_name(name: &str) -> Result<String, ConfigError> {
    let trimmed = name.trim();
    let invalid = trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.contains(['/', '\\', '\0']);

    if invalid {
        return Err(ConfigError::InvalidName {
            name: name.to_string(),
        });
    }

    Ok(trimmed.to_lowercase())
}
