//! # Configuration Loader
//!
//! Orchestrates a load: resolve sources, merge them, decode the merged tree
//! into the caller's handle, and cache the snapshot in the store.
//!
//! # Stages
//! `resolving → merging → decoding → cached → watching`, or `failed`.
//! The current stage is recorded on the `config_load` span.

use crate::handle::ConfigHandle;
use crate::hot_reload::{self, ConfigWatch};
use crate::precedence::{MergeMode, SkippedFile, merge_files, same_file};
use crate::sources::{EnvSelectors, SourceResolver, normalize_name};
use crate::store::ConfigStore;
use errors::ConfigError;
use serde::de::DeserializeOwned;
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Span, error, field, info, info_span};
use validator::Validate;

/// Stage of a load or reload cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    Resolving,
    Merging,
    Decoding,
    Cached,
    Watching,
    Failed,
}

impl LoadStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resolving => "resolving",
            Self::Merging => "merging",
            Self::Decoding => "decoding",
            Self::Cached => "cached",
            Self::Watching => "watching",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for LoadStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Loader settings.
///
/// ## Fields
/// - `root`: directory the file layout is relative to (default: `.`)
/// - `search_dirs`: where the base file is looked up, relative to `root`
///   (default: `.`, then `config`)
/// - `env_selectors`: environment variables selecting environment files
/// - `debounce`: window in which file events are coalesced (default: 100ms)
/// - `max_debounce`: longest a stream of events can postpone a reload
///   (default: 1s)
/// - `event_capacity`: buffer size of the watch channels (default: 100)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderOptions {
    pub root: PathBuf,
    pub search_dirs: Vec<PathBuf>,
    pub env_selectors: EnvSelectors,
    pub debounce: Duration,
    pub max_debounce: Duration,
    pub event_capacity: usize,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            search_dirs: vec![PathBuf::from("."), PathBuf::from("config")],
            env_selectors: EnvSelectors::default(),
            debounce: Duration::from_millis(100),
            max_debounce: Duration::from_secs(1),
            event_capacity: 100,
        }
    }
}

impl LoaderOptions {
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_search_dirs<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.search_dirs = dirs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env_selectors(mut self, selectors: EnvSelectors) -> Self {
        self.env_selectors = selectors;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_max_debounce(mut self, max_debounce: Duration) -> Self {
        self.max_debounce = max_debounce;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    fn resolver(&self) -> SourceResolver {
        SourceResolver::new(self.root.clone())
            .with_search_dirs(self.search_dirs.clone())
            .with_selectors(self.env_selectors.clone())
    }
}

/// Outcome of a successful load or reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Lowercased configuration name.
    pub name: String,

    /// Files merged, base first.
    pub merged: Vec<PathBuf>,

    /// Overlays that existed but were skipped because they did not parse.
    pub skipped: Vec<SkippedFile>,

    /// Every candidate path, existing or not. These are the watched files.
    pub candidates: Vec<PathBuf>,

    /// Store revision written by this cycle.
    pub revision: u64,
}

type Decoder<T> = Arc<dyn Fn(&str, Value) -> Result<T, ConfigError> + Send + Sync>;

fn decode<T: DeserializeOwned>(name: &str, value: Value) -> Result<T, ConfigError> {
    serde_yaml::from_value(value).map_err(|e| ConfigError::Parse {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

fn decode_validated<T: DeserializeOwned + Validate>(
    name: &str,
    value: Value,
) -> Result<T, ConfigError> {
    let decoded: T = decode(name, value)?;
    decoded.validate().map_err(|e| ConfigError::Validation {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    Ok(decoded)
}

/// Runs decode-and-store cycles for one name and one handle.
///
/// Used by the watcher for every change notification; hosts that bring their
/// own notifier can drive it directly through [`Reloader::reload`].
pub struct Reloader<T> {
    name: String,
    resolver: SourceResolver,
    store: ConfigStore,
    target: ConfigHandle<T>,
    decoder: Decoder<T>,
}

impl<T> Clone for Reloader<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            resolver: self.resolver.clone(),
            store: self.store.clone(),
            target: self.target.clone(),
            decoder: Arc::clone(&self.decoder),
        }
    }
}

impl<T> std::fmt::Debug for Reloader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reloader")
            .field("name", &self.name)
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> Reloader<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &ConfigHandle<T> {
        &self.target
    }

    /// Re-merge every source and swap in the result.
    ///
    /// Overlays are merged strictly here: if an existing file fails to parse,
    /// or the decode fails, the handle and the store keep their previous
    /// contents. The one exception is an overlay that was already broken and
    /// skipped by the last good cycle and is not `changed` itself; it keeps
    /// being skipped, so edits to the other files still apply. Errors are
    /// logged and returned to the caller, who in the watcher's case only
    /// reports them as events.
    pub fn reload(&self, changed: &Path) -> Result<LoadReport, ConfigError> {
        info!(name = %self.name, file = %changed.display(), "Configuration file changed");

        match self.cycle(Some(changed)) {
            Ok(report) => {
                info!(
                    name = %self.name,
                    revision = report.revision,
                    "Configuration reloaded successfully"
                );
                Ok(report)
            }
            Err(e) => {
                error!(name = %self.name, error = %e, "Failed to reload configuration");
                Err(e)
            }
        }
    }

    /// One serialized cycle. `changed` is `None` for the initial load.
    fn cycle(&self, changed: Option<&Path>) -> Result<LoadReport, ConfigError> {
        let lock = self.store.reload_lock(&self.name);
        let _guard = lock.lock();

        let mode = match changed {
            None => MergeMode::Lenient,
            Some(changed) => {
                let mut tolerated = self.store.skipped(&self.name).unwrap_or_default();
                tolerated.retain(|path| !same_file(path, changed));
                if tolerated.is_empty() {
                    MergeMode::Strict
                } else {
                    MergeMode::StrictExcept(tolerated)
                }
            }
        };

        let span = info_span!("config_load", name = %self.name, stage = field::Empty);
        let _entered = span.enter();

        let result = self.run(&span, &mode);
        if result.is_err() {
            span.record("stage", LoadStage::Failed.as_str());
        }
        result
    }

    fn run(&self, span: &Span, mode: &MergeMode) -> Result<LoadReport, ConfigError> {
        span.record("stage", LoadStage::Resolving.as_str());
        let sources = self.resolver.resolve(&self.name)?;

        span.record("stage", LoadStage::Merging.as_str());
        let working = merge_files(&sources.base, &sources.overlays, mode).map_err(|source| {
            ConfigError::Read {
                name: sources.name.clone(),
                source,
            }
        })?;

        span.record("stage", LoadStage::Decoding.as_str());
        let decoded = (self.decoder)(&sources.name, working.value.clone())?;

        span.record("stage", LoadStage::Cached.as_str());
        let snapshot = Arc::new(decoded);
        self.target.replace(Arc::clone(&snapshot));
        let merged = working.merged.clone();
        let skipped = working.skipped.clone();
        let revision = self.store.store_merged(&sources.name, snapshot, working);

        Ok(LoadReport {
            candidates: sources.all_paths(),
            name: sources.name,
            merged,
            skipped,
            revision,
        })
    }
}

/// Loads layered YAML configuration into typed handles.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Entry point of the crate. Merges, in increasing precedence, the base file
/// `<name>.yaml` (or `config/<name>.yaml`), the files selected by the
/// production, staging and local environment variables, `config/override.yaml`
/// and `config/tests.yaml`, then decodes the result into `T`.
///
/// ## Usage
/// ```rust,no_run
/// use layered_config::{ConfigHandle, ConfigLoader, ConfigStore};
/// use serde::Deserialize;
///
/// #[derive(Debug, Default, Deserialize)]
/// struct ServiceConfig {
///     port: u16,
///     name: String,
/// }
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = ConfigStore::new();
///     let loader = ConfigLoader::new(store.clone());
///     let config = ConfigHandle::<ServiceConfig>::default();
///
///     let watch = loader.load_and_watch("Service", &config).await?;
///     println!("listening on {}", config.get().port);
///
///     watch.stop().await;
///     Ok(())
/// }
/// ```
///
/// ## Error Handling
/// - `ConfigError::InvalidName`: unusable name
/// - `ConfigError::Read`: base file missing or unparseable
/// - `ConfigError::Parse`: merged tree does not decode into `T`
/// - `ConfigError::Validation`: decoded value rejected by `validator`
///
/// Broken overlays never fail the initial load; they are logged and skipped.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    store: ConfigStore,
    resolver: SourceResolver,
    options: LoaderOptions,
}

impl ConfigLoader {
    pub fn new(store: ConfigStore) -> Self {
        Self::with_options(store, LoaderOptions::default())
    }

    pub fn with_options(store: ConfigStore, options: LoaderOptions) -> Self {
        Self {
            resolver: options.resolver(),
            store,
            options,
        }
    }

    /// Replace the resolver, e.g. to read selectors from somewhere other than
    /// the process environment.
    pub fn with_resolver(mut self, resolver: SourceResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    /// Load `name` into `target` without watching.
    pub fn load<T>(&self, name: &str, target: &ConfigHandle<T>) -> Result<LoadReport, ConfigError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let reloader = self.reloader(name, target)?;
        initial_load(&reloader)
    }

    /// Like [`ConfigLoader::load`], additionally running `T`'s `validator` rules.
    pub fn load_validated<T>(
        &self,
        name: &str,
        target: &ConfigHandle<T>,
    ) -> Result<LoadReport, ConfigError>
    where
        T: DeserializeOwned + Validate + Send + Sync + 'static,
    {
        let reloader = self.validated_reloader(name, target)?;
        initial_load(&reloader)
    }

    /// Load `name` into `target`, then watch its files and hot-reload.
    ///
    /// Must be called from within a Tokio runtime. Returns once the initial
    /// load has finished; a failure to install the file watcher is logged
    /// and does not fail the call. Dropping the returned [`ConfigWatch`]
    /// stops watching.
    pub async fn load_and_watch<T>(
        &self,
        name: &str,
        target: &ConfigHandle<T>,
    ) -> Result<ConfigWatch, ConfigError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let reloader = self.reloader(name, target)?;
        let report = initial_load(&reloader)?;
        Ok(hot_reload::spawn_watch(reloader, &report.candidates, &self.options))
    }

    /// Like [`ConfigLoader::load_and_watch`] with `validator` rules applied on
    /// every load and reload.
    pub async fn load_and_watch_validated<T>(
        &self,
        name: &str,
        target: &ConfigHandle<T>,
    ) -> Result<ConfigWatch, ConfigError>
    where
        T: DeserializeOwned + Validate + Send + Sync + 'static,
    {
        let reloader = self.validated_reloader(name, target)?;
        let report = initial_load(&reloader)?;
        Ok(hot_reload::spawn_watch(reloader, &report.candidates, &self.options))
    }

    /// Build a reloader for `name` and `target` without loading.
    pub fn reloader<T>(
        &self,
        name: &str,
        target: &ConfigHandle<T>,
    ) -> Result<Reloader<T>, ConfigError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let decoder: Decoder<T> = Arc::new(decode::<T>);
        self.build_reloader(name, target, decoder)
    }

    fn validated_reloader<T>(
        &self,
        name: &str,
        target: &ConfigHandle<T>,
    ) -> Result<Reloader<T>, ConfigError>
    where
        T: DeserializeOwned + Validate + Send + Sync + 'static,
    {
        let decoder: Decoder<T> = Arc::new(decode_validated::<T>);
        self.build_reloader(name, target, decoder)
    }

    fn build_reloader<T>(
        &self,
        name: &str,
        target: &ConfigHandle<T>,
        decoder: Decoder<T>,
    ) -> Result<Reloader<T>, ConfigError> {
        Ok(Reloader {
            name: normalize_name(name)?,
            resolver: self.resolver.clone(),
            store: self.store.clone(),
            target: target.clone(),
            decoder,
        })
    }
}

fn initial_load<T: Send + Sync + 'static>(
    reloader: &Reloader<T>,
) -> Result<LoadReport, ConfigError> {
    match reloader.cycle(None) {
        Ok(report) => {
            info!(
                name = %report.name,
                files = report.merged.len(),
                skipped = report.skipped.len(),
                "Configuration loaded successfully"
            );
            Ok(report)
        }
        Err(e) => {
            match &e {
                ConfigError::Read { .. } => {
                    error!(name = %reloader.name, error = %e, "Failed to read configuration file");
                }
                _ => {
                    error!(name = %reloader.name, error = %e, "Failed to parse configuration");
                }
            }
            Err(e)
        }
    }
}
