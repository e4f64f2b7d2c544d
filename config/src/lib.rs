//! # Layered Configuration
//!
//! Loads layered YAML configuration into typed handles and keeps them
//! current while the service runs.
//!
//! This crate provides:
//! - Source resolution: base file, environment-selected files, static overrides
//! - Deep merging of YAML files in a fixed precedence
//! - Decoding into any `serde` type, with optional `validator` rules
//! - A shared, injectable store of the latest decoded snapshots
//! - Hot reload driven by filesystem notifications
//!
//! # Precedence
//! From lowest to highest:
//! 1. `<name>.yaml` or `config/<name>.yaml`
//! 2. `config/<value>.yaml` for each of the production, staging and local
//!    selector variables that is set
//! 3. `config/override.yaml`
//! 4. `config/tests.yaml`
//!
//! A failed reload never touches the handle or the store; the service keeps
//! running on the last good configuration.

pub mod file_loader;
pub mod handle;
pub mod hot_reload;
pub mod loader;
pub mod precedence;
pub mod sources;
pub mod store;

pub use errors::{ConfigError, ConfigFileError};
pub use file_loader::{load_yaml_file, parse_yaml};
pub use handle::ConfigHandle;
pub use hot_reload::{ConfigReloadEvent, ConfigWatch};
pub use loader::{ConfigLoader, LoadReport, LoadStage, LoaderOptions, Reloader};
pub use precedence::{MergeMode, SkippedFile, WorkingSet, merge_files, merge_values};
pub use sources::{EnvSelectors, ResolvedSources, SourceResolver};
pub use store::ConfigStore;
pub use validator::Validate;
