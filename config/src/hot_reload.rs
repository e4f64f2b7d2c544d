//! # Configuration Hot Reload
//!
//! Watches configuration files for changes and reloads configuration
//! automatically.
//!
//! The parent directory of every candidate file is watched, so overlays
//! created after the initial load and editors that save by rename are both
//! picked up. Notifier callbacks only forward events into a channel; a single
//! Tokio task per watch debounces them and runs the reloads one at a time.

use crate::loader::{LoadStage, LoaderOptions, Reloader};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Configuration reload event.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigReloadEvent {
    /// The watcher is installed; changes from now on trigger reloads
    Ready,

    /// A watched file was created or modified
    Changed(PathBuf),

    /// A watched file was removed
    Removed(PathBuf),

    /// The configuration was reloaded into the handle and the store
    Reloaded { name: String, revision: u64 },

    /// Watching or reloading failed; the previous configuration stays active
    Error { path: PathBuf, error: String },
}

/// A running watch. Dropping it stops the background task.
#[derive(Debug)]
pub struct ConfigWatch {
    name: String,
    events: broadcast::Sender<ConfigReloadEvent>,
    // Subscribed before `Ready` (or the install error) was sent.
    startup: Mutex<Option<broadcast::Receiver<ConfigReloadEvent>>>,
    watched: Vec<PathBuf>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ConfigWatch {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receive reload events.
    ///
    /// The first subscriber also gets the events sent while the watch was
    /// starting: `Ready`, or the `Error` explaining why the watch is
    /// inactive. Later subscribers see events from the time they subscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigReloadEvent> {
        self.startup
            .lock()
            .take()
            .unwrap_or_else(|| self.events.subscribe())
    }

    /// Files whose changes trigger a reload.
    pub fn watched(&self) -> &[PathBuf] {
        &self.watched
    }

    /// Whether the background task is still running.
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Signal the background task to stop and wait for it.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(name = %self.name, "Config watcher task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for ConfigWatch {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Identity of a file for event matching: canonical parent directory plus
/// file name. The file itself may not exist.
fn watch_key(path: &Path) -> Option<PathBuf> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let name = path.file_name()?;
    Some(parent.canonicalize().ok()?.join(name))
}

/// What a watch covers: event keys, the directories to register, and the
/// candidate paths as given.
struct WatchPlan {
    keys: HashSet<PathBuf>,
    dirs: Vec<PathBuf>,
    watched: Vec<PathBuf>,
}

impl WatchPlan {
    fn new(candidates: &[PathBuf]) -> Self {
        let mut keys = HashSet::new();
        let mut dirs = HashSet::new();
        let mut watched = Vec::new();
        for path in candidates {
            match watch_key(path) {
                Some(key) => {
                    if let Some(dir) = key.parent() {
                        dirs.insert(dir.to_path_buf());
                    }
                    keys.insert(key);
                    watched.push(path.clone());
                }
                None => debug!(file = %path.display(), "Directory does not exist, not watching"),
            }
        }

        let mut dirs: Vec<PathBuf> = dirs.into_iter().collect();
        dirs.sort();

        Self {
            keys,
            dirs,
            watched,
        }
    }
}

/// Install a watcher for `candidates` and spawn the reload task.
///
/// Must run inside a Tokio runtime. Failures to create or register the
/// watcher are logged and sent as `ConfigReloadEvent::Error`; the returned
/// watch is then inactive.
pub(crate) fn spawn_watch<T>(
    reloader: Reloader<T>,
    candidates: &[PathBuf],
    options: &LoaderOptions,
) -> ConfigWatch
where
    T: Send + Sync + 'static,
{
    start(reloader, WatchPlan::new(candidates), options)
}

fn start<T>(reloader: Reloader<T>, plan: WatchPlan, options: &LoaderOptions) -> ConfigWatch
where
    T: Send + Sync + 'static,
{
    let name = reloader.name().to_string();
    let capacity = options.event_capacity.max(1);
    let (events, startup) = broadcast::channel(capacity);
    let (fs_tx, fs_rx) = mpsc::channel(capacity);

    let watcher = match install(fs_tx, &plan.dirs) {
        Ok(watcher) => watcher,
        Err((path, e)) => {
            error!(
                name = %name,
                dir = %path.display(),
                error = %e,
                "Failed to watch configuration files"
            );
            let _ = events.send(ConfigReloadEvent::Error {
                path,
                error: e.to_string(),
            });
            return ConfigWatch {
                name,
                events,
                startup: Mutex::new(Some(startup)),
                watched: Vec::new(),
                shutdown: None,
                task: None,
            };
        }
    };

    info!(
        name = %name,
        stage = LoadStage::Watching.as_str(),
        files = plan.watched.len(),
        "Watching configuration files"
    );
    let _ = events.send(ConfigReloadEvent::Ready);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(run_watch(WatchTask {
        reloader,
        keys: plan.keys,
        fs_rx,
        shutdown: shutdown_rx,
        events: events.clone(),
        debounce: options.debounce,
        max_debounce: options.max_debounce,
        _watcher: watcher,
    }));

    ConfigWatch {
        name,
        events,
        startup: Mutex::new(Some(startup)),
        watched: plan.watched,
        shutdown: Some(shutdown_tx),
        task: Some(task),
    }
}

/// Create the notifier and register every directory. On failure, returns the
/// directory that could not be watched with the cause.
fn install(
    fs_tx: mpsc::Sender<notify::Result<Event>>,
    dirs: &[PathBuf],
) -> Result<RecommendedWatcher, (PathBuf, notify::Error)> {
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            let _ = fs_tx.blocking_send(res);
        },
        notify::Config::default(),
    )
    .map_err(|e| (dirs.first().cloned().unwrap_or_default(), e))?;

    for dir in dirs {
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| (dir.clone(), e))?;
    }

    Ok(watcher)
}

struct WatchTask<T> {
    reloader: Reloader<T>,
    keys: HashSet<PathBuf>,
    fs_rx: mpsc::Receiver<notify::Result<Event>>,
    shutdown: oneshot::Receiver<()>,
    events: broadcast::Sender<ConfigReloadEvent>,
    debounce: Duration,
    max_debounce: Duration,
    // Dropping the watcher unregisters it, so it lives as long as the task.
    _watcher: RecommendedWatcher,
}

async fn run_watch<T: Send + Sync + 'static>(mut task: WatchTask<T>) {
    let name = task.reloader.name().to_string();

    loop {
        tokio::select! {
            _ = &mut task.shutdown => {
                debug!(name = %name, "Stopping config watcher");
                break;
            }
            received = task.fs_rx.recv() => {
                let Some(result) = received else {
                    break;
                };
                let Some(first) = relevant_change(&task.keys, &task.events, result) else {
                    continue;
                };

                let changed = coalesce(
                    &mut task.fs_rx,
                    task.debounce,
                    task.max_debounce,
                    first,
                    |result| relevant_change(&task.keys, &task.events, result),
                )
                .await;

                reload(task.reloader.clone(), task.events.clone(), changed).await;
            }
        }
    }
}

/// Coalesce the burst of events a single save produces.
///
/// Waits until `window` passes without an event, but never longer than
/// `limit` in total, so a file that keeps changing still gets reloaded.
/// Returns the last relevant path seen.
async fn coalesce<F>(
    rx: &mut mpsc::Receiver<notify::Result<Event>>,
    window: Duration,
    limit: Duration,
    mut changed: PathBuf,
    mut relevant: F,
) -> PathBuf
where
    F: FnMut(notify::Result<Event>) -> Option<PathBuf>,
{
    let deadline = Instant::now() + limit.max(window);

    loop {
        let wait = window.min(deadline.saturating_duration_since(Instant::now()));
        if wait.is_zero() {
            break;
        }
        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Some(result)) => {
                if let Some(path) = relevant(result) {
                    changed = path;
                }
            }
            Ok(None) | Err(_) => break,
        }
    }

    changed
}

/// Map a notifier event to the watched file it touches, announcing it to
/// subscribers. `None` for errors, other event kinds and unrelated files.
fn relevant_change(
    keys: &HashSet<PathBuf>,
    events: &broadcast::Sender<ConfigReloadEvent>,
    result: notify::Result<Event>,
) -> Option<PathBuf> {
    let event = match result {
        Ok(event) => event,
        Err(e) => {
            warn!("Watch error: {}", e);
            return None;
        }
    };

    let removed = match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => false,
        EventKind::Remove(_) => true,
        _ => {
            debug!("Ignoring event: {:?}", event.kind);
            return None;
        }
    };

    let path = event
        .paths
        .into_iter()
        .find(|p| watch_key(p).is_some_and(|key| keys.contains(&key)))?;

    let reload_event = if removed {
        warn!("Config file removed: {:?}", path);
        ConfigReloadEvent::Removed(path.clone())
    } else {
        debug!("Config file updated: {:?}", path);
        ConfigReloadEvent::Changed(path.clone())
    };
    let _ = events.send(reload_event);

    Some(path)
}

async fn reload<T: Send + Sync + 'static>(
    reloader: Reloader<T>,
    events: broadcast::Sender<ConfigReloadEvent>,
    changed: PathBuf,
) {
    let path = changed.clone();
    let outcome = tokio::task::spawn_blocking(move || reloader.reload(&path)).await;

    let event = match outcome {
        Ok(Ok(report)) => ConfigReloadEvent::Reloaded {
            name: report.name,
            revision: report.revision,
        },
        Ok(Err(e)) => ConfigReloadEvent::Error {
            path: changed,
            error: e.to_string(),
        },
        Err(e) => {
            error!("Config reload task failed: {}", e);
            ConfigReloadEvent::Error {
                path: changed,
                error: e.to_string(),
            }
        }
    };

    let _ = events.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConfigHandle, ConfigLoader, ConfigStore};
    use notify::event::{AccessKind, CreateKind, ModifyKind, RemoveKind};
    use std::fs;
    use tempfile::tempdir;

    fn modified(path: &str) -> notify::Result<Event> {
        Ok(Event::new(EventKind::Modify(ModifyKind::Any)).add_path(PathBuf::from(path)))
    }

    fn first_path(result: notify::Result<Event>) -> Option<PathBuf> {
        result.ok().and_then(|event| event.paths.into_iter().next())
    }

    #[test]
    fn test_relevant_change_maps_event_kinds() {
        let dir = tempdir().unwrap();
        let watched = dir.path().join("override.yaml");
        let keys: HashSet<PathBuf> = watch_key(&watched).into_iter().collect();
        let (events, mut rx) = broadcast::channel(8);

        let created = Event::new(EventKind::Create(CreateKind::File)).add_path(watched.clone());
        assert_eq!(
            relevant_change(&keys, &events, Ok(created)),
            Some(watched.clone())
        );
        assert_eq!(rx.try_recv().unwrap(), ConfigReloadEvent::Changed(watched.clone()));

        let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path(watched.clone());
        assert_eq!(
            relevant_change(&keys, &events, Ok(removed)),
            Some(watched.clone())
        );
        assert_eq!(rx.try_recv().unwrap(), ConfigReloadEvent::Removed(watched.clone()));

        let accessed = Event::new(EventKind::Access(AccessKind::Any)).add_path(watched);
        assert_eq!(relevant_change(&keys, &events, Ok(accessed)), None);

        let unrelated = Event::new(EventKind::Create(CreateKind::File))
            .add_path(dir.path().join("other.yaml"));
        assert_eq!(relevant_change(&keys, &events, Ok(unrelated)), None);

        assert_eq!(
            relevant_change(&keys, &events, Err(notify::Error::generic("inotify limit"))),
            None
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_coalesce_returns_after_quiet_window() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(modified("/srv/config/tests.yaml")).await.unwrap();

        let changed = coalesce(
            &mut rx,
            Duration::from_millis(50),
            Duration::from_secs(5),
            PathBuf::from("/srv/config/override.yaml"),
            first_path,
        )
        .await;

        assert_eq!(changed, PathBuf::from("/srv/config/tests.yaml"));
    }

    #[tokio::test]
    async fn test_coalesce_is_bounded_under_continuous_events() {
        let (tx, mut rx) = mpsc::channel(8);
        let feeder = tokio::spawn(async move {
            loop {
                if tx.send(modified("/srv/svc.yaml")).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let started = Instant::now();
        let changed = coalesce(
            &mut rx,
            Duration::from_millis(50),
            Duration::from_millis(200),
            PathBuf::from("/srv/config/override.yaml"),
            first_path,
        )
        .await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(changed, PathBuf::from("/srv/svc.yaml"));
        feeder.abort();
    }

    #[tokio::test]
    async fn test_install_failure_is_sent_as_error_event() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("svc.yaml"), "port: 8080\n").unwrap();
        let options = LoaderOptions::default().with_root(dir.path());
        let loader = ConfigLoader::with_options(ConfigStore::new(), options.clone());
        let reloader = loader
            .reloader("svc", &ConfigHandle::new(serde_yaml::Value::Null))
            .unwrap();

        let missing = dir.path().join("gone");
        let plan = WatchPlan {
            keys: HashSet::new(),
            dirs: vec![missing.clone()],
            watched: vec![missing.join("override.yaml")],
        };
        let watch = start(reloader, plan, &options);

        assert!(!watch.is_active());
        assert!(watch.watched().is_empty());
        match watch.subscribe().try_recv() {
            Ok(ConfigReloadEvent::Error { path, .. }) => assert_eq!(path, missing),
            other => panic!("Expected an install error, got {:?}", other),
        }
    }

    #[test]
    fn test_watch_plan_skips_missing_directories() {
        let dir = tempdir().unwrap();
        let candidates = vec![
            dir.path().join("svc.yaml"),
            dir.path().join("config").join("override.yaml"),
        ];

        let plan = WatchPlan::new(&candidates);

        assert_eq!(plan.watched, vec![dir.path().join("svc.yaml")]);
        assert_eq!(plan.dirs, vec![dir.path().canonicalize().unwrap()]);
        assert_eq!(plan.keys.len(), 1);
    }

    #[test]
    fn test_watch_key_for_missing_file_in_existing_dir() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("override.yaml");

        let key = watch_key(&missing).unwrap();
        assert_eq!(key, dir.path().canonicalize().unwrap().join("override.yaml"));
    }

    #[test]
    fn test_watch_key_for_missing_dir() {
        let dir = tempdir().unwrap();
        assert!(watch_key(&dir.path().join("config").join("tests.yaml")).is_none());
    }
}
