use layered_config::{
    ConfigHandle, ConfigLoader, ConfigReloadEvent, ConfigStore, LoaderOptions, SourceResolver,
    Validate,
};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tempfile::{TempDir, tempdir};
use tokio::sync::broadcast;
use tokio::time::{Duration, timeout};

#[derive(Debug, Default, Clone, PartialEq, Deserialize, Validate)]
struct ServiceConfig {
    #[validate(range(min = 1))]
    port: u16,
    name: String,
}

fn workspace() -> TempDir {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path().join("config")).unwrap();
    fs::write(dir.path().join("svc.yaml"), "port: 8080\nname: svc\n").unwrap();
    dir
}

fn loader(root: &Path) -> ConfigLoader {
    let options = LoaderOptions::default()
        .with_root(root)
        .with_debounce(Duration::from_millis(50));
    let resolver = SourceResolver::new(root).with_env_lookup(|_| None);
    ConfigLoader::with_options(ConfigStore::new(), options).with_resolver(resolver)
}

/// Wait until `done` holds, draining events; returns every event seen.
async fn wait_for<F>(
    rx: &mut broadcast::Receiver<ConfigReloadEvent>,
    mut done: F,
) -> Vec<ConfigReloadEvent>
where
    F: FnMut(&ConfigReloadEvent) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("Timeout waiting for reload event")
            .expect("Event channel closed");
        let finished = done(&event);
        seen.push(event);
        if finished {
            return seen;
        }
    }
}

#[tokio::test]
async fn test_watch_reloads_created_override() {
    let dir = workspace();
    let loader = loader(dir.path());
    let handle = ConfigHandle::<ServiceConfig>::default();

    let watch = loader.load_and_watch("svc", &handle).await.unwrap();
    let mut events = watch.subscribe();
    assert!(watch.is_active());
    assert_eq!(handle.get().port, 8080);

    fs::write(dir.path().join("config/override.yaml"), "port: 9090\n").unwrap();

    let reader = handle.clone();
    wait_for(&mut events, |event| {
        matches!(event, ConfigReloadEvent::Reloaded { .. }) && reader.get().port == 9090
    })
    .await;

    assert_eq!(
        *handle.get(),
        ServiceConfig {
            port: 9090,
            name: "svc".to_string(),
        }
    );
    let cached = loader.store().load::<ServiceConfig>("svc").unwrap();
    assert_eq!(*cached, *handle.get());

    watch.stop().await;
}

#[tokio::test]
async fn test_watch_announces_ready_to_first_subscriber() {
    let dir = workspace();
    let loader = loader(dir.path());
    let handle = ConfigHandle::<ServiceConfig>::default();

    let watch = loader.load_and_watch("svc", &handle).await.unwrap();

    let mut first = watch.subscribe();
    assert_eq!(first.try_recv().unwrap(), ConfigReloadEvent::Ready);
    let mut later = watch.subscribe();
    assert!(later.try_recv().is_err());

    watch.stop().await;
}

#[tokio::test]
async fn test_watch_applies_base_edit_while_override_is_broken() {
    let dir = workspace();
    fs::write(dir.path().join("config/override.yaml"), "port: [9090\n").unwrap();
    let loader = loader(dir.path());
    let handle = ConfigHandle::<ServiceConfig>::default();

    let watch = loader.load_and_watch("svc", &handle).await.unwrap();
    let mut events = watch.subscribe();
    assert_eq!(handle.get().port, 8080);

    fs::write(dir.path().join("svc.yaml"), "port: 8081\nname: svc\n").unwrap();

    let reader = handle.clone();
    wait_for(&mut events, |event| {
        matches!(event, ConfigReloadEvent::Reloaded { .. }) && reader.get().port == 8081
    })
    .await;

    assert_eq!(loader.store().load::<ServiceConfig>("svc").unwrap().port, 8081);

    watch.stop().await;
}

#[tokio::test]
async fn test_watch_keeps_last_good_config_on_invalid_edit() {
    let dir = workspace();
    let loader = loader(dir.path());
    let handle = ConfigHandle::<ServiceConfig>::default();

    let watch = loader.load_and_watch("svc", &handle).await.unwrap();
    let mut events = watch.subscribe();

    fs::write(dir.path().join("svc.yaml"), "port: [8081\nname: svc\n").unwrap();

    let seen = wait_for(&mut events, |event| {
        matches!(event, ConfigReloadEvent::Error { .. })
    })
    .await;

    assert!(
        seen.iter()
            .any(|e| matches!(e, ConfigReloadEvent::Changed(path) if path.ends_with("svc.yaml")))
    );
    assert_eq!(handle.get().port, 8080);
    assert_eq!(loader.store().load::<ServiceConfig>("svc").unwrap().port, 8080);

    // A later valid edit is still picked up.
    fs::write(dir.path().join("svc.yaml"), "port: 8082\nname: svc\n").unwrap();
    let reader = handle.clone();
    wait_for(&mut events, |event| {
        matches!(event, ConfigReloadEvent::Reloaded { .. }) && reader.get().port == 8082
    })
    .await;

    watch.stop().await;
}

#[tokio::test]
async fn test_watch_validation_failure_keeps_previous() {
    let dir = workspace();
    let loader = loader(dir.path());
    let handle = ConfigHandle::<ServiceConfig>::default();

    let watch = loader
        .load_and_watch_validated("svc", &handle)
        .await
        .unwrap();
    let mut events = watch.subscribe();

    fs::write(dir.path().join("config/tests.yaml"), "port: 0\n").unwrap();

    let seen = wait_for(&mut events, |event| {
        matches!(event, ConfigReloadEvent::Error { error, .. } if error.contains("validation"))
    })
    .await;

    assert!(!seen.is_empty());
    assert_eq!(handle.get().port, 8080);

    watch.stop().await;
}

#[tokio::test]
async fn test_stopped_watch_ignores_changes() {
    let dir = workspace();
    let loader = loader(dir.path());
    let handle = ConfigHandle::<ServiceConfig>::default();

    let watch = loader.load_and_watch("svc", &handle).await.unwrap();
    assert_eq!(watch.name(), "svc");
    assert!(
        watch
            .watched()
            .iter()
            .any(|p| p.ends_with("config/override.yaml"))
    );
    watch.stop().await;

    fs::write(dir.path().join("config/override.yaml"), "port: 9999\n").unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(handle.get().port, 8080);
    assert_eq!(handle.revision(), 1);
}

#[test]
fn test_manual_reload_reflects_new_values() {
    let dir = workspace();
    let loader = loader(dir.path());
    let handle = ConfigHandle::<ServiceConfig>::default();
    loader.load("svc", &handle).unwrap();
    let reloader = loader.reloader("svc", &handle).unwrap();

    let override_path = dir.path().join("config/override.yaml");
    fs::write(&override_path, "name: renamed\n").unwrap();
    let report = reloader.reload(&override_path).unwrap();

    assert_eq!(report.revision, 2);
    assert_eq!(handle.get().name, "renamed");
    assert_eq!(loader.store().load::<ServiceConfig>("svc").unwrap().name, "renamed");
}

#[test]
fn test_manual_reload_with_invalid_file_changes_nothing() {
    let dir = workspace();
    let loader = loader(dir.path());
    let handle = ConfigHandle::<ServiceConfig>::default();
    loader.load("svc", &handle).unwrap();
    let reloader = loader.reloader("svc", &handle).unwrap();

    let before_handle = handle.get();
    let before_store = loader.store().load::<ServiceConfig>("svc").unwrap();
    let before_raw = loader.store().load_value("svc");

    let base = dir.path().join("svc.yaml");
    fs::write(&base, "port: eighty\nname: svc\n").unwrap();
    assert!(reloader.reload(&base).is_err());

    assert!(Arc::ptr_eq(&before_handle, &handle.get()));
    assert!(Arc::ptr_eq(
        &before_store,
        &loader.store().load::<ServiceConfig>("svc").unwrap(),
    ));
    assert_eq!(loader.store().load_value("svc"), before_raw);
    assert_eq!(loader.store().revision("svc"), Some(1));
}

#[test]
fn test_concurrent_reloads_are_serialized() {
    let dir = workspace();
    let loader = loader(dir.path());
    let handle = ConfigHandle::<ServiceConfig>::default();
    loader.load("svc", &handle).unwrap();

    let base = dir.path().join("svc.yaml");
    let threads: Vec<_> = (0..8)
        .map(|_| {
            let reloader = loader.reloader("svc", &handle).unwrap();
            let base = base.clone();
            thread::spawn(move || {
                for _ in 0..10 {
                    reloader.reload(&base).unwrap();
                }
            })
        })
        .collect();

    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(loader.store().revision("svc"), Some(81));
    assert_eq!(handle.revision(), 81);
    assert!(Arc::ptr_eq(
        &handle.get(),
        &loader.store().load::<ServiceConfig>("svc").unwrap(),
    ));
}
