use crate::config::types::Root;
use crate::config::{Manager, Notifier};
use crate::errors;
use anyhow::Context;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Config manager backed by a YAML file on disk.
///
/// The file's directory is watched so that editors replacing the file are
/// picked up too. A reload that fails to parse leaves the last good snapshot
/// in effect.
pub struct FileManager {
    path: PathBuf,
    current: ArcSwap<Root>,
    shutdown: CancellationToken,
}

impl FileManager {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            current: ArcSwap::from_pointee(Root::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Last snapshot delivered to the notifier.
    pub fn current(&self) -> Arc<Root> {
        self.current.load_full()
    }

    async fn reload(&self, notifier: &Arc<dyn Notifier>) {
        match load_config(&self.path).await {
            Ok(root) => {
                if *self.current.load_full() == root {
                    tracing::debug!("Config file touched without changes: {}", self.path.display());
                    return;
                }
                tracing::info!("Config file reloaded: {}", self.path.display());
                self.current.store(Arc::new(root.clone()));
                notifier.config_did_update(root);
            }
            Err(e) => {
                tracing::warn!(
                    "{}: {:#}",
                    errors::config::reload_failed(&self.path.display().to_string()),
                    e
                );
            }
        }
    }
}

#[async_trait]
impl Manager for FileManager {
    async fn start(&self, notifier: Arc<dyn Notifier>) -> anyhow::Result<()> {
        let root = load_config(&self.path).await?;
        self.current.store(Arc::new(root.clone()));
        notifier.config_did_update(root);

        let (_watcher, mut events) = watch_config_file(&self.path)?;
        tracing::info!("Watching config file: {}", self.path.display());

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(Ok(event)) if touches(&event, &self.path) => {
                        self.reload(&notifier).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("Config watcher error: {}", e);
                    }
                    None => break,
                }
            }
        }

        tracing::info!("Config manager stopped");
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

fn touches(event: &Event, path: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|changed| changed.file_name() == path.file_name())
}

pub async fn load_config(path: &Path) -> anyhow::Result<Root> {
    match fs::read_to_string(path).await {
        Ok(contents) => Root::from_yaml(&contents)
            .with_context(|| errors::config::corrupted_yaml(&path.display().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let default_config = Root::default();
            save_config(path, &default_config).await.with_context(|| {
                errors::config::failed_to_create_default(&path.display().to_string())
            })?;
            tracing::info!("Created default config at {}", path.display());
            Ok(default_config)
        }
        Err(e) => Err(e)
            .with_context(|| errors::config::failed_to_read(&path.display().to_string())),
    }
}

// Atomic write with temp file
pub async fn save_config(path: &Path, config: &Root) -> anyhow::Result<()> {
    let yaml_content =
        serde_yaml::to_string(config).context(errors::config::FAILED_TO_SERIALIZE)?;

    let parent = config_dir(path);
    fs::create_dir_all(parent)
        .await
        .with_context(|| errors::config::failed_to_create_dir(&parent.display().to_string()))?;

    let tmp_path = path.with_extension("tmp");

    fs::write(&tmp_path, yaml_content.as_bytes())
        .await
        .with_context(|| errors::config::failed_to_write_temp(&tmp_path.display().to_string()))?;

    #[cfg(unix)]
    {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&tmp_path)
            .await
            .context(errors::config::FAILED_TO_OPEN_TEMP)?;
        file.sync_all()
            .await
            .context(errors::config::FAILED_TO_FSYNC)?;
    }

    fs::rename(&tmp_path, path).await.with_context(|| {
        errors::config::failed_to_rename(
            &tmp_path.display().to_string(),
            &path.display().to_string(),
        )
    })?;

    Ok(())
}

pub fn watch_config_file(
    config_path: &Path,
) -> anyhow::Result<(RecommendedWatcher, mpsc::Receiver<notify::Result<Event>>)> {
    let (tx, rx) = mpsc::channel(10);

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            let _ = tx.blocking_send(res);
        },
        notify::Config::default(),
    )
    .context(errors::config::FAILED_TO_CREATE_WATCHER)?;

    let directory = config_dir(config_path);
    watcher
        .watch(directory, RecursiveMode::NonRecursive)
        .with_context(|| errors::config::failed_to_watch(&directory.display().to_string()))?;

    Ok((watcher, rx))
}

fn config_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Forwarder;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingNotifier {
        snapshots: Mutex<Vec<Root>>,
    }

    impl Notifier for RecordingNotifier {
        fn config_did_update(&self, root: Root) {
            self.snapshots.lock().unwrap().push(root);
        }
    }

    fn temp_config_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("tunnel_agent_test_{}", uuid::Uuid::new_v4()))
            .join("config.yaml")
    }

    #[tokio::test]
    async fn test_load_creates_default_when_missing() {
        let path = temp_config_path();
        let root = load_config(&path).await.unwrap();
        assert_eq!(root, Root::default());
        assert!(path.exists());

        let reloaded = load_config(&path).await.unwrap();
        assert_eq!(reloaded, root);
    }

    #[tokio::test]
    async fn test_load_rejects_corrupted_yaml() {
        let path = temp_config_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "forwarders: [unterminated").unwrap();

        let result = load_config(&path).await;
        assert!(result.unwrap_err().to_string().contains("Corrupted YAML"));
    }

    #[tokio::test]
    async fn test_save_then_load_preserves_forwarders() {
        let path = temp_config_path();
        let root = Root {
            forwarders: vec![Forwarder {
                url: "tcp://ssh.example.com:22".to_string(),
                listener: "127.0.0.1:2222".to_string(),
                ..Forwarder::default()
            }],
            ..Root::default()
        };
        save_config(&path, &root).await.unwrap();
        assert_eq!(load_config(&path).await.unwrap(), root);
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_start_delivers_initial_snapshot_and_stops() {
        let path = temp_config_path();
        let manager = Arc::new(FileManager::new(path.clone()));
        let notifier = Arc::new(RecordingNotifier::default());

        let running = {
            let manager = manager.clone();
            let notifier: Arc<dyn Notifier> = notifier.clone();
            tokio::spawn(async move { manager.start(notifier).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(notifier.snapshots.lock().unwrap().len(), 1);
        assert_eq!(*manager.current(), Root::default());

        manager.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_start_fails_on_corrupted_file() {
        let path = temp_config_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, ":::").unwrap();

        let manager = FileManager::new(path);
        let notifier: Arc<dyn Notifier> = Arc::new(RecordingNotifier::default());
        assert!(manager.start(notifier).await.is_err());
    }
}
