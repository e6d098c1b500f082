//! Live configuration: the current validated snapshot plus a watcher that
//! republishes it whenever the config file changes on disk.

use crate::config_loader::{self, Settings};
use crate::error::{Result, SayerError};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// How often the watcher re-reads the config file.
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(1);

type FileDigest = [u8; 32];

/// Owns the live `Settings` snapshot. Cheap to clone; clones share the snapshot.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    snapshot: watch::Sender<Arc<Settings>>,
    /// Digest of the file bytes last looked at, valid or not.
    last_digest: Mutex<FileDigest>,
}

impl ConfigStore {
    /// Resolves, loads and validates the config file. Any failure here is fatal to startup.
    pub fn open(explicit: Option<&Path>) -> Result<Self> {
        let path = config_loader::resolve_path(explicit)?;
        let raw = std::fs::read(&path).map_err(|e| {
            SayerError::ConfigInvalid(format!("reading {} failed: {}", path.display(), e))
        })?;
        let settings = parse(&raw)?;

        info!(path = %path.display(), "config loaded");
        log_settings(&settings);

        let (snapshot, _) = watch::channel(Arc::new(settings));
        Ok(Self {
            inner: Arc::new(Inner {
                path,
                snapshot,
                last_digest: Mutex::new(digest(&raw)),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// The snapshot in effect right now.
    pub fn current(&self) -> Arc<Settings> {
        self.inner.snapshot.borrow().clone()
    }

    /// Notified once per published snapshot; bursts coalesce to the latest.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Settings>> {
        self.inner.snapshot.subscribe()
    }

    /// Re-reads the file. Returns `Ok(true)` when a new snapshot was published.
    /// On any error the previous snapshot stays live.
    ///
    /// Blocking; async callers should run it on the blocking pool.
    pub fn reload(&self) -> Result<bool> {
        let mut last = self
            .inner
            .last_digest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let raw = std::fs::read(&self.inner.path)?;
        let digest = digest(&raw);
        if *last == digest {
            return Ok(false);
        }
        // remember broken content too, so it is reported once rather than every tick
        *last = digest;

        let settings = parse(&raw)?;
        if *self.current() == settings {
            debug!("config file rewritten without changes");
            return Ok(false);
        }

        log_settings(&settings);
        self.inner.snapshot.send_replace(Arc::new(settings));
        Ok(true)
    }

    /// Polls the config file every `interval` until the last store handle is dropped.
    pub fn spawn_watcher(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let path = self.inner.path.clone();

        tokio::spawn(async move {
            info!(path = %path.display(), ?interval, "watching config file");

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            let mut unreadable = false;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    debug!("config store dropped, watcher exiting");
                    break;
                };
                let store = ConfigStore { inner };

                // file read and address lookup both block
                let reloaded = match tokio::task::spawn_blocking(move || store.reload()).await {
                    Ok(reloaded) => reloaded,
                    Err(e) => {
                        error!(error = %e, "config reload task failed");
                        continue;
                    }
                };
                match reloaded {
                    Ok(true) => {
                        unreadable = false;
                        warn!(path = %path.display(), "config file changed, new config published");
                    }
                    Ok(false) => unreadable = false,
                    Err(SayerError::Io(e)) => {
                        if !unreadable {
                            warn!(path = %path.display(), error = %e, "config file unreadable, keeping current config");
                        }
                        unreadable = true;
                    }
                    Err(e) => {
                        unreadable = false;
                        error!(path = %path.display(), error = %e, "reloading config failed, keeping current config");
                    }
                }
            }
        })
    }
}

fn parse(raw: &[u8]) -> Result<Settings> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| SayerError::ConfigInvalid(format!("config is not UTF-8: {}", e)))?;
    Settings::from_yaml(text)
}

fn digest(raw: &[u8]) -> FileDigest {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(raw));
    out
}

fn log_settings(settings: &Settings) {
    let mut yaml = Vec::new();
    match settings.redacted().write_yaml(&mut yaml) {
        Ok(()) => info!("config:\n{}", String::from_utf8_lossy(&yaml)),
        Err(e) => warn!(error = %e, "could not render config for logging"),
    }
}
