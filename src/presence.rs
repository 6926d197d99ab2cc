//! Driver online/offline flag, persisted per driver and device.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tracing::info;
use uuid::Uuid;

/// Self-reported presence. `version` increases on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub online: bool,
    pub version: u64,
    pub set_at: DateTime<Utc>,
}

impl Presence {
    fn offline() -> Self {
        Self {
            online: false,
            version: 0,
            set_at: Utc::now(),
        }
    }
}

/// Key-value storage that survives a reload of the driver app.
pub trait PresenceStore: Send + Sync {
    fn load(&self, key: String) -> BoxFuture<'_, Result<Option<Presence>>>;

    fn save(&self, key: String, presence: Presence) -> BoxFuture<'_, Result<()>>;
}

#[derive(Default)]
pub struct MemoryPresenceStore {
    entries: Mutex<HashMap<String, Presence>>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PresenceStore for MemoryPresenceStore {
    fn load(&self, key: String) -> BoxFuture<'_, Result<Option<Presence>>> {
        Box::pin(async move { Ok(self.entries.lock().await.get(&key).copied()) })
    }

    fn save(&self, key: String, presence: Presence) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.entries.lock().await.insert(key, presence);
            Ok(())
        })
    }
}

/// One JSON file per key under `dir`.
pub struct FilePresenceStore {
    dir: PathBuf,
}

impl FilePresenceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key.replace([':', '/'], "_")))
    }
}

impl PresenceStore for FilePresenceStore {
    fn load(&self, key: String) -> BoxFuture<'_, Result<Option<Presence>>> {
        Box::pin(async move {
            let path = self.path(&key);
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(err) => {
                    return Err(err).with_context(|| format!("Failed to read {}", path.display()));
                }
            };
            let presence = serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok(Some(presence))
        })
    }

    fn save(&self, key: String, presence: Presence) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&self.dir)
                .await
                .with_context(|| format!("Failed to create {}", self.dir.display()))?;
            let path = self.path(&key);
            let tmp = path.with_extension("json.tmp");
            let bytes = serde_json::to_vec(&presence).context("Failed to serialize presence")?;
            tokio::fs::write(&tmp, bytes)
                .await
                .with_context(|| format!("Failed to write {}", tmp.display()))?;
            tokio::fs::rename(&tmp, &path)
                .await
                .with_context(|| format!("Failed to replace {}", path.display()))?;
            Ok(())
        })
    }
}

/// Owns a driver's presence on one device and broadcasts every change.
///
/// There is no server-side heartbeat. With `stale_after` unset, a driver who goes
/// away without toggling off stays online indefinitely.
pub struct PresenceTracker {
    driver_id: Uuid,
    key: String,
    store: Arc<dyn PresenceStore>,
    state: watch::Sender<Presence>,
    stale_after: Option<Duration>,
}

impl PresenceTracker {
    /// Restores the persisted flag, defaulting to offline.
    pub async fn restore(
        driver_id: Uuid,
        device_id: &str,
        store: Arc<dyn PresenceStore>,
        stale_after: Option<Duration>,
    ) -> Result<Self> {
        let key = format!("presence:{}:{}", driver_id, device_id);
        let presence = store
            .load(key.clone())
            .await
            .context("Failed to restore driver presence")?
            .unwrap_or_else(Presence::offline);

        Ok(Self {
            driver_id,
            key,
            store,
            state: watch::channel(presence).0,
            stale_after,
        })
    }

    pub fn driver_id(&self) -> Uuid {
        self.driver_id
    }

    pub fn current(&self) -> Presence {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<Presence> {
        self.state.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.is_online_at(Utc::now())
    }

    pub fn is_online_at(&self, now: DateTime<Utc>) -> bool {
        let presence = self.current();
        if !presence.online {
            return false;
        }
        match self.stale_after.and_then(|d| chrono::Duration::from_std(d).ok()) {
            Some(window) => now - presence.set_at < window,
            None => true,
        }
    }

    /// Persists the flag, then broadcasts it. Nothing changes if persistence fails.
    pub async fn set_online(&self, online: bool) -> Result<Presence> {
        let current = self.current();
        let next = Presence {
            online,
            version: current.version + 1,
            set_at: Utc::now(),
        };
        self.store
            .save(self.key.clone(), next)
            .await
            .context("Failed to persist driver presence")?;
        self.state.send_replace(next);
        info!(
            "Driver {} is now {}",
            self.driver_id,
            if online { "online" } else { "offline" }
        );
        Ok(next)
    }

    /// Re-asserts the current flag so a staleness window does not lapse.
    pub async fn heartbeat(&self) -> Result<Presence> {
        self.set_online(self.current().online).await
    }
}
