//! Queue config registry.
//!
//! Name → config and id → config under one writer lock. Registration is
//! idempotent on name; change listeners fire after every mutation, which is
//! how the registry gets persisted to `<data>/queue/configs` and reloaded on
//! the next boot.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const SOURCE_FILE: &str = "file";
pub const SOURCE_DYNAMIC: &str = "dynamic";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub id: String,
    pub name: String,
    pub source: String,
    pub codec: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "metadata")]
    pub labels: BTreeMap<String, String>,
}

impl QueueConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    // Well-known label projections.

    pub fn elasticsearch(&self) -> Option<&str> {
        self.labels.get("elasticsearch").map(String::as_str)
    }

    pub fn level(&self) -> Option<&str> {
        self.labels.get("level").map(String::as_str)
    }

    pub fn node_id(&self) -> Option<&str> {
        self.labels.get("node_id").map(String::as_str)
    }

    pub fn index(&self) -> Option<&str> {
        self.labels.get("index").map(String::as_str)
    }

    pub fn shard(&self) -> Option<&str> {
        self.labels.get("shard").map(String::as_str)
    }
}

/// Label-superset match plus optional explicit ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSelector {
    pub labels: BTreeMap<String, String>,
    pub ids: Vec<String>,
    pub keys: Vec<String>,
}

impl QueueSelector {
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn matches(&self, cfg: &QueueConfig) -> bool {
        if self.ids.iter().any(|id| *id == cfg.id) {
            return true;
        }
        if self.keys.iter().any(|name| *name == cfg.name) {
            return true;
        }
        if self.labels.is_empty() {
            return self.ids.is_empty() && self.keys.is_empty();
        }
        self.labels
            .iter()
            .all(|(k, v)| cfg.labels.get(k).map(String::as_str) == Some(v.as_str()))
    }
}

type ChangeListener = Box<dyn Fn(&Registry) + Send + Sync>;

#[derive(Default)]
struct RegistryInner {
    by_name: HashMap<String, Arc<QueueConfig>>,
    by_id: HashMap<String, Arc<QueueConfig>>,
}

pub struct Registry {
    inner: RwLock<RegistryInner>,
    listeners: Mutex<Vec<ChangeListener>>,
    path: PathBuf,
}

impl Registry {
    /// Open the registry, loading any configs persisted by a previous run.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref().join("queue");
        std::fs::create_dir_all(&dir)?;
        let registry = Self {
            inner: RwLock::new(RegistryInner::default()),
            listeners: Mutex::new(Vec::new()),
            path: dir.join("configs"),
        };
        registry.load()?;
        Ok(registry)
    }

    pub fn on_change(&self, listener: impl Fn(&Registry) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .expect("registry listeners")
            .push(Box::new(listener));
    }

    /// Register a config under its name. Returns the stored config and
    /// whether a config with that name already existed (in which case the
    /// stored one wins). Assigns a fresh uuid when the id is empty.
    pub fn register(&self, mut cfg: QueueConfig) -> (Arc<QueueConfig>, bool) {
        let existing = {
            let inner = self.inner.read().expect("registry lock");
            inner.by_name.get(&cfg.name).cloned()
        };
        if let Some(existing) = existing {
            return (existing, true);
        }

        if cfg.id.is_empty() {
            cfg.id = uuid::Uuid::new_v4().to_string();
        }
        let cfg = Arc::new(cfg);
        {
            let mut inner = self.inner.write().expect("registry lock");
            // Lost race: another writer registered the name first.
            if let Some(existing) = inner.by_name.get(&cfg.name) {
                return (Arc::clone(existing), true);
            }
            inner.by_name.insert(cfg.name.clone(), Arc::clone(&cfg));
            inner.by_id.insert(cfg.id.clone(), Arc::clone(&cfg));
        }
        self.notify();
        (cfg, false)
    }

    /// Lazy first-use registration: dynamic source, id = name.
    pub fn get_or_init(&self, name: &str) -> Arc<QueueConfig> {
        if let Some(cfg) = self.get(name) {
            return cfg;
        }
        let cfg = QueueConfig {
            id: name.to_string(),
            name: name.to_string(),
            source: SOURCE_DYNAMIC.to_string(),
            ..Default::default()
        };
        self.register(cfg).0
    }

    pub fn get(&self, name: &str) -> Option<Arc<QueueConfig>> {
        self.inner
            .read()
            .expect("registry lock")
            .by_name
            .get(name)
            .cloned()
    }

    pub fn get_by_id(&self, id: &str) -> Option<Arc<QueueConfig>> {
        self.inner
            .read()
            .expect("registry lock")
            .by_id
            .get(id)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<QueueConfig>> {
        self.inner
            .read()
            .expect("registry lock")
            .by_name
            .values()
            .cloned()
            .collect()
    }

    pub fn get_by_selector(&self, selector: &QueueSelector) -> Vec<Arc<QueueConfig>> {
        self.all()
            .into_iter()
            .filter(|cfg| selector.matches(cfg))
            .collect()
    }

    /// Persist the full registry as JSON `name → config`.
    pub fn persist(&self) -> Result<()> {
        let map: BTreeMap<String, QueueConfig> = {
            let inner = self.inner.read().expect("registry lock");
            inner
                .by_name
                .iter()
                .map(|(name, cfg)| (name.clone(), (**cfg).clone()))
                .collect()
        };
        let data = serde_json::to_vec_pretty(&map)
            .map_err(|_| Error::Unsupported("registry serialization failed"))?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn load(&self) -> Result<()> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let map: BTreeMap<String, QueueConfig> = serde_json::from_slice(&data).map_err(|err| {
            log::error!("registry file parse failed at {:?}: {err}", self.path);
            Error::Unsupported("corrupt registry file")
        })?;
        let mut inner = self.inner.write().expect("registry lock");
        for (name, mut cfg) in map {
            if cfg.id.is_empty() {
                cfg.id = name.clone();
            }
            let cfg = Arc::new(cfg);
            inner.by_id.insert(cfg.id.clone(), Arc::clone(&cfg));
            inner.by_name.insert(name, cfg);
        }
        Ok(())
    }

    fn notify(&self) {
        let listeners = self.listeners.lock().expect("registry listeners");
        for listener in listeners.iter() {
            listener(self);
        }
    }
}
