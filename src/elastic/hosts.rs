//! Host availability tracking and per-host HTTP clients.
//!
//! Every host a cluster exposes gets an availability record; bulk workers
//! mark hosts dead on transport failure and fall back to any active host of
//! the cluster. Clients are built once per host with the cluster's
//! connection bound and shared across workers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::elastic::metadata::ElasticsearchMetadata;
use crate::{Error, Result};

const DEFAULT_MAX_CONNS_PER_HOST: usize = 100;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

struct HostHealth {
    available: AtomicBool,
    dead_since: Mutex<Option<(Instant, String)>>,
}

impl HostHealth {
    fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            dead_since: Mutex::new(None),
        }
    }
}

#[derive(Default)]
pub struct HostTable {
    hosts: RwLock<HashMap<String, Arc<HostHealth>>>,
    clients: RwLock<HashMap<String, Arc<reqwest::blocking::Client>>>,
}

impl HostTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn health(&self, host: &str) -> Arc<HostHealth> {
        {
            let hosts = self.hosts.read().expect("hosts lock");
            if let Some(health) = hosts.get(host) {
                return Arc::clone(health);
            }
        }
        let mut hosts = self.hosts.write().expect("hosts lock");
        Arc::clone(
            hosts
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(HostHealth::new())),
        )
    }

    pub fn is_available(&self, host: &str) -> bool {
        self.health(host).available.load(Ordering::SeqCst)
    }

    pub fn is_dead(&self, host: &str) -> bool {
        !self.is_available(host)
    }

    pub fn mark_dead(&self, host: &str, reason: &str) {
        let health = self.health(host);
        if health.available.swap(false, Ordering::SeqCst) {
            log::warn!("host [{host}] marked dead: {reason}");
        }
        *health.dead_since.lock().expect("dead lock") =
            Some((Instant::now(), reason.to_string()));
    }

    pub fn mark_alive(&self, host: &str) {
        let health = self.health(host);
        if !health.available.swap(true, Ordering::SeqCst) {
            log::info!("host [{host}] back alive");
        }
        *health.dead_since.lock().expect("dead lock") = None;
    }

    /// Any available host of the cluster; falls back to the first seed so a
    /// fully-dead cluster still has a probe target.
    pub fn active_host(&self, meta: &ElasticsearchMetadata) -> Result<String> {
        let seeds = meta.seed_hosts();
        for host in &seeds {
            if self.is_available(host) {
                return Ok(host.clone());
            }
        }
        seeds
            .first()
            .cloned()
            .ok_or_else(|| Error::NoActiveHost(meta.config.id.clone()))
    }

    /// True when at least one host of the cluster is genuinely available.
    pub fn cluster_available(&self, meta: &ElasticsearchMetadata) -> bool {
        meta.seed_hosts().iter().any(|host| self.is_available(host))
    }

    /// Shared per-host client, bounded by the cluster's connection cap.
    pub fn client(
        &self,
        host: &str,
        meta: &ElasticsearchMetadata,
    ) -> Result<Arc<reqwest::blocking::Client>> {
        {
            let clients = self.clients.read().expect("clients lock");
            if let Some(client) = clients.get(host) {
                return Ok(Arc::clone(client));
            }
        }

        let max_conns = meta
            .config
            .traffic_control
            .as_ref()
            .filter(|tc| tc.max_connection_per_node > 0)
            .map(|tc| tc.max_connection_per_node)
            .unwrap_or(DEFAULT_MAX_CONNS_PER_HOST);

        let client = reqwest::blocking::Client::builder()
            .pool_max_idle_per_host(max_conns)
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|source| Error::Http {
                host: host.to_string(),
                source,
            })?;

        let mut clients = self.clients.write().expect("clients lock");
        let client = clients
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(client));
        Ok(Arc::clone(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elastic::metadata::ElasticsearchConfig;

    fn meta(hosts: &[&str]) -> ElasticsearchMetadata {
        ElasticsearchMetadata::new(ElasticsearchConfig {
            id: "c1".into(),
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            ..Default::default()
        })
    }

    #[test]
    fn dead_hosts_are_skipped() {
        let table = HostTable::new();
        let meta = meta(&["a:9200", "b:9200"]);

        assert_eq!(table.active_host(&meta).unwrap(), "a:9200");
        table.mark_dead("a:9200", "connect refused");
        assert_eq!(table.active_host(&meta).unwrap(), "b:9200");
        assert!(table.is_dead("a:9200"));
        assert!(table.cluster_available(&meta));

        table.mark_dead("b:9200", "timeout");
        assert!(!table.cluster_available(&meta));
        // Fully dead: fall back to the first seed as a probe target.
        assert_eq!(table.active_host(&meta).unwrap(), "a:9200");

        table.mark_alive("b:9200");
        assert_eq!(table.active_host(&meta).unwrap(), "b:9200");
    }

    #[test]
    fn no_hosts_is_an_error() {
        let table = HostTable::new();
        let meta = meta(&[]);
        assert!(matches!(
            table.active_host(&meta),
            Err(Error::NoActiveHost(_))
        ));
    }
}
