//! Cluster metadata: nodes, routing tables, version.
//!
//! Populated either directly (tests, static config) or by the HTTP
//! refreshers that read `/_nodes/_local/http` and
//! `/_cluster/state/routing_table` from any reachable host.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::elastic::versions::{select, VersionCaps};
use crate::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficControl {
    pub max_qps_per_node: u64,
    pub max_bytes_per_node: u64,
    pub max_connection_per_node: usize,
    pub max_wait_time_in_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ElasticsearchConfig {
    pub id: String,
    pub name: String,
    pub hosts: Vec<String>,
    pub version: String,
    pub traffic_control: Option<TrafficControl>,
}

#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    pub id: String,
    pub name: String,
    pub publish_address: String,
}

#[derive(Debug, Clone, Default)]
pub struct ShardRouting {
    pub index: String,
    pub shard: String,
    pub primary: bool,
    pub node: Option<String>,
}

pub struct ElasticsearchMetadata {
    pub config: ElasticsearchConfig,
    nodes: RwLock<HashMap<String, NodeInfo>>,
    routing: RwLock<HashMap<String, HashMap<String, Vec<ShardRouting>>>>,
    last_success: Mutex<Option<Instant>>,
}

impl ElasticsearchMetadata {
    pub fn new(config: ElasticsearchConfig) -> Self {
        Self {
            config,
            nodes: RwLock::new(HashMap::new()),
            routing: RwLock::new(HashMap::new()),
            last_success: Mutex::new(None),
        }
    }

    pub fn caps(&self) -> &'static dyn VersionCaps {
        select(&self.config.version)
    }

    pub fn seed_hosts(&self) -> Vec<String> {
        self.config.hosts.clone()
    }

    pub fn set_nodes(&self, nodes: HashMap<String, NodeInfo>) {
        *self.nodes.write().expect("nodes lock") = nodes;
    }

    /// `host:port` a node publishes for HTTP, if we know the node.
    pub fn node_publish_host(&self, node_id: &str) -> Option<String> {
        self.nodes
            .read()
            .expect("nodes lock")
            .get(node_id)
            .map(|node| node.publish_address.clone())
    }

    pub fn set_index_routing(&self, index: &str, shards: HashMap<String, Vec<ShardRouting>>) {
        self.routing
            .write()
            .expect("routing lock")
            .insert(index.to_string(), shards);
    }

    pub fn index_routing_table(
        &self,
        index: &str,
    ) -> Option<HashMap<String, Vec<ShardRouting>>> {
        self.routing
            .read()
            .expect("routing lock")
            .get(index)
            .cloned()
    }

    /// Node id of the primary copy of `(index, shard)`.
    pub fn primary_shard_node(&self, index: &str, shard: &str) -> Option<String> {
        let routing = self.routing.read().expect("routing lock");
        routing
            .get(index)?
            .get(shard)?
            .iter()
            .find(|r| r.primary)
            .and_then(|r| r.node.clone())
    }

    pub fn record_success(&self) {
        *self.last_success.lock().expect("success lock") = Some(Instant::now());
    }

    pub fn last_success(&self) -> Option<Instant> {
        *self.last_success.lock().expect("success lock")
    }

    /// Refresh node info over HTTP from the given host.
    pub fn refresh_nodes(&self, client: &reqwest::blocking::Client, host: &str) -> Result<()> {
        let url = format!("http://{host}/_nodes/_local/http");
        let body = client
            .get(&url)
            .send()
            .and_then(|resp| resp.bytes())
            .map_err(|source| Error::Http {
                host: host.to_string(),
                source,
            })?;
        let nodes = parse_nodes_response(&body)?;
        self.set_nodes(nodes);
        Ok(())
    }

    /// Refresh the routing table of every index over HTTP.
    pub fn refresh_routing(&self, client: &reqwest::blocking::Client, host: &str) -> Result<()> {
        let url = format!("http://{host}/_cluster/state/routing_table");
        let body = client
            .get(&url)
            .send()
            .and_then(|resp| resp.bytes())
            .map_err(|source| Error::Http {
                host: host.to_string(),
                source,
            })?;
        let tables = parse_routing_table_response(&body)?;
        let mut routing = self.routing.write().expect("routing lock");
        *routing = tables;
        Ok(())
    }
}

pub fn parse_nodes_response(body: &[u8]) -> Result<HashMap<String, NodeInfo>> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|err| Error::InvalidClusterState(format!("nodes response: {err}")))?;
    let mut out = HashMap::new();
    let Some(nodes) = value.get("nodes").and_then(|n| n.as_object()) else {
        return Ok(out);
    };
    for (id, node) in nodes {
        let publish_address = node
            .pointer("/http/publish_address")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        // Some distributions publish "hostname/ip:port"; keep the ip:port.
        let publish_address = publish_address
            .rsplit('/')
            .next()
            .unwrap_or(publish_address)
            .to_string();
        out.insert(
            id.clone(),
            NodeInfo {
                id: id.clone(),
                name: node
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                publish_address,
            },
        );
    }
    Ok(out)
}

pub fn parse_routing_table_response(
    body: &[u8],
) -> Result<HashMap<String, HashMap<String, Vec<ShardRouting>>>> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|err| Error::InvalidClusterState(format!("routing table response: {err}")))?;
    let mut out = HashMap::new();
    let Some(indices) = value
        .pointer("/routing_table/indices")
        .and_then(|v| v.as_object())
    else {
        return Ok(out);
    };
    for (index, entry) in indices {
        let mut shards_out: HashMap<String, Vec<ShardRouting>> = HashMap::new();
        let Some(shards) = entry.get("shards").and_then(|v| v.as_object()) else {
            continue;
        };
        for (shard_id, copies) in shards {
            let Some(copies) = copies.as_array() else { continue };
            let parsed = copies
                .iter()
                .map(|copy| ShardRouting {
                    index: index.clone(),
                    shard: shard_id.clone(),
                    primary: copy
                        .get("primary")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false),
                    node: copy
                        .get("node")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                })
                .collect();
            shards_out.insert(shard_id.clone(), parsed);
        }
        out.insert(index.clone(), shards_out);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_publish_addresses() {
        let body = br#"{
            "nodes": {
                "nodeA": {"name": "es-1", "http": {"publish_address": "10.0.0.1:9200"}},
                "nodeB": {"name": "es-2", "http": {"publish_address": "es-2.local/10.0.0.2:9200"}}
            }
        }"#;
        let nodes = parse_nodes_response(body).unwrap();
        assert_eq!(nodes["nodeA"].publish_address, "10.0.0.1:9200");
        assert_eq!(nodes["nodeB"].publish_address, "10.0.0.2:9200");
    }

    #[test]
    fn resolves_primary_shard_node() {
        let body = br#"{
            "routing_table": {
                "indices": {
                    "logs-1": {
                        "shards": {
                            "0": [
                                {"primary": false, "node": "replicaNode"},
                                {"primary": true, "node": "primaryNode"}
                            ],
                            "1": [
                                {"primary": true, "node": null}
                            ]
                        }
                    }
                }
            }
        }"#;
        let meta = ElasticsearchMetadata::new(ElasticsearchConfig {
            id: "c1".into(),
            ..Default::default()
        });
        let tables = parse_routing_table_response(body).unwrap();
        for (index, shards) in tables {
            meta.set_index_routing(&index, shards);
        }
        assert_eq!(
            meta.primary_shard_node("logs-1", "0").as_deref(),
            Some("primaryNode")
        );
        assert_eq!(meta.primary_shard_node("logs-1", "1"), None);
        assert_eq!(meta.primary_shard_node("logs-1", "9"), None);
        assert_eq!(meta.primary_shard_node("other", "0"), None);
    }
}
