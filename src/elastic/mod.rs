//! Elasticsearch-facing surface: cluster metadata, host health, traffic
//! control, bulk request plumbing and the bulk-indexing sink processor.

mod bulk;
mod hosts;
mod indexing;
mod metadata;
mod rate;
mod versions;

pub use bulk::{
    classify_bulk_response, first_action_id, validate_bulk_request, walk_bulk_request,
    BufferPool, BulkAction, BulkBuffer, BulkClassification, BulkDoc, BulkOutcome, BulkProcessor,
    BulkProcessorConfig, BulkStats,
};
pub use hosts::HostTable;
pub use indexing::{BulkIndexingConfig, BulkIndexingProcessor};
pub use metadata::{
    parse_nodes_response, parse_routing_table_response, ElasticsearchConfig,
    ElasticsearchMetadata, NodeInfo, ShardRouting, TrafficControl,
};
pub use rate::RateLimiterRegistry;
pub use versions::{select as select_version_caps, VersionCaps};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Per-process table of known clusters plus the shared host health table and
/// rate limiters. One instance lives in the [`crate::Runtime`].
#[derive(Default)]
pub struct ElasticRegistry {
    metadata: RwLock<HashMap<String, Arc<ElasticsearchMetadata>>>,
    pub hosts: HostTable,
    pub limiters: RateLimiterRegistry,
}

impl ElasticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, config: ElasticsearchConfig) -> Arc<ElasticsearchMetadata> {
        let meta = Arc::new(ElasticsearchMetadata::new(config));
        self.metadata
            .write()
            .expect("elastic registry lock")
            .insert(meta.config.id.clone(), Arc::clone(&meta));
        meta
    }

    pub fn metadata(&self, cluster: &str) -> Option<Arc<ElasticsearchMetadata>> {
        self.metadata
            .read()
            .expect("elastic registry lock")
            .get(cluster)
            .cloned()
    }

    pub fn cluster_ids(&self) -> Vec<String> {
        self.metadata
            .read()
            .expect("elastic registry lock")
            .keys()
            .cloned()
            .collect()
    }
}
