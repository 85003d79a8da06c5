//! Disk queue and consumer configuration.
//!
//! Defaults mirror a production deployment: 200 MB segment files, 100 MB
//! message ceiling, sync every 1000 records or 1000 ms, ten local segments
//! retained per queue.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskQueueConfig {
    pub min_msg_size: u32,
    pub max_msg_size: u32,
    pub max_bytes_per_file: u64,
    pub sync_every_records: u64,
    pub sync_timeout_in_ms: u64,

    /// Total queue footprint cap. Zero disables the check.
    pub max_used_bytes: u64,
    /// Free-disk level below which appends log a warning.
    pub warning_free_bytes: u64,
    /// Free-disk level below which appends are rejected.
    pub reserved_free_bytes: u64,

    pub compress: CompressConfig,
    pub retention: RetentionConfig,
    pub replication: ReplicationConfig,
}

impl Default for DiskQueueConfig {
    fn default() -> Self {
        Self {
            min_msg_size: 1,
            max_msg_size: 104_857_600,
            max_bytes_per_file: 200 * 1024 * 1024,
            sync_every_records: 1000,
            sync_timeout_in_ms: 1000,
            max_used_bytes: 0,
            warning_free_bytes: 10 * 1024 * 1024 * 1024,
            reserved_free_bytes: 5 * 1024 * 1024 * 1024,
            compress: CompressConfig::default(),
            retention: RetentionConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressConfig {
    pub message: MessageCompressConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageCompressConfig {
    pub enabled: bool,
    pub level: i32,
}

impl Default for MessageCompressConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub max_num_of_local_files: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_num_of_local_files: 10,
        }
    }
}

/// Off-host shipping of sealed segments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub enabled: bool,
    /// Fire-and-forget upload when true; otherwise the seal waits for the copy.
    pub r#async: bool,
    pub server: String,
    pub location: String,
    pub bucket: String,
}

/// Per consumer-group fetch settings. Stored alongside the offsets so a
/// group keeps its tuning across restarts; processors may override the
/// non-zero fields of their own copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub group: String,
    pub name: String,
    pub fetch_min_bytes: usize,
    pub fetch_max_bytes: usize,
    pub fetch_max_messages: usize,
    pub fetch_max_wait_ms: u64,
    pub eof_retry_delay_in_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group: "group-001".to_string(),
            name: "consumer-001".to_string(),
            fetch_min_bytes: 1,
            fetch_max_bytes: 10 * 1024 * 1024,
            fetch_max_messages: 500,
            fetch_max_wait_ms: 10_000,
            eof_retry_delay_in_ms: 500,
        }
    }
}

impl ConsumerConfig {
    pub fn key(&self) -> String {
        format!("{}-{}", self.group, self.name)
    }

    /// Overlay the non-zero fetch settings of `other` onto self.
    pub fn merge(&mut self, other: &ConsumerConfig) {
        if other.eof_retry_delay_in_ms > 0 {
            self.eof_retry_delay_in_ms = other.eof_retry_delay_in_ms;
        }
        if other.fetch_max_messages > 0 {
            self.fetch_max_messages = other.fetch_max_messages;
        }
        if other.fetch_max_wait_ms > 0 {
            self.fetch_max_wait_ms = other.fetch_max_wait_ms;
        }
        if other.fetch_min_bytes > 0 {
            self.fetch_min_bytes = other.fetch_min_bytes;
        }
        if other.fetch_max_bytes > 0 {
            self.fetch_max_bytes = other.fetch_max_bytes;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_profile() {
        let cfg = DiskQueueConfig::default();
        assert_eq!(cfg.min_msg_size, 1);
        assert_eq!(cfg.max_bytes_per_file, 200 * 1024 * 1024);
        assert_eq!(cfg.retention.max_num_of_local_files, 10);
        assert!(!cfg.replication.enabled);
    }

    #[test]
    fn consumer_merge_keeps_zero_fields() {
        let mut base = ConsumerConfig::default();
        base.fetch_max_messages = 100;
        let mut overlay = ConsumerConfig::default();
        overlay.fetch_max_messages = 0;
        overlay.fetch_max_bytes = 42;
        let mut merged = base.clone();
        merged.merge(&overlay);
        assert_eq!(merged.fetch_max_messages, 100);
        assert_eq!(merged.fetch_max_bytes, 42);
    }
}
