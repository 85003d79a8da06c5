//! Per-version Elasticsearch capabilities.
//!
//! The wire differences the pipeline cares about are narrow: where the bulk
//! endpoint lives and what to do with `_type` in action metadata.

pub trait VersionCaps: Send + Sync {
    fn bulk_path(&self) -> &'static str {
        "/_bulk"
    }

    /// Whether action metadata may carry `_type`.
    fn supports_doc_type(&self) -> bool;

    /// Whether action metadata must carry `_type`.
    fn requires_doc_type(&self) -> bool;
}

pub struct V5;
pub struct V6;
pub struct V66;
pub struct V7;

impl VersionCaps for V5 {
    fn supports_doc_type(&self) -> bool {
        true
    }
    fn requires_doc_type(&self) -> bool {
        true
    }
}

impl VersionCaps for V6 {
    fn supports_doc_type(&self) -> bool {
        true
    }
    fn requires_doc_type(&self) -> bool {
        true
    }
}

impl VersionCaps for V66 {
    fn supports_doc_type(&self) -> bool {
        true
    }
    fn requires_doc_type(&self) -> bool {
        false
    }
}

impl VersionCaps for V7 {
    fn supports_doc_type(&self) -> bool {
        false
    }
    fn requires_doc_type(&self) -> bool {
        false
    }
}

/// Pick capabilities from a cluster version string like `"7.10.2"`.
/// Unknown or newer versions behave like 7.x.
pub fn select(version: &str) -> &'static dyn VersionCaps {
    let mut parts = version.split('.');
    let major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(7);
    let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    match major {
        0..=5 => &V5,
        6 if minor >= 6 => &V66,
        6 => &V6,
        _ => &V7,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_selection() {
        assert!(select("5.6.16").requires_doc_type());
        assert!(select("6.2.0").requires_doc_type());
        assert!(!select("6.8.0").requires_doc_type());
        assert!(select("6.8.0").supports_doc_type());
        assert!(!select("7.10.2").supports_doc_type());
        assert!(!select("8.1.0").supports_doc_type());
        assert!(!select("garbage").supports_doc_type());
    }
}
