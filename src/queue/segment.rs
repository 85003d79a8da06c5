//! Segment file naming and discovery.
//!
//! Pure path operations shared by the writer, the cursor and the reaper.

use std::path::{Path, PathBuf};

use crate::Result;

pub const SEGMENT_EXT: &str = "dat";

/// Bytes of the `len: i32 BE` frame header preceding every payload.
pub const FRAME_HEADER_LEN: usize = 4;

/// Segment filename from number, e.g. `000000042.dat`.
pub fn segment_filename(segment: i64) -> String {
    format!("{:09}.{}", segment, SEGMENT_EXT)
}

pub fn segment_path(dir: &Path, segment: i64) -> PathBuf {
    dir.join(segment_filename(segment))
}

/// Segment number if the name matches the `%09d.dat` layout.
pub fn parse_segment_filename(name: &str) -> Option<i64> {
    let base = name.strip_suffix(".dat")?;
    if base.len() != 9 || !base.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    base.parse::<i64>().ok()
}

/// Sorted segment numbers present in a queue directory.
pub fn discover_segments(dir: &Path) -> Result<Vec<i64>> {
    let mut segments = Vec::new();

    if !dir.exists() {
        return Ok(segments);
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(segment) = parse_segment_filename(name) {
            segments.push(segment);
        }
    }

    segments.sort_unstable();
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn naming() {
        assert_eq!(segment_filename(0), "000000000.dat");
        assert_eq!(segment_filename(42), "000000042.dat");
    }

    #[test]
    fn parse_rejects_foreign_files() {
        assert_eq!(parse_segment_filename("000000042.dat"), Some(42));
        assert_eq!(parse_segment_filename("42.dat"), None);
        assert_eq!(parse_segment_filename("000000042.dat.tmp"), None);
        assert_eq!(parse_segment_filename("abcdefghi.dat"), None);
        assert_eq!(parse_segment_filename("meta.json"), None);
    }

    #[test]
    fn discovery_sorts() {
        let dir = TempDir::new().unwrap();
        for n in [5i64, 0, 3] {
            std::fs::write(segment_path(dir.path(), n), b"").unwrap();
        }
        std::fs::write(dir.path().join("meta.json"), b"{}").unwrap();
        assert_eq!(discover_segments(dir.path()).unwrap(), vec![0, 3, 5]);
    }
}
