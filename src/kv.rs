//! Durable key-value bucket backed by a directory.
//!
//! One file per key, written through a temp file and published by rename so a
//! crash never leaves a torn value. Keys are flat strings; path separators and
//! NUL are rejected rather than escaped.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct KvBucket {
    dir: PathBuf,
}

impl KvBucket {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.key_path(key)?;
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(Some(buf))
    }

    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.key_path(key)?;
        // Not with_extension: keys may contain dots of their own.
        let tmp = self.dir.join(format!("{key}.tmp"));
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(value)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// All keys with the given prefix, in unspecified order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(".tmp") {
                continue;
            }
            if name.starts_with(prefix) {
                keys.push(name.to_string());
            }
        }
        Ok(keys)
    }

    fn key_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || key.contains('/')
            || key.contains('\\')
            || key.contains('\0')
            || key.starts_with('.')
        {
            return Err(Error::Unsupported("invalid kv key"));
        }
        Ok(self.dir.join(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let kv = KvBucket::open(dir.path()).unwrap();
        assert_eq!(kv.get("a|b|c").unwrap(), None);
        kv.put("a|b|c", b"1,42").unwrap();
        assert_eq!(kv.get("a|b|c").unwrap().as_deref(), Some(&b"1,42"[..]));
        kv.put("a|b|c", b"2,0").unwrap();
        assert_eq!(kv.get("a|b|c").unwrap().as_deref(), Some(&b"2,0"[..]));
    }

    #[test]
    fn rejects_path_like_keys() {
        let dir = TempDir::new().unwrap();
        let kv = KvBucket::open(dir.path()).unwrap();
        assert!(kv.put("../escape", b"x").is_err());
        assert!(kv.put("", b"x").is_err());
    }

    #[test]
    fn prefix_scan_skips_temp_files() {
        let dir = TempDir::new().unwrap();
        let kv = KvBucket::open(dir.path()).unwrap();
        kv.put("q1|g1|c1", b"0,0").unwrap();
        kv.put("q1|g2|c1", b"0,0").unwrap();
        kv.put("q2|g1|c1", b"0,0").unwrap();
        let mut keys = kv.keys_with_prefix("q1|").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["q1|g1|c1".to_string(), "q1|g2|c1".to_string()]);
    }
}
