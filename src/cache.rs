//! Disk-backed cache of raw block bytes, keyed by (chain, height).
//!
//! Blocks are immutable once finalised, so entries are never invalidated.
//! The cache is advisory: a read error is a miss and is recovered by
//! re-fetching. The checkpoint (highest densely-cached height) is the only
//! strongly-consistent state.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::warn;

/// Heights are grouped into per-bucket subdirectories to keep directory
/// sizes bounded on chains with hundreds of millions of blocks.
const BUCKET_SIZE: u64 = 10_000;

const CHECKPOINT_FILE: &str = "checkpoint";

#[derive(Debug)]
pub struct BlockCache {
    dir: PathBuf,
    chain_id: u32,
}

impl BlockCache {
    /// Opens (creating if needed) the cache directory for one chain,
    /// `<root>/<chain_id>/`.
    pub fn new(root: impl AsRef<Path>, chain_id: u32) -> Result<Self> {
        let dir = root.as_ref().join(chain_id.to_string());
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create cache dir {}", dir.display()))?;
        Ok(Self { dir, chain_id })
    }

    fn entry_path(&self, height: u64) -> PathBuf {
        self.dir
            .join((height / BUCKET_SIZE).to_string())
            .join(format!("{height}.json"))
    }

    /// Writes one entry atomically: temp file in the same directory, fsync,
    /// rename. Durable before returning.
    pub fn put(&self, height: u64, bytes: &[u8]) -> Result<()> {
        let path = self.entry_path(height);
        let parent = path.parent().expect("entry path has a bucket directory");
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create bucket dir {}", parent.display()))?;

        let tmp = parent.join(format!(".{height}.tmp"));
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to rename {} into place", tmp.display()))?;
        Ok(())
    }

    /// Returns the entry if present and readable. Read errors are misses.
    pub fn get(&self, height: u64) -> Option<Vec<u8>> {
        fs::read(self.entry_path(height)).ok()
    }

    /// Best-effort range lookup: returns exactly the present subset.
    pub fn get_range(&self, from: u64, to: u64) -> HashMap<u64, Vec<u8>> {
        let mut found = HashMap::new();
        for height in from..=to {
            if let Some(bytes) = self.get(height) {
                found.insert(height, bytes);
            }
        }
        found
    }

    /// Returns the cached bytes, filling from `fill` on a miss. A write
    /// failure is logged and swallowed; the caller still gets the bytes.
    pub fn get_or_fill<F>(&self, height: u64, fill: F) -> Result<Vec<u8>>
    where
        F: FnOnce() -> Result<Vec<u8>>,
    {
        if let Some(bytes) = self.get(height) {
            return Ok(bytes);
        }

        let bytes = fill()?;
        if let Err(err) = self.put(height, &bytes) {
            warn!(
                "[chain {}] failed to cache block {height}: {err:#}",
                self.chain_id
            );
        }
        Ok(bytes)
    }

    /// Highest densely-cached height, 0 when never saved.
    pub fn checkpoint(&self) -> u64 {
        let Ok(data) = fs::read_to_string(self.dir.join(CHECKPOINT_FILE)) else {
            return 0;
        };
        data.trim().parse().unwrap_or(0)
    }

    /// Advances the checkpoint. Monotone: a lower value is never written.
    pub fn set_checkpoint(&self, height: u64) -> Result<()> {
        if height <= self.checkpoint() {
            return Ok(());
        }

        let path = self.dir.join(CHECKPOINT_FILE);
        let tmp = self.dir.join(".checkpoint.tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(height.to_string().as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &path).context("failed to rename checkpoint into place")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> (tempfile::TempDir, BlockCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = BlockCache::new(dir.path(), 43114).unwrap();
        (dir, cache)
    }

    #[test]
    fn put_then_get_roundtrip() {
        let (_dir, cache) = cache();
        cache.put(7, b"block seven").unwrap();
        assert_eq!(cache.get(7).unwrap(), b"block seven");
        assert_eq!(cache.get(8), None);
    }

    #[test]
    fn get_range_returns_present_subset() {
        let (_dir, cache) = cache();
        cache.put(1, b"a").unwrap();
        cache.put(3, b"c").unwrap();

        let found = cache.get_range(1, 4);
        assert_eq!(found.len(), 2);
        assert_eq!(found[&1], b"a");
        assert_eq!(found[&3], b"c");
        assert!(!found.contains_key(&2));
    }

    #[test]
    fn entries_span_bucket_directories() {
        let (_dir, cache) = cache();
        cache.put(9_999, b"last of bucket 0").unwrap();
        cache.put(10_000, b"first of bucket 1").unwrap();
        assert_eq!(cache.get(9_999).unwrap(), b"last of bucket 0");
        assert_eq!(cache.get(10_000).unwrap(), b"first of bucket 1");
    }

    #[test]
    fn get_or_fill_only_fills_on_miss() {
        let (_dir, cache) = cache();
        let bytes = cache.get_or_fill(5, || Ok(b"fresh".to_vec())).unwrap();
        assert_eq!(bytes, b"fresh");

        // Present now, so the closure must not run again.
        let bytes = cache
            .get_or_fill(5, || panic!("fill called on a cache hit"))
            .unwrap();
        assert_eq!(bytes, b"fresh");
    }

    #[test]
    fn get_or_fill_propagates_fill_errors() {
        let (_dir, cache) = cache();
        let err = cache
            .get_or_fill(5, || anyhow::bail!("rpc down"))
            .unwrap_err();
        assert!(err.to_string().contains("rpc down"));
        assert_eq!(cache.get(5), None);
    }

    #[test]
    fn checkpoint_is_monotone() {
        let (_dir, cache) = cache();
        assert_eq!(cache.checkpoint(), 0);

        cache.set_checkpoint(100).unwrap();
        assert_eq!(cache.checkpoint(), 100);

        // Lower values are ignored, not errors.
        cache.set_checkpoint(50).unwrap();
        assert_eq!(cache.checkpoint(), 100);

        cache.set_checkpoint(200).unwrap();
        assert_eq!(cache.checkpoint(), 200);
    }

    #[test]
    fn chains_do_not_share_entries() {
        let dir = tempfile::tempdir().unwrap();
        let a = BlockCache::new(dir.path(), 1).unwrap();
        let b = BlockCache::new(dir.path(), 2).unwrap();

        a.put(1, b"chain one").unwrap();
        assert_eq!(b.get(1), None);
    }
}
