use falcon_common::types::Timestamp;
use parking_lot::RwLock;
use std::sync::Arc;

/// A single committed version in a key's version chain.
#[derive(Debug)]
pub struct Version {
    pub commit_ts: Timestamp,
    /// The value (None = tombstone / deleted).
    pub data: Option<Vec<u8>>,
    /// Link to the previous (older) version (RwLock for safe GC truncation).
    prev: RwLock<Option<Arc<Version>>>,
}

impl Version {
    #[inline]
    pub fn get_prev(&self) -> Option<Arc<Version>> {
        self.prev.read().clone()
    }

    /// Drop all older versions. Used by GC.
    #[inline]
    pub fn truncate_prev(&self) {
        *self.prev.write() = None;
    }
}

/// Result of garbage collecting a single version chain.
#[derive(Debug, Clone, Default)]
pub struct GcChainResult {
    pub reclaimed_versions: u64,
    pub reclaimed_bytes: u64,
}

/// A version chain for a single key. Head is the newest version.
///
/// Transactions buffer their writes and only install versions at commit, so
/// the chain never holds uncommitted data; versions are prepended in commit
/// timestamp order under the store's commit lock.
#[derive(Debug, Default)]
pub struct VersionChain {
    head: RwLock<Option<Arc<Version>>>,
}

impl VersionChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a committed version.
    pub fn prepend(&self, commit_ts: Timestamp, data: Option<Vec<u8>>) {
        let mut head = self.head.write();
        let prev = head.take();
        *head = Some(Arc::new(Version {
            commit_ts,
            data,
            prev: RwLock::new(prev),
        }));
    }

    /// Latest version with `commit_ts <= read_ts`. `None` if the key did not
    /// exist or was deleted as of `read_ts`.
    pub fn read_at(&self, read_ts: Timestamp) -> Option<Vec<u8>> {
        let mut current = self.head.read().clone();
        while let Some(ver) = current {
            if ver.commit_ts <= read_ts {
                return ver.data.clone();
            }
            current = ver.get_prev();
        }
        None
    }

    /// Commit timestamp of the newest version, if any.
    pub fn latest_commit_ts(&self) -> Option<Timestamp> {
        self.head.read().as_ref().map(|v| v.commit_ts)
    }

    /// Whether a version newer than `after_ts` exists. Used for write-write
    /// conflict detection at commit.
    pub fn has_committed_write_after(&self, after_ts: Timestamp) -> bool {
        self.latest_commit_ts().is_some_and(|ts| ts > after_ts)
    }

    /// Garbage collect versions older than the given watermark.
    /// Keeps the one version visible at the watermark.
    pub fn gc(&self, watermark: Timestamp) -> GcChainResult {
        let head = self.head.write();
        let mut result = GcChainResult::default();
        let mut current = head.clone();
        while let Some(ver) = current {
            if ver.commit_ts <= watermark {
                let mut old = ver.get_prev();
                while let Some(v) = old {
                    result.reclaimed_versions += 1;
                    result.reclaimed_bytes += Self::estimate_version_bytes(&v);
                    old = v.get_prev();
                }
                ver.truncate_prev();
                break;
            }
            current = ver.get_prev();
        }
        result
    }

    /// Whether the whole chain is a single tombstone at or below `watermark`,
    /// i.e. the key can be removed from the index.
    pub fn is_dead_at(&self, watermark: Timestamp) -> bool {
        match self.head.read().as_ref() {
            Some(ver) => ver.data.is_none() && ver.commit_ts <= watermark && ver.get_prev().is_none(),
            None => true,
        }
    }

    pub fn estimate_version_bytes(ver: &Version) -> u64 {
        let header = std::mem::size_of::<Version>() as u64;
        header + ver.data.as_ref().map_or(0, |d| d.len() as u64)
    }

    /// Count the number of versions in this chain (for observability).
    pub fn version_chain_len(&self) -> usize {
        let mut count = 0usize;
        let mut current = self.head.read().clone();
        while let Some(ver) = current {
            count += 1;
            current = ver.get_prev();
        }
        count
    }
}
