//! File fingerprints and the sync decision.
//!
//! A fingerprint is a `(key, token)` pair. Client and target compute theirs
//! independently; a key whose tokens differ (or that the target lacks) must be
//! sent. Only fingerprints cross the wire for the comparison.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// File key to freshness token.
pub type FingerprintMap = BTreeMap<String, String>;

/// How local files are turned into fingerprints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintOptions {
    /// Replace paths by their SHA-256 so the target never learns file names.
    pub hash_filenames: bool,
    /// Replace modification times by their SHA-256.
    pub hash_times: bool,
}

/// Outcome of comparing a local tree with the tree a target holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPlan {
    /// Keys the target is missing or holds a stale token for.
    pub transfer: BTreeSet<String>,
    /// Keys the target holds that no longer exist locally.
    pub delete: BTreeSet<String>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.transfer.is_empty() && self.delete.is_empty()
    }
}

/// Compare `local` against `held`.
pub fn diff(local: &FingerprintMap, held: &FingerprintMap) -> SyncPlan {
    let transfer = local
        .iter()
        .filter(|(key, token)| held.get(*key) != Some(*token))
        .map(|(key, _)| key.clone())
        .collect();

    let delete = held
        .keys()
        .filter(|key| !local.contains_key(*key))
        .cloned()
        .collect();

    SyncPlan { transfer, delete }
}

/// Fingerprint one tracked file from its path and modification time.
pub fn file_fingerprint(
    path: &Path,
    modified: SystemTime,
    options: FingerprintOptions,
) -> (String, String) {
    let path = path.to_string_lossy().replace('\\', "/");
    let key = if options.hash_filenames {
        sha256_hex(path.as_bytes())
    } else {
        path
    };

    let nanos = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
        .to_string();
    let token = if options.hash_times {
        sha256_hex(nanos.as_bytes())
    } else {
        nanos
    };

    (key, token)
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn map(pairs: &[(&str, &str)]) -> FingerprintMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn transfer_and_delete_sets() {
        let local = map(&[("a", "1"), ("b", "2")]);
        let held = map(&[("a", "1"), ("c", "3")]);
        let plan = diff(&local, &held);
        assert_eq!(plan.transfer, BTreeSet::from(["b".to_string()]));
        assert_eq!(plan.delete, BTreeSet::from(["c".to_string()]));
    }

    #[test]
    fn changed_token_is_transferred() {
        let plan = diff(&map(&[("a", "2")]), &map(&[("a", "1")]));
        assert!(plan.transfer.contains("a"));
        assert!(plan.delete.is_empty());
    }

    #[test]
    fn identical_trees_need_nothing() {
        let tree = map(&[("a", "1"), ("b", "2")]);
        assert!(diff(&tree, &tree).is_empty());
    }

    #[test]
    fn hashed_fingerprints_hide_names_and_times() {
        let when = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let plain = file_fingerprint(Path::new("docs/a.txt"), when, FingerprintOptions::default());
        assert_eq!(plain.0, "docs/a.txt");
        assert_eq!(plain.1, "1700000000000000000");

        let hashed = file_fingerprint(
            Path::new("docs/a.txt"),
            when,
            FingerprintOptions {
                hash_filenames: true,
                hash_times: true,
            },
        );
        assert_eq!(hashed.0, sha256_hex(b"docs/a.txt"));
        assert_eq!(hashed.1.len(), 64);
        assert_ne!(hashed.1, plain.1);
    }
}
