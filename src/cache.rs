//! Persistent, content-addressed storage of per-item cache entries.
//!
//! Entries live at `<cacheDir>/<contentSignature>/<sanitizedKey>.json`. The
//! signature directory groups every item a node configuration produced; two
//! nodes with identical configs land in the same directory, which is what
//! makes cross-node reuse possible.
//!
//! Read failures of any kind are cache misses. Write failures abort the node.

use std::collections::BTreeMap;
use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CacheError;
use crate::hash::Hash32;
use crate::output::normalize_path;

/// Fingerprint of one upstream producer's output list, as recorded in a
/// cache entry. Comparing fingerprints detects "upstream changed" without
/// rehashing every upstream file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamSignature {
    /// Hex form of the output-list fingerprint.
    pub signature: String,
    /// The output name the fingerprint was computed under.
    pub output_key: String,
    /// The glob constraint, when the reference carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glob: Option<String>,
}

/// One persisted cache record covering a single processed item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// The input files this entry represents.
    pub item_files: Vec<Utf8PathBuf>,
    /// Content hash per input file at build time.
    pub input_hashes: BTreeMap<Utf8PathBuf, String>,
    /// Last-modified timestamp (ms since epoch) per input file at build time.
    pub input_timestamps: BTreeMap<Utf8PathBuf, i64>,
    /// Output name to the list of generated paths.
    pub outputs_by_key: BTreeMap<String, Vec<Utf8PathBuf>>,
    /// The base directory outputs were written under when this was built.
    pub output_base_dir: Utf8PathBuf,
    /// Files referenced from config, with their hashes.
    pub config_deps: BTreeMap<Utf8PathBuf, String>,
    /// Paths discovered at runtime (e.g. transitive imports), with hashes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovered_deps: Option<BTreeMap<Utf8PathBuf, String>>,
    /// Per-upstream-node fingerprints at build time.
    pub upstream_signatures: BTreeMap<String, UpstreamSignature>,
    /// The key this entry was stored under (before sanitization).
    pub cache_key: String,
    pub created_at_millis: i64,
}

/// The slice of pipeline state validation needs: the *current* fingerprint
/// of a producer's outputs under the recorded constraints.
pub trait UpstreamView {
    /// `None` when the producer has no outputs in the current snapshot.
    fn upstream_signature(&self, node: &str, output: &str, glob: Option<&str>) -> Option<Hash32>;
}

/// Handle to the on-disk cache. Owns everything under its root directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: Utf8PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn entry_path(&self, signature: &str, key: &str) -> Utf8PathBuf {
        self.root
            .join(sanitize_key(signature))
            .join(format!("{}.json", sanitize_key(key)))
    }

    /// Reads an entry. Absence, unreadable files and corrupt JSON all come
    /// back as `None`; a cache miss is never an error.
    pub fn get(&self, signature: &str, key: &str) -> Option<CacheEntry> {
        let path = self.entry_path(signature, key);

        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    debug!("Unreadable cache entry {path}: {err}");
                }
                return None;
            }
        };

        match serde_json::from_str(&text) {
            Ok(entry) => Some(entry),
            Err(err) => {
                debug!("Corrupt cache entry {path}: {err}");
                None
            }
        }
    }

    /// Writes an entry atomically: serialize to a sibling `.tmp` file, then
    /// rename into place.
    pub fn put(&self, signature: &str, key: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        let path = self.entry_path(signature, key);
        let dir = path.parent().expect("entry path always has a parent");
        fs::create_dir_all(dir)?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(entry)?)?;
        fs::rename(&tmp, &path)?;

        Ok(())
    }

    /// Assembles a fresh entry from the current filesystem state.
    ///
    /// Config and discovered deps that do not exist right now are skipped
    /// silently; the next validation will see them as missing and invalidate,
    /// which self-corrects once the file appears.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        &self,
        items: &[Utf8PathBuf],
        outputs_by_key: BTreeMap<String, Vec<Utf8PathBuf>>,
        output_base_dir: Utf8PathBuf,
        cache_key: &str,
        config_deps: &[Utf8PathBuf],
        discovered_deps: &[Utf8PathBuf],
        upstream_signatures: BTreeMap<String, UpstreamSignature>,
    ) -> Result<CacheEntry, CacheError> {
        let base = normalize_path(&output_base_dir);
        for paths in outputs_by_key.values() {
            for path in paths {
                if !normalize_path(path).starts_with(&base) {
                    return Err(CacheError::Escape {
                        path: path.clone(),
                        base: output_base_dir.clone(),
                    });
                }
            }
        }

        let mut input_hashes = BTreeMap::new();
        let mut input_timestamps = BTreeMap::new();
        for item in items {
            input_hashes.insert(item.clone(), Hash32::hash_file(item)?.to_hex());
            input_timestamps.insert(item.clone(), mtime_millis(item)?);
        }

        let discovered = hash_existing(discovered_deps);

        Ok(CacheEntry {
            item_files: items.to_vec(),
            input_hashes,
            input_timestamps,
            outputs_by_key,
            output_base_dir,
            config_deps: hash_existing(config_deps),
            discovered_deps: (!discovered.is_empty()).then_some(discovered),
            upstream_signatures,
            cache_key: cache_key.to_string(),
            created_at_millis: now_millis(),
        })
    }

    /// The two-tier validation. An entry is a hit iff every check passes:
    ///
    /// 1. every recorded output path is still readable,
    /// 2. every item file is fresh: matching mtime accepts outright, a
    ///    touched mtime falls through to a content-hash comparison,
    /// 3. every config dep rehashes to its recorded hash,
    /// 4. every discovered dep rehashes to its recorded hash,
    /// 5. every upstream fingerprint matches the producer's current outputs.
    pub fn validate(&self, entry: &CacheEntry, upstream: &dyn UpstreamView) -> bool {
        for paths in entry.outputs_by_key.values() {
            for path in paths {
                if fs::metadata(path).is_err() {
                    debug!("Cached output {path} is gone");
                    return false;
                }
            }
        }

        for item in &entry.item_files {
            if !self.item_fresh(entry, item) {
                return false;
            }
        }

        if !deps_fresh(&entry.config_deps) {
            return false;
        }
        if let Some(discovered) = &entry.discovered_deps {
            if !deps_fresh(discovered) {
                return false;
            }
        }

        for (node, recorded) in &entry.upstream_signatures {
            let current =
                upstream.upstream_signature(node, &recorded.output_key, recorded.glob.as_deref());
            match current {
                Some(hash) if hash.to_hex() == recorded.signature => {}
                _ => {
                    debug!("Upstream '{node}' drifted");
                    return false;
                }
            }
        }

        true
    }

    fn item_fresh(&self, entry: &CacheEntry, item: &Utf8Path) -> bool {
        let Some(recorded_mtime) = entry.input_timestamps.get(item) else {
            return false;
        };
        let Some(recorded_hash) = entry.input_hashes.get(item) else {
            return false;
        };

        // Fast path: an untouched mtime means the file is unchanged.
        match mtime_millis(item) {
            Ok(mtime) if mtime == *recorded_mtime => return true,
            Ok(_) => {}
            Err(_) => return false,
        }

        // Slow path: the mtime moved, so compare content. A matching hash
        // accepts without rewriting the stored mtime; the next run pays the
        // hash check again.
        match Hash32::hash_file(item) {
            Ok(hash) => hash.to_hex() == *recorded_hash,
            Err(_) => false,
        }
    }

    pub fn file_hash(&self, path: &Utf8Path) -> std::io::Result<Hash32> {
        Hash32::hash_file(path)
    }

    /// Materializes a cached artifact at the location the current consumer
    /// expects. Used for cross-node reuse; the copy belongs to the consumer.
    pub fn copy_to(&self, src: &Utf8Path, dst: &Utf8Path) -> std::io::Result<()> {
        if let Some(dir) = dst.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::copy(src, dst)?;
        Ok(())
    }

    /// Deletes entries under a signature directory whose key is no longer in
    /// use. Returns the number of removed entries.
    ///
    /// Not invoked by the execution envelope: with several live nodes
    /// sharing one signature directory, a node only knows its *own* keys and
    /// would tear out its siblings' entries.
    pub fn clean_except<S: AsRef<str>>(
        &self,
        signature: &str,
        current_keys: &[S],
    ) -> std::io::Result<usize> {
        let dir = self.root.join(sanitize_key(signature));
        let keep: Vec<String> = current_keys
            .iter()
            .map(|key| sanitize_key(key.as_ref()))
            .collect();

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };

        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let stem = path
                .file_stem()
                .map(|stem| stem.to_string_lossy())
                .unwrap_or_default();
            if !keep.iter().any(|key| *key == stem) {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }

        Ok(removed)
    }
}

fn hash_existing(paths: &[Utf8PathBuf]) -> BTreeMap<Utf8PathBuf, String> {
    let mut hashes = BTreeMap::new();
    for path in paths {
        if let Ok(hash) = Hash32::hash_file(path) {
            hashes.insert(path.clone(), hash.to_hex());
        }
    }
    hashes
}

fn deps_fresh(deps: &BTreeMap<Utf8PathBuf, String>) -> bool {
    deps.iter().all(|(path, recorded)| {
        match Hash32::hash_file(path) {
            Ok(hash) => hash.to_hex() == *recorded,
            Err(_) => {
                debug!("Dependency {path} is missing or unreadable");
                false
            }
        }
    })
}

pub(crate) fn mtime_millis(path: &Utf8Path) -> std::io::Result<i64> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0))
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Makes a cache key filesystem-safe: anything outside `[A-Za-z0-9._-]`
/// becomes `_`. No case folding.
pub fn sanitize_key(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}
