//! The per-run environment handed to every node, and the per-item execution
//! envelope that wraps a node's work with caching.
//!
//! The envelope is where the cache design comes together: content signatures
//! group entries, per-item keys address them, validation decides hits, and
//! cross-node reuse happens by copying a cached artifact to wherever the
//! current consumer expects it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use tracing::debug;

use crate::cache::{CacheEntry, CacheStore, UpstreamSignature, UpstreamView, sanitize_key};
use crate::config::HookRegistry;
use crate::error::{NodeError, ResolveError};
use crate::hash::Hash32;
use crate::input::{Input, SnapshotView};
use crate::node::{DEFAULT_OUTPUT, Node};
use crate::output::{NodeOutput, OutputConfig, clean_input_path, output_signature, rebase};
use crate::pool::{JobOutput, WorkerPool};

/// The environment threaded through every node's `run`.
///
/// A single `Context` is shared across all nodes of one pipeline invocation;
/// everything it hands out is either immutable or synchronized.
#[derive(Clone)]
pub struct Context {
    build_dir: Utf8PathBuf,
    work_dir: Utf8PathBuf,
    cache: CacheStore,
    pool: Arc<WorkerPool>,
    hooks: Arc<HookRegistry>,
    outputs: Arc<RwLock<HashMap<String, Vec<NodeOutput>>>>,
    locks: BuildLocks,
}

impl Context {
    pub(crate) fn new(
        build_dir: Utf8PathBuf,
        work_dir: Utf8PathBuf,
        cache: CacheStore,
        pool: Arc<WorkerPool>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        Self {
            build_dir,
            work_dir,
            cache,
            pool,
            hooks,
            outputs: Arc::new(RwLock::new(HashMap::new())),
            locks: BuildLocks::default(),
        }
    }

    pub fn build_dir(&self) -> &Utf8Path {
        &self.build_dir
    }

    pub fn work_dir(&self) -> &Utf8Path {
        &self.work_dir
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Operator-visible log line attributed to the running node.
    pub fn log(&self, message: impl AsRef<str>) {
        tracing::info!("{}", message.as_ref());
    }

    /// Turns an [`Input`] into concrete paths against the current snapshot.
    pub fn resolve_input(&self, input: &Input) -> Result<Vec<Utf8PathBuf>, ResolveError> {
        let outputs = self.outputs.read().unwrap();
        input.resolve_with(&SnapshotView {
            build_dir: &self.build_dir,
            work_dir: &self.work_dir,
            outputs: &outputs,
        })
    }

    /// The output records a node committed earlier in this run, if any.
    pub fn node_outputs_of(&self, name: &str) -> Option<Vec<NodeOutput>> {
        self.outputs.read().unwrap().get(name).cloned()
    }

    /// Default destination for an input processed by the named node:
    /// `<buildDir>/<node>/<cleaned input path>`, with an optional extension
    /// replacement.
    pub fn build_path_for(&self, node: &str, input: &Utf8Path, ext: Option<&str>) -> Utf8PathBuf {
        let mut config = OutputConfig::new();
        if let Some(ext) = ext {
            config = config.extension(ext);
        }
        config.shape(&self.build_dir, &self.work_dir, node, input)
    }

    /// Strips `buildDir/<node>/` from a path inside the build directory;
    /// otherwise makes the path relative to the working directory.
    pub fn strip_build_prefix(&self, path: &Utf8Path) -> Utf8PathBuf {
        clean_input_path(&self.build_dir, &self.work_dir, path)
    }

    /// Single-writer commit of a node's outputs into the shared snapshot.
    pub(crate) fn commit_outputs(&self, name: &str, records: Vec<NodeOutput>) {
        self.outputs
            .write()
            .unwrap()
            .insert(name.to_string(), records);
    }

    fn anchor(&self, path: &Utf8Path) -> Utf8PathBuf {
        if path.is_absolute() || self.work_dir == "." {
            path.to_owned()
        } else {
            self.work_dir.join(path)
        }
    }
}

impl UpstreamView for Context {
    fn upstream_signature(&self, node: &str, output: &str, glob: Option<&str>) -> Option<Hash32> {
        let outputs = self.outputs.read().unwrap();
        let records = outputs.get(node)?;
        if records.is_empty() {
            return None;
        }
        output_signature(records, output, glob).ok()
    }
}

/// Per-key build locks. Within one pipeline run, at most one task builds a
/// given `(contentSignature, cacheKey)` at a time; a second taker re-checks
/// the cache once it acquires the lock. Cross-process concurrency is not
/// defended against.
#[derive(Clone, Default)]
pub(crate) struct BuildLocks {
    map: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl BuildLocks {
    fn acquire(&self, key: &str) -> Arc<Mutex<()>> {
        self.map
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .clone()
    }
}

/// What one unit of work produced: emitted paths per output name, plus any
/// dependencies discovered while running.
#[derive(Debug, Default)]
pub struct WorkProduct {
    pub outputs: BTreeMap<String, Vec<Utf8PathBuf>>,
    pub discovered_deps: Vec<Utf8PathBuf>,
}

impl From<JobOutput> for WorkProduct {
    fn from(output: JobOutput) -> Self {
        Self {
            outputs: output.outputs,
            discovered_deps: output.discovered_deps,
        }
    }
}

/// The outcome for one item, in the order items were supplied.
#[derive(Debug)]
pub struct ItemResult {
    pub item: Utf8PathBuf,
    pub outputs: BTreeMap<String, Vec<Utf8PathBuf>>,
    /// Whether the outputs came from the cache.
    pub cached: bool,
}

impl ItemResult {
    /// The [`NodeOutput`] record for this item.
    pub fn to_node_output(&self) -> NodeOutput {
        self.outputs
            .iter()
            .map(|(key, paths)| (key.clone(), paths.clone()))
            .collect()
    }
}

type KeyFn<'a> = Box<dyn Fn(&Utf8Path) -> String + Send + Sync + 'a>;
type PathForFn<'a> = Box<dyn Fn(&Utf8Path, &str) -> Option<Utf8PathBuf> + Send + Sync + 'a>;

/// Wraps a node's per-item work with content-signature computation, cache
/// lookup, output-path recalculation, parallel dispatch of misses, and cache
/// storage.
///
/// The procedure, per [`run`](Envelope::run):
/// 1. compute the node's content signature and collect its config
///    dependencies and upstream fingerprints,
/// 2. validate each item against the cache sequentially; hits have their
///    cached artifacts copied to wherever this node expects them,
/// 3. run the misses in parallel,
/// 4. build and write cache entries for fresh work, again in parallel, only
///    after every miss has completed,
/// 5. emit results in the original item order.
pub struct Envelope<'a> {
    ctx: &'a Context,
    node: &'a dyn Node,
    key_of: KeyFn<'a>,
    path_for: PathForFn<'a>,
}

impl<'a> Envelope<'a> {
    pub fn new(ctx: &'a Context, node: &'a dyn Node) -> Self {
        let default_key = move |item: &Utf8Path| default_cache_key(ctx, item);

        let output_config = node.output_config();
        let name = node.name();
        let default_path = move |item: &Utf8Path, output: &str| {
            if output != DEFAULT_OUTPUT {
                return None;
            }
            let shaped = match output_config {
                Some(config) => config.shape(&ctx.build_dir, &ctx.work_dir, name, item),
                None => ctx.build_path_for(name, item, None),
            };
            Some(shaped)
        };

        Self {
            ctx,
            node,
            key_of: Box::new(default_key),
            path_for: Box::new(default_path),
        }
    }

    /// Overrides how an item maps to its cache key.
    pub fn keyed_by<F>(mut self, key_of: F) -> Self
    where
        F: Fn(&Utf8Path) -> String + Send + Sync + 'a,
    {
        self.key_of = Box::new(key_of);
        self
    }

    /// Overrides how `(item, output name)` maps to a deterministic output
    /// path. Returning `None` marks the output as secondary: cached paths
    /// are then replayed by rebasing their position under the entry's base
    /// directory onto the current one.
    pub fn outputs_at<F>(mut self, path_for: F) -> Self
    where
        F: Fn(&Utf8Path, &str) -> Option<Utf8PathBuf> + Send + Sync + 'a,
    {
        self.path_for = Box::new(path_for);
        self
    }

    pub fn run<W>(self, items: &[Utf8PathBuf], work: W) -> Result<Vec<ItemResult>, NodeError>
    where
        W: Fn(&Utf8Path) -> anyhow::Result<WorkProduct> + Send + Sync,
    {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let ctx = self.ctx;
        let node = self.node;
        let signature = node.config().signature(node.type_tag());

        let deps = self.collect_config_deps(items)?;
        let base_dir = match node.output_config() {
            Some(config) => config.base_dir(&ctx.build_dir, node.name()),
            None => ctx.build_dir.join(node.name()),
        };

        let keys: Vec<String> = items.iter().map(|item| (self.key_of)(item)).collect();

        // Sequential validation pass. Misses are collected for the parallel
        // phase; hits are materialized right away.
        let mut results: Vec<Option<ItemResult>> = Vec::with_capacity(items.len());
        results.resize_with(items.len(), || None);
        let mut misses: Vec<usize> = Vec::new();

        for (index, item) in items.iter().enumerate() {
            match self.try_hit(&signature, &keys[index], item, &base_dir)? {
                Some(outputs) => {
                    results[index] = Some(ItemResult {
                        item: item.clone(),
                        outputs,
                        cached: true,
                    });
                }
                None => misses.push(index),
            }
        }

        debug!(
            "Node '{}': {} hits, {} misses",
            node.name(),
            items.len() - misses.len(),
            misses.len(),
        );

        // Parallel work pass. A per-key lock keeps concurrent same-signature
        // nodes from building the same entry twice at once; whoever waits
        // re-checks the cache before doing the work.
        let fresh: Vec<(usize, Miss)> = misses
            .par_iter()
            .map(|&index| -> Result<(usize, Miss), NodeError> {
                let item = &items[index];
                let key = &keys[index];

                let lock = ctx.locks.acquire(&format!("{signature}/{key}"));
                let _guard = lock.lock().unwrap();

                if let Some(outputs) = self.try_hit(&signature, key, item, &base_dir)? {
                    return Ok((index, Miss::LateHit(outputs)));
                }

                let product = work(item).map_err(|source| NodeError::Work {
                    item: item.clone(),
                    source,
                })?;

                Ok((index, Miss::Built(product)))
            })
            .collect::<Result<_, _>>()?;

        // Entries are written only now, after every miss completed; an
        // aborted node leaves no partial batch behind.
        fresh
            .par_iter()
            .try_for_each(|(index, miss)| -> Result<(), NodeError> {
                let Miss::Built(product) = miss else {
                    return Ok(());
                };

                let item = &items[*index];
                let entry = ctx.cache.build(
                    std::slice::from_ref(item),
                    product.outputs.clone(),
                    base_dir.clone(),
                    &keys[*index],
                    &deps.config_deps,
                    &product.discovered_deps,
                    deps.upstream_signatures.clone(),
                )?;
                ctx.cache.put(&signature, &keys[*index], &entry)?;

                Ok(())
            })?;

        for (index, miss) in fresh {
            let outputs = match miss {
                Miss::LateHit(outputs) => {
                    return_cached(&mut results, index, &items[index], outputs);
                    continue;
                }
                Miss::Built(product) => product.outputs,
            };

            results[index] = Some(ItemResult {
                item: items[index].clone(),
                outputs,
                cached: false,
            });
        }

        Ok(results
            .into_iter()
            .map(|result| result.expect("every item has an outcome"))
            .collect())
    }

    /// Walks the config and gathers what cache entries must capture beyond
    /// the items themselves: file-ref paths, the resolved paths of upstream
    /// references, and one fingerprint per upstream producer.
    ///
    /// Resolved upstream paths that are this node's own items are excluded;
    /// the per-item hashes already cover them, and keeping them here would
    /// invalidate every sibling entry whenever a single item changes.
    fn collect_config_deps(&self, items: &[Utf8PathBuf]) -> Result<CollectedDeps, NodeError> {
        let ctx = self.ctx;
        let config = self.node.config();

        let item_set: HashSet<&Utf8Path> = items.iter().map(Utf8PathBuf::as_path).collect();

        let mut config_deps: Vec<Utf8PathBuf> = config
            .file_refs()
            .into_iter()
            .map(|path| ctx.anchor(path))
            .collect();

        let mut upstream_signatures = BTreeMap::new();

        let outputs = ctx.outputs.read().unwrap();
        let view = SnapshotView {
            build_dir: &ctx.build_dir,
            work_dir: &ctx.work_dir,
            outputs: &outputs,
        };

        for (producer, output, filter) in config.node_refs() {
            let paths = view.producer_paths(producer, output, filter)?;
            config_deps.extend(
                paths
                    .into_iter()
                    .filter(|path| !item_set.contains(path.as_path())),
            );

            let records = outputs
                .get(producer)
                .expect("producer_paths already checked presence");
            let signature =
                output_signature(records, output, filter).map_err(ResolveError::Pattern)?;

            upstream_signatures.insert(
                producer.to_string(),
                UpstreamSignature {
                    signature: signature.to_hex(),
                    output_key: output.to_string(),
                    glob: filter.map(str::to_string),
                },
            );
        }

        Ok(CollectedDeps {
            config_deps,
            upstream_signatures,
        })
    }

    /// Checks one item against the cache. `Ok(Some(outputs))` is a hit with
    /// the outputs already materialized at their recalculated locations.
    fn try_hit(
        &self,
        signature: &str,
        key: &str,
        item: &Utf8Path,
        base_dir: &Utf8Path,
    ) -> Result<Option<BTreeMap<String, Vec<Utf8PathBuf>>>, NodeError> {
        let ctx = self.ctx;

        let Some(entry) = ctx.cache.get(signature, key) else {
            return Ok(None);
        };

        let (expected, copies) = self.recalculate_outputs(&entry, item, base_dir)?;

        if !ctx.cache.validate(&entry, ctx) {
            return Ok(None);
        }

        for (cached, target) in copies {
            ctx.cache.copy_to(&cached, &target)?;
        }

        Ok(Some(expected))
    }

    /// Recomputes where this node expects the entry's outputs to live.
    ///
    /// Deterministic outputs come from the `path_for` callback. Secondary
    /// outputs (callback returned `None`, or several paths share one name)
    /// replay each cached path's position under the entry's recorded base
    /// onto the current one; a replay that would need `..` is fatal.
    fn recalculate_outputs(
        &self,
        entry: &CacheEntry,
        item: &Utf8Path,
        base_dir: &Utf8Path,
    ) -> Result<Recalculated, NodeError> {
        let mut expected = BTreeMap::new();
        let mut copies = Vec::new();

        for (name, cached_paths) in &entry.outputs_by_key {
            let replayed: Vec<Utf8PathBuf>;

            if cached_paths.len() == 1 {
                match (self.path_for)(item, name) {
                    Some(path) => replayed = vec![path],
                    None => replayed = self.replay(cached_paths, &entry.output_base_dir, base_dir)?,
                }
            } else {
                replayed = self.replay(cached_paths, &entry.output_base_dir, base_dir)?;
            }

            for (cached, target) in cached_paths.iter().zip(&replayed) {
                if cached != target {
                    copies.push((cached.clone(), target.clone()));
                }
            }

            expected.insert(name.clone(), replayed);
        }

        Ok((expected, copies))
    }

    fn replay(
        &self,
        cached_paths: &[Utf8PathBuf],
        old_base: &Utf8Path,
        new_base: &Utf8Path,
    ) -> Result<Vec<Utf8PathBuf>, NodeError> {
        cached_paths
            .iter()
            .map(|cached| {
                rebase(cached, old_base, new_base).ok_or_else(|| NodeError::Rebase {
                    path: cached.clone(),
                    base: new_base.to_owned(),
                })
            })
            .collect()
    }
}

type Recalculated = (
    BTreeMap<String, Vec<Utf8PathBuf>>,
    Vec<(Utf8PathBuf, Utf8PathBuf)>,
);

enum Miss {
    /// A concurrent task built this entry while we waited for its lock.
    LateHit(BTreeMap<String, Vec<Utf8PathBuf>>),
    Built(WorkProduct),
}

struct CollectedDeps {
    config_deps: Vec<Utf8PathBuf>,
    upstream_signatures: BTreeMap<String, UpstreamSignature>,
}

fn return_cached(
    results: &mut [Option<ItemResult>],
    index: usize,
    item: &Utf8Path,
    outputs: BTreeMap<String, Vec<Utf8PathBuf>>,
) {
    results[index] = Some(ItemResult {
        item: item.to_owned(),
        outputs,
        cached: true,
    });
}

/// The default per-item cache key: the sanitized cleaned path, plus a short
/// hash of the full path so two inputs that sanitize alike cannot collide.
fn default_cache_key(ctx: &Context, item: &Utf8Path) -> String {
    let cleaned = clean_input_path(&ctx.build_dir, &ctx.work_dir, item);
    format!(
        "{}-{}",
        sanitize_key(cleaned.as_str()),
        Hash32::hash(item.as_str().as_bytes()).to_hex_short()
    )
}
