//! The pipeline: DAG ownership, dependency derivation, scheduling.
//!
//! Edges are derived from the node-output references inside each node's
//! config plus any explicit dependencies, then checked for cycles before
//! anything executes. Three strategies are available; `Dynamic` starts every
//! node the moment its dependencies finish and is the default.

use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use crossbeam_channel::{RecvTimeoutError, Sender, bounded, unbounded};
use indicatif::{MultiProgress, ProgressBar};
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{Graph, NodeIndex};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use tracing::{error, info};

use crate::cache::CacheStore;
use crate::config::HookRegistry;
use crate::error::PipelineError;
use crate::node::Node;
use crate::output::NodeOutput;
use crate::pool::{WorkerPool, WorkloadRegistry};
use crate::runtime::Context;
use crate::utils;

const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(5);

/// How node-level execution is ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Topological order, one node at a time.
    Sequential,
    /// Nodes grouped by depth; each wave runs concurrently, waves run in
    /// ascending order.
    Waves,
    /// Every node starts the moment its dependencies complete. At least as
    /// parallel as `Waves`, usually more.
    #[default]
    Dynamic,
}

/// Builder for a [`Pipeline`].
pub struct PipelineConfig {
    build_dir: Utf8PathBuf,
    cache_dir: Utf8PathBuf,
    work_dir: Utf8PathBuf,
    strategy: Strategy,
    workers: Option<usize>,
    hooks: Arc<HookRegistry>,
    workloads: Arc<WorkloadRegistry>,
}

impl PipelineConfig {
    fn new() -> Self {
        Self {
            build_dir: "build".into(),
            cache_dir: ".cache".into(),
            work_dir: ".".into(),
            strategy: Strategy::default(),
            workers: None,
            hooks: Arc::new(HookRegistry::new()),
            workloads: Arc::new(WorkloadRegistry::new()),
        }
    }

    /// Staging area for intermediate artifacts. Default `build`.
    pub fn build_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.build_dir = dir.into();
        self
    }

    /// Persistent cache root. Default `.cache`.
    pub fn cache_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Directory inputs are resolved against. Default `.`.
    pub fn work_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Worker pool size. Defaults to the available parallelism.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Registers a named pure transformation usable from config.
    pub fn hook<F>(self, id: impl Into<String>, hook: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.hooks.register(id, hook);
        self
    }

    /// Registers a workload for the worker pool.
    pub fn workload(
        self,
        name: impl Into<String>,
        workload: impl crate::pool::Workload + 'static,
    ) -> Self {
        self.workloads.register(name, workload);
        self
    }

    pub fn finish(self) -> Pipeline {
        crate::nodes::register_builtin_workloads(&self.workloads, self.hooks.clone());

        let workers = self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        });

        Pipeline {
            nodes: Vec::new(),
            index_of: HashMap::new(),
            build_dir: self.build_dir,
            cache_dir: self.cache_dir,
            work_dir: self.work_dir,
            strategy: self.strategy,
            pool: Arc::new(WorkerPool::new(workers, self.workloads)),
            hooks: self.hooks,
        }
    }
}

/// Summary of one pipeline invocation.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Per-node elapsed times, in completion order.
    pub node_times: Vec<(String, Duration)>,
    /// Every node's committed outputs.
    pub outputs: HashMap<String, Vec<NodeOutput>>,
}

impl RunReport {
    pub fn elapsed_of(&self, node: &str) -> Option<Duration> {
        self.node_times
            .iter()
            .find(|(name, _)| name == node)
            .map(|(_, elapsed)| *elapsed)
    }
}

/// Owns the node set, the worker pool and the cache; builds the DAG and runs
/// it. Created through [`Pipeline::config`].
pub struct Pipeline {
    nodes: Vec<Arc<dyn Node>>,
    index_of: HashMap<String, usize>,
    build_dir: Utf8PathBuf,
    cache_dir: Utf8PathBuf,
    work_dir: Utf8PathBuf,
    strategy: Strategy,
    pool: Arc<WorkerPool>,
    hooks: Arc<HookRegistry>,
}

impl Pipeline {
    pub fn config() -> PipelineConfig {
        PipelineConfig::new()
    }

    pub fn build_dir(&self) -> &Utf8Path {
        &self.build_dir
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|node| node.name())
    }

    /// Adds a node, firing its `on_added_to_pipeline` hook first. The hook
    /// may add further nodes; children injected this way land before their
    /// parent.
    pub fn add<N: Node + 'static>(&mut self, node: N) -> Result<(), PipelineError> {
        self.add_boxed(Box::new(node))
    }

    pub fn add_boxed(&mut self, mut node: Box<dyn Node>) -> Result<(), PipelineError> {
        let name = node.name().to_string();
        if self.index_of.contains_key(&name) {
            return Err(PipelineError::DuplicateNode(name));
        }

        node.on_added_to_pipeline(self)
            .map_err(|source| PipelineError::Node {
                name: name.clone(),
                source,
            })?;

        // The hook may have added children; re-check uniqueness.
        if self.index_of.contains_key(&name) {
            return Err(PipelineError::DuplicateNode(name));
        }

        self.index_of.insert(name, self.nodes.len());
        self.nodes.push(Arc::from(node));
        Ok(())
    }

    /// Runs every node once, in dependency order.
    ///
    /// Configuration problems (unknown references, cycles) abort before any
    /// node executes. A node failure stops further scheduling; nodes already
    /// running finish, and the first captured error is returned.
    pub fn run(&mut self) -> Result<RunReport, PipelineError> {
        utils::init_logging();

        let graph = self.derive_graph()?;
        let order = toposort(&graph, None)
            .map_err(|cycle| PipelineError::Cycle(self.nodes[graph[cycle.node_id()]].name().to_string()))?;

        for dir in [&self.build_dir, &self.cache_dir] {
            std::fs::create_dir_all(dir).map_err(|source| PipelineError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }

        let ctx = Context::new(
            self.build_dir.clone(),
            self.work_dir.clone(),
            CacheStore::new(self.cache_dir.clone()),
            self.pool.clone(),
            self.hooks.clone(),
        );

        let active: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let (stop_supervisor, supervisor) = spawn_supervisor(active.clone(), self.pool.clone());

        let elapsed = Mutex::new(Vec::new());
        let started = Instant::now();

        let result = match self.strategy {
            Strategy::Sequential => self.run_sequential(&graph, &order, &ctx, &active, &elapsed),
            Strategy::Waves => self.run_waves(&graph, &order, &ctx, &active, &elapsed),
            Strategy::Dynamic => self.run_dynamic(&graph, &ctx, &active, &elapsed),
        };

        drop(stop_supervisor);
        let _ = supervisor.join();

        result?;
        info!("Pipeline finished {}", utils::as_overhead(started));

        Ok(RunReport {
            node_times: elapsed.into_inner().unwrap(),
            outputs: self
                .nodes
                .iter()
                .filter_map(|node| {
                    ctx.node_outputs_of(node.name())
                        .map(|records| (node.name().to_string(), records))
                })
                .collect(),
        })
    }

    /// Builds the DAG: one vertex per node, one edge `producer -> consumer`
    /// for every reference in config and every explicit dependency.
    fn derive_graph(&self) -> Result<Graph<usize, ()>, PipelineError> {
        let mut graph = Graph::new();
        let indices: Vec<NodeIndex> = (0..self.nodes.len())
            .map(|slot| graph.add_node(slot))
            .collect();

        for (slot, node) in self.nodes.iter().enumerate() {
            let consumer = node.name();

            for (producer, output, _) in node.config().node_refs() {
                let Some(&producer_slot) = self.index_of.get(producer) else {
                    return Err(PipelineError::UnknownNode {
                        consumer: consumer.to_string(),
                        producer: producer.to_string(),
                    });
                };

                let declared = self.nodes[producer_slot].output_names();
                if !declared.is_empty() && !declared.iter().any(|name| name == output) {
                    return Err(PipelineError::UnknownOutput {
                        consumer: consumer.to_string(),
                        producer: producer.to_string(),
                        output: output.to_string(),
                    });
                }

                graph.update_edge(indices[producer_slot], indices[slot], ());
            }

            for dependency in node.explicit_dependencies() {
                let Some(&dependency_slot) = self.index_of.get(&dependency) else {
                    return Err(PipelineError::UnknownNode {
                        consumer: consumer.to_string(),
                        producer: dependency,
                    });
                };
                graph.update_edge(indices[dependency_slot], indices[slot], ());
            }
        }

        Ok(graph)
    }

    fn run_sequential(
        &self,
        graph: &Graph<usize, ()>,
        order: &[NodeIndex],
        ctx: &Context,
        active: &Mutex<HashSet<String>>,
        elapsed: &Mutex<Vec<(String, Duration)>>,
    ) -> Result<(), PipelineError> {
        for &index in order {
            run_node(&self.nodes[graph[index]], ctx, active, elapsed)?;
        }
        Ok(())
    }

    /// Wave-parallel: depth is `1 + max(depth of deps)`, leaves are 0; all
    /// nodes of one depth run concurrently, depths run in ascending order.
    fn run_waves(
        &self,
        graph: &Graph<usize, ()>,
        order: &[NodeIndex],
        ctx: &Context,
        active: &Mutex<HashSet<String>>,
        elapsed: &Mutex<Vec<(String, Duration)>>,
    ) -> Result<(), PipelineError> {
        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        for &index in order {
            let level = graph
                .neighbors_directed(index, Direction::Incoming)
                .map(|dep| depth[&dep] + 1)
                .max()
                .unwrap_or(0);
            depth.insert(index, level);
        }

        let mut waves: Vec<Vec<NodeIndex>> = Vec::new();
        for &index in order {
            let level = depth[&index];
            if waves.len() <= level {
                waves.resize_with(level + 1, Vec::new);
            }
            waves[level].push(index);
        }

        for wave in waves {
            wave.par_iter()
                .map(|&index| run_node(&self.nodes[graph[index]], ctx, active, elapsed))
                .collect::<Vec<_>>()
                .into_iter()
                .collect::<Result<(), _>>()?;
        }

        Ok(())
    }

    /// Dynamic-ready scheduling: dependency counts per node, a result
    /// channel back to the coordinator, and a spawn for every node whose
    /// count drops to zero. Once an error is captured no new node starts;
    /// in-flight nodes drain.
    fn run_dynamic(
        &self,
        graph: &Graph<usize, ()>,
        ctx: &Context,
        active: &Mutex<HashSet<String>>,
        elapsed: &Mutex<Vec<(String, Duration)>>,
    ) -> Result<(), PipelineError> {
        let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
        for edge in graph.raw_edges() {
            dependents
                .entry(edge.source())
                .or_default()
                .push(edge.target());
        }

        let mut dependency_counts: HashMap<NodeIndex, usize> = graph
            .node_indices()
            .map(|index| {
                (
                    index,
                    graph
                        .neighbors_directed(index, Direction::Incoming)
                        .count(),
                )
            })
            .collect();

        let total = graph.node_count() as u64;
        if total == 0 {
            return Ok(());
        }

        let progress = MultiProgress::new();
        let main_bar = progress.add(ProgressBar::new(total));
        main_bar.set_style(utils::PROGRESS_STYLE.clone());
        main_bar.set_message("Running nodes...");

        let (result_tx, result_rx) = unbounded::<(NodeIndex, Result<(), PipelineError>)>();

        let mut first_error = None;

        rayon::scope(|scope| {
            let spawn_node = |index: NodeIndex| {
                let node = self.nodes[graph[index]].clone();
                let sender = result_tx.clone();
                let progress = progress.clone();

                scope.spawn(move |_| {
                    let spinner = progress.add(ProgressBar::new_spinner());
                    spinner.set_style(utils::SPINNER_STYLE.clone());
                    spinner.set_message(node.name().to_string());
                    spinner.enable_steady_tick(Duration::from_millis(100));

                    let result = catch_unwind(AssertUnwindSafe(|| {
                        run_node(&node, ctx, active, elapsed)
                    }))
                    .unwrap_or_else(|_| {
                        Err(PipelineError::Node {
                            name: node.name().to_string(),
                            source: anyhow::anyhow!("node panicked"),
                        })
                    });

                    spinner.finish_and_clear();
                    let _ = sender.send((index, result));
                });
            };

            let mut started = 0u64;
            let mut finished = 0u64;

            for index in graph.node_indices() {
                if dependency_counts[&index] == 0 {
                    spawn_node(index);
                    started += 1;
                }
            }

            while finished < started {
                let (completed, result) = result_rx.recv().expect("result channel open");
                finished += 1;
                main_bar.inc(1);

                if let Err(err) = result {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                    continue;
                }

                // An error already captured: let in-flight nodes drain, but
                // start nothing new.
                if first_error.is_some() {
                    continue;
                }

                if let Some(waiting) = dependents.get(&completed) {
                    for &index in waiting {
                        let count = dependency_counts
                            .get_mut(&index)
                            .expect("every node has a count");
                        *count -= 1;
                        if *count == 0 {
                            spawn_node(index);
                            started += 1;
                        }
                    }
                }
            }
        });

        main_bar.finish_and_clear();

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn run_node(
    node: &Arc<dyn Node>,
    ctx: &Context,
    active: &Mutex<HashSet<String>>,
    elapsed: &Mutex<Vec<(String, Duration)>>,
) -> Result<(), PipelineError> {
    let name = node.name().to_string();
    info!("Starting node '{name}'");
    active.lock().unwrap().insert(name.clone());

    let start = Instant::now();
    let result = node.run(ctx);
    let took = start.elapsed();

    active.lock().unwrap().remove(&name);

    match result {
        Ok(records) => {
            ctx.commit_outputs(&name, records);
            elapsed.lock().unwrap().push((name.clone(), took));
            info!("Finished node '{name}' {}", utils::as_overhead(start));
            Ok(())
        }
        Err(source) => {
            error!("Node '{name}' failed: {source:#}");
            Err(PipelineError::Node { name, source })
        }
    }
}

/// Periodic visibility while nodes run: every few seconds, log which nodes
/// are active and what the worker pool is doing. Pure logging; stops when
/// the returned sender drops.
fn spawn_supervisor(
    active: Arc<Mutex<HashSet<String>>>,
    pool: Arc<WorkerPool>,
) -> (Sender<()>, std::thread::JoinHandle<()>) {
    let (tx, rx) = bounded::<()>(0);

    let handle = std::thread::spawn(move || {
        loop {
            match rx.recv_timeout(SUPERVISOR_INTERVAL) {
                Err(RecvTimeoutError::Timeout) => {
                    let names = {
                        let running = active.lock().unwrap();
                        if running.is_empty() {
                            continue;
                        }
                        utils::format_active(&running)
                    };

                    let jobs = pool.active_jobs();
                    if jobs.is_empty() {
                        info!("Still running: {names}");
                    } else {
                        let jobs: Vec<String> = jobs
                            .into_iter()
                            .map(|(worker, label)| format!("#{worker} {label}"))
                            .collect();
                        info!("Still running: {names}; workers: {}", jobs.join(", "));
                    }
                }
                _ => break,
            }
        }
    });

    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ConfigValue};

    struct Stub {
        name: String,
        config: Config,
        deps: Vec<String>,
        outputs: Vec<String>,
    }

    impl Stub {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                config: Config::new(),
                deps: Vec::new(),
                outputs: Vec::new(),
            }
        }

        fn consuming(mut self, producer: &str) -> Self {
            self.config
                .insert("src", ConfigValue::from_node(producer, "out"));
            self
        }

        fn depending_on(mut self, name: &str) -> Self {
            self.deps.push(name.to_string());
            self
        }

        fn declaring(mut self, output: &str) -> Self {
            self.outputs.push(output.to_string());
            self
        }
    }

    impl Node for Stub {
        fn name(&self) -> &str {
            &self.name
        }

        fn type_tag(&self) -> &'static str {
            "stub"
        }

        fn config(&self) -> &Config {
            &self.config
        }

        fn explicit_dependencies(&self) -> Vec<String> {
            self.deps.clone()
        }

        fn output_names(&self) -> Vec<String> {
            self.outputs.clone()
        }

        fn run(&self, _: &Context) -> anyhow::Result<Vec<NodeOutput>> {
            Ok(vec![])
        }
    }

    fn pipeline_in(root: &Utf8Path) -> Pipeline {
        Pipeline::config()
            .build_dir(root.join("build"))
            .cache_dir(root.join(".cache"))
            .work_dir(root.to_owned())
            .workers(2)
            .finish()
    }

    #[test]
    fn test_cycle_is_fatal_before_execution() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let mut pipeline = pipeline_in(root);

        pipeline.add(Stub::new("a").consuming("b")).unwrap();
        pipeline.add(Stub::new("b").consuming("a")).unwrap();

        let result = pipeline.run();
        assert!(matches!(result, Err(PipelineError::Cycle(_))));
        // Nothing executed: the build dir was never populated.
        assert!(!root.join("build").exists());
    }

    #[test]
    fn test_unknown_reference_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let mut pipeline = pipeline_in(root);

        pipeline.add(Stub::new("a").consuming("ghost")).unwrap();

        assert!(matches!(
            pipeline.run(),
            Err(PipelineError::UnknownNode { .. })
        ));
    }

    #[test]
    fn test_declared_output_names_are_checked() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let mut pipeline = pipeline_in(root);

        pipeline.add(Stub::new("a").declaring("pages")).unwrap();
        pipeline.add(Stub::new("b").consuming("a")).unwrap();

        assert!(matches!(
            pipeline.run(),
            Err(PipelineError::UnknownOutput { .. })
        ));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let mut pipeline = pipeline_in(root);

        pipeline.add(Stub::new("a")).unwrap();
        assert!(matches!(
            pipeline.add(Stub::new("a")),
            Err(PipelineError::DuplicateNode(_))
        ));
    }

    #[test]
    fn test_explicit_dependency_orders_execution() {
        struct Recorder {
            name: String,
            config: Config,
            deps: Vec<String>,
            log: Arc<Mutex<Vec<String>>>,
        }

        impl Node for Recorder {
            fn name(&self) -> &str {
                &self.name
            }

            fn type_tag(&self) -> &'static str {
                "recorder"
            }

            fn config(&self) -> &Config {
                &self.config
            }

            fn explicit_dependencies(&self) -> Vec<String> {
                self.deps.clone()
            }

            fn run(&self, _: &Context) -> anyhow::Result<Vec<NodeOutput>> {
                self.log.lock().unwrap().push(self.name.clone());
                Ok(vec![])
            }
        }

        for strategy in [Strategy::Sequential, Strategy::Waves, Strategy::Dynamic] {
            let dir = tempfile::tempdir().unwrap();
            let root = Utf8Path::from_path(dir.path()).unwrap();
            let log = Arc::new(Mutex::new(Vec::new()));

            let mut pipeline = Pipeline::config()
                .build_dir(root.join("build"))
                .cache_dir(root.join(".cache"))
                .work_dir(root.to_owned())
                .strategy(strategy)
                .workers(2)
                .finish();

            for (name, deps) in [("c", vec!["b"]), ("b", vec!["a"]), ("a", vec![])] {
                pipeline
                    .add(Recorder {
                        name: name.to_string(),
                        config: Config::new(),
                        deps: deps.into_iter().map(str::to_string).collect(),
                        log: log.clone(),
                    })
                    .unwrap();
            }

            let report = pipeline.run().unwrap();
            assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"], "{strategy:?}");
            assert_eq!(report.node_times.len(), 3);
        }
    }

    #[test]
    fn test_first_error_is_reported() {
        struct Failing {
            config: Config,
        }

        impl Node for Failing {
            fn name(&self) -> &str {
                "broken"
            }

            fn type_tag(&self) -> &'static str {
                "failing"
            }

            fn config(&self) -> &Config {
                &self.config
            }

            fn run(&self, _: &Context) -> anyhow::Result<Vec<NodeOutput>> {
                anyhow::bail!("deliberate failure")
            }
        }

        for strategy in [Strategy::Sequential, Strategy::Waves, Strategy::Dynamic] {
            let dir = tempfile::tempdir().unwrap();
            let root = Utf8Path::from_path(dir.path()).unwrap();

            let mut pipeline = Pipeline::config()
                .build_dir(root.join("build"))
                .cache_dir(root.join(".cache"))
                .work_dir(root.to_owned())
                .strategy(strategy)
                .workers(2)
                .finish();

            pipeline.add(Failing { config: Config::new() }).unwrap();
            pipeline.add(Stub::new("downstream").depending_on("broken")).unwrap();

            match pipeline.run() {
                Err(PipelineError::Node { name, source }) => {
                    assert_eq!(name, "broken");
                    assert!(source.to_string().contains("deliberate failure"));
                }
                other => panic!("expected node error, got {other:?}"),
            }
        }
    }
}
