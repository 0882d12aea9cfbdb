use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors raised while assembling or executing the pipeline DAG.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("A node named '{0}' has already been added to the pipeline")]
    DuplicateNode(String),

    #[error("Node '{consumer}' references unknown node '{producer}'")]
    UnknownNode { consumer: String, producer: String },

    #[error("Node '{consumer}' references output '{output}' which node '{producer}' never emits")]
    UnknownOutput {
        consumer: String,
        producer: String,
        output: String,
    },

    #[error("Cycle detected in the pipeline graph, involving node '{0}'")]
    Cycle(String),

    #[error("Node '{name}':\n{source}")]
    Node {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to create directory '{path}'")]
    CreateDir {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while turning an [`Input`](crate::Input) into paths.
///
/// Every variant is fatal at the consuming node.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Couldn't compile glob pattern.\n{0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Couldn't run glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("Glob '{0}' matched no files")]
    EmptyGlob(String),

    #[error("Node '{0}' has not run yet (or emitted nothing)")]
    ProducerNotRun(String),

    #[error("Node '{node}' emitted no output under '{output}'")]
    MissingOutput { node: String, output: String },

    #[error("Filter '{filter}' over output '{output}' of node '{node}' matched nothing")]
    EmptyFilter {
        node: String,
        output: String,
        filter: String,
    },
}

/// Write-side cache failures. Read failures are treated as misses and never
/// surface through this type.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Couldn't write cache entry.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't serialize cache entry.\n{0}")]
    Json(#[from] serde_json::Error),

    #[error("Output path '{path}' escapes its base directory '{base}'")]
    Escape { path: Utf8PathBuf, base: Utf8PathBuf },
}

/// Errors raised by the per-item execution envelope.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Cached output '{path}' cannot be rebased under '{base}'")]
    Rebase { path: Utf8PathBuf, base: Utf8PathBuf },

    #[error("Couldn't materialize cached output.\n{0}")]
    Materialize(#[from] std::io::Error),

    #[error("Item '{item}':\n{source}")]
    Work {
        item: Utf8PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

/// Errors surfaced by the worker pool to a job's caller.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Worker pool has been terminated")]
    Terminated,

    #[error("Worker died before reporting a result")]
    WorkerLost,

    #[error("Unknown workload '{0}'")]
    UnknownWorkload(String),

    #[error(transparent)]
    Workload(#[from] anyhow::Error),
}
