#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod cache;
mod config;
mod error;
mod hash;
mod input;
mod node;
pub mod nodes;
mod output;
mod pipeline;
mod pool;
mod runtime;
mod utils;

pub use crate::cache::{CacheEntry, CacheStore, UpstreamSignature, UpstreamView, sanitize_key};
pub use crate::config::{Config, ConfigValue, HookRegistry};
pub use crate::error::{CacheError, NodeError, PipelineError, PoolError, ResolveError};
pub use crate::hash::Hash32;
pub use crate::input::Input;
pub use crate::node::{DEFAULT_OUTPUT, Node};
pub use crate::output::{NodeOutput, OutputConfig, OutputFilename, output_signature};
pub use crate::pipeline::{Pipeline, PipelineConfig, RunReport, Strategy};
pub use crate::pool::{JobHandle, JobOutput, JobSpec, WorkerPool, Workload, WorkloadRegistry};
pub use crate::runtime::{Context, Envelope, ItemResult, WorkProduct};
pub use crate::utils::init_logging;
