//! Reference node implementations.
//!
//! These are deliberately small: they show how a node is supposed to plug
//! into the orchestrator — resolve inputs, run the per-item envelope,
//! delegate expensive work to the pool — without pulling heavyweight
//! engines into the crate.

mod composite;
mod copy;
mod transform;
mod workload;

use std::sync::Arc;

pub use composite::CompositeNode;
pub use copy::CopyNode;
pub use transform::TransformNode;
pub use workload::{TEXT_TRANSFORM, TextTransform};

use crate::config::HookRegistry;
use crate::pool::WorkloadRegistry;

pub(crate) fn register_builtin_workloads(registry: &WorkloadRegistry, hooks: Arc<HookRegistry>) {
    registry.register(TEXT_TRANSFORM, TextTransform::new(hooks));
}
