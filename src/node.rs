//! The contract between a processing node and the orchestrator.

use crate::config::Config;
use crate::output::{NodeOutput, OutputConfig};
use crate::pipeline::Pipeline;
use crate::runtime::Context;

/// The default output name nodes emit under when they only have one.
pub const DEFAULT_OUTPUT: &str = "out";

/// One vertex of the pipeline DAG.
///
/// A node processes zero or more items and emits one or more named outputs.
/// The orchestrator derives scheduling edges from the node-output references
/// inside [`config`](Node::config) and from
/// [`explicit_dependencies`](Node::explicit_dependencies); it never inspects
/// what `run` actually does.
///
/// `run` is called exactly once per pipeline invocation, after every
/// dependency has committed its outputs to the pipeline snapshot.
pub trait Node: Send + Sync {
    /// Unique within a pipeline. Used as the cache-directory segment and as
    /// the node's subdirectory under the build directory.
    fn name(&self) -> &str;

    /// Tag prefixed to the content signature. Nodes of the same type with
    /// identical configs share cache entries, whatever their names.
    fn type_tag(&self) -> &'static str;

    /// The processing parameters. Everything here contributes to the content
    /// signature.
    fn config(&self) -> &Config;

    /// Destination-shaping parameters, excluded from the content signature.
    fn output_config(&self) -> Option<&OutputConfig> {
        None
    }

    /// Dependencies beyond the ones implied by config references.
    fn explicit_dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// The output names this node emits, when they are known up front.
    /// An empty list means "dynamic": references to this node are then only
    /// checked at resolution time.
    fn output_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// One-shot hook fired while the node is being added, before the
    /// pipeline takes ownership. Composite nodes inject their children here.
    fn on_added_to_pipeline(&mut self, pipeline: &mut Pipeline) -> anyhow::Result<()> {
        let _ = pipeline;
        Ok(())
    }

    /// Processes the node's items, one [`NodeOutput`] record per item.
    fn run(&self, ctx: &Context) -> anyhow::Result<Vec<NodeOutput>>;
}
