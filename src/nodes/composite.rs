use anyhow::Context as _;
use camino::Utf8PathBuf;

use crate::config::{Config, ConfigValue};
use crate::node::Node;
use crate::output::NodeOutput;
use crate::pipeline::Pipeline;
use crate::runtime::Context;

/// Fan-out at construction time.
///
/// When added to a pipeline, the composite injects its children as ordinary
/// nodes and declares explicit dependencies on them; the scheduler therefore
/// runs the children first, and no special engine support is needed. Its own
/// `run` is a trivial collector that re-keys each child's outputs under the
/// child's name.
pub struct CompositeNode {
    name: String,
    config: Config,
    children: Vec<Box<dyn Node>>,
    child_names: Vec<String>,
}

impl CompositeNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Config::new(),
            children: Vec::new(),
            child_names: Vec::new(),
        }
    }

    pub fn child(mut self, node: impl Node + 'static) -> Self {
        self.children.push(Box::new(node));
        self
    }
}

impl Node for CompositeNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_tag(&self) -> &'static str {
        "composite"
    }

    fn config(&self) -> &Config {
        &self.config
    }

    fn explicit_dependencies(&self) -> Vec<String> {
        self.child_names.clone()
    }

    fn output_names(&self) -> Vec<String> {
        self.child_names.clone()
    }

    fn on_added_to_pipeline(&mut self, pipeline: &mut Pipeline) -> anyhow::Result<()> {
        for child in self.children.drain(..) {
            self.child_names.push(child.name().to_string());
            pipeline.add_boxed(child)?;
        }

        // Child names become part of the config so the composite's identity
        // follows its membership.
        self.config.insert(
            "children",
            ConfigValue::Array(
                self.child_names
                    .iter()
                    .map(|name| ConfigValue::from(name.as_str()))
                    .collect(),
            ),
        );

        Ok(())
    }

    fn run(&self, ctx: &Context) -> anyhow::Result<Vec<NodeOutput>> {
        let mut records = Vec::with_capacity(self.child_names.len());

        for child in &self.child_names {
            let outputs = ctx
                .node_outputs_of(child)
                .with_context(|| format!("child '{child}' has not run"))?;

            let mut paths: Vec<Utf8PathBuf> = Vec::new();
            for record in &outputs {
                for (_, list) in record.iter() {
                    paths.extend(list.iter().cloned());
                }
            }

            let mut record = NodeOutput::new();
            record.insert(child.clone(), paths);
            records.push(record);
        }

        Ok(records)
    }
}
