use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};

use crate::config::{Config, ConfigValue};
use crate::input::Input;
use crate::node::Node;
use crate::nodes::workload::TEXT_TRANSFORM;
use crate::output::{NodeOutput, OutputConfig};
use crate::pool::JobSpec;
use crate::runtime::{Context, Envelope, ItemResult};

/// Per-item text transformation delegated to the worker pool.
///
/// The transformation itself is addressed by hook id, so it participates in
/// the content signature as plain data; two transform nodes with the same
/// hook and parameters share cache entries.
pub struct TransformNode {
    name: String,
    config: Config,
    output_config: Option<OutputConfig>,
    explicit: Vec<String>,
}

impl TransformNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Config::new(),
            output_config: None,
            explicit: Vec::new(),
        }
    }

    /// Where the items come from. Stored inside the config under
    /// `sourceFiles`, so the item source is part of the signature.
    pub fn source(mut self, input: Input) -> Self {
        self.config.insert("sourceFiles", input.to_config());
        self
    }

    /// The named transformation to apply, looked up in the pipeline's hook
    /// registry at execution time.
    pub fn hook(mut self, id: impl Into<String>) -> Self {
        self.config.insert("hook", ConfigValue::Hook(id.into()));
        self
    }

    /// An arbitrary signature-relevant parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.config.insert(key, value);
        self
    }

    pub fn shaped(mut self, output_config: OutputConfig) -> Self {
        self.output_config = Some(output_config);
        self
    }

    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.explicit.push(name.into());
        self
    }

    fn dest_for(&self, ctx: &Context, item: &Utf8Path) -> Utf8PathBuf {
        match &self.output_config {
            Some(config) => config.shape(ctx.build_dir(), ctx.work_dir(), &self.name, item),
            None => ctx.build_path_for(&self.name, item, None),
        }
    }
}

impl Node for TransformNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_tag(&self) -> &'static str {
        "transform"
    }

    fn config(&self) -> &Config {
        &self.config
    }

    fn output_config(&self) -> Option<&OutputConfig> {
        self.output_config.as_ref()
    }

    fn explicit_dependencies(&self) -> Vec<String> {
        self.explicit.clone()
    }

    fn output_names(&self) -> Vec<String> {
        vec![crate::node::DEFAULT_OUTPUT.to_string()]
    }

    fn run(&self, ctx: &Context) -> anyhow::Result<Vec<NodeOutput>> {
        let source = self
            .config
            .get("sourceFiles")
            .context("transform node has no sourceFiles")?;
        let input = Input::from_config(source).context("sourceFiles is not an input")?;
        let items = ctx.resolve_input(&input)?;

        let results = Envelope::new(ctx, self).run(&items, |item| {
            let mut spec = JobSpec::new(TEXT_TRANSFORM, item).dest(self.dest_for(ctx, item));

            if let Some(ConfigValue::Hook(id)) = self.config.get("hook") {
                spec = spec.param("hook", id);
            }
            if let Some(prefix) = self.config.get("prefix").and_then(ConfigValue::as_str) {
                spec = spec.param("prefix", prefix);
            }

            let output = ctx.worker_pool().execute(spec).wait()?;
            Ok(output.into())
        })?;

        Ok(results.iter().map(ItemResult::to_node_output).collect())
    }
}
