use std::fs;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};

use crate::config::Config;
use crate::input::Input;
use crate::node::{DEFAULT_OUTPUT, Node};
use crate::output::{NodeOutput, OutputConfig};
use crate::runtime::{Context, Envelope, ItemResult, WorkProduct};

/// Copies each resolved input into this node's output directory.
///
/// Copying is cheap, so the work happens inline rather than on the pool;
/// the envelope still caches per item, which matters when the inputs are
/// expensive upstream outputs being fanned out to several places.
pub struct CopyNode {
    name: String,
    config: Config,
    output_config: Option<OutputConfig>,
}

impl CopyNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: Config::new(),
            output_config: None,
        }
    }

    pub fn source(mut self, input: Input) -> Self {
        self.config.insert("sourceFiles", input.to_config());
        self
    }

    pub fn shaped(mut self, output_config: OutputConfig) -> Self {
        self.output_config = Some(output_config);
        self
    }

    fn dest_for(&self, ctx: &Context, item: &Utf8Path) -> Utf8PathBuf {
        match &self.output_config {
            Some(config) => config.shape(ctx.build_dir(), ctx.work_dir(), &self.name, item),
            None => ctx.build_path_for(&self.name, item, None),
        }
    }
}

impl Node for CopyNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_tag(&self) -> &'static str {
        "copy"
    }

    fn config(&self) -> &Config {
        &self.config
    }

    fn output_config(&self) -> Option<&OutputConfig> {
        self.output_config.as_ref()
    }

    fn output_names(&self) -> Vec<String> {
        vec![DEFAULT_OUTPUT.to_string()]
    }

    fn run(&self, ctx: &Context) -> anyhow::Result<Vec<NodeOutput>> {
        let source = self
            .config
            .get("sourceFiles")
            .context("copy node has no sourceFiles")?;
        let input = Input::from_config(source).context("sourceFiles is not an input")?;
        let items = ctx.resolve_input(&input)?;

        let results = Envelope::new(ctx, self).run(&items, |item| {
            let dest = self.dest_for(ctx, item);
            if let Some(dir) = dest.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::copy(item, &dest)?;

            let mut product = WorkProduct::default();
            product.outputs.insert(DEFAULT_OUTPUT.to_string(), vec![dest]);
            Ok(product)
        })?;

        Ok(results.iter().map(ItemResult::to_node_output).collect())
    }
}
