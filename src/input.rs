//! Polymorphic input descriptors.
//!
//! An [`Input`] describes where a node's items come from without touching the
//! filesystem until resolution time. Resolution is pure: given the same
//! filesystem state and the same pipeline output snapshot, it always yields
//! the same list of paths, and it never mutates anything.

use std::collections::{HashMap, HashSet};

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::ConfigValue;
use crate::error::ResolveError;
use crate::output::NodeOutput;

pub(crate) const GLOB_OPTS: glob::MatchOptions = glob::MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: true,
};

/// A descriptor resolving to a list of filesystem paths.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// A glob pattern, expanded on demand. Empty expansion is an error.
    Glob(String),
    /// An ordered list of descriptors, resolved recursively and
    /// concatenated. Duplicates are preserved.
    List(Vec<Input>),
    /// The paths another node previously emitted under one output name,
    /// optionally intersected with a glob expansion.
    NodeRef {
        node: String,
        output: String,
        filter: Option<String>,
    },
    /// A literal path, never globbed. Declares a direct file dependency for
    /// cache invalidation.
    FileRef(Utf8PathBuf),
}

impl Input {
    pub fn glob(pattern: impl Into<String>) -> Self {
        Input::Glob(pattern.into())
    }

    pub fn list(inputs: impl IntoIterator<Item = Input>) -> Self {
        Input::List(inputs.into_iter().collect())
    }

    pub fn from_node(node: impl Into<String>, output: impl Into<String>) -> Self {
        Input::NodeRef {
            node: node.into(),
            output: output.into(),
            filter: None,
        }
    }

    pub fn from_node_filtered(
        node: impl Into<String>,
        output: impl Into<String>,
        filter: impl Into<String>,
    ) -> Self {
        Input::NodeRef {
            node: node.into(),
            output: output.into(),
            filter: Some(filter.into()),
        }
    }

    pub fn file(path: impl Into<Utf8PathBuf>) -> Self {
        Input::FileRef(path.into())
    }

    /// Reads an input back out of a config value. Plain strings are glob
    /// patterns; arrays are lists; the reference variants map one to one.
    pub fn from_config(value: &ConfigValue) -> Option<Input> {
        match value {
            ConfigValue::String(pattern) => Some(Input::Glob(pattern.clone())),
            ConfigValue::Array(items) => items
                .iter()
                .map(Input::from_config)
                .collect::<Option<Vec<_>>>()
                .map(Input::List),
            ConfigValue::NodeRef {
                node,
                output,
                filter,
            } => Some(Input::NodeRef {
                node: node.clone(),
                output: output.clone(),
                filter: filter.clone(),
            }),
            ConfigValue::FileRef(path) => Some(Input::FileRef(path.clone())),
            _ => None,
        }
    }

    /// The config form of this input, suitable for content signatures.
    pub fn to_config(&self) -> ConfigValue {
        match self {
            Input::Glob(pattern) => ConfigValue::String(pattern.clone()),
            Input::List(items) => ConfigValue::Array(items.iter().map(Input::to_config).collect()),
            Input::NodeRef {
                node,
                output,
                filter,
            } => ConfigValue::NodeRef {
                node: node.clone(),
                output: output.clone(),
                filter: filter.clone(),
            },
            Input::FileRef(path) => ConfigValue::FileRef(path.clone()),
        }
    }

    pub(crate) fn resolve_with(&self, view: &SnapshotView) -> Result<Vec<Utf8PathBuf>, ResolveError> {
        match self {
            Input::Glob(pattern) => {
                let paths = expand_glob(view.work_dir, pattern)?;
                if paths.is_empty() {
                    return Err(ResolveError::EmptyGlob(pattern.clone()));
                }
                Ok(paths)
            }

            Input::List(items) => {
                let mut paths = Vec::new();
                for item in items {
                    paths.extend(item.resolve_with(view)?);
                }
                Ok(paths)
            }

            Input::FileRef(path) => Ok(vec![view.anchor(path)]),

            Input::NodeRef {
                node,
                output,
                filter,
            } => view.producer_paths(node, output, filter.as_deref()),
        }
    }
}

/// A read-only view over the pipeline state that resolution needs: the build
/// and working directories plus the per-node output snapshot.
pub(crate) struct SnapshotView<'a> {
    pub build_dir: &'a Utf8Path,
    pub work_dir: &'a Utf8Path,
    pub outputs: &'a HashMap<String, Vec<NodeOutput>>,
}

impl SnapshotView<'_> {
    /// Anchors a relative path at the working directory.
    fn anchor(&self, path: &Utf8Path) -> Utf8PathBuf {
        if path.is_absolute() || self.work_dir == "." {
            path.to_owned()
        } else {
            self.work_dir.join(path)
        }
    }

    /// Flattens the producer's named output, optionally filtered by a glob
    /// expansion. This is shared by input resolution and by the envelope's
    /// upstream-dependency collection so both see identical path lists.
    pub(crate) fn producer_paths(
        &self,
        node: &str,
        output: &str,
        filter: Option<&str>,
    ) -> Result<Vec<Utf8PathBuf>, ResolveError> {
        let records = match self.outputs.get(node) {
            Some(records) if !records.is_empty() => records,
            _ => return Err(ResolveError::ProducerNotRun(node.to_string())),
        };

        let flattened = NodeOutput::flatten(records, output);
        if flattened.is_empty() {
            return Err(ResolveError::MissingOutput {
                node: node.to_string(),
                output: output.to_string(),
            });
        }

        let Some(filter) = filter else {
            return Ok(flattened.into_iter().map(Utf8Path::to_path_buf).collect());
        };

        // When the producer wrote into the build directory, the candidate
        // pattern spans every node subdirectory; otherwise the filter is an
        // ordinary pattern anchored at the working directory.
        let under_build = flattened
            .first()
            .is_some_and(|path| path.starts_with(self.build_dir));
        let candidate = if under_build {
            format!("{}/*/{}", self.build_dir, filter)
        } else {
            filter.to_string()
        };

        let matched: HashSet<Utf8PathBuf> = if under_build {
            expand_glob(Utf8Path::new("."), &candidate)?
        } else {
            expand_glob(self.work_dir, &candidate)?
        }
        .into_iter()
        .collect();

        let filtered: Vec<Utf8PathBuf> = flattened
            .into_iter()
            .filter(|path| matched.contains(*path))
            .map(Utf8Path::to_path_buf)
            .collect();

        if filtered.is_empty() {
            return Err(ResolveError::EmptyFilter {
                node: node.to_string(),
                output: output.to_string(),
                filter: filter.to_string(),
            });
        }

        Ok(filtered)
    }
}

/// Expands a glob pattern anchored at `root`. Results come back in the
/// alphabetical order the `glob` crate guarantees.
fn expand_glob(root: &Utf8Path, pattern: &str) -> Result<Vec<Utf8PathBuf>, ResolveError> {
    let anchored = if root == "." || Utf8Path::new(pattern).is_absolute() {
        pattern.to_string()
    } else {
        root.join(pattern).to_string()
    };

    let mut paths = Vec::new();
    for entry in glob::glob_with(&anchored, GLOB_OPTS)? {
        paths.push(Utf8PathBuf::try_from(entry?)?);
    }

    Ok(paths)
}
