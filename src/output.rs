//! Node outputs and output-path shaping.
//!
//! This module contains [`NodeOutput`], the record a node emits for every
//! processed item, and [`OutputConfig`], the destination-shaping options.
//! Shaping parameters are deliberately excluded from content signatures so
//! that two nodes computing the same thing into different places can share
//! cache entries.

use std::collections::BTreeMap;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

use crate::hash::Hash32;

/// A mapping from output name to an ordered list of emitted paths.
///
/// A node may emit several records (typically one per processed item);
/// downstream consumers flatten them per output name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutput {
    map: BTreeMap<String, Vec<Utf8PathBuf>>,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// A record with a single path under one output name.
    pub fn single(key: impl Into<String>, path: impl Into<Utf8PathBuf>) -> Self {
        let mut output = Self::new();
        output.insert(key, vec![path.into()]);
        output
    }

    pub fn insert(&mut self, key: impl Into<String>, paths: Vec<Utf8PathBuf>) {
        self.map.insert(key.into(), paths);
    }

    pub fn get(&self, key: &str) -> Option<&[Utf8PathBuf]> {
        self.map.get(key).map(Vec::as_slice)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Utf8PathBuf])> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Flattens the named output across records, preserving emission order.
    pub fn flatten<'a>(records: &'a [NodeOutput], key: &str) -> Vec<&'a Utf8Path> {
        records
            .iter()
            .filter_map(|record| record.map.get(key))
            .flatten()
            .map(Utf8PathBuf::as_path)
            .collect()
    }
}

impl FromIterator<(String, Vec<Utf8PathBuf>)> for NodeOutput {
    fn from_iter<T: IntoIterator<Item = (String, Vec<Utf8PathBuf>)>>(iter: T) -> Self {
        NodeOutput {
            map: iter.into_iter().collect(),
        }
    }
}

/// A stable fingerprint of a producer's emitted path list under one output
/// name, optionally constrained by a glob.
///
/// The fingerprint covers the *ordered list of paths*, not their contents.
/// Content-level drift in the producer's inputs shows up transitively: the
/// producer re-emits different content-addressed paths, or its own item
/// hashes change and it re-runs.
pub fn output_signature(
    records: &[NodeOutput],
    key: &str,
    filter: Option<&str>,
) -> Result<Hash32, glob::PatternError> {
    let pattern = filter.map(glob::Pattern::new).transpose()?;

    let mut acc = String::new();
    for path in NodeOutput::flatten(records, key) {
        if let Some(pattern) = &pattern {
            if !pattern.matches(path.as_str()) {
                continue;
            }
        }
        acc.push_str(path.as_str());
        acc.push('\n');
    }

    Ok(Hash32::hash(acc.as_bytes()))
}

type PathMapFn = Box<dyn Fn(&Utf8Path) -> Utf8PathBuf + Send + Sync>;
type FilenameFn = Box<dyn Fn(&Utf8Path) -> String + Send + Sync>;

/// Overrides the final filename outright.
pub enum OutputFilename {
    Fixed(String),
    Func(FilenameFn),
}

impl OutputFilename {
    fn apply(&self, input: &Utf8Path) -> String {
        match self {
            OutputFilename::Fixed(name) => name.clone(),
            OutputFilename::Func(func) => func(input),
        }
    }
}

/// Destination-shaping options, applied in a fixed order.
///
/// Structural manipulations (`flatten_to_basename`, `strip_path_prefix`,
/// `path_mapping`) are mutually exclusive; the first matching one wins.
/// Filename transforms are mutually exclusive as well, with
/// `output_filename` taking precedence over `extension` + `filename_suffix`.
///
/// Closures are permitted here because none of these options participate in
/// the content signature.
#[derive(Default)]
pub struct OutputConfig {
    /// Base directory override; default is `<buildDir>/<nodeName>`.
    pub output_dir: Option<Utf8PathBuf>,
    /// Use only the file's basename, discarding subdirectories.
    pub flatten_to_basename: bool,
    /// Remove this prefix (path-segment-wise) from the cleaned input path.
    pub strip_path_prefix: Option<Utf8PathBuf>,
    /// Map the cleaned input path to a new relative path.
    pub path_mapping: Option<PathMapFn>,
    /// Override the final filename outright.
    pub output_filename: Option<OutputFilename>,
    /// Replace the final extension.
    pub extension: Option<String>,
    /// Insert a suffix before the extension.
    pub filename_suffix: Option<String>,
}

impl OutputConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn flatten_to_basename(mut self) -> Self {
        self.flatten_to_basename = true;
        self
    }

    pub fn strip_path_prefix(mut self, prefix: impl Into<Utf8PathBuf>) -> Self {
        self.strip_path_prefix = Some(prefix.into());
        self
    }

    pub fn path_mapping<F>(mut self, func: F) -> Self
    where
        F: Fn(&Utf8Path) -> Utf8PathBuf + Send + Sync + 'static,
    {
        self.path_mapping = Some(Box::new(func));
        self
    }

    pub fn output_filename(mut self, name: impl Into<String>) -> Self {
        self.output_filename = Some(OutputFilename::Fixed(name.into()));
        self
    }

    pub fn output_filename_fn<F>(mut self, func: F) -> Self
    where
        F: Fn(&Utf8Path) -> String + Send + Sync + 'static,
    {
        self.output_filename = Some(OutputFilename::Func(Box::new(func)));
        self
    }

    pub fn extension(mut self, ext: impl Into<String>) -> Self {
        self.extension = Some(ext.into());
        self
    }

    pub fn filename_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.filename_suffix = Some(suffix.into());
        self
    }

    /// The base directory all shaped paths land under.
    pub fn base_dir(&self, build_dir: &Utf8Path, node: &str) -> Utf8PathBuf {
        match &self.output_dir {
            Some(dir) => dir.clone(),
            None => build_dir.join(node),
        }
    }

    /// Computes the destination path for one input.
    pub fn shape(
        &self,
        build_dir: &Utf8Path,
        work_dir: &Utf8Path,
        node: &str,
        input: &Utf8Path,
    ) -> Utf8PathBuf {
        let cleaned = clean_input_path(build_dir, work_dir, input);

        let relative = if self.flatten_to_basename {
            Utf8PathBuf::from(cleaned.file_name().unwrap_or(cleaned.as_str()))
        } else if let Some(stripped) = self
            .strip_path_prefix
            .as_deref()
            .and_then(|prefix| cleaned.strip_prefix(prefix).ok())
        {
            stripped.to_path_buf()
        } else if let Some(mapping) = &self.path_mapping {
            mapping(&cleaned)
        } else {
            cleaned
        };

        let mut path = self.base_dir(build_dir, node).join(relative);

        if let Some(filename) = &self.output_filename {
            path.set_file_name(filename.apply(input));
        } else {
            if let Some(ext) = &self.extension {
                path.set_extension(ext);
            }
            if let Some(suffix) = &self.filename_suffix {
                let stem = path.file_stem().unwrap_or_default().to_string();
                let name = match path.extension() {
                    Some(ext) => format!("{stem}{suffix}.{ext}"),
                    None => format!("{stem}{suffix}"),
                };
                path.set_file_name(name);
            }
        }

        path
    }
}

impl std::fmt::Debug for OutputConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputConfig")
            .field("output_dir", &self.output_dir)
            .field("flatten_to_basename", &self.flatten_to_basename)
            .field("strip_path_prefix", &self.strip_path_prefix)
            .field("path_mapping", &self.path_mapping.as_ref().map(|_| "fn"))
            .field("extension", &self.extension)
            .field("filename_suffix", &self.filename_suffix)
            .finish()
    }
}

/// The "cleaned" form of an input path: stripped of `buildDir/<node>/` if it
/// lies inside the build directory, otherwise made relative to the working
/// directory. Absolute paths that fall under neither are demoted to their
/// root-relative form so they can be re-rooted under a base directory.
pub(crate) fn clean_input_path(
    build_dir: &Utf8Path,
    work_dir: &Utf8Path,
    path: &Utf8Path,
) -> Utf8PathBuf {
    let path = normalize_path(path);

    if let Ok(inside) = path.strip_prefix(build_dir) {
        // Drop the producing node's directory segment as well.
        let mut components = inside.components();
        components.next();
        let rest = components.as_path();
        if !rest.as_str().is_empty() {
            return rest.to_path_buf();
        }
        return inside.to_path_buf();
    }

    if let Ok(relative) = path.strip_prefix(work_dir) {
        return relative.to_path_buf();
    }

    path.components()
        .filter(|c| matches!(c, Utf8Component::Normal(_)))
        .collect()
}

/// Re-anchors `path` from `old_base` onto `new_base`.
///
/// Returns `None` when the relative position would require a `..` segment,
/// which callers treat as a fatal escape.
pub(crate) fn rebase(
    path: &Utf8Path,
    old_base: &Utf8Path,
    new_base: &Utf8Path,
) -> Option<Utf8PathBuf> {
    let relative = normalize_path(path)
        .strip_prefix(normalize_path(old_base))
        .ok()?
        .to_path_buf();

    if relative
        .components()
        .any(|c| !matches!(c, Utf8Component::Normal(_)))
    {
        return None;
    }

    Some(new_base.join(relative))
}

/// Normalize a path, removing things like `.` and `..`.
///
/// CAUTION: This does not resolve symlinks (unlike [`std::fs::canonicalize`]).
pub(crate) fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut components = path.components().peekable();
    let mut ret = if let Some(c @ Utf8Component::Prefix(..)) = components.peek().cloned() {
        components.next();
        Utf8PathBuf::from(c.as_str())
    } else {
        Utf8PathBuf::new()
    };

    for component in components {
        match component {
            Utf8Component::Prefix(..) => unreachable!(),
            Utf8Component::RootDir => {
                ret.push(Utf8Component::RootDir);
            }
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if ret.ends_with(Utf8Component::ParentDir) {
                    ret.push(Utf8Component::ParentDir);
                } else {
                    let popped = ret.pop();
                    if !popped && !ret.has_root() {
                        ret.push(Utf8Component::ParentDir);
                    }
                }
            }
            Utf8Component::Normal(c) => {
                ret.push(c);
            }
        }
    }
    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_preserves_order() {
        let records = vec![
            NodeOutput::single("out", "build/a/one.txt"),
            NodeOutput::single("other", "build/a/skip.txt"),
            NodeOutput::single("out", "build/a/two.txt"),
        ];

        let flat = NodeOutput::flatten(&records, "out");
        assert_eq!(flat, vec!["build/a/one.txt", "build/a/two.txt"]);
    }

    #[test]
    fn test_output_signature_stable_and_order_sensitive() {
        let a = vec![
            NodeOutput::single("out", "x/one.txt"),
            NodeOutput::single("out", "x/two.txt"),
        ];
        let b = vec![
            NodeOutput::single("out", "x/two.txt"),
            NodeOutput::single("out", "x/one.txt"),
        ];

        assert_eq!(
            output_signature(&a, "out", None).unwrap(),
            output_signature(&a, "out", None).unwrap()
        );
        assert_ne!(
            output_signature(&a, "out", None).unwrap(),
            output_signature(&b, "out", None).unwrap()
        );
    }

    #[test]
    fn test_output_signature_filter() {
        let a = vec![
            NodeOutput::single("out", "x/page.html"),
            NodeOutput::single("out", "x/style.css"),
        ];
        let b = vec![NodeOutput::single("out", "x/page.html")];

        // The css path is filtered out, so both lists fingerprint the same.
        assert_eq!(
            output_signature(&a, "out", Some("**/*.html")).unwrap(),
            output_signature(&b, "out", Some("**/*.html")).unwrap()
        );
    }

    #[test]
    fn test_shape_default() {
        let shaped = OutputConfig::new().shape(
            "build".into(),
            ".".into(),
            "render",
            "content/post/a.md".into(),
        );
        assert_eq!(shaped, "build/render/content/post/a.md");
    }

    #[test]
    fn test_shape_cleans_build_prefix() {
        let shaped = OutputConfig::new().shape(
            "build".into(),
            ".".into(),
            "minify",
            "build/render/post/a.html".into(),
        );
        assert_eq!(shaped, "build/minify/post/a.html");
    }

    #[test]
    fn test_shape_flatten_wins_over_strip() {
        let shaped = OutputConfig::new()
            .flatten_to_basename()
            .strip_path_prefix("content")
            .shape("build".into(), ".".into(), "n", "content/post/a.md".into());
        assert_eq!(shaped, "build/n/a.md");
    }

    #[test]
    fn test_shape_strip_prefix_segment_wise() {
        let config = OutputConfig::new().strip_path_prefix("content");
        let stripped = config.shape("build".into(), ".".into(), "n", "content/post/a.md".into());
        assert_eq!(stripped, "build/n/post/a.md");

        // "contents" shares a string prefix but not a path segment.
        let kept = config.shape("build".into(), ".".into(), "n", "contents/a.md".into());
        assert_eq!(kept, "build/n/contents/a.md");
    }

    #[test]
    fn test_shape_path_mapping() {
        let shaped = OutputConfig::new()
            .path_mapping(|p| Utf8Path::new("pages").join(p.file_name().unwrap_or_default()))
            .shape("build".into(), ".".into(), "n", "content/a.md".into());
        assert_eq!(shaped, "build/n/pages/a.md");
    }

    #[test]
    fn test_shape_output_filename_wins() {
        let shaped = OutputConfig::new()
            .output_filename("index.html")
            .extension("txt")
            .filename_suffix(".min")
            .shape("build".into(), ".".into(), "n", "content/a.md".into());
        assert_eq!(shaped, "build/n/content/index.html");
    }

    #[test]
    fn test_shape_extension_and_suffix() {
        let shaped = OutputConfig::new()
            .extension("html")
            .filename_suffix(".min")
            .shape("build".into(), ".".into(), "n", "content/a.md".into());
        assert_eq!(shaped, "build/n/content/a.min.html");
    }

    #[test]
    fn test_shape_output_dir_override() {
        let shaped = OutputConfig::new()
            .output_dir("staging/html")
            .shape("build".into(), ".".into(), "n", "content/a.md".into());
        assert_eq!(shaped, "staging/html/content/a.md");
    }

    #[test]
    fn test_rebase_rejects_escape() {
        assert_eq!(
            rebase("old/a/b.txt".into(), "old".into(), "new".into()),
            Some("new/a/b.txt".into())
        );
        assert_eq!(rebase("elsewhere/b.txt".into(), "old".into(), "new".into()), None);
        assert_eq!(rebase("old/../b.txt".into(), "old".into(), "new".into()), None);
    }
}
