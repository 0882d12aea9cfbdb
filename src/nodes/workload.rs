use std::collections::HashSet;
use std::fs;
use std::sync::Arc;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};

use crate::config::HookRegistry;
use crate::node::DEFAULT_OUTPUT;
use crate::pool::{JobOutput, JobSpec, Workload};

/// Registry name of the built-in text transformation workload.
pub const TEXT_TRANSFORM: &str = "text-transform";

/// Per-item text transformation, run on worker threads.
///
/// Reads the item, splices `@include <path>` directives (recursively,
/// relative to the including file), applies the hook named by the `hook`
/// parameter, prepends the `prefix` parameter if present, and writes the
/// result to the job's destination. Every spliced file is reported as a
/// discovered dependency so the cache can watch it.
pub struct TextTransform {
    hooks: Arc<HookRegistry>,
}

impl TextTransform {
    pub fn new(hooks: Arc<HookRegistry>) -> Self {
        Self { hooks }
    }
}

impl Workload for TextTransform {
    fn perform(&self, job: &JobSpec) -> anyhow::Result<JobOutput> {
        let dest = job
            .dest
            .as_ref()
            .context("text-transform requires a destination path")?;

        let mut discovered = Vec::new();
        let mut visited = HashSet::new();
        let text = read_with_includes(&job.item, &mut discovered, &mut visited)?;

        let text = match job.params.get("hook") {
            Some(id) => {
                let hook = self
                    .hooks
                    .get(id)
                    .with_context(|| format!("unknown hook '{id}'"))?;
                hook(&text)
            }
            None => text,
        };

        let text = match job.params.get("prefix") {
            Some(prefix) => format!("{prefix}{text}"),
            None => text,
        };

        if let Some(dir) = dest.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(dest, text)?;

        let mut output = JobOutput::default();
        output
            .outputs
            .insert(DEFAULT_OUTPUT.to_string(), vec![dest.clone()]);
        output.discovered_deps = discovered;
        Ok(output)
    }
}

fn read_with_includes(
    path: &Utf8Path,
    discovered: &mut Vec<Utf8PathBuf>,
    visited: &mut HashSet<Utf8PathBuf>,
) -> anyhow::Result<String> {
    let text =
        fs::read_to_string(path).with_context(|| format!("couldn't read '{path}'"))?;

    if !text.contains("@include ") {
        return Ok(text);
    }

    let dir = path.parent().unwrap_or(Utf8Path::new(""));
    let mut acc = String::with_capacity(text.len());

    for line in text.lines() {
        match line.strip_prefix("@include ") {
            Some(target) => {
                let target = dir.join(target.trim());
                if !visited.insert(target.clone()) {
                    anyhow::bail!("include cycle through '{target}'");
                }
                discovered.push(target.clone());
                acc.push_str(&read_with_includes(&target, discovered, visited)?);
            }
            None => acc.push_str(line),
        }
        acc.push('\n');
    }

    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_includes_are_spliced_and_discovered() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        fs::write(root.join("main.txt"), "one\n@include part.txt\nthree\n").unwrap();
        fs::write(root.join("part.txt"), "two\n").unwrap();

        let mut discovered = Vec::new();
        let mut visited = HashSet::new();
        let text = read_with_includes(&root.join("main.txt"), &mut discovered, &mut visited).unwrap();

        assert_eq!(text, "one\ntwo\n\nthree\n");
        assert_eq!(discovered, vec![root.join("part.txt")]);
    }

    #[test]
    fn test_include_cycle_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        fs::write(root.join("a.txt"), "@include b.txt\n").unwrap();
        fs::write(root.join("b.txt"), "@include a.txt\n").unwrap();

        let mut discovered = Vec::new();
        let mut visited = HashSet::new();
        let result = read_with_includes(&root.join("a.txt"), &mut discovered, &mut visited);

        assert!(result.is_err());
    }

    #[test]
    fn test_hook_and_prefix_applied() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        fs::write(root.join("a.txt"), "hello").unwrap();

        let hooks = Arc::new(HookRegistry::new());
        hooks.register("upper", |s: &str| s.to_uppercase());
        let workload = TextTransform::new(hooks);

        let job = JobSpec::new(TEXT_TRANSFORM, root.join("a.txt"))
            .dest(root.join("out/a.txt"))
            .param("hook", "upper")
            .param("prefix", "X:");

        let output = workload.perform(&job).unwrap();
        assert_eq!(output.outputs[DEFAULT_OUTPUT], vec![root.join("out/a.txt")]);
        assert_eq!(fs::read_to_string(root.join("out/a.txt")).unwrap(), "X:HELLO");
    }
}
