//! End-to-end pipeline scenarios built around a trivial uppercase transform.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use kamado::nodes::{CompositeNode, TransformNode};
use kamado::{ConfigValue, Input, Pipeline};

/// A pipeline rooted in a temp directory, with an uppercase hook that counts
/// how many times real work actually ran.
fn pipeline_in(root: &Utf8Path, counter: Arc<AtomicUsize>) -> Pipeline {
    Pipeline::config()
        .build_dir(root.join("build"))
        .cache_dir(root.join(".cache"))
        .work_dir(root.to_owned())
        .workers(2)
        .hook("uppercase", move |text| {
            counter.fetch_add(1, Ordering::SeqCst);
            text.to_uppercase()
        })
        .finish()
}

fn write(path: &Utf8Path, text: &str) {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).unwrap();
    }
    fs::write(path, text).unwrap();
}

fn read(path: &Utf8Path) -> String {
    fs::read_to_string(path).unwrap_or_else(|_| panic!("missing {path}"))
}

fn mtime(path: &Utf8Path) -> SystemTime {
    fs::metadata(path).unwrap().modified().unwrap()
}

/// Keeps successive writes clearly apart in mtime terms.
fn settle() {
    std::thread::sleep(Duration::from_millis(10));
}

fn root_of(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap()
}

fn uppercase_node(name: &str) -> TransformNode {
    TransformNode::new(name)
        .source(Input::glob("*.txt"))
        .hook("uppercase")
        .param("prefix", "X:")
}

#[test]
fn fresh_build_writes_outputs_and_entries() {
    let dir = tempfile::tempdir().unwrap();
    let root = root_of(&dir);
    write(&root.join("a.txt"), "hello");
    write(&root.join("b.txt"), "world");

    let counter = Arc::new(AtomicUsize::new(0));
    let mut pipeline = pipeline_in(&root, counter.clone());
    pipeline.add(uppercase_node("upper")).unwrap();

    let report = pipeline.run().unwrap();

    assert_eq!(read(&root.join("build/upper/a.txt")), "X:HELLO");
    assert_eq!(read(&root.join("build/upper/b.txt")), "X:WORLD");
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert!(report.elapsed_of("upper").is_some());

    // One signature directory, one entry per item.
    let signature_dirs: Vec<_> = fs::read_dir(root.join(".cache")).unwrap().collect();
    assert_eq!(signature_dirs.len(), 1);
    let entries: Vec<_> = fs::read_dir(signature_dirs[0].as_ref().unwrap().path())
        .unwrap()
        .collect();
    assert_eq!(entries.len(), 2);
}

#[test]
fn noop_rerun_does_no_work() {
    let dir = tempfile::tempdir().unwrap();
    let root = root_of(&dir);
    write(&root.join("a.txt"), "hello");
    write(&root.join("b.txt"), "world");

    let counter = Arc::new(AtomicUsize::new(0));
    let mut pipeline = pipeline_in(&root, counter.clone());
    pipeline.add(uppercase_node("upper")).unwrap();

    pipeline.run().unwrap();
    let first_a = mtime(&root.join("build/upper/a.txt"));
    settle();

    pipeline.run().unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(read(&root.join("build/upper/a.txt")), "X:HELLO");
    assert_eq!(mtime(&root.join("build/upper/a.txt")), first_a);
}

#[test]
fn touch_without_change_still_hits() {
    let dir = tempfile::tempdir().unwrap();
    let root = root_of(&dir);
    write(&root.join("a.txt"), "hello");
    write(&root.join("b.txt"), "world");

    let counter = Arc::new(AtomicUsize::new(0));
    let mut pipeline = pipeline_in(&root, counter.clone());
    pipeline.add(uppercase_node("upper")).unwrap();
    pipeline.run().unwrap();

    // Rewrite identical bytes: the mtime moves, the content does not.
    settle();
    write(&root.join("a.txt"), "hello");

    pipeline.run().unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn content_change_misses_only_the_changed_item() {
    let dir = tempfile::tempdir().unwrap();
    let root = root_of(&dir);
    write(&root.join("a.txt"), "hello");
    write(&root.join("b.txt"), "world");

    let counter = Arc::new(AtomicUsize::new(0));
    let mut pipeline = pipeline_in(&root, counter.clone());
    pipeline.add(uppercase_node("upper")).unwrap();
    pipeline.run().unwrap();

    let untouched = mtime(&root.join("build/upper/b.txt"));
    settle();
    write(&root.join("a.txt"), "hi");

    pipeline.run().unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 3);
    assert_eq!(read(&root.join("build/upper/a.txt")), "X:HI");
    assert_eq!(mtime(&root.join("build/upper/b.txt")), untouched);
}

#[test]
fn unrelated_file_does_not_invalidate() {
    let dir = tempfile::tempdir().unwrap();
    let root = root_of(&dir);
    write(&root.join("a.txt"), "hello");
    write(&root.join("b.txt"), "world");

    let counter = Arc::new(AtomicUsize::new(0));
    let mut pipeline = pipeline_in(&root, counter.clone());
    pipeline.add(uppercase_node("upper")).unwrap();
    pipeline.run().unwrap();

    settle();
    write(&root.join("notes.md"), "not an input");

    pipeline.run().unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn upstream_consumer_misses_only_affected_items() {
    let dir = tempfile::tempdir().unwrap();
    let root = root_of(&dir);
    write(&root.join("a.txt"), "hello");
    write(&root.join("b.txt"), "world");

    let counter = Arc::new(AtomicUsize::new(0));
    let mut pipeline = pipeline_in(&root, counter.clone());
    pipeline.add(uppercase_node("upper")).unwrap();
    pipeline
        .add(
            TransformNode::new("wrap")
                .source(Input::from_node("upper", "out"))
                .param("prefix", "Y:"),
        )
        .unwrap();

    pipeline.run().unwrap();
    assert_eq!(read(&root.join("build/wrap/a.txt")), "Y:X:HELLO");
    assert_eq!(read(&root.join("build/wrap/b.txt")), "Y:X:WORLD");

    let untouched = mtime(&root.join("build/wrap/b.txt"));
    settle();
    write(&root.join("a.txt"), "hi");

    pipeline.run().unwrap();

    assert_eq!(read(&root.join("build/wrap/a.txt")), "Y:X:HI");
    assert_eq!(mtime(&root.join("build/wrap/b.txt")), untouched);
}

#[test]
fn same_config_twin_reuses_cache_across_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let root = root_of(&dir);
    write(&root.join("a.txt"), "hello");
    write(&root.join("b.txt"), "world");

    let counter = Arc::new(AtomicUsize::new(0));
    let mut pipeline = pipeline_in(&root, counter.clone());
    pipeline.add(uppercase_node("upper")).unwrap();
    // Identical type and config, different name, ordered after "upper".
    pipeline
        .add(uppercase_node("upper-twin").depends_on("upper"))
        .unwrap();

    pipeline.run().unwrap();

    // The twin hit against the first node's entries; work ran once per item.
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(read(&root.join("build/upper-twin/a.txt")), "X:HELLO");
    assert_eq!(read(&root.join("build/upper-twin/b.txt")), "X:WORLD");
}

#[test]
fn file_ref_dependency_invalidates_all_items() {
    let dir = tempfile::tempdir().unwrap();
    let root = root_of(&dir);
    write(&root.join("a.txt"), "hello");
    write(&root.join("b.txt"), "world");
    write(&root.join("style.css"), "v1");

    let counter = Arc::new(AtomicUsize::new(0));
    let mut pipeline = pipeline_in(&root, counter.clone());
    pipeline
        .add(
            uppercase_node("upper")
                .param("stylesheet", ConfigValue::FileRef("style.css".into())),
        )
        .unwrap();

    pipeline.run().unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    pipeline.run().unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    settle();
    write(&root.join("style.css"), "v2");

    pipeline.run().unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 4);
}

#[test]
fn discovered_dependency_invalidates() {
    let dir = tempfile::tempdir().unwrap();
    let root = root_of(&dir);
    write(&root.join("main.txt"), "@include part.txt\n");
    write(&root.join("part.txt"), "hello");

    let counter = Arc::new(AtomicUsize::new(0));
    let mut pipeline = pipeline_in(&root, counter.clone());
    pipeline
        .add(
            TransformNode::new("upper")
                .source(Input::glob("main.txt"))
                .hook("uppercase"),
        )
        .unwrap();

    pipeline.run().unwrap();
    assert_eq!(read(&root.join("build/upper/main.txt")), "HELLO\n");
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    // The include target was discovered at run time; editing it misses.
    settle();
    write(&root.join("part.txt"), "goodbye");

    pipeline.run().unwrap();
    assert_eq!(read(&root.join("build/upper/main.txt")), "GOODBYE\n");
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn composite_fans_out_and_collects() {
    let dir = tempfile::tempdir().unwrap();
    let root = root_of(&dir);
    write(&root.join("a.txt"), "hello");

    let counter = Arc::new(AtomicUsize::new(0));
    let mut pipeline = pipeline_in(&root, counter.clone());
    pipeline
        .add(
            CompositeNode::new("bundle")
                .child(uppercase_node("loud"))
                .child(
                    TransformNode::new("quiet")
                        .source(Input::glob("*.txt"))
                        .param("prefix", "q:"),
                ),
        )
        .unwrap();

    let report = pipeline.run().unwrap();

    let bundle = &report.outputs["bundle"];
    let loud: Vec<&Utf8Path> = kamado::NodeOutput::flatten(bundle, "loud");
    let quiet: Vec<&Utf8Path> = kamado::NodeOutput::flatten(bundle, "quiet");
    assert_eq!(loud, vec![root.join("build/loud/a.txt").as_path()]);
    assert_eq!(quiet, vec![root.join("build/quiet/a.txt").as_path()]);
    assert_eq!(read(&root.join("build/loud/a.txt")), "X:HELLO");
    assert_eq!(read(&root.join("build/quiet/a.txt")), "q:hello");
}

#[test]
fn filtered_upstream_reference() {
    let dir = tempfile::tempdir().unwrap();
    let root = root_of(&dir);
    write(&root.join("page.txt"), "page");
    write(&root.join("notes.md"), "notes");

    let counter = Arc::new(AtomicUsize::new(0));
    let mut pipeline = pipeline_in(&root, counter.clone());

    // "copy" emits one txt and one md output; "wrap" filters to txt only.
    pipeline
        .add(
            kamado::nodes::CopyNode::new("gather")
                .source(Input::list([Input::glob("*.txt"), Input::glob("*.md")])),
        )
        .unwrap();
    pipeline
        .add(
            TransformNode::new("wrap")
                .source(Input::from_node_filtered("gather", "out", "*.txt"))
                .param("prefix", "W:"),
        )
        .unwrap();

    pipeline.run().unwrap();

    assert_eq!(read(&root.join("build/wrap/page.txt")), "W:page");
    assert!(!root.join("build/wrap/notes.md").exists());
}
