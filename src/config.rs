//! Node configuration and content signatures.
//!
//! A node's `config` is a map of [`ConfigValue`]s. Serialized canonically and
//! hashed, it yields the node's *content signature*: an identifier for *what*
//! the node computes, independent of *where* it writes. Two nodes whose
//! configs serialize to the same canonical string share cache entries, which
//! is what enables cross-node output reuse.
//!
//! Path-valued entries are captured stably (by path, not by content), so
//! moving files does not evict the cache; content drift is caught later by
//! the input-hash checks during cache validation.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::{Arc, RwLock};

use camino::{Utf8Path, Utf8PathBuf};

use crate::hash::Hash32;

/// One value inside a node's configuration map.
///
/// Plain data variants serialize as JSON. The reference variants serialize as
/// stable literals (`FileRef(..)`, `from(..)`, `hook(..)`) so that the
/// canonical form never interpolates volatile state such as a producer's
/// current path list.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<ConfigValue>),
    Map(BTreeMap<String, ConfigValue>),
    /// A literal path used verbatim; also a tracked cache dependency.
    FileRef(Utf8PathBuf),
    /// A reference to another node's emitted output list.
    NodeRef {
        node: String,
        output: String,
        filter: Option<String>,
    },
    /// A named pure callable, resolved through a [`HookRegistry`].
    ///
    /// Two distinct registrations under the same identifier share cache
    /// entries; only the identifier participates in the signature.
    Hook(String),
}

impl ConfigValue {
    /// Shorthand for a node-output reference without a glob filter.
    pub fn from_node(node: impl Into<String>, output: impl Into<String>) -> Self {
        ConfigValue::NodeRef {
            node: node.into(),
            output: output.into(),
            filter: None,
        }
    }

    /// Shorthand for a node-output reference filtered by a glob.
    pub fn from_node_filtered(
        node: impl Into<String>,
        output: impl Into<String>,
        filter: impl Into<String>,
    ) -> Self {
        ConfigValue::NodeRef {
            node: node.into(),
            output: output.into(),
            filter: Some(filter.into()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) => Some(s),
            _ => None,
        }
    }

    fn canonical_into(&self, acc: &mut String) {
        match self {
            ConfigValue::Null => acc.push_str("null"),
            ConfigValue::Bool(b) => {
                write!(acc, "{b}").unwrap();
            }
            ConfigValue::Number(n) => {
                write!(acc, "{n}").unwrap();
            }
            ConfigValue::String(s) => {
                // JSON encoding of a string never fails.
                acc.push_str(&serde_json::to_string(s).unwrap());
            }
            ConfigValue::Array(items) => {
                acc.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        acc.push(',');
                    }
                    item.canonical_into(acc);
                }
                acc.push(']');
            }
            ConfigValue::Map(map) => canonical_map_into(map, acc),
            ConfigValue::FileRef(path) => {
                write!(acc, "FileRef({path})").unwrap();
            }
            ConfigValue::NodeRef {
                node,
                output,
                filter,
            } => match filter {
                Some(filter) => write!(acc, "from({node}:{output}:{filter})").unwrap(),
                None => write!(acc, "from({node}:{output})").unwrap(),
            },
            ConfigValue::Hook(id) => {
                write!(acc, "hook({id})").unwrap();
            }
        }
    }

    fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a ConfigValue)) {
        visit(self);
        match self {
            ConfigValue::Array(items) => {
                for item in items {
                    item.walk(visit);
                }
            }
            ConfigValue::Map(map) => {
                for value in map.values() {
                    value.walk(visit);
                }
            }
            _ => {}
        }
    }
}

/// BTreeMap iteration already yields keys in ascending order; null-valued
/// entries are dropped from the canonical form.
fn canonical_map_into(map: &BTreeMap<String, ConfigValue>, acc: &mut String) {
    acc.push('{');
    let mut first = true;
    for (key, value) in map {
        if matches!(value, ConfigValue::Null) {
            continue;
        }
        if !first {
            acc.push(',');
        }
        first = false;
        acc.push_str(&serde_json::to_string(key).unwrap());
        acc.push(':');
        value.canonical_into(acc);
    }
    acc.push('}');
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::String(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::String(value)
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Bool(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Number(value.into())
    }
}

impl From<u64> for ConfigValue {
    fn from(value: u64) -> Self {
        ConfigValue::Number(value.into())
    }
}

impl From<Vec<ConfigValue>> for ConfigValue {
    fn from(value: Vec<ConfigValue>) -> Self {
        ConfigValue::Array(value)
    }
}

impl From<&Utf8Path> for ConfigValue {
    fn from(value: &Utf8Path) -> Self {
        ConfigValue::FileRef(value.to_owned())
    }
}

/// A node's configuration map.
///
/// Only this map contributes to the content signature; destination-shaping
/// parameters live in [`OutputConfig`](crate::OutputConfig) and are excluded
/// on purpose, so that two nodes computing the same thing into different
/// places can share cache entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config(BTreeMap<String, ConfigValue>);

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ConfigValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.0.get(key)
    }

    /// The canonical string form: keys sorted ascending, recursive, stable.
    pub fn canonical(&self) -> String {
        let mut acc = String::new();
        canonical_map_into(&self.0, &mut acc);
        acc
    }

    /// The content signature: `<typeTag>-<first 8 hex of sha256(canonical)>`.
    pub fn signature(&self, type_tag: &str) -> String {
        let hash = Hash32::hash(self.canonical().as_bytes());
        format!("{}-{}", type_tag, hash.to_hex_short())
    }

    /// Visits every value in the map recursively, depth first.
    pub fn walk<'a>(&'a self, mut visit: impl FnMut(&'a ConfigValue)) {
        for value in self.0.values() {
            value.walk(&mut visit);
        }
    }

    /// Every file reference found anywhere in the map.
    pub fn file_refs(&self) -> Vec<&Utf8Path> {
        let mut refs = Vec::new();
        self.walk(|value| {
            if let ConfigValue::FileRef(path) = value {
                refs.push(path.as_path());
            }
        });
        refs
    }

    /// Every node-output reference found anywhere in the map, as
    /// `(producer, output, filter)` triples.
    pub fn node_refs(&self) -> Vec<(&str, &str, Option<&str>)> {
        let mut refs = Vec::new();
        self.walk(|value| {
            if let ConfigValue::NodeRef {
                node,
                output,
                filter,
            } = value
            {
                refs.push((node.as_str(), output.as_str(), filter.as_deref()));
            }
        });
        refs
    }
}

impl FromIterator<(String, ConfigValue)> for Config {
    fn from_iter<T: IntoIterator<Item = (String, ConfigValue)>>(iter: T) -> Self {
        Config(iter.into_iter().collect())
    }
}

type HookFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Registration table of pure string transformations addressed by identifier.
///
/// This is the data-valued stand-in for function-valued config entries: a
/// config carries `ConfigValue::Hook("uppercase")` and the pipeline maps the
/// identifier to a callable here. Cache behavior is unchanged; the identifier
/// alone is hashed.
#[derive(Default)]
pub struct HookRegistry {
    map: RwLock<BTreeMap<String, HookFn>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, id: impl Into<String>, hook: F)
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.map.write().unwrap().insert(id.into(), Arc::new(hook));
    }

    pub fn get(&self, id: &str) -> Option<HookFn> {
        self.map.read().unwrap().get(id).cloned()
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<_> = self.map.read().unwrap().keys().cloned().collect();
        f.debug_struct("HookRegistry").field("hooks", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_sorted_keys() {
        let config = Config::new().with("b", "2").with("a", "1");
        assert_eq!(config.canonical(), r#"{"a":"1","b":"2"}"#);
    }

    #[test]
    fn test_canonical_drops_null() {
        let config = Config::new()
            .with("keep", "x")
            .with("drop", ConfigValue::Null);
        assert_eq!(config.canonical(), r#"{"keep":"x"}"#);
    }

    #[test]
    fn test_canonical_reference_literals() {
        let config = Config::new()
            .with("dep", ConfigValue::FileRef("styles/base.css".into()))
            .with("src", ConfigValue::from_node_filtered("render", "out", "*.html"))
            .with("post", ConfigValue::Hook("uppercase".into()));
        assert_eq!(
            config.canonical(),
            r#"{"dep":FileRef(styles/base.css),"post":hook(uppercase),"src":from(render:out:*.html)}"#
        );
    }

    #[test]
    fn test_canonical_nested() {
        let config = Config::new().with(
            "opts",
            ConfigValue::Map(BTreeMap::from([
                ("z".to_string(), ConfigValue::from(true)),
                ("a".to_string(), ConfigValue::from(vec![1i64.into(), 2i64.into()])),
            ])),
        );
        assert_eq!(config.canonical(), r#"{"opts":{"a":[1,2],"z":true}}"#);
    }

    #[test]
    fn test_signature_deterministic() {
        let a = Config::new().with("prefix", "X:").with("hook", ConfigValue::Hook("up".into()));
        let b = Config::new().with("hook", ConfigValue::Hook("up".into())).with("prefix", "X:");
        assert_eq!(a.signature("transform"), b.signature("transform"));
        assert!(a.signature("transform").starts_with("transform-"));
        assert_eq!(a.signature("transform").len(), "transform-".len() + 8);
    }

    #[test]
    fn test_signature_differs_on_config_change() {
        let a = Config::new().with("prefix", "X:");
        let b = Config::new().with("prefix", "Y:");
        assert_ne!(a.signature("transform"), b.signature("transform"));
    }

    #[test]
    fn test_collect_refs() {
        let config = Config::new()
            .with("dep", ConfigValue::FileRef("a.xsl".into()))
            .with(
                "src",
                ConfigValue::Array(vec![
                    ConfigValue::from_node("render", "out"),
                    ConfigValue::FileRef("b.xsl".into()),
                ]),
            );

        assert_eq!(config.file_refs().len(), 2);
        assert_eq!(config.node_refs(), vec![("render", "out", None)]);
    }

    #[test]
    fn test_hook_registry() {
        let hooks = HookRegistry::new();
        hooks.register("upper", |s| s.to_uppercase());

        let hook = hooks.get("upper").unwrap();
        assert_eq!(hook("abc"), "ABC");
        assert!(hooks.get("missing").is_none());
    }
}
