//! The hierarchical section tree.
//!
//! A [`Config`] owns an arena of nodes indexed by id; every node is a
//! *section* addressed by a dotted key path from the root. Sections hold the
//! raw string form of their value and default, the [`Kind`] used to convert
//! them, a memoized typed value, a dirty flag driving the sync protocol, and
//! an optional comment that round-trips through comment-aware formats.
//!
//! Sections are created lazily the first time a key is written or
//! initialized. A section is *valid* once it has an explicit value or a
//! default; only valid sections appear in key listings, snapshots, and
//! sync output.

use std::cell::RefCell;
use std::fmt;

use indexmap::IndexMap;

use crate::coerce::{Coercer, Kind, Value};
use crate::formats::{self, Format};
use crate::interp::Interpolator;
use crate::sync::{ErrorPolicy, Source};
use crate::{Error, Result};

pub(crate) type NodeId = usize;

/// Id of the root section.
pub(crate) const ROOT: NodeId = 0;

/// A configuration key: a separator-delimited path or pre-split segments.
#[derive(Debug, Clone, Copy)]
pub enum Key<'a> {
    Path(&'a str),
    Segments(&'a [&'a str]),
}

impl<'a> From<&'a str> for Key<'a> {
    fn from(path: &'a str) -> Self {
        Key::Path(path)
    }
}

impl<'a> From<&'a String> for Key<'a> {
    fn from(path: &'a String) -> Self {
        Key::Path(path)
    }
}

impl<'a> From<&'a [&'a str]> for Key<'a> {
    fn from(segments: &'a [&'a str]) -> Self {
        Key::Segments(segments)
    }
}

impl<'a, const N: usize> From<&'a [&'a str; N]> for Key<'a> {
    fn from(segments: &'a [&'a str; N]) -> Self {
        Key::Segments(segments)
    }
}

/// One node of the section tree.
#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) name: String,
    /// Full dotted key from the root; empty for the root itself.
    pub(crate) key: String,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: IndexMap<String, NodeId>,
    /// Raw string form of the explicit value, if set.
    pub(crate) value: Option<String>,
    /// Raw string form of the default, if set.
    pub(crate) default: Option<String>,
    /// Conversion descriptor; sticky once established.
    pub(crate) kind: Option<Kind>,
    /// Memoized typed value. Interior mutability keeps reads `&self`; the
    /// tree is single-threaded by contract.
    pub(crate) cache: RefCell<Option<Value>>,
    /// True when the value changed since the last successful write.
    pub(crate) dirty: bool,
    pub(crate) comment: Option<String>,
}

impl Node {
    fn new(name: String, key: String, parent: Option<NodeId>) -> Self {
        Self {
            name,
            key,
            parent,
            children: IndexMap::new(),
            value: None,
            default: None,
            kind: None,
            cache: RefCell::new(None),
            dirty: false,
            comment: None,
        }
    }

    pub(crate) fn valid(&self) -> bool {
        self.value.is_some() || self.default.is_some()
    }

    /// The raw string the section currently stands for.
    pub(crate) fn raw(&self) -> Option<&str> {
        self.value.as_deref().or(self.default.as_deref())
    }

    pub(crate) fn invalidate_cache(&mut self) {
        *self.cache.get_mut() = None;
    }
}

/// Construction options for [`Config`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Registered name of the format used for sources. Defaults to `"ini"`.
    pub format: String,
    /// Key path separator. Defaults to `"."`.
    pub separator: String,
    /// In strict mode keys must be initialized before they can be set, and
    /// reads drop unknown keys instead of creating sections for them.
    pub strict: bool,
    /// Memoize converted values. Defaults to `true`.
    pub cache_values: bool,
    /// Run values through the coercer. Defaults to `true`.
    pub coerce_values: bool,
    /// Resolve `{!key}` references in string values. Defaults to `false`.
    pub interpolate_values: bool,
    /// How source parse errors are reported. Defaults to
    /// [`ErrorPolicy::Warn`].
    pub error_policy: ErrorPolicy,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            format: "ini".to_owned(),
            separator: ".".to_owned(),
            strict: false,
            cache_values: true,
            coerce_values: true,
            interpolate_values: false,
            error_policy: ErrorPolicy::Warn,
        }
    }
}

/// The root configuration object.
///
/// Owns the section tree, the source list, the [`Coercer`], and the
/// [`Format`] used to read and write sources.
pub struct Config {
    pub(crate) nodes: Vec<Node>,
    pub(crate) sources: Vec<Source>,
    pub(crate) format: Box<dyn Format>,
    pub(crate) coercer: Option<Coercer>,
    pub(crate) separator: String,
    pub(crate) strict: bool,
    pub(crate) cache_values: bool,
    pub(crate) coerce_values: bool,
    pub(crate) interpolate_values: bool,
    pub(crate) error_policy: ErrorPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("sources", &self.sources)
            .field("format", &self.format.name())
            .field("sections", &self.nodes.len())
            .finish()
    }
}

impl Config {
    /// A config with default options: INI format, `.` separator, caching and
    /// coercion enabled, no sources.
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new(String::new(), String::new(), None)],
            sources: Vec::new(),
            format: Box::new(formats::IniFormat::new()),
            coercer: Some(Coercer::new()),
            separator: ".".to_owned(),
            strict: false,
            cache_values: true,
            coerce_values: true,
            interpolate_values: false,
            error_policy: ErrorPolicy::Warn,
        }
    }

    /// A config with the given options.
    ///
    /// Fails with [`Error::UnknownFormat`] if `options.format` names a
    /// format that was never registered.
    pub fn with_options(options: Options) -> Result<Self> {
        let format = formats::format_by_name(&options.format)
            .ok_or_else(|| Error::UnknownFormat(options.format.clone()))?;
        Ok(Self {
            nodes: vec![Node::new(String::new(), String::new(), None)],
            sources: Vec::new(),
            format,
            coercer: Some(Coercer::new()),
            separator: options.separator,
            strict: options.strict,
            cache_values: options.cache_values,
            coerce_values: options.coerce_values,
            interpolate_values: options.interpolate_values,
            error_policy: options.error_policy,
        })
    }

    /// Append a source. The first source added is the one written by
    /// [`Config::sync`].
    pub fn add_source(&mut self, source: impl Into<Source>) {
        self.sources.push(source.into());
    }

    /// The configured sources, in priority order.
    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    /// The format used to read and write sources.
    pub fn format(&self) -> &dyn Format {
        self.format.as_ref()
    }

    /// Replace the format with an instance.
    pub fn set_format(&mut self, format: Box<dyn Format>) {
        self.format = format;
    }

    /// Replace the format by registered name.
    pub fn set_format_name(&mut self, name: &str) -> Result<()> {
        self.format =
            formats::format_by_name(name).ok_or_else(|| Error::UnknownFormat(name.to_owned()))?;
        Ok(())
    }

    /// The coercer, if one is set.
    pub fn coercer(&self) -> Option<&Coercer> {
        self.coercer.as_ref()
    }

    /// Mutable access to the coercer for registering custom types.
    pub fn coercer_mut(&mut self) -> Option<&mut Coercer> {
        self.coercer.as_mut()
    }

    /// Replace or remove the coercer. Without one, values pass through as
    /// raw strings.
    pub fn set_coercer(&mut self, coercer: Option<Coercer>) {
        self.coercer = coercer;
        self.clear_cache_all();
    }

    /// The key path separator.
    pub fn separator(&self) -> &str {
        &self.separator
    }

    // ------------------------------------------------------------------
    // key plumbing
    // ------------------------------------------------------------------

    /// Split a key into non-empty segments.
    pub(crate) fn segments<'k>(&self, key: impl Into<Key<'k>>) -> Vec<String> {
        match key.into() {
            Key::Path(path) => path
                .split(self.separator.as_str())
                .filter(|segment| !segment.is_empty())
                .map(str::to_owned)
                .collect(),
            Key::Segments(segments) => segments
                .iter()
                .filter(|segment| !segment.is_empty())
                .map(|segment| (*segment).to_owned())
                .collect(),
        }
    }

    pub(crate) fn join(&self, segments: &[String]) -> String {
        segments.join(&self.separator)
    }

    /// Locate an existing node for the given segments.
    pub(crate) fn find(&self, segments: &[String]) -> Option<NodeId> {
        let mut id = ROOT;
        for name in segments {
            id = *self.nodes[id].children.get(name)?;
        }
        Some(id)
    }

    /// Locate or create the node for the given segments.
    pub(crate) fn create(&mut self, segments: &[String]) -> NodeId {
        let mut id = ROOT;
        for name in segments {
            if let Some(&child) = self.nodes[id].children.get(name) {
                id = child;
                continue;
            }
            let key = if self.nodes[id].key.is_empty() {
                name.clone()
            } else {
                format!("{}{}{}", self.nodes[id].key, self.separator, name)
            };
            let child = self.nodes.len();
            self.nodes.push(Node::new(name.clone(), key, Some(id)));
            self.nodes[id].children.insert(name.clone(), child);
            id = child;
        }
        id
    }

    pub(crate) fn resolve<'k>(&self, key: impl Into<Key<'k>>) -> Result<NodeId> {
        let segments = self.segments(key);
        self.find(&segments)
            .ok_or_else(|| Error::InvalidSection(self.join(&segments)))
    }

    /// The node a write should land on: existing-only in strict mode,
    /// created on demand otherwise.
    fn write_target(&mut self, segments: &[String]) -> Result<NodeId> {
        if self.strict {
            self.find(segments)
                .ok_or_else(|| Error::InvalidSection(self.join(segments)))
        } else {
            Ok(self.create(segments))
        }
    }

    // ------------------------------------------------------------------
    // sections
    // ------------------------------------------------------------------

    /// A handle on the section at `key`.
    pub fn section<'k>(&self, key: impl Into<Key<'k>>) -> Result<Section<'_>> {
        Ok(Section {
            config: self,
            id: self.resolve(key)?,
        })
    }

    /// A handle on the root section.
    pub fn root(&self) -> Section<'_> {
        Section {
            config: self,
            id: ROOT,
        }
    }

    /// Iterate the root's child sections.
    pub fn sections(&self, recurse: bool, only_valid: bool) -> Sections<'_> {
        self.root().sections(recurse, only_valid)
    }

    /// All valid keys, depth-first in insertion order.
    pub fn keys(&self) -> Keys<'_> {
        self.root().keys()
    }

    /// Remove the section at `key` and its whole subtree.
    pub fn remove<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<()> {
        let id = self.resolve(key)?;
        let Some(parent) = self.nodes[id].parent else {
            return Err(Error::InvalidSection(String::new()));
        };
        let name = self.nodes[id].name.clone();
        self.nodes[parent].children.shift_remove(&name);
        Ok(())
    }

    // ------------------------------------------------------------------
    // values and defaults
    // ------------------------------------------------------------------

    /// Initialize `key`: fix its type from `default` and set the default.
    ///
    /// If a raw value is already present and does not convert under the new
    /// type, the failure is routed through the error policy and the value
    /// falls back to the new default.
    pub fn init<'k>(&mut self, key: impl Into<Key<'k>>, default: impl Into<Value>) -> Result<()> {
        self.init_inner(key, default.into(), None)
    }

    /// Like [`Config::init`], with an explicit type descriptor.
    pub fn init_as<'k>(
        &mut self,
        key: impl Into<Key<'k>>,
        default: impl Into<Value>,
        kind: Kind,
    ) -> Result<()> {
        self.init_inner(key, default.into(), Some(kind))
    }

    fn init_inner<'k>(
        &mut self,
        key: impl Into<Key<'k>>,
        default: Value,
        kind: Option<Kind>,
    ) -> Result<()> {
        let segments = self.segments(key);
        let id = self.create(&segments);
        let kind = kind.unwrap_or_else(|| default.kind());
        self.nodes[id].kind = Some(kind);
        self.nodes[id].invalidate_cache();

        // re-validate any existing value against the new type
        if let Some(raw) = self.nodes[id].value.clone()
            && let Err(err) = self.convert_raw(id, &raw)
        {
            match self.error_policy {
                ErrorPolicy::Raise => return Err(err),
                ErrorPolicy::Warn => {
                    tracing::warn!(
                        key = %self.nodes[id].key,
                        error = %err,
                        "existing value is incompatible with the new type; reverting to default",
                    );
                    self.nodes[id].value = None;
                }
                ErrorPolicy::Ignore => self.nodes[id].value = None,
            }
        }

        let raw_default = self.adapt_typed(id, &default)?;
        self.store_default(id, raw_default, Some(default));
        Ok(())
    }

    /// The typed value at `key`, or `None` if the key or value is missing.
    /// Coercion and interpolation failures still surface as errors.
    pub fn get<'k>(&self, key: impl Into<Key<'k>>) -> Result<Option<Value>> {
        match self.value(key) {
            Ok(value) => Ok(Some(value)),
            Err(Error::InvalidSection(_)) | Err(Error::NoValue(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// The typed value at `key`: the explicit value if set, else the
    /// default.
    pub fn value<'k>(&self, key: impl Into<Key<'k>>) -> Result<Value> {
        let id = self.resolve(key)?;
        self.node_value(id)
    }

    /// Set the typed value at `key`, marking the section dirty.
    pub fn set_value<'k>(&mut self, key: impl Into<Key<'k>>, value: impl Into<Value>) -> Result<()> {
        let segments = self.segments(key);
        let id = self.write_target(&segments)?;
        let value = value.into();
        if self.nodes[id].kind.is_none() {
            self.nodes[id].kind = Some(value.kind());
        }
        let raw = self.adapt_typed(id, &value)?;
        let cache_value = self.should_cache(&value, &raw);
        let node = &mut self.nodes[id];
        node.value = Some(raw);
        node.dirty = true;
        node.invalidate_cache();
        if cache_value {
            *node.cache.get_mut() = Some(value);
        }
        Ok(())
    }

    /// The raw string at `key`: the explicit value if set, else the default.
    pub fn raw_value<'k>(&self, key: impl Into<Key<'k>>) -> Result<String> {
        let id = self.resolve(key)?;
        let node = &self.nodes[id];
        node.raw()
            .map(str::to_owned)
            .ok_or_else(|| Error::NoValue(node.key.clone()))
    }

    /// Set the raw string at `key` without coercion, marking the section
    /// dirty.
    pub fn set_raw_value<'k>(&mut self, key: impl Into<Key<'k>>, raw: impl Into<String>) -> Result<()> {
        let segments = self.segments(key);
        let id = self.write_target(&segments)?;
        let node = &mut self.nodes[id];
        node.value = Some(raw.into());
        node.dirty = true;
        node.invalidate_cache();
        Ok(())
    }

    /// The typed default at `key`.
    pub fn default_value<'k>(&self, key: impl Into<Key<'k>>) -> Result<Value> {
        let id = self.resolve(key)?;
        let node = &self.nodes[id];
        let raw = node
            .default
            .clone()
            .ok_or_else(|| Error::NoDefault(node.key.clone()))?;
        self.convert_raw(id, &raw)
    }

    /// Set the typed default at `key`. Establishes the section's type if it
    /// has none, and does not mark the section dirty.
    pub fn set_default<'k>(&mut self, key: impl Into<Key<'k>>, default: impl Into<Value>) -> Result<()> {
        let segments = self.segments(key);
        let id = self.write_target(&segments)?;
        let default = default.into();
        if self.nodes[id].kind.is_none() {
            self.nodes[id].kind = Some(default.kind());
        }
        let raw = self.adapt_typed(id, &default)?;
        self.store_default(id, raw, Some(default));
        Ok(())
    }

    /// The raw default string at `key`.
    pub fn raw_default<'k>(&self, key: impl Into<Key<'k>>) -> Result<String> {
        let id = self.resolve(key)?;
        let node = &self.nodes[id];
        node.default
            .clone()
            .ok_or_else(|| Error::NoDefault(node.key.clone()))
    }

    /// Set the raw default string at `key` without coercion.
    pub fn set_raw_default<'k>(&mut self, key: impl Into<Key<'k>>, raw: impl Into<String>) -> Result<()> {
        let segments = self.segments(key);
        let id = self.write_target(&segments)?;
        self.store_default(id, raw.into(), None);
        Ok(())
    }

    fn store_default(&mut self, id: NodeId, raw: String, typed: Option<Value>) {
        let node = &mut self.nodes[id];
        node.default = Some(raw);
        // the cache tracks the effective raw string, which is the default
        // only while no explicit value is set
        if node.value.is_none() {
            node.invalidate_cache();
            if let Some(value) = typed {
                let raw = node.default.clone().unwrap_or_default();
                if self.should_cache(&value, &raw) {
                    *self.nodes[id].cache.get_mut() = Some(value);
                }
            }
        }
    }

    /// The comment attached to `key`, if any.
    pub fn comment<'k>(&self, key: impl Into<Key<'k>>) -> Result<Option<String>> {
        let id = self.resolve(key)?;
        Ok(self.nodes[id].comment.clone())
    }

    /// Attach a comment to `key`. Comment-aware formats write it above the
    /// key's line.
    pub fn set_comment<'k>(&mut self, key: impl Into<Key<'k>>, comment: impl Into<String>) -> Result<()> {
        let segments = self.segments(key);
        let id = self.write_target(&segments)?;
        self.nodes[id].comment = Some(comment.into());
        Ok(())
    }

    /// Flag or unflag keys as dirty, forcing or suppressing their next
    /// write-back.
    pub fn set_dirty(&mut self, keys: &[&str], dirty: bool) -> Result<()> {
        for key in keys {
            let id = self.resolve(*key)?;
            self.nodes[id].dirty = dirty;
        }
        Ok(())
    }

    /// Clear the explicit value at `key`, reverting it to its default, and
    /// recurse into its children. The sections are marked dirty.
    pub fn reset<'k>(&mut self, key: impl Into<Key<'k>>) -> Result<()> {
        self.reset_with(key, true, false)
    }

    /// [`Config::reset`] with explicit recursion and `clean` control; a
    /// clean reset leaves the dirty flags untouched.
    pub fn reset_with<'k>(&mut self, key: impl Into<Key<'k>>, recurse: bool, clean: bool) -> Result<()> {
        let id = self.resolve(key)?;
        self.reset_node(id, recurse, clean);
        Ok(())
    }

    /// Reset every section in the tree.
    pub fn reset_all(&mut self, clean: bool) {
        self.reset_node(ROOT, true, clean);
    }

    fn reset_node(&mut self, id: NodeId, recurse: bool, clean: bool) {
        let node = &mut self.nodes[id];
        if node.value.is_some() {
            node.value = None;
            node.invalidate_cache();
            node.dirty = !clean;
            if node.default.is_none() {
                node.kind = None;
            }
        }
        if recurse {
            let children: Vec<NodeId> = self.nodes[id].children.values().copied().collect();
            for child in children {
                self.reset_node(child, true, clean);
            }
        }
    }

    /// Drop memoized typed values below `key`.
    pub fn clear_cache<'k>(&mut self, key: impl Into<Key<'k>>, recurse: bool) -> Result<()> {
        let id = self.resolve(key)?;
        self.clear_cache_node(id, recurse);
        Ok(())
    }

    /// Drop every memoized typed value.
    pub fn clear_cache_all(&mut self) {
        self.clear_cache_node(ROOT, true);
    }

    fn clear_cache_node(&mut self, id: NodeId, recurse: bool) {
        self.nodes[id].invalidate_cache();
        if recurse {
            let children: Vec<NodeId> = self.nodes[id].children.values().copied().collect();
            for child in children {
                self.clear_cache_node(child, true);
            }
        }
    }

    // ------------------------------------------------------------------
    // snapshots
    // ------------------------------------------------------------------

    /// A snapshot of all valid keys and values under the root.
    ///
    /// With `flat` the result is a single level of dotted keys; otherwise
    /// sections nest, with a section's own value under the empty key. With
    /// `convert` values are typed; otherwise they stay raw strings. The
    /// filter scopes the snapshot by key prefix.
    pub fn as_mapping(&self, flat: bool, convert: bool, filter: &crate::sync::KeyFilter) -> Result<Mapping> {
        let compiled = filter.compile(&self.separator);
        let mut entries: Vec<(Vec<String>, Mapping)> = Vec::new();
        for (key, id) in self.walk_valid(ROOT) {
            let segments = self.segments(key.as_str());
            if !compiled.includes(&segments) {
                continue;
            }
            let leaf = if convert {
                Mapping::Leaf(self.node_value(id)?)
            } else {
                Mapping::Leaf(Value::Str(
                    self.nodes[id].raw().unwrap_or_default().to_owned(),
                ))
            };
            entries.push((segments, leaf));
        }

        if flat {
            let mut map = IndexMap::new();
            for (segments, leaf) in entries {
                map.insert(self.join(&segments), leaf);
            }
            return Ok(Mapping::Node(map));
        }

        let mut nested = Mapping::Node(IndexMap::new());
        for (segments, leaf) in entries {
            nested.insert_path(&segments, leaf);
        }
        Ok(nested)
    }

    /// All valid `(key, id)` pairs under `base`, depth-first in insertion
    /// order, keyed from the root.
    pub(crate) fn walk_valid(&self, base: NodeId) -> Vec<(String, NodeId)> {
        let mut out = Vec::new();
        self.walk_valid_into(base, &mut out);
        out
    }

    fn walk_valid_into(&self, id: NodeId, out: &mut Vec<(String, NodeId)>) {
        let node = &self.nodes[id];
        if id != ROOT && node.valid() {
            out.push((node.key.clone(), id));
        }
        for &child in node.children.values() {
            self.walk_valid_into(child, out);
        }
    }

    /// Flat key -> raw string snapshot of the whole tree, used to resolve
    /// interpolation references.
    pub(crate) fn raw_snapshot(&self) -> IndexMap<String, String> {
        self.walk_valid(ROOT)
            .into_iter()
            .map(|(key, id)| {
                let raw = self.nodes[id].raw().unwrap_or_default().to_owned();
                (key, raw)
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // conversion plumbing
    // ------------------------------------------------------------------

    pub(crate) fn node_value(&self, id: NodeId) -> Result<Value> {
        let node = &self.nodes[id];
        if self.cache_values {
            let cached = node.cache.borrow();
            if let Some(value) = cached.as_ref() {
                return Ok(value.clone());
            }
        }

        let raw = node
            .raw()
            .ok_or_else(|| Error::NoValue(node.key.clone()))?
            .to_owned();
        let value = self.convert_raw(id, &raw)?;
        if self.should_cache(&value, &raw) {
            *node.cache.borrow_mut() = Some(value.clone());
        }
        Ok(value)
    }

    /// Interpolate and convert a raw string for the section at `id`.
    pub(crate) fn convert_raw(&self, id: NodeId, raw: &str) -> Result<Value> {
        let node = &self.nodes[id];
        let text = if self.interpolate_values && Interpolator::eligible(raw) {
            Interpolator::interpolate(&node.key, raw, &self.raw_snapshot())?
        } else {
            raw.to_owned()
        };

        if self.coerce_values
            && let Some(coercer) = &self.coercer
        {
            match &node.kind {
                Some(kind) => Ok(coercer.convert(&text, kind)?),
                None => Ok(Value::Str(text)),
            }
        } else {
            Ok(Value::Str(text))
        }
    }

    /// Adapt a typed value to its raw string for the section at `id`.
    fn adapt_typed(&self, id: NodeId, value: &Value) -> Result<String> {
        if self.coerce_values
            && let Some(coercer) = &self.coercer
        {
            Ok(coercer.adapt(value, self.nodes[id].kind.as_ref())?)
        } else {
            Ok(value.to_string())
        }
    }

    /// A converted value is memoized unless caching is off, the value is a
    /// plain string, or the raw text could still be interpolated.
    fn should_cache(&self, value: &Value, raw: &str) -> bool {
        self.cache_values && !matches!(value, Value::Str(_)) && !Interpolator::eligible(raw)
    }
}

/// A nested or flattened snapshot of configuration keys and values.
#[derive(Debug, Clone, PartialEq)]
pub enum Mapping {
    Leaf(Value),
    Node(IndexMap<String, Mapping>),
}

impl Mapping {
    /// The value at a flat key or nested path, if present.
    pub fn get(&self, key: &str) -> Option<&Mapping> {
        match self {
            Mapping::Node(map) => map.get(key),
            Mapping::Leaf(_) => None,
        }
    }

    /// The leaf value, if this entry is one.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Mapping::Leaf(value) => Some(value),
            Mapping::Node(_) => None,
        }
    }

    fn insert_path(&mut self, segments: &[String], leaf: Mapping) {
        let Mapping::Node(map) = self else { return };
        let (name, rest) = match segments {
            [name] => (name, None),
            [name, rest @ ..] => (name, Some(rest)),
            [] => return,
        };

        match rest {
            None => {
                // a section seen first as a leaf may later grow children
                if matches!(map.get(name), Some(Mapping::Node(_))) {
                    if let Some(Mapping::Node(children)) = map.get_mut(name) {
                        children.insert(String::new(), leaf);
                    }
                } else {
                    map.insert(name.clone(), leaf);
                }
            }
            Some(rest) => {
                let entry = map
                    .entry(name.clone())
                    .or_insert_with(|| Mapping::Node(IndexMap::new()));
                // promote an earlier leaf to a section with an own value
                if let Mapping::Leaf(_) = entry {
                    let own = std::mem::replace(entry, Mapping::Node(IndexMap::new()));
                    if let Mapping::Node(children) = entry {
                        children.insert(String::new(), own);
                    }
                }
                entry.insert_path(rest, leaf);
            }
        }
    }
}

/// A read-only handle on one section of the tree.
#[derive(Clone, Copy)]
pub struct Section<'a> {
    config: &'a Config,
    id: NodeId,
}

impl fmt::Debug for Section<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Section")
            .field("key", &self.key())
            .field("valid", &self.valid())
            .field("dirty", &self.dirty())
            .finish()
    }
}

impl<'a> Section<'a> {
    fn node(&self) -> &'a Node {
        &self.config.nodes[self.id]
    }

    /// Last segment of the section's key; empty only for the root.
    pub fn name(&self) -> &'a str {
        &self.node().name
    }

    /// Full dotted key from the root; empty for the root.
    pub fn key(&self) -> &'a str {
        &self.node().key
    }

    /// The parent section, if this is not the root.
    pub fn parent(&self) -> Option<Section<'a>> {
        self.node().parent.map(|id| Section {
            config: self.config,
            id,
        })
    }

    /// True once the section has a value or a default.
    pub fn valid(&self) -> bool {
        self.node().valid()
    }

    /// True while the value differs from what was last persisted.
    pub fn dirty(&self) -> bool {
        self.node().dirty
    }

    /// True when no explicit value is set and a default exists.
    pub fn is_default(&self) -> bool {
        let node = self.node();
        node.value.is_none() && node.default.is_some()
    }

    /// The type descriptor, once established.
    pub fn kind(&self) -> Option<&'a Kind> {
        self.node().kind.as_ref()
    }

    /// The attached comment, if any.
    pub fn comment(&self) -> Option<&'a str> {
        self.node().comment.as_deref()
    }

    /// The effective raw string: the value if set, else the default.
    pub fn raw_value(&self) -> Option<&'a str> {
        self.node().raw()
    }

    /// The typed value.
    pub fn value(&self) -> Result<Value> {
        self.config.node_value(self.id)
    }

    /// True if the section has child sections.
    pub fn has_children(&self) -> bool {
        !self.node().children.is_empty()
    }

    /// Iterate child sections, optionally recursing depth-first and
    /// filtering to valid sections only.
    pub fn sections(&self, recurse: bool, only_valid: bool) -> Sections<'a> {
        let mut stack: Vec<NodeId> = self.node().children.values().copied().collect();
        stack.reverse();
        Sections {
            config: self.config,
            stack,
            recurse,
            only_valid,
        }
    }

    /// Iterate the valid keys under this section, relative to it. The
    /// section's own marker (the empty key) comes first when the section
    /// itself is valid.
    pub fn keys(&self) -> Keys<'a> {
        Keys {
            config: self.config,
            stack: vec![(self.id, String::new())],
        }
    }
}

/// Depth-first iterator over child sections.
pub struct Sections<'a> {
    config: &'a Config,
    stack: Vec<NodeId>,
    recurse: bool,
    only_valid: bool,
}

impl<'a> Iterator for Sections<'a> {
    type Item = Section<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.stack.pop() {
            if self.recurse {
                let node = &self.config.nodes[id];
                for &child in node.children.values().rev() {
                    self.stack.push(child);
                }
            }
            if !self.only_valid || self.config.nodes[id].valid() {
                return Some(Section {
                    config: self.config,
                    id,
                });
            }
        }
        None
    }
}

/// Depth-first iterator over valid keys.
pub struct Keys<'a> {
    config: &'a Config,
    /// Pending nodes with their keys relative to the iteration root.
    stack: Vec<(NodeId, String)>,
}

impl Iterator for Keys<'_> {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((id, key)) = self.stack.pop() {
            let node = &self.config.nodes[id];
            for (name, &child) in node.children.iter().rev() {
                let child_key = if key.is_empty() {
                    name.clone()
                } else {
                    format!("{}{}{}", key, self.config.separator, name)
                };
                self.stack.push((child, child_key));
            }
            if node.valid() && (id != ROOT || !key.is_empty()) {
                return Some(key);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coerce::Tag;
    use crate::sync::KeyFilter;

    #[test]
    fn initial_state() {
        let cfg = Config::new();
        assert!(cfg.sources().is_empty());
        assert_eq!(cfg.keys().count(), 0);
    }

    #[test]
    fn set_and_get() {
        let mut cfg = Config::new();
        cfg.set_value("a", 1).unwrap();
        assert_eq!(cfg.value("a").unwrap(), Value::Int(1));
        assert_eq!(cfg.get("a").unwrap(), Some(Value::Int(1)));
        assert_eq!(cfg.get("a.b").unwrap(), None);
    }

    #[test]
    fn keys_accept_segments() {
        let mut cfg = Config::new();
        cfg.set_value("a.a", 1).unwrap();
        cfg.set_value(&["a", "a"], 2).unwrap();
        assert_eq!(cfg.value("a.a").unwrap(), Value::Int(2));
        // empty segments are skipped
        assert_eq!(cfg.value("a..a").unwrap(), Value::Int(2));
    }

    #[test]
    fn missing_section_errors() {
        let cfg = Config::new();
        assert!(matches!(cfg.value("nope"), Err(Error::InvalidSection(_))));
    }

    #[test]
    fn value_without_default_errors() {
        let mut cfg = Config::new();
        cfg.set_value("a.b", 1).unwrap();
        // "a" exists structurally but has no value
        assert!(matches!(cfg.value("a"), Err(Error::NoValue(_))));
        assert!(matches!(cfg.default_value("a.b"), Err(Error::NoDefault(_))));
    }

    #[test]
    fn init_fixes_type_and_default() {
        let mut cfg = Config::new();
        cfg.init("a", 1).unwrap();
        assert_eq!(cfg.value("a").unwrap(), Value::Int(1));
        assert_eq!(cfg.default_value("a").unwrap(), Value::Int(1));
        assert!(cfg.section("a").unwrap().is_default());

        cfg.set_value("a", 2).unwrap();
        assert_eq!(cfg.value("a").unwrap(), Value::Int(2));
        assert_eq!(cfg.default_value("a").unwrap(), Value::Int(1));
        assert!(!cfg.section("a").unwrap().is_default());
    }

    #[test]
    fn delayed_init_converts_existing_value() {
        let mut cfg = Config::new();
        cfg.set_raw_value("a", "3").unwrap();
        assert_eq!(cfg.value("a").unwrap(), Value::Str("3".into()));

        cfg.init("a", 1).unwrap();
        assert_eq!(cfg.value("a").unwrap(), Value::Int(3));
        assert_eq!(cfg.default_value("a").unwrap(), Value::Int(1));
        assert_eq!(cfg.section("a").unwrap().kind(), Some(&Kind::Scalar(Tag::Int)));
    }

    #[test]
    fn init_incompatible_value_falls_back_to_default() {
        let mut cfg = Config::new();
        cfg.set_raw_value("a", "not a number").unwrap();
        cfg.init("a", 7).unwrap();
        assert_eq!(cfg.value("a").unwrap(), Value::Int(7));
        assert!(cfg.section("a").unwrap().is_default());
    }

    #[test]
    fn init_incompatible_value_raises_under_strict_policy() {
        let mut cfg = Config::with_options(Options {
            error_policy: ErrorPolicy::Raise,
            ..Options::default()
        })
        .unwrap();
        cfg.set_raw_value("a", "not a number").unwrap();
        assert!(cfg.init("a", 7).is_err());
    }

    #[test]
    fn type_is_sticky_after_first_set() {
        let mut cfg = Config::new();
        cfg.set_value("a", 1).unwrap();
        // the established int type adapts later writes
        assert!(cfg.set_value("a", "text").is_err());
        cfg.set_value("a", 5).unwrap();
        assert_eq!(cfg.value("a").unwrap(), Value::Int(5));
    }

    #[test]
    fn set_value_marks_dirty_and_read_does_not() {
        let mut cfg = Config::new();
        cfg.init("a", 1).unwrap();
        assert!(!cfg.section("a").unwrap().dirty());
        cfg.set_value("a", 2).unwrap();
        assert!(cfg.section("a").unwrap().dirty());
        cfg.set_dirty(&["a"], false).unwrap();
        assert!(!cfg.section("a").unwrap().dirty());
    }

    #[test]
    fn strict_mode_rejects_uninitialized_keys() {
        let mut cfg = Config::with_options(Options {
            strict: true,
            ..Options::default()
        })
        .unwrap();
        cfg.init("a", 1).unwrap();

        cfg.set_value("a", 3).unwrap();
        assert_eq!(cfg.value("a").unwrap(), Value::Int(3));
        assert!(matches!(cfg.set_value("b", 3), Err(Error::InvalidSection(_))));
        assert!(matches!(cfg.section("b"), Err(Error::InvalidSection(_))));
    }

    #[test]
    fn reset_reverts_to_default() {
        let mut cfg = Config::new();
        cfg.init("a", 1).unwrap();
        cfg.init("a.b", 2).unwrap();
        cfg.set_value("a", 10).unwrap();
        cfg.set_value("a.b", 20).unwrap();
        cfg.set_dirty(&["a", "a.b"], false).unwrap();

        cfg.reset("a").unwrap();
        assert_eq!(cfg.value("a").unwrap(), Value::Int(1));
        assert_eq!(cfg.value("a.b").unwrap(), Value::Int(2));
        assert!(cfg.section("a").unwrap().dirty());
        assert!(cfg.section("a.b").unwrap().dirty());
    }

    #[test]
    fn clean_reset_keeps_sections_clean() {
        let mut cfg = Config::new();
        cfg.init("a", 1).unwrap();
        cfg.set_value("a", 10).unwrap();
        cfg.set_dirty(&["a"], false).unwrap();
        cfg.reset_with("a", false, true).unwrap();
        assert!(!cfg.section("a").unwrap().dirty());
        assert_eq!(cfg.value("a").unwrap(), Value::Int(1));
    }

    #[test]
    fn reset_without_default_clears_type() {
        let mut cfg = Config::new();
        cfg.set_value("a", 1).unwrap();
        cfg.reset("a").unwrap();
        assert!(cfg.section("a").unwrap().kind().is_none());
        assert!(!cfg.section("a").unwrap().valid());
    }

    #[test]
    fn remove_drops_subtree() {
        let mut cfg = Config::new();
        cfg.set_value("a", 1).unwrap();
        cfg.set_value("a.b", 2).unwrap();
        cfg.set_value("c", 3).unwrap();

        cfg.remove("a").unwrap();
        assert!(cfg.section("a").is_err());
        assert!(cfg.section("a.b").is_err());
        assert_eq!(cfg.keys().collect::<Vec<_>>(), vec!["c".to_string()]);
    }

    #[test]
    fn keys_iterate_depth_first_in_insertion_order() {
        let mut cfg = Config::new();
        cfg.set_value("b", 1).unwrap();
        cfg.set_value("a", 1).unwrap();
        cfg.set_value("a.y", 1).unwrap();
        cfg.set_value("a.x", 1).unwrap();

        assert_eq!(cfg.keys().collect::<Vec<_>>(), ["b", "a", "a.y", "a.x"]);
    }

    #[test]
    fn section_keys_yield_own_marker_first() {
        let mut cfg = Config::new();
        cfg.set_value("a", 1).unwrap();
        cfg.set_value("a.b", 2).unwrap();
        cfg.set_value("a.b.c", 3).unwrap();

        let keys: Vec<String> = cfg.section("a").unwrap().keys().collect();
        assert_eq!(keys, ["", "b", "b.c"]);
    }

    #[test]
    fn sections_iteration() {
        let mut cfg = Config::new();
        cfg.set_value("a", 1).unwrap();
        cfg.set_value("a.b", 2).unwrap();
        cfg.set_value("c.d", 3).unwrap();

        let top: Vec<String> = cfg
            .sections(false, false)
            .map(|s| s.key().to_owned())
            .collect();
        assert_eq!(top, ["a", "c"]);

        let all_valid: Vec<String> = cfg
            .sections(true, true)
            .map(|s| s.key().to_owned())
            .collect();
        assert_eq!(all_valid, ["a", "a.b", "c.d"]);
    }

    #[test]
    fn flat_mapping_snapshot() {
        let mut cfg = Config::new();
        cfg.set_value("a", 1).unwrap();
        cfg.set_value("a.b", 2).unwrap();

        let flat = cfg.as_mapping(true, true, &KeyFilter::default()).unwrap();
        assert_eq!(flat.get("a").and_then(Mapping::as_value), Some(&Value::Int(1)));
        assert_eq!(flat.get("a.b").and_then(Mapping::as_value), Some(&Value::Int(2)));

        let raw = cfg.as_mapping(true, false, &KeyFilter::default()).unwrap();
        assert_eq!(
            raw.get("a").and_then(Mapping::as_value),
            Some(&Value::Str("1".into()))
        );
    }

    #[test]
    fn nested_mapping_uses_empty_key_for_own_value() {
        let mut cfg = Config::new();
        cfg.set_value("a", 1).unwrap();
        cfg.set_value("a.b", 2).unwrap();
        cfg.set_value("c", 3).unwrap();

        let nested = cfg.as_mapping(false, true, &KeyFilter::default()).unwrap();
        let a = nested.get("a").unwrap();
        assert_eq!(a.get("").and_then(Mapping::as_value), Some(&Value::Int(1)));
        assert_eq!(a.get("b").and_then(Mapping::as_value), Some(&Value::Int(2)));
        assert_eq!(nested.get("c").and_then(Mapping::as_value), Some(&Value::Int(3)));
    }

    #[test]
    fn cache_returns_memoized_values() {
        let mut cfg = Config::new();
        cfg.set_value("a", 1).unwrap();
        let _ = cfg.value("a").unwrap();
        assert!(cfg.nodes[cfg.find(&["a".to_owned()]).unwrap()]
            .cache
            .borrow()
            .is_some());

        // strings are never cached
        cfg.set_value("s", "text").unwrap();
        let _ = cfg.value("s").unwrap();
        assert!(cfg.nodes[cfg.find(&["s".to_owned()]).unwrap()]
            .cache
            .borrow()
            .is_none());
    }

    #[test]
    fn interpolation_eligible_values_are_not_cached() {
        let mut cfg = Config::with_options(Options {
            interpolate_values: true,
            ..Options::default()
        })
        .unwrap();
        cfg.set_value("a", 1).unwrap();
        cfg.init("b", 0).unwrap();
        cfg.set_raw_value("b", "{!a}").unwrap();

        assert_eq!(cfg.value("b").unwrap(), Value::Int(1));
        let id = cfg.find(&["b".to_owned()]).unwrap();
        assert!(cfg.nodes[id].cache.borrow().is_none());

        // the reference tracks its target
        cfg.set_value("a", 2).unwrap();
        assert_eq!(cfg.value("b").unwrap(), Value::Int(2));
    }

    #[test]
    fn caching_can_be_disabled() {
        let mut cfg = Config::with_options(Options {
            cache_values: false,
            ..Options::default()
        })
        .unwrap();
        cfg.set_value("a", 1).unwrap();
        let _ = cfg.value("a").unwrap();
        let id = cfg.find(&["a".to_owned()]).unwrap();
        assert!(cfg.nodes[id].cache.borrow().is_none());
    }

    #[test]
    fn coercion_can_be_disabled() {
        let mut cfg = Config::with_options(Options {
            coerce_values: false,
            ..Options::default()
        })
        .unwrap();
        cfg.set_value("a", 1).unwrap();
        assert_eq!(cfg.value("a").unwrap(), Value::Str("1".into()));
    }

    #[test]
    fn comments_attach_to_sections() {
        let mut cfg = Config::new();
        cfg.set_value("a", 1).unwrap();
        cfg.set_comment("a", "the a value").unwrap();
        assert_eq!(cfg.comment("a").unwrap().as_deref(), Some("the a value"));
    }

    #[test]
    fn unknown_format_name_errors() {
        let err = Config::with_options(Options {
            format: "marshmallow".to_owned(),
            ..Options::default()
        });
        assert!(matches!(err, Err(Error::UnknownFormat(_))));
    }

    #[test]
    fn custom_separator() {
        let mut cfg = Config::with_options(Options {
            separator: "/".to_owned(),
            ..Options::default()
        })
        .unwrap();
        cfg.set_value("a/b", 1).unwrap();
        assert_eq!(cfg.value("a/b").unwrap(), Value::Int(1));
        assert_eq!(cfg.section("a/b").unwrap().key(), "a/b");
    }
}
