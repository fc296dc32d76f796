//! The source synchronization engine.
//!
//! [`Config::sync`] reconciles the in-memory tree with its sources:
//!
//! 1. Every source is read in reverse priority order (the last listed source
//!    is read first), so earlier sources override later ones when merged. A
//!    section already marked dirty is never overwritten by a read - the
//!    local, not-yet-persisted change always wins.
//! 2. The valid keys under the syncing section are collected, scoped by the
//!    include/exclude [`KeyFilter`], into an export set of raw strings.
//! 3. The export set is handed to the [`Format`](crate::formats::Format)
//!    writer along with the layout context preserved from the first source,
//!    which regenerates that source's text in place.
//! 4. Every exported key is marked clean.
//!
//! Sources are either filesystem paths (parent directories are created on
//! write, `~` expands) or caller-supplied in-memory buffers, which are
//! rewound and truncated but never closed.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use indexmap::IndexMap;

use crate::config::{Config, Key, NodeId, ROOT};
use crate::formats::{Document, Export, FormatContext};
use crate::interp::Interpolator;
use crate::{Error, Result};

/// How source parse errors are reported.
///
/// Only parse errors are governed by this policy; coercion errors always
/// raise, since they indicate a data-integrity problem rather than a
/// malformed line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Raise the first error and abort the read.
    Raise,
    /// Log a warning and skip the offending record.
    #[default]
    Warn,
    /// Skip the offending record silently.
    Ignore,
}

/// A shared in-memory source buffer.
///
/// Clones share contents, so a buffer handed to a [`Config`] can be
/// inspected after a sync. Single-threaded, like everything else here.
#[derive(Clone, Default)]
pub struct SharedBuffer {
    contents: Rc<RefCell<Vec<u8>>>,
}

impl SharedBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// A buffer seeded with contents.
    pub fn with_contents(contents: impl Into<Vec<u8>>) -> Self {
        Self {
            contents: Rc::new(RefCell::new(contents.into())),
        }
    }

    /// A copy of the buffer's bytes.
    pub fn bytes(&self) -> Vec<u8> {
        self.contents.borrow().clone()
    }

    /// The buffer's contents as text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents.borrow()).into_owned()
    }

    /// Replace the buffer's contents.
    pub fn set_contents(&self, contents: impl Into<Vec<u8>>) {
        *self.contents.borrow_mut() = contents.into();
    }

    fn clear(&self) {
        self.contents.borrow_mut().clear();
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedBuffer({} bytes)", self.contents.borrow().len())
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.contents.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One external source of configuration data.
#[derive(Debug, Clone)]
pub enum Source {
    /// A filesystem path; `~` is expanded on open.
    Path(PathBuf),
    /// A caller-supplied in-memory buffer.
    Buffer(SharedBuffer),
}

impl Source {
    /// Name used in diagnostics and format errors.
    pub fn display_name(&self) -> String {
        match self {
            Source::Path(path) => path.display().to_string(),
            Source::Buffer(_) => "<buffer>".to_owned(),
        }
    }

    fn expanded_path(path: &Path) -> PathBuf {
        match path.to_str() {
            Some(text) => PathBuf::from(shellexpand::tilde(text).into_owned()),
            None => path.to_path_buf(),
        }
    }

    /// Open the source for reading. A path that does not exist yet yields
    /// `None` so reads can skip it.
    pub(crate) fn open_reader(&self) -> io::Result<Option<Box<dyn BufRead>>> {
        match self {
            Source::Path(path) => match File::open(Self::expanded_path(path)) {
                Ok(file) => Ok(Some(Box::new(BufReader::new(file)))),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(err) => Err(err),
            },
            Source::Buffer(buffer) => Ok(Some(Box::new(Cursor::new(buffer.bytes())))),
        }
    }

    /// Open the source for writing, truncating it. Parent directories of a
    /// path are created; a buffer is cleared in place.
    pub(crate) fn open_writer(&self) -> io::Result<Box<dyn Write>> {
        match self {
            Source::Path(path) => {
                let path = Self::expanded_path(path);
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    fs::create_dir_all(parent)?;
                }
                Ok(Box::new(BufWriter::new(File::create(path)?)))
            }
            Source::Buffer(buffer) => {
                buffer.clear();
                Ok(Box::new(buffer.clone()))
            }
        }
    }
}

impl From<&str> for Source {
    fn from(path: &str) -> Self {
        Source::Path(PathBuf::from(path))
    }
}

impl From<String> for Source {
    fn from(path: String) -> Self {
        Source::Path(PathBuf::from(path))
    }
}

impl From<&Path> for Source {
    fn from(path: &Path) -> Self {
        Source::Path(path.to_path_buf())
    }
}

impl From<PathBuf> for Source {
    fn from(path: PathBuf) -> Self {
        Source::Path(path)
    }
}

impl From<SharedBuffer> for Source {
    fn from(buffer: SharedBuffer) -> Self {
        Source::Buffer(buffer)
    }
}

/// Scope for [`default_source_path`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceScope {
    /// The user's configuration directory.
    User,
    /// The directory of the running executable.
    Executable,
}

/// A conventional location for a config file named `filename`.
pub fn default_source_path(filename: &str, scope: SourceScope) -> Option<PathBuf> {
    let base = match scope {
        SourceScope::User => dirs::config_dir()?,
        SourceScope::Executable => std::env::current_exe().ok()?.parent()?.to_path_buf(),
    };
    Some(base.join(filename))
}

/// Prefix-based key selection scoping a sync or snapshot to a subset of the
/// tree.
///
/// A key is included when the length of its longest matching prefix in the
/// include set exceeds the length of its longest matching prefix in the
/// exclude set. An empty include set admits every key that matches no
/// exclude prefix; two empty sets admit everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFilter {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl KeyFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an include prefix.
    pub fn include(mut self, prefix: impl Into<String>) -> Self {
        self.include.push(prefix.into());
        self
    }

    /// Add an exclude prefix.
    pub fn exclude(mut self, prefix: impl Into<String>) -> Self {
        self.exclude.push(prefix.into());
        self
    }

    /// True when the filter admits every key.
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// Rewrite the filter into root coordinates for a sync rooted at
    /// `base_key`, which is itself added to the include set.
    pub(crate) fn rebased(&self, base_key: &str, separator: &str) -> KeyFilter {
        let prefix = |p: &String| format!("{base_key}{separator}{p}");
        let mut include: Vec<String> = self.include.iter().map(prefix).collect();
        include.push(base_key.to_owned());
        KeyFilter {
            include,
            exclude: self.exclude.iter().map(prefix).collect(),
        }
    }

    /// Split the prefixes into segments and collapse redundant ones: when
    /// one prefix is a prefix of another in the same set, only the shorter
    /// is kept.
    pub(crate) fn compile(&self, separator: &str) -> CompiledFilter {
        let split = |prefixes: &[String]| -> Vec<Vec<String>> {
            let mut split: Vec<Vec<String>> = prefixes
                .iter()
                .map(|p| {
                    p.split(separator)
                        .filter(|s| !s.is_empty())
                        .map(str::to_owned)
                        .collect()
                })
                .collect();
            split.sort();
            split.dedup();
            let collapsed: Vec<Vec<String>> = split
                .iter()
                .filter(|candidate| {
                    !split.iter().any(|other| {
                        other.len() < candidate.len() && candidate[..other.len()] == other[..]
                    })
                })
                .cloned()
                .collect();
            collapsed
        };

        CompiledFilter {
            include: split(&self.include),
            exclude: split(&self.exclude),
        }
    }
}

/// A [`KeyFilter`] split into segments, ready for matching.
#[derive(Debug, Clone)]
pub(crate) struct CompiledFilter {
    include: Vec<Vec<String>>,
    exclude: Vec<Vec<String>>,
}

impl CompiledFilter {
    pub(crate) fn includes(&self, segments: &[String]) -> bool {
        if !self.include.is_empty() {
            Self::match_len(&self.include, segments) > Self::match_len(&self.exclude, segments)
        } else if !self.exclude.is_empty() {
            Self::match_len(&self.exclude, segments) == 0
        } else {
            true
        }
    }

    /// Length of the longest prefix matching `segments`.
    fn match_len(prefixes: &[Vec<String>], segments: &[String]) -> usize {
        prefixes
            .iter()
            .filter(|prefix| {
                segments.len() >= prefix.len() && segments[..prefix.len()] == prefix[..]
            })
            .map(Vec::len)
            .max()
            .unwrap_or(0)
    }
}

impl Config {
    /// Read every configured source and write the merged result back to the
    /// first one.
    pub fn sync(&mut self) -> Result<()> {
        let sources = self.sources.clone();
        self.sync_impl(&sources, ROOT, &KeyFilter::default())
    }

    /// [`Config::sync`] scoped by an include/exclude filter.
    pub fn sync_filtered(&mut self, filter: &KeyFilter) -> Result<()> {
        let sources = self.sources.clone();
        self.sync_impl(&sources, ROOT, filter)
    }

    /// Sync against an explicit source list instead of the configured one.
    pub fn sync_sources(&mut self, sources: &[Source]) -> Result<()> {
        self.sync_impl(sources, ROOT, &KeyFilter::default())
    }

    /// Sync only the subtree at `key`. Filter prefixes are interpreted
    /// relative to that section.
    pub fn sync_section<'k>(&mut self, key: impl Into<Key<'k>>, filter: &KeyFilter) -> Result<()> {
        let id = self.resolve(key)?;
        let rebased = if id == ROOT {
            filter.clone()
        } else {
            let base_key = self.nodes[id].key.clone();
            filter.rebased(&base_key, &self.separator)
        };
        let sources = self.sources.clone();
        self.sync_impl(&sources, id, &rebased)
    }

    /// Read and merge every configured source without writing anything
    /// back.
    pub fn read(&mut self) -> Result<()> {
        let sources = self.sources.clone();
        if sources.is_empty() {
            return Err(Error::NoSources);
        }
        self.read_impl(&sources).map(|_| ())
    }

    /// [`Config::read`] against an explicit source list.
    pub fn read_sources(&mut self, sources: &[Source]) -> Result<()> {
        if sources.is_empty() {
            return Err(Error::NoSources);
        }
        self.read_impl(sources).map(|_| ())
    }

    /// Write the tree to the first configured source without reading
    /// anything first. Layout from previous reads is not consulted.
    pub fn write(&mut self) -> Result<()> {
        let sources = self.sources.clone();
        let Some(first) = sources.first() else {
            return Err(Error::NoSources);
        };
        let export = self.collect_export(ROOT, &KeyFilter::default());
        self.write_impl(first, &export, None)
    }

    /// [`Config::write`] to an explicit source.
    pub fn write_to(&mut self, source: &Source) -> Result<()> {
        let export = self.collect_export(ROOT, &KeyFilter::default());
        self.write_impl(source, &export, None)
    }

    fn sync_impl(&mut self, sources: &[Source], base: NodeId, filter: &KeyFilter) -> Result<()> {
        if sources.is_empty() {
            return Err(Error::NoSources);
        }
        tracing::debug!(sources = sources.len(), "syncing configuration");

        let layout = self.read_impl(sources)?;
        let export = self.collect_export(base, filter);
        self.write_impl(&sources[0], &export, layout.as_deref())
    }

    /// Read sources in reverse priority order, merging into the tree.
    /// Returns the layout context of the first source.
    fn read_impl(&mut self, sources: &[Source]) -> Result<Option<Box<dyn Any>>> {
        let mut layout = None;
        let mut any_read = false;

        for (i, source) in sources.iter().enumerate().rev() {
            let doc = match self.read_source(source) {
                Ok(Some(doc)) => doc,
                Ok(None) => {
                    tracing::warn!(
                        source = %source.display_name(),
                        "source does not exist, skipping read",
                    );
                    continue;
                }
                Err(Error::Io(err)) => {
                    tracing::warn!(
                        source = %source.display_name(),
                        error = %err,
                        "failed to read source, skipping",
                    );
                    continue;
                }
                Err(err) => return Err(err),
            };

            any_read = true;
            let doc_layout = self.merge_document(doc)?;
            if i == 0 {
                layout = doc_layout;
            }
        }

        if !any_read {
            tracing::warn!("no configuration was read");
        }
        Ok(layout)
    }

    fn read_source(&self, source: &Source) -> Result<Option<Document>> {
        let Some(mut reader) = source.open_reader()? else {
            return Ok(None);
        };
        let ctx = self.format_context(source);
        let doc = self.format.read(reader.as_mut(), &ctx)?;
        Ok(Some(doc))
    }

    /// Merge a parsed document into the tree. Dirty sections keep their
    /// local value; everything merged is considered clean relative to
    /// storage.
    fn merge_document(&mut self, doc: Document) -> Result<Option<Box<dyn Any>>> {
        let Document {
            values,
            comments,
            layout,
        } = doc;

        for (key, value) in values {
            let segments = self.segments(key.as_str());
            let id = if self.strict {
                match self.find(&segments) {
                    Some(id) => id,
                    None => {
                        let joined = self.join(&segments);
                        match self.error_policy {
                            ErrorPolicy::Raise => return Err(Error::InvalidSection(joined)),
                            ErrorPolicy::Warn => {
                                tracing::warn!(key = %joined, "dropping unknown key from source");
                                continue;
                            }
                            ErrorPolicy::Ignore => continue,
                        }
                    }
                }
            } else {
                self.create(&segments)
            };

            if !self.nodes[id].dirty {
                // surface bad source data now rather than at first access;
                // interpolation-eligible values stay lazy since their
                // references may not be merged yet
                if self.coerce_values
                    && !Interpolator::eligible(&value)
                    && let (Some(coercer), Some(kind)) =
                        (self.coercer.as_ref(), self.nodes[id].kind.as_ref())
                {
                    coercer.convert(&value, kind)?;
                }
                let node = &mut self.nodes[id];
                node.value = Some(value);
                node.invalidate_cache();
            }
            if let Some(comment) = comments.get(&key) {
                self.nodes[id].comment = Some(comment.clone());
            }
        }
        Ok(layout)
    }

    /// Collect the filtered raw values and comments under `base`.
    fn collect_export(&self, base: NodeId, filter: &KeyFilter) -> Export {
        let compiled = filter.compile(&self.separator);
        let mut values = IndexMap::new();
        let mut comments = IndexMap::new();

        for (key, id) in self.walk_valid(base) {
            let segments = self.segments(key.as_str());
            if !compiled.includes(&segments) {
                continue;
            }
            let node = &self.nodes[id];
            values.insert(key.clone(), node.raw().unwrap_or_default().to_owned());
            if let Some(comment) = &node.comment {
                comments.insert(key, comment.clone());
            }
        }

        Export { values, comments }
    }

    fn write_impl(
        &mut self,
        source: &Source,
        export: &Export,
        layout: Option<&dyn Any>,
    ) -> Result<()> {
        let mut writer = source.open_writer()?;
        let ctx = self.format_context(source);
        self.format.write(writer.as_mut(), export, layout, &ctx)?;
        writer.flush()?;
        drop(writer);

        // successful persistence: every exported key is now clean
        for key in export.values.keys() {
            let segments = self.segments(key.as_str());
            if let Some(id) = self.find(&segments) {
                self.nodes[id].dirty = false;
            }
        }
        Ok(())
    }

    fn format_context(&self, source: &Source) -> FormatContext {
        FormatContext {
            separator: self.separator.clone(),
            policy: self.error_policy,
            source: source.display_name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn segments(key: &str) -> Vec<String> {
        key.split('.').map(str::to_owned).collect()
    }

    #[test]
    fn empty_filter_admits_everything() {
        let filter = KeyFilter::default().compile(".");
        assert!(filter.includes(&segments("a")));
        assert!(filter.includes(&segments("a.b.c")));
    }

    #[test]
    fn include_precedence() {
        let filter = KeyFilter::new().include("a").compile(".");
        assert!(filter.includes(&segments("a")));
        assert!(filter.includes(&segments("a.a")));
        assert!(filter.includes(&segments("a.b")));
        assert!(!filter.includes(&segments("b.a")));
    }

    #[test]
    fn exclude_only() {
        let filter = KeyFilter::new().exclude("b").compile(".");
        assert!(filter.includes(&segments("a")));
        assert!(filter.includes(&segments("a.b")));
        assert!(!filter.includes(&segments("b")));
        assert!(!filter.includes(&segments("b.a")));
    }

    #[test]
    fn longer_match_wins_across_sets() {
        let filter = KeyFilter::new().include("a.b").exclude("a").compile(".");
        assert!(filter.includes(&segments("a.b.c")));
        assert!(!filter.includes(&segments("a.c")));
        // equal lengths: exclude wins
        let filter = KeyFilter::new().include("a").exclude("a").compile(".");
        assert!(!filter.includes(&segments("a.x")));
    }

    #[test]
    fn redundant_prefixes_collapse_to_the_shorter() {
        let filter = KeyFilter::new().include("a").include("a.b").compile(".");
        assert_eq!(filter.include, vec![segments("a")]);
    }

    #[test]
    fn rebase_prefixes_and_includes_base() {
        let filter = KeyFilter::new().include("x").exclude("y");
        let rebased = filter.rebased("base", ".");
        assert_eq!(
            rebased,
            KeyFilter {
                include: vec!["base.x".to_owned(), "base".to_owned()],
                exclude: vec!["base.y".to_owned()],
            }
        );
    }

    #[test]
    fn shared_buffer_round_trip() {
        let buffer = SharedBuffer::with_contents("hello");
        assert_eq!(buffer.text(), "hello");

        let source = Source::from(buffer.clone());
        let mut writer = source.open_writer().unwrap();
        writer.write_all(b"rewritten").unwrap();
        writer.flush().unwrap();
        drop(writer);
        assert_eq!(buffer.text(), "rewritten");

        let mut reader = source.open_reader().unwrap().unwrap();
        let mut contents = String::new();
        reader.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "rewritten");
    }

    #[test]
    fn missing_path_reads_as_none() {
        let source = Source::from("/definitely/not/a/real/figtree/source.cfg");
        assert!(source.open_reader().unwrap().is_none());
    }
}
