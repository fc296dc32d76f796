//! The format contract and the built-in formats.
//!
//! A [`Format`] converts between a source's external representation and a
//! flat, insertion-ordered map of string keys to string values. Reading may
//! also produce an opaque *layout context* - whatever structural information
//! (line order, comments, section grouping) the format needs to regenerate
//! the source text in place. The sync engine threads the layout of the
//! first source from read to write; a format handed no layout, or a foreign
//! one, falls back to emitting the export set in order.
//!
//! Formats are looked up by name through an explicit registration table
//! seeded with the built-ins:
//!
//! - `"ini"` - [`IniFormat`], comment- and order-preserving
//! - `"json"` - [`JsonFormat`]
//!
//! Additional formats register with [`register_format`].

mod ini;
mod json;

pub use ini::IniFormat;
pub use json::JsonFormat;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io::{BufRead, Write};
use std::sync::{Mutex, OnceLock};

use indexmap::IndexMap;

use crate::Result;
use crate::sync::ErrorPolicy;

/// Error for malformed source text, carrying the source name and offending
/// line when available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatError {
    pub message: String,
    pub file: Option<String>,
    pub line: Option<usize>,
    pub text: Option<String>,
}

impl FormatError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            file: None,
            line: None,
            text: None,
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "error reading '{file}'")?,
            None => write!(f, "read error")?,
        }
        if let Some(line) = self.line {
            write!(f, ", line {line}")?;
        }
        write!(f, ": {}", self.message)?;
        if let Some(text) = &self.text {
            write!(f, "\n  {text}")?;
        }
        Ok(())
    }
}

impl std::error::Error for FormatError {}

/// The parse result of one source.
#[derive(Default)]
pub struct Document {
    /// Flat key -> raw string values, in source order.
    pub values: IndexMap<String, String>,
    /// Comments keyed by the key they annotate.
    pub comments: IndexMap<String, String>,
    /// Opaque structural context for regenerating the source.
    pub layout: Option<Box<dyn Any>>,
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("values", &self.values)
            .field("comments", &self.comments)
            .field("layout", &self.layout.as_ref().map(|_| "..."))
            .finish()
    }
}

/// The write input: the filtered raw values and comments of the tree.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Export {
    /// Flat key -> raw string values, in tree order.
    pub values: IndexMap<String, String>,
    /// Comments keyed by the key they annotate.
    pub comments: IndexMap<String, String>,
}

/// Per-call context handed to format readers and writers.
#[derive(Debug, Clone)]
pub struct FormatContext {
    /// The key path separator of the owning config.
    pub separator: String,
    /// How parse errors are reported.
    pub policy: ErrorPolicy,
    /// Display name of the source being processed.
    pub source: String,
}

impl FormatContext {
    /// Route a parse error through the configured policy. Only
    /// [`ErrorPolicy::Raise`] aborts the read.
    pub fn report(&self, error: FormatError) -> Result<()> {
        let error = error.with_file(self.source.clone());
        match self.policy {
            ErrorPolicy::Raise => Err(error.into()),
            ErrorPolicy::Warn => {
                tracing::warn!("{error}");
                Ok(())
            }
            ErrorPolicy::Ignore => Ok(()),
        }
    }
}

/// Conversion between a flat string map and an external representation.
pub trait Format {
    /// The format's registered name.
    fn name(&self) -> &'static str;

    /// Parse a source into values, comments, and a layout context.
    fn read(&self, reader: &mut dyn BufRead, ctx: &FormatContext) -> Result<Document>;

    /// Regenerate the source from the export set, splicing changed values
    /// into the positions recorded in `layout`. Pre-existing keys keep
    /// their order; new keys append after the last element of their owning
    /// block, new blocks at the end.
    fn write(
        &self,
        writer: &mut dyn Write,
        export: &Export,
        layout: Option<&dyn Any>,
        ctx: &FormatContext,
    ) -> Result<()>;
}

/// Constructor registered for a format name.
pub type FormatConstructor = fn() -> Box<dyn Format>;

fn registry() -> &'static Mutex<HashMap<String, FormatConstructor>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, FormatConstructor>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut table: HashMap<String, FormatConstructor> = HashMap::new();
        table.insert("ini".to_owned(), || Box::new(IniFormat::new()));
        table.insert("json".to_owned(), || Box::new(JsonFormat::new()));
        Mutex::new(table)
    })
}

/// Register a format constructor under a name, replacing any previous
/// registration.
pub fn register_format(name: impl Into<String>, constructor: FormatConstructor) {
    registry()
        .lock()
        .expect("format registry poisoned")
        .insert(name.into(), constructor);
}

/// Instantiate a format by registered name.
pub fn format_by_name(name: &str) -> Option<Box<dyn Format>> {
    let table = registry().lock().expect("format registry poisoned");
    table.get(name).map(|constructor| constructor())
}

/// The names of all registered formats.
pub fn known_formats() -> Vec<String> {
    let table = registry().lock().expect("format registry poisoned");
    let mut names: Vec<String> = table.keys().cloned().collect();
    names.sort();
    names
}
