//! Figtree - a hierarchical key/value configuration store.
//!
//! Figtree keeps an in-memory tree of dotted-key settings in sync with one or
//! more external sources (files or in-memory buffers) while preserving each
//! source's original formatting - comments, ordering, and section grouping -
//! when it writes changes back.
//!
//! ```no_run
//! use figtree::Config;
//!
//! let mut cfg = Config::new();
//! cfg.add_source("server.cfg");
//! cfg.init("server.host", "8.8.8.8").unwrap();
//! cfg.init("server.port", 8181).unwrap();
//! cfg.sync().unwrap();
//! ```
//!
//! ## Model
//!
//! - Keys are dotted paths (`server.port`) resolving to [`Section`]s of a
//!   tree rooted at a [`Config`]. Sections are created lazily on first write.
//! - Values are stored as strings; a [`Coercer`] converts between typed
//!   [`Value`]s and their string form, driven by a [`Kind`] descriptor fixed
//!   the first time a section sees a value or default.
//! - [`Config::sync`] reads every configured source in reverse priority
//!   order, merges values into the tree (a locally modified, *dirty* section
//!   is never overwritten), and writes the tree back to the first source
//!   through its [`Format`].
//! - String values may reference other keys with `{!key}` syntax when
//!   interpolation is enabled; reference cycles are detected and rejected.
//!
//! ## Threading
//!
//! A `Config` is a single-threaded object: nothing in it locks, suspends, or
//! shares. Callers that want to drive one instance from several threads must
//! serialize access themselves.

pub mod coerce;
pub mod config;
pub mod formats;
pub mod interp;
pub mod sync;

pub use coerce::{CoerceError, Coercer, Kind, Tag, Value};
pub use config::{Config, Key, Mapping, Options, Section};
pub use formats::{
    Document, Export, Format, FormatContext, FormatError, IniFormat, JsonFormat, format_by_name,
    known_formats, register_format,
};
pub use interp::{InterpolationError, Interpolator};
pub use sync::{ErrorPolicy, KeyFilter, SharedBuffer, Source, SourceScope, default_source_path};

/// Library-level error type for figtree operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid section: `{0}`")]
    InvalidSection(String),

    #[error("no value set for `{0}`")]
    NoValue(String),

    #[error("no default value set for `{0}`")]
    NoDefault(String),

    #[error("unknown format: `{0}`")]
    UnknownFormat(String),

    #[error("no sources to sync with")]
    NoSources,

    #[error(transparent)]
    Coerce(#[from] coerce::CoerceError),

    #[error(transparent)]
    Interpolation(#[from] interp::InterpolationError),

    #[error(transparent)]
    Format(#[from] formats::FormatError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for figtree operations.
pub type Result<T> = std::result::Result<T, Error>;
