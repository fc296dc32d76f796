//! Type coercion between typed values and their string form.
//!
//! A [`Coercer`] is an open registry mapping a [`Kind`] descriptor to a pair
//! of functions: an *adapter* (value to string) and a *converter* (string to
//! value). Descriptors are either a single [`Tag`] or an ordered tuple of
//! tags describing a composite such as `(list, path)` - a list whose scalar
//! representation is a path.
//!
//! Composite descriptors resolve in a fixed order:
//!
//! 1. An adapter/converter registered for the *whole* composite.
//! 2. The container registration for the first tag, applying the remaining
//!    tags cyclically to each element (`str` if none are given).
//! 3. The registered fallback, if any.
//! 4. [`CoerceError::NotRegistered`].
//!
//! Every default registration can be overridden; swapping out the boolean
//! converter for a stricter one is a one-liner:
//!
//! ```
//! use figtree::coerce::{Coercer, Kind, Tag, Value};
//!
//! let mut coercer = Coercer::new();
//! coercer.register_converter(Kind::Scalar(Tag::Bool), |s| match s {
//!     "true" => Ok(Value::Bool(true)),
//!     "false" => Ok(Value::Bool(false)),
//!     other => Err(format!("not a boolean: `{other}`").into()),
//! });
//! ```

use std::collections::HashMap;
use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use thiserror::Error;

/// Delimiter for the `path_*` family of coercers.
#[cfg(windows)]
pub const PATH_DELIMITER: char = ';';
/// Delimiter for the `path_*` family of coercers.
#[cfg(not(windows))]
pub const PATH_DELIMITER: char = ':';

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S%.6f";
const TIME_PARSE_FORMAT: &str = "%H:%M:%S%.f";
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
const DATETIME_PARSE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Error type carried by user-supplied adapters and converters.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Adapter function: typed value to string.
pub type AdaptFn = Box<dyn Fn(&Value) -> Result<String, BoxError>>;

/// Converter function: string to typed value.
pub type ConvertFn = Box<dyn Fn(&str) -> Result<Value, BoxError>>;

/// Errors raised while adapting or converting values.
#[derive(Debug, Error)]
pub enum CoerceError {
    /// An adapter rejected the value.
    #[error("cannot adapt value: {0}")]
    Adapt(#[source] BoxError),

    /// A converter rejected the string.
    #[error("cannot convert string: {0}")]
    Convert(#[source] BoxError),

    /// No adapter or converter is registered for the descriptor.
    #[error("no {role} registered for `{kind}`")]
    NotRegistered { role: &'static str, kind: String },
}

/// A single type tag: one element of a type descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Tag {
    None,
    Bool,
    Int,
    Float,
    Complex,
    Str,
    Bytes,
    Date,
    Time,
    DateTime,
    List,
    Set,
    /// A named tag such as `"path"`, `"hex"`, or `"path_list"`.
    Named(String),
}

impl Tag {
    /// Build a named tag.
    pub fn named(name: impl Into<String>) -> Self {
        Tag::Named(name.into())
    }

    fn name(&self) -> &str {
        match self {
            Tag::None => "none",
            Tag::Bool => "bool",
            Tag::Int => "int",
            Tag::Float => "float",
            Tag::Complex => "complex",
            Tag::Str => "str",
            Tag::Bytes => "bytes",
            Tag::Date => "date",
            Tag::Time => "time",
            Tag::DateTime => "datetime",
            Tag::List => "list",
            Tag::Set => "set",
            Tag::Named(name) => name,
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<&str> for Tag {
    fn from(name: &str) -> Self {
        Tag::Named(name.to_owned())
    }
}

/// A type descriptor: a single tag or an ordered tuple of tags.
///
/// The first tag of a composite names the container; the remaining tags are
/// applied cyclically to its elements.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Kind {
    Scalar(Tag),
    Composite(Vec<Tag>),
}

impl Kind {
    /// Shorthand for a homogeneous list composite.
    pub fn list_of(element: impl Into<Tag>) -> Self {
        Kind::Composite(vec![Tag::List, element.into()])
    }

    /// Shorthand for a homogeneous set composite.
    pub fn set_of(element: impl Into<Tag>) -> Self {
        Kind::Composite(vec![Tag::Set, element.into()])
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Scalar(tag) => tag.fmt(f),
            Kind::Composite(tags) => {
                f.write_str("(")?;
                for (i, tag) in tags.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    tag.fmt(f)?;
                }
                f.write_str(")")
            }
        }
    }
}

impl From<Tag> for Kind {
    fn from(tag: Tag) -> Self {
        Kind::Scalar(tag)
    }
}

impl From<&str> for Kind {
    fn from(name: &str) -> Self {
        Kind::Scalar(Tag::named(name))
    }
}

/// A typed configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// A complex number, rendered as `re+imi` (e.g. `1.5-2i`).
    Complex(f64, f64),
    Str(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    List(Vec<Value>),
}

impl Value {
    /// The tag matching this value's runtime variant.
    pub fn tag(&self) -> Tag {
        match self {
            Value::None => Tag::None,
            Value::Bool(_) => Tag::Bool,
            Value::Int(_) => Tag::Int,
            Value::Float(_) => Tag::Float,
            Value::Complex(..) => Tag::Complex,
            Value::Str(_) => Tag::Str,
            Value::Bytes(_) => Tag::Bytes,
            Value::Date(_) => Tag::Date,
            Value::Time(_) => Tag::Time,
            Value::DateTime(_) => Tag::DateTime,
            Value::List(_) => Tag::List,
        }
    }

    /// The descriptor inferred from this value's runtime variant.
    ///
    /// Lists infer a bare `(list,)` composite, so elements default to `str`.
    pub fn kind(&self) -> Kind {
        match self {
            Value::List(_) => Kind::Composite(vec![Tag::List]),
            other => Kind::Scalar(other.tag()),
        }
    }

    /// Build a list value from anything convertible to values.
    pub fn list<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Value::List(items.into_iter().map(Into::into).collect())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

/// Canonical rendering, used when coercion is disabled.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => Ok(()),
            Value::Bool(b) => write!(f, "{}", if *b { "true" } else { "false" }),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Complex(re, im) => write!(f, "{}", format_complex(*re, *im)),
            Value::Str(s) => f.write_str(s),
            Value::Bytes(b) => f.write_str(&hex::encode(b)),
            Value::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
            Value::Time(t) => write!(f, "{}", t.format(TIME_FORMAT)),
            Value::DateTime(dt) => write!(f, "{}", dt.format(DATETIME_FORMAT)),
            Value::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    item.fmt(f)?;
                }
                Ok(())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}

impl From<NaiveTime> for Value {
    fn from(t: NaiveTime) -> Self {
        Value::Time(t)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(dt: NaiveDateTime) -> Self {
        Value::DateTime(dt)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

/// Split/join/collect operations for one container tag.
struct ContainerOps {
    join: Box<dyn Fn(Vec<String>) -> String>,
    split: Box<dyn Fn(&str) -> Vec<String>>,
    collect: Box<dyn Fn(Vec<Value>) -> Value>,
}

/// The coercion registry.
///
/// [`Coercer::new`] seeds the default registrations; [`Coercer::empty`]
/// starts blank for callers that want full control.
pub struct Coercer {
    adapters: HashMap<Kind, AdaptFn>,
    converters: HashMap<Kind, ConvertFn>,
    containers: HashMap<Tag, ContainerOps>,
    adapt_fallback: Option<AdaptFn>,
    convert_fallback: Option<ConvertFn>,
}

impl Default for Coercer {
    fn default() -> Self {
        Self::new()
    }
}

impl Coercer {
    /// A coercer with the default registrations.
    pub fn new() -> Self {
        let mut coercer = Self::empty();
        register_defaults(&mut coercer);
        coercer
    }

    /// A coercer with no registrations at all.
    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
            converters: HashMap::new(),
            containers: HashMap::new(),
            adapt_fallback: None,
            convert_fallback: None,
        }
    }

    /// Register an adapter and a converter for a descriptor.
    pub fn register<A, C>(&mut self, kind: impl Into<Kind>, adapter: A, converter: C)
    where
        A: Fn(&Value) -> Result<String, BoxError> + 'static,
        C: Fn(&str) -> Result<Value, BoxError> + 'static,
    {
        let kind = kind.into();
        self.register_adapter(kind.clone(), adapter);
        self.register_converter(kind, converter);
    }

    /// Register an adapter (value to string) for a descriptor.
    pub fn register_adapter<A>(&mut self, kind: impl Into<Kind>, adapter: A)
    where
        A: Fn(&Value) -> Result<String, BoxError> + 'static,
    {
        self.adapters.insert(kind.into(), Box::new(adapter));
    }

    /// Register a converter (string to value) for a descriptor.
    pub fn register_converter<C>(&mut self, kind: impl Into<Kind>, converter: C)
    where
        C: Fn(&str) -> Result<Value, BoxError> + 'static,
    {
        self.converters.insert(kind.into(), Box::new(converter));
    }

    /// Register split/join behavior for a container tag.
    ///
    /// `join` combines adapted element strings, `split` breaks a raw string
    /// into element strings, and `collect` assembles converted elements into
    /// the final value.
    pub fn register_container<J, S, C>(&mut self, tag: Tag, join: J, split: S, collect: C)
    where
        J: Fn(Vec<String>) -> String + 'static,
        S: Fn(&str) -> Vec<String> + 'static,
        C: Fn(Vec<Value>) -> Value + 'static,
    {
        self.containers.insert(
            tag,
            ContainerOps {
                join: Box::new(join),
                split: Box::new(split),
                collect: Box::new(collect),
            },
        );
    }

    /// Register an adapter/converter pair that enforces membership in a
    /// fixed enumeration. `choices` maps each permitted value to its string
    /// form; anything else is rejected in both directions.
    pub fn register_choice<I, S>(&mut self, kind: impl Into<Kind>, choices: I)
    where
        I: IntoIterator<Item = (Value, S)>,
        S: Into<String>,
    {
        let pairs: Vec<(Value, String)> = choices
            .into_iter()
            .map(|(value, text)| (value, text.into()))
            .collect();
        let kind = kind.into();

        let adapt_pairs = pairs.clone();
        self.register_adapter(kind.clone(), move |value| {
            adapt_pairs
                .iter()
                .find(|(choice, _)| choice == value)
                .map(|(_, text)| text.clone())
                .ok_or_else(|| invalid_choice(value, adapt_pairs.iter().map(|(c, _)| c)))
        });

        self.register_converter(kind, move |text| {
            pairs
                .iter()
                .find(|(_, choice)| choice == text)
                .map(|(value, _)| value.clone())
                .ok_or_else(|| invalid_choice(&text, pairs.iter().map(|(_, c)| c)))
        });
    }

    /// Set the adapter used when no registration matches.
    pub fn set_adapt_fallback<A>(&mut self, adapter: A)
    where
        A: Fn(&Value) -> Result<String, BoxError> + 'static,
    {
        self.adapt_fallback = Some(Box::new(adapter));
    }

    /// Set the converter used when no registration matches.
    pub fn set_convert_fallback<C>(&mut self, converter: C)
    where
        C: Fn(&str) -> Result<Value, BoxError> + 'static,
    {
        self.convert_fallback = Some(Box::new(converter));
    }

    /// Remove the adapter for a descriptor.
    pub fn unregister_adapter(&mut self, kind: &Kind) {
        self.adapters.remove(kind);
    }

    /// Remove the converter for a descriptor.
    pub fn unregister_converter(&mut self, kind: &Kind) {
        self.converters.remove(kind);
    }

    /// Remove every registration, including fallbacks and containers.
    pub fn clear(&mut self) {
        self.adapters.clear();
        self.converters.clear();
        self.containers.clear();
        self.adapt_fallback = None;
        self.convert_fallback = None;
    }

    /// Adapt a value to its string form. With no descriptor given, the
    /// value's runtime variant picks one.
    pub fn adapt(&self, value: &Value, kind: Option<&Kind>) -> Result<String, CoerceError> {
        let inferred;
        let kind = match kind {
            Some(kind) => kind,
            None => {
                inferred = value.kind();
                &inferred
            }
        };

        if let Some(adapter) = self.adapters.get(kind) {
            return adapter(value).map_err(CoerceError::Adapt);
        }

        if let Kind::Composite(tags) = kind
            && let Some((container, elements)) = tags.split_first()
            && let Some(ops) = self.containers.get(container)
        {
            let items = value.as_list().ok_or_else(|| {
                CoerceError::Adapt(format!("`{kind}` expects a list value").into())
            })?;
            let element_kinds = element_kinds(elements);
            let mut parts = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                parts.push(self.adapt(item, Some(&element_kinds[i % element_kinds.len()]))?);
            }
            return Ok((ops.join)(parts));
        }

        if let Some(fallback) = &self.adapt_fallback {
            return fallback(value).map_err(CoerceError::Adapt);
        }

        Err(CoerceError::NotRegistered {
            role: "adapter",
            kind: kind.to_string(),
        })
    }

    /// Convert a string to a typed value for the given descriptor.
    pub fn convert(&self, text: &str, kind: &Kind) -> Result<Value, CoerceError> {
        if let Some(converter) = self.converters.get(kind) {
            return converter(text).map_err(CoerceError::Convert);
        }

        if let Kind::Composite(tags) = kind
            && let Some((container, elements)) = tags.split_first()
            && let Some(ops) = self.containers.get(container)
        {
            let element_kinds = element_kinds(elements);
            let mut items = Vec::new();
            for (i, part) in (ops.split)(text).into_iter().enumerate() {
                items.push(self.convert(&part, &element_kinds[i % element_kinds.len()])?);
            }
            return Ok((ops.collect)(items));
        }

        if let Some(fallback) = &self.convert_fallback {
            return fallback(text).map_err(CoerceError::Convert);
        }

        Err(CoerceError::NotRegistered {
            role: "converter",
            kind: kind.to_string(),
        })
    }
}

/// Element descriptors for a composite, defaulting to `str`.
fn element_kinds(elements: &[Tag]) -> Vec<Kind> {
    if elements.is_empty() {
        vec![Kind::Scalar(Tag::Str)]
    } else {
        elements.iter().cloned().map(Kind::Scalar).collect()
    }
}

fn invalid_choice<'a, T: fmt::Display + 'a>(
    value: &impl fmt::Display,
    choices: impl Iterator<Item = &'a T>,
) -> BoxError {
    let rendered: Vec<String> = choices.map(|c| c.to_string()).collect();
    format!(
        "invalid choice `{value}`, must be one of: {}",
        rendered.join(", ")
    )
    .into()
}

fn format_complex(re: f64, im: f64) -> String {
    if im.is_sign_negative() {
        format!("{re}{im}i")
    } else {
        format!("{re}+{im}i")
    }
}

fn parse_complex(text: &str) -> Result<Value, BoxError> {
    let text = text.trim();
    let body = match text.strip_suffix(['i', 'j']) {
        Some(body) => body,
        None => return Ok(Value::Complex(text.parse::<f64>()?, 0.0)),
    };

    // Find the sign separating the real and imaginary parts. Skip the
    // leading sign and any sign belonging to an exponent.
    let split = body
        .char_indices()
        .skip(1)
        .filter(|(i, c)| {
            (*c == '+' || *c == '-')
                && !matches!(body.as_bytes().get(i - 1), Some(b'e') | Some(b'E'))
        })
        .map(|(i, _)| i)
        .last();

    match split {
        Some(i) => Ok(Value::Complex(
            body[..i].trim().parse::<f64>()?,
            body[i..].trim().parse::<f64>()?,
        )),
        None => Ok(Value::Complex(0.0, body.trim().parse::<f64>()?)),
    }
}

fn split_list(text: &str) -> Vec<String> {
    if text.is_empty() {
        Vec::new()
    } else {
        text.split(',').map(|part| part.trim().to_owned()).collect()
    }
}

fn split_paths(text: &str) -> Vec<String> {
    if text.is_empty() {
        Vec::new()
    } else {
        text.split(PATH_DELIMITER).map(str::to_owned).collect()
    }
}

fn dedup_preserving_order(items: Vec<Value>) -> Vec<Value> {
    let mut unique: Vec<Value> = Vec::with_capacity(items.len());
    for item in items {
        if !unique.contains(&item) {
            unique.push(item);
        }
    }
    unique
}

fn expect_str(value: &Value) -> Result<String, BoxError> {
    value
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| format!("expected a string value, got `{}`", value.tag()).into())
}

fn string_items(value: &Value) -> Result<Vec<String>, BoxError> {
    let items = value
        .as_list()
        .ok_or_else(|| BoxError::from(format!("expected a list value, got `{}`", value.tag())))?;
    items.iter().map(expect_str).collect()
}

/// Registers adapters and converters for the common types.
pub fn register_defaults(coercer: &mut Coercer) {
    // `none` renders as the empty string
    coercer.register(
        Tag::None,
        |_| Ok(String::new()),
        |_| Ok(Value::None),
    );

    coercer.register(
        Tag::Bool,
        |value| match value {
            Value::Bool(b) => Ok(if *b { "true" } else { "false" }.to_owned()),
            other => Err(format!("expected a boolean value, got `{}`", other.tag()).into()),
        },
        |text| match text.to_lowercase().as_str() {
            "1" | "yes" | "true" | "on" => Ok(Value::Bool(true)),
            "0" | "no" | "false" | "off" => Ok(Value::Bool(false)),
            other => Err(format!("not a boolean: `{other}`").into()),
        },
    );

    coercer.register(
        Tag::Int,
        |value| match value {
            Value::Int(i) => Ok(i.to_string()),
            other => Err(format!("expected an integer value, got `{}`", other.tag()).into()),
        },
        |text| Ok(Value::Int(text.trim().parse::<i64>()?)),
    );

    coercer.register(
        Tag::Float,
        |value| match value {
            Value::Float(x) => Ok(x.to_string()),
            other => Err(format!("expected a float value, got `{}`", other.tag()).into()),
        },
        |text| Ok(Value::Float(text.trim().parse::<f64>()?)),
    );

    coercer.register(
        Tag::Complex,
        |value| match value {
            Value::Complex(re, im) => Ok(format_complex(*re, *im)),
            other => Err(format!("expected a complex value, got `{}`", other.tag()).into()),
        },
        parse_complex,
    );

    coercer.register(Tag::Str, expect_str, |text| Ok(Value::Str(text.to_owned())));

    // `path` elements are plain strings; the tag exists so path composites
    // can name their scalar representation
    coercer.register(
        Tag::named("path"),
        expect_str,
        |text| Ok(Value::Str(text.to_owned())),
    );

    // byte sequences default to their hex encoding
    let adapt_hex = |value: &Value| -> Result<String, BoxError> {
        match value {
            Value::Bytes(b) => Ok(hex::encode(b)),
            other => Err(format!("expected a bytes value, got `{}`", other.tag()).into()),
        }
    };
    let convert_hex =
        |text: &str| -> Result<Value, BoxError> { Ok(Value::Bytes(hex::decode(text.trim())?)) };
    coercer.register(Tag::Bytes, adapt_hex, convert_hex);
    coercer.register(Tag::named("hex"), adapt_hex, convert_hex);

    coercer.register(
        Tag::named("base64"),
        |value| match value {
            Value::Bytes(b) => Ok(BASE64.encode(b)),
            other => Err(format!("expected a bytes value, got `{}`", other.tag()).into()),
        },
        |text| Ok(Value::Bytes(BASE64.decode(text.trim())?)),
    );

    coercer.register(
        Tag::Date,
        |value| match value {
            Value::Date(d) => Ok(d.format(DATE_FORMAT).to_string()),
            other => Err(format!("expected a date value, got `{}`", other.tag()).into()),
        },
        |text| Ok(Value::Date(NaiveDate::parse_from_str(text.trim(), DATE_FORMAT)?)),
    );

    coercer.register(
        Tag::Time,
        |value| match value {
            Value::Time(t) => Ok(t.format(TIME_FORMAT).to_string()),
            other => Err(format!("expected a time value, got `{}`", other.tag()).into()),
        },
        |text| {
            Ok(Value::Time(NaiveTime::parse_from_str(
                text.trim(),
                TIME_PARSE_FORMAT,
            )?))
        },
    );

    coercer.register(
        Tag::DateTime,
        |value| match value {
            Value::DateTime(dt) => Ok(dt.format(DATETIME_FORMAT).to_string()),
            other => Err(format!("expected a datetime value, got `{}`", other.tag()).into()),
        },
        |text| {
            Ok(Value::DateTime(NaiveDateTime::parse_from_str(
                text.trim(),
                DATETIME_PARSE_FORMAT,
            )?))
        },
    );

    // collection containers, comma delimited
    coercer.register_container(
        Tag::List,
        |parts| parts.join(", "),
        split_list,
        Value::List,
    );
    coercer.register_container(
        Tag::Set,
        |parts| {
            let mut parts = parts;
            parts.sort();
            parts.dedup();
            parts.join(", ")
        },
        split_list,
        |items| Value::List(dedup_preserving_order(items)),
    );

    // path collections, delimited like the OS path list
    let adapt_path_list = |value: &Value| -> Result<String, BoxError> {
        Ok(string_items(value)?.join(&PATH_DELIMITER.to_string()))
    };
    let convert_path_list =
        |text: &str| -> Result<Value, BoxError> { Ok(Value::list(split_paths(text))) };
    let adapt_path_set = |value: &Value| -> Result<String, BoxError> {
        let mut items = string_items(value)?;
        items.sort();
        items.dedup();
        Ok(items.join(&PATH_DELIMITER.to_string()))
    };
    let convert_path_set = |text: &str| -> Result<Value, BoxError> {
        let items = split_paths(text).into_iter().map(Value::Str).collect();
        Ok(Value::List(dedup_preserving_order(items)))
    };

    coercer.register(Kind::list_of(Tag::named("path")), adapt_path_list, convert_path_list);
    coercer.register(Tag::named("path_list"), adapt_path_list, convert_path_list);
    coercer.register(Kind::set_of(Tag::named("path")), adapt_path_set, convert_path_set);
    coercer.register(Tag::named("path_set"), adapt_path_set, convert_path_set);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coercer() -> Coercer {
        Coercer::new()
    }

    #[test]
    fn bool_round_trip() {
        let c = coercer();
        let kind = Kind::Scalar(Tag::Bool);
        assert_eq!(c.adapt(&Value::Bool(true), Some(&kind)).unwrap(), "true");
        assert_eq!(c.convert("Yes", &kind).unwrap(), Value::Bool(true));
        assert_eq!(c.convert("ON", &kind).unwrap(), Value::Bool(true));
        assert_eq!(c.convert("0", &kind).unwrap(), Value::Bool(false));
        assert!(matches!(
            c.convert("maybe", &kind),
            Err(CoerceError::Convert(_))
        ));
    }

    #[test]
    fn int_round_trip() {
        let c = coercer();
        let kind = Kind::Scalar(Tag::Int);
        for v in [-3i64, 0, 42, i64::MAX] {
            let text = c.adapt(&Value::Int(v), Some(&kind)).unwrap();
            assert_eq!(c.convert(&text, &kind).unwrap(), Value::Int(v));
        }
    }

    #[test]
    fn complex_round_trip() {
        let c = coercer();
        let kind = Kind::Scalar(Tag::Complex);
        for (re, im) in [(1.5, -2.0), (0.0, 1.0), (-3.0, 0.5)] {
            let text = c.adapt(&Value::Complex(re, im), Some(&kind)).unwrap();
            assert_eq!(c.convert(&text, &kind).unwrap(), Value::Complex(re, im));
        }
        assert_eq!(c.convert("2i", &kind).unwrap(), Value::Complex(0.0, 2.0));
        assert_eq!(c.convert("4", &kind).unwrap(), Value::Complex(4.0, 0.0));
        assert_eq!(
            c.convert("1e-3+2e2i", &kind).unwrap(),
            Value::Complex(1e-3, 2e2)
        );
    }

    #[test]
    fn bytes_encodings() {
        let c = coercer();
        let bytes = Value::Bytes(vec![0x00, 0xde, 0xad, 0xff]);

        let hexed = c.adapt(&bytes, Some(&Kind::Scalar(Tag::Bytes))).unwrap();
        assert_eq!(hexed, "00deadff");
        assert_eq!(c.convert(&hexed, &Kind::Scalar(Tag::Bytes)).unwrap(), bytes);

        let b64_kind = Kind::from("base64");
        let encoded = c.adapt(&bytes, Some(&b64_kind)).unwrap();
        assert_eq!(c.convert(&encoded, &b64_kind).unwrap(), bytes);
    }

    #[test]
    fn datetime_formats() {
        let c = coercer();
        let date = NaiveDate::from_ymd_opt(2014, 12, 30).unwrap();
        let time = NaiveTime::from_hms_micro_opt(14, 45, 30, 655).unwrap();
        let stamp = date.and_time(time);

        assert_eq!(
            c.adapt(&Value::Date(date), Some(&Kind::Scalar(Tag::Date))).unwrap(),
            "2014-12-30"
        );
        assert_eq!(
            c.adapt(&Value::Time(time), Some(&Kind::Scalar(Tag::Time))).unwrap(),
            "14:45:30.000655"
        );
        assert_eq!(
            c.adapt(&Value::DateTime(stamp), Some(&Kind::Scalar(Tag::DateTime))).unwrap(),
            "2014-12-30 14:45:30.000655"
        );

        assert_eq!(
            c.convert("2014-12-30 14:45:30.000655", &Kind::Scalar(Tag::DateTime)).unwrap(),
            Value::DateTime(stamp)
        );
        // the fraction is optional on read
        assert_eq!(
            c.convert("14:45:30", &Kind::Scalar(Tag::Time)).unwrap(),
            Value::Time(NaiveTime::from_hms_opt(14, 45, 30).unwrap())
        );
    }

    #[test]
    fn list_round_trip() {
        let c = coercer();
        let kind = Kind::Composite(vec![Tag::List]);
        let colors = Value::list(["red", "blue"]);

        let text = c.adapt(&colors, Some(&kind)).unwrap();
        assert_eq!(text, "red, blue");
        assert_eq!(c.convert(&text, &kind).unwrap(), colors);
        assert_eq!(c.convert("", &kind).unwrap(), Value::List(vec![]));
    }

    #[test]
    fn inferred_list_kind_defaults_to_str_elements() {
        let c = coercer();
        let colors = Value::list(["red", "blue"]);
        assert_eq!(c.adapt(&colors, None).unwrap(), "red, blue");
    }

    #[test]
    fn composite_elements_cycle() {
        let c = coercer();
        let kind = Kind::Composite(vec![Tag::List, Tag::Int, Tag::Str]);
        let value = Value::List(vec![
            Value::Int(1),
            Value::Str("a".into()),
            Value::Int(2),
            Value::Str("b".into()),
        ]);

        let text = c.adapt(&value, Some(&kind)).unwrap();
        assert_eq!(text, "1, a, 2, b");
        assert_eq!(c.convert(&text, &kind).unwrap(), value);
    }

    #[test]
    fn set_sorts_and_dedups() {
        let c = coercer();
        let kind = Kind::Composite(vec![Tag::Set]);
        let value = Value::list(["b", "a", "b"]);

        assert_eq!(c.adapt(&value, Some(&kind)).unwrap(), "a, b");
        assert_eq!(
            c.convert("b, a, b", &kind).unwrap(),
            Value::list(["b", "a"])
        );
    }

    #[test]
    fn path_list_uses_os_delimiter() {
        let c = coercer();
        let paths = Value::list(["path1", "path2"]);
        let expected = format!("path1{PATH_DELIMITER}path2");

        for kind in [Kind::from("path_list"), Kind::list_of(Tag::named("path"))] {
            assert_eq!(c.adapt(&paths, Some(&kind)).unwrap(), expected);
            assert_eq!(c.convert(&expected, &kind).unwrap(), paths);
        }
    }

    #[test]
    fn choice_registration() {
        let mut c = coercer();
        c.register_choice(
            Kind::from("color"),
            [
                (Value::Int(1), "red"),
                (Value::Int(2), "green"),
                (Value::Int(3), "blue"),
            ],
        );

        let kind = Kind::from("color");
        assert_eq!(c.adapt(&Value::Int(1), Some(&kind)).unwrap(), "red");
        assert_eq!(c.convert("blue", &kind).unwrap(), Value::Int(3));
        assert!(matches!(
            c.adapt(&Value::Int(4), Some(&kind)),
            Err(CoerceError::Adapt(_))
        ));
        assert!(matches!(
            c.convert("purple", &kind),
            Err(CoerceError::Convert(_))
        ));
    }

    #[test]
    fn unregistered_kind_errors() {
        let c = coercer();
        let kind = Kind::from("notexist");
        assert!(matches!(
            c.adapt(&Value::Int(1), Some(&kind)),
            Err(CoerceError::NotRegistered { role: "adapter", .. })
        ));
        assert!(matches!(
            c.convert("x", &kind),
            Err(CoerceError::NotRegistered { role: "converter", .. })
        ));
    }

    #[test]
    fn fallback_is_last_resort() {
        let mut c = coercer();
        c.set_convert_fallback(|text| Ok(Value::Str(format!("fallback:{text}"))));

        assert_eq!(
            c.convert("x", &Kind::from("notexist")).unwrap(),
            Value::Str("fallback:x".into())
        );
        // registered kinds still win
        assert_eq!(c.convert("3", &Kind::Scalar(Tag::Int)).unwrap(), Value::Int(3));
    }

    #[test]
    fn overriding_booleans() {
        let mut c = coercer();
        c.register_adapter(Kind::Scalar(Tag::Bool), |value| match value {
            Value::Bool(b) => Ok(if *b { "1" } else { "0" }.to_owned()),
            other => Err(format!("expected a boolean, got `{}`", other.tag()).into()),
        });
        assert_eq!(
            c.adapt(&Value::Bool(true), Some(&Kind::Scalar(Tag::Bool))).unwrap(),
            "1"
        );
    }

    #[test]
    fn kind_display() {
        assert_eq!(Kind::Scalar(Tag::Int).to_string(), "int");
        assert_eq!(Kind::list_of(Tag::named("path")).to_string(), "(list, path)");
    }
}
