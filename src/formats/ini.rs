//! The INI-like source grammar.
//!
//! ```ini
//! ; listen address
//! [server] = primary
//! host = 8.8.8.8
//! port = 8181
//! ```
//!
//! Every root section is a `[name]` header; a valid root section carries its
//! own value on the header line (`[name] = value`). Keys below a header are
//! written relative to it. Keys before any header belong to the implicit
//! `default` section. A `;` comment annotates the line that follows it;
//! comments bound to no line are preserved verbatim in place.
//!
//! Reading records each line's role in a layout context. Writing walks that
//! layout: unchanged and changed keys keep their original positions, keys
//! that are new to a known section land after its last key, and entirely
//! new sections land at the end of the file. Repeated keys or headers
//! collapse to their first position, last value read winning.

use std::any::Any;
use std::collections::HashSet;
use std::io::{BufRead, Write};

use indexmap::IndexMap;

use super::{Document, Export, Format, FormatContext, FormatError};
use crate::Result;

/// The comment- and order-preserving INI dialect.
#[derive(Debug, Clone)]
pub struct IniFormat {
    /// Separator between a key (or header) and its value.
    pub delimiter: String,
    /// Prefix for written comment lines.
    pub comment_prefix: String,
    /// Section owning the keys that appear before any header.
    pub default_section: String,
}

impl Default for IniFormat {
    fn default() -> Self {
        Self::new()
    }
}

impl IniFormat {
    pub fn new() -> Self {
        Self {
            delimiter: " = ".to_owned(),
            comment_prefix: "; ".to_owned(),
            default_section: "default".to_owned(),
        }
    }

    fn comment_marker(&self) -> char {
        self.comment_prefix.chars().next().unwrap_or(';')
    }

    /// `[name]`, `[name] = value`, or not a header at all.
    fn parse_header(line: &str) -> Option<(String, Option<String>)> {
        let rest = line.strip_prefix('[')?;
        let (name, after) = rest.split_once(']')?;
        let name = name.trim().to_owned();
        let value = after
            .trim()
            .strip_prefix('=')
            .map(|value| value.trim().to_owned());
        Some((name, value))
    }

    /// A key without its root segment.
    fn relative_key(key: &str, ctx: &FormatContext) -> String {
        match key.split_once(ctx.separator.as_str()) {
            Some((_, rest)) => rest.to_owned(),
            None => key.to_owned(),
        }
    }

    fn root_of(key: &str, ctx: &FormatContext) -> String {
        key.split(ctx.separator.as_str())
            .next()
            .unwrap_or(key)
            .to_owned()
    }

    fn write_comment(&self, writer: &mut dyn Write, export: &Export, key: &str) -> Result<()> {
        if let Some(comment) = export.comments.get(key) {
            writeln!(writer, "{}{}", self.comment_prefix, comment)?;
        }
        Ok(())
    }

    fn write_key(
        &self,
        writer: &mut dyn Write,
        export: &Export,
        key: &str,
        value: &str,
        ctx: &FormatContext,
    ) -> Result<()> {
        self.write_comment(writer, export, key)?;
        writeln!(
            writer,
            "{}{}{}",
            Self::relative_key(key, ctx),
            self.delimiter,
            value
        )?;
        Ok(())
    }

    /// Write the not-yet-seen export keys belonging to `section`.
    fn write_section_rest(
        &self,
        writer: &mut dyn Write,
        export: &Export,
        section: &str,
        seen: &mut HashSet<String>,
        ctx: &FormatContext,
    ) -> Result<()> {
        let prefix = format!("{}{}", section, ctx.separator);
        let rest: Vec<(String, String)> = export
            .values
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix) && !seen.contains(*key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        for (key, value) in rest {
            self.write_key(writer, export, &key, &value, ctx)?;
            seen.insert(key);
        }
        Ok(())
    }
}

/// Line roles recorded while reading, in source order. Blank lines are not
/// kept; the writer reinserts one before each section header.
#[derive(Debug, Default)]
struct IniLayout {
    lines: Vec<IniLine>,
}

#[derive(Debug, Clone)]
enum IniLine {
    /// A comment bound to no key, kept verbatim.
    Comment(String),
    /// A section header, by absolute name.
    Section(String),
    /// A key line, by absolute key.
    Key(String),
}

impl Format for IniFormat {
    fn name(&self) -> &'static str {
        "ini"
    }

    fn read(&self, reader: &mut dyn BufRead, ctx: &FormatContext) -> Result<Document> {
        let mut values = IndexMap::new();
        let mut comments = IndexMap::new();
        let mut lines = Vec::new();
        let mut section = self.default_section.clone();
        // a comment is held back until the next line decides whether it
        // annotates a key, a header, or nothing
        let mut pending: Option<(String, String)> = None;
        let marker = self.comment_marker();

        for (number, line) in reader.lines().enumerate() {
            let number = number + 1;
            let raw = line?;
            let trimmed = raw.trim();

            if trimmed.is_empty() {
                if let Some((_, orphan)) = pending.take() {
                    lines.push(IniLine::Comment(orphan));
                }
                continue;
            }

            if trimmed.starts_with(marker) {
                if let Some((_, orphan)) = pending.take() {
                    lines.push(IniLine::Comment(orphan));
                }
                let text = trimmed.trim_start_matches(marker).trim().to_owned();
                pending = Some((text, raw.clone()));
                continue;
            }

            if let Some((name, value)) = Self::parse_header(trimmed) {
                let name = if name.is_empty() || name.eq_ignore_ascii_case(&self.default_section)
                {
                    self.default_section.clone()
                } else {
                    name
                };
                if let Some(value) = value {
                    values.insert(name.clone(), value);
                }
                if let Some((text, _)) = pending.take() {
                    comments.insert(name.clone(), text);
                }
                lines.push(IniLine::Section(name.clone()));
                section = name;
                continue;
            }

            match trimmed.split_once('=') {
                Some((key, value)) => {
                    let key = format!("{}{}{}", section, ctx.separator, key.trim());
                    values.insert(key.clone(), value.trim().to_owned());
                    if let Some((text, _)) = pending.take() {
                        comments.insert(key.clone(), text);
                    }
                    lines.push(IniLine::Key(key));
                }
                None => {
                    ctx.report(
                        FormatError::new("invalid syntax")
                            .with_line(number)
                            .with_text(trimmed),
                    )?;
                }
            }
        }

        if let Some((_, orphan)) = pending {
            lines.push(IniLine::Comment(orphan));
        }

        Ok(Document {
            values,
            comments,
            layout: Some(Box::new(IniLayout { lines })),
        })
    }

    fn write(
        &self,
        writer: &mut dyn Write,
        export: &Export,
        layout: Option<&dyn Any>,
        ctx: &FormatContext,
    ) -> Result<()> {
        let empty = IniLayout::default();
        let layout = layout
            .and_then(|layout| layout.downcast_ref::<IniLayout>())
            .unwrap_or(&empty);

        let mut seen: HashSet<String> = HashSet::new();
        let mut first = true;
        let mut current: Option<String> = None;

        // pass 1: keys and sections in the order they were read
        for line in &layout.lines {
            match line {
                IniLine::Section(name) => {
                    if seen.contains(name) {
                        continue;
                    }
                    if let Some(previous) = current.take() {
                        self.write_section_rest(writer, export, &previous, &mut seen, ctx)?;
                    }

                    let child_prefix = format!("{}{}", name, ctx.separator);
                    let has_own = export.values.contains_key(name);
                    let has_children = export
                        .values
                        .keys()
                        .any(|key| key.starts_with(&child_prefix));
                    if !has_own && !has_children {
                        // every key of this section was dropped or filtered
                        continue;
                    }

                    if !first {
                        writeln!(writer)?;
                    }
                    self.write_comment(writer, export, name)?;
                    match export.values.get(name) {
                        Some(value) => writeln!(writer, "[{}]{}{}", name, self.delimiter, value)?,
                        None => writeln!(writer, "[{name}]")?,
                    }
                    seen.insert(name.clone());
                    current = Some(name.clone());
                    first = false;
                }
                IniLine::Key(key) => {
                    if seen.contains(key) {
                        continue;
                    }
                    let Some(value) = export.values.get(key) else {
                        continue;
                    };
                    self.write_key(writer, export, key, value, ctx)?;
                    seen.insert(key.clone());
                }
                IniLine::Comment(raw) => {
                    writeln!(writer, "{raw}")?;
                }
            }
        }

        if let Some(previous) = current.take() {
            self.write_section_rest(writer, export, &previous, &mut seen, ctx)?;
        }

        // pass 2: values the layout has never seen, grouped by root section
        for (key, value) in &export.values {
            if seen.contains(key) {
                continue;
            }
            let root = Self::root_of(key, ctx);
            if !seen.contains(&root) {
                if !first {
                    writeln!(writer)?;
                }
                self.write_comment(writer, export, &root)?;
                if *key == root {
                    writeln!(writer, "[{}]{}{}", root, self.delimiter, value)?;
                    seen.insert(key.clone());
                } else {
                    writeln!(writer, "[{root}]")?;
                }
                seen.insert(root.clone());
                first = false;
            }
            if *key != root {
                self.write_key(writer, export, key, value, ctx)?;
                seen.insert(key.clone());
            }
        }

        Ok(())
    }
}
