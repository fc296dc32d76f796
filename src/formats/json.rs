//! The JSON source grammar.
//!
//! A source is a single JSON object mapping flat dotted keys to string
//! values, in insertion order:
//!
//! ```json
//! {
//!   "server.host": "8.8.8.8",
//!   "server.port": "8181"
//! }
//! ```
//!
//! JSON has no comments and no layout beyond key order, so reading yields
//! no layout context and writing emits the export set in tree order - which
//! keeps read-after-write stable. Non-string scalars in a source are
//! accepted and read back as their JSON text.

use std::any::Any;
use std::io::{BufRead, Write};

use indexmap::IndexMap;

use super::{Document, Export, Format, FormatContext, FormatError};
use crate::Result;

/// The flat JSON object format.
#[derive(Debug, Clone, Default)]
pub struct JsonFormat;

impl JsonFormat {
    pub fn new() -> Self {
        Self
    }
}

impl Format for JsonFormat {
    fn name(&self) -> &'static str {
        "json"
    }

    fn read(&self, reader: &mut dyn BufRead, ctx: &FormatContext) -> Result<Document> {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;
        if text.trim().is_empty() {
            return Ok(Document::default());
        }

        let object: serde_json::Map<String, serde_json::Value> = match serde_json::from_str(&text)
        {
            Ok(object) => object,
            Err(err) => {
                ctx.report(
                    FormatError::new(err.to_string()).with_line(err.line()),
                )?;
                return Ok(Document::default());
            }
        };

        let mut values = IndexMap::new();
        for (key, value) in object {
            let value = match value {
                serde_json::Value::String(text) => text,
                other => other.to_string(),
            };
            values.insert(key, value);
        }

        Ok(Document {
            values,
            comments: IndexMap::new(),
            layout: None,
        })
    }

    fn write(
        &self,
        writer: &mut dyn Write,
        export: &Export,
        _layout: Option<&dyn Any>,
        ctx: &FormatContext,
    ) -> Result<()> {
        let mut object = serde_json::Map::new();
        for (key, value) in &export.values {
            object.insert(key.clone(), serde_json::Value::String(value.clone()));
        }

        serde_json::to_writer_pretty(&mut *writer, &object)
            .map_err(|err| FormatError::new(err.to_string()).with_file(ctx.source.clone()))?;
        writeln!(writer)?;
        Ok(())
    }
}
