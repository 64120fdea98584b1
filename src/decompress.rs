/// The trace line-decompression protocol.
///
/// The instrumentation agent deduplicates repeated event text through a
/// dictionary of numbered prefixes. A raw line either declares a dictionary
/// entry (`L:<id>|<prefix>`) or references one: an id followed by an optional
/// `|<suffix>`, expanding to `prefix || suffix`. Ids are written as decimal
/// digits, or as a single letter `a`-`s` encoding an offset in `[-9, +9]`
/// from the previously referenced id.
use std::collections::HashMap;

use anyhow::Result;

use crate::core::types::TraceError;

/// Outcome of feeding one raw trace line through the table.
#[derive(Debug, PartialEq, Eq)]
pub enum Expansion {
    /// The line declared a table entry and is fully consumed.
    Declaration,
    /// The line referenced an event; the decompressed text is in `out`.
    Event,
}

/// Dictionary of line ids to prefixes, plus the cursor relative references
/// are resolved against.
pub struct LineTable {
    entries: HashMap<i32, String>,
    last_id: i32,
}

impl LineTable {
    pub fn new() -> LineTable {
        LineTable {
            entries: HashMap::new(),
            last_id: 0,
        }
    }

    /// A table starting from the prefix pass's frozen dictionary. The
    /// relative-id cursor starts fresh; it never carries across traces.
    pub fn seeded(entries: HashMap<i32, String>) -> LineTable {
        LineTable { entries, last_id: 0 }
    }

    pub fn into_entries(self) -> HashMap<i32, String> {
        self.entries
    }

    /// Expands one raw line, placing decompressed event text in `out`.
    pub fn expand(&mut self, raw: &str, out: &mut String) -> Result<Expansion> {
        if let Some(declaration) = raw.strip_prefix("L:") {
            let (id, prefix) = declaration
                .split_once('|')
                .ok_or_else(|| malformed(raw))?;
            let id: i32 = id.parse().map_err(|_| malformed(raw))?;
            self.entries.insert(id, prefix.to_owned());
            return Ok(Expansion::Declaration);
        }

        let (reference, suffix) = match raw.split_once('|') {
            Some((head, tail)) => (head, Some(tail)),
            None => (raw, None),
        };
        let id = match reference.as_bytes() {
            [letter @ b'a'..=b's'] => self.last_id + (*letter as i32 - b'j' as i32),
            [b'0'..=b'9', ..] => reference.parse().map_err(|_| malformed(raw))?,
            _ => return Err(malformed(raw).into()),
        };
        self.last_id = id;

        let prefix = self
            .entries
            .get(&id)
            .ok_or(TraceError::UnknownLineId(id))?;
        out.clear();
        out.push_str(prefix);
        if let Some(suffix) = suffix {
            out.push_str(suffix);
        }
        Ok(Expansion::Event)
    }
}

impl Default for LineTable {
    fn default() -> Self {
        LineTable::new()
    }
}

fn malformed(raw: &str) -> TraceError {
    TraceError::MalformedLine(raw.to_owned())
}
