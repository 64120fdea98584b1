/// Deterministic assignment of 32-bit relative addresses to source positions
/// and external function names.
///
/// A source position `startLine:startCol:endLine:endCol` maps to the pair
/// `((startLine << C) | startCol, (endLine << C) | endCol)` where `C` is the
/// configured column bit width. External functions have no source position;
/// they draw serial addresses from a process-wide counter instead, with both
/// ends of the pair equal.
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;
use dashmap::DashMap;

use crate::core::types::{TraceError, UNKNOWN_FUNCTION_ADDRESS};

/// Highest allowed column bit width.
pub const MAX_COLUMNS_BITS: u32 = 30;

pub struct AddressSpace {
    columns_bits: u32,
    /// Per image: source position key ("sL:sC:eL:eC") to its (start, end)
    /// address pair. Get-or-insert keeps every key's pair stable for the
    /// lifetime of the run, no matter which worker resolves it first.
    positions: Vec<DashMap<String, (u32, u32)>>,
    /// External function name to its serial address.
    externals: DashMap<String, u32>,
    next_external: AtomicU32,
}

impl AddressSpace {
    pub fn new(image_count: usize, columns_bits: u32) -> AddressSpace {
        AddressSpace {
            columns_bits,
            positions: (0..image_count).map(|_| DashMap::new()).collect(),
            externals: DashMap::new(),
            next_external: AtomicU32::new(UNKNOWN_FUNCTION_ADDRESS),
        }
    }

    pub fn columns_bits(&self) -> u32 {
        self.columns_bits
    }

    /// Packs a (line, column) source position into a relative address. A line
    /// or column too wide for its field silently bleeds into the bits above
    /// via the shift/OR; downstream consumers tolerate the skew.
    pub fn encode(&self, line: u32, column: u32) -> u32 {
        (line << self.columns_bits) | column
    }

    /// Splits a relative address back into (line, column).
    pub fn decode(&self, address: u32) -> (u32, u32) {
        (
            address >> self.columns_bits,
            address & ((1 << self.columns_bits) - 1),
        )
    }

    /// Resolves a source position key within an image to its address pair,
    /// allocating the pair on first observation.
    pub fn resolve_position(&self, image: usize, key: &str) -> Result<(u32, u32)> {
        let map = &self.positions[image];
        if let Some(pair) = map.get(key) {
            return Ok(*pair);
        }
        let pair = self.parse_position_key(key)?;
        Ok(*map.entry(key.to_owned()).or_insert(pair))
    }

    /// Resolves an external function name, issuing the next serial address on
    /// first observation. Addresses are distinct and start at 2; address 1 is
    /// reserved for `[unknown]`.
    pub fn resolve_external(&self, name: &str) -> u32 {
        if let Some(address) = self.externals.get(name) {
            return *address;
        }
        *self
            .externals
            .entry(name.to_owned())
            .or_insert_with(|| self.next_external.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn parse_position_key(&self, key: &str) -> Result<(u32, u32)> {
        let mut fields = [0u32; 4];
        let mut parts = key.split(':');
        for slot in fields.iter_mut() {
            *slot = parts
                .next()
                .and_then(|part| part.parse().ok())
                .ok_or_else(|| malformed_position(key))?;
        }
        if parts.next().is_some() {
            return Err(malformed_position(key).into());
        }
        Ok((
            self.encode(fields[0], fields[1]),
            self.encode(fields[2], fields[3]),
        ))
    }
}

fn malformed_position(key: &str) -> TraceError {
    TraceError::MalformedLine(format!("bad source position '{}'", key))
}
