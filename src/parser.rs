/// The event parser: turns decompressed trace events into binary records.
///
/// Events are semicolon-separated, the first field naming the event type:
/// `c` (call), `r`/`R` (return source/destination), `j` (jump) and `m`
/// (heap memory access). The prefix pass runs the same machine but only
/// seeds lookups and emits heap allocations; branch and memory-access
/// records flow in testcase mode only.
use std::io::Read;

use anyhow::{Context, Result};

use crate::core::heap::{HeapTracker, ALLOCATION_SPAN};
use crate::core::types::{TraceError, UNKNOWN_FUNCTION_ADDRESS};
use crate::decompress::{Expansion, LineTable};
use crate::preprocessor::SharedState;
use crate::reader::LineReader;
use crate::storage::{BranchKind, TraceRecord, TraceWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Single-threaded warm-up over `prefix.trace`: seeds shared lookups,
    /// emits only heap allocations.
    Prefix,
    /// One testcase trace; emits the full record stream.
    Testcase,
}

pub struct EventParser<'a> {
    state: &'a SharedState,
    pass: Pass,
    lines: LineTable,
    heap: HeapTracker,
    /// Source recorded by the last `r` event, consumed by the next `R`.
    pending_return_source: Option<(i32, u32)>,
}

impl<'a> EventParser<'a> {
    pub fn prefix(state: &'a SharedState) -> EventParser<'a> {
        EventParser {
            state,
            pass: Pass::Prefix,
            lines: LineTable::new(),
            heap: HeapTracker::new(),
            pending_return_source: None,
        }
    }

    /// A testcase parser with its own overlays cloned from the prefix seed.
    pub fn testcase(state: &'a SharedState) -> EventParser<'a> {
        EventParser {
            state,
            pass: Pass::Testcase,
            lines: LineTable::seeded(state.line_table_seed.clone()),
            heap: HeapTracker::seeded(
                state.heap_seed.clone(),
                state.next_heap_allocation_seed,
            ),
            pending_return_source: None,
        }
    }

    /// Consumes the parser after a prefix pass, handing its tables back so
    /// the coordinator can freeze them as the testcase seed.
    pub fn into_seed(self) -> (std::collections::HashMap<i32, String>, HeapTracker) {
        (self.lines.into_entries(), self.heap)
    }

    /// Runs the parser over one raw trace, emitting records into `sink`.
    pub fn process<R: Read>(
        &mut self,
        reader: &mut LineReader<R>,
        sink: &mut TraceWriter,
    ) -> Result<()> {
        let mut scratch = String::new();
        while let Some(raw) = reader.next_line()? {
            let raw = std::str::from_utf8(raw).context("trace line is not valid UTF-8")?;
            match self.lines.expand(raw, &mut scratch)? {
                Expansion::Declaration => continue,
                Expansion::Event => self.handle_event(&scratch, sink)?,
            }
        }
        Ok(())
    }

    fn handle_event(&mut self, line: &str, sink: &mut TraceWriter) -> Result<()> {
        match line.split(';').next().unwrap_or("") {
            "c" => self.handle_call(line, sink),
            "r" => self.handle_return_source(line),
            "R" => self.handle_return_destination(line, sink),
            "j" => self.handle_jump(line, sink),
            "m" => self.handle_memory_access(line, sink),
            other => match other.chars().next() {
                Some(event) => Err(TraceError::UnknownEventType(event).into()),
                None => Err(malformed(line).into()),
            },
        }
    }

    /// `c;srcScript;srcPos;dstScript|E;dstPos;name`
    fn handle_call(&mut self, line: &str, sink: &mut TraceWriter) -> Result<()> {
        let fields: Vec<&str> = line.splitn(6, ';').collect();
        if fields.len() != 6 {
            return Err(malformed(line).into());
        }
        let (source_image, source_address, _) = self.resolve_location(fields[1], fields[2])?;
        let (destination_image, destination_start, destination_end) = if fields[3] == "E" {
            // External target: the "position" field carries the raw name.
            let address = self.state.address_space.resolve_external(fields[4]);
            (self.state.extern_image_id(), address, address)
        } else {
            self.resolve_location(fields[3], fields[4])?
        };

        self.state
            .record_function_name(destination_image, destination_start, destination_end, fields[5]);
        self.state.request(source_image, source_address);
        self.state.request(destination_image, destination_start);
        self.state.request(destination_image, destination_end);

        if self.pass == Pass::Testcase {
            TraceRecord::Branch {
                source_image,
                source_address,
                destination_image,
                destination_address: destination_start,
                taken: true,
                kind: BranchKind::Call,
            }
            .write_to(sink)?;
        }
        Ok(())
    }

    /// `r;script;pos`, remembered as the source of the next `R`.
    fn handle_return_source(&mut self, line: &str) -> Result<()> {
        let fields: Vec<&str> = line.splitn(3, ';').collect();
        if fields.len() != 3 {
            return Err(malformed(line).into());
        }
        let (image, address, _) = self.resolve_location(fields[1], fields[2])?;
        self.state.request(image, address);
        if self.pass == Pass::Testcase {
            self.pending_return_source = Some((image, address));
        }
        Ok(())
    }

    /// `R;script;pos`. A return with no pending `r` is anchored at the
    /// `[unknown]` catch-all so stray returns still show up in map files.
    fn handle_return_destination(&mut self, line: &str, sink: &mut TraceWriter) -> Result<()> {
        let fields: Vec<&str> = line.splitn(3, ';').collect();
        if fields.len() != 3 {
            return Err(malformed(line).into());
        }
        let (image, address, _) = self.resolve_location(fields[1], fields[2])?;
        self.state.request(image, address);
        if self.pass == Pass::Testcase {
            let (source_image, source_address) = self
                .pending_return_source
                .take()
                .unwrap_or((self.state.extern_image_id(), UNKNOWN_FUNCTION_ADDRESS));
            TraceRecord::Branch {
                source_image,
                source_address,
                destination_image: image,
                destination_address: address,
                taken: true,
                kind: BranchKind::Return,
            }
            .write_to(sink)?;
        }
        Ok(())
    }

    /// `j;script;srcPos;dstPos`
    fn handle_jump(&mut self, line: &str, sink: &mut TraceWriter) -> Result<()> {
        let fields: Vec<&str> = line.splitn(4, ';').collect();
        if fields.len() != 4 {
            return Err(malformed(line).into());
        }
        let (image, source_address, _) = self.resolve_location(fields[1], fields[2])?;
        let (_, destination_address, _) = self.resolve_location(fields[1], fields[3])?;
        self.state.request(image, source_address);
        self.state.request(image, destination_address);
        if self.pass == Pass::Testcase {
            TraceRecord::Branch {
                source_image: image,
                source_address,
                destination_image: image,
                destination_address,
                taken: true,
                kind: BranchKind::Jump,
            }
            .write_to(sink)?;
        }
        Ok(())
    }

    /// `m;r|w;script;pos;objectId;offset`
    fn handle_memory_access(&mut self, line: &str, sink: &mut TraceWriter) -> Result<()> {
        let fields: Vec<&str> = line.splitn(6, ';').collect();
        if fields.len() != 6 {
            return Err(malformed(line).into());
        }
        let is_write = match fields[1] {
            "w" => true,
            "r" => false,
            _ => return Err(malformed(line).into()),
        };
        let (image, address, _) = self.resolve_location(fields[2], fields[3])?;
        self.state.request(image, address);

        let object_id: i32 = fields[4].parse().map_err(|_| malformed(line))?;
        let (object, fresh_address) = self.heap.get_or_allocate(object_id);
        if let Some(allocation_address) = fresh_address {
            TraceRecord::HeapAllocation {
                id: object_id,
                address: allocation_address,
                size: ALLOCATION_SPAN as u32,
            }
            .write_to(sink)?;
        }
        let memory_address = object.property_offset(fields[5]);

        if self.pass == Pass::Testcase {
            TraceRecord::HeapMemoryAccess {
                instruction_image: image,
                instruction_address: address,
                allocation_id: object_id,
                memory_address,
                size: 1,
                is_write,
            }
            .write_to(sink)?;
        }
        Ok(())
    }

    /// Resolves a `(script, position)` field pair to the owning image and
    /// the position's address pair.
    fn resolve_location(&self, script: &str, position: &str) -> Result<(i32, u32, u32)> {
        let script_id: i32 = script
            .parse()
            .map_err(|_| TraceError::MalformedLine(format!("bad script id '{}'", script)))?;
        let image = self.state.image_index(script_id)?;
        let (start, end) = self.state.address_space.resolve_position(image, position)?;
        Ok((script_id, start, end))
    }
}

fn malformed(line: &str) -> TraceError {
    TraceError::MalformedLine(line.to_owned())
}
