//! The binary trace format consumed by the analysis stages.
//!
//! Everything is little-endian and self-describing only by position. Each
//! record starts with a one-byte type discriminator followed by fixed
//! fields; the discriminators are stable across prefix and testcase outputs
//! within a run. The prefix output additionally prepends the image table:
//! a `u32` count, then per image `{ i32 id, u8 interesting, u64 start,
//! u64 end, u32 name_len, utf8 name }`.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::core::types::Image;

const RECORD_HEAP_ALLOCATION: u8 = 1;
const RECORD_HEAP_MEMORY_ACCESS: u8 = 2;
const RECORD_BRANCH: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BranchKind {
    Jump = 0,
    Call = 1,
    Return = 2,
}

impl BranchKind {
    fn from_u8(value: u8) -> Result<BranchKind> {
        match value {
            0 => Ok(BranchKind::Jump),
            1 => Ok(BranchKind::Call),
            2 => Ok(BranchKind::Return),
            other => bail!("unknown branch kind {}", other),
        }
    }
}

/// One preprocessed trace record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceRecord {
    Branch {
        source_image: i32,
        source_address: u32,
        destination_image: i32,
        destination_address: u32,
        taken: bool,
        kind: BranchKind,
    },
    HeapAllocation {
        id: i32,
        address: u64,
        size: u32,
    },
    HeapMemoryAccess {
        instruction_image: i32,
        instruction_address: u32,
        allocation_id: i32,
        memory_address: u32,
        size: u32,
        is_write: bool,
    },
}

impl TraceRecord {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match *self {
            TraceRecord::Branch {
                source_image,
                source_address,
                destination_image,
                destination_address,
                taken,
                kind,
            } => {
                w.write_u8(RECORD_BRANCH)?;
                w.write_i32::<LittleEndian>(source_image)?;
                w.write_u32::<LittleEndian>(source_address)?;
                w.write_i32::<LittleEndian>(destination_image)?;
                w.write_u32::<LittleEndian>(destination_address)?;
                w.write_u8(taken as u8)?;
                w.write_u8(kind as u8)?;
            }
            TraceRecord::HeapAllocation { id, address, size } => {
                w.write_u8(RECORD_HEAP_ALLOCATION)?;
                w.write_i32::<LittleEndian>(id)?;
                w.write_u64::<LittleEndian>(address)?;
                w.write_u32::<LittleEndian>(size)?;
            }
            TraceRecord::HeapMemoryAccess {
                instruction_image,
                instruction_address,
                allocation_id,
                memory_address,
                size,
                is_write,
            } => {
                w.write_u8(RECORD_HEAP_MEMORY_ACCESS)?;
                w.write_i32::<LittleEndian>(instruction_image)?;
                w.write_u32::<LittleEndian>(instruction_address)?;
                w.write_i32::<LittleEndian>(allocation_id)?;
                w.write_u32::<LittleEndian>(memory_address)?;
                w.write_u32::<LittleEndian>(size)?;
                w.write_u8(is_write as u8)?;
            }
        }
        Ok(())
    }

    /// Reads the next record, or `None` at a clean end of input.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Option<TraceRecord>> {
        let discriminator = match r.read_u8() {
            Ok(value) => value,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e).context("Failed to read trace record"),
        };
        let record = match discriminator {
            RECORD_BRANCH => TraceRecord::Branch {
                source_image: r.read_i32::<LittleEndian>()?,
                source_address: r.read_u32::<LittleEndian>()?,
                destination_image: r.read_i32::<LittleEndian>()?,
                destination_address: r.read_u32::<LittleEndian>()?,
                taken: r.read_u8()? != 0,
                kind: BranchKind::from_u8(r.read_u8()?)?,
            },
            RECORD_HEAP_ALLOCATION => TraceRecord::HeapAllocation {
                id: r.read_i32::<LittleEndian>()?,
                address: r.read_u64::<LittleEndian>()?,
                size: r.read_u32::<LittleEndian>()?,
            },
            RECORD_HEAP_MEMORY_ACCESS => TraceRecord::HeapMemoryAccess {
                instruction_image: r.read_i32::<LittleEndian>()?,
                instruction_address: r.read_u32::<LittleEndian>()?,
                allocation_id: r.read_i32::<LittleEndian>()?,
                memory_address: r.read_u32::<LittleEndian>()?,
                size: r.read_u32::<LittleEndian>()?,
                is_write: r.read_u8()? != 0,
            },
            other => bail!("unknown trace record type byte {}", other),
        };
        Ok(Some(record))
    }
}

/// Writes the image table that heads the prefix output.
pub fn write_image_table<W: Write>(w: &mut W, images: &[Image]) -> io::Result<()> {
    w.write_u32::<LittleEndian>(images.len() as u32)?;
    for image in images {
        w.write_i32::<LittleEndian>(image.id)?;
        w.write_u8(image.interesting as u8)?;
        w.write_u64::<LittleEndian>(image.base_address())?;
        w.write_u64::<LittleEndian>(image.end_address())?;
        w.write_u32::<LittleEndian>(image.name.len() as u32)?;
        w.write_all(image.name.as_bytes())?;
    }
    Ok(())
}

pub fn read_image_table<R: Read>(r: &mut R) -> Result<Vec<Image>> {
    let count = r.read_u32::<LittleEndian>().context("Failed to read image count")?;
    let mut images = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let id = r.read_i32::<LittleEndian>()?;
        let interesting = r.read_u8()? != 0;
        // The address window is derived from the id; skip it on the way in.
        r.read_u64::<LittleEndian>()?;
        r.read_u64::<LittleEndian>()?;
        let name_len = r.read_u32::<LittleEndian>()? as usize;
        let mut name = vec![0; name_len];
        r.read_exact(&mut name)?;
        images.push(Image {
            id,
            name: String::from_utf8(name).context("image name is not valid UTF-8")?,
            interesting,
        });
    }
    Ok(images)
}

/// Sink for preprocessed trace output: either a growable in-memory buffer
/// (pre-sized to the input's byte length as a capacity estimate) or a
/// buffered file.
pub enum TraceWriter {
    Memory(Vec<u8>),
    File(BufWriter<File>),
}

impl TraceWriter {
    pub fn memory(capacity: usize) -> TraceWriter {
        TraceWriter::Memory(Vec::with_capacity(capacity))
    }

    pub fn file(path: &Path) -> Result<TraceWriter> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create trace output {}", path.display()))?;
        Ok(TraceWriter::File(BufWriter::new(file)))
    }

    /// Flushes the sink and hands back the buffered bytes, if any.
    pub fn finish(self) -> io::Result<Option<Vec<u8>>> {
        match self {
            TraceWriter::Memory(bytes) => Ok(Some(bytes)),
            TraceWriter::File(mut file) => {
                file.flush()?;
                Ok(None)
            }
        }
    }
}

impl Write for TraceWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TraceWriter::Memory(bytes) => bytes.write(buf),
            TraceWriter::File(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            TraceWriter::Memory(_) => Ok(()),
            TraceWriter::File(file) => file.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::EXTERN_IMAGE_NAME;

    fn sample_records() -> Vec<TraceRecord> {
        vec![
            TraceRecord::HeapAllocation {
                id: 42,
                address: 0,
                size: 0x20_0000,
            },
            TraceRecord::HeapMemoryAccess {
                instruction_image: 0,
                instruction_address: (5 << 13) | 1,
                allocation_id: 42,
                memory_address: 0x10_0000,
                size: 1,
                is_write: true,
            },
            TraceRecord::Branch {
                source_image: 0,
                source_address: (1 << 13) | 2,
                destination_image: 1,
                destination_address: 7,
                taken: true,
                kind: BranchKind::Call,
            },
        ]
    }

    #[test]
    fn records_round_trip_byte_identically() {
        let records = sample_records();
        let mut first = Vec::new();
        for record in &records {
            record.write_to(&mut first).unwrap();
        }

        let mut cursor = first.as_slice();
        let mut decoded = Vec::new();
        while let Some(record) = TraceRecord::read_from(&mut cursor).unwrap() {
            decoded.push(record);
        }
        assert_eq!(decoded, records);

        let mut second = Vec::new();
        for record in &decoded {
            record.write_to(&mut second).unwrap();
        }
        assert_eq!(first, second);
    }

    #[test]
    fn branch_record_layout_is_fixed() {
        let mut bytes = Vec::new();
        TraceRecord::Branch {
            source_image: 1,
            source_address: 0x2002,
            destination_image: 2,
            destination_address: 0x4000,
            taken: true,
            kind: BranchKind::Return,
        }
        .write_to(&mut bytes)
        .unwrap();
        assert_eq!(
            bytes,
            [
                3, // discriminator
                1, 0, 0, 0, // source image
                0x02, 0x20, 0, 0, // source address
                2, 0, 0, 0, // destination image
                0, 0x40, 0, 0, // destination address
                1, // taken
                2, // Return
            ]
        );
    }

    #[test]
    fn unknown_discriminators_are_rejected() {
        let mut cursor = &[0xAAu8, 0, 0][..];
        assert!(TraceRecord::read_from(&mut cursor).is_err());
    }

    #[test]
    fn image_table_round_trips() {
        let images = vec![
            Image {
                id: 0,
                name: "app.js".to_string(),
                interesting: true,
            },
            Image {
                id: 1,
                name: EXTERN_IMAGE_NAME.to_string(),
                interesting: true,
            },
        ];
        let mut bytes = Vec::new();
        write_image_table(&mut bytes, &images).unwrap();
        let mut cursor = bytes.as_slice();
        assert_eq!(read_image_table(&mut cursor).unwrap(), images);
        assert!(cursor.is_empty());
    }

    #[test]
    fn memory_writer_returns_its_bytes() {
        let mut writer = TraceWriter::memory(64);
        for record in sample_records() {
            record.write_to(&mut writer).unwrap();
        }
        let bytes = writer.finish().unwrap().expect("memory sink keeps bytes");
        assert!(!bytes.is_empty());
    }
}
