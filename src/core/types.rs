/// Core types used throughout jstracepp: images and the trace error kinds.
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use thiserror::Error;

/// Name of the synthetic image that owns external (non-JS) functions.
pub const EXTERN_IMAGE_NAME: &str = "[extern]";

/// Function name resolved for addresses with no enclosing function.
pub const UNKNOWN_FUNCTION_NAME: &str = "[unknown]";

/// Relative address reserved for the `[unknown]` catch-all; the external
/// function counter starts handing out addresses above it.
pub const UNKNOWN_FUNCTION_ADDRESS: u32 = 1;

/// A loaded script, or the synthetic `[extern]` container for non-JS
/// callables. Image ids are zero-based and consecutive; each image owns the
/// virtual address window `[id << 32, id << 32 | 0xFFFFFFFF]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub id: i32,
    pub name: String,
    pub interesting: bool,
}

impl Image {
    pub fn base_address(&self) -> u64 {
        (self.id as u64) << 32
    }

    pub fn end_address(&self) -> u64 {
        self.base_address() | 0xFFFF_FFFF
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (image {})", self.name, self.id)
    }
}

/// Malformed-input errors. Any of these fails the testcase that hit it; there
/// is no recovery or retry.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("read buffer too small to hold one trace line (buffer is {0} bytes)")]
    ReadBufferTooSmall(usize),
    #[error("reference to unknown compressed line id {0}")]
    UnknownLineId(i32),
    #[error("unknown event type '{0}'")]
    UnknownEventType(char),
    #[error("malformed trace line: {0}")]
    MalformedLine(String),
    #[error("script ids must be zero-based and contiguous: expected {expected}, found {found}")]
    NonContiguousScriptIds { expected: i32, found: i32 },
    #[error("event references unknown script id {0}")]
    UnknownScriptId(i32),
}

/// Loads the script table (`scripts.txt`, one `<id> \t <name>` record per
/// line), verifies the ids are zero-based and contiguous, and appends the
/// synthetic `[extern]` image with the next free id.
pub fn load_images(scripts_file: &Path) -> Result<Vec<Image>> {
    let contents = fs::read_to_string(scripts_file)
        .with_context(|| format!("Failed to read script table {}", scripts_file.display()))?;

    let mut images = Vec::new();
    for line in contents.lines() {
        if line.is_empty() {
            continue;
        }
        let (id, name) = line.split_once('\t').ok_or_else(|| {
            TraceError::MalformedLine(format!("script table record without tab: {}", line))
        })?;
        let id: i32 = id
            .parse()
            .map_err(|_| TraceError::MalformedLine(format!("bad script id: {}", line)))?;
        let expected = images.len() as i32;
        if id != expected {
            return Err(TraceError::NonContiguousScriptIds { expected, found: id }.into());
        }
        images.push(Image {
            id,
            name: name.to_string(),
            interesting: true,
        });
    }

    images.push(Image {
        id: images.len() as i32,
        name: EXTERN_IMAGE_NAME.to_string(),
        interesting: true,
    });
    Ok(images)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_scripts(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("couldn't create scripts file");
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_scripts_and_appends_extern() {
        let file = write_scripts("0\tapp.js\n1\tnode_modules/lib/index.js\n");
        let images = load_images(file.path()).expect("script table should load");
        assert_eq!(images.len(), 3);
        assert_eq!(images[0].name, "app.js");
        assert_eq!(images[1].id, 1);
        assert_eq!(images[2].name, EXTERN_IMAGE_NAME);
        assert_eq!(images[2].id, 2);
        assert!(images.iter().all(|i| i.interesting));
    }

    #[test]
    fn image_address_window_is_derived_from_id() {
        let image = Image {
            id: 3,
            name: "x.js".to_string(),
            interesting: true,
        };
        assert_eq!(image.base_address(), 3 << 32);
        assert_eq!(image.end_address(), (3 << 32) | 0xFFFF_FFFF);
    }

    #[test]
    fn rejects_non_contiguous_ids() {
        let file = write_scripts("0\tapp.js\n2\tskipped.js\n");
        let err = load_images(file.path()).unwrap_err();
        match err.downcast_ref::<TraceError>() {
            Some(TraceError::NonContiguousScriptIds { expected: 1, found: 2 }) => {}
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn rejects_records_without_separator() {
        let file = write_scripts("0 app.js\n");
        let err = load_images(file.path()).unwrap_err();
        assert!(err.downcast_ref::<TraceError>().is_some());
    }
}
