/// Map-file emission.
///
/// At shutdown every image gets a `.map` text file: the original image name
/// on the first line, then one line per requested address, ascending. Each
/// address resolves to the nearest enclosing function observed during the
/// run, or `"?"` when none covers it. External-function addresses carry no
/// source position, so their lines omit the `line:column` suffix.
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use log::debug;

use crate::core::types::Image;
use crate::preprocessor::SharedState;

pub fn write_map_files(map_directory: &Path, state: &SharedState) -> Result<()> {
    for image in state.images() {
        write_image_map(map_directory, state, image)
            .with_context(|| format!("Failed to write map file for image {}", image.name))?;
    }
    Ok(())
}

fn write_image_map(map_directory: &Path, state: &SharedState, image: &Image) -> Result<()> {
    let path = map_directory.join(format!("{}.map", sanitize_file_name(&image.name)));
    let file = File::create(&path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "{}", image.name)?;

    let mut addresses: Vec<u32> = state
        .requested
        .iter()
        .filter(|entry| entry.0 == image.id)
        .map(|entry| entry.1)
        .collect();
    addresses.sort_unstable();

    let mut functions: Vec<((u32, u32), String)> = state.function_names[image.id as usize]
        .iter()
        .map(|entry| (*entry.key(), entry.value().clone()))
        .collect();
    functions.sort_unstable_by_key(|(range, _)| *range);

    debug!(
        "Map for {}: {} addresses, {} functions",
        image.name,
        addresses.len(),
        functions.len()
    );

    let is_extern = image.id == state.extern_image_id();
    for address in addresses {
        let name = enclosing_function(&functions, address).unwrap_or("?");
        if is_extern {
            writeln!(out, "{:08x}\t{}", address, name)?;
        } else {
            let (line, column) = state.address_space.decode(address);
            writeln!(out, "{:08x}\t{}:{}:{}", address, name, line, column)?;
        }
    }
    out.flush()?;
    Ok(())
}

/// The highest-start function range containing `address`, if any.
fn enclosing_function(functions: &[((u32, u32), String)], address: u32) -> Option<&str> {
    let upper = functions.partition_point(|((start, _), _)| *start <= address);
    functions[..upper]
        .iter()
        .rev()
        .find(|((_, end), _)| address <= *end)
        .map(|(_, name)| name.as_str())
}

/// Replaces path-hostile characters so any image name forms a valid file
/// name on every platform.
fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | '.' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if (c as u32) < 0x20 => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::core::types::{EXTERN_IMAGE_NAME, UNKNOWN_FUNCTION_ADDRESS, UNKNOWN_FUNCTION_NAME};

    fn test_state() -> SharedState {
        let images = vec![
            Image {
                id: 0,
                name: "src/app.js".to_string(),
                interesting: true,
            },
            Image {
                id: 1,
                name: EXTERN_IMAGE_NAME.to_string(),
                interesting: true,
            },
        ];
        let state = SharedState::new(images, 13);
        state.record_function_name(
            1,
            UNKNOWN_FUNCTION_ADDRESS,
            UNKNOWN_FUNCTION_ADDRESS,
            UNKNOWN_FUNCTION_NAME,
        );
        state.request(1, UNKNOWN_FUNCTION_ADDRESS);
        state
    }

    #[test]
    fn addresses_resolve_to_their_enclosing_function() {
        let state = test_state();
        state.record_function_name(0, 10 << 13, 11 << 13, "fn");
        state.request(0, (10 << 13) | 4);

        let dir = tempfile::tempdir().unwrap();
        write_map_files(dir.path(), &state).unwrap();

        let map = fs::read_to_string(dir.path().join("src_app_js.map")).unwrap();
        assert_eq!(map, "src/app.js\n00014004\tfn:10:4\n");
    }

    #[test]
    fn uncovered_addresses_fall_back_to_a_question_mark() {
        let state = test_state();
        state.record_function_name(0, 5 << 13, 6 << 13, "covered");
        state.request(0, 2 << 13);

        let dir = tempfile::tempdir().unwrap();
        write_map_files(dir.path(), &state).unwrap();

        let map = fs::read_to_string(dir.path().join("src_app_js.map")).unwrap();
        assert_eq!(map, "src/app.js\n00004000\t?:2:0\n");
    }

    #[test]
    fn the_highest_start_covering_range_wins() {
        let state = test_state();
        state.record_function_name(0, 1 << 13, 20 << 13, "outer");
        state.record_function_name(0, 10 << 13, 12 << 13, "inner");
        state.request(0, 11 << 13);
        state.request(0, 15 << 13);

        let dir = tempfile::tempdir().unwrap();
        write_map_files(dir.path(), &state).unwrap();

        let map = fs::read_to_string(dir.path().join("src_app_js.map")).unwrap();
        assert_eq!(
            map,
            "src/app.js\n00016000\tinner:11:0\n0001e000\touter:15:0\n"
        );
    }

    #[test]
    fn extern_lines_have_no_source_position() {
        let state = test_state();

        let dir = tempfile::tempdir().unwrap();
        write_map_files(dir.path(), &state).unwrap();

        let map = fs::read_to_string(dir.path().join("[extern].map")).unwrap();
        assert_eq!(map, "[extern]\n00000001\t[unknown]\n");
    }

    #[test]
    fn addresses_are_emitted_in_ascending_order() {
        let state = test_state();
        state.request(0, 0x3000);
        state.request(0, 0x1000);
        state.request(0, 0x2000);

        let dir = tempfile::tempdir().unwrap();
        write_map_files(dir.path(), &state).unwrap();

        let map = fs::read_to_string(dir.path().join("src_app_js.map")).unwrap();
        let addresses: Vec<&str> = map
            .lines()
            .skip(1)
            .map(|l| l.split('\t').next().unwrap())
            .collect();
        assert_eq!(addresses, vec!["00001000", "00002000", "00003000"]);
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(sanitize_file_name("src/app.js"), "src_app_js");
        assert_eq!(sanitize_file_name("C:\\code\\a.js"), "C__code_a_js");
        assert_eq!(sanitize_file_name("[extern]"), "[extern]");
        assert_eq!(sanitize_file_name("weird?<name>"), "weird__name_");
    }
}
