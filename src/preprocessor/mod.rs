/// The prefix/testcase coordinator.
///
/// Exactly one worker runs the prefix pass: it loads the script table,
/// writes the image table, parses `prefix.trace` and freezes the resulting
/// lookups as the seed every testcase worker starts from. The gate is a
/// double-checked mutex; the done flag flips even when the prefix pass
/// fails, so waiting workers fail fast instead of re-attempting it.
///
/// After the prefix, testcase workers run fully in parallel. Each one owns
/// private overlays of the line table and heap objects and reaches the
/// shared lookups through concurrent get-or-insert maps.
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{anyhow, Context, Result};
use dashmap::{DashMap, DashSet};
use log::{debug, info};

use crate::config::Config;
use crate::core::address::AddressSpace;
use crate::core::heap::HeapObject;
use crate::core::types::{
    load_images, Image, TraceError, UNKNOWN_FUNCTION_ADDRESS, UNKNOWN_FUNCTION_NAME,
};
use crate::parser::EventParser;
use crate::reader::LineReader;
use crate::storage::{write_image_table, TraceWriter};
use crate::ui;

/// Run-wide state, immutable after the prefix pass publishes it. The
/// concurrent maps carry get-or-insert traffic from all testcase workers;
/// the seed fields are cloned into worker-local overlays.
pub struct SharedState {
    pub(crate) images: Vec<Image>,
    pub(crate) address_space: AddressSpace,
    /// Per image: (start, end) address pair to function name, first
    /// observation wins.
    pub(crate) function_names: Vec<DashMap<(u32, u32), String>>,
    /// Every (image, address) the trace referenced; drained by the map-file
    /// emitter at shutdown.
    pub(crate) requested: DashSet<(i32, u32)>,
    pub(crate) line_table_seed: HashMap<i32, String>,
    pub(crate) heap_seed: HashMap<i32, Arc<HeapObject>>,
    pub(crate) next_heap_allocation_seed: u64,
    prefix_trace: Option<Vec<u8>>,
}

impl SharedState {
    pub(crate) fn new(images: Vec<Image>, columns_bits: u32) -> SharedState {
        let image_count = images.len();
        SharedState {
            address_space: AddressSpace::new(image_count, columns_bits),
            function_names: (0..image_count).map(|_| DashMap::new()).collect(),
            requested: DashSet::new(),
            images,
            line_table_seed: HashMap::new(),
            heap_seed: HashMap::new(),
            next_heap_allocation_seed: 0,
            prefix_trace: None,
        }
    }

    pub fn images(&self) -> &[Image] {
        &self.images
    }

    /// Id of the synthetic `[extern]` image (always the last one).
    pub fn extern_image_id(&self) -> i32 {
        self.images.len() as i32 - 1
    }

    pub(crate) fn image_index(&self, script_id: i32) -> Result<usize> {
        if script_id < 0 || script_id >= self.extern_image_id() {
            return Err(TraceError::UnknownScriptId(script_id).into());
        }
        Ok(script_id as usize)
    }

    pub(crate) fn request(&self, image: i32, address: u32) {
        self.requested.insert((image, address));
    }

    pub(crate) fn record_function_name(&self, image: i32, start: u32, end: u32, name: &str) {
        self.function_names[image as usize]
            .entry((start, end))
            .or_insert_with(|| name.to_owned());
    }
}

/// Result of preprocessing one testcase.
#[derive(Debug)]
pub enum TestcaseTrace {
    /// Records kept in memory for an in-process consumer.
    Memory(Vec<u8>),
    /// Records persisted under the configured output directory.
    File(PathBuf),
}

pub struct Preprocessor {
    config: Config,
    state: OnceLock<SharedState>,
    prefix_done: AtomicBool,
    prefix_gate: Mutex<()>,
}

impl Preprocessor {
    pub fn new(config: Config) -> Result<Preprocessor> {
        config.validate()?;
        fs::create_dir_all(&config.map_directory).with_context(|| {
            format!(
                "Failed to create map directory {}",
                config.map_directory.display()
            )
        })?;
        if let Some(output_directory) = &config.output_directory {
            fs::create_dir_all(output_directory).with_context(|| {
                format!(
                    "Failed to create output directory {}",
                    output_directory.display()
                )
            })?;
        }
        Ok(Preprocessor {
            config,
            state: OnceLock::new(),
            prefix_done: AtomicBool::new(false),
            prefix_gate: Mutex::new(()),
        })
    }

    /// Preprocesses one raw testcase trace. The first caller also runs the
    /// prefix pass over `scripts.txt` and `prefix.trace` next to the
    /// testcase file; concurrent callers wait at the gate until it is done.
    pub fn process_testcase(&self, raw_trace: &Path) -> Result<TestcaseTrace> {
        let trace_directory = raw_trace
            .parent()
            .context("testcase trace path has no parent directory")?;
        let state = self.ensure_prefix(trace_directory)?;

        let input = File::open(raw_trace)
            .with_context(|| format!("Failed to open testcase trace {}", raw_trace.display()))?;
        let input_size = input
            .metadata()
            .with_context(|| format!("Failed to stat {}", raw_trace.display()))?
            .len() as usize;

        let (mut sink, output_path) = if self.config.store_traces {
            let file_name = raw_trace
                .file_name()
                .context("testcase trace path has no file name")?
                .to_string_lossy();
            let path = self
                .output_directory()?
                .join(format!("{}.preprocessed", file_name));
            (TraceWriter::file(&path)?, Some(path))
        } else {
            (TraceWriter::memory(input_size), None)
        };

        let mut reader = LineReader::new(input);
        let mut parser = EventParser::testcase(state);
        parser
            .process(&mut reader, &mut sink)
            .with_context(|| format!("Failed to preprocess {}", raw_trace.display()))?;

        match (sink.finish()?, output_path) {
            (_, Some(path)) => {
                debug!("Wrote preprocessed trace {}", path.display());
                Ok(TestcaseTrace::File(path))
            }
            (Some(bytes), None) => Ok(TestcaseTrace::Memory(bytes)),
            (None, None) => Err(anyhow!("trace sink produced no output")),
        }
    }

    /// Walks the requested (image, address) pairs and writes one `.map`
    /// text file per image into the configured map directory.
    pub fn write_map_files(&self) -> Result<()> {
        let state = self
            .state
            .get()
            .context("map files require a completed prefix pass")?;
        ui::map::write_map_files(&self.config.map_directory, state)
    }

    /// The preprocessed prefix trace, when it was kept in memory.
    pub fn prefix_trace(&self) -> Option<&[u8]> {
        self.state.get().and_then(|state| state.prefix_trace.as_deref())
    }

    /// The shared state, once the prefix pass has published it.
    pub fn state(&self) -> Option<&SharedState> {
        self.state.get()
    }

    fn ensure_prefix(&self, trace_directory: &Path) -> Result<&SharedState> {
        if !self.prefix_done.load(Ordering::Acquire) {
            let _gate = self.prefix_gate.lock().unwrap();
            if !self.prefix_done.load(Ordering::Acquire) {
                let result = self.run_prefix(trace_directory);
                // Flips even on failure: waiting workers must not re-run
                // the prefix, they fail fast below instead.
                self.prefix_done.store(true, Ordering::Release);
                result?;
            }
        }
        self.state
            .get()
            .context("prefix pass failed; testcase cannot be processed")
    }

    fn run_prefix(&self, trace_directory: &Path) -> Result<()> {
        info!("Prefix pass over {}", trace_directory.display());
        let images = load_images(&trace_directory.join("scripts.txt"))?;
        debug!("Loaded {} images (including [extern])", images.len());

        let mut state = SharedState::new(images, self.config.columns_bits);
        let extern_image = state.extern_image_id();
        state.record_function_name(
            extern_image,
            UNKNOWN_FUNCTION_ADDRESS,
            UNKNOWN_FUNCTION_ADDRESS,
            UNKNOWN_FUNCTION_NAME,
        );
        state.request(extern_image, UNKNOWN_FUNCTION_ADDRESS);

        let prefix_path = trace_directory.join("prefix.trace");
        let input = File::open(&prefix_path)
            .with_context(|| format!("Failed to open prefix trace {}", prefix_path.display()))?;
        let input_size = input
            .metadata()
            .with_context(|| format!("Failed to stat {}", prefix_path.display()))?
            .len() as usize;

        let mut sink = if self.config.store_traces {
            TraceWriter::file(&self.output_directory()?.join("prefix.trace.preprocessed"))?
        } else {
            TraceWriter::memory(input_size)
        };
        write_image_table(&mut sink, &state.images)?;

        let mut reader = LineReader::new(input);
        let mut parser = EventParser::prefix(&state);
        parser
            .process(&mut reader, &mut sink)
            .with_context(|| format!("Failed to preprocess {}", prefix_path.display()))?;

        // Freeze the parser's tables as the seed every testcase starts from.
        let (line_table, heap) = parser.into_seed();
        let (heap_objects, next_heap_allocation) = heap.into_seed();
        state.line_table_seed = line_table;
        state.heap_seed = heap_objects;
        state.next_heap_allocation_seed = next_heap_allocation;
        state.prefix_trace = sink.finish()?;

        self.state
            .set(state)
            .map_err(|_| anyhow!("prefix state initialized twice"))?;
        info!("Prefix pass complete");
        Ok(())
    }

    fn output_directory(&self) -> Result<&Path> {
        self.config
            .output_directory
            .as_deref()
            .context("storing traces requires an output directory")
    }
}
