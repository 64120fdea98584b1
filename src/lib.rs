//! Preprocessor for JavaScript execution traces.
//!
//! Upstream instrumentation emits a compact textual trace of control-flow
//! events and heap property accesses. This crate decompresses those traces,
//! synthesizes a 32-bit relative address space for source positions, heap
//! objects and external functions, and serializes the result into the
//! binary trace format consumed by the statistical leakage analyzers,
//! together with per-image `.map` symbol files.
//!
//! The usual flow: build a [`Config`], construct a [`Preprocessor`], call
//! [`Preprocessor::process_testcase`] from as many threads as there are
//! testcases (the first call runs the shared prefix pass), then
//! [`Preprocessor::write_map_files`] once everything is done.

pub mod config;
pub mod core;
pub mod decompress;
pub mod parser;
pub mod preprocessor;
pub mod reader;
pub mod storage;
pub mod ui;

pub use config::Config;
pub use preprocessor::{Preprocessor, TestcaseTrace};
