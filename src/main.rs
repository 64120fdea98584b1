use std::path::PathBuf;
use std::thread;

use anyhow::{bail, Result};
use clap::Parser;
use log::info;

use jstracepp::{Config, Preprocessor, TestcaseTrace};

/// Converts textual JavaScript execution traces into binary traces and
/// per-image symbol maps.
#[derive(Debug, Parser)]
#[command(name = "jstracepp", version, about)]
struct Args {
    /// Raw testcase trace files. `scripts.txt` and `prefix.trace` are
    /// expected next to them.
    #[arg(required = true, value_name = "TRACE")]
    traces: Vec<PathBuf>,

    /// Directory for the per-image .map files (created if absent).
    #[arg(long, value_name = "DIR")]
    map_directory: PathBuf,

    /// Directory for preprocessed binary traces.
    #[arg(long, value_name = "DIR")]
    output_directory: Option<PathBuf>,

    /// Persist preprocessed traces to the output directory.
    #[arg(long, requires = "output_directory")]
    store_traces: bool,

    /// Bit width of the column part of a source-position address (max 30).
    #[arg(long, default_value_t = jstracepp::config::DEFAULT_COLUMNS_BITS)]
    columns_bits: u32,
}

fn main() {
    env_logger::init();
    if let Err(e) = do_main() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn do_main() -> Result<()> {
    let args = Args::parse();
    let preprocessor = Preprocessor::new(Config {
        map_directory: args.map_directory,
        output_directory: args.output_directory,
        store_traces: args.store_traces,
        columns_bits: args.columns_bits,
    })?;

    // One worker per testcase, the same scheduling the pipeline driver uses.
    // The first worker to arrive runs the prefix pass; the rest wait at the
    // gate, then fan out.
    let mut failures = 0;
    thread::scope(|scope| {
        let handles: Vec<_> = args
            .traces
            .iter()
            .map(|path| {
                let preprocessor = &preprocessor;
                scope.spawn(move || (path, preprocessor.process_testcase(path)))
            })
            .collect();
        for handle in handles {
            let (path, result) = handle.join().expect("testcase worker panicked");
            match result {
                Ok(TestcaseTrace::Memory(bytes)) => {
                    info!("{}: {} bytes preprocessed", path.display(), bytes.len())
                }
                Ok(TestcaseTrace::File(output)) => {
                    info!("{}: wrote {}", path.display(), output.display())
                }
                Err(e) => {
                    failures += 1;
                    eprintln!("{}: {:#}", path.display(), e);
                }
            }
        }
    });

    preprocessor.write_map_files()?;
    if failures > 0 {
        bail!("{} testcase(s) failed", failures);
    }
    Ok(())
}
