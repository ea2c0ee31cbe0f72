use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::warn;

use miniperf_gecko::convert::{ConvertOptions, Converter};
use miniperf_gecko::dump::{self, DumpReader, DumpSource};
use miniperf_gecko::event::Event;
use miniperf_gecko::profile;
use miniperf_gecko::symbols::{SymbolResolver, SymbolTable};
use miniperf_gecko::trace_file::{self, TraceReader};

#[derive(Debug, Parser)]
#[command(
    name = "miniperf-gecko",
    version,
    about = "\
Convert a kernel sampling trace into Gecko profile JSON.

Reads a binary MiniPerf trace file, a textual record dump, or runs the
trace-dump tool to produce one, resolves the sampled stacks to symbol
names, and writes a profile the Gecko profiler frontend can load."
)]
struct Opt {
    /// Read kernel symbols (in /proc/kallsyms format) from FILE.
    #[arg(short, long, value_name = "FILE")]
    kallsyms: Option<PathBuf>,

    /// Read JavaScript pseudo-symbols from files in DIR.
    #[arg(short, long, value_name = "DIR")]
    jsallsyms_dir: Option<PathBuf>,

    /// Don't collapse apparently-corrupt stacks.
    #[arg(short = 'N', long)]
    noisy: bool,

    /// Disable the platform callchain workarounds (missing-top-frame
    /// substitution and trampoline-caller trimming).
    #[arg(long)]
    no_stack_fixups: bool,

    /// Name or path of the trace-dump executable.
    #[arg(short, long, value_name = "COMMAND", default_value = "perf")]
    perf: String,

    /// Read trace records from FILE; "-" means stdin.
    #[arg(short, long, value_name = "FILE", default_value = "perf.data")]
    input: String,

    /// Accept input in textual dump format instead of a binary trace file.
    #[arg(short = 'D', long)]
    use_dump: bool,

    /// Write the profile to FILE instead of a timestamp-named file.
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
enum RunError {
    #[error("could not read kernel symbols from {}: {}", .0.display(), .1)]
    Kallsyms(PathBuf, #[source] io::Error),

    #[error("could not read {0}: {1}")]
    Input(String, #[source] io::Error),

    #[error(transparent)]
    Trace(#[from] trace_file::Error),

    #[error(transparent)]
    Dump(#[from] dump::Error),

    #[error("could not write profile: {0}")]
    Write(#[source] io::Error),
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let opt = Opt::parse();
    match run(&opt) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(opt: &Opt) -> Result<(), RunError> {
    let resolver = SymbolResolver::from_env();
    let kernel_symbols = match &opt.kallsyms {
        Some(path) => {
            let file = File::open(path).map_err(|e| RunError::Kallsyms(path.clone(), e))?;
            let table = SymbolTable::from_kallsyms("[kernel]", BufReader::new(file))
                .map_err(|e| RunError::Kallsyms(path.clone(), e))?;
            Some(Arc::new(table))
        }
        None => None,
    };
    let options = ConvertOptions {
        clean: !opt.noisy,
        stack_fixups: !opt.no_stack_fixups,
        jsallsyms_dir: opt.jsallsyms_dir.clone(),
    };
    let mut converter = Converter::new(options, resolver, kernel_symbols);

    if opt.use_dump {
        if opt.input == "-" {
            let stdin = io::stdin();
            let mut reader = DumpReader::new(stdin.lock());
            consume(&mut converter, || reader.next_event());
        } else {
            let file =
                File::open(&opt.input).map_err(|e| RunError::Input(opt.input.clone(), e))?;
            let mut reader = DumpReader::new(BufReader::new(file));
            consume(&mut converter, || reader.next_event());
        }
    } else if opt.input == "-" {
        let mut data = Vec::new();
        io::stdin()
            .lock()
            .read_to_end(&mut data)
            .map_err(|e| RunError::Input(opt.input.clone(), e))?;
        let mut reader = TraceReader::new(&data[..])?;
        consume(&mut converter, || reader.next_event());
    } else if sniff_trace_magic(&opt.input)? {
        let file = File::open(&opt.input).map_err(|e| RunError::Input(opt.input.clone(), e))?;
        let mut reader = TraceReader::new(BufReader::new(file))?;
        consume(&mut converter, || reader.next_event());
    } else {
        // Anything without the binary magic is handed to the trace-dump
        // tool. Its exit status is checked only after the stream is fully
        // consumed, so a late failure loses none of the decoded events.
        let mut source = DumpSource::spawn(&opt.perf, &opt.input)?;
        consume(&mut converter, || source.next_event());
        source.finish()?;
    }

    let data = converter.finish();
    let path = opt
        .output
        .clone()
        .unwrap_or_else(profile::default_output_path);
    eprintln!("Writing profile to {}", path.display());
    data.save(&path).map_err(RunError::Write)?;
    Ok(())
}

/// Drain an event source into the converter. A decode error mid-stream is
/// reported and ends the stream; everything decoded so far is kept.
fn consume<E: std::fmt::Display>(
    converter: &mut Converter,
    mut next_event: impl FnMut() -> Result<Option<Event>, E>,
) {
    loop {
        match next_event() {
            Ok(Some(event)) => converter.handle_event(event),
            Ok(None) => break,
            Err(e) => {
                warn!("trace stream ended early: {e}");
                break;
            }
        }
    }
}

fn sniff_trace_magic(input: &str) -> Result<bool, RunError> {
    let mut file = File::open(input).map_err(|e| RunError::Input(input.to_string(), e))?;
    let mut prefix = [0u8; 8];
    let mut filled = 0;
    while filled < prefix.len() {
        match file.read(&mut prefix[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(RunError::Input(input.to_string(), e)),
        }
    }
    Ok(trace_file::is_trace_file(&prefix[..filled]))
}
