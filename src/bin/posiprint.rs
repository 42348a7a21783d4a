//! Position socket: writes each position on SOURCE to stdout as one JSON object.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use shmflow::stage::{self, CommonArgs, Completion};
use shmflow::Channel::Structs::Position2D;
use shmflow::{DescriptorExpectation, ElementKind, Received, Shutdown, Source};
use std::io::{self, Write};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "posiprint", about = "Print positions from SOURCE as JSON")]
struct Args {
    /// Channel to read positions from
    source: String,

    /// Multi-line JSON
    #[arg(short, long)]
    pretty: bool,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Serialize)]
struct Record<'a> {
    sequence: u64,
    timestamp_ns: u64,
    #[serde(flatten)]
    position: &'a Position2D,
}

fn main() -> ExitCode {
    stage::init_logging();
    let args = Args::parse();
    stage::finish("posiprint", run(&args))
}

fn run(args: &Args) -> Result<Completion> {
    let shutdown = Shutdown::install()?;
    let registry = args.common.registry()?;
    let config = args
        .common
        .channel_config(&shutdown)
        .with_expected(DescriptorExpectation::Kind(ElementKind::Position));

    let mut source = Source::connect(&registry, &args.source, &config)
        .with_context(|| format!("connecting to '{}'", args.source))?;

    if !args.common.no_console {
        stage::spawn_console(&shutdown)?;
    }

    let stdout = io::stdout();
    loop {
        let (sequence, timestamp_ns, position) = match source.wait() {
            Ok(Received::EndOfStream) => return Ok(Completion::EndOfStream),
            Ok(Received::Sample(sample)) => {
                let decoded = Position2D::decode(sample.bytes());
                (sample.sequence(), sample.timestamp_ns(), decoded)
            }
            Err(e) => {
                return stage::interrupted_ok(Err(e))
                    .with_context(|| format!("reading '{}'", args.source))
            }
        };
        let position =
            position.with_context(|| format!("sample {} on '{}'", sequence, args.source))?;

        let record = Record {
            sequence,
            timestamp_ns,
            position: &position,
        };
        let mut out = stdout.lock();
        if args.pretty {
            serde_json::to_writer_pretty(&mut out, &record)?;
        } else {
            serde_json::to_writer(&mut out, &record)?;
        }
        writeln!(out)?;
        out.flush()?;
    }
}
