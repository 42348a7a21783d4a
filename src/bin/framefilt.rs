//! Per-pixel frame filter: reads frames from SOURCE, writes filtered frames to SINK.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use shmflow::stage::{self, CommonArgs, Completion};
use shmflow::{
    DescriptorExpectation, ElementKind, Received, SampleMeta, Shutdown, Sink, Source,
};
use std::process::ExitCode;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum FilterType {
    /// 255 - v for every byte
    Invert,
    /// 255 at or above the threshold, 0 below
    Threshold,
}

#[derive(Parser, Debug)]
#[command(name = "framefilt", about = "Filter frames from SOURCE into SINK")]
struct Args {
    #[arg(value_enum)]
    kind: FilterType,

    /// Channel to read frames from
    source: String,

    /// Channel to publish filtered frames on
    sink: String,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilterOptions {
    threshold: Option<u8>,
}

const DEFAULT_THRESHOLD: u8 = 128;

fn main() -> ExitCode {
    stage::init_logging();
    let args = Args::parse();
    stage::finish("framefilt", run(&args))
}

fn run(args: &Args) -> Result<Completion> {
    let options: FilterOptions = args.common.component_config()?.unwrap_or_default();
    let threshold = options.threshold.unwrap_or(DEFAULT_THRESHOLD);
    let shutdown = Shutdown::install()?;
    let registry = args.common.registry()?;
    let config = args.common.channel_config(&shutdown);

    let mut source = Source::connect(
        &registry,
        &args.source,
        &config
            .clone()
            .with_expected(DescriptorExpectation::Kind(ElementKind::Frame)),
    )
    .with_context(|| format!("connecting to '{}'", args.source))?;

    // Output frames keep the input geometry
    let mut sink = Sink::create(&registry, &args.sink, *source.descriptor(), &config)
        .with_context(|| format!("creating channel '{}'", args.sink))?;
    println!(
        "framefilt {:?}: '{}' -> '{}' ({})",
        args.kind,
        args.source,
        args.sink,
        source.descriptor()
    );

    if !args.common.no_console {
        stage::spawn_console(&shutdown)?;
    }

    let result = filter_loop(&mut source, &mut sink, args.kind, threshold);
    sink.set_end_of_stream();
    stage::interrupted_ok(result)
        .with_context(|| format!("filtering '{}' into '{}'", args.source, args.sink))
}

fn filter_loop(
    source: &mut Source,
    sink: &mut Sink,
    kind: FilterType,
    threshold: u8,
) -> shmflow::Result<Completion> {
    loop {
        let sample = match source.wait()? {
            Received::EndOfStream => return Ok(Completion::EndOfStream),
            Received::Sample(sample) => sample,
        };

        let mut slot = sink.next_slot()?;
        let input = sample.bytes();
        let output = &mut slot.as_mut_slice()[..input.len()];
        match kind {
            FilterType::Invert => {
                for (o, i) in output.iter_mut().zip(input) {
                    *o = 255 - *i;
                }
            }
            FilterType::Threshold => {
                for (o, i) in output.iter_mut().zip(input) {
                    *o = if *i >= threshold { 255 } else { 0 };
                }
            }
        }
        let meta = SampleMeta::with_timestamp(input.len(), sample.timestamp_ns());
        sample.release();
        slot.publish(meta)?;
    }
}
