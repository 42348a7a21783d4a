//! Frame recorder stand-in: prints a SHA-256 digest of every frame it reads.

use anyhow::{Context, Result};
use clap::Parser;
use sha2::{Digest, Sha256};
use shmflow::stage::{self, CommonArgs, Completion};
use shmflow::{DescriptorExpectation, ElementKind, Received, Shutdown, Source};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "framedigest", about = "Print 'sequence sha256' for each frame on SOURCE")]
struct Args {
    /// Channel to read frames from
    source: String,

    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> ExitCode {
    stage::init_logging();
    let args = Args::parse();
    stage::finish("framedigest", run(&args))
}

fn run(args: &Args) -> Result<Completion> {
    let shutdown = Shutdown::install()?;
    let registry = args.common.registry()?;
    let config = args
        .common
        .channel_config(&shutdown)
        .with_expected(DescriptorExpectation::Kind(ElementKind::Frame));

    let mut source = Source::connect(&registry, &args.source, &config)
        .with_context(|| format!("connecting to '{}'", args.source))?;
    log::info!("framedigest reading {} from '{}'", source.descriptor(), args.source);

    if !args.common.no_console {
        stage::spawn_console(&shutdown)?;
    }

    let mut frames = 0u64;
    let result = loop {
        match source.wait() {
            Ok(Received::EndOfStream) => break Ok(Completion::EndOfStream),
            Ok(Received::Sample(sample)) => {
                let digest = Sha256::digest(sample.bytes());
                let seq = sample.sequence();
                sample.release();
                println!("{} {}", seq, hex::encode(digest));
                frames += 1;
            }
            Err(e) => break Err(e),
        }
    };

    log::info!("framedigest read {} frames", frames);
    stage::interrupted_ok(result).with_context(|| format!("reading '{}'", args.source))
}
