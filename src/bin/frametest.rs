//! Synthetic frame server: publishes a moving gradient test pattern.

use anyhow::{bail, Context, Result};
use clap::Parser;
use shmflow::stage::{self, CommonArgs, Completion};
use shmflow::{PayloadDescriptor, PixelFormat, SampleMeta, Shutdown, Sink};
use std::process::ExitCode;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "frametest", about = "Serve synthetic test frames to SINK")]
struct Args {
    /// Channel to publish on
    sink: String,

    /// Frames to serve before end-of-stream; 0 serves until interrupted
    #[arg(short = 'n', long, default_value_t = 0)]
    count: u64,

    /// Frame rate; 0 serves as fast as readers release
    #[arg(short, long, default_value_t = 30.0)]
    fps: f64,

    #[arg(long, default_value_t = 480)]
    rows: u32,

    #[arg(long, default_value_t = 640)]
    cols: u32,

    /// 1 for grayscale, 3 for BGR, 4 for BGRA
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..=4))]
    channels: u32,

    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> ExitCode {
    stage::init_logging();
    let args = Args::parse();
    stage::finish("frametest", run(&args))
}

fn run(args: &Args) -> Result<Completion> {
    let period = match args.fps {
        fps if fps == 0.0 => None,
        fps if fps > 0.0 => Some(
            Duration::try_from_secs_f64(1.0 / fps)
                .with_context(|| format!("frame rate {} is out of range", fps))?,
        ),
        fps => bail!("frame rate must be zero or positive, got {}", fps),
    };
    let shutdown = Shutdown::install()?;
    let registry = args.common.registry()?;
    let format = match args.channels {
        1 => PixelFormat::Gray8,
        3 => PixelFormat::Bgr8,
        4 => PixelFormat::Bgra8,
        n => bail!("unsupported channel count {}", n),
    };
    let descriptor = PayloadDescriptor::frame(args.rows, args.cols, format)?;

    let mut sink = Sink::create(
        &registry,
        &args.sink,
        descriptor,
        &args.common.channel_config(&shutdown),
    )
    .with_context(|| format!("creating channel '{}'", args.sink))?;
    println!("frametest serving {} on '{}'", descriptor, args.sink);

    if !args.common.no_console {
        stage::spawn_console(&shutdown)?;
    }

    let started = Instant::now();
    let mut served = 0u64;

    let result = loop {
        if args.count != 0 && served == args.count {
            break Ok(Completion::EndOfStream);
        }
        if let Some(period) = period {
            let due = started + period.mul_f64(served as f64);
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }

        let mut slot = match sink.next_slot() {
            Ok(slot) => slot,
            Err(e) => break Err(e),
        };
        let len = draw_gradient(slot.as_mut_slice(), args.rows, args.cols, args.channels, served);
        if let Err(e) = slot.publish(SampleMeta::now(len)) {
            break Err(e);
        }
        served += 1;
    };

    sink.set_end_of_stream();
    log::info!("frametest served {} frames", served);
    stage::interrupted_ok(result).with_context(|| format!("serving on '{}'", args.sink))
}

/// Diagonal gradient that scrolls one pixel per frame. Returns bytes written.
fn draw_gradient(buf: &mut [u8], rows: u32, cols: u32, channels: u32, frame: u64) -> usize {
    let (rows, cols, channels) = (rows as usize, cols as usize, channels as usize);
    let shift = frame as usize;
    for (r, row) in buf.chunks_exact_mut(cols * channels).take(rows).enumerate() {
        for (c, px) in row.chunks_exact_mut(channels).enumerate() {
            let v = ((r + c + shift) & 0xff) as u8;
            for (k, b) in px.iter_mut().enumerate() {
                *b = v.wrapping_add((k * 85) as u8);
            }
        }
    }
    rows * cols * channels
}
