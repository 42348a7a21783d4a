//! Test position generator: a point under random acceleration bouncing around a room.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use shmflow::stage::{self, CommonArgs, Completion};
use shmflow::Channel::Structs::{Point2D, Position2D, UnitOfLength};
use shmflow::{PayloadDescriptor, SampleMeta, Shutdown, Sink};
use std::process::ExitCode;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "positest", about = "Publish simulated positions to SINK")]
struct Args {
    /// Channel to publish on
    sink: String,

    /// Samples per second
    #[arg(short, long)]
    rate: Option<f64>,

    /// Samples to publish before end-of-stream; 0 publishes until interrupted
    #[arg(short = 'n', long, default_value_t = 0)]
    count: u64,

    #[command(flatten)]
    common: CommonArgs,
}

/// `[room]` is `[x, y, width, height]` in world units.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PositestOptions {
    rate: Option<f64>,
    room: Option<[f64; 4]>,
    seed: Option<u64>,
}

const DEFAULT_RATE: f64 = 50.0;
const DEFAULT_ROOM: [f64; 4] = [0.0, 0.0, 728.0, 480.0];
const MAX_SPEED: f64 = 200.0;
const ACCEL_SCALE: f64 = 400.0;

fn main() -> ExitCode {
    stage::init_logging();
    let args = Args::parse();
    stage::finish("positest", run(&args))
}

fn run(args: &Args) -> Result<Completion> {
    let options: PositestOptions = args.common.component_config()?.unwrap_or_default();
    let rate = args.rate.or(options.rate).unwrap_or(DEFAULT_RATE);
    if !(rate > 0.0) {
        anyhow::bail!("rate must be positive, got {}", rate);
    }
    let period = Duration::try_from_secs_f64(1.0 / rate)
        .with_context(|| format!("rate {} Hz is out of range", rate))?;
    let rng = match options.seed {
        Some(seed) => fastrand::Rng::with_seed(seed),
        None => fastrand::Rng::new(),
    };
    let mut sim = Simulation::new(options.room.unwrap_or(DEFAULT_ROOM), rng);

    let shutdown = Shutdown::install()?;
    let registry = args.common.registry()?;
    let mut sink = Sink::create(
        &registry,
        &args.sink,
        PayloadDescriptor::position(),
        &args.common.channel_config(&shutdown),
    )
    .with_context(|| format!("creating channel '{}'", args.sink))?;
    println!("positest publishing at {} Hz on '{}'", rate, args.sink);

    if !args.common.no_console {
        stage::spawn_console(&shutdown)?;
    }

    let started = Instant::now();
    let mut sent = 0u64;

    let result = loop {
        if args.count != 0 && sent == args.count {
            break Ok(Completion::EndOfStream);
        }
        let due = started + period.mul_f64(sent as f64);
        let now = Instant::now();
        if due > now {
            std::thread::sleep(due - now);
        }

        let position = sim.step(period.as_secs_f64());
        let mut slot = match sink.next_slot() {
            Ok(slot) => slot,
            Err(e) => break Err(e),
        };
        let published = position
            .encode_into(slot.as_mut_slice())
            .and_then(|len| slot.publish(SampleMeta::now(len)));
        if let Err(e) = published {
            break Err(e);
        }
        sent += 1;
    };

    sink.set_end_of_stream();
    log::info!("positest published {} positions", sent);
    stage::interrupted_ok(result).with_context(|| format!("publishing on '{}'", args.sink))
}

struct Simulation {
    room: [f64; 4],
    position: Point2D,
    velocity: Point2D,
    rng: fastrand::Rng,
}

impl Simulation {
    fn new(room: [f64; 4], rng: fastrand::Rng) -> Self {
        let [x, y, w, h] = room;
        Self {
            room,
            position: Point2D::new(x + w / 2.0, y + h / 2.0),
            velocity: Point2D::default(),
            rng,
        }
    }

    fn step(&mut self, dt: f64) -> Position2D {
        let ax = (self.rng.f64() - 0.5) * ACCEL_SCALE;
        let ay = (self.rng.f64() - 0.5) * ACCEL_SCALE;
        self.velocity.x = (self.velocity.x + ax * dt).clamp(-MAX_SPEED, MAX_SPEED);
        self.velocity.y = (self.velocity.y + ay * dt).clamp(-MAX_SPEED, MAX_SPEED);

        let [x0, y0, w, h] = self.room;
        let (x, vx) = bounce(self.position.x + self.velocity.x * dt, self.velocity.x, x0, x0 + w);
        let (y, vy) = bounce(self.position.y + self.velocity.y * dt, self.velocity.y, y0, y0 + h);
        self.position = Point2D::new(x, y);
        self.velocity = Point2D::new(vx, vy);

        let speed = vx.hypot(vy);
        Position2D {
            label: "positest".into(),
            unit: UnitOfLength::Worldunits,
            position: Some(self.position),
            velocity: Some(self.velocity),
            heading: (speed > 0.0).then(|| Point2D::new(vx / speed, vy / speed)),
            region: None,
        }
    }
}

/// Reflect off the walls `lo` and `hi`.
fn bounce(p: f64, v: f64, lo: f64, hi: f64) -> (f64, f64) {
    if p < lo {
        ((2.0 * lo - p).min(hi), -v)
    } else if p > hi {
        ((2.0 * hi - p).max(lo), -v)
    } else {
        (p, v)
    }
}
