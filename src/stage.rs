//! Plumbing shared by the pipeline stage executables: logging setup, component
//! configuration files, the console control loop and the exit policy.

use crate::Channel::{ChannelConfig, Registry, Shutdown};
use anyhow::{anyhow, bail, Context};
use serde::de::DeserializeOwned;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Options every stage accepts.
#[derive(clap::Args, Debug, Clone)]
pub struct CommonArgs {
    /// Channel namespace; stages only see channels in the same namespace
    #[arg(long, env = "SHMFLOW_NAMESPACE", default_value = crate::Channel::DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// TOML configuration file
    #[arg(short = 'c', long)]
    pub config_file: Option<PathBuf>,

    /// Table within the configuration file holding this component's options
    #[arg(short = 'k', long)]
    pub config_key: Option<String>,

    /// Seconds to wait for an upstream sink before giving up
    #[arg(long, default_value_t = 10)]
    pub connect_timeout: u64,

    /// Sources a sink waits for before publishing its first sample
    #[arg(long, default_value_t = 0)]
    pub readers: usize,

    /// Do not start the interactive console
    #[arg(long)]
    pub no_console: bool,
}

impl CommonArgs {
    pub fn registry(&self) -> anyhow::Result<Registry> {
        Registry::new(&self.namespace)
            .with_context(|| format!("invalid namespace '{}'", self.namespace))
    }

    pub fn channel_config(&self, shutdown: &Shutdown) -> ChannelConfig {
        ChannelConfig::new()
            .with_connect_timeout(Duration::from_secs(self.connect_timeout))
            .with_expected_readers(self.readers)
            .with_shutdown(shutdown.clone())
    }

    /// Load this component's table, if a file was given. File and key come as a pair.
    pub fn component_config<T: DeserializeOwned>(&self) -> anyhow::Result<Option<T>> {
        match (&self.config_file, &self.config_key) {
            (None, None) => Ok(None),
            (Some(file), Some(key)) => {
                let text = std::fs::read_to_string(file)
                    .with_context(|| format!("reading {}", file.display()))?;
                parse_component_config(&text, key)
                    .with_context(|| format!("in {}", file.display()))
                    .map(Some)
            }
            _ => bail!("config file must be supplied with a corresponding config key"),
        }
    }
}

/// Deserialize table `key` of a TOML document. Unknown options are rejected by `T`.
pub fn parse_component_config<T: DeserializeOwned>(text: &str, key: &str) -> anyhow::Result<T> {
    let mut doc: toml::Table = text.parse().context("invalid TOML")?;
    let table = doc
        .remove(key)
        .ok_or_else(|| anyhow!("no configuration table named '{}'", key))?;
    table
        .try_into()
        .with_context(|| format!("invalid options in table '{}'", key))
}

/// env_logger with an `info` default, as every stage starts.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

/// How a stage's processing loop ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Upstream end-of-stream, or the stage ran its course
    EndOfStream,
    /// Ctrl-C or the console's exit command
    Interrupted,
}

/// Fold `Error::Interrupted` into the graceful path.
pub fn interrupted_ok(result: crate::Result<Completion>) -> anyhow::Result<Completion> {
    match result {
        Err(e) if e.is_interrupted() => Ok(Completion::Interrupted),
        Err(e) => Err(e.into()),
        Ok(c) => Ok(c),
    }
}

/// Exit policy: end-of-stream and interruption exit zero; anything else prints a
/// diagnostic and exits non-zero.
pub fn finish(component: &str, result: anyhow::Result<Completion>) -> ExitCode {
    match result {
        Ok(Completion::EndOfStream) => {
            println!("{} received end-of-stream; exiting.", component);
            ExitCode::SUCCESS
        }
        Ok(Completion::Interrupted) => {
            println!("{} interrupted; exiting.", component);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}: error: {:#}", component, e);
            ExitCode::FAILURE
        }
    }
}

/// Console commands.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Exit,
    Help,
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "x" | "exit" | "quit" => Some(Command::Exit),
            "h" | "help" | "?" => Some(Command::Help),
            _ => None,
        }
    }
}

pub fn print_commands(out: &mut impl Write) -> io::Result<()> {
    writeln!(out, "COMMANDS:")?;
    writeln!(out, "  x: Exit.")?;
    writeln!(out, "  h: Help.")
}

/// Run the control loop over `input` until exit or end of input.
///
/// The only thing it shares with the processing loop is `shutdown`.
pub fn control_loop(
    input: impl BufRead,
    out: &mut impl Write,
    shutdown: &Shutdown,
) -> io::Result<()> {
    print_commands(out)?;
    for line in input.lines() {
        if shutdown.is_triggered() {
            break;
        }
        match Command::parse(&line?) {
            Some(Command::Exit) => {
                shutdown.trigger();
                break;
            }
            Some(Command::Help) => print_commands(out)?,
            None => writeln!(out, "Invalid selection. Try again.")?,
        }
    }
    Ok(())
}

/// Start the interactive console on stdin in its own thread. Not joined: a stage
/// that finishes on end-of-stream exits while the console is still reading.
pub fn spawn_console(shutdown: &Shutdown) -> io::Result<JoinHandle<()>> {
    let shutdown = shutdown.clone();
    thread::Builder::new()
        .name("console".into())
        .spawn(move || {
            let stdin = io::stdin();
            let mut stdout = io::stdout();
            if let Err(e) = control_loop(stdin.lock(), &mut stdout, &shutdown) {
                log::warn!("console stopped: {}", e);
            }
        })
}
