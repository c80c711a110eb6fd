//! idle-timer - stdin idle watchdog.
//!
//! Treats every line read from stdin as activity and exits once no line has
//! arrived for the configured timeout.

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use idle_timer::Config;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Exit status after Ctrl-C (128 + SIGINT).
const INTERRUPTED: u8 = 130;

/// Exit once stdin has been idle for a while.
///
/// Every line read from stdin counts as activity.
#[derive(Parser, Debug)]
#[command(name = "idle-timer")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Interval between activity samples in milliseconds.
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Inactivity allowed before exiting, in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Copy stdin lines to stdout.
    #[arg(long)]
    echo: bool,

    /// Print the timeout report as JSON.
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Output options for the watch loop.
#[derive(Debug, Clone, Copy, Default)]
struct OutputMode {
    echo: bool,
    json: bool,
}

/// How the watch loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// The idle timeout fired and the report was written.
    TimedOut,
    /// Interrupted before the timeout fired.
    Interrupted,
}

impl From<Outcome> for ExitCode {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::TimedOut => ExitCode::SUCCESS,
            Outcome::Interrupted => ExitCode::from(INTERRUPTED),
        }
    }
}

/// Report printed when the idle timeout fires.
#[derive(Debug, Serialize)]
struct TimeoutReport {
    event: &'static str,
    idle_ms: u64,
    timeout_ms: u64,
    interval_ms: u64,
}

impl TimeoutReport {
    fn new(config: &Config, elapsed: Duration) -> Self {
        Self {
            event: "timeout",
            idle_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            timeout_ms: config.timeout_ms,
            interval_ms: config.interval_ms,
        }
    }

    /// Render as a single output line.
    fn render(&self, json: bool) -> Result<String> {
        if json {
            serde_json::to_string(self).context("Failed to serialize report")
        } else {
            Ok(format!(
                "idle for {} ms (timeout {} ms)",
                self.idle_ms, self.timeout_ms
            ))
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level)?;

    info!("idle-timer v{} starting", env!("CARGO_PKG_VERSION"));

    // Load config, then let flags win
    let mut config =
        Config::load_or_default(args.config.as_deref()).context("Failed to load configuration")?;
    apply_overrides(&mut config, &args);

    config.validate().context("Invalid timer configuration")?;

    info!(
        "Configuration loaded (interval={}ms, timeout={}ms)",
        config.interval_ms, config.timeout_ms
    );

    // Watch stdin until idle or Ctrl-C
    let mode = OutputMode {
        echo: args.echo,
        json: args.json,
    };
    let input = BufReader::new(tokio::io::stdin());
    let mut output = tokio::io::stdout();
    let outcome = run(config, input, &mut output, tokio::signal::ctrl_c(), mode).await?;

    Ok(outcome.into())
}

/// Initialize logging with the specified level.
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(format!("idle_timer={level}"))
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Invalid log level")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

/// Command-line timer settings take precedence over the config file.
fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(interval_ms) = args.interval_ms {
        config.interval_ms = interval_ms;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.timeout_ms = timeout_ms;
    }
}

/// Watch `input` until the idle timer fires or `interrupt` resolves.
///
/// Each line read counts as activity. Reaching end of input does not stop the
/// timer; it fires once the timeout has passed since the last line.
async fn run<R, W, S>(
    config: Config,
    input: R,
    output: &mut W,
    interrupt: S,
    mode: OutputMode,
) -> Result<Outcome>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    S: Future<Output = io::Result<()>>,
{
    let (tx, mut fired) = oneshot::channel();
    let timer = idle_timer::create(
        move |elapsed| {
            let _ = tx.send(elapsed);
        },
        &config,
    )
    .context("Failed to start idle timer")?;

    let mut lines = input.lines();
    let mut input_open = true;
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            // Timer fired: report and finish
            elapsed = &mut fired => {
                let elapsed = elapsed.context("Idle timer stopped without firing")?;
                let line = TimeoutReport::new(&config, elapsed).render(mode.json)?;
                output.write_all(line.as_bytes()).await?;
                output.write_all(b"\n").await?;
                output.flush().await?;
                return Ok(Outcome::TimedOut);
            }

            // Input line: record activity
            line = lines.next_line(), if input_open => {
                match line.context("Failed to read stdin")? {
                    Some(line) => {
                        if let Err(e) = timer.touch() {
                            debug!("Ignoring activity: {}", e);
                        }
                        if mode.echo {
                            output.write_all(line.as_bytes()).await?;
                            output.write_all(b"\n").await?;
                            output.flush().await?;
                        }
                    }
                    None => {
                        // Keep the timer running until it fires
                        debug!("stdin closed, waiting for idle timeout");
                        input_open = false;
                    }
                }
            }

            // Ctrl-C: stop the timer without reporting
            result = &mut interrupt => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Interrupted, stopping idle timer");
                timer.destroy();
                return Ok(Outcome::Interrupted);
            }
        }
    }
}
