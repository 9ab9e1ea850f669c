use anyhow::{Context, Result};
use clap::Parser;
use lifetrace::{
    cli::Cli, config::TrackerConfig, output::EventWriter, replay::Replayer,
    tracker::ProcessTracker,
};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber; --debug enables everything down to TRACE
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_trace(args: &Cli) -> Result<Box<dyn BufRead>> {
    if args.reads_stdin() {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let file = File::open(&args.trace)
        .with_context(|| format!("Failed to open trace {}", args.trace.display()))?;
    Ok(Box::new(BufReader::new(file)))
}

fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing(args.debug);

    let base = match &args.config {
        Some(path) => TrackerConfig::from_file(path)?,
        None => TrackerConfig::default(),
    };
    let config = args.apply_overrides(base);
    tracing::debug!("tracker configuration: {:?}", config);

    let reader = open_trace(&args)?;
    let stdout = io::stdout();
    let mut writer = EventWriter::new(stdout.lock(), args.format);
    let mut write_error: Option<io::Error> = None;

    let replayer = Replayer::new(ProcessTracker::new(config));
    let summary = replayer
        .run(reader, |event| {
            if write_error.is_none() {
                if let Err(e) = writer.write_event(event) {
                    write_error = Some(e);
                }
            }
        })
        .with_context(|| format!("Replay of {} failed", args.trace.display()))?;

    if let Some(e) = write_error {
        return Err(e).context("Failed to write notifications");
    }
    writer.finish()?;

    if args.summary {
        summary.print_summary();
    }

    Ok(())
}
