//! flowtxn CLI entry point.

use std::fs::File;
use std::io::{self, BufWriter, Write};

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use flowtxn::capture::{replay, CaptureReader, ReplayOptions};
use flowtxn::cli::{Args, OutputSink};
use flowtxn_core::Engine;

fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries transactions
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(io::stderr)
        .init();

    let mut engine = Engine::new(args.engine_config()).context("Invalid engine configuration")?;

    let mut reader = CaptureReader::open(&args.file)
        .with_context(|| format!("Failed to open capture file: {}", args.file.display()))?;
    tracing::info!(
        path = %args.file.display(),
        format = ?reader.format(),
        compression = %reader.compression(),
        "reading capture"
    );

    let writer: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(File::create(path).with_context(|| {
            format!("Failed to create output file: {}", path.display())
        })?)),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };
    let mut sink = OutputSink::new(writer, args.format);

    let options = ReplayOptions {
        sweep_interval_us: args.sweep_interval_us(),
    };
    let summary = replay(&mut reader, &mut engine, &mut sink, &options)
        .with_context(|| format!("Failed to replay {}", args.file.display()))?;

    let written = sink.written();
    sink.finish().context("Failed to write transactions")?;
    tracing::info!(transactions = written, "done");

    if args.stats {
        let report = json!({
            "capture": summary,
            "engine": engine.stats(),
            "transactions": written,
        });
        eprintln!("{}", serde_json::to_string_pretty(&report)?);
    }

    Ok(())
}
