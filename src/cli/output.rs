//! Transaction output.
//!
//! [`OutputSink`] is the binary's [`TransactionSink`]: each transaction is
//! written as soon as the engine publishes it, either as one JSON object per
//! line or as a one-line text summary.

use std::io::{self, Write};

use clap::ValueEnum;
use flowtxn_core::{Transaction, TransactionSink};

/// Supported output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// JSON Lines (one JSON object per transaction)
    Json,
    /// Human-readable one-line summary per transaction
    Text,
}

/// Writes transactions to any `Write` target.
///
/// `publish` cannot fail, so the first write error is kept, later
/// transactions are dropped, and [`finish`](Self::finish) reports it.
pub struct OutputSink<W: Write> {
    writer: W,
    format: OutputFormat,
    written: u64,
    error: Option<io::Error>,
}

impl<W: Write> OutputSink<W> {
    pub fn new(writer: W, format: OutputFormat) -> Self {
        Self {
            writer,
            format,
            written: 0,
            error: None,
        }
    }

    /// Transactions written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush the writer and surface any write error.
    pub fn finish(mut self) -> io::Result<W> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        self.writer.flush()?;
        Ok(self.writer)
    }

    fn write(&mut self, txn: &Transaction) -> io::Result<()> {
        match self.format {
            OutputFormat::Json => {
                serde_json::to_writer(&mut self.writer, txn)?;
                self.writer.write_all(b"\n")
            }
            OutputFormat::Text => write_text(&mut self.writer, txn),
        }
    }
}

impl<W: Write> TransactionSink for OutputSink<W> {
    fn publish(&mut self, txn: Transaction) {
        if self.error.is_some() {
            return;
        }
        match self.write(&txn) {
            Ok(()) => self.written += 1,
            Err(err) => {
                tracing::error!(error = %err, "failed to write transaction");
                self.error = Some(err);
            }
        }
    }
}

fn write_text<W: Write>(w: &mut W, txn: &Transaction) -> io::Result<()> {
    write!(
        w,
        "{} {:<6} {} -> {} {:?}",
        txn.timestamp,
        txn.protocol.as_str(),
        txn.client.addr(),
        txn.server.addr(),
        txn.status,
    )?;
    if !txn.method.is_empty() {
        write!(w, " {}", txn.method)?;
    }
    if !txn.path.is_empty() {
        write!(w, " {}", txn.path)?;
    }
    match txn.response_time_us {
        Some(us) => write!(w, " {}us", us)?,
        None => write!(w, " (incomplete)")?,
    }
    for note in &txn.notes {
        write!(w, " [{}]", note)?;
    }
    writeln!(w)
}
