//! Output formats for lifecycle notifications
//!
//! - text: `START task=0x10 asid=0x1000 pid=100 ppid=1`
//! - json: one JSON object per line
//! - csv: header row, then one row per notification

use crate::cli::OutputFormat;
use crate::handle::ProcessHandle;
use crate::tracker::{LifecycleEvent, LifecycleKind};
use serde::Serialize;
use std::io::{self, Write};

/// A notification as emitted in JSON-lines mode
#[derive(Debug, Serialize)]
pub struct JsonLifecycleEvent<'a> {
    pub event: LifecycleKind,
    #[serde(flatten)]
    pub process: &'a ProcessHandle,
}

impl<'a> From<&'a LifecycleEvent> for JsonLifecycleEvent<'a> {
    fn from(e: &'a LifecycleEvent) -> Self {
        Self {
            event: e.kind,
            process: &e.handle,
        }
    }
}

/// Streaming writer for notifications
pub struct EventWriter<W: Write> {
    out: W,
    format: OutputFormat,
    header_written: bool,
    written: usize,
}

impl<W: Write> EventWriter<W> {
    pub fn new(out: W, format: OutputFormat) -> Self {
        Self {
            out,
            format,
            header_written: false,
            written: 0,
        }
    }

    /// Notifications written so far
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn write_event(&mut self, event: &LifecycleEvent) -> io::Result<()> {
        match self.format {
            OutputFormat::Text => writeln!(self.out, "{}", format_text(event))?,
            OutputFormat::Json => {
                let line = serde_json::to_string(&JsonLifecycleEvent::from(event))
                    .map_err(io::Error::other)?;
                writeln!(self.out, "{}", line)?;
            }
            OutputFormat::Csv => {
                if !self.header_written {
                    writeln!(self.out, "{}", CSV_HEADER)?;
                    self.header_written = true;
                }
                writeln!(self.out, "{}", format_csv(event))?;
            }
        }
        self.written += 1;
        Ok(())
    }

    /// Flush and emit the CSV header for empty traces
    pub fn finish(&mut self) -> io::Result<()> {
        if self.format == OutputFormat::Csv && !self.header_written {
            writeln!(self.out, "{}", CSV_HEADER)?;
            self.header_written = true;
        }
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

pub const CSV_HEADER: &str = "event,task_id,asid,pid,ppid";

fn kind_label(kind: LifecycleKind) -> &'static str {
    match kind {
        LifecycleKind::Start => "start",
        LifecycleKind::End => "end",
    }
}

pub fn format_text(event: &LifecycleEvent) -> String {
    format!(
        "{:<5} {}",
        kind_label(event.kind).to_uppercase(),
        event.handle
    )
}

pub fn format_csv(event: &LifecycleEvent) -> String {
    let h = &event.handle;
    format!(
        "{},{:#x},{:#x},{},{}",
        kind_label(event.kind),
        h.task_id,
        h.asid,
        h.pid,
        h.ppid
    )
}
