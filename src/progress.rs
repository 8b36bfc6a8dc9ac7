//! Progress reporting for long summarization and indexing runs.

use std::io::{self, Write};

/// Receives incremental progress from a coordinating run.
pub trait ProgressSink: Send {
    /// Announces how many units the current stage will report.
    fn start_stage(&mut self, _stage: &str, _units: usize) {}

    /// One unit (chunk, batch, resource type, resource) finished.
    fn advance(&mut self, units: usize);

    /// A titled piece of output is ready for display.
    fn publish(&mut self, title: &str, body: &str);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn advance(&mut self, _units: usize) {}

    fn publish(&mut self, _title: &str, _body: &str) {}
}

/// Prints published sections to stdout and a stage counter to stderr.
#[derive(Debug, Default)]
pub struct ConsoleProgress {
    stage: String,
    done: usize,
    total: usize,
    quiet: bool,
}

impl ConsoleProgress {
    /// Console sink; `quiet` suppresses the stderr counter.
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            ..Self::default()
        }
    }
}

impl ProgressSink for ConsoleProgress {
    fn start_stage(&mut self, stage: &str, units: usize) {
        self.stage = stage.to_string();
        self.done = 0;
        self.total = units;
        if !self.quiet {
            eprintln!("[{}] 0/{}", self.stage, self.total);
        }
    }

    fn advance(&mut self, units: usize) {
        self.done += units;
        if !self.quiet {
            eprintln!("[{}] {}/{}", self.stage, self.done, self.total);
        }
    }

    fn publish(&mut self, title: &str, body: &str) {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        // Ignore broken pipes (e.g. `| head`).
        let _ = writeln!(out, "## {title}\n\n{}\n", body.trim());
        let _ = out.flush();
    }
}

/// Records every call; used by tests and by callers that render later.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecordingProgress {
    /// Total units advanced.
    pub advanced: usize,
    /// Stages in start order with their unit counts.
    pub stages: Vec<(String, usize)>,
    /// Published `(title, body)` pairs in order.
    pub published: Vec<(String, String)>,
}

impl ProgressSink for RecordingProgress {
    fn start_stage(&mut self, stage: &str, units: usize) {
        self.stages.push((stage.to_string(), units));
    }

    fn advance(&mut self, units: usize) {
        self.advanced += units;
    }

    fn publish(&mut self, title: &str, body: &str) {
        self.published.push((title.to_string(), body.to_string()));
    }
}
