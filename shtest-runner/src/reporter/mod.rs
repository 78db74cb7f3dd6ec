// Copyright (c) The shtest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Terminal and batch progress printing.
//!
//! Parallel slots must not interleave mid-line on stdout, so every slot
//! other than the first accumulates output in a backlog from which only
//! completed lines are promoted. On an interactive terminal the current
//! line is redrawn in place instead.

use crate::{
    config::RunnerOptions,
    helpers::{dot_pad, format_mm_ss},
    journal::{Journal, TestStatus},
    runner::RusageSnapshot,
};
use owo_colors::{OwoColorize, Style};
use std::{
    io::{self, IsTerminal, Write},
    time::Duration,
};
use swrite::{swrite, SWrite};

/// The column batch result tags are dot-aligned to.
const RESULT_COLUMN: usize = 64;

/// The output phase of a progress line.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    /// Starting a line.
    First,
    /// Overwriting the current line.
    Update,
    /// The final result for a line.
    Last,
}

#[derive(Debug, Default)]
struct Styles {
    pass: Style,
    fail: Style,
    skip: Style,
}

impl Styles {
    fn colorize(&mut self) {
        self.pass = Style::new().green().bold();
        self.fail = Style::new().red().bold();
        self.skip = Style::new().yellow().bold();
    }

    fn for_status(&self, status: TestStatus) -> Style {
        match status {
            TestStatus::Passed => self.pass,
            TestStatus::Skipped | TestStatus::KnownFail | TestStatus::Warned => self.skip,
            _ => self.fail,
        }
    }
}

/// The progress printer.
#[derive(Debug)]
pub struct Reporter {
    batch: bool,
    verbose: bool,
    is_tty: bool,
    backlogs: Vec<String>,
    styles: Styles,
}

impl Reporter {
    /// Creates a reporter for a run with the given options.
    pub fn new(options: &RunnerOptions) -> Self {
        let is_tty = io::stdout().is_terminal();
        let mut styles = Styles::default();
        if is_tty && !options.batch && supports_color::on(supports_color::Stream::Stdout).is_some()
        {
            styles.colorize();
        }
        Self {
            batch: options.batch,
            verbose: options.verbose,
            is_tty,
            backlogs: vec![String::new(); options.jobs.max(1)],
            styles,
        }
    }

    fn interactive(&self) -> bool {
        self.is_tty && !self.batch
    }

    /// Routes one chunk of progress text for a slot.
    fn emit(&mut self, slot: usize, phase: Phase, text: &str) {
        if self.interactive() {
            let mut out = io::stdout().lock();
            let _ = match phase {
                Phase::First => out.write_all(text.as_bytes()),
                Phase::Update => write!(out, "\r{text}"),
                Phase::Last if self.verbose => out.write_all(text.as_bytes()),
                Phase::Last => write!(out, "\r{text}"),
            };
            let _ = out.flush();
            return;
        }

        // Batch or non-tty: only batch routes the intermediate phases, and
        // slots beyond the first are backlogged until a line completes.
        if !self.batch && phase != Phase::Last {
            return;
        }
        if slot == 0 {
            let mut out = io::stdout().lock();
            let _ = out.write_all(text.as_bytes());
            let _ = out.flush();
        } else {
            self.backlogs[slot].push_str(text);
        }
    }

    /// A test has started.
    pub fn test_started(&mut self, slot: usize, id: &str) {
        if self.batch {
            return;
        }
        let text = if self.verbose {
            format!("### running: {id}\n")
        } else {
            format!("### running: {id}")
        };
        self.emit(slot, Phase::First, &text);
    }

    /// Periodic pulse for a still-running test.
    pub fn test_running(&mut self, slot: usize, id: &str, elapsed: Duration) {
        let text = format!("### running: {id} {}", format_mm_ss(elapsed));
        self.emit(slot, Phase::Update, &text);
    }

    /// The final result line for a test.
    pub fn test_finished(
        &mut self,
        slot: usize,
        id: &str,
        status: TestStatus,
        wall: Duration,
        rusage: Option<&RusageSnapshot>,
    ) {
        let mut text = String::new();
        if self.batch {
            swrite!(text, "{}{}\n", dot_pad(id, RESULT_COLUMN), status.tag());
            if status == TestStatus::Passed {
                if let Some(rusage) = rusage {
                    swrite!(text, "{}\n", rusage_line(wall, rusage));
                }
            }
        } else {
            let style = self.styles.for_status(status);
            swrite!(text, "{} {}\n", status.tag().style(style), id);
        }
        self.emit(slot, Phase::Last, &text);
    }

    /// Replays a failed test's captured output to stdout.
    pub fn replay(&mut self, bytes: &[u8]) {
        let mut out = io::stdout().lock();
        let _ = out.write_all(bytes);
        let _ = out.flush();
    }

    /// Writes a supervisor message on its own line.
    pub fn message(&mut self, text: &str) {
        self.flush();
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "{text}");
        let _ = out.flush();
    }

    /// Promotes all complete lines from every slot's backlog to stdout,
    /// keeping the trailing partial line.
    pub fn flush(&mut self) {
        let mut out = io::stdout().lock();
        for backlog in &mut self.backlogs {
            if let Some(pos) = backlog.rfind('\n') {
                let _ = out.write_all(backlog[..=pos].as_bytes());
                backlog.drain(..=pos);
            }
        }
        let _ = out.flush();
    }

    /// The final report: banner totals, then every relevant non-passed
    /// case. With `fatal`, not-yet-done entries are listed too, so an
    /// interrupted run shows its remaining state.
    pub fn finish(&mut self, journal: &Journal, fatal: bool) {
        self.flush();
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "{}", journal.banner());
        for (id, status) in journal.entries() {
            let relevant = if fatal {
                status != TestStatus::Passed
            } else {
                status.is_done() && status != TestStatus::Passed && status != TestStatus::Skipped
            };
            if relevant {
                let style = self.styles.for_status(status);
                let _ = writeln!(out, "{} {}", status.tag().style(style), id);
            }
        }
        let _ = out.flush();
    }
}

/// The one-line resource summary printed for passing tests in batch mode.
fn rusage_line(wall: Duration, rusage: &RusageSnapshot) -> String {
    format!(
        "{} wall {} user {} sys {:>6}M RSS | IOPS: {:.1} K in {:.1} K out",
        format_mm_ss(wall),
        format_mm_ss(rusage.user),
        format_mm_ss(rusage.sys),
        rusage.max_rss_kb / 1024,
        rusage.inblock as f64 / 1000.0,
        rusage.oublock as f64 / 1000.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rusage_line_format() {
        let rusage = RusageSnapshot {
            user: Duration::from_secs(2),
            sys: Duration::from_secs(61),
            max_rss_kb: 34 * 1024,
            inblock: 1234,
            oublock: 567,
        };
        assert_eq!(
            rusage_line(Duration::from_secs(65), &rusage),
            " 1:05 wall  0:02 user  1:01 sys     34M RSS | IOPS: 1.2 K in 0.6 K out"
        );
    }

    #[test]
    fn batch_result_line_is_dot_aligned() {
        let line = format!("{}{}", dot_pad("vanilla:a.sh", RESULT_COLUMN), "PASSED");
        assert_eq!(line.len(), RESULT_COLUMN + "PASSED".len());
        assert!(line.starts_with("vanilla:a.sh...."));
        assert!(line.ends_with("....PASSED"));
    }

    #[test]
    fn backlogs_hold_partial_lines() {
        let mut options = RunnerOptions::new("/t");
        options.jobs = 2;
        options.batch = true;
        let mut reporter = Reporter::new(&options);

        reporter.emit(1, Phase::Last, "complete\npart");
        assert_eq!(reporter.backlogs[1], "complete\npart");
        reporter.flush();
        assert_eq!(reporter.backlogs[1], "part");
    }
}
