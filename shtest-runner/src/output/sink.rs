// Copyright (c) The shtest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::{Formatter, TimedBuffer};
use camino::Utf8PathBuf;
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    os::unix::fs::OpenOptionsExt,
    time::Instant,
};
use tracing::warn;

/// An output consumer attached to a test's IO hub.
///
/// Tagged variants rather than trait objects; the hub fans every source
/// into every sink.
#[derive(Debug)]
pub enum Sink {
    /// No-op consumer, installed by the hub as a default so that it always
    /// has at least one.
    Observer,
    /// Streams formatted lines to stdout (verbose and interactive modes).
    Fd(FdSink),
    /// Holds formatted output in memory for replay on failure.
    Buf(BufSink),
    /// The per-test log file.
    File(FileSink),
}

impl Sink {
    /// Appends raw bytes to the sink's line buffer.
    pub fn push(&mut self, bytes: &[u8]) {
        match self {
            Sink::Observer => {}
            Sink::Fd(sink) => sink.lines.buffer.push(bytes),
            Sink::Buf(sink) => sink.lines.buffer.push(bytes),
            Sink::File(sink) => sink.push(bytes),
        }
    }

    /// Flushes complete lines out of the sink.
    pub fn sync(&mut self) {
        match self {
            Sink::Observer | Sink::Buf(_) => {}
            Sink::Fd(sink) => sink.sync(),
            Sink::File(sink) => sink.sync(),
        }
    }

    /// Force-flushes any partial tail and releases file resources.
    pub fn finish(&mut self) {
        match self {
            Sink::Observer | Sink::Buf(_) => {}
            Sink::Fd(sink) => sink.outline_all(true),
            Sink::File(sink) => sink.finish(),
        }
    }
}

/// A timed line buffer plus the formatter and partial-line state shared by
/// the writing sinks.
#[derive(Debug)]
pub(crate) struct LineBuffer {
    pub(crate) buffer: TimedBuffer,
    formatter: Formatter,
    ended_newline: bool,
}

impl LineBuffer {
    pub(crate) fn new(start: Instant) -> Self {
        Self {
            buffer: TimedBuffer::new(),
            formatter: Formatter::new(start),
            ended_newline: true,
        }
    }

    /// Pops and formats the next line. The timestamp prefix is suppressed
    /// when the previously written line did not end in a newline, so that a
    /// continued partial line is not broken up.
    pub(crate) fn next_line(&mut self, force: bool) -> Option<String> {
        let line = self.buffer.shift(force)?;
        let suppress = !self.ended_newline;
        let formatted = self.formatter.format(&line, suppress);
        self.ended_newline = formatted.ends_with('\n');
        Some(formatted)
    }
}

/// Sink that streams formatted lines to stdout as they complete.
#[derive(Debug)]
pub struct FdSink {
    lines: LineBuffer,
}

impl FdSink {
    /// Creates a stdout sink; timestamps are relative to `start`.
    pub fn new(start: Instant) -> Self {
        Self {
            lines: LineBuffer::new(start),
        }
    }

    fn sync(&mut self) {
        self.outline_all(false);
    }

    fn outline_all(&mut self, force: bool) {
        let mut out = io::stdout().lock();
        while let Some(line) = self.lines.next_line(force) {
            if out.write_all(line.as_bytes()).is_err() {
                break;
            }
        }
        let _ = out.flush();
    }
}

/// Sink that holds the run's formatted output in memory so it can be
/// replayed when a test fails.
#[derive(Debug)]
pub struct BufSink {
    lines: LineBuffer,
}

impl BufSink {
    /// Creates an in-memory sink; timestamps are relative to `start`.
    pub fn new(start: Instant) -> Self {
        Self {
            lines: LineBuffer::new(start),
        }
    }

    /// Drains the held output, each line prefixed with `"| "`.
    pub fn dump(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(line) = self.lines.next_line(true) {
            out.extend_from_slice(b"| ");
            out.extend_from_slice(line.as_bytes());
        }
        if !out.ends_with(b"\n") && !out.is_empty() {
            out.push(b'\n');
        }
        out
    }
}

#[derive(Debug)]
enum FileState {
    /// Not opened yet; the file is created lazily on first sync.
    Pending,
    Open(File),
    /// The open failed or the sink was finished; pushes are dropped.
    Killed,
}

/// The per-test log file sink.
///
/// The file is opened (created and truncated, mode 0644) on the first
/// `sync`, which means a retried test overwrites the previous attempt's
/// log. A failed open kills the sink: further pushes are dropped and the
/// test is unaffected.
#[derive(Debug)]
pub struct FileSink {
    path: Utf8PathBuf,
    state: FileState,
    lines: LineBuffer,
}

impl FileSink {
    /// Creates a log-file sink for `path`; timestamps are relative to
    /// `start`.
    pub fn new(path: Utf8PathBuf, start: Instant) -> Self {
        Self {
            path,
            state: FileState::Pending,
            lines: LineBuffer::new(start),
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        if matches!(self.state, FileState::Killed) {
            return;
        }
        self.lines.buffer.push(bytes);
    }

    fn open_if_pending(&mut self) {
        if !matches!(self.state, FileState::Pending) {
            return;
        }
        let opened = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .custom_flags(libc::O_CLOEXEC)
            .open(&self.path);
        match opened {
            Ok(file) => self.state = FileState::Open(file),
            Err(error) => {
                warn!(path = %self.path, %error, "failed to create test log, dropping output");
                self.state = FileState::Killed;
                self.lines.buffer = TimedBuffer::new();
            }
        }
    }

    fn write_out(&mut self, force: bool) {
        let FileState::Open(file) = &mut self.state else {
            return;
        };
        while let Some(line) = self.lines.next_line(force) {
            if let Err(error) = file.write_all(line.as_bytes()) {
                warn!(path = %self.path, %error, "failed to write test log");
                self.state = FileState::Killed;
                return;
            }
        }
    }

    fn sync(&mut self) {
        self.open_if_pending();
        self.write_out(false);
    }

    /// Force-flushes the tail, fsyncs and closes the file.
    pub fn finish(&mut self) {
        self.open_if_pending();
        self.write_out(true);
        if let FileState::Open(file) = &self.state {
            let _ = file.sync_all();
        }
        self.state = FileState::Killed;
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if !matches!(self.state, FileState::Killed) {
            self.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use pretty_assertions::assert_eq;

    #[test]
    fn file_sink_writes_formatted_lines() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("case.txt");
        let mut sink = FileSink::new(path.clone(), Instant::now());

        sink.push(b"hello\npartial");
        sink.sync();
        sink.finish();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "[ 0:00] hello\n[ 0:00] partial");
    }

    #[test]
    fn file_sink_truncates_previous_attempt() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("case.txt");
        std::fs::write(&path, "old attempt\n").unwrap();

        let mut sink = FileSink::new(path.clone(), Instant::now());
        sink.push(b"new\n");
        sink.sync();
        sink.finish();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[ 0:00] new\n");
    }

    #[test]
    fn killed_file_sink_drops_pushes() {
        let mut sink = FileSink::new("/nonexistent-dir/case.txt".into(), Instant::now());
        sink.push(b"before\n");
        sink.sync();
        sink.push(b"after\n");
        sink.finish();
        assert!(matches!(sink.state, FileState::Killed));
    }

    #[test]
    fn buf_sink_dump_prefixes_lines() {
        let mut sink = BufSink::new(Instant::now());
        sink.lines.buffer.push(b"one\ntwo\ntail");
        let dump = String::from_utf8(sink.dump()).unwrap();
        assert_eq!(dump, "| [ 0:00] one\n| [ 0:00] two\n| [ 0:00] tail\n");
    }

    #[test]
    fn continuation_suppresses_prefix() {
        let mut lines = LineBuffer::new(Instant::now());
        lines.buffer.push(b"head");
        assert_eq!(lines.next_line(true).unwrap(), "[ 0:00] head");
        lines.buffer.push(b" tail\n");
        assert_eq!(lines.next_line(false).unwrap(), " tail\n");
        lines.buffer.push(b"fresh\n");
        assert_eq!(lines.next_line(false).unwrap(), "[ 0:00] fresh\n");
    }
}
