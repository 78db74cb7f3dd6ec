// Copyright (c) The shtest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use bytes::BytesMut;
use std::{collections::VecDeque, time::Instant};

/// A single line of output and the instant its first byte was seen.
#[derive(Clone, Debug)]
pub struct TimedLine {
    /// When the first byte of this line arrived.
    pub stamp: Instant,
    /// The bytes of the line, including the trailing newline if the line is
    /// complete.
    pub text: BytesMut,
}

impl TimedLine {
    fn new(stamp: Instant) -> Self {
        Self {
            stamp,
            text: BytesMut::new(),
        }
    }
}

/// A line-oriented byte buffer that stamps each line with the time it first
/// observed data on that line.
///
/// Bytes pushed in arbitrary chunks are reassembled into lines; a line is
/// complete once a `\n` has been observed. The incomplete tail is kept in a
/// single in-progress slot, promoted to the queue on newline, and may be
/// force-flushed on close.
#[derive(Debug)]
pub struct TimedBuffer {
    queue: VecDeque<TimedLine>,
    current: TimedLine,
}

impl TimedBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            current: TimedLine::new(Instant::now()),
        }
    }

    /// Appends bytes, completing a line each time a newline appears.
    ///
    /// The first byte contributed to any line fixes that line's timestamp.
    pub fn push(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            if self.current.text.is_empty() {
                self.current.stamp = Instant::now();
            }
            match bytes.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.current.text.extend_from_slice(&bytes[..=pos]);
                    let stamp = self.current.stamp;
                    self.queue
                        .push_back(std::mem::replace(&mut self.current, TimedLine::new(stamp)));
                    bytes = &bytes[pos + 1..];
                }
                None => {
                    self.current.text.extend_from_slice(bytes);
                    break;
                }
            }
        }
    }

    /// Pops the oldest complete line. With `force`, additionally returns
    /// the in-progress line when the queue is empty.
    pub fn shift(&mut self, force: bool) -> Option<TimedLine> {
        if let Some(line) = self.queue.pop_front() {
            return Some(line);
        }
        if force && !self.current.text.is_empty() {
            let stamp = self.current.stamp;
            return Some(std::mem::replace(&mut self.current, TimedLine::new(stamp)));
        }
        None
    }

    /// True if `shift` with the same `force` would return nothing.
    pub fn is_empty(&self, force: bool) -> bool {
        self.queue.is_empty() && (!force || self.current.text.is_empty())
    }
}

impl Default for TimedBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn text(line: &TimedLine) -> &[u8] {
        &line.text
    }

    #[test]
    fn lines_split_on_newline() {
        let mut buf = TimedBuffer::new();
        buf.push(b"one\ntw");
        buf.push(b"o\nthree");

        assert_eq!(text(&buf.shift(false).unwrap()), b"one\n");
        assert_eq!(text(&buf.shift(false).unwrap()), b"two\n");
        assert!(buf.shift(false).is_none());
        assert!(!buf.is_empty(true));

        assert_eq!(text(&buf.shift(true).unwrap()), b"three");
        assert!(buf.is_empty(true));
    }

    #[test]
    fn force_prefers_complete_lines() {
        let mut buf = TimedBuffer::new();
        buf.push(b"a\nb");
        assert_eq!(text(&buf.shift(true).unwrap()), b"a\n");
        assert_eq!(text(&buf.shift(true).unwrap()), b"b");
        assert!(buf.shift(true).is_none());
    }

    #[test]
    fn timestamps_are_monotone() {
        let mut buf = TimedBuffer::new();
        buf.push(b"a\n");
        std::thread::sleep(std::time::Duration::from_millis(5));
        buf.push(b"b\n");
        let a = buf.shift(false).unwrap();
        let b = buf.shift(false).unwrap();
        assert!(a.stamp <= b.stamp);
    }

    proptest! {
        // Splitting the same byte stream into arbitrary chunks must not
        // change the reassembled lines.
        #[test]
        fn chunking_is_invisible(stream in proptest::collection::vec(any::<u8>(), 0..512), splits in proptest::collection::vec(0usize..512, 0..8)) {
            let mut whole = TimedBuffer::new();
            whole.push(&stream);

            let mut chunked = TimedBuffer::new();
            let mut offsets: Vec<usize> = splits.iter().map(|s| s % (stream.len() + 1)).collect();
            offsets.sort_unstable();
            let mut prev = 0;
            for off in offsets {
                chunked.push(&stream[prev..off]);
                prev = off;
            }
            chunked.push(&stream[prev..]);

            loop {
                match (whole.shift(true), chunked.shift(true)) {
                    (None, None) => break,
                    (a, b) => {
                        prop_assert_eq!(a.map(|l| l.text), b.map(|l| l.text));
                    }
                }
            }
        }
    }
}
