// Copyright (c) The shtest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{helpers::format_mm_ss, output::TimedLine};
use std::time::Instant;

/// The in-band substitution directives, one `(line prefix, key)` pair per
/// recognized sentinel.
const DIRECTIVES: &[(&str, &str)] = &[("@TESTDIR=", "@TESTDIR@"), ("@PREFIX=", "@PREFIX@")];

/// Hard cap on expansion rounds, in case a test manages to smuggle a key
/// into an expansion value.
const MAX_EXPANSIONS: usize = 64;

/// Textual substitutions driven by in-band sentinel lines emitted by tests.
///
/// A line beginning `@TESTDIR=` or `@PREFIX=` updates the substitution map
/// for the keys `@TESTDIR@` and `@PREFIX@`; it is passed through verbatim
/// and affects later output only. All other lines have every known key
/// replaced by its current value, leftmost-first, until no key occurs.
#[derive(Debug, Default)]
pub struct Substitutor {
    entries: Vec<(String, String)>,
}

/// What [`Substitutor::feed`] made of a line.
#[derive(Debug, Eq, PartialEq)]
pub enum Fed {
    /// The line was a directive; it updated the map and must be emitted
    /// verbatim.
    Directive,
    /// The line went through key expansion.
    Expanded(String),
}

impl Substitutor {
    /// Creates a substitutor with an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes one line: either consumes a directive or expands keys.
    pub fn feed(&mut self, line: &str) -> Fed {
        for (prefix, key) in DIRECTIVES {
            if let Some(value) = line.strip_prefix(prefix) {
                let value = value.trim_end_matches(['\r', '\n']);
                self.set(key, value);
                return Fed::Directive;
            }
        }
        Fed::Expanded(self.expand(line))
    }

    fn set(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_owned(),
            None => self.entries.push((key.to_owned(), value.to_owned())),
        }
    }

    fn expand(&self, line: &str) -> String {
        let mut out = line.to_owned();
        for _ in 0..MAX_EXPANSIONS {
            let mut leftmost: Option<(usize, &str, &str)> = None;
            for (key, value) in &self.entries {
                if let Some(pos) = out.find(key.as_str()) {
                    if leftmost.map_or(true, |(best, _, _)| pos < best) {
                        leftmost = Some((pos, key, value));
                    }
                }
            }
            match leftmost {
                Some((pos, key, value)) => out.replace_range(pos..pos + key.len(), value),
                None => break,
            }
        }
        out
    }
}

/// Formats each captured line for presentation: a `[mm:ss]` prefix relative
/// to test start, plus sentinel-driven substitution.
#[derive(Debug)]
pub struct Formatter {
    start: Instant,
    subst: Substitutor,
}

impl Formatter {
    /// Creates a formatter; timestamps are relative to `start`.
    pub fn new(start: Instant) -> Self {
        Self {
            start,
            subst: Substitutor::new(),
        }
    }

    /// Formats one line. When `suppress` is true (continuation of a
    /// partial line) the leading timestamp prefix is omitted; any `\r`
    /// inside the line is re-stamped with a fresh prefix so that progress
    /// bars redraw correctly under a terminal.
    pub fn format(&mut self, line: &TimedLine, suppress: bool) -> String {
        let elapsed = line.stamp.saturating_duration_since(self.start);
        let prefix = format!("[{}] ", format_mm_ss(elapsed));

        let text = String::from_utf8_lossy(&line.text);
        let body = match self.subst.feed(&text) {
            Fed::Directive => text.into_owned(),
            Fed::Expanded(expanded) => expanded,
        };

        let mut out = String::with_capacity(prefix.len() + body.len());
        if !suppress {
            out.push_str(&prefix);
        }
        if body.contains('\r') {
            out.push_str(&body.replace('\r', &format!("\r{prefix}")));
        } else {
            out.push_str(&body);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn line_at(start: Instant, offset: Duration, text: &str) -> TimedLine {
        TimedLine {
            stamp: start + offset,
            text: BytesMut::from(text.as_bytes()),
        }
    }

    #[test]
    fn prefix_is_relative_to_start() {
        let start = Instant::now();
        let mut formatter = Formatter::new(start);

        let line = line_at(start, Duration::from_secs(0), "hi\n");
        assert_eq!(formatter.format(&line, false), "[ 0:00] hi\n");

        let line = line_at(start, Duration::from_secs(61), "later\n");
        assert_eq!(formatter.format(&line, false), "[ 1:01] later\n");
    }

    #[test]
    fn suppress_drops_leading_prefix() {
        let start = Instant::now();
        let mut formatter = Formatter::new(start);
        let line = line_at(start, Duration::from_secs(2), "tail\n");
        assert_eq!(formatter.format(&line, true), "tail\n");
    }

    #[test]
    fn carriage_returns_are_restamped() {
        let start = Instant::now();
        let mut formatter = Formatter::new(start);
        let line = line_at(start, Duration::from_secs(3), "50%\r100%\n");
        assert_eq!(formatter.format(&line, false), "[ 0:03] 50%\r[ 0:03] 100%\n");
    }

    #[test]
    fn directive_updates_later_lines_only() {
        let start = Instant::now();
        let mut formatter = Formatter::new(start);

        let directive = line_at(start, Duration::from_secs(0), "@TESTDIR=/tmp/x\n");
        assert_eq!(formatter.format(&directive, false), "[ 0:00] @TESTDIR=/tmp/x\n");

        let line = line_at(start, Duration::from_secs(1), "hello @TESTDIR@\n");
        assert_eq!(formatter.format(&line, false), "[ 0:01] hello /tmp/x\n");
    }

    #[test]
    fn expansion_is_leftmost_first_and_repeated() {
        let mut subst = Substitutor::new();
        assert_eq!(subst.feed("@PREFIX=/usr\n"), Fed::Directive);
        assert_eq!(subst.feed("@TESTDIR=/t\n"), Fed::Directive);
        assert_eq!(
            subst.feed("@TESTDIR@ and @PREFIX@ and @TESTDIR@"),
            Fed::Expanded("/t and /usr and /t".to_owned())
        );
    }

    #[test]
    fn unset_keys_are_left_alone() {
        let mut subst = Substitutor::new();
        assert_eq!(
            subst.feed("no @TESTDIR@ yet"),
            Fed::Expanded("no @TESTDIR@ yet".to_owned())
        );
    }

    #[test]
    fn directive_value_can_be_replaced() {
        let mut subst = Substitutor::new();
        subst.feed("@PREFIX=/a\n");
        subst.feed("@PREFIX=/b\n");
        assert_eq!(subst.feed("@PREFIX@"), Fed::Expanded("/b".to_owned()));
    }
}
