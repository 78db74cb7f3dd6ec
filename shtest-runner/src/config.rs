// Copyright (c) The shtest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runner configuration.
//!
//! All configuration arrives on the command line or through environment
//! variables; the CLI shim assembles it into [`RunnerOptions`] before any
//! test runs.

use crate::errors::OptionsError;
use camino::Utf8PathBuf;

/// Default per-test inactivity timeout, in seconds.
pub const DEFAULT_TIMEOUT: u64 = 60;

/// Default wall-clock budget for the whole run, in seconds.
pub const DEFAULT_TOTAL_TIMEOUT: u64 = 10800;

/// Default flavour tag.
pub const DEFAULT_FLAVOUR: &str = "vanilla";

/// Default name of the environment variable carrying the flavour tag into
/// each child.
pub const DEFAULT_FLAVOUR_VAR: &str = "TEST_FLAVOUR";

/// A mapping from a file extension to an interpreter script, as given by
/// `--interpreter ext:script`.
///
/// Tests ending in `.ext` are run as `<testdir>/<script> <file>` instead of
/// directly under the shell.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InterpreterSpec {
    /// The extension, without the leading dot.
    pub ext: String,
    /// The interpreter script, relative to the test directory.
    pub script: Utf8PathBuf,
}

impl InterpreterSpec {
    /// Parses an `ext:script` pair.
    pub fn parse(input: &str) -> Result<Self, OptionsError> {
        match input.split_once(':') {
            Some((ext, script)) if !ext.is_empty() && !script.is_empty() => Ok(Self {
                ext: ext.to_owned(),
                script: script.into(),
            }),
            _ => Err(OptionsError::InvalidInterpreter {
                input: input.to_owned(),
            }),
        }
    }
}

/// Options for a test run, fully resolved.
///
/// Produced by the CLI shim; the library treats this as read-only for the
/// duration of the run.
#[derive(Clone, Debug)]
pub struct RunnerOptions {
    /// Root of the test tree.
    pub testdir: Utf8PathBuf,
    /// Where the journal, list, heartbeat and per-test logs live.
    pub outdir: Utf8PathBuf,
    /// The child's working directory.
    pub workdir: Utf8PathBuf,
    /// Load the journal and skip tests already done.
    pub resume: bool,
    /// Include filters: a test runs if any of these regexes matches its id.
    pub only: Vec<String>,
    /// Exclude filters: a test runs only if none of these regexes matches.
    pub skip: Vec<String>,
    /// Flavours to run.
    pub flavours: Vec<String>,
    /// Extra regex filter over the flavour list (the `F` environment
    /// variable).
    pub flavour_filter: Option<String>,
    /// Extra files to watch for output while a test runs.
    pub watch: Vec<Utf8PathBuf>,
    /// Extension to interpreter-script mappings.
    pub interpreters: Vec<InterpreterSpec>,
    /// Primary sort keys, applied before the filename-derived key.
    pub sort_hints: Vec<String>,
    /// Per-test inactivity timeout in seconds.
    pub timeout: u64,
    /// Wall-clock budget for the whole run, in seconds.
    pub total_timeout: u64,
    /// Number of parallel slots.
    pub jobs: usize,
    /// Batch mode: no terminal tricks, per-slot output backlogs.
    pub batch: bool,
    /// Verbose mode: stream every test's output to stdout.
    pub verbose: bool,
    /// Interactive mode: leave the child attached to the terminal.
    pub interactive: bool,
    /// Enable the kernel-log source.
    pub kmsg: bool,
    /// Heartbeat file, appended to while a test runs.
    pub heartbeat: Option<Utf8PathBuf>,
    /// Stop the run after two consecutive per-test timeouts.
    pub fatal_timeouts: bool,
    /// Name of the environment variable carrying the flavour tag.
    pub flavour_var: String,
}

impl RunnerOptions {
    /// Creates options with defaults for everything except the test
    /// directory.
    pub fn new(testdir: impl Into<Utf8PathBuf>) -> Self {
        let testdir = testdir.into();
        Self {
            workdir: testdir.clone(),
            testdir,
            outdir: ".".into(),
            resume: false,
            only: Vec::new(),
            skip: Vec::new(),
            flavours: vec![DEFAULT_FLAVOUR.to_owned()],
            flavour_filter: None,
            watch: Vec::new(),
            interpreters: Vec::new(),
            sort_hints: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            total_timeout: DEFAULT_TOTAL_TIMEOUT,
            jobs: 1,
            batch: false,
            verbose: false,
            interactive: false,
            kmsg: false,
            heartbeat: None,
            fatal_timeouts: false,
            flavour_var: DEFAULT_FLAVOUR_VAR.to_owned(),
        }
    }

    /// Applies the cross-flag rules: more than one job forces batch mode,
    /// and interactive mode forces a single slot.
    pub fn reconcile(&mut self) {
        if self.jobs > 1 {
            self.batch = true;
        }
        if self.interactive {
            self.jobs = 1;
            self.batch = false;
        }
        if self.jobs == 0 {
            self.jobs = 1;
        }
    }

    /// True if the per-test monitor should emit periodic progress pulses.
    pub fn wants_progress_pulse(&self) -> bool {
        !self.verbose && !self.interactive && !self.batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpreter_spec_parsing() {
        let spec = InterpreterSpec::parse("py:run-python").unwrap();
        assert_eq!(spec.ext, "py");
        assert_eq!(spec.script, Utf8PathBuf::from("run-python"));

        for bad in ["py", ":x", "py:", ""] {
            InterpreterSpec::parse(bad).unwrap_err();
        }
    }

    #[test]
    fn jobs_force_batch() {
        let mut options = RunnerOptions::new("/t");
        options.jobs = 4;
        options.reconcile();
        assert!(options.batch);

        let mut options = RunnerOptions::new("/t");
        options.interactive = true;
        options.jobs = 4;
        options.reconcile();
        assert_eq!(options.jobs, 1);
        assert!(!options.batch);
    }
}
