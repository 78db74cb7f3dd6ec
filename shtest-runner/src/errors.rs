// Copyright (c) The shtest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by shtest.

use camino::Utf8PathBuf;
use std::io;
use thiserror::Error;

/// An error that occurred while assembling runner options.
#[derive(Clone, Debug, Error)]
pub enum OptionsError {
    /// An `--interpreter` argument was not of the form `ext:script`.
    #[error("invalid --interpreter mapping `{input}` (expected `ext:script`)")]
    InvalidInterpreter {
        /// The offending argument.
        input: String,
    },

    /// A filter or sort-hint regex failed to compile.
    #[error("invalid regex `{pattern}`: {error}")]
    InvalidRegex {
        /// The offending pattern.
        pattern: String,
        /// The underlying regex error.
        error: regex::Error,
    },
}

/// An error that occurred while discovering tests.
#[derive(Debug, Error)]
pub enum DiscoverError {
    /// Reading the test directory failed.
    #[error("error reading test directory `{testdir}`")]
    DirRead {
        /// The test directory.
        testdir: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: walkdir::Error,
    },

    /// A discovered path was not valid UTF-8.
    #[error("test path `{}` is not valid UTF-8", path.display())]
    NonUtf8Path {
        /// The offending path.
        path: std::path::PathBuf,
    },

    /// A sort-hint regex failed to compile.
    #[error(transparent)]
    Options(#[from] OptionsError),
}

/// An error that occurred while reading or writing the journal.
#[derive(Debug, Error)]
pub enum JournalError {
    /// The output directory could not be created.
    #[error("error creating output directory `{outdir}`")]
    OutdirCreate {
        /// The output directory.
        outdir: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The journal file could not be opened or appended to.
    #[error("error writing journal `{path}`")]
    Append {
        /// The journal path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The journal file could not be read back.
    #[error("error reading journal `{path}`")]
    Read {
        /// The journal path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The journal file could not be removed at the start of a fresh run.
    #[error("error removing stale journal `{path}`")]
    Unlink {
        /// The journal path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The list file could not be rewritten.
    #[error("error rewriting list file `{path}`")]
    ListRewrite {
        /// The list path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },
}

/// An error that prevented the runner from being built or executed at all.
///
/// Per-test failures are not errors; they are results recorded in the
/// journal. This type covers supervisor-level trouble such as failing to
/// create the runtime or the signal handler.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The tokio runtime could not be created.
    #[error("error creating Tokio runtime")]
    RuntimeCreate(#[source] io::Error),

    /// Signal handler streams could not be registered.
    #[error("error setting up signal handlers")]
    SignalHandlerSetup(#[source] io::Error),

    /// A journal operation failed mid-run.
    #[error(transparent)]
    Journal(#[from] JournalError),

    /// Process-level setup for a child failed in a way that is not
    /// attributable to the test itself (socketpair allocation, slot
    /// bookkeeping). The conventional exit code for this is 201.
    #[error("error forking test child")]
    Fork(#[source] io::Error),
}

impl RunnerError {
    /// The process exit code conventionally associated with this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunnerError::Fork(_) => 201,
            _ => 1,
        }
    }
}
