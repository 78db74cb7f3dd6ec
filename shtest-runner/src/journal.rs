// Copyright (c) The shtest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The durable, append-optimized status store.
//!
//! Two files live in the output directory: `journal`, an append-only delta
//! log of `id code` lines, and `list`, a full rewrite of the current state
//! after each update. After every status change the journal appends the
//! changed entry, fsyncs, rewrites `list`, and fsyncs again, so that a
//! crash or VM reset at any point can be resumed from disk.

use crate::errors::JournalError;
use atomicwrites::{AllowOverwrite, AtomicFile};
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{self, Write},
};
use tracing::debug;

static JOURNAL_FILE_NAME: &str = "journal";
static LIST_FILE_NAME: &str = "list";

/// The result code recorded for a test.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TestStatus {
    /// The test has been observed running but has not finished.
    Started,
    /// The test was found `Started` in a resumed journal and started again.
    Retried,
    /// Parse fallback for unrecognized journal lines.
    Unknown,
    /// The test exited unsuccessfully or died on an unexpected signal.
    Failed,
    /// The test was killed by an operator interrupt.
    Interrupted,
    /// Recorded by external tooling for tests expected to fail; never
    /// generated by the supervisor.
    KnownFail,
    /// The test exited 0.
    Passed,
    /// The test exited 200, the self-skip convention.
    Skipped,
    /// The test went silent longer than the inactivity timeout.
    Timeout,
    /// Recorded by external tooling; counted with timeouts as "broken".
    Warned,
}

impl TestStatus {
    /// All statuses, in journal-word order.
    pub const ALL: &'static [TestStatus] = &[
        TestStatus::Started,
        TestStatus::Retried,
        TestStatus::Unknown,
        TestStatus::Failed,
        TestStatus::Interrupted,
        TestStatus::KnownFail,
        TestStatus::Passed,
        TestStatus::Skipped,
        TestStatus::Timeout,
        TestStatus::Warned,
    ];

    /// The lower-case word written to the journal.
    pub fn as_word(self) -> &'static str {
        match self {
            TestStatus::Started => "started",
            TestStatus::Retried => "retried",
            TestStatus::Unknown => "unknown",
            TestStatus::Failed => "failed",
            TestStatus::Interrupted => "interrupted",
            TestStatus::KnownFail => "knownfail",
            TestStatus::Passed => "passed",
            TestStatus::Skipped => "skipped",
            TestStatus::Timeout => "timeout",
            TestStatus::Warned => "warnings",
        }
    }

    /// Parses a journal word; anything unrecognized maps to `Unknown`.
    pub fn from_word(word: &str) -> Self {
        match word {
            "started" => TestStatus::Started,
            "retried" => TestStatus::Retried,
            "failed" => TestStatus::Failed,
            "interrupted" => TestStatus::Interrupted,
            "knownfail" => TestStatus::KnownFail,
            "passed" => TestStatus::Passed,
            "skipped" => TestStatus::Skipped,
            "timeout" => TestStatus::Timeout,
            "warnings" => TestStatus::Warned,
            _ => TestStatus::Unknown,
        }
    }

    /// The upper-case tag used in result lines.
    pub fn tag(self) -> &'static str {
        match self {
            TestStatus::Started => "STARTED",
            TestStatus::Retried => "RETRIED",
            TestStatus::Unknown => "UNKNOWN",
            TestStatus::Failed => "FAILED",
            TestStatus::Interrupted => "INTERRUPTED",
            TestStatus::KnownFail => "KNOWNFAIL",
            TestStatus::Passed => "PASSED",
            TestStatus::Skipped => "SKIPPED",
            TestStatus::Timeout => "TIMEOUT",
            TestStatus::Warned => "WARNED",
        }
    }

    /// "Done" is any code other than `Started` or `Interrupted`.
    pub fn is_done(self) -> bool {
        !matches!(self, TestStatus::Started | TestStatus::Interrupted)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_word())
    }
}

/// The journal: an in-memory status map backed by the `journal` and `list`
/// files.
#[derive(Debug)]
pub struct Journal {
    journal_path: Utf8PathBuf,
    list_path: Utf8PathBuf,
    statuses: IndexMap<String, TestStatus>,
    append: Option<File>,
    consecutive_timeouts: u32,
}

impl Journal {
    /// Opens the journal in `outdir`, creating the directory if needed.
    ///
    /// With `resume`, the on-disk journal is replayed; otherwise a stale
    /// journal file is removed so the run starts fresh.
    pub fn open(outdir: &Utf8Path, resume: bool) -> Result<Self, JournalError> {
        std::fs::create_dir_all(outdir).map_err(|error| JournalError::OutdirCreate {
            outdir: outdir.to_owned(),
            error,
        })?;

        let mut journal = Self {
            journal_path: outdir.join(JOURNAL_FILE_NAME),
            list_path: outdir.join(LIST_FILE_NAME),
            statuses: IndexMap::new(),
            append: None,
            consecutive_timeouts: 0,
        };

        if resume {
            journal.read()?;
        } else if let Err(error) = std::fs::remove_file(&journal.journal_path) {
            if error.kind() != io::ErrorKind::NotFound {
                return Err(JournalError::Unlink {
                    path: journal.journal_path,
                    error,
                });
            }
        }

        Ok(journal)
    }

    /// Replays the on-disk journal into the in-memory map. Later entries
    /// overwrite earlier ones for the same id.
    pub fn read(&mut self) -> Result<(), JournalError> {
        self.statuses = Self::read_path(&self.journal_path)?;
        debug!(entries = self.statuses.len(), "journal replayed");
        Ok(())
    }

    /// Reads a journal-format file into a status map.
    pub fn read_path(path: &Utf8Path) -> Result<IndexMap<String, TestStatus>, JournalError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(IndexMap::new()),
            Err(error) => {
                return Err(JournalError::Read {
                    path: path.to_owned(),
                    error,
                });
            }
        };

        let mut statuses = IndexMap::new();
        for line in contents.lines() {
            let Some((id, word)) = line.rsplit_once(' ') else {
                continue;
            };
            statuses.insert(id.to_owned(), TestStatus::from_word(word));
        }
        Ok(statuses)
    }

    /// Records that a test has started. A fresh start transitions absent →
    /// `Started`; re-starting a test already `Started` transitions it to
    /// `Retried`, which is how a resumed run marks tests the previous run
    /// died inside.
    pub fn started(&mut self, id: &str) -> Result<(), JournalError> {
        let status = match self.statuses.get(id) {
            Some(TestStatus::Started) => TestStatus::Retried,
            _ => TestStatus::Started,
        };
        self.record(id, status)
    }

    /// Records a terminal code, replacing whatever preceded it.
    pub fn done(&mut self, id: &str, status: TestStatus) -> Result<(), JournalError> {
        if status == TestStatus::Timeout {
            self.consecutive_timeouts += 1;
        } else {
            self.consecutive_timeouts = 0;
        }
        self.record(id, status)
    }

    /// Forces a test back to `Started` so that a resume will retry it.
    /// Used when the runner gives up after consecutive timeouts.
    pub fn restart(&mut self, id: &str) -> Result<(), JournalError> {
        self.record(id, TestStatus::Started)
    }

    fn record(&mut self, id: &str, status: TestStatus) -> Result<(), JournalError> {
        self.statuses.insert(id.to_owned(), status);
        self.sync_entry(id, status)
    }

    /// True if the journal holds a done code for `id`.
    pub fn is_done(&self, id: &str) -> bool {
        self.statuses.get(id).is_some_and(|status| status.is_done())
    }

    /// The current status for `id`, if any.
    pub fn status(&self, id: &str) -> Option<TestStatus> {
        self.statuses.get(id).copied()
    }

    /// Counts entries with the given status.
    pub fn count(&self, status: TestStatus) -> usize {
        self.statuses.values().filter(|&&s| s == status).count()
    }

    /// The number of consecutive `Timeout` results, reset by any other
    /// done code.
    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    /// Iterates over all `(id, status)` entries in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, TestStatus)> {
        self.statuses.iter().map(|(id, &status)| (id.as_str(), status))
    }

    /// The one-line run summary: totals grouped as passed, skipped,
    /// broken (timeout + warned) and failed.
    pub fn banner(&self) -> String {
        let broken = self.count(TestStatus::Timeout) + self.count(TestStatus::Warned);
        format!(
            "{} tests: {} passed, {} skipped, {} broken, {} failed",
            self.statuses.len(),
            self.count(TestStatus::Passed),
            self.count(TestStatus::Skipped),
            broken,
            self.count(TestStatus::Failed),
        )
    }

    /// Writes every non-passed entry, one per line.
    pub fn details(&self, out: &mut impl Write) -> io::Result<()> {
        for (id, status) in self.entries() {
            if status != TestStatus::Passed {
                writeln!(out, "{} {}", status.tag(), id)?;
            }
        }
        Ok(())
    }

    /// Appends the changed entry to `journal`, fsyncs, rewrites `list`,
    /// fsyncs.
    fn sync_entry(&mut self, id: &str, status: TestStatus) -> Result<(), JournalError> {
        let journal_path = self.journal_path.clone();
        let append_err = move |error| JournalError::Append {
            path: journal_path.clone(),
            error,
        };

        let file = match &mut self.append {
            Some(file) => file,
            None => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.journal_path)
                    .map_err(&append_err)?;
                self.append.insert(file)
            }
        };

        writeln!(file, "{} {}", id, status.as_word()).map_err(&append_err)?;
        file.sync_all().map_err(&append_err)?;

        let statuses = &self.statuses;
        AtomicFile::new(&self.list_path, AllowOverwrite)
            .write(|file| {
                for (id, status) in statuses {
                    writeln!(file, "{} {}", id, status.as_word())?;
                }
                file.sync_all()
            })
            .map_err(|error| JournalError::ListRewrite {
                path: self.list_path.clone(),
                error: match error {
                    atomicwrites::Error::Internal(error) => error,
                    atomicwrites::Error::User(error) => error,
                },
            })
    }
}
