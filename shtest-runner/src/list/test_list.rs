// Copyright (c) The shtest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    config::RunnerOptions,
    errors::{DiscoverError, OptionsError},
    test_filter::TestFilter,
};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use std::fmt;
use tracing::debug;
use walkdir::WalkDir;

/// Subtrees of the test directory that hold support material, not tests.
const EXCLUDED_COMPONENTS: &[&str] = &["lib", "data"];

/// Identifies one test invocation: a flavour tag plus the script's path
/// relative to the test directory.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct TestId {
    /// The flavour tag, injected into the child's environment.
    pub flavour: String,
    /// The script path relative to the test directory.
    pub path: Utf8PathBuf,
}

impl TestId {
    /// The name of the per-test log file: the display id with `/` mapped
    /// to `_`, plus `.txt`.
    pub fn log_file_name(&self) -> String {
        format!("{}:{}.txt", self.flavour, self.path.as_str().replace('/', "_"))
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.flavour, self.path)
    }
}

/// One runnable test: its id plus everything needed to spawn it.
#[derive(Clone, Debug)]
pub struct TestCase {
    /// The test's identifier.
    pub id: TestId,
    /// Absolute path of the script.
    pub abs_path: Utf8PathBuf,
    /// Absolute path of the interpreter script, for tests matched by an
    /// `--interpreter` mapping. `None` means the test runs under the
    /// shell directly.
    pub interpreter: Option<Utf8PathBuf>,
}

/// The filtered, ordered queue of tests for one run.
#[derive(Debug)]
pub struct TestList {
    cases: Vec<TestCase>,
}

impl TestList {
    /// Walks the test directory and builds the ordered case queue.
    ///
    /// A file is runnable iff its extension is `.sh` or matches one of the
    /// `--interpreter ext:script` mappings; files under `lib/` or `data/`
    /// are excluded; the include/exclude regex filters decide the rest.
    /// One case is built per enabled flavour per runnable file.
    pub fn discover(options: &RunnerOptions, filter: &TestFilter) -> Result<Self, DiscoverError> {
        let sort_hints = compile_hints(&options.sort_hints)?;

        let mut files = Vec::new();
        for entry in WalkDir::new(&options.testdir).sort_by_file_name() {
            let entry = entry.map_err(|error| DiscoverError::DirRead {
                testdir: options.testdir.clone(),
                error,
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = Utf8Path::from_path(entry.path()).ok_or_else(|| {
                DiscoverError::NonUtf8Path {
                    path: entry.path().to_owned(),
                }
            })?;
            let rel = path
                .strip_prefix(&options.testdir)
                .unwrap_or(path)
                .to_owned();
            if rel
                .components()
                .any(|c| EXCLUDED_COMPONENTS.contains(&c.as_str()))
            {
                continue;
            }
            let Some(interpreter) = runnable(&rel, options) else {
                continue;
            };
            files.push((rel, interpreter));
        }

        let flavours: Vec<&String> = options
            .flavours
            .iter()
            .filter(|flavour| filter.flavour_enabled(flavour))
            .collect();

        let mut keyed = Vec::new();
        for flavour in &flavours {
            for (rel, interpreter) in &files {
                let id = TestId {
                    flavour: (*flavour).clone(),
                    path: rel.clone(),
                };
                if !filter.matches_id(&id.to_string()) {
                    continue;
                }
                keyed.push((
                    sort_key(rel, &sort_hints),
                    TestCase {
                        abs_path: options.testdir.join(rel),
                        interpreter: interpreter
                            .as_ref()
                            .map(|script| options.testdir.join(script)),
                        id,
                    },
                ));
            }
        }

        // Stable, so flavours stay in their configured order for files
        // with equal keys.
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        let cases: Vec<TestCase> = keyed.into_iter().map(|(_, case)| case).collect();
        debug!(count = cases.len(), "discovered tests");

        Ok(Self { cases })
    }

    /// The ordered cases.
    pub fn cases(&self) -> &[TestCase] {
        &self.cases
    }

    /// The number of cases.
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    /// True if nothing survived discovery and filtering.
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

/// Decides whether a file is runnable, and through what. `Some(None)` is a
/// plain shell test; `Some(Some(script))` runs via an interpreter.
fn runnable(rel: &Utf8Path, options: &RunnerOptions) -> Option<Option<Utf8PathBuf>> {
    let ext = rel.extension()?;
    if ext == "sh" {
        return Some(None);
    }
    options
        .interpreters
        .iter()
        .find(|spec| spec.ext == ext)
        .map(|spec| Some(spec.script.clone()))
}

fn compile_hints(patterns: &[String]) -> Result<Vec<Regex>, OptionsError> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|error| OptionsError::InvalidRegex {
                pattern: pattern.clone(),
                error,
            })
        })
        .collect()
}

/// Assembles the ordering key for one file: per sort-hint regex the first
/// capture group (else the whole match, else empty), then the component
/// parts of the filename stem split on `[-_ .]`, then the filename itself.
/// Lexicographic comparison of this vector places `test.sh` before
/// `test-special.sh`.
fn sort_key(rel: &Utf8Path, hints: &[Regex]) -> Vec<String> {
    let mut key = Vec::with_capacity(hints.len() + 4);
    let path_str = rel.as_str();
    for hint in hints {
        let part = match hint.captures(path_str) {
            Some(captures) => captures
                .get(1)
                .or_else(|| captures.get(0))
                .map(|m| m.as_str().to_owned())
                .unwrap_or_default(),
            None => String::new(),
        };
        key.push(part);
    }

    let file_name = rel.file_name().unwrap_or(path_str);
    let stem = file_name.rsplit_once('.').map_or(file_name, |(stem, _)| stem);
    for part in stem.split(['-', '_', ' ', '.']) {
        key.push(part.to_owned());
    }
    key.push(file_name.to_owned());
    key
}
