// Copyright (c) The shtest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Include/exclude filtering for discovered tests.

use crate::{config::RunnerOptions, errors::OptionsError};
use regex::Regex;

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>, OptionsError> {
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

/// The combined include/exclude/flavour filter.
///
/// Matching is a search anywhere in the display id `flavour:path`, not an
/// anchored match.
#[derive(Debug, Default)]
pub struct TestFilter {
    only: Vec<Regex>,
    skip: Vec<Regex>,
    flavour: Option<Regex>,
}

impl TestFilter {
    /// Compiles the filter regexes out of the runner options.
    pub fn from_options(options: &RunnerOptions) -> Result<Self, OptionsError> {
        let flavour = options
            .flavour_filter
            .as_ref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|error| OptionsError::InvalidRegex {
                    pattern: pattern.clone(),
                    error,
                })
            })
            .transpose()?;

        Ok(Self {
            only: compile_all(&options.only)?,
            skip: compile_all(&options.skip)?,
            flavour,
        })
    }

    /// True if the id passes both the include and the exclude filters: any
    /// `--only` regex matches (or there are none), and no `--skip` regex
    /// matches.
    pub fn matches_id(&self, id: &str) -> bool {
        let included = self.only.is_empty() || self.only.iter().any(|re| re.is_match(id));
        included && !self.skip.iter().any(|re| re.is_match(id))
    }

    /// True if the flavour passes the `F` filter.
    pub fn flavour_enabled(&self, flavour: &str) -> bool {
        self.flavour.as_ref().is_none_or(|re| re.is_match(flavour))
    }
}
