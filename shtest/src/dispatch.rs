// Copyright (c) The shtest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command-line and environment parsing.

use camino::Utf8PathBuf;
use clap::Parser;
use shtest_runner::{
    config::{InterpreterSpec, RunnerOptions},
    list::TestList,
    runner::TestRunnerBuilder,
    test_filter::TestFilter,
};
use tracing_subscriber::EnvFilter;

/// A supervising runner for shell-based functional tests.
///
/// Discovers a tree of test scripts, runs each under a child shell in its
/// own process group, captures and annotates their output, enforces
/// inactivity and wall-clock timeouts, and records durable progress to a
/// journal that supports `--continue` after a crash or VM reset.
#[derive(Debug, Parser)]
#[command(name = "shtest", version)]
pub struct ShtestApp {
    /// Root of the test tree.
    #[arg(long, value_name = "PATH")]
    testdir: Utf8PathBuf,

    /// Where the journal, list, heartbeat and per-test logs live.
    #[arg(long, value_name = "PATH", default_value = ".")]
    outdir: Utf8PathBuf,

    /// The child's working directory (defaults to the test directory).
    #[arg(long, value_name = "PATH")]
    workdir: Option<Utf8PathBuf>,

    /// Load the journal and skip tests already done.
    #[arg(long = "continue")]
    resume: bool,

    /// Include filter: run tests matching any of these regexes.
    #[arg(long, value_name = "REGEXES", value_delimiter = ',')]
    only: Vec<String>,

    /// Exclude filter: skip tests matching any of these regexes.
    #[arg(long, value_name = "REGEXES", value_delimiter = ',')]
    skip: Vec<String>,

    /// Flavours to run.
    #[arg(long, value_name = "CSV", value_delimiter = ',', default_value = "vanilla")]
    flavours: Vec<String>,

    /// Extra files to watch for output while a test runs.
    #[arg(long, value_name = "PATHS", value_delimiter = ',')]
    watch: Vec<Utf8PathBuf>,

    /// Run tests ending in `.ext` via `<testdir>/<script> <file>`.
    #[arg(long, value_name = "EXT:SCRIPT")]
    interpreter: Vec<String>,

    /// Primary ordering key: the regex's first capture group, or the
    /// whole match.
    #[arg(long, value_name = "REGEX")]
    sort_hint: Vec<String>,

    /// Per-test inactivity timeout, in seconds.
    #[arg(long, value_name = "SECONDS", default_value_t = 60)]
    timeout: u64,

    /// Wall-clock budget for the whole run, in seconds.
    #[arg(long, value_name = "SECONDS", default_value_t = 10800)]
    total_timeout: u64,

    /// Parallel slots. More than one forces --batch.
    #[arg(long, value_name = "N")]
    jobs: Option<usize>,

    /// Batch mode: no terminal tricks, line-buffered per-slot output.
    #[arg(long)]
    batch: bool,

    /// Stream every test's output to stdout.
    #[arg(long)]
    verbose: bool,

    /// Leave the child attached to the terminal.
    #[arg(long)]
    interactive: bool,

    /// Tap the kernel log while tests run.
    #[arg(long)]
    kmsg: bool,

    /// Append a `.` to this file every 20 seconds while a test runs.
    #[arg(long, value_name = "PATH")]
    heartbeat: Option<Utf8PathBuf>,

    /// Stop the run after two consecutive per-test timeouts.
    #[arg(long)]
    fatal_timeouts: bool,

    /// Name of the environment variable carrying the flavour tag into
    /// each child.
    #[arg(long, value_name = "NAME", default_value = "TEST_FLAVOUR")]
    flavour_var: String,
}

impl ShtestApp {
    /// Executes the app, returning the process exit code.
    pub fn exec(self) -> i32 {
        init_logger();
        match self.exec_impl() {
            Ok(code) => code,
            Err(error) => {
                report_error(&error);
                error.exit_code()
            }
        }
    }

    fn exec_impl(self) -> Result<i32, AppError> {
        let options = self.into_options()?;
        let filter = TestFilter::from_options(&options)?;
        let test_list = TestList::discover(&options, &filter)?;

        let runner = TestRunnerBuilder::new(options).build()?;
        if runner.options().verbose {
            println!("### run started at {}", runner.started_at().to_rfc2822());
        }
        let summary = runner.execute(&test_list)?;
        Ok(summary.exit_code())
    }

    /// Folds the command line and the environment into runner options.
    /// `T`, `S` and `F` extend the filters; `BATCH`, `VERBOSE`,
    /// `INTERACTIVE` and `JOBS` override the UI flags. A variable set to
    /// empty or `"0"` counts as unset.
    fn into_options(self) -> Result<RunnerOptions, AppError> {
        let mut options = RunnerOptions::new(self.testdir);
        options.outdir = self.outdir;
        if let Some(workdir) = self.workdir {
            options.workdir = workdir;
        }
        options.resume = self.resume;
        options.only = self.only;
        options.skip = self.skip;
        options.flavours = self.flavours;
        options.watch = self.watch;
        options.interpreters = self
            .interpreter
            .iter()
            .map(|spec| InterpreterSpec::parse(spec))
            .collect::<Result<_, _>>()?;
        options.sort_hints = self.sort_hint;
        options.timeout = self.timeout;
        options.total_timeout = self.total_timeout;
        if let Some(jobs) = self.jobs {
            options.jobs = jobs;
        }
        options.batch = self.batch;
        options.verbose = self.verbose;
        options.interactive = self.interactive;
        options.kmsg = self.kmsg;
        options.heartbeat = self.heartbeat;
        options.fatal_timeouts = self.fatal_timeouts;
        options.flavour_var = self.flavour_var;

        if let Some(extra) = env_nonempty("T") {
            options.only.extend(split_csv(&extra));
        }
        if let Some(extra) = env_nonempty("S") {
            options.skip.extend(split_csv(&extra));
        }
        options.flavour_filter = env_nonempty("F");
        if env_nonempty("BATCH").is_some() {
            options.batch = true;
        }
        if env_nonempty("VERBOSE").is_some() {
            options.verbose = true;
        }
        if env_nonempty("INTERACTIVE").is_some() {
            options.interactive = true;
        }
        if let Some(jobs) = env_nonempty("JOBS") {
            options.jobs = jobs.parse().map_err(|_| AppError::InvalidJobs { jobs })?;
        }

        Ok(options)
    }
}

fn split_csv(input: &str) -> Vec<String> {
    input
        .split(',')
        .filter(|part| !part.is_empty())
        .map(str::to_owned)
        .collect()
}

fn env_nonempty(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() && value != "0" => Some(value),
        _ => None,
    }
}

fn init_logger() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("shtest=warn,shtest_runner=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn report_error(error: &dyn std::error::Error) {
    eprintln!("shtest: error: {error}");
    let mut source = error.source();
    while let Some(cause) = source {
        eprintln!("  caused by: {cause}");
        source = cause.source();
    }
}

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error("JOBS={jobs} is not a number")]
    InvalidJobs { jobs: String },

    #[error(transparent)]
    Options(#[from] shtest_runner::errors::OptionsError),

    #[error(transparent)]
    Discover(#[from] shtest_runner::errors::DiscoverError),

    #[error(transparent)]
    Runner(#[from] shtest_runner::errors::RunnerError),
}

impl AppError {
    /// Configuration errors exit 2; runner-level failures carry their own
    /// conventional codes (201 for fork-level trouble).
    fn exit_code(&self) -> i32 {
        match self {
            AppError::InvalidJobs { .. } | AppError::Options(_) => 2,
            AppError::Discover(_) => 1,
            AppError::Runner(error) => error.exit_code(),
        }
    }
}
