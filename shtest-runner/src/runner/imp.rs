// Copyright (c) The shtest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    config::RunnerOptions,
    errors::RunnerError,
    journal::{Journal, TestStatus},
    list::{TestCase, TestList},
    reporter::Reporter,
    runner::{dispatcher::DispatcherContext, executor::ExecutorContext, InterruptWindow},
    signal::{SignalHandler, SignalHandlerKind},
};
use chrono::{DateTime, Local};
use futures::StreamExt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{runtime::Runtime, sync::mpsc::unbounded_channel};
use tracing::debug;

/// Builder for a [`TestRunner`].
#[derive(Debug)]
pub struct TestRunnerBuilder {
    options: RunnerOptions,
    signal_handler_kind: SignalHandlerKind,
}

impl TestRunnerBuilder {
    /// Starts a builder from resolved options. Cross-flag rules (jobs
    /// forcing batch, interactive forcing a single slot) are applied here.
    pub fn new(mut options: RunnerOptions) -> Self {
        options.reconcile();
        Self {
            options,
            signal_handler_kind: SignalHandlerKind::Standard,
        }
    }

    /// Overrides the signal handler; tests use [`SignalHandlerKind::Noop`].
    pub fn set_signal_handler_kind(&mut self, kind: SignalHandlerKind) -> &mut Self {
        self.signal_handler_kind = kind;
        self
    }

    /// Creates the runtime and the signal plane.
    pub fn build(self) -> Result<TestRunner, RunnerError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("shtest-runner-worker")
            .build()
            .map_err(RunnerError::RuntimeCreate)?;

        // The signal streams must be registered from within the runtime.
        let signal_handler = {
            let _guard = runtime.enter();
            self.signal_handler_kind
                .build()
                .map_err(RunnerError::SignalHandlerSetup)?
        };

        Ok(TestRunner {
            options: Arc::new(self.options),
            runtime,
            signal_handler,
            started_at: Local::now(),
        })
    }
}

/// Context for running tests. Created using [`TestRunnerBuilder::build`].
#[derive(Debug)]
pub struct TestRunner {
    options: Arc<RunnerOptions>,
    runtime: Runtime,
    signal_handler: SignalHandler,
    started_at: DateTime<Local>,
}

impl TestRunner {
    /// The resolved options this runner was built with.
    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    /// When this run was started.
    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Executes the queue: opens the journal, schedules each case into a
    /// free slot, and produces the final report.
    pub fn execute(mut self, test_list: &TestList) -> Result<RunSummary, RunnerError> {
        let options = self.options.clone();
        let mut journal = Journal::open(&options.outdir, options.resume)?;
        let mut reporter = Reporter::new(&options);

        // With --continue, anything the journal already marks done is
        // skipped without spawning.
        let cases: Vec<TestCase> = test_list
            .cases()
            .iter()
            .filter(|case| !(options.resume && journal.is_done(&case.id.to_string())))
            .cloned()
            .collect();
        let total = cases.len();
        debug!(total, skipped = test_list.len() - total, "run queue built");

        let interrupt = Arc::new(InterruptWindow::new());
        let cancelled = Arc::new(AtomicBool::new(false));

        let signal_handler = &mut self.signal_handler;
        let (die, fatal_signal, fatal_error) = self.runtime.block_on(async {
            let (resp_tx, resp_rx) = unbounded_channel();

            let executor_cx =
                ExecutorContext::new(options.clone(), interrupt.clone(), cancelled.clone());
            let mut dispatcher_cx = DispatcherContext::new(
                &options,
                &mut journal,
                &mut reporter,
                interrupt.clone(),
                cancelled.clone(),
            );

            let executor_cx = &executor_cx;
            let stream_cancelled = cancelled.clone();
            let jobs = options.jobs;
            let tests_fut = async move {
                futures::stream::iter(cases)
                    .take_while(move |_| {
                        std::future::ready(!stream_cancelled.load(Ordering::Acquire))
                    })
                    .map(|case| {
                        let resp_tx = resp_tx.clone();
                        executor_cx.run_case(case, resp_tx)
                    })
                    .buffer_unordered(jobs)
                    .for_each(|()| std::future::ready(()))
                    .await;
                // The channel closes when the stream (and with it the last
                // sender clone) is dropped here; that ends the dispatcher.
            };

            let dispatcher_fut = dispatcher_cx.run(resp_rx, signal_handler);
            tokio::join!(dispatcher_fut, tests_fut);

            (
                dispatcher_cx.die(),
                dispatcher_cx.fatal_signal(),
                dispatcher_cx.take_fatal_error(),
            )
        });

        if let Some(error) = fatal_error {
            reporter.finish(&journal, true);
            return Err(error);
        }

        reporter.finish(&journal, fatal_signal);

        let failed = journal.count(TestStatus::Failed) + journal.count(TestStatus::Timeout);
        Ok(RunSummary {
            total,
            failed,
            die,
            fatal_signal,
        })
    }
}

/// What happened over a whole run.
#[derive(Clone, Copy, Debug)]
pub struct RunSummary {
    /// Number of cases scheduled (after `--continue` skips).
    pub total: usize,
    /// Number of failed plus timed-out cases.
    pub failed: usize,
    /// The runner gave up: global budget exhausted or fatal timeouts.
    pub die: bool,
    /// A fatal signal ended the run.
    pub fatal_signal: bool,
}

impl RunSummary {
    /// The process exit code: 1 if the runner died, was signalled, or any
    /// test failed; 0 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.die || self.fatal_signal || self.failed > 0 {
            1
        } else {
            0
        }
    }
}
