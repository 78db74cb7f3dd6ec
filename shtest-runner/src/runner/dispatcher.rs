// Copyright (c) The shtest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The controller for the run.
//!
//! The dispatcher interfaces with the outside world: it receives events
//! from the executors and from the signal plane, owns the journal and the
//! progress reporter, enforces the global wall-clock budget and the
//! fatal-timeouts rule, and forwards operator signals to running child
//! process groups.

use crate::{
    config::RunnerOptions,
    errors::{JournalError, RunnerError},
    journal::Journal,
    reporter::Reporter,
    runner::{
        internal_events::{ExecutorEvent, ForwardSignal, RunUnitRequest},
        InterruptWindow,
    },
    signal::{ShutdownEvent, SignalHandler},
};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

/// How long the interrupt flag stays armed; a second interrupt inside the
/// window is fatal.
const INTERRUPT_WINDOW: Duration = Duration::from_secs(1);

/// How many consecutive timeouts trigger `--fatal-timeouts`.
const FATAL_CONSECUTIVE_TIMEOUTS: u32 = 2;

/// How long the runner lingers after giving up on consecutive timeouts,
/// keeping the VM around for inspection.
const FATAL_TIMEOUT_SLEEP: Duration = Duration::from_secs(3600);

#[derive(Debug)]
struct RunningUnit {
    id: String,
    req_tx: UnboundedSender<RunUnitRequest>,
}

#[derive(Debug)]
pub(crate) struct DispatcherContext<'a> {
    options: &'a RunnerOptions,
    journal: &'a mut Journal,
    reporter: &'a mut Reporter,
    interrupt: Arc<InterruptWindow>,
    cancelled: Arc<AtomicBool>,
    running: BTreeMap<usize, RunningUnit>,
    die: bool,
    fatal_signal: bool,
    fatal_error: Option<RunnerError>,
}

impl<'a> DispatcherContext<'a> {
    pub(crate) fn new(
        options: &'a RunnerOptions,
        journal: &'a mut Journal,
        reporter: &'a mut Reporter,
        interrupt: Arc<InterruptWindow>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            options,
            journal,
            reporter,
            interrupt,
            cancelled,
            running: BTreeMap::new(),
            die: false,
            fatal_signal: false,
            fatal_error: None,
        }
    }

    /// Runs the dispatcher to completion, until the executor channel is
    /// closed.
    pub(crate) async fn run(
        &mut self,
        mut executor_rx: UnboundedReceiver<ExecutorEvent>,
        signal_handler: &mut SignalHandler,
    ) {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.options.total_timeout);
        let mut signals_done = false;

        loop {
            tokio::select! {
                event = executor_rx.recv() => {
                    match event {
                        Some(event) => self.handle_executor_event(event).await,
                        None => break,
                    }
                }
                signal = signal_handler.recv(), if !signals_done => {
                    match signal {
                        Some(signal) => self.handle_signal(signal),
                        None => signals_done = true,
                    }
                }
                _ = tokio::time::sleep_until(deadline), if !self.die => {
                    warn!("total wall-clock budget exhausted");
                    self.reporter
                        .message("### total wall-clock budget exhausted, giving up");
                    self.die = true;
                    self.cancel();
                }
            }
        }
    }

    async fn handle_executor_event(&mut self, event: ExecutorEvent) {
        match event {
            ExecutorEvent::Started { id, slot, req_tx } => {
                debug!(test = %id, slot, "test started");
                if let Err(error) = self.journal.started(&id) {
                    self.journal_trouble(error);
                }
                self.reporter.test_started(slot, &id);
                self.running.insert(slot, RunningUnit { id, req_tx });
            }

            ExecutorEvent::Pulse { id, slot, elapsed } => {
                self.reporter.test_running(slot, &id, elapsed);
            }

            ExecutorEvent::Finished {
                id,
                slot,
                status,
                wall,
                rusage,
                replay,
            } => {
                debug!(test = %id, slot, %status, "test finished");
                self.running.remove(&slot);
                if let Err(error) = self.journal.done(&id, status) {
                    self.journal_trouble(error);
                }
                self.reporter
                    .test_finished(slot, &id, status, wall, rusage.as_ref());
                if let Some(replay) = replay {
                    self.reporter.replay(&replay);
                }
                self.reporter.flush();

                if self.options.fatal_timeouts
                    && self.journal.consecutive_timeouts() >= FATAL_CONSECUTIVE_TIMEOUTS
                    && !self.die
                {
                    // Put the test back to started so a resume retries it,
                    // then linger: something below us is broken enough that
                    // an operator will want the VM as-is.
                    if let Err(error) = self.journal.restart(&id) {
                        self.journal_trouble(error);
                    }
                    self.reporter
                        .message("### two consecutive timeouts, giving up after a pause");
                    self.cancel();
                    tokio::time::sleep(FATAL_TIMEOUT_SLEEP).await;
                    self.die = true;
                }
            }

            ExecutorEvent::Fatal { id, error } => {
                warn!(test = %id, %error, "supervisor-level failure");
                self.fatal_error = Some(RunnerError::Fork(error));
                self.cancel();
                self.broadcast(ForwardSignal::Kill);
            }
        }
    }

    fn handle_signal(&mut self, signal: ShutdownEvent) {
        match signal {
            ShutdownEvent::Interrupt => {
                if self.interrupt.active() {
                    // A second interrupt within the window force-quits.
                    debug!("second interrupt, shutting down");
                    self.fatal(ForwardSignal::Kill);
                } else {
                    debug!("interrupt, forwarding to running tests");
                    self.interrupt.arm(INTERRUPT_WINDOW);
                    self.broadcast(ForwardSignal::Interrupt);
                    if self.options.batch {
                        self.fatal_signal = true;
                        self.cancel();
                    }
                }
            }
            ShutdownEvent::Hangup => self.fatal(ForwardSignal::Hangup),
            ShutdownEvent::Term => self.fatal(ForwardSignal::Term),
            ShutdownEvent::Quit => self.fatal(ForwardSignal::Quit),
        }
    }

    /// A fatal signal: forward it once to every running child group, stop
    /// scheduling and let the slots drain.
    fn fatal(&mut self, forward: ForwardSignal) {
        self.fatal_signal = true;
        self.cancel();
        self.broadcast(forward);
    }

    fn broadcast(&mut self, forward: ForwardSignal) {
        self.running
            .retain(|_, unit| unit.req_tx.send(RunUnitRequest::Signal(forward)).is_ok());
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn journal_trouble(&mut self, error: JournalError) {
        warn!(%error, "journal write failed, aborting run");
        if self.fatal_error.is_none() {
            self.fatal_error = Some(RunnerError::Journal(error));
        }
        self.cancel();
    }

    pub(crate) fn die(&self) -> bool {
        self.die
    }

    pub(crate) fn fatal_signal(&self) -> bool {
        self.fatal_signal
    }

    pub(crate) fn take_fatal_error(&mut self) -> Option<RunnerError> {
        self.fatal_error.take()
    }
}
