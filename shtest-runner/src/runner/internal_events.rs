// Copyright (c) The shtest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Events flowing between the executor and the dispatcher.
//!
//! The executor never talks to the outside world directly: journal
//! updates, progress lines and failure replays are all mediated by the
//! dispatcher, which keeps parallel slots from trampling each other's
//! output.

use crate::{journal::TestStatus, runner::RusageSnapshot};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// An event sent by an executor to the dispatcher.
#[derive(Debug)]
pub(crate) enum ExecutorEvent {
    /// A test has been installed in a slot and its child is being spawned.
    Started {
        /// The display id.
        id: String,
        /// The slot index.
        slot: usize,
        /// Channel on which the dispatcher can send requests back to this
        /// unit (signal forwarding).
        req_tx: UnboundedSender<RunUnitRequest>,
    },

    /// Periodic progress pulse for a still-running test.
    Pulse {
        id: String,
        slot: usize,
        elapsed: Duration,
    },

    /// A test finished and was classified.
    Finished {
        id: String,
        slot: usize,
        status: TestStatus,
        /// Wall-clock duration of the run.
        wall: Duration,
        /// Resource usage, when the child was reaped normally.
        rusage: Option<RusageSnapshot>,
        /// Rendered in-memory output for replay on failure.
        replay: Option<Vec<u8>>,
    },

    /// Supervisor-level trouble that is not attributable to the test
    /// (socketpair allocation failure). Aborts the run.
    Fatal {
        id: String,
        error: std::io::Error,
    },
}

/// A request sent from the dispatcher to a running unit.
#[derive(Clone, Copy, Debug)]
pub(crate) enum RunUnitRequest {
    /// Forward a signal to the child's process group.
    Signal(ForwardSignal),
}

/// The signal to forward.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ForwardSignal {
    Interrupt,
    Term,
    Hangup,
    Quit,
    Kill,
}

impl ForwardSignal {
    pub(crate) fn signal(self) -> libc::c_int {
        match self {
            ForwardSignal::Interrupt => libc::SIGINT,
            ForwardSignal::Term => libc::SIGTERM,
            ForwardSignal::Hangup => libc::SIGHUP,
            ForwardSignal::Quit => libc::SIGQUIT,
            ForwardSignal::Kill => libc::SIGKILL,
        }
    }
}
