// Copyright (c) The shtest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Support for handling signals in shtest.
//!
//! Handlers only produce events; the dispatcher drains them, maintains the
//! interrupt window and forwards signals to child process groups. Only
//! four signals matter to the supervisor, so each gets its own named
//! stream and `recv` races them directly.

use std::io;
use tokio::signal::unix::{signal, Signal, SignalKind};

/// The kind of signal handling to set up for a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum SignalHandlerKind {
    /// The standard signal handler: capture interrupt and termination
    /// signals.
    Standard,

    /// A no-op signal handler. Useful for tests.
    Noop,
}

impl SignalHandlerKind {
    pub(crate) fn build(self) -> io::Result<SignalHandler> {
        match self {
            Self::Standard => ShutdownSignals::register().map(SignalHandler::Streams),
            Self::Noop => Ok(SignalHandler::Noop),
        }
    }
}

/// The signal plane as seen by the dispatcher.
#[derive(Debug)]
pub(crate) enum SignalHandler {
    /// Registered kernel signal streams.
    Streams(ShutdownSignals),
    /// Never produces an event.
    Noop,
}

impl SignalHandler {
    pub(crate) async fn recv(&mut self) -> Option<ShutdownEvent> {
        match self {
            SignalHandler::Streams(signals) => signals.recv().await,
            SignalHandler::Noop => None,
        }
    }
}

/// One stream per signal the supervisor reacts to.
#[derive(Debug)]
pub(crate) struct ShutdownSignals {
    interrupt: Signal,
    hangup: Signal,
    term: Signal,
    quit: Signal,
}

impl ShutdownSignals {
    fn register() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            hangup: signal(SignalKind::hangup())?,
            term: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    /// The next delivered signal, whichever stream fires first. `None`
    /// once a stream can no longer receive.
    async fn recv(&mut self) -> Option<ShutdownEvent> {
        tokio::select! {
            received = self.interrupt.recv() => received.map(|()| ShutdownEvent::Interrupt),
            received = self.hangup.recv() => received.map(|()| ShutdownEvent::Hangup),
            received = self.term.recv() => received.map(|()| ShutdownEvent::Term),
            received = self.quit.recv() => received.map(|()| ShutdownEvent::Quit),
        }
    }
}

/// A signal event that should interrupt or shut down the run.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ShutdownEvent {
    /// SIGINT: interrupt the current tests; a second one within the
    /// interrupt window is fatal.
    Interrupt,
    /// SIGHUP.
    Hangup,
    /// SIGTERM.
    Term,
    /// SIGQUIT.
    Quit,
}

impl ShutdownEvent {
    /// The raw signal to forward to child process groups.
    pub(crate) fn signal(self) -> libc::c_int {
        match self {
            ShutdownEvent::Interrupt => libc::SIGINT,
            ShutdownEvent::Hangup => libc::SIGHUP,
            ShutdownEvent::Term => libc::SIGTERM,
            ShutdownEvent::Quit => libc::SIGQUIT,
        }
    }
}
