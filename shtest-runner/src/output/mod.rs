// Copyright (c) The shtest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The multiplexed output pipeline.
//!
//! Every running test owns an [`IoHub`]: a fan-in/fan-out junction where
//! output producers ([`Source`]: the child socket, watched files, the
//! kernel log) drain into output consumers ([`Sink`]: the per-test log
//! file, stdout, an in-memory replay buffer). Lines are stamped with the
//! wall-clock second their first byte arrived and run through a
//! [`Formatter`] that prefixes timestamps and performs in-band
//! substitutions.

mod format;
mod hub;
mod sink;
mod source;
mod timed_buffer;

pub use format::{Fed, Formatter, Substitutor};
pub use hub::IoHub;
pub use sink::{BufSink, FdSink, FileSink, Sink};
pub use source::{ChildSource, FileSource, KmsgSource, Source};
pub use timed_buffer::{TimedBuffer, TimedLine};
