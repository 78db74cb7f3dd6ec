// Copyright (c) The shtest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The executor for tests.
//!
//! This component spawns one child per test, pumps its output through the
//! IO hub, enforces the inactivity watchdog and classifies the outcome.
//! It does not communicate with the outside world directly; journal
//! updates, progress lines and failure replays all go through the
//! dispatcher.

use crate::{
    config::RunnerOptions,
    journal::TestStatus,
    list::TestCase,
    output::{BufSink, ChildSource, FdSink, FileSink, FileSource, IoHub, KmsgSource, Sink, Source},
    runner::{
        internal_events::{ExecutorEvent, RunUnitRequest},
        unix, InterruptWindow, RusageSnapshot, SlotPool,
    },
};
use camino::Utf8Path;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    os::fd::OwnedFd,
    os::unix::process::CommandExt,
    process::{Command, ExitStatus, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    time::MissedTickBehavior,
};
use tracing::{debug, warn};

/// Monitor tick period; bounds how late a child exit or watched-file write
/// is noticed.
const TICK: Duration = Duration::from_millis(500);

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

const PULSE_INTERVAL: Duration = Duration::from_secs(1);

/// How long a timed-out child gets between SIGINT and SIGKILL.
const TIMEOUT_GRACE: Duration = Duration::from_secs(5);

/// The self-skip exit code convention for test scripts.
const SKIP_EXIT_CODE: i32 = 200;

#[derive(Debug)]
pub(crate) struct ExecutorContext {
    options: Arc<RunnerOptions>,
    slots: SlotPool,
    interrupt: Arc<InterruptWindow>,
    cancelled: Arc<AtomicBool>,
}

impl ExecutorContext {
    pub(crate) fn new(
        options: Arc<RunnerOptions>,
        interrupt: Arc<InterruptWindow>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            slots: SlotPool::new(options.jobs),
            options,
            interrupt,
            cancelled,
        }
    }

    /// Runs one test to completion in the first free slot.
    pub(crate) async fn run_case(&self, case: TestCase, resp_tx: UnboundedSender<ExecutorEvent>) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let slot = self.slots.take();
        self.run_in_slot(&case, slot, &resp_tx).await;
        self.slots.release(slot);
    }

    async fn run_in_slot(
        &self,
        case: &TestCase,
        slot: usize,
        resp_tx: &UnboundedSender<ExecutorEvent>,
    ) {
        let options = &self.options;
        let id = case.id.to_string();
        let start = Instant::now();

        let (req_tx, mut req_rx) = unbounded_channel();
        let _ = resp_tx.send(ExecutorEvent::Started {
            id: id.clone(),
            slot,
            req_tx,
        });

        let mut hub = IoHub::new();

        // In interactive mode the child stays attached to the terminal and
        // nothing flows through the socket.
        let child_socket = if options.interactive {
            None
        } else {
            let wired = unix::socketpair_stream().and_then(|(ours, theirs)| {
                unix::set_nonblocking(&ours)?;
                Ok((ChildSource::new(ours)?, theirs))
            });
            match wired {
                Ok((source, theirs)) => {
                    hub.add_source(Source::Child(source));
                    Some(theirs)
                }
                Err(error) => {
                    let _ = resp_tx.send(ExecutorEvent::Fatal { id, error });
                    return;
                }
            }
        };

        if options.verbose || options.interactive {
            hub.add_sink(Sink::Fd(FdSink::new(start)));
        } else if !options.batch {
            hub.add_sink(Sink::Buf(BufSink::new(start)));
        }
        hub.add_sink(Sink::File(FileSink::new(
            options.outdir.join(case.id.log_file_name()),
            start,
        )));
        for watched in &options.watch {
            hub.add_source(Source::File(FileSource::new(watched.clone())));
        }
        if options.kmsg {
            let mut kmsg = KmsgSource::new();
            kmsg.reset();
            hub.add_source(Source::Kmsg(kmsg));
        }

        let spawned = self
            .build_command(case, slot, child_socket.as_ref())
            .and_then(|mut command| command.spawn());
        drop(child_socket);

        let pid = match spawned {
            Ok(child) => child.id(),
            Err(error) => {
                hub.close();
                hub.finish_sinks();
                hub.clear();
                if is_fork_failure(&error) {
                    // The process table or memory ran out; this is not the
                    // test's fault and no later test would fare better.
                    warn!(test = %id, %error, "cannot fork test child");
                    let _ = resp_tx.send(ExecutorEvent::Fatal { id, error });
                } else {
                    // Exec-level trouble (missing or unexecutable
                    // interpreter); the parent-side view is a failed test.
                    warn!(test = %id, %error, "failed to exec test child");
                    let _ = resp_tx.send(ExecutorEvent::Finished {
                        id,
                        slot,
                        status: TestStatus::Failed,
                        wall: start.elapsed(),
                        rusage: None,
                        replay: None,
                    });
                }
                return;
            }
        };
        debug!(test = %id, pid, slot, "child spawned");

        let (timed_out, reaped) = self
            .monitor(&mut hub, pid, start, &id, slot, resp_tx, &mut req_rx)
            .await;

        // One last drain picks up anything buffered in the socket or the
        // watched files, then the hub is torn down.
        hub.poll_sources();
        hub.close();
        hub.finish_sinks();

        let status = classify(
            timed_out,
            reaped.as_ref().map(|(status, _)| *status),
            self.interrupt.active(),
        );
        let replay = if matches!(status, TestStatus::Failed | TestStatus::Timeout) {
            hub.replay().filter(|bytes| !bytes.is_empty())
        } else {
            None
        };
        hub.clear();

        let _ = resp_tx.send(ExecutorEvent::Finished {
            id,
            slot,
            status,
            wall: start.elapsed(),
            rusage: reaped.map(|(_, rusage)| rusage),
            replay,
        });
    }

    /// One monitor loop, from spawn to reap. Returns the timeout flag and
    /// the reaped exit status plus rusage.
    #[expect(clippy::too_many_arguments)]
    async fn monitor(
        &self,
        hub: &mut IoHub,
        pid: u32,
        start: Instant,
        id: &str,
        slot: usize,
        resp_tx: &UnboundedSender<ExecutorEvent>,
        req_rx: &mut UnboundedReceiver<RunUnitRequest>,
    ) -> (bool, Option<(ExitStatus, RusageSnapshot)>) {
        let options = &self.options;
        let timeout = Duration::from_secs(options.timeout);
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut silent_start = Instant::now();
        let mut last_heartbeat = Instant::now();
        let mut last_pulse = Instant::now();
        let mut requests_done = false;

        loop {
            tokio::select! {
                delivered = hub.pump() => {
                    if delivered > 0 {
                        silent_start = Instant::now();
                    }
                }
                _ = tick.tick() => {}
                request = req_rx.recv(), if !requests_done => {
                    match request {
                        Some(RunUnitRequest::Signal(signal)) => {
                            debug!(test = %id, ?signal, "forwarding signal to child group");
                            unix::kill_group(pid, signal.signal());
                        }
                        None => requests_done = true,
                    }
                }
            }

            if let Some(heartbeat) = &options.heartbeat {
                if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
                    write_heartbeat(heartbeat);
                    last_heartbeat = Instant::now();
                }
            }

            match unix::wait4_nohang(pid) {
                Ok(Some(reaped)) => return (false, Some(reaped)),
                Ok(None) => {}
                Err(error) => {
                    warn!(test = %id, %error, "wait4 failed");
                    return (false, None);
                }
            }

            if !options.interactive && silent_start.elapsed() > timeout {
                let reaped = self.kill_after_timeout(hub, pid, id).await;
                return (true, reaped);
            }

            if options.wants_progress_pulse() && last_pulse.elapsed() >= PULSE_INTERVAL {
                let _ = resp_tx.send(ExecutorEvent::Pulse {
                    id: id.to_owned(),
                    slot,
                    elapsed: start.elapsed(),
                });
                last_pulse = Instant::now();
            }

            if hub.poll_sources() > 0 {
                silent_start = Instant::now();
            }
            hub.flush_sinks();
        }
    }

    /// The timeout kill sequence: SIGINT the group, give it a grace period
    /// while still draining output, then dump kernel task state and
    /// SIGKILL.
    async fn kill_after_timeout(
        &self,
        hub: &mut IoHub,
        pid: u32,
        id: &str,
    ) -> Option<(ExitStatus, RusageSnapshot)> {
        warn!(test = %id, "inactivity timeout, interrupting child group");
        unix::kill_group(pid, libc::SIGINT);

        let grace_deadline = Instant::now() + TIMEOUT_GRACE;
        loop {
            match unix::wait4_nohang(pid) {
                Ok(Some(reaped)) => return Some(reaped),
                Ok(None) => {}
                Err(error) => {
                    warn!(test = %id, %error, "wait4 failed");
                    return None;
                }
            }
            if Instant::now() >= grace_deadline {
                break;
            }
            tokio::select! {
                _ = hub.pump() => {}
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
        }

        warn!(test = %id, "child ignored interrupt, killing process group");
        unix::sysrq_dump_tasks();
        unix::kill_group(pid, libc::SIGKILL);
        match unix::wait4_blocking(pid) {
            Ok(reaped) => Some(reaped),
            Err(error) => {
                warn!(test = %id, %error, "wait4 failed after SIGKILL");
                None
            }
        }
    }

    /// Builds the child command: `bash -noprofile -norc <file>` or the
    /// configured interpreter, in its own process group, with the slot and
    /// flavour exported.
    fn build_command(
        &self,
        case: &TestCase,
        slot: usize,
        socket: Option<&OwnedFd>,
    ) -> io::Result<Command> {
        let options = &self.options;
        let mut command = match &case.interpreter {
            Some(script) => {
                let mut command = Command::new(script);
                command.arg(&case.abs_path);
                command
            }
            None => {
                let mut command = Command::new("bash");
                command.arg("-noprofile").arg("-norc").arg(&case.abs_path);
                command
            }
        };
        command
            .current_dir(&options.workdir)
            .env("TEST_SLOT", slot.to_string())
            .env(&options.flavour_var, &case.id.flavour)
            .process_group(0);
        if let Some(socket) = socket {
            command
                .stdin(Stdio::null())
                .stdout(Stdio::from(socket.try_clone()?))
                .stderr(Stdio::from(socket.try_clone()?));
        }
        Ok(command)
    }
}

/// Distinguishes the fork side of a spawn error from the exec side.
/// `Command::spawn` reports both through one `io::Result`; resource
/// exhaustion means the runner itself must stop (exit 201), while an
/// unrunnable test program is just that test failing.
fn is_fork_failure(error: &io::Error) -> bool {
    matches!(
        error.raw_os_error(),
        Some(libc::EAGAIN | libc::ENOMEM | libc::EMFILE | libc::ENFILE)
    )
}

/// Translates the reaped state into a journal code.
fn classify(timed_out: bool, status: Option<ExitStatus>, interrupt_active: bool) -> TestStatus {
    use std::os::unix::process::ExitStatusExt;

    if timed_out {
        return TestStatus::Timeout;
    }
    let Some(status) = status else {
        return TestStatus::Failed;
    };
    if let Some(code) = status.code() {
        match code {
            0 => TestStatus::Passed,
            SKIP_EXIT_CODE => TestStatus::Skipped,
            _ => TestStatus::Failed,
        }
    } else {
        match status.signal() {
            Some(signal)
                if (signal == libc::SIGINT || signal == libc::SIGTERM) && interrupt_active =>
            {
                TestStatus::Interrupted
            }
            _ => TestStatus::Failed,
        }
    }
}

/// Appends one `.` to the heartbeat file and fsyncs it, so an external
/// watcher can tell the runner is alive.
fn write_heartbeat(path: &Utf8Path) {
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| {
            file.write_all(b".")?;
            file.sync_all()
        });
    if let Err(error) = result {
        debug!(heartbeat = %path, %error, "heartbeat write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    fn exit(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    fn signaled(signal: i32) -> ExitStatus {
        ExitStatus::from_raw(signal)
    }

    #[test]
    fn fork_errnos_are_fatal_exec_errnos_are_not() {
        for errno in [libc::EAGAIN, libc::ENOMEM, libc::EMFILE, libc::ENFILE] {
            assert!(is_fork_failure(&io::Error::from_raw_os_error(errno)));
        }
        for errno in [libc::ENOENT, libc::EACCES, libc::ENOEXEC] {
            assert!(!is_fork_failure(&io::Error::from_raw_os_error(errno)));
        }
        assert!(!is_fork_failure(&io::Error::new(
            io::ErrorKind::Other,
            "no errno"
        )));
    }

    #[test]
    fn exit_codes_map_to_statuses() {
        assert_eq!(classify(false, Some(exit(0)), false), TestStatus::Passed);
        assert_eq!(classify(false, Some(exit(200)), false), TestStatus::Skipped);
        assert_eq!(classify(false, Some(exit(1)), false), TestStatus::Failed);
        assert_eq!(classify(false, Some(exit(202)), false), TestStatus::Failed);
    }

    #[test]
    fn timeout_flag_wins() {
        assert_eq!(classify(true, Some(exit(0)), false), TestStatus::Timeout);
        assert_eq!(classify(true, None, false), TestStatus::Timeout);
    }

    #[test]
    fn interrupt_classification_needs_the_flag() {
        assert_eq!(
            classify(false, Some(signaled(libc::SIGINT)), true),
            TestStatus::Interrupted
        );
        assert_eq!(
            classify(false, Some(signaled(libc::SIGTERM)), true),
            TestStatus::Interrupted
        );
        assert_eq!(
            classify(false, Some(signaled(libc::SIGINT)), false),
            TestStatus::Failed
        );
        assert_eq!(
            classify(false, Some(signaled(libc::SIGKILL)), true),
            TestStatus::Failed
        );
    }
}
