// Copyright (c) The shtest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Raw process plumbing: socketpairs, process groups, `wait4` and the
//! sysrq tap.

use std::{
    io,
    os::fd::{FromRawFd, OwnedFd},
    process::ExitStatus,
    time::Duration,
};

fn cvt(res: libc::c_int) -> io::Result<libc::c_int> {
    if res == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res)
    }
}

/// Creates the stream socketpair carrying the child's combined stdout and
/// stderr. Both ends are close-on-exec; the child's copies are made by
/// `Stdio::from` dup'ing at spawn time.
pub(crate) fn socketpair_stream() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];
    cvt(unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    })?;
    let ours = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let theirs = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((ours, theirs))
}

/// Puts the parent's end into non-blocking mode.
pub(crate) fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    use std::os::fd::AsRawFd;
    let raw = fd.as_raw_fd();
    let flags = cvt(unsafe { libc::fcntl(raw, libc::F_GETFL) })?;
    cvt(unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    Ok(())
}

/// Resource usage captured by `wait4` when the child is reaped.
#[derive(Clone, Copy, Debug, Default)]
pub struct RusageSnapshot {
    /// User CPU time.
    pub user: Duration,
    /// System CPU time.
    pub sys: Duration,
    /// Peak resident set size, in KiB.
    pub max_rss_kb: i64,
    /// Blocks read.
    pub inblock: i64,
    /// Blocks written.
    pub oublock: i64,
}

fn timeval_duration(tv: libc::timeval) -> Duration {
    Duration::new(tv.tv_sec.max(0) as u64, (tv.tv_usec.max(0) as u32) * 1000)
}

fn snapshot(ru: libc::rusage) -> RusageSnapshot {
    RusageSnapshot {
        user: timeval_duration(ru.ru_utime),
        sys: timeval_duration(ru.ru_stime),
        max_rss_kb: ru.ru_maxrss as i64,
        inblock: ru.ru_inblock as i64,
        oublock: ru.ru_oublock as i64,
    }
}

fn wait4(pid: u32, flags: libc::c_int) -> io::Result<Option<(ExitStatus, RusageSnapshot)>> {
    use std::os::unix::process::ExitStatusExt;

    let mut status: libc::c_int = 0;
    let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        let res = unsafe { libc::wait4(pid as libc::pid_t, &mut status, flags, &mut ru) };
        return match res {
            -1 => {
                let error = io::Error::last_os_error();
                if error.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                Err(error)
            }
            0 => Ok(None),
            _ => Ok(Some((ExitStatus::from_raw(status), snapshot(ru)))),
        };
    }
}

/// Non-blocking reap. `Ok(None)` means the child is still running.
pub(crate) fn wait4_nohang(pid: u32) -> io::Result<Option<(ExitStatus, RusageSnapshot)>> {
    wait4(pid, libc::WNOHANG)
}

/// Blocking reap, used only after SIGKILL so the wait is bounded.
pub(crate) fn wait4_blocking(pid: u32) -> io::Result<(ExitStatus, RusageSnapshot)> {
    wait4(pid, 0).map(|reaped| reaped.expect("blocking wait4 returns a reaped child"))
}

/// Sends a signal to the child's process group. The child was placed in
/// its own group at spawn, so the negative pid reaches it and any
/// grandchildren.
pub(crate) fn kill_group(pid: u32, signal: libc::c_int) {
    unsafe {
        libc::kill(-(pid as libc::pid_t), signal);
    }
}

/// Best-effort task dump into the kernel log before a timeout kill, so the
/// hung state is captured where the kmsg tap can see it.
pub(crate) fn sysrq_dump_tasks() {
    let _ = std::fs::write("/proc/sysrq-trigger", "t");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn socketpair_carries_bytes() {
        let (ours, theirs) = socketpair_stream().unwrap();
        set_nonblocking(&ours).unwrap();

        let wrote =
            unsafe { libc::write(theirs.as_raw_fd(), b"ping".as_ptr().cast(), 4) };
        assert_eq!(wrote, 4);

        let mut buf = [0u8; 8];
        let read =
            unsafe { libc::read(ours.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        assert_eq!(read, 4);
        assert_eq!(&buf[..4], b"ping");
    }

    #[test]
    fn wait4_reaps_with_rusage() {
        use std::process::Command;

        let child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        let (status, _rusage) = wait4_blocking(pid).unwrap();
        assert!(status.success());
    }
}
