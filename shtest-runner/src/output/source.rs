// Copyright (c) The shtest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::Sink;
use camino::Utf8PathBuf;
use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom},
    os::fd::{AsRawFd, OwnedFd, RawFd},
    os::unix::fs::OpenOptionsExt,
    time::Instant,
};
use tokio::io::unix::AsyncFd;
use tracing::{debug, warn};

/// Upper bound on bytes drained from one source per sync.
const MAX_SYNC_BYTES: usize = 128 * 1024;

const READ_CHUNK: usize = 16 * 1024;

/// An output producer attached to a test's IO hub.
#[derive(Debug)]
pub enum Source {
    /// The read end of the child's socketpair; the only source that takes
    /// part in readiness waiting.
    Child(ChildSource),
    /// A watched file, polled every monitor tick.
    File(FileSource),
    /// The kernel log tap.
    Kmsg(KmsgSource),
}

impl Source {
    /// Drains whatever is available right now into the sinks, without
    /// waiting. Returns the number of bytes delivered.
    pub fn poll(&mut self, sinks: &mut [Sink]) -> usize {
        match self {
            Source::Child(source) => source.drain_now(sinks),
            Source::File(source) => source.sync(sinks),
            Source::Kmsg(source) => source.sync(sinks),
        }
    }
}

fn read_raw(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn push_all(sinks: &mut [Sink], bytes: &[u8]) {
    for sink in sinks.iter_mut() {
        sink.push(bytes);
    }
}

/// The parent's end of the socketpair carrying the child's combined
/// stdout and stderr.
#[derive(Debug)]
pub struct ChildSource {
    fd: AsyncFd<OwnedFd>,
    closed: bool,
}

impl ChildSource {
    /// Wraps the (non-blocking) read end of the child socket.
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        Ok(Self {
            fd: AsyncFd::new(fd)?,
            closed: false,
        })
    }

    /// Waits until the socket is readable, then drains it into the sinks.
    /// Never resolves once the socket has reached end of file.
    pub(crate) async fn pump(&mut self, sinks: &mut [Sink]) -> usize {
        if self.closed {
            return std::future::pending().await;
        }
        let mut guard = match self.fd.readable().await {
            Ok(guard) => guard,
            Err(error) => {
                warn!(%error, "child socket readiness failed");
                self.closed = true;
                return 0;
            }
        };

        let mut total = 0;
        let mut buf = [0u8; READ_CHUNK];
        while total < MAX_SYNC_BYTES {
            match guard.try_io(|inner| read_raw(inner.get_ref().as_raw_fd(), &mut buf)) {
                Ok(Ok(0)) => {
                    self.closed = true;
                    break;
                }
                Ok(Ok(n)) => {
                    push_all(sinks, &buf[..n]);
                    total += n;
                }
                Ok(Err(error)) => {
                    warn!(%error, "error reading child socket");
                    self.closed = true;
                    break;
                }
                Err(_would_block) => break,
            }
        }
        total
    }

    /// Drains without waiting; used from the tick path and after the child
    /// has exited.
    pub(crate) fn drain_now(&mut self, sinks: &mut [Sink]) -> usize {
        if self.closed {
            return 0;
        }
        let fd = self.fd.get_ref().as_raw_fd();
        let mut total = 0;
        let mut buf = [0u8; READ_CHUNK];
        while total < MAX_SYNC_BYTES {
            match read_raw(fd, &mut buf) {
                Ok(0) => {
                    self.closed = true;
                    break;
                }
                Ok(n) => {
                    push_all(sinks, &buf[..n]);
                    total += n;
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    warn!(%error, "error reading child socket");
                    self.closed = true;
                    break;
                }
            }
        }
        total
    }

    /// True once the write side has been closed and fully drained.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// A watched file. Opened lazily on first sync and seeked to the end, so
/// that only data written while the test runs is captured. Never takes
/// part in readiness waiting; the monitor polls it every tick.
#[derive(Debug)]
pub struct FileSource {
    path: Utf8PathBuf,
    file: Option<File>,
    dead: bool,
}

impl FileSource {
    /// Creates a watcher for `path`.
    pub fn new(path: Utf8PathBuf) -> Self {
        Self {
            path,
            file: None,
            dead: false,
        }
    }

    fn open(&mut self) {
        let opened = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(&self.path);
        match opened {
            Ok(mut file) => {
                if let Err(error) = file.seek(SeekFrom::End(0)) {
                    warn!(path = %self.path, %error, "failed to seek watched file");
                    self.dead = true;
                    return;
                }
                self.file = Some(file);
            }
            // The file may simply not exist yet; keep trying.
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => {
                warn!(path = %self.path, %error, "failed to open watched file");
                self.dead = true;
            }
        }
    }

    fn sync(&mut self, sinks: &mut [Sink]) -> usize {
        if self.dead {
            return 0;
        }
        if self.file.is_none() {
            self.open();
        }
        let Some(file) = &mut self.file else {
            return 0;
        };

        let mut total = 0;
        let mut buf = [0u8; READ_CHUNK];
        while total < MAX_SYNC_BYTES {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    push_all(sinks, &buf[..n]);
                    total += n;
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    warn!(path = %self.path, %error, "error reading watched file");
                    self.dead = true;
                    break;
                }
            }
        }
        total
    }
}

#[cfg(target_os = "linux")]
const SYSLOG_ACTION_READ_CLEAR: libc::c_int = 4;
#[cfg(target_os = "linux")]
const SYSLOG_ACTION_CLEAR: libc::c_int = 5;
#[cfg(target_os = "linux")]
const SYSLOG_ACTION_SIZE_BUFFER: libc::c_int = 10;

#[derive(Debug)]
enum KmsgMode {
    /// Reading `/dev/kmsg` record by record, starting from the end of the
    /// buffer.
    #[cfg(target_os = "linux")]
    Dev(File),
    /// Draining the kernel ring via the syslog read-and-clear syscall.
    #[cfg(target_os = "linux")]
    Syslog,
    Disabled,
}

/// The kernel-log tap. Linux only; on permission denial it self-disables
/// and the test proceeds without it.
#[derive(Debug)]
pub struct KmsgSource {
    mode: KmsgMode,
}

impl KmsgSource {
    /// Opens the kernel log, preferring `/dev/kmsg` and falling back to
    /// the syslog syscall.
    #[cfg(target_os = "linux")]
    pub fn new() -> Self {
        let opened = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open("/dev/kmsg");
        match opened {
            Ok(mut file) => {
                let _ = file.seek(SeekFrom::End(0));
                return Self {
                    mode: KmsgMode::Dev(file),
                };
            }
            Err(error) => {
                debug!(%error, "cannot open /dev/kmsg, trying syslog");
            }
        }

        let size = unsafe { libc::klogctl(SYSLOG_ACTION_SIZE_BUFFER, std::ptr::null_mut(), 0) };
        if size > 0 {
            // Start from a clean ring so earlier noise is not attributed to
            // this test.
            unsafe { libc::klogctl(SYSLOG_ACTION_CLEAR, std::ptr::null_mut(), 0) };
            Self {
                mode: KmsgMode::Syslog,
            }
        } else {
            debug!("kernel log unavailable, disabling kmsg source");
            Self {
                mode: KmsgMode::Disabled,
            }
        }
    }

    /// The kernel-log tap is Linux-only.
    #[cfg(not(target_os = "linux"))]
    pub fn new() -> Self {
        Self {
            mode: KmsgMode::Disabled,
        }
    }

    /// Re-positions at the end of the buffer (or clears the ring) so the
    /// next test starts from a clean slate.
    pub fn reset(&mut self) {
        match &mut self.mode {
            #[cfg(target_os = "linux")]
            KmsgMode::Dev(file) => {
                let _ = file.seek(SeekFrom::End(0));
            }
            #[cfg(target_os = "linux")]
            KmsgMode::Syslog => unsafe {
                libc::klogctl(SYSLOG_ACTION_CLEAR, std::ptr::null_mut(), 0);
            },
            KmsgMode::Disabled => {}
        }
    }

    #[cfg(target_os = "linux")]
    fn sync(&mut self, sinks: &mut [Sink]) -> usize {
        match &mut self.mode {
            KmsgMode::Dev(file) => {
                let mut total = 0;
                // Each read returns exactly one record.
                let mut buf = [0u8; 8192];
                while total < MAX_SYNC_BYTES {
                    match file.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            push_all(sinks, &buf[..n]);
                            total += n;
                        }
                        Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                        // The record was overwritten under us; skip ahead.
                        Err(error) if error.raw_os_error() == Some(libc::EPIPE) => continue,
                        Err(error) => {
                            debug!(%error, "kmsg read failed, disabling");
                            self.mode = KmsgMode::Disabled;
                            break;
                        }
                    }
                }
                total
            }
            KmsgMode::Syslog => {
                let mut buf = vec![0u8; MAX_SYNC_BYTES];
                let n = unsafe {
                    libc::klogctl(
                        SYSLOG_ACTION_READ_CLEAR,
                        buf.as_mut_ptr().cast(),
                        buf.len() as libc::c_int,
                    )
                };
                if n < 0 {
                    debug!("syslog read failed, disabling kmsg source");
                    self.mode = KmsgMode::Disabled;
                    0
                } else {
                    push_all(sinks, &buf[..n as usize]);
                    n as usize
                }
            }
            KmsgMode::Disabled => 0,
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn sync(&mut self, _sinks: &mut [Sink]) -> usize {
        0
    }
}

impl Default for KmsgSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Hands the child source's readiness future to the hub, used as the sole
/// suspension point of the monitor loop.
pub(crate) async fn pump_child(sources: &mut [Source], sinks: &mut [Sink]) -> usize {
    for source in sources.iter_mut() {
        if let Source::Child(child) = source {
            return child.pump(sinks).await;
        }
    }
    std::future::pending().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn buf_sink() -> Vec<Sink> {
        vec![Sink::Buf(crate::output::BufSink::new(Instant::now()))]
    }

    fn dumped(sinks: &mut [Sink]) -> String {
        match &mut sinks[0] {
            Sink::Buf(buf) => String::from_utf8(buf.dump()).unwrap(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn file_source_reads_only_new_data() {
        let dir = camino_tempfile::Utf8TempDir::new().unwrap();
        let path = dir.path().join("watched.log");
        std::fs::write(&path, "old\n").unwrap();

        let mut source = FileSource::new(path.clone());
        let mut sinks = buf_sink();

        assert_eq!(source.sync(&mut sinks), 0);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"new\n").unwrap();
        assert_eq!(source.sync(&mut sinks), 4);
        assert_eq!(dumped(&mut sinks), "| [ 0:00] new\n");
    }

    #[test]
    fn file_source_waits_for_missing_file() {
        let dir = camino_tempfile::Utf8TempDir::new().unwrap();
        let path = dir.path().join("late.log");

        let mut source = FileSource::new(path.clone());
        let mut sinks = buf_sink();
        assert_eq!(source.sync(&mut sinks), 0);
        assert!(!source.dead);

        // The watcher opens the file when it appears and seeks to its end,
        // so only data written after that is captured.
        std::fs::write(&path, "born\n").unwrap();
        let n = source.sync(&mut sinks);
        assert_eq!(n, 0);
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"later\n")
            .unwrap();
        assert_eq!(source.sync(&mut sinks), 6);
    }

    #[tokio::test]
    async fn child_source_drains_socket() {
        let (ours, theirs) = crate::runner::unix::socketpair_stream().unwrap();
        crate::runner::unix::set_nonblocking(&ours).unwrap();

        let mut source = ChildSource::new(ours).unwrap();
        let mut sinks = buf_sink();

        let n = unsafe {
            libc::write(
                theirs.as_raw_fd(),
                b"hi there\n".as_ptr().cast(),
                9,
            )
        };
        assert_eq!(n, 9);

        assert_eq!(source.pump(&mut sinks).await, 9);
        drop(theirs);
        assert_eq!(source.pump(&mut sinks).await, 0);
        assert!(source.is_closed());
        assert_eq!(dumped(&mut sinks), "| [ 0:00] hi there\n");
    }
}
