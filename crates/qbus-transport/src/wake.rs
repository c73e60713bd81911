use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tracing::trace;

/// Control signal delivered through the wake pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeSignal {
    /// The handle list changed; re-snapshot the pollable set.
    Refresh,
    /// Exit the worker loop.
    Terminate,
}

const BYTE_REFRESH: u8 = b'r';
const BYTE_TERMINATE: u8 = b't';

/// A loopback pipe used to interrupt the worker's blocking poll from
/// another thread.
///
/// Both ends are non-blocking: a full pipe drops extra refresh bytes,
/// which is harmless because refresh signals coalesce. Draining reads
/// everything pending; a terminate byte anywhere in the drain wins.
pub struct WakePipe {
    read_end: OwnedFd,
    write_end: OwnedFd,
}

impl WakePipe {
    pub fn new() -> std::io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` is a valid writable array of two ints.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        // SAFETY: both fds were just returned by pipe(2) and are owned here.
        let (read_end, write_end) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        set_nonblocking(read_end.as_raw_fd())?;
        set_nonblocking(write_end.as_raw_fd())?;

        Ok(Self {
            read_end,
            write_end,
        })
    }

    /// The fd the worker includes in its poll set.
    pub fn poll_fd(&self) -> RawFd {
        self.read_end.as_raw_fd()
    }

    /// Write one control byte. Safe to call from any thread.
    pub fn signal(&self, signal: WakeSignal) -> std::io::Result<()> {
        let byte = match signal {
            WakeSignal::Refresh => BYTE_REFRESH,
            WakeSignal::Terminate => BYTE_TERMINATE,
        };
        trace!(?signal, "wake");
        // SAFETY: writing one byte from a valid stack buffer to an owned fd.
        let rc = unsafe {
            libc::write(
                self.write_end.as_raw_fd(),
                std::ptr::addr_of!(byte).cast(),
                1,
            )
        };
        if rc == 1 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            // Pipe full: previous signals have not been drained yet, so the
            // worker is already going to wake. Terminate must not be lost
            // though, and a full pipe of pending bytes guarantees a drain
            // is coming; retry on the next drain is not possible here, so
            // report success only for refresh.
            if signal == WakeSignal::Refresh {
                return Ok(());
            }
        }
        Err(err)
    }

    /// Drain every pending control byte and fold them into one signal.
    /// Returns `None` if nothing was pending.
    pub fn drain(&self) -> Option<WakeSignal> {
        let mut buf = [0u8; 64];
        let mut seen = None;
        loop {
            // SAFETY: reading into a valid stack buffer from an owned fd.
            let rc = unsafe {
                libc::read(
                    self.read_end.as_raw_fd(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                )
            };
            if rc <= 0 {
                return seen;
            }
            for &byte in &buf[..rc as usize] {
                if byte == BYTE_TERMINATE {
                    return Some(WakeSignal::Terminate);
                }
                seen = Some(WakeSignal::Refresh);
            }
        }
    }
}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    // SAFETY: fd is an open descriptor owned by the caller.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: same fd, setting flags read above plus O_NONBLOCK.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_empty_pipe_returns_none() {
        let pipe = WakePipe::new().unwrap();
        assert_eq!(pipe.drain(), None);
    }

    #[test]
    fn refresh_signal_roundtrip() {
        let pipe = WakePipe::new().unwrap();
        pipe.signal(WakeSignal::Refresh).unwrap();
        assert_eq!(pipe.drain(), Some(WakeSignal::Refresh));
        assert_eq!(pipe.drain(), None);
    }

    #[test]
    fn terminate_wins_over_refresh() {
        let pipe = WakePipe::new().unwrap();
        pipe.signal(WakeSignal::Refresh).unwrap();
        pipe.signal(WakeSignal::Terminate).unwrap();
        pipe.signal(WakeSignal::Refresh).unwrap();
        assert_eq!(pipe.drain(), Some(WakeSignal::Terminate));
    }

    #[test]
    fn coalesced_refreshes_drain_to_one_signal() {
        let pipe = WakePipe::new().unwrap();
        for _ in 0..16 {
            pipe.signal(WakeSignal::Refresh).unwrap();
        }
        assert_eq!(pipe.drain(), Some(WakeSignal::Refresh));
        assert_eq!(pipe.drain(), None);
    }

    #[test]
    fn poll_fd_reports_readable_after_signal() {
        let pipe = WakePipe::new().unwrap();
        pipe.signal(WakeSignal::Refresh).unwrap();

        let mut pfd = libc::pollfd {
            fd: pipe.poll_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: polling one valid pollfd.
        let rc = unsafe { libc::poll(&mut pfd, 1, 1000) };
        assert_eq!(rc, 1);
        assert_ne!(pfd.revents & libc::POLLIN, 0);
    }
}
