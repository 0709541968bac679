//! Self-pipe shutdown notifier (§4.9), grounded on `SignalHandler.cpp`'s
//! `install`/`onSignal`/`drain` split: a `pipe()` whose write end is written
//! to, one byte at a time, by a signal handler that does nothing else
//! (no allocation, no logging, no locking — the only things safe to do in
//! signal context). The event loop registers the read end with `mio` and
//! treats any readable byte as "shut down".

use std::io::{self, ErrorKind, Read};
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};

static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_signal(_signo: libc::c_int) {
    let fd = WRITE_FD.load(Ordering::Relaxed);
    if fd != -1 {
        let byte: u8 = 1;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// Installs `SIGINT`/`SIGTERM` handlers that signal shutdown through a
/// self-pipe, and sets `SIGPIPE` to `SIG_IGN` so writes to a reset peer
/// surface as ordinary `EPIPE` instead of killing the process.
pub struct ShutdownNotifier {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl ShutdownNotifier {
    pub fn install() -> io::Result<ShutdownNotifier> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);
        set_nonblocking(read_fd)?;
        set_nonblocking(write_fd)?;

        WRITE_FD.store(write_fd, Ordering::Relaxed);

        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = on_signal as usize;
            libc::sigemptyset(&mut sa.sa_mask);
            sa.sa_flags = 0;
            libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
            libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());

            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }

        Ok(ShutdownNotifier { read_fd, write_fd })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    pub fn register(&self, registry: &Registry, token: Token) -> io::Result<()> {
        let fd = self.read_fd;
        registry.register(&mut SourceFd(&fd), token, Interest::READABLE)
    }

    /// Drains every pending byte off the pipe. Call once per readable
    /// notification; a signal can fire many times before the loop notices.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        let mut file = unsafe { std::fs::File::from_raw_fd(self.read_fd) };
        loop {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        // Don't let the temporary File's Drop close our fd.
        std::mem::forget(file);
    }
}

impl Drop for ShutdownNotifier {
    fn drop(&mut self) {
        WRITE_FD.store(-1, Ordering::Relaxed);
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_opens_distinct_nonblocking_fds() {
        let notifier = ShutdownNotifier::install().expect("install");
        assert_ne!(notifier.read_fd(), -1);
        assert_ne!(notifier.read_fd(), notifier.write_fd);
    }

    #[test]
    fn drain_is_a_no_op_with_nothing_pending() {
        let notifier = ShutdownNotifier::install().expect("install");
        notifier.drain();
    }
}
