use std::{io, mem, os::fd::RawFd, time::Duration};

use tracing::warn;

use crate::controller::{Key, Keys};

/// Terminal switched to non-canonical mode without echo.
/// Original attributes are restored when dropped.
pub(crate) struct RawMode {
    fd: RawFd,
    original: libc::termios,
}

impl RawMode {
    /// Returns None if fd is not a terminal, input is then consumed as is.
    pub(crate) fn enable(fd: RawFd) -> Result<Option<Self>, io::Error> {
        if unsafe { libc::isatty(fd) } != 1 {
            return Ok(None);
        }
        let mut original = unsafe { mem::zeroed::<libc::termios>() };
        if unsafe { libc::tcgetattr(fd, &mut original) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let mut raw = original;
        raw.c_lflag &= !(libc::ICANON | libc::ECHO);
        if unsafe { libc::tcsetattr(fd, libc::TCSAFLUSH, &raw) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Some(RawMode { fd, original }))
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if unsafe { libc::tcsetattr(self.fd, libc::TCSAFLUSH, &self.original) } != 0 {
            warn!("restore terminal mode: {}", io::Error::last_os_error());
        }
    }
}

/// Single bytes from a file descriptor, waiting at most the poll interval for each.
pub(crate) struct FdKeys {
    fd: RawFd,
}

impl FdKeys {
    pub(crate) fn new(fd: RawFd) -> Self {
        FdKeys { fd }
    }
}

impl Keys for FdKeys {
    fn next_key(&mut self, timeout: Duration) -> Result<Key, io::Error> {
        let mut pollfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        match unsafe { libc::poll(&mut pollfd, 1, timeout) } {
            0 => return Ok(Key::Idle),
            rst if rst < 0 => {
                let err = io::Error::last_os_error();
                return match err.kind() {
                    io::ErrorKind::Interrupted => Ok(Key::Idle),
                    _ => Err(err),
                };
            }
            _ => {}
        }
        let mut byte = 0u8;
        match unsafe { libc::read(self.fd, (&mut byte as *mut u8).cast(), 1) } {
            0 => Ok(Key::Closed),
            1 => Ok(Key::Byte(byte)),
            _ => {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => Ok(Key::Idle),
                    _ => Err(err),
                }
            }
        }
    }
}
