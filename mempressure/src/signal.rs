use std::{
    fmt::{Display, Formatter},
    io, mem,
    os::unix::process::ExitStatusExt,
    process::ExitStatus,
    ptr,
};

use libc::c_int;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Signal {
    TogglePause,
    Terminate,
}

impl From<Signal> for c_int {
    fn from(signal: Signal) -> c_int {
        match signal {
            Signal::TogglePause => libc::SIGUSR1,
            Signal::Terminate => libc::SIGTERM,
        }
    }
}

impl Display for Signal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::TogglePause => write!(f, "toggle-pause(SIGUSR1)"),
            Signal::Terminate => write!(f, "terminate(SIGTERM)"),
        }
    }
}

pub(crate) enum Forked {
    Parent(i32),
    Child,
}

pub(crate) fn fork() -> Result<Forked, io::Error> {
    let rst = unsafe { libc::fork() };
    match rst {
        0 => Ok(Forked::Child),
        pid @ 1.. => Ok(Forked::Parent(pid)),
        _ => Err(io::Error::last_os_error()),
    }
}

pub(crate) fn kill(pid: i32, signal: Signal) -> Result<(), io::Error> {
    if unsafe { libc::kill(pid, signal.into()) } != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub(crate) fn waitpid(pid: i32) -> Result<ExitStatus, io::Error> {
    let mut status: c_int = 0;
    loop {
        let rst = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rst == pid {
            return Ok(ExitStatus::from_raw(status));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

pub(crate) fn install_handler(signal: Signal, handler: extern "C" fn(c_int)) -> Result<(), io::Error> {
    unsafe {
        let mut action = mem::zeroed::<libc::sigaction>();
        action.sa_sigaction = handler as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signal.into(), &action, ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Suspends the calling process for as long as `condition` holds.
///
/// The signal is blocked while the condition is evaluated and unblocked atomically by sigsuspend,
/// so a delivery between the check and the suspension still wakes the process.
pub(crate) fn suspend_while(signal: Signal, condition: impl Fn() -> bool) -> Result<(), io::Error> {
    unsafe {
        let mut blocked = mem::zeroed::<libc::sigset_t>();
        let mut previous = mem::zeroed::<libc::sigset_t>();
        libc::sigemptyset(&mut blocked);
        libc::sigaddset(&mut blocked, signal.into());
        if libc::sigprocmask(libc::SIG_BLOCK, &blocked, &mut previous) != 0 {
            return Err(io::Error::last_os_error());
        }
        while condition() {
            // always returns -1 with EINTR after a handler ran
            libc::sigsuspend(&previous);
        }
        if libc::sigprocmask(libc::SIG_SETMASK, &previous, ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Writes the whole buffer with write(2). Safe to call from a signal handler.
pub(crate) fn write_raw(fd: c_int, buf: &[u8]) {
    let mut written = 0;
    while written < buf.len() {
        let rst = unsafe { libc::write(fd, buf[written..].as_ptr().cast(), buf.len() - written) };
        if rst <= 0 {
            return;
        }
        written += rst as usize;
    }
}
