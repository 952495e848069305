//! Self-pipe relay turning process signals into readable bytes.
//!
//! A handler installed with `sigaction` performs a single non-blocking
//! `write(2)` of a one-byte code into a pipe. The master event loop owns the
//! read end and decodes the byte back into a [`Signal`] on its own thread.
//! The handler never allocates, logs or locks.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tracing::{debug, warn};

/// Write end of the installed channel, or -1 when none is installed.
static RELAY_FD: AtomicI32 = AtomicI32::new(-1);

/// Signals handled by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// A child process exited.
    Child,
    Interrupt,
    Quit,
    Terminate,
}

impl Signal {
    pub const ALL: [Signal; 4] = [
        Signal::Child,
        Signal::Interrupt,
        Signal::Quit,
        Signal::Terminate,
    ];

    /// Byte written into the pipe for this signal.
    pub fn code(self) -> u8 {
        match self {
            Signal::Child => b'C',
            Signal::Interrupt => b'I',
            Signal::Quit => b'Q',
            Signal::Terminate => b'T',
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            b'C' => Some(Signal::Child),
            b'I' => Some(Signal::Interrupt),
            b'Q' => Some(Signal::Quit),
            b'T' => Some(Signal::Terminate),
            _ => None,
        }
    }

    /// The OS signal number.
    pub fn raw(self) -> libc::c_int {
        match self {
            Signal::Child => libc::SIGCHLD,
            Signal::Interrupt => libc::SIGINT,
            Signal::Quit => libc::SIGQUIT,
            Signal::Terminate => libc::SIGTERM,
        }
    }

    /// Whether this signal starts a graceful shutdown.
    pub fn is_shutdown(self) -> bool {
        !matches!(self, Signal::Child)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Signal::Child => "SIGCHLD",
            Signal::Interrupt => "SIGINT",
            Signal::Quit => "SIGQUIT",
            Signal::Terminate => "SIGTERM",
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while setting up the signal channel.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("Signal pipe error: {0}")]
    Io(#[from] io::Error),

    #[error("Signal handlers are already installed for another channel")]
    AlreadyInstalled,
}

#[cfg(target_os = "linux")]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__errno_location()
}

#[cfg(not(target_os = "linux"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__error()
}

extern "C" fn relay(signum: libc::c_int) {
    let fd = RELAY_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    let code: u8 = match signum {
        libc::SIGCHLD => b'C',
        libc::SIGINT => b'I',
        libc::SIGQUIT => b'Q',
        libc::SIGTERM => b'T',
        _ => return,
    };
    // Safety: only async-signal-safe calls; errno is restored so the
    // interrupted code does not observe a spurious EAGAIN.
    unsafe {
        let errno = errno_location();
        let saved = *errno;
        libc::write(fd, &code as *const u8 as *const libc::c_void, 1);
        *errno = saved;
    }
}

fn set_flags(fd: RawFd) -> io::Result<()> {
    // Safety: fd is an open descriptor owned by the caller.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd_flags = libc::fcntl(fd, libc::F_GETFD);
        if fd_flags < 0 || libc::fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn set_action(signal: libc::c_int, handler: libc::sighandler_t) -> io::Result<()> {
    // Safety: the sigaction struct is zero-initialised and fully populated
    // before use; `relay` only performs async-signal-safe operations.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler;
        action.sa_flags = libc::SA_RESTART;
        if signal == libc::SIGCHLD {
            action.sa_flags |= libc::SA_NOCLDSTOP;
        }
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Read end of the self-pipe plus ownership of the installed handlers.
///
/// Must be created inside a tokio runtime.
pub struct SignalChannel {
    receiver: pipe::Receiver,
    writer: Arc<File>,
    installed: bool,
}

impl SignalChannel {
    /// Creates the pipe. No handlers are installed yet.
    pub fn new() -> Result<Self, SignalError> {
        let mut fds = [0 as libc::c_int; 2];
        // Safety: fds is a valid two-element buffer.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        // Safety: pipe(2) returned two freshly opened descriptors we now own.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        set_flags(read.as_raw_fd())?;
        set_flags(write.as_raw_fd())?;

        let receiver = pipe::Receiver::from_file(File::from(read))?;
        Ok(Self {
            receiver,
            writer: Arc::new(File::from(write)),
            installed: false,
        })
    }

    /// Installs the relay handler for every [`Signal`].
    ///
    /// Only one channel per process may be installed at a time.
    pub fn install(&mut self) -> Result<(), SignalError> {
        if self.installed {
            return Ok(());
        }
        let fd = self.writer.as_raw_fd();
        RELAY_FD
            .compare_exchange(-1, fd, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| SignalError::AlreadyInstalled)?;
        self.installed = true;

        for signal in Signal::ALL {
            set_action(signal.raw(), relay as libc::sighandler_t)?;
        }
        debug!("Signal handlers installed");
        Ok(())
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// Restores default dispositions for the shutdown signals so a second
    /// interrupt terminates the process immediately.
    ///
    /// The child-exit relay stays in place while the channel lives.
    pub fn reset(&mut self) -> Result<(), SignalError> {
        if !self.installed {
            return Ok(());
        }
        for signal in Signal::ALL.into_iter().filter(|s| s.is_shutdown()) {
            set_action(signal.raw(), libc::SIG_DFL)?;
        }
        debug!("Shutdown signals restored to default");
        Ok(())
    }

    /// Waits for the next signal byte.
    ///
    /// Unknown bytes are skipped.
    pub async fn recv(&mut self) -> io::Result<Signal> {
        loop {
            let code = self.receiver.read_u8().await?;
            match Signal::from_code(code) {
                Some(signal) => return Ok(signal),
                None => warn!(code, "Ignoring unknown signal code"),
            }
        }
    }

    /// A handle that can inject signal codes from normal code.
    pub fn notifier(&self) -> SignalNotifier {
        SignalNotifier {
            writer: self.writer.clone(),
        }
    }
}

impl Drop for SignalChannel {
    fn drop(&mut self) {
        if self.installed {
            let _ = RELAY_FD.compare_exchange(
                self.writer.as_raw_fd(),
                -1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    }
}

/// Writes signal codes into a [`SignalChannel`] from ordinary code.
#[derive(Clone)]
pub struct SignalNotifier {
    writer: Arc<File>,
}

impl SignalNotifier {
    /// Queues `signal` for the event loop. A full pipe already guarantees a
    /// pending wakeup, so `WouldBlock` counts as delivered.
    pub fn notify(&self, signal: Signal) -> io::Result<()> {
        match (&*self.writer).write(&[signal.code()]) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for SignalNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalNotifier")
            .field("fd", &self.writer.as_raw_fd())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_codes_round_trip() {
        for signal in Signal::ALL {
            assert_eq!(Signal::from_code(signal.code()), Some(signal));
        }
        assert_eq!(Signal::from_code(b'x'), None);
    }

    #[test]
    fn test_shutdown_classification() {
        assert!(!Signal::Child.is_shutdown());
        assert!(Signal::Interrupt.is_shutdown());
        assert!(Signal::Quit.is_shutdown());
        assert!(Signal::Terminate.is_shutdown());
        assert_eq!(Signal::Terminate.to_string(), "SIGTERM");
    }

    #[tokio::test]
    async fn test_notifier_delivers_in_order() {
        let mut channel = SignalChannel::new().unwrap();
        let notifier = channel.notifier();

        notifier.notify(Signal::Child).unwrap();
        notifier.notify(Signal::Interrupt).unwrap();

        assert_eq!(channel.recv().await.unwrap(), Signal::Child);
        assert_eq!(channel.recv().await.unwrap(), Signal::Interrupt);
    }

    #[tokio::test]
    async fn test_recv_waits_for_a_signal() {
        let mut channel = SignalChannel::new().unwrap();
        let result = tokio::time::timeout(Duration::from_millis(50), channel.recv()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_installed_handler_relays_sigchld() {
        let mut channel = SignalChannel::new().unwrap();
        channel.install().unwrap();
        assert!(channel.is_installed());

        let mut second = SignalChannel::new().unwrap();
        assert!(matches!(second.install(), Err(SignalError::AlreadyInstalled)));

        // Safety: raising SIGCHLD in-process only triggers the relay.
        unsafe {
            libc::raise(libc::SIGCHLD);
        }
        let signal = tokio::time::timeout(Duration::from_secs(5), channel.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal, Signal::Child);

        channel.reset().unwrap();
        drop(channel);
        assert_eq!(RELAY_FD.load(Ordering::SeqCst), -1);
    }
}
