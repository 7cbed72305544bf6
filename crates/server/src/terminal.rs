//! Terminal reclaim watcher.
//!
//! While the remote driver owns the assistant, any keypress on the local
//! terminal hands control back. Stdin is polled on a blocking thread with a
//! short timeout so cancellation is noticed promptly and the thread is gone
//! before the next driver touches the terminal.

use tokio_util::sync::CancellationToken;
use tracing::debug;

#[cfg(unix)]
const POLL_INTERVAL_MS: i32 = 50;

/// Resolves `true` on a keypress, `false` once `cancel` fires.
/// Never fires for a non-interactive stdin.
pub async fn wait_for_keypress(cancel: CancellationToken) -> bool {
    #[cfg(unix)]
    {
        if unsafe { libc::isatty(libc::STDIN_FILENO) } != 1 {
            cancel.cancelled().await;
            return false;
        }
        watch_fd(libc::STDIN_FILENO, cancel, true).await
    }
    #[cfg(not(unix))]
    {
        cancel.cancelled().await;
        false
    }
}

#[cfg(unix)]
async fn watch_fd(fd: libc::c_int, cancel: CancellationToken, raw: bool) -> bool {
    let pressed = tokio::task::spawn_blocking(move || {
        let _mode = if raw { RawInput::enable(fd) } else { None };
        while !cancel.is_cancelled() {
            if poll_readable(fd, POLL_INTERVAL_MS) {
                drain(fd);
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    if pressed {
        debug!(
            component = "terminal",
            event = "terminal.reclaimed",
            "Local keypress reclaimed the terminal"
        );
    }
    pressed
}

#[cfg(unix)]
fn poll_readable(fd: libc::c_int, timeout_ms: i32) -> bool {
    let mut fds = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let result = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
    result > 0 && (fds.revents & libc::POLLIN) != 0
}

#[cfg(unix)]
fn drain(fd: libc::c_int) {
    let mut buffer = [0u8; 256];
    loop {
        let read_len = unsafe { libc::read(fd, buffer.as_mut_ptr() as *mut _, buffer.len()) };
        if read_len <= 0 || (read_len as usize) < buffer.len() || !poll_readable(fd, 0) {
            break;
        }
    }
}

/// Non-canonical, no-echo input for the lifetime of the guard, so a single
/// key is readable without Enter.
#[cfg(unix)]
struct RawInput {
    fd: libc::c_int,
    original: libc::termios,
}

#[cfg(unix)]
impl RawInput {
    fn enable(fd: libc::c_int) -> Option<Self> {
        let mut termios = unsafe { std::mem::zeroed::<libc::termios>() };
        if unsafe { libc::tcgetattr(fd, &mut termios) } != 0 {
            return None;
        }
        let original = termios;
        termios.c_lflag &= !(libc::ICANON | libc::ECHO);
        termios.c_cc[libc::VMIN] = 1;
        termios.c_cc[libc::VTIME] = 0;
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &termios) } != 0 {
            return None;
        }
        Some(Self { fd, original })
    }
}

#[cfg(unix)]
impl Drop for RawInput {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSANOW, &self.original);
        }
    }
}
