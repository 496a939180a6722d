//! Pseudo-terminal allocation for session channels.
//!
//! Uses the `nix` crate to open the pty pair and `libc` ioctls for the
//! controlling terminal and window size.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;

use nix::pty::{openpty, Winsize};
use tokio::process::Command;
use tracing::debug;

/// Terminal dimensions as carried by `pty-req` and `window-change`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowSize {
    pub cols: u32,
    pub rows: u32,
    pub pix_width: u32,
    pub pix_height: u32,
}

impl WindowSize {
    fn to_winsize(self) -> Winsize {
        let clamp = |v: u32| v.min(u16::MAX as u32) as u16;
        Winsize {
            ws_row: clamp(self.rows),
            ws_col: clamp(self.cols),
            ws_xpixel: clamp(self.pix_width),
            ws_ypixel: clamp(self.pix_height),
        }
    }
}

/// An allocated pty pair. The slave end is handed to the child at spawn.
#[derive(Debug)]
pub struct Pty {
    master: OwnedFd,
    slave: Option<OwnedFd>,
    term: String,
    size: WindowSize,
}

impl Pty {
    pub fn open(term: &str, size: WindowSize) -> io::Result<Self> {
        let winsize = size.to_winsize();
        let pair = openpty(&winsize, None).map_err(io::Error::from)?;

        debug!(
            "Allocated pty {}x{} term={}",
            size.cols, size.rows, term
        );

        Ok(Self {
            master: pair.master,
            slave: Some(pair.slave),
            term: term.to_string(),
            size,
        })
    }

    pub fn term(&self) -> &str {
        &self.term
    }

    pub fn size(&self) -> WindowSize {
        self.size
    }

    /// Apply new dimensions. The kernel signals the foreground process group.
    pub fn resize(&mut self, size: WindowSize) -> io::Result<()> {
        let winsize = size.to_winsize();
        let rc = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &winsize) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        self.size = size;
        Ok(())
    }

    /// Wire the slave end to the command's standard streams and make it the
    /// controlling terminal of a new session.
    pub fn attach(&self, command: &mut Command) -> io::Result<()> {
        let slave = self
            .slave
            .as_ref()
            .ok_or_else(|| io::Error::other("pty slave already released"))?;

        command
            .stdin(Stdio::from(slave.try_clone()?))
            .stdout(Stdio::from(slave.try_clone()?))
            .stderr(Stdio::from(slave.try_clone()?));

        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        Ok(())
    }

    /// Drop our copy of the slave so reads see EOF once the child exits.
    pub fn release_slave(&mut self) {
        self.slave = None;
    }

    /// Async handle on the master for reading terminal output.
    pub fn reader(&self) -> io::Result<tokio::fs::File> {
        self.master_file()
    }

    /// Async handle on the master for writing terminal input.
    pub fn writer(&self) -> io::Result<tokio::fs::File> {
        self.master_file()
    }

    fn master_file(&self) -> io::Result<tokio::fs::File> {
        let fd = self.master.try_clone()?;
        Ok(tokio::fs::File::from_std(std::fs::File::from(fd)))
    }
}

/// Whether a read error from the master means the terminal hung up.
pub fn is_hangup(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EIO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_resize() {
        let mut pty = Pty::open(
            "xterm",
            WindowSize {
                cols: 80,
                rows: 24,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(pty.term(), "xterm");
        assert_eq!(pty.size().cols, 80);

        let bigger = WindowSize {
            cols: 132,
            rows: 50,
            ..Default::default()
        };
        pty.resize(bigger).unwrap();
        assert_eq!(pty.size(), bigger);

        let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::ioctl(pty.master.as_raw_fd(), libc::TIOCGWINSZ, &mut ws) };
        assert_eq!(rc, 0);
        assert_eq!((ws.ws_col, ws.ws_row), (132, 50));
    }

    #[test]
    fn test_oversized_dimensions_clamp() {
        let ws = WindowSize {
            cols: 100_000,
            rows: 10,
            ..Default::default()
        }
        .to_winsize();
        assert_eq!(ws.ws_col, u16::MAX);
        assert_eq!(ws.ws_row, 10);
    }

    #[test]
    fn test_attach_after_release_fails() {
        let mut pty = Pty::open("xterm", WindowSize::default()).unwrap();
        pty.release_slave();
        let mut command = Command::new("/bin/true");
        assert!(pty.attach(&mut command).is_err());
    }
}
