//! Transport descriptors handed to the server already open.
//!
//! The connection is a duplex stream socket; the passthrough sink is any
//! writable descriptor (usually stdout).

use anyhow::{Context, Result};
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use tokio::io::AsyncWrite;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

/// Fail early on a descriptor that is not open.
fn check_fd(fd: RawFd) -> io::Result<()> {
    // SAFETY: F_GETFD only inspects descriptor flags.
    let ret = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Take ownership of an inherited descriptor.
fn adopt(fd: RawFd) -> Result<OwnedFd> {
    if fd < 0 {
        anyhow::bail!("Invalid descriptor {}", fd);
    }
    check_fd(fd).with_context(|| format!("Descriptor {} is not open", fd))?;
    // SAFETY: the descriptor is open and ownership is transferred to us by
    // the process that spawned the server; nothing else in this process uses it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Both directions of the peer connection.
pub struct Connection {
    pub reader: OwnedReadHalf,
    pub writer: OwnedWriteHalf,
}

impl Connection {
    /// Wrap an open stream socket. Must be called inside a tokio runtime.
    pub fn from_fd(fd: RawFd) -> Result<Self> {
        let socket = std::os::unix::net::UnixStream::from(adopt(fd)?);
        socket
            .set_nonblocking(true)
            .context("Failed to make connection non-blocking")?;
        let stream = tokio::net::UnixStream::from_std(socket)
            .context("Failed to register connection with the runtime")?;
        let (reader, writer) = stream.into_split();
        Ok(Self { reader, writer })
    }
}

/// Where passthrough bytes go.
pub enum Passthrough {
    Stdout(tokio::io::Stdout),
    Stderr(tokio::io::Stderr),
    File(tokio::fs::File),
}

impl Passthrough {
    pub fn from_fd(fd: RawFd) -> Result<Self> {
        Ok(match fd {
            1 => Self::Stdout(tokio::io::stdout()),
            2 => Self::Stderr(tokio::io::stderr()),
            _ => Self::File(tokio::fs::File::from_std(std::fs::File::from(adopt(fd)?))),
        })
    }
}

impl AsyncWrite for Passthrough {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Stdout(w) => Pin::new(w).poll_write(cx, buf),
            Self::Stderr(w) => Pin::new(w).poll_write(cx, buf),
            Self::File(w) => Pin::new(w).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Stdout(w) => Pin::new(w).poll_flush(cx),
            Self::Stderr(w) => Pin::new(w).poll_flush(cx),
            Self::File(w) => Pin::new(w).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Stdout(w) => Pin::new(w).poll_shutdown(cx),
            Self::Stderr(w) => Pin::new(w).poll_shutdown(cx),
            Self::File(w) => Pin::new(w).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_closed_descriptor_rejected() {
        assert!(adopt(-1).is_err());
        let file = tempfile::tempfile().unwrap();
        let fd = file.into_raw_fd();
        // SAFETY: fd came from into_raw_fd above and is closed exactly once.
        unsafe { libc::close(fd) };
        assert!(adopt(fd).is_err());
    }

    #[tokio::test]
    async fn test_connection_from_socketpair() {
        let (ours, theirs) = std::os::unix::net::UnixStream::pair().unwrap();
        let mut conn = Connection::from_fd(theirs.into_raw_fd()).unwrap();

        ours.set_nonblocking(true).unwrap();
        let mut ours = tokio::net::UnixStream::from_std(ours).unwrap();
        ours.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        conn.writer.write_all(b"pong").await.unwrap();
        ours.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_passthrough_to_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let fd = std::fs::OpenOptions::new()
            .write(true)
            .open(tmp.path())
            .unwrap()
            .into_raw_fd();
        let mut sink = Passthrough::from_fd(fd).unwrap();
        sink.write_all(b"forwarded").await.unwrap();
        sink.flush().await.unwrap();
        drop(sink);
        assert_eq!(std::fs::read(tmp.path()).unwrap(), b"forwarded");
    }
}
