//! Byte transports for D-Bus connections.
//!
//! A [`Transport`] is a duplex stream over AF_UNIX or TCP. Unix transports
//! carry SCM_RIGHTS ancillary data: fds received alongside message bytes are
//! queued on the reader and handed to the frame they arrived with, and fds
//! attached to an outgoing message ride with its first sendmsg.
//!
//! After authentication the transport splits into a reader and a writer so
//! the receive pump and senders can share one socket.

use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, Shutdown,
};
use tokio::io::{AsyncRead, AsyncWrite, Interest, ReadBuf};
use tokio::net::{TcpStream, UnixStream};

use crate::address::{launchd_socket_path, Endpoint};
use crate::error::Result;

/// Maximum number of fds accepted in one message, matching the reference
/// implementation.
pub const MAX_UNIX_FDS: usize = 16;

#[derive(Debug)]
enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    fn raw_fd(&self) -> RawFd {
        match self {
            Stream::Unix(s) => s.as_raw_fd(),
            Stream::Tcp(s) => s.as_raw_fd(),
        }
    }
}

/// A connected, not yet split, transport. Implements `AsyncRead` and
/// `AsyncWrite` for the SASL phase, which exchanges plain lines.
#[derive(Debug)]
pub struct Transport {
    stream: Stream,
}

impl Transport {
    /// Connect to an endpoint resolved from a bus address.
    pub async fn connect(endpoint: &Endpoint) -> Result<Transport> {
        let stream = match endpoint {
            Endpoint::UnixPath(path) => Stream::Unix(UnixStream::connect(path).await?),
            Endpoint::UnixAbstract(name) => {
                use std::os::linux::net::SocketAddrExt;
                let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
                let std_stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
                std_stream.set_nonblocking(true)?;
                Stream::Unix(UnixStream::from_std(std_stream)?)
            }
            Endpoint::Tcp { host, port } => {
                Stream::Tcp(TcpStream::connect((host.as_str(), *port)).await?)
            }
            Endpoint::Launchd { env } => {
                let path = launchd_socket_path(env).await?;
                Stream::Unix(UnixStream::connect(path).await?)
            }
        };
        Ok(Transport { stream })
    }

    /// Wrap an already connected unix stream, e.g. from a socketpair.
    pub fn from_unix_stream(stream: UnixStream) -> Transport {
        Transport {
            stream: Stream::Unix(stream),
        }
    }

    /// Whether this transport kind can carry unix fds at all. Actual use
    /// additionally requires the NEGOTIATE_UNIX_FD agreement.
    pub fn supports_fds(&self) -> bool {
        matches!(self.stream, Stream::Unix(_))
    }

    /// Split into the reader and writer halves that share the socket.
    pub fn split(self) -> (TransportReader, TransportWriter) {
        let stream = Arc::new(self.stream);
        (
            TransportReader {
                stream: Arc::clone(&stream),
                fds: VecDeque::new(),
            },
            TransportWriter { stream },
        )
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().stream {
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// The receive half. Owned by the bus reader task.
#[derive(Debug)]
pub struct TransportReader {
    stream: Arc<Stream>,
    fds: VecDeque<Arc<OwnedFd>>,
}

impl TransportReader {
    /// Take every fd received so far. Called once a complete frame has been
    /// read; fds arrive with the bytes of the message that carries them.
    pub fn take_fds(&mut self) -> Vec<Arc<OwnedFd>> {
        self.fds.drain(..).collect()
    }
}

fn map_errno(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn recv_with_fds(
    fd: RawFd,
    buf: &mut [u8],
    fds: &mut VecDeque<Arc<OwnedFd>>,
) -> io::Result<usize> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_UNIX_FDS]);
    let msg = recvmsg::<()>(
        fd,
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )
    .map_err(map_errno)?;
    for cmsg in msg.cmsgs().map_err(map_errno)? {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            for raw in received {
                // SAFETY: the kernel just handed us this descriptor and
                // nothing else refers to it.
                fds.push_back(Arc::new(unsafe { OwnedFd::from_raw_fd(raw) }));
            }
        }
    }
    Ok(msg.bytes)
}

impl AsyncRead for TransportReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            let result = match &*this.stream {
                Stream::Unix(s) => {
                    ready!(s.poll_read_ready(cx))?;
                    s.try_io(Interest::READABLE, || {
                        recv_with_fds(s.as_raw_fd(), buf.initialize_unfilled(), &mut this.fds)
                    })
                }
                Stream::Tcp(s) => {
                    ready!(s.poll_read_ready(cx))?;
                    s.try_read(buf.initialize_unfilled())
                }
            };
            match result {
                Ok(n) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
    }
}

/// The send half. Shared by everything that writes messages; callers
/// serialize access through the bus write lock.
#[derive(Debug, Clone)]
pub struct TransportWriter {
    stream: Arc<Stream>,
}

impl TransportWriter {
    /// Write a full serialized message, attaching `fds` to the first chunk.
    /// The kernel duplicates the descriptors into the socket, so the
    /// caller's fds are untouched.
    pub async fn write_all(&self, bytes: &[u8], fds: &[Arc<OwnedFd>]) -> io::Result<()> {
        match &*self.stream {
            Stream::Unix(s) => {
                let raw: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
                let mut offset = 0;
                let mut fds_sent = raw.is_empty();
                while offset < bytes.len() {
                    s.writable().await?;
                    let result = s.try_io(Interest::WRITABLE, || {
                        let iov = [IoSlice::new(&bytes[offset..])];
                        let scm = [ControlMessage::ScmRights(&raw)];
                        let cmsgs: &[ControlMessage] = if fds_sent { &[] } else { &scm };
                        sendmsg::<()>(s.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None)
                            .map_err(map_errno)
                    });
                    match result {
                        Ok(n) => {
                            offset += n;
                            fds_sent = true;
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
            Stream::Tcp(s) => {
                let mut offset = 0;
                while offset < bytes.len() {
                    s.writable().await?;
                    match s.try_write(&bytes[offset..]) {
                        Ok(n) => offset += n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
        }
    }

    /// Shut the socket down in both directions. The reader observes EOF on
    /// its next read.
    pub fn shutdown(&self) {
        let _ = nix::sys::socket::shutdown(self.stream.raw_fd(), Shutdown::Both);
    }
}
