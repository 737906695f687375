use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Result, TransportError};
use crate::traits::{Connection, Side, SideGate};

/// A blocking stream socket that can be driven through a shared reference.
///
/// Implemented for `TcpStream` and, on Unix, `UnixStream`; both implement
/// `Read`/`Write` for `&Self`, which is what lets the read and write sides run
/// concurrently.
pub trait SocketStream: Send + Sync + 'static {
    fn read_some(&self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn write_some(&self, buf: &[u8]) -> std::io::Result<usize>;
    fn flush_stream(&self) -> std::io::Result<()>;
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()>;
    fn set_write_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()>;
    fn shutdown(&self, how: Shutdown) -> std::io::Result<()>;
    fn name(&self) -> &'static str;
}

macro_rules! impl_socket_stream {
    ($ty:ty, $name:literal) => {
        impl SocketStream for $ty {
            fn read_some(&self, buf: &mut [u8]) -> std::io::Result<usize> {
                (&*self).read(buf)
            }

            fn write_some(&self, buf: &[u8]) -> std::io::Result<usize> {
                (&*self).write(buf)
            }

            fn flush_stream(&self) -> std::io::Result<()> {
                (&*self).flush()
            }

            fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
                <$ty>::set_read_timeout(self, timeout)
            }

            fn set_write_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
                <$ty>::set_write_timeout(self, timeout)
            }

            fn shutdown(&self, how: Shutdown) -> std::io::Result<()> {
                <$ty>::shutdown(self, how)
            }

            fn name(&self) -> &'static str {
                $name
            }
        }
    };
}

impl_socket_stream!(TcpStream, "tcp");
#[cfg(unix)]
impl_socket_stream!(std::os::unix::net::UnixStream, "unix-domain-socket");

/// [`Connection`] over a blocking stream socket.
///
/// Timeouts are applied per call through the socket's read/write timeout
/// options. `abort()` shuts the socket down in both directions, which wakes
/// any thread blocked in a read or write on it.
pub struct SocketConnection<S> {
    stream: S,
    read_side: SideGate,
    write_side: SideGate,
    aborted: AtomicBool,
}

impl<S: SocketStream> SocketConnection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_side: SideGate::new(Side::Read),
            write_side: SideGate::new(Side::Write),
            aborted: AtomicBool::new(false),
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Whether `abort()` has been called.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    fn check_aborted(&self) -> Result<()> {
        if self.is_aborted() {
            Err(TransportError::Aborted)
        } else {
            Ok(())
        }
    }

    fn map_io(&self, err: std::io::Error, timeout: Duration) -> TransportError {
        if self.is_aborted() {
            return TransportError::Aborted;
        }
        match err.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => TransportError::TimedOut(timeout),
            _ => TransportError::Io(err),
        }
    }

    fn write_all_by(&self, buf: &[u8], deadline: Instant, timeout: Duration) -> Result<()> {
        let mut offset = 0usize;
        while offset < buf.len() {
            let remaining = remaining_until(deadline).ok_or(TransportError::TimedOut(timeout))?;
            self.stream
                .set_write_timeout(Some(remaining))
                .map_err(TransportError::Io)?;
            match self.stream.write_some(&buf[offset..]) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(self.map_io(err, timeout)),
            }
        }
        Ok(())
    }
}

fn remaining_until(deadline: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|remaining| !remaining.is_zero())
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(u32::MAX as u64))
}

impl<S: SocketStream> Connection for SocketConnection<S> {
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let _pending = self.read_side.begin()?;
        self.check_aborted()?;

        let deadline = deadline_after(timeout);
        loop {
            let remaining = remaining_until(deadline).ok_or(TransportError::TimedOut(timeout))?;
            self.stream
                .set_read_timeout(Some(remaining))
                .map_err(TransportError::Io)?;
            match self.stream.read_some(buf) {
                Ok(n) => {
                    // A shutdown from abort() surfaces as EOF on the reader.
                    self.check_aborted()?;
                    return Ok(n);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(self.map_io(err, timeout)),
            }
        }
    }

    fn write(&self, buf: &[u8], immediate: bool, timeout: Duration) -> Result<()> {
        let _pending = self.write_side.begin()?;
        self.check_aborted()?;

        let deadline = deadline_after(timeout);
        self.write_all_by(buf, deadline, timeout)?;
        if immediate {
            loop {
                match self.stream.flush_stream() {
                    Ok(()) => break,
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => return Err(self.map_io(err, timeout)),
                }
            }
        }
        Ok(())
    }

    fn shutdown(&self, _timeout: Duration) -> Result<()> {
        let pending = self.write_side.begin()?;
        self.check_aborted()?;
        self.stream.shutdown(Shutdown::Write)?;
        self.write_side.close();
        drop(pending);
        debug!(transport = self.stream.name(), "output shut down");
        Ok(())
    }

    fn close(&self, _timeout: Duration) -> Result<()> {
        self.check_aborted()?;
        self.read_side.close();
        self.write_side.close();
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => {}
            // The peer may already have torn the socket down.
            Err(err) if err.kind() == ErrorKind::NotConnected => {}
            Err(err) => return Err(TransportError::Io(err)),
        }
        debug!(transport = self.stream.name(), "connection closed");
        Ok(())
    }

    fn abort(&self) {
        if self.aborted.swap(true, Ordering::AcqRel) {
            return;
        }
        self.read_side.close();
        self.write_side.close();
        let _ = self.stream.shutdown(Shutdown::Both);
        debug!(transport = self.stream.name(), "connection aborted");
    }

    fn transport_name(&self) -> &'static str {
        self.stream.name()
    }
}

impl<S: SocketStream> std::fmt::Debug for SocketConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketConnection")
            .field("type", &self.stream.name())
            .field("read", &self.read_side.state())
            .field("write", &self.write_side.state())
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// Connect to a listening Unix domain socket (blocking).
#[cfg(unix)]
pub fn connect_unix(
    path: impl AsRef<std::path::Path>,
) -> Result<SocketConnection<std::os::unix::net::UnixStream>> {
    let path = path.as_ref();
    let stream =
        std::os::unix::net::UnixStream::connect(path).map_err(|e| TransportError::Connect {
            target: path.display().to_string(),
            source: e,
        })?;
    debug!(?path, "connected to unix domain socket");
    Ok(SocketConnection::new(stream))
}

/// Connect to a TCP endpoint, trying each resolved address until one answers
/// within `timeout`.
pub fn connect_tcp(addr: impl ToSocketAddrs, timeout: Duration) -> Result<SocketConnection<TcpStream>> {
    let addrs: Vec<_> = addr
        .to_socket_addrs()
        .map_err(|e| TransportError::Connect {
            target: "<unresolved>".to_string(),
            source: e,
        })?
        .collect();

    let mut last_err = None;
    for addr in &addrs {
        match TcpStream::connect_timeout(addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                debug!(%addr, "connected to tcp endpoint");
                return Ok(SocketConnection::new(stream));
            }
            Err(err) if err.kind() == ErrorKind::TimedOut => {
                last_err = Some(TransportError::TimedOut(timeout));
            }
            Err(err) => {
                last_err = Some(TransportError::Connect {
                    target: addr.to_string(),
                    source: err,
                });
            }
        }
    }

    Err(last_err.unwrap_or_else(|| TransportError::Connect {
        target: "<none>".to_string(),
        source: std::io::Error::new(ErrorKind::AddrNotAvailable, "no addresses resolved"),
    }))
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::traits::SideState;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn pair() -> (SocketConnection<UnixStream>, UnixStream) {
        let (left, right) = UnixStream::pair().unwrap();
        (SocketConnection::new(left), right)
    }

    #[test]
    fn write_then_read_roundtrip() {
        let (conn, mut peer) = pair();
        conn.write(b"hello", true, TIMEOUT).unwrap();

        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        peer.write_all(b"world").unwrap();
        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf, TIMEOUT).unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[test]
    fn read_times_out_with_distinguished_error() {
        let (conn, _peer) = pair();
        let mut buf = [0u8; 4];
        let err = conn.read(&mut buf, Duration::from_millis(20)).unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {err:?}");
        assert_eq!(conn.read_side.state(), SideState::Idle);
    }

    #[test]
    fn zero_timeout_expires_immediately() {
        let (conn, _peer) = pair();
        let mut buf = [0u8; 4];
        let err = conn.read(&mut buf, Duration::ZERO).unwrap_err();
        assert!(matches!(err, TransportError::TimedOut(d) if d.is_zero()));
    }

    #[test]
    fn read_returns_zero_at_eof() {
        let (conn, peer) = pair();
        drop(peer);
        let mut buf = [0u8; 4];
        assert_eq!(conn.read(&mut buf, TIMEOUT).unwrap(), 0);
    }

    #[test]
    fn shutdown_half_closes_output_only() {
        let (conn, mut peer) = pair();
        conn.write(b"bye", true, TIMEOUT).unwrap();
        conn.shutdown(TIMEOUT).unwrap();

        let mut received = Vec::new();
        peer.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"bye");

        peer.write_all(b"still-open").unwrap();
        let mut buf = [0u8; 32];
        let n = conn.read(&mut buf, TIMEOUT).unwrap();
        assert_eq!(&buf[..n], b"still-open");

        assert!(matches!(
            conn.write(b"x", true, TIMEOUT),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn abort_unblocks_pending_read() {
        let (conn, _peer) = pair();
        let conn = Arc::new(conn);

        let reader = {
            let conn = Arc::clone(&conn);
            thread::spawn(move || {
                let mut buf = [0u8; 8];
                conn.read(&mut buf, Duration::from_secs(30))
            })
        };

        thread::sleep(Duration::from_millis(50));
        conn.abort();

        let result = reader.join().unwrap();
        assert!(matches!(result, Err(TransportError::Aborted)));
        assert!(conn.is_aborted());
    }

    #[test]
    fn blocked_read_does_not_block_write() {
        let (conn, mut peer) = pair();
        let conn = Arc::new(conn);

        let reader = {
            let conn = Arc::clone(&conn);
            thread::spawn(move || {
                let mut buf = [0u8; 8];
                let n = conn.read(&mut buf, TIMEOUT).unwrap();
                buf[..n].to_vec()
            })
        };

        thread::sleep(Duration::from_millis(20));
        conn.write(b"ping", true, TIMEOUT).unwrap();

        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        peer.write_all(b"pong").unwrap();
        assert_eq!(reader.join().unwrap(), b"pong");
    }

    #[test]
    fn operations_after_close_fail() {
        let (conn, _peer) = pair();
        conn.close(TIMEOUT).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            conn.read(&mut buf, TIMEOUT),
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            conn.write(b"x", true, TIMEOUT),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn connect_unix_to_listener() {
        let dir = std::env::temp_dir().join(format!("nmfprims-sock-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let sock_path = dir.join("conn.sock");
        let _ = std::fs::remove_file(&sock_path);
        let listener = std::os::unix::net::UnixListener::bind(&sock_path).unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 2];
            stream.read_exact(&mut buf).unwrap();
            buf
        });

        let conn = connect_unix(&sock_path).unwrap();
        assert_eq!(conn.transport_name(), "unix-domain-socket");
        conn.write(b"hi", true, TIMEOUT).unwrap();
        assert_eq!(&server.join().unwrap(), b"hi");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn connect_unix_missing_path_reports_target() {
        let err = connect_unix("/nonexistent/nmfprims/missing.sock").unwrap_err();
        assert!(matches!(err, TransportError::Connect { ref target, .. } if target.contains("missing.sock")));
    }

    #[test]
    fn connect_tcp_loopback() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"ok").unwrap();
        });

        let conn = connect_tcp(addr, TIMEOUT).unwrap();
        let mut buf = [0u8; 2];
        let mut filled = 0;
        while filled < 2 {
            filled += conn.read(&mut buf[filled..], TIMEOUT).unwrap();
        }
        assert_eq!(&buf, b"ok");
        server.join().unwrap();
    }
}
