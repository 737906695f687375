use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::traits::{AsyncConnection, Side, SideGate};

/// [`AsyncConnection`] over any tokio byte stream.
///
/// The stream is split so the read and write halves make progress
/// independently. Each operation races its I/O against its deadline and the
/// abort token; whichever loses is dropped, which cancels the I/O.
pub struct AsyncSocketConnection<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    read_side: SideGate,
    write_side: SideGate,
    abort: CancellationToken,
    name: &'static str,
}

impl<S> AsyncSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, name: &'static str) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            read_side: SideGate::new(Side::Read),
            write_side: SideGate::new(Side::Write),
            abort: CancellationToken::new(),
            name,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    fn check_aborted(&self) -> Result<()> {
        if self.is_aborted() {
            Err(TransportError::Aborted)
        } else {
            Ok(())
        }
    }
}

impl<S> AsyncConnection for AsyncSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let _pending = self.read_side.begin()?;
        self.check_aborted()?;

        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = self.abort.cancelled() => Err(TransportError::Aborted),
            res = tokio::time::timeout(timeout, reader.read(buf)) => match res {
                Ok(Ok(n)) => Ok(n),
                Ok(Err(err)) => Err(TransportError::Io(err)),
                Err(_) => Err(TransportError::TimedOut(timeout)),
            },
        }
    }

    async fn write(&self, buf: &[u8], immediate: bool, timeout: Duration) -> Result<()> {
        let _pending = self.write_side.begin()?;
        self.check_aborted()?;

        let mut writer = self.writer.lock().await;
        let io = async {
            writer.write_all(buf).await?;
            if immediate {
                writer.flush().await?;
            }
            Ok::<(), std::io::Error>(())
        };
        tokio::select! {
            _ = self.abort.cancelled() => Err(TransportError::Aborted),
            res = tokio::time::timeout(timeout, io) => match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(TransportError::Io(err)),
                Err(_) => Err(TransportError::TimedOut(timeout)),
            },
        }
    }

    async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let pending = self.write_side.begin()?;
        self.check_aborted()?;

        let mut writer = self.writer.lock().await;
        let result = tokio::select! {
            _ = self.abort.cancelled() => Err(TransportError::Aborted),
            res = tokio::time::timeout(timeout, writer.shutdown()) => match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(TransportError::Io(err)),
                Err(_) => Err(TransportError::TimedOut(timeout)),
            },
        };
        if result.is_ok() {
            self.write_side.close();
            debug!(transport = self.name, "output shut down");
        }
        drop(pending);
        result
    }

    async fn close(&self, timeout: Duration) -> Result<()> {
        self.check_aborted()?;
        self.read_side.close();
        if self.write_side.state() != crate::traits::SideState::Closed {
            let mut writer = self.writer.lock().await;
            match tokio::time::timeout(timeout, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.kind() == std::io::ErrorKind::NotConnected => {}
                Ok(Err(err)) => return Err(TransportError::Io(err)),
                Err(_) => return Err(TransportError::TimedOut(timeout)),
            }
        }
        self.write_side.close();
        debug!(transport = self.name, "connection closed");
        Ok(())
    }

    fn abort(&self) {
        if self.abort.is_cancelled() {
            return;
        }
        self.abort.cancel();
        self.read_side.close();
        self.write_side.close();
        debug!(transport = self.name, "connection aborted");
    }

    fn transport_name(&self) -> &'static str {
        self.name
    }
}

impl<S> std::fmt::Debug for AsyncSocketConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSocketConnection")
            .field("type", &self.name)
            .field("read", &self.read_side.state())
            .field("write", &self.write_side.state())
            .field("aborted", &self.abort.is_cancelled())
            .finish()
    }
}

/// Connect to a listening Unix domain socket (async).
#[cfg(unix)]
pub async fn connect_unix_async(
    path: impl AsRef<std::path::Path>,
    timeout: Duration,
) -> Result<AsyncSocketConnection<tokio::net::UnixStream>> {
    let path = path.as_ref();
    let stream = match tokio::time::timeout(timeout, tokio::net::UnixStream::connect(path)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(TransportError::Connect {
                target: path.display().to_string(),
                source: e,
            })
        }
        Err(_) => return Err(TransportError::TimedOut(timeout)),
    };
    debug!(?path, "connected to unix domain socket");
    Ok(AsyncSocketConnection::new(stream, "unix-domain-socket"))
}

/// Connect to a TCP endpoint (async).
pub async fn connect_tcp_async(
    addr: impl tokio::net::ToSocketAddrs + std::fmt::Debug,
    timeout: Duration,
) -> Result<AsyncSocketConnection<tokio::net::TcpStream>> {
    let target = format!("{addr:?}");
    let stream = match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(TransportError::Connect { target, source: e }),
        Err(_) => return Err(TransportError::TimedOut(timeout)),
    };
    stream.set_nodelay(true)?;
    debug!(%target, "connected to tcp endpoint");
    Ok(AsyncSocketConnection::new(stream, "tcp"))
}
