#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use nmfprims_frame::{write_end, write_preamble_ack, write_sized_envelope};
use nmfprims_session::{ChannelOptions, SessionConfig};
use nmfprims_transport::{Connection, TransportError};

pub const VIA: &str = "net.tcp://localhost/echo";
pub const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Script {
    inbound: VecDeque<u8>,
    eof: bool,
    writes: Vec<Vec<u8>>,
    write_error: Option<io::ErrorKind>,
    shutdowns: usize,
    closes: usize,
}

/// In-memory connection that serves scripted inbound bytes and records every
/// write as one entry.
///
/// Reads with nothing scripted time out immediately, or return end of
/// stream once [`finish`](Self::finish) was called. Writes flag any overlap
/// with another in-flight write.
#[derive(Default)]
pub struct ScriptedConnection {
    script: Mutex<Script>,
    calls: AtomicUsize,
    writing: AtomicBool,
    overlapped: AtomicBool,
    aborted: AtomicBool,
    write_delay: Option<Duration>,
}

impl ScriptedConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Writes linger for `delay` so concurrent writers would collide.
    pub fn slow_writes(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            write_delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn push(&self, bytes: &[u8]) {
        self.script.lock().unwrap().inbound.extend(bytes.iter().copied());
    }

    pub fn finish(&self) {
        self.script.lock().unwrap().eof = true;
    }

    /// Fail every later write with `kind`. `TimedOut` is reported as a
    /// transport timeout.
    pub fn fail_writes(&self, kind: io::ErrorKind) {
        self.script.lock().unwrap().write_error = Some(kind);
    }

    /// Reads, writes, shutdowns and closes issued so far. Aborts are not
    /// counted.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.script.lock().unwrap().writes.clone()
    }

    pub fn shutdowns(&self) -> usize {
        self.script.lock().unwrap().shutdowns
    }

    pub fn closes(&self) -> usize {
        self.script.lock().unwrap().closes
    }

    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn begin(&self) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.is_aborted() {
            return Err(TransportError::Aborted);
        }
        Ok(())
    }
}

impl Connection for ScriptedConnection {
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        self.begin()?;
        let mut script = self.script.lock().unwrap();
        if script.inbound.is_empty() {
            return if script.eof {
                Ok(0)
            } else {
                Err(TransportError::TimedOut(timeout))
            };
        }
        let n = buf.len().min(script.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(script.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8], _immediate: bool, timeout: Duration) -> Result<(), TransportError> {
        self.begin()?;
        if let Some(kind) = self.script.lock().unwrap().write_error {
            return Err(match kind {
                io::ErrorKind::TimedOut => TransportError::TimedOut(timeout),
                kind => TransportError::Io(kind.into()),
            });
        }
        if self.writing.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        if let Some(delay) = self.write_delay {
            thread::sleep(delay);
        }
        self.script.lock().unwrap().writes.push(buf.to_vec());
        self.writing.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&self, _timeout: Duration) -> Result<(), TransportError> {
        self.begin()?;
        self.script.lock().unwrap().shutdowns += 1;
        Ok(())
    }

    fn close(&self, _timeout: Duration) -> Result<(), TransportError> {
        self.begin()?;
        self.script.lock().unwrap().closes += 1;
        Ok(())
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn transport_name(&self) -> &'static str {
        "scripted"
    }
}

pub fn options<C>() -> ChannelOptions<C> {
    ChannelOptions::duplex(SessionConfig::default(), VIA).unwrap()
}

pub fn ack() -> Vec<u8> {
    let mut buf = BytesMut::new();
    write_preamble_ack(&mut buf);
    buf.to_vec()
}

pub fn envelope(body: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    write_sized_envelope(body, &mut buf).unwrap();
    buf.to_vec()
}

pub fn end() -> Vec<u8> {
    let mut buf = BytesMut::new();
    write_end(&mut buf);
    buf.to_vec()
}
