//! Duplex session against an in-process echo peer over a Unix socket.
//!
//! Run with:
//!   cargo run --example duplex-echo
//!   cargo run --example duplex-echo -- --debug

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use nmfprims::frame::{
    write_end, write_preamble_ack, write_sized_envelope, RecordType, VarIntDecoder,
};
use nmfprims::session::{ChannelFactory, SessionConfig};

const VIA: &str = "net.tcp://localhost/echo";

fn init_logging(debug: bool) {
    let level = if debug {
        tracing::level_filters::LevelFilter::DEBUG
    } else {
        tracing::level_filters::LevelFilter::INFO
    };
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .with_ansi(false)
        .with_target(false)
        .try_init();
}

fn read_u8(stream: &mut UnixStream) -> std::io::Result<u8> {
    let mut byte = [0u8; 1];
    stream.read_exact(&mut byte)?;
    Ok(byte[0])
}

fn read_size(stream: &mut UnixStream) -> Result<usize, Box<dyn std::error::Error>> {
    let mut varint = VarIntDecoder::new();
    while !varint.is_done() {
        varint.decode(&[read_u8(stream)?])?;
    }
    Ok(varint.value()? as usize)
}

/// Skip the client preamble, then echo envelopes until the client ends.
fn serve(mut stream: UnixStream) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        match RecordType::from_byte(read_u8(&mut stream)?) {
            Some(RecordType::Version) => {
                read_u8(&mut stream)?;
                read_u8(&mut stream)?;
            }
            Some(RecordType::Mode | RecordType::KnownEncoding) => {
                read_u8(&mut stream)?;
            }
            Some(RecordType::Via | RecordType::ExtensibleEncoding) => {
                let len = read_size(&mut stream)?;
                let mut skip = vec![0u8; len];
                stream.read_exact(&mut skip)?;
            }
            Some(RecordType::PreambleEnd) => break,
            other => return Err(format!("unexpected preamble record {other:?}").into()),
        }
    }
    let mut out = BytesMut::new();
    write_preamble_ack(&mut out);
    stream.write_all(&out)?;

    loop {
        out.clear();
        match RecordType::from_byte(read_u8(&mut stream)?) {
            Some(RecordType::SizedEnvelope) => {
                let mut body = vec![0u8; read_size(&mut stream)?];
                stream.read_exact(&mut body)?;
                eprintln!("peer: echoing {} bytes", body.len());
                write_sized_envelope(&body, &mut out)?;
                stream.write_all(&out)?;
            }
            Some(RecordType::End) => {
                write_end(&mut out);
                stream.write_all(&out)?;
                stream.shutdown(std::net::Shutdown::Write)?;
                return Ok(());
            }
            other => return Err(format!("unexpected record {other:?}").into()),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(std::env::args().any(|arg| arg == "--debug"));

    let sock_dir = std::env::temp_dir().join(format!("nmfprims-echo-{}", std::process::id()));
    std::fs::create_dir_all(&sock_dir)?;
    let sock_path = sock_dir.join("echo.sock");
    let _ = std::fs::remove_file(&sock_path);

    let listener = UnixListener::bind(&sock_path)?;
    let peer = thread::spawn(move || -> Result<(), String> {
        let (stream, _) = listener.accept().map_err(|e| e.to_string())?;
        serve(stream).map_err(|e| e.to_string())
    });

    let factory = ChannelFactory::new(SessionConfig::default());
    let channel = factory.connect_unix(&sock_path, VIA)?;
    for message in ["hello", "framing", "world"] {
        channel.send(message.as_bytes(), Duration::from_secs(5))?;
        if let Some(reply) = channel.receive(Duration::from_secs(5))? {
            println!("{}", String::from_utf8_lossy(&reply));
        }
    }
    channel.close(Duration::from_secs(5))?;

    peer.join().map_err(|_| "echo peer panicked")??;
    let _ = std::fs::remove_dir_all(&sock_dir);
    Ok(())
}
