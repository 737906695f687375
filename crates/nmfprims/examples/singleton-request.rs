//! One request/reply exchange in singleton mode against an in-process peer.
//!
//! Run with:
//!   cargo run --example singleton-request

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use nmfprims::frame::{
    write_end, write_preamble_ack, write_unsized_envelope, RecordType, VarIntDecoder,
};
use nmfprims::session::{ChannelFactory, SessionConfig};
use nmfprims::transport::SocketConnection;

const VIA: &str = "net.tcp://localhost/time";

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

fn skip(stream: &mut UnixStream, len: usize) -> std::io::Result<()> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)
}

/// Read the preamble, then the chunked request, and reply with the request
/// reversed.
fn serve(mut stream: UnixStream) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        match RecordType::from_byte(read_u8(&mut stream)?) {
            Some(RecordType::Version) => skip(&mut stream, 2)?,
            Some(RecordType::Mode | RecordType::KnownEncoding) => skip(&mut stream, 1)?,
            Some(RecordType::Via | RecordType::ExtensibleEncoding) => {
                let len = read_size(&mut stream)?;
                skip(&mut stream, len)?;
            }
            Some(RecordType::PreambleEnd) => break,
            other => return Err(format!("unexpected preamble record {other:?}").into()),
        }
    }
    let mut out = BytesMut::new();
    write_preamble_ack(&mut out);
    stream.write_all(&out)?;

    if RecordType::from_byte(read_u8(&mut stream)?) != Some(RecordType::UnsizedEnvelope) {
        return Err("expected an unsized envelope".into());
    }
    let mut request = Vec::new();
    loop {
        let len = read_size(&mut stream)?;
        if len == 0 {
            break;
        }
        let start = request.len();
        request.resize(start + len, 0);
        stream.read_exact(&mut request[start..])?;
    }
    if RecordType::from_byte(read_u8(&mut stream)?) != Some(RecordType::End) {
        return Err("expected End after the request".into());
    }

    request.reverse();
    out.clear();
    write_unsized_envelope(&request, 8, &mut out)?;
    write_end(&mut out);
    stream.write_all(&out)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::level_filters::LevelFilter::DEBUG)
        .with_ansi(false)
        .with_target(false)
        .try_init();

    let (client, server) = UnixStream::pair()?;
    let peer = thread::spawn(move || serve(server).map_err(|e| e.to_string()));

    let factory = ChannelFactory::new(SessionConfig::default());
    let channel = factory.singleton(SocketConnection::new(client), VIA)?;
    match channel.request(b"singleton request body", Duration::from_secs(5))? {
        Some(reply) => println!("{}", String::from_utf8_lossy(&reply)),
        None => println!("(no reply)"),
    }

    peer.join().map_err(|_| "peer panicked")??;
    Ok(())
}
