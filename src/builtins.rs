//! In-process built-in services (echo/discard/chargen/daytime/time).
//!
//! The design treats these as external collaborators and only specifies
//! their contract with the dispatcher: a name resolves to a function that
//! is handed the accepted stream. The bodies below are the classic inetd
//! internal services, kept intentionally small.

use std::io::{self, Read, Write};
use std::net::UdpSocket;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between 1900-01-01 (RFC 868 epoch) and the Unix epoch.
const RFC868_EPOCH_OFFSET: u64 = 2_208_988_800;

pub fn run_stream(name: &str, stream: &mut (impl Read + Write)) -> io::Result<()> {
    match name {
        "echo" => echo_stream(stream),
        "discard" => discard_stream(stream),
        "chargen" => chargen_stream(stream),
        "daytime" => daytime_stream(stream),
        "time" => time_stream(stream),
        other => Err(io::Error::new(io::ErrorKind::InvalidInput, format!("unknown builtin {other:?}"))),
    }
}

pub fn run_dgram(name: &str, socket: &UdpSocket, peer: std::net::SocketAddr, data: &[u8]) -> io::Result<()> {
    match name {
        "echo" => {
            socket.send_to(data, peer)?;
            Ok(())
        }
        "discard" => Ok(()),
        "chargen" => {
            let line = chargen_line(0);
            socket.send_to(line.as_bytes(), peer)?;
            Ok(())
        }
        "daytime" => {
            socket.send_to(daytime_string().as_bytes(), peer)?;
            Ok(())
        }
        "time" => {
            socket.send_to(&rfc868_time().to_be_bytes(), peer)?;
            Ok(())
        }
        other => Err(io::Error::new(io::ErrorKind::InvalidInput, format!("unknown builtin {other:?}"))),
    }
}

fn echo_stream(stream: &mut (impl Read + Write)) -> io::Result<()> {
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        stream.write_all(&buf[..n])?;
    }
}

fn discard_stream(stream: &mut (impl Read + Write)) -> io::Result<()> {
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
    }
}

fn chargen_line(offset: usize) -> String {
    const CHARSET: &[u8] = b" !\"#$%&'()*+,-./0123456789:;<=>?@ABCDEFGHIJKLMNOPQRSTUVWXYZ[\\]^_`abcdefghijklmnopqrstuvwxyz{|}~";
    let start = offset % CHARSET.len();
    let mut line = Vec::with_capacity(72);
    for i in 0..72 {
        line.push(CHARSET[(start + i) % CHARSET.len()]);
    }
    line.push(b'\r');
    line.push(b'\n');
    String::from_utf8(line).expect("charset is ASCII")
}

fn chargen_stream(stream: &mut (impl Read + Write)) -> io::Result<()> {
    let mut offset = 0usize;
    loop {
        let line = chargen_line(offset);
        if stream.write_all(line.as_bytes()).is_err() {
            return Ok(());
        }
        offset += 1;
    }
}

fn daytime_string() -> String {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    format!("{secs}\r\n")
}

fn daytime_stream(stream: &mut (impl Read + Write)) -> io::Result<()> {
    stream.write_all(daytime_string().as_bytes())
}

fn rfc868_time() -> u32 {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    (secs + RFC868_EPOCH_OFFSET) as u32
}

fn time_stream(stream: &mut (impl Read + Write)) -> io::Result<()> {
    stream.write_all(&rfc868_time().to_be_bytes())
}
