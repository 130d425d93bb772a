//! The line-based request protocol and its dispatcher.
//!
//! Each accepted connection is served by exactly one worker thread at a
//! time: the worker reads a CRLF-terminated line, splits it on the first
//! space, lowercases the verb, and dispatches to `handle_get`/`handle_put`.
//! `PUT` additionally consumes `<decimal-size>` raw bytes straight off the
//! same buffered reader.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::RegistryError;
use crate::registry::SegmentRegistry;

const NOKEY: &[u8] = b"-NOKEY\r\n";
const NOSIZE: &[u8] = b"-NOSIZE\r\n";
const BADSIZE: &[u8] = b"-BADSIZE\r\n";
const BADTOKEN: &[u8] = b"-BADTOKEN\r\n";
const KEYNOTFOUND: &[u8] = b"-KEYNOTFOUND\r\n";
const OK: &[u8] = b"+OK\r\n";

/// Serve one client connection until it disconnects, a protocol-fatal
/// error occurs, or `running` is cleared by shutdown. Waiting for the
/// next command line uses a bounded read timeout so the worker can
/// notice `running` going false between commands; once a command is
/// underway (e.g. draining a `PUT`'s declared payload) reads retry past
/// that same timeout instead of aborting the connection.
pub fn serve_client(
    stream: TcpStream,
    registry: &Arc<SegmentRegistry>,
    running: &Arc<AtomicBool>,
) -> io::Result<()> {
    stream.set_read_timeout(Some(std::time::Duration::from_millis(250)))?;
    let read_half = stream.try_clone()?;
    let mut reader = BufReader::new(read_half);
    let mut writer = stream;

    while running.load(Ordering::SeqCst) {
        let line = match read_line(&mut reader) {
            Ok(Some(line)) => line,
            Ok(None) => break, // client closed the connection
            Err(e) if is_timeout(&e) => continue,
            Err(e) => return Err(e),
        };

        dispatch(&line, &mut reader, &mut writer, registry)?;
    }
    Ok(())
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Read one CRLF- (or bare LF-) terminated line, retrying on a read
/// timeout by the caller. `Ok(None)` means the peer closed the socket.
fn read_line<R: BufRead>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf)?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(Some(buf))
}

/// Fill `buf` completely, retrying reads that come back as a timeout
/// instead of treating them as fatal. The read timeout set in
/// `serve_client` exists to let a worker notice `running` going false
/// between commands, not to bound how long a client takes to finish
/// sending a declared payload.
fn read_exact_retrying<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "client closed the connection before sending the full payload",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if is_timeout(&e) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn dispatch<R: BufRead, W: Write>(
    line: &[u8],
    reader: &mut R,
    writer: &mut W,
    registry: &SegmentRegistry,
) -> io::Result<()> {
    let mut parts = line.splitn(2, |&b| b == b' ');
    let verb = parts.next().unwrap_or(b"");
    let rest = parts.next().unwrap_or(b"");

    match verb.to_ascii_lowercase().as_slice() {
        b"get" => handle_get(rest, writer, registry),
        b"put" => handle_put(rest, reader, writer, registry),
        _ => writer.write_all(BADTOKEN),
    }
}

fn handle_get<W: Write>(args: &[u8], writer: &mut W, registry: &SegmentRegistry) -> io::Result<()> {
    if args.is_empty() {
        return writer.write_all(NOKEY);
    }

    match registry.get(args) {
        Ok(value) => {
            writer.write_all(format!("+OK {}\r\n", value.len()).as_bytes())?;
            writer.write_all(&value)
        }
        Err(RegistryError::Get(_)) => writer.write_all(KEYNOTFOUND),
        Err(e) => {
            log::error!("get failed: {e}");
            writer.write_all(BADTOKEN)
        }
    }
}

fn handle_put<R: BufRead, W: Write>(
    args: &[u8],
    reader: &mut R,
    writer: &mut W,
    registry: &SegmentRegistry,
) -> io::Result<()> {
    let mut parts = args.splitn(2, |&b| b == b' ');
    let key = parts.next().unwrap_or(b"");
    let size_token = parts.next().unwrap_or(b"");

    if key.is_empty() {
        return writer.write_all(NOKEY);
    }
    if size_token.is_empty() {
        return writer.write_all(NOSIZE);
    }

    let size: usize = match std::str::from_utf8(size_token).ok().and_then(|s| s.parse().ok()) {
        Some(n) if n > 0 => n,
        _ => return writer.write_all(BADSIZE),
    };

    let mut value = vec![0u8; size];
    read_exact_retrying(reader, &mut value)?;

    match registry.put(key, &value) {
        Ok(()) => writer.write_all(OK),
        Err(e) => {
            log::error!("put failed: {e}");
            writer.write_all(BADTOKEN)
        }
    }
}
