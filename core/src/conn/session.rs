//! Session line I/O
//!
//! One authenticated TCP connection per peer. The read half lives inside the
//! session's reader task; the write half is shared behind a handle so any
//! component can send through the connection manager.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::protocol::constants::MAX_LINE_LEN;
use crate::{Error, Result};

/// Cloneable handle to the write half of a live session.
#[derive(Clone)]
pub struct SessionHandle {
    pub uuid: Uuid,
    pub remote: SocketAddr,
    pub id: u64,
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

impl SessionHandle {
    pub fn new(uuid: Uuid, remote: SocketAddr, writer: OwnedWriteHalf, id: u64) -> Self {
        Self {
            uuid,
            remote,
            id,
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    /// Write one protocol line, appending the newline terminator.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        writer
            .write_all(b"\n")
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::Network(e.to_string()))
    }
}

/// Read one newline-terminated line, bounded by `MAX_LINE_LEN`.
///
/// Returns `Ok(None)` on clean EOF. A line exceeding the bound is an error
/// so a misbehaving peer cannot grow the buffer without limit.
pub async fn read_wire_line(reader: &mut BufReader<OwnedReadHalf>) -> Result<Option<String>> {
    let mut buf = Vec::new();
    let mut limited = (&mut *reader).take((MAX_LINE_LEN + 1) as u64);
    let n = limited
        .read_until(b'\n', &mut buf)
        .await
        .map_err(|e| Error::Network(e.to_string()))?;

    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') && buf.len() > MAX_LINE_LEN {
        return Err(Error::Malformed("line exceeds maximum length".to_string()));
    }

    while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
        buf.pop();
    }
    let line =
        String::from_utf8(buf).map_err(|_| Error::Malformed("line is not utf-8".to_string()))?;
    Ok(Some(line))
}

/// Write one line to a raw write half, used during the handshake before a
/// `SessionHandle` exists.
pub async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> Result<()> {
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| Error::Network(e.to_string()))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| Error::Network(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Network(e.to_string()))
}
