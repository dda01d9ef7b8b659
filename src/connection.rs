//! # Stream Connections
//!
//! A [`Connection`] owns one overlay stream on behalf of a client session.
//! Two detached workers service it:
//!
//! - the **writer task** drains a queue of outbound payloads into the stream
//!   (length-prefixed in framed mode), so `write_data` never blocks the
//!   owning client's actor turn;
//! - the **read pump** drains the stream and emits each payload (framed) or
//!   chunk (raw) as a `connection-data` record on the client's outbound
//!   channel, then reports termination back to the actor.
//!
//! Framed mode delimits payloads with a `u32` big-endian length prefix and
//! preserves payload boundaries end to end; raw mode forwards bytes with
//! arbitrary chunking. The mode is fixed when the connection is created.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::client::ClientCommand;
use crate::messages::{ConnectionId, RelayMessage};
use crate::overlay::{OverlayStream, PeerId};

/// Maximum framed payload size in either direction.
/// SECURITY: Bounds per-frame buffering; oversized frames kill the stream.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Read buffer size for raw (unframed) streams.
const RAW_CHUNK_SIZE: usize = 64 * 1024;

/// Close reason reported on orderly end-of-stream.
pub const REASON_CLOSED: &str = "connection closed";


/// Whether a connection was accepted by a listener or dialed out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Listener,
    Forwarder,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::Listener => "listener",
            Role::Forwarder => "forwarder",
        }
    }
}


pub struct Connection {
    id: ConnectionId,
    protocol: String,
    remote: PeerId,
    role: Role,
    data_tx: mpsc::UnboundedSender<Vec<u8>>,
    pump: JoinHandle<()>,
    writer: JoinHandle<()>,
    closed: bool,
}

impl Connection {
    /// Split the stream and start both workers. The caller emits the
    /// `listener-connection` / `peer-connection` notification *before*
    /// calling this, so it always precedes the first `connection-data`.
    pub fn spawn(
        id: ConnectionId,
        protocol: String,
        frames: bool,
        role: Role,
        stream: OverlayStream,
        outbound: mpsc::UnboundedSender<RelayMessage>,
        commands: mpsc::UnboundedSender<ClientCommand>,
    ) -> Self {
        let remote = stream.remote();
        let (read_half, write_half) = stream.into_split();
        let (data_tx, data_rx) = mpsc::unbounded_channel();

        trace!(
            id = %id,
            protocol = %protocol,
            peer = %remote.short(),
            role = role.as_str(),
            frames,
            "connection started"
        );

        let writer = tokio::spawn(run_writer(id, frames, write_half, data_rx, commands.clone()));
        let pump = tokio::spawn(run_pump(id, frames, read_half, outbound, commands));

        Self { id, protocol, remote, role, data_tx, pump, writer, closed: false }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote(&self) -> PeerId {
        self.remote
    }

    /// Queue bytes for the writer task. Returns false once the writer has
    /// terminated (stream already dead); the pump reports the closure.
    pub fn write_data(&self, bytes: Vec<u8>) -> bool {
        self.data_tx.send(bytes).is_ok()
    }

    /// Retag a retained listener connection as a forwarder.
    pub fn promote(&mut self) {
        self.role = Role::Forwarder;
    }

    /// Idempotent: the first call cancels both workers, which drops the
    /// stream halves and closes the underlying stream.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pump.abort();
        self.writer.abort();
        debug!(
            id = %self.id,
            protocol = %self.protocol,
            role = self.role.as_str(),
            "connection closed"
        );
    }
}


// ============================================================================
// Framing
// ============================================================================

/// Write one length-prefixed payload: `u32_be length || payload`.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit", payload.len()),
        ));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await
}

/// Read one length-prefixed payload. Returns `None` on a clean end of
/// stream at a frame boundary; EOF inside a frame is an error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    let mut have = 0;
    while have < header.len() {
        let n = reader.read(&mut header[have..]).await?;
        if n == 0 {
            if have == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated frame header"));
        }
        have += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}


// ============================================================================
// Workers
// ============================================================================

async fn run_writer<W: AsyncWrite + Unpin>(
    id: ConnectionId,
    frames: bool,
    mut writer: W,
    mut data_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    commands: mpsc::UnboundedSender<ClientCommand>,
) {
    while let Some(bytes) = data_rx.recv().await {
        let result = if frames {
            write_frame(&mut writer, &bytes).await
        } else {
            writer.write_all(&bytes).await
        };
        let result = match result {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            debug!(id = %id, error = %e, "stream write failed");
            let _ = commands.send(ClientCommand::StreamClosed { id, reason: e.to_string() });
            return;
        }
    }
    // Queue sender dropped: the connection is being torn down.
    let _ = writer.shutdown().await;
}

async fn run_pump<R: AsyncRead + Unpin>(
    id: ConnectionId,
    frames: bool,
    mut reader: R,
    outbound: mpsc::UnboundedSender<RelayMessage>,
    commands: mpsc::UnboundedSender<ClientCommand>,
) {
    let reason = loop {
        if frames {
            match read_frame(&mut reader).await {
                Ok(Some(payload)) => {
                    if outbound
                        .send(RelayMessage::ConnectionData { id, data: payload.into() })
                        .is_err()
                    {
                        break "control channel closed".to_string();
                    }
                }
                Ok(None) => break REASON_CLOSED.to_string(),
                Err(e) => break e.to_string(),
            }
        } else {
            let mut chunk = vec![0u8; RAW_CHUNK_SIZE];
            match reader.read(&mut chunk).await {
                Ok(0) => break REASON_CLOSED.to_string(),
                Ok(n) => {
                    chunk.truncate(n);
                    if outbound
                        .send(RelayMessage::ConnectionData { id, data: chunk.into() })
                        .is_err()
                    {
                        break "control channel closed".to_string();
                    }
                }
                Err(e) => break e.to_string(),
            }
        }
    };
    let _ = commands.send(ClientCommand::StreamClosed { id, reason });
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_frame(&mut a, b"hello").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        write_frame(&mut a, b"world").await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(Vec::new()));
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(b"world".to_vec()));
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn frame_preserves_boundaries() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        for _ in 0..3 {
            write_frame(&mut a, &[0x42; 10]).await.unwrap();
        }
        drop(a);

        for _ in 0..3 {
            let payload = read_frame(&mut b).await.unwrap().expect("frame expected");
            assert_eq!(payload, vec![0x42; 10]);
        }
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn truncated_header_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        a.write_all(&[0, 0]).await.unwrap();
        drop(a);

        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn truncated_payload_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        a.write_u32(10).await.unwrap();
        a.write_all(b"shrt").await.unwrap();
        drop(a);

        assert!(read_frame(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn oversized_frame_rejected_on_both_sides() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let err = write_frame(&mut a, &vec![0u8; MAX_FRAME_SIZE + 1]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        a.write_u32((MAX_FRAME_SIZE + 1) as u32).await.unwrap();
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
