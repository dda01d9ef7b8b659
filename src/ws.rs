//! WebSocket control server.
//!
//! Binds local control channels to client sessions: each accepted socket is
//! upgraded, registered with the relay, and split into a writer task (relay
//! messages out, as JSON text frames) and a reader loop (client commands in,
//! decoded in receipt order). A close frame, transport error, or undecodable
//! message ends the session.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::messages::{decode_client, encode_relay};
use crate::relay::Relay;

/// Accept control channels forever.
pub async fn serve(listener: TcpListener, relay: Relay) -> Result<()> {
    loop {
        let (socket, addr) = listener.accept().await.context("control listener failed")?;
        let relay = relay.clone();
        tokio::spawn(async move {
            match handle_socket(socket, relay).await {
                Ok(()) => debug!(peer = %addr, "control channel closed"),
                Err(e) => debug!(peer = %addr, error = %e, "control channel failed"),
            }
        });
    }
}

async fn handle_socket(socket: TcpStream, relay: Relay) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(socket)
        .await
        .context("websocket handshake failed")?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (client, mut outbound) = relay
        .register_client()
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    info!(client, "control channel open");

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match encode_relay(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(client, error = %e, "dropping unencodable relay message");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    while let Some(frame) = ws_rx.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(client, error = %e, "control channel transport error");
                break;
            }
        };
        let bytes = match frame {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => break,
            Message::Frame(_) => continue,
        };
        match decode_client(&bytes) {
            Ok(message) => {
                if relay.client_message(client, message).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                // The channel is corrupt; the session cannot continue.
                warn!(client, error = %e, "undecodable control message, closing session");
                break;
            }
        }
    }

    relay.client_closed(client).await;
    writer.abort();
    Ok(())
}
