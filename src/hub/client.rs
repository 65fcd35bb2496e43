//! Websocket subscriber pumps
//!
//! One task per direction. The read pump only watches for disconnection —
//! clients send no application frames — and enforces the pong deadline. The
//! write pump drains the hub-fed send buffer and keeps the connection alive
//! with pings.

use crate::hub::{HubHandle, Subscriber};
use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Deadline for a single frame write.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long the connection may stay silent before the read pump gives up.
pub const PONG_WAIT: Duration = Duration::from_secs(60);
/// Ping cadence, at 90% of the pong wait.
pub const PING_PERIOD: Duration = Duration::from_secs(54);
/// Clients send nothing meaningful; anything bigger is hostile.
pub const MAX_MESSAGE_SIZE: usize = 512;

/// Run a subscriber connection to completion.
///
/// Registers with the hub, pumps until either side fails, then unregisters.
/// Returns once the connection is fully torn down.
pub async fn serve(
    socket: WebSocket,
    hub: HubHandle,
    project_id: i32,
    user_id: i32,
    send_buffer: usize,
) {
    let (frame_tx, frame_rx) = mpsc::channel::<Utf8Bytes>(send_buffer);
    let id = Uuid::new_v4();

    if !hub
        .register(Subscriber {
            id,
            project_id,
            user_id,
            sender: frame_tx,
        })
        .await
    {
        debug!(project_id, "hub unavailable, dropping websocket");
        return;
    }

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(sink, frame_rx));

    read_pump(stream).await;

    // Read side is done: detach so the hub drops our sender, which ends the
    // write pump; then wait for it.
    hub.unregister(project_id, id).await;
    let _ = writer.await;
    debug!(project_id, subscriber = %id, "websocket closed");
}

/// Watch the socket for disconnection, resetting the deadline on any
/// inbound frame (pongs included).
async fn read_pump(mut stream: SplitStream<WebSocket>) {
    loop {
        match tokio::time::timeout(PONG_WAIT, stream.next()).await {
            Err(_) => {
                debug!("websocket read deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(_))) => break,
            Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Ok(_))) => {}
        }
    }
}

/// Drain the send buffer into the socket, pinging on a timer.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut frames: mpsc::Receiver<Utf8Bytes>,
) {
    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => {
                    let send = sink.send(Message::Text(frame));
                    match tokio::time::timeout(WRITE_TIMEOUT, send).await {
                        Ok(Ok(())) => {}
                        _ => break,
                    }
                }
                None => {
                    // Buffer closed: evicted, unregistered, or hub shutdown.
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = ping.tick() => {
                let send = sink.send(Message::Ping(Bytes::new()));
                match tokio::time::timeout(WRITE_TIMEOUT, send).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
        }
    }
}
