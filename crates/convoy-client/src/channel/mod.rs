// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Live convoy channel over a WebSocket.
//!
//! A [`Connection`] is one socket to one convoy. It never reconnects on its
//! own: when the server goes away the connection reports
//! [`ConnectionState::Closed`] (or `Error`) and stays dead, and the owner
//! decides whether to call [`Connection::connect`] again.
//!
//! The socket is driven by a pump task that moves text frames between the
//! WebSocket and two in-process queues. Everything above the queues (frame
//! parsing, roster delivery, close semantics) is transport-agnostic, which is
//! what [`Connection::from_frames`] exposes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::protocol::{ConvoyMessage, ConvoyParser, MemberReport, PositionReport, Protocol};

/// Transport failures.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid convoy endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("websocket connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Configuration for convoy connections.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket base, e.g. `ws://localhost:8000/ws`.
    pub ws_base: String,
    /// Queue depth for frames and events.
    pub buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ws_base: "ws://localhost:8000/ws".to_string(),
            buffer_size: 256,
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket open.
    Connected,
    /// Closed by the server or by the owner.
    Closed,
    /// Transport error; the connection is dead.
    Error(String),
}

/// Events emitted by the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Connection state changed.
    StateChanged(ConnectionState),
    /// Full roster replacement (only when no roster callback is registered).
    Roster(Vec<MemberReport>),
}

/// One inbound item from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Error(String),
}

type RosterCallback = Box<dyn FnMut(Vec<MemberReport>) + Send + 'static>;

/// Handle to one live convoy connection.
pub struct Connection {
    convoy_id: String,
    outbound_tx: mpsc::Sender<String>,
    event_rx: mpsc::Receiver<ChannelEvent>,
    roster_callback: Arc<Mutex<Option<RosterCallback>>>,
    closed: Arc<AtomicBool>,
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("convoy_id", &self.convoy_id)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Open a WebSocket to `{ws_base}/{convoy_id}?token={token}`.
    pub async fn connect(
        config: &ConnectionConfig,
        convoy_id: &str,
        token: &str,
    ) -> Result<Self, ChannelError> {
        let url = endpoint_url(&config.ws_base, convoy_id, token)?;
        info!("Connecting to convoy {}...", convoy_id);

        let (socket, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        info!("Connected to convoy {}", convoy_id);

        let buffer_size = config.buffer_size.max(1);
        let (frame_tx, frame_rx) = mpsc::channel(buffer_size);
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer_size);
        let connection = Self::from_frames(convoy_id, frame_rx, outbound_tx, buffer_size);

        let pump_cancel = connection.cancel_token.clone();
        tokio::spawn(async move {
            socket_pump(socket, frame_tx, outbound_rx, pump_cancel).await;
        });

        Ok(connection)
    }

    /// Build a connection on top of raw frame queues.
    ///
    /// `inbound` yields frames from the server; encoded position reports are
    /// written to `outbound`.
    #[must_use]
    pub fn from_frames(
        convoy_id: &str,
        inbound: mpsc::Receiver<InboundFrame>,
        outbound: mpsc::Sender<String>,
        buffer_size: usize,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(buffer_size.max(1));
        let roster_callback: Arc<Mutex<Option<RosterCallback>>> = Arc::new(Mutex::new(None));
        let closed = Arc::new(AtomicBool::new(false));
        let cancel_token = CancellationToken::new();

        let _ = event_tx.try_send(ChannelEvent::StateChanged(ConnectionState::Connected));

        tokio::spawn(inbound_loop(
            convoy_id.to_string(),
            inbound,
            event_tx,
            Arc::clone(&roster_callback),
            Arc::clone(&closed),
            cancel_token.clone(),
        ));

        Self {
            convoy_id: convoy_id.to_string(),
            outbound_tx: outbound,
            event_rx,
            roster_callback,
            closed,
            cancel_token,
        }
    }

    /// The convoy this connection belongs to.
    #[must_use]
    pub fn convoy_id(&self) -> &str {
        &self.convoy_id
    }

    /// Publish the local position. A no-op once the connection is closed.
    pub fn send(&self, report: &PositionReport) {
        if self.is_closed() {
            debug!("Dropping position report: connection closed");
            return;
        }

        let frame = match report.encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode position report: {}", e);
                return;
            }
        };

        match self.outbound_tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Outbound queue full, dropping position report");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.closed.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Deliver roster updates to `callback` instead of the event queue.
    pub fn on_roster_update<F>(&self, callback: F)
    where
        F: FnMut(Vec<MemberReport>) + Send + 'static,
    {
        if self.is_closed() {
            return;
        }
        if let Ok(mut slot) = self.roster_callback.lock() {
            *slot = Some(Box::new(callback));
        }
    }

    /// Receive the next event.
    ///
    /// Returns `None` once the connection is closed by its owner or the
    /// transport has gone away and all pending events were delivered.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        if self.cancel_token.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            () = self.cancel_token.cancelled() => None,
            event = self.event_rx.recv() => event,
        }
    }

    /// Whether the socket has been closed by either side.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the connection. No roster callback fires after this returns.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Closing connection to convoy {}", self.convoy_id);
        }
        self.cancel_token.cancel();
        // try_lock: close() may be called from inside the callback itself
        if let Ok(mut slot) = self.roster_callback.try_lock() {
            slot.take();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel_token.cancel();
    }
}

/// Build `{ws_base}/{convoy_id}?token={token}` with both parts percent-encoded.
fn endpoint_url(ws_base: &str, convoy_id: &str, token: &str) -> Result<reqwest::Url, ChannelError> {
    if convoy_id.is_empty() {
        return Err(ChannelError::InvalidEndpoint(convoy_id.to_string()));
    }

    let mut url = reqwest::Url::parse(ws_base)
        .map_err(|e| ChannelError::InvalidEndpoint(format!("{ws_base}: {e}")))?;
    url.path_segments_mut()
        .map_err(|()| ChannelError::InvalidEndpoint(ws_base.to_string()))?
        .pop_if_empty()
        .push(convoy_id);
    url.query_pairs_mut().clear().append_pair("token", token);
    Ok(url)
}

async fn inbound_loop(
    convoy_id: String,
    mut inbound: mpsc::Receiver<InboundFrame>,
    event_tx: mpsc::Sender<ChannelEvent>,
    roster_callback: Arc<Mutex<Option<RosterCallback>>>,
    closed: Arc<AtomicBool>,
    cancel_token: CancellationToken,
) {
    let mut parser = ConvoyParser::new();

    loop {
        let frame = tokio::select! {
            biased;
            () = cancel_token.cancelled() => return,
            frame = inbound.recv() => frame,
        };

        let text = match frame {
            Some(InboundFrame::Text(text)) => text,
            Some(InboundFrame::Error(reason)) => {
                error!("Convoy {} transport error: {}", convoy_id, reason);
                closed.store(true, Ordering::SeqCst);
                let _ = event_tx
                    .send(ChannelEvent::StateChanged(ConnectionState::Error(reason)))
                    .await;
                return;
            }
            None => {
                info!("Convoy {} connection closed by server", convoy_id);
                closed.store(true, Ordering::SeqCst);
                let _ = event_tx
                    .send(ChannelEvent::StateChanged(ConnectionState::Closed))
                    .await;
                return;
            }
        };

        let members = match parser.parse(text.as_bytes()) {
            Ok(Some(ConvoyMessage::RosterUpdate { members })) => members,
            Ok(Some(ConvoyMessage::LocationUpdate { member_id, .. })) => {
                debug!("Ignoring location_update for {}", member_id);
                continue;
            }
            Ok(None) => continue,
            Err(e) => {
                warn!("Dropping malformed convoy frame: {}", e);
                continue;
            }
        };

        let undelivered = match roster_callback.lock() {
            Ok(mut slot) => {
                if closed.load(Ordering::SeqCst) {
                    slot.take();
                    return;
                }
                match slot.as_mut() {
                    Some(callback) => {
                        callback(members);
                        None
                    }
                    None => Some(members),
                }
            }
            Err(_) => Some(members),
        };

        if let Some(members) = undelivered {
            if event_tx.send(ChannelEvent::Roster(members)).await.is_err() {
                return;
            }
        }
    }
}

async fn socket_pump<S>(
    socket: S,
    frame_tx: mpsc::Sender<InboundFrame>,
    mut outbound_rx: mpsc::Receiver<String>,
    cancel_token: CancellationToken,
) where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return;
            }

            outbound = outbound_rx.recv() => {
                let Some(text) = outbound else {
                    let _ = sink.close().await;
                    return;
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    let _ = frame_tx.send(InboundFrame::Error(e.to_string())).await;
                    return;
                }
            }

            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if frame_tx.send(InboundFrame::Text(text)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            if frame_tx.send(InboundFrame::Text(text)).await.is_err() {
                                return;
                            }
                        }
                        Err(_) => warn!("Dropping non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = frame_tx.send(InboundFrame::Error(e.to_string())).await;
                        return;
                    }
                }
            }
        }
    }
}
