//! Per-connection I/O task.
//!
//! One task per engine connection owns the framed stream. It reads frames and
//! writes queued commands, and posts every observation to the event loop in
//! the order it made them. When the stream ends it marks the record dead and
//! posts exactly one disconnection.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::error::CapacityError;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace};

use crate::error::Error;
use crate::identifiers::ConnHandle;
use crate::payload::Payload;

use super::{CloseInfo, Engine, GroupCallbacks, SendCompletion};

// ============================================================================
// Outbound
// ============================================================================

/// Commands queued for a connection's I/O task.
pub(crate) enum Outbound {
    /// Write a data or control frame.
    Frame {
        message: Message,
        completion: Option<SendCompletion>,
    },
    /// Start the closing handshake.
    Close { code: u16, reason: String },
    /// Drop the socket without a closing handshake.
    Terminate,
}

// ============================================================================
// Liveness
// ============================================================================

/// Flags shared between a record and its I/O task.
#[derive(Debug)]
pub(crate) struct Liveness {
    alive: AtomicBool,
    closing: AtomicBool,
    awaiting_pong: AtomicBool,
}

impl Liveness {
    pub(crate) fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            awaiting_pong: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Alive and not yet told to close.
    #[inline]
    pub(crate) fn is_open(&self) -> bool {
        self.is_alive() && !self.closing.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn mark_closing(&self) {
        self.closing.store(true, Ordering::Release);
    }

    /// Marks a keepalive ping as outstanding; returns `true` if the previous
    /// one was never answered.
    #[inline]
    pub(crate) fn arm_ping(&self) -> bool {
        self.awaiting_pong.swap(true, Ordering::AcqRel)
    }

    #[inline]
    fn saw_traffic(&self) {
        self.awaiting_pong.store(false, Ordering::Release);
    }

    #[inline]
    fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Runs a connection until the stream ends, then reports the disconnection.
pub(crate) async fn drive<S, U>(
    engine: Engine<U>,
    handle: ConnHandle,
    mut ws: WebSocketStream<S>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    callbacks: Arc<GroupCallbacks<U>>,
    liveness: Arc<Liveness>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
    U: Clone + Send + Sync + 'static,
{
    let close_timeout = engine.config().close_timeout;
    let event_loop = engine.event_loop().clone();

    let mut received_close: Option<CloseInfo> = None;
    let mut sent_close: Option<CloseInfo> = None;
    let mut failure: Option<CloseInfo> = None;
    let mut deadline: Option<Instant> = None;
    let mut commands_open = true;

    trace!(%handle, "I/O task started");

    loop {
        tokio::select! {
            incoming = ws.next() => match incoming {
                Some(Ok(message)) => {
                    liveness.saw_traffic();
                    match message {
                        Message::Ping(data) => {
                            let callbacks = Arc::clone(&callbacks);
                            event_loop.defer(move || (callbacks.on_ping)(handle, data));
                        }
                        Message::Pong(data) => {
                            let callbacks = Arc::clone(&callbacks);
                            event_loop.defer(move || (callbacks.on_pong)(handle, data));
                        }
                        Message::Close(frame) => {
                            liveness.mark_closing();
                            trace!(%handle, ?frame, "Close frame received");
                            received_close = Some(frame.map_or_else(CloseInfo::no_status, |f| {
                                CloseInfo::new(u16::from(f.code), f.reason.as_str())
                            }));
                        }
                        other => {
                            if let Some(payload) = Payload::from_message(other) {
                                trace!(%handle, len = payload.len(), "Message received");
                                let callbacks = Arc::clone(&callbacks);
                                event_loop.defer(move || (callbacks.on_message)(handle, payload));
                            }
                        }
                    }
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => break,
                Some(Err(e)) => {
                    debug!(%handle, error = %e, "Connection failed");
                    failure = Some(match e {
                        WsError::Capacity(CapacityError::MessageTooLong { .. }) => {
                            CloseInfo::new(CloseInfo::MESSAGE_TOO_BIG, "")
                        }
                        _ => CloseInfo::abnormal(),
                    });
                    break;
                }
            },

            command = rx.recv(), if commands_open => match command {
                Some(Outbound::Frame { message, completion }) => {
                    let result = ws.send(message).await.map_err(Error::from);
                    if let Err(ref e) = result {
                        trace!(%handle, error = %e, "Frame write failed");
                    }
                    if let Some(completion) = completion {
                        event_loop.defer(move || completion(result));
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    if sent_close.is_none() && received_close.is_none() {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.clone().into(),
                        };
                        if let Err(e) = ws.close(Some(frame)).await {
                            trace!(%handle, error = %e, "Close frame write failed");
                        }
                        sent_close = Some(CloseInfo::new(code, reason));
                        deadline = Some(Instant::now() + close_timeout);
                    }
                }
                Some(Outbound::Terminate) => {
                    debug!(%handle, "Connection terminated");
                    failure = Some(CloseInfo::abnormal());
                    break;
                }
                None => commands_open = false,
            },

            () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                debug!(%handle, "Closing handshake timed out");
                break;
            }
        }
    }

    liveness.mark_dead();
    drop(ws);

    let info = failure
        .or(received_close)
        .or(sent_close)
        .unwrap_or_else(CloseInfo::abnormal);

    debug!(%handle, code = info.code, "Connection closed");
    engine.finish(handle, callbacks, info);
}

// ============================================================================
// Tests
// ============================================================================
