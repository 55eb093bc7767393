//! Engine callbacks → connection events.
//!
//! The engine knows handles; users know [`Connection`]s. The bridge keeps
//! the two in step through the engine's user-data slot:
//!
//! | Engine callback | Effect |
//! |-----------------|--------|
//! | `on_open` (server) | New `Connection`, stored as user data, handed to the upgrade callback |
//! | `on_open` (client) | Handle attached to the waiting `Connection`, `open` emitted |
//! | `on_message` / `on_ping` / `on_pong` | Event emitted on the stored `Connection` |
//! | `on_disconnection` | User data and handle cleared now, `close` emitted next turn |
//! | `on_error` (client) | `error` emitted |
//!
//! `close` and a client's `error` are terminal: the connection's listeners
//! are emptied right after they run.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::connection::{Connection, Event, Variant};
use crate::engine::{CloseInfo, Engine, GroupCallbacks, OpenContext, UpgradeContext};
use crate::identifiers::ConnHandle;
use crate::http::UpgradeRequest;

// ============================================================================
// Types
// ============================================================================

/// Group-wide callback for accepted connections.
pub type ConnectionCallback = Arc<dyn Fn(Connection, Arc<UpgradeRequest>) + Send + Sync + 'static>;

/// Slot holding a group's upgrade callback; emptied when the group closes.
pub(crate) type UpgradeSlot = Arc<Mutex<Option<ConnectionCallback>>>;

// ============================================================================
// Callback Tables
// ============================================================================

/// Builds the engine callbacks for a group of the given variant.
pub(crate) fn group_callbacks(
    engine: &Engine<Connection>,
    variant: Variant,
    upgrade_slot: &UpgradeSlot,
) -> GroupCallbacks<Connection> {
    let on_open: Box<dyn Fn(ConnHandle, OpenContext<Connection>) + Send + Sync> = match variant {
        Variant::Server => {
            let engine = engine.clone();
            let slot = Arc::clone(upgrade_slot);
            Box::new(move |handle, context| server_open(&engine, &slot, handle, context))
        }
        Variant::Client => {
            let engine = engine.clone();
            Box::new(move |handle, context| client_open(&engine, handle, context))
        }
    };

    let on_error: Option<Box<dyn Fn(Connection, crate::error::Error) + Send + Sync>> = match variant {
        Variant::Server => None,
        Variant::Client => Some(Box::new(|connection, error| {
            debug!(error = %error, "Client connection failed");
            connection.emit_last(Event::Error(error));
        })),
    };

    GroupCallbacks {
        on_open,
        on_message: route(engine, Event::Message),
        on_disconnection: {
            let engine = engine.clone();
            Box::new(move |handle, info| disconnect(&engine, handle, info))
        },
        on_ping: route(engine, Event::Ping),
        on_pong: route(engine, Event::Pong),
        on_error,
    }
}

/// Forwards an engine observation to the connection stored for the handle.
fn route<T>(
    engine: &Engine<Connection>,
    wrap: fn(T) -> Event,
) -> Box<dyn Fn(ConnHandle, T) + Send + Sync>
where
    T: Send + 'static,
{
    let engine = engine.clone();
    Box::new(move |handle, value| match engine.lookup_user_data(handle) {
        Some(connection) => connection.emit(wrap(value)),
        None => trace!(%handle, "Event for unbound handle dropped"),
    })
}

// ============================================================================
// Open
// ============================================================================

fn server_open(
    engine: &Engine<Connection>,
    slot: &UpgradeSlot,
    handle: ConnHandle,
    context: OpenContext<Connection>,
) {
    let OpenContext::Upgrade(UpgradeContext { request, on_upgrade }) = context else {
        debug!(%handle, "Server group opened a client connection");
        return;
    };

    let connection = Connection::new(engine.clone(), Variant::Server, Some(handle));
    if let Err(e) = engine.attach_user_data(handle, connection.clone()) {
        debug!(%handle, error = %e, "Connection vanished before open");
        return;
    }

    if let Some(on_upgrade) = on_upgrade {
        on_upgrade(connection);
        return;
    }

    let callback = slot.lock().clone();
    match callback {
        Some(callback) => callback(connection, request),
        None => {
            debug!(%handle, "No upgrade callback, terminating");
            connection.terminate();
        }
    }
}

fn client_open(engine: &Engine<Connection>, handle: ConnHandle, context: OpenContext<Connection>) {
    let OpenContext::Connect(connection) = context else {
        debug!(%handle, "Client group opened a server connection");
        return;
    };

    connection.set_handle(handle);
    if let Err(e) = engine.attach_user_data(handle, connection.clone()) {
        debug!(%handle, error = %e, "Connection vanished before open");
        connection.release_handle(handle);
        return;
    }

    connection.emit(Event::Open);
}

// ============================================================================
// Disconnection
// ============================================================================

fn disconnect(engine: &Engine<Connection>, handle: ConnHandle, info: CloseInfo) {
    let Some(connection) = engine.clear_user_data(handle) else {
        trace!(%handle, "Disconnection for unbound handle");
        return;
    };

    connection.release_handle(handle);
    engine
        .event_loop()
        .defer(move || connection.emit_last(Event::Close(info)));
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::io::duplex;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_tungstenite::WebSocketStream;
    use tokio_tungstenite::tungstenite::protocol::Role as WsRole;

    use crate::connection::EventKind;
    use crate::engine::{EngineConfig, GroupPolicy};
    use crate::event_loop::EventLoop;
    use crate::group::Group;

    #[tokio::test]
    async fn test_close_clears_connection_listeners() {
        let event_loop = EventLoop::new();
        let engine = Engine::new(event_loop.clone(), EngineConfig::default());
        let group = Group::create(&engine, GroupPolicy::default(), Variant::Server);

        let (client, server) = duplex(1024);
        let ws = WebSocketStream::from_raw_socket(server, WsRole::Server, None).await;

        let stored = Arc::new(Mutex::new(None));
        let (closes, mut closed) = mpsc::unbounded_channel();
        let context = UpgradeContext {
            request: Arc::new(UpgradeRequest::new("GET", "/")),
            on_upgrade: Some(Box::new({
                let stored = Arc::clone(&stored);
                move |connection: Connection| {
                    let echo = connection.clone();
                    connection.on_message(move |payload| echo.send(payload)).unwrap();
                    connection
                        .on_close(move |info| {
                            let _ = closes.send(info.code);
                        })
                        .unwrap();
                    *stored.lock() = Some(connection);
                }
            })),
        };
        group.adopt(ws, None, context).unwrap();
        event_loop.barrier().await;

        drop(client);
        let code = timeout(Duration::from_secs(5), closed.recv()).await.unwrap();
        assert_eq!(code, Some(CloseInfo::ABNORMAL));
        event_loop.barrier().await;

        let connection = stored.lock().take().unwrap();
        assert!(!connection.is_open());
        assert!(!connection.remove_listener(EventKind::Message));
        assert!(!connection.remove_listener(EventKind::Close));
    }
}
