//! Generic HTTP layer.
//!
//! Only request heads are read; everything after the head belongs to the
//! upgrade that claims the socket.
//!
//! | Module | Description |
//! |--------|-------------|
//! | `request` | [`UpgradeRequest`] parsing and head reading |
//! | `response` | Status responses for refused requests |
//! | `server` | [`HttpServer`] accept loop and the upgrade listener chain |

// ============================================================================
// Submodules
// ============================================================================

mod request;
mod response;
mod server;

// ============================================================================
// Re-exports
// ============================================================================

pub use request::{HEAD_TIMEOUT, MAX_HEAD_SIZE, UpgradeRequest, read_head};
pub use response::{reason_phrase, status_response, write_status};
pub use server::{HttpOptions, HttpServer, ListenerId, PendingUpgrade, UpgradeListener};
