//! Type-safe engine handles.
//!
//! Handles are allocated from process-wide monotonic counters and are never
//! reused, so a stale handle can only ever miss in the engine tables, never
//! alias a newer socket.
//!
//! | Type | Identifies |
//! |------|------------|
//! | [`ConnHandle`] | One engine-side connection record |
//! | [`GroupHandle`] | One engine-side group |
//! | [`TicketId`] | One socket transfer |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Counters
// ============================================================================

static NEXT_CONN: AtomicU64 = AtomicU64::new(1);
static NEXT_GROUP: AtomicU64 = AtomicU64::new(1);
static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Macro
// ============================================================================

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident, $counter:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Allocates the next unused handle.
            #[inline]
            #[must_use]
            pub fn next() -> Self {
                Self($counter.fetch_add(1, Ordering::Relaxed))
            }

            /// Returns the raw numeric value.
            #[inline]
            #[must_use]
            pub const fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

define_handle!(
    /// Opaque handle of an engine connection record.
    ConnHandle,
    NEXT_CONN,
    "conn"
);

define_handle!(
    /// Opaque handle of an engine group.
    GroupHandle,
    NEXT_GROUP,
    "group"
);

define_handle!(
    /// Identifier of a single socket transfer.
    TicketId,
    NEXT_TICKET,
    "ticket"
);

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_unique() {
        let a = ConnHandle::next();
        let b = ConnHandle::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_display_prefix() {
        let group = GroupHandle::next();
        assert!(group.to_string().starts_with("group-"));

        let ticket = TicketId::next();
        assert_eq!(ticket.to_string(), format!("ticket-{}", ticket.as_u64()));
    }
}
