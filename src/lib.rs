//! # statecell
//!
//! Reactive value cells with tiered persistence.
//!
//! A cell is a named, process-lifetime value container that:
//!
//! - **Tracks history**: every accepted mutation moves the old value into a
//!   `previous` slot, and subscribers always see the `(value, previous)` pair
//!   from one transition.
//! - **Broadcasts**: callback subscribers get an immediate replay plus every
//!   subsequent mutation, synchronously and in registration order; async
//!   consumers can [`watch`](Cell::watch) a change stream instead.
//! - **Persists**: accepted mutations write through to a storage backend
//!   chosen by a one-time capability probe, and `init()` restores the
//!   persisted pair on the next run.
//! - **Gates**: optional deduplication and validation silently drop
//!   mutations; `reset()` bypasses both.
//!
//! ## Backends
//!
//! - [`SqliteStore`]: durable record store (default preference)
//! - [`LocalStore`]: synchronous JSON-file fallback
//! - [`SecureStore`]: AES-256-GCM encrypted store, selected exclusively when
//!   a master key is configured
//!
//! Backends fail soft: a cell's caller never sees a storage error, only an
//! absent value or an unchanged cell.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use statecell::{collection, CellOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let tags = collection(CellOptions::new("tags", Vec::<String>::new()).persist(true));
//!     tags.init().await;
//!
//!     let sub = tags.subscribe(|value, previous| {
//!         println!("tags: {:?} (was {:?})", value, previous);
//!     });
//!
//!     tags.set(vec!["a".to_string(), "b".to_string()]);
//!     tags.flush().await;
//!     sub.unsubscribe();
//! }
//! ```
//!
//! ## Gates and initialization
//!
//! ```rust,no_run
//! use statecell::{scalar, CellOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let counter = scalar(
//!         CellOptions::new("counter", 0i64)
//!             .persist(true)
//!             .dedup(true)
//!             .validate(|v| *v >= 0)
//!             .on_init(|stored, _previous, cell| async move {
//!                 if stored.is_none() {
//!                     cell.set(1); // first run
//!                 }
//!                 Ok(())
//!             }),
//!     );
//!     counter.init().await;
//!
//!     counter.set(5);
//!     counter.set(5); // duplicate: dropped, no broadcast
//!     counter.set(-1); // invalid: dropped
//!     assert_eq!(counter.get(), 5);
//! }
//! ```
//!
//! ## Module-level cells
//!
//! Cells are cheap to clone and meant to live for the process:
//!
//! ```rust,no_run
//! use statecell::{scalar, Cell, CellOptions};
//! use std::sync::OnceLock;
//!
//! fn counter() -> &'static Cell<i64> {
//!     static CELL: OnceLock<Cell<i64>> = OnceLock::new();
//!     CELL.get_or_init(|| scalar(CellOptions::new("counter", 0).persist(true)))
//! }
//! ```

pub mod backend;
pub mod cell;
pub mod equality;
pub mod error;
pub mod local;
pub mod router;
pub mod secure;
pub mod shape;
pub mod sqlite;
pub mod watch;

// Re-export main types
pub use backend::{Backend, StoredRecord, MAX_NAME_LENGTH};
pub use cell::{Cell, CellOptions, Lifecycle, Subscription, ValuePair};
pub use error::{Result, StoreError};
pub use local::LocalStore;
pub use router::{
    BackendChoice, BackendPreference, Capabilities, CapabilityResolver, PersistenceRouter,
    Platform, StorageConfig,
};
pub use secure::SecureStore;
pub use shape::{collection, document, scalar, CollectionShape, DocumentShape, ScalarShape, Shape};
pub use sqlite::SqliteStore;
pub use watch::{ChangeEvent, WatchStream};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::cell::{Cell, CellOptions, Lifecycle, Subscription, ValuePair};
    pub use crate::error::{Result, StoreError};
    pub use crate::router::{BackendPreference, CapabilityResolver, StorageConfig};
    pub use crate::shape::{collection, document, scalar};
    pub use crate::watch::ChangeEvent;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scalar_cell_basic() {
        let counter = scalar(CellOptions::new("counter", 0i64));
        counter.set(5);
        assert_eq!(counter.get(), 5);
    }

    #[tokio::test]
    async fn test_cells_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}

        assert_send_sync::<Cell<Vec<String>>>();
        assert_send_sync::<Cell<i64>>();
        assert_send_sync::<CapabilityResolver>();
    }
}
