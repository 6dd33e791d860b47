//! # gridsync: real-time sync engine for collaborative spreadsheets
//!
//! Many editors change the same grid at once over WebSockets. Edits land in a
//! shared document cache, fan out to every server with editors on the file,
//! and are written back to durable storage when the last editor leaves.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐   mutate+publish  ┌───────────────┐
//! │ Editor      │ ◄─────────────────► │ SyncServer  │ ────────────────► │ DocumentCache │
//! │ (browser)   │     JSON frames     │ (N of them) │                   └───────┬───────┘
//! └─────────────┘                     └──────┬──────┘                           │ flush on
//!                                            │ relay                            ▼ last leave
//!                                     ┌──────┴──────┐                   ┌───────────────┐
//!                                     │ Bus         │                   │ DurableStore  │
//!                                     │ (per file)  │                   └───────────────┘
//!                                     └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`grid`]: cells, matrices and the durable row-major text form
//! - [`protocol`]: JSON wire messages and bus envelopes
//! - [`cache`]: path-addressed document cache
//! - [`bus`]: per-file publish/subscribe
//! - [`registry`]: local connections, identities and bus relays
//! - [`permissions`]: server-side write checks
//! - [`store`]: durable storage (in-memory or RocksDB)
//! - [`reconciler`]: write-back and eviction
//! - [`server`]: WebSocket server and per-connection state machine

pub mod bus;
pub mod cache;
pub mod grid;
pub mod permissions;
pub mod protocol;
pub mod reconciler;
pub mod registry;
pub mod server;
pub mod store;

// Re-exports for convenience
pub use bus::{Bus, BusStats};
pub use cache::{BatchOutcome, CacheError, DocumentCache, GridLimits, Growth, HydrationError};
pub use grid::{Cell, CellUpdate, GridError, Matrix};
pub use permissions::{StaticAcl, TrustClient, WritePolicy};
pub use protocol::{BusMessage, ChatEntry, ClientMessage, ProtocolError, ServerMessage};
pub use reconciler::{FlushError, FlushOutcome, FlushPolicy, Reconciler};
pub use registry::{ConnectionId, ConnectionRegistry};
pub use server::{
    Backend, FlushReport, ServerConfig, ServerStats, Session, SessionState, SyncError, SyncServer,
};
pub use store::{DurableStore, FileMetadata, MemoryStore, RocksStore, StoreConfig, StoreError};
