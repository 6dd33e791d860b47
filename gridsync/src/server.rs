//! WebSocket sync server with per-file fan-out.
//!
//! Architecture:
//! ```text
//! Client A ──┐                    ┌── DocumentCache (shared)
//!            ├── SyncServer 1 ────┤
//! Client B ──┘        ▲           ├── Bus ───────────┐
//!                     │ relay     │                  ▼
//! Client C ───── SyncServer 2 ────┤            SyncServer 1, 2 relays
//!                                 └── DurableStore (flush on last leave)
//! ```
//!
//! Each connection moves through `Connected → Identified → Subscribed →
//! Closed`. Mutations are applied to the cache and published on the bus in
//! one step; every server relays bus messages to its local sockets except
//! the originating one. When the last editor of a file anywhere leaves, the
//! reconciler writes the grid back to durable storage.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::bus::Bus;
use crate::cache::{CacheError, DocumentCache, GridLimits, HydrationError};
use crate::grid::CellUpdate;
use crate::permissions::{TrustClient, WritePolicy};
use crate::protocol::{
    now_millis, BusMessage, CellUpdateRecord, ChatEntry, ChatRecord, ClientMessage, GrowthKind,
    GrowthRecord, Inbound, ProtocolError, ServerMessage, UNDEFINED_FILE_ID,
};
use crate::reconciler::{FlushOutcome, FlushPolicy, Reconciler};
use crate::registry::{ConnectionId, ConnectionRegistry, Outbound, RegistryError};
use crate::store::{DurableStore, MemoryStore, RocksStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Bus channel capacity per file
    pub broadcast_capacity: usize,
    /// Frames queued per socket before relayed messages are dropped
    pub outbound_capacity: usize,
    /// Drawing scenes smaller than this (serialized) are ignored
    pub min_drawing_bytes: usize,
    /// RocksDB directory (None = in-memory durable store)
    pub storage_path: Option<PathBuf>,
    pub flush: FlushPolicy,
    /// Most rows or columns one ROW_ADD/COL_ADD may add
    pub max_growth: usize,
    /// Bounds on the grid that growth may produce
    pub grid_limits: GridLimits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            outbound_capacity: 256,
            min_drawing_bytes: 64,
            storage_path: None,
            flush: FlushPolicy::default(),
            max_growth: 1_000,
            grid_limits: GridLimits::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub errors: u64,
    pub flushes: u64,
    pub flush_failures: u64,
}

/// Files handled by a sweep or shutdown flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Written to durable storage (or already gone from the cache).
    pub flushed: Vec<String>,
    /// Still cached without a durable copy of the latest edits.
    pub failed: Vec<String>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Cache, bus and durable store shared by every server instance of one
/// deployment.
#[derive(Clone)]
pub struct Backend {
    pub cache: Arc<DocumentCache>,
    pub bus: Arc<Bus>,
    pub store: Arc<dyn DurableStore>,
}

impl Backend {
    pub fn new(store: Arc<dyn DurableStore>, bus_capacity: usize) -> Self {
        Self::with_limits(store, bus_capacity, GridLimits::default())
    }

    pub fn with_limits(
        store: Arc<dyn DurableStore>,
        bus_capacity: usize,
        limits: GridLimits,
    ) -> Self {
        Self {
            cache: Arc::new(DocumentCache::with_limits(limits)),
            bus: Arc::new(Bus::new(bus_capacity)),
            store,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            ServerConfig::default().broadcast_capacity,
        )
    }

    /// Build the backend described by `config`.
    pub fn open(config: &ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn DurableStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig::new(path.clone()))?),
            None => {
                log::warn!("No storage path configured, flushed documents live in memory only");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::with_limits(store, config.broadcast_capacity, config.grid_limits))
    }
}

/// Errors reported to a single socket as an `ERROR` reply.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("could not load file: {0}")]
    Hydration(#[from] HydrationError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("write not permitted on {0}")]
    WriteDenied(String),
    #[error("invalid file id {0:?}")]
    InvalidFile(String),
    #[error("connection is not subscribed to {0}")]
    NotSubscribed(String),
    #[error("cell batch mixes file ids")]
    MixedBatch,
    #[error("cannot add {requested} rows or columns to {file_id} at once (limit {limit})")]
    TooLarge {
        file_id: String,
        requested: usize,
        limit: usize,
    },
    #[error("{} cell writes on {file_id} failed (indices {failed:?}), {applied} applied", .failed.len())]
    Batch {
        file_id: String,
        applied: usize,
        failed: Vec<usize>,
    },
    #[error("no drawing cached for {0}")]
    NoDrawing(String),
    #[error("connection is closed")]
    Closed,
}

impl SyncError {
    /// Stable machine-readable code sent with the `ERROR` reply.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Protocol(_) | SyncError::MixedBatch => "BAD_MESSAGE",
            SyncError::Hydration(_) => "LOAD_FAILED",
            SyncError::TooLarge { .. } | SyncError::Cache(CacheError::TooLarge { .. }) => {
                "TOO_LARGE"
            }
            SyncError::Cache(_) => "CACHE",
            SyncError::Store(_) => "STORE",
            SyncError::Registry(_) => "INTERNAL",
            SyncError::WriteDenied(_) => "WRITE_DENIED",
            SyncError::InvalidFile(_) => "INVALID_FILE",
            SyncError::NotSubscribed(_) => "NOT_SUBSCRIBED",
            SyncError::Batch { applied, .. } if *applied > 0 => "PARTIAL_BATCH",
            SyncError::Batch { .. } => "BATCH_FAILED",
            SyncError::NoDrawing(_) => "NO_DRAWING",
            SyncError::Closed => "CLOSED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Identified,
    Subscribed,
    Closed,
}

/// Per-connection state.
#[derive(Debug)]
pub struct Session {
    id: ConnectionId,
    user_id: Option<String>,
    files: HashSet<String>,
    state: SessionState,
}

impl Session {
    fn new() -> Self {
        Self {
            id: ConnectionId::new(),
            user_id: None,
            files: HashSet::new(),
            state: SessionState::Connected,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_subscribed(&self, file_id: &str) -> bool {
        self.files.contains(file_id)
    }
}

/// The sync server.
pub struct SyncServer {
    inner: Arc<Shared>,
}

struct Shared {
    config: ServerConfig,
    backend: Backend,
    registry: Arc<ConnectionRegistry>,
    reconciler: Reconciler,
    policy: Arc<dyn WritePolicy>,
    stats: RwLock<ServerStats>,
}

impl SyncServer {
    /// Create a server that trusts the client's write flag.
    pub fn new(config: ServerConfig, backend: Backend) -> Self {
        Self::with_policy(config, backend, Arc::new(TrustClient))
    }

    pub fn with_policy(
        config: ServerConfig,
        backend: Backend,
        policy: Arc<dyn WritePolicy>,
    ) -> Self {
        let registry = ConnectionRegistry::new(backend.bus.clone());
        let reconciler = Reconciler::new(
            backend.cache.clone(),
            backend.store.clone(),
            config.flush.clone(),
        );
        Self {
            inner: Arc::new(Shared {
                config,
                backend,
                registry,
                reconciler,
                policy,
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default(), Backend::in_memory())
    }

    /// Bind the configured address and serve connections forever.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.inner.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.inner.clone();
            tokio::spawn(async move {
                if let Err(e) = shared.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Register a connection whose frames are written to `outbound`.
    pub async fn open_session(&self, outbound: Outbound) -> Session {
        self.inner.open_session(outbound).await
    }

    /// Handle one inbound text frame. Returns the reply for this socket.
    pub async fn handle_text(&self, session: &mut Session, raw: &str) -> Option<String> {
        self.inner.handle_text(session, raw).await
    }

    /// Tear down a connection and flush files it was the last editor of.
    pub async fn close_session(&self, session: &mut Session) {
        self.inner.close_session(session).await
    }

    /// Flush cached grids no editor on any server still has open.
    ///
    /// Picks up grids kept warm after a failed flush.
    pub async fn sweep(&self) -> FlushReport {
        self.inner.sweep().await
    }

    /// Flush every cached grid, open sessions included. Call before the
    /// process exits.
    pub async fn shutdown(&self) -> FlushReport {
        self.inner.shutdown().await
    }

    pub async fn stats(&self) -> ServerStats {
        self.inner.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.inner.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> &Backend {
        &self.inner.backend
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.registry
    }
}

impl Shared {
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), tungstenite::Error> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let mut session = self.open_session(outbound_tx).await;
        log::info!("WebSocket connection {} established from {addr}", session.id);

        let result = self.pump(&mut session, ws_stream, outbound_rx).await;
        self.close_session(&mut session).await;
        log::info!("Connection {} from {addr} closed", session.id);
        result
    }

    async fn pump(
        &self,
        session: &mut Session,
        ws_stream: WebSocketStream<TcpStream>,
        mut outbound_rx: mpsc::Receiver<Arc<str>>,
    ) -> Result<(), tungstenite::Error> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reply) = self.handle_text(session, text.as_str()).await {
                                ws_sender.send(Message::text(reply)).await?;
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            let error = SyncError::from(ProtocolError::BinaryFrame);
                            if let Some(reply) = self.reply(session, Err(error)).await {
                                ws_sender.send(Message::text(reply)).await?;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Err(e)) => return Err(e),
                        Some(Ok(_)) => {}
                    }
                }

                Some(frame) = outbound_rx.recv() => {
                    ws_sender.send(Message::text(frame.to_string())).await?;
                }
            }
        }
    }

    async fn open_session(&self, outbound: Outbound) -> Session {
        let session = Session::new();
        self.registry.register(session.id, outbound).await;
        let mut s = self.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
        session
    }

    async fn handle_text(&self, session: &mut Session, raw: &str) -> Option<String> {
        {
            let mut s = self.stats.write().await;
            s.total_messages += 1;
            s.total_bytes += raw.len() as u64;
        }
        let result = self.dispatch(session, raw).await;
        self.reply(session, result).await
    }

    async fn reply(
        &self,
        session: &Session,
        result: Result<Option<ServerMessage>, SyncError>,
    ) -> Option<String> {
        let message = match result {
            Ok(reply) => reply?,
            Err(e) => {
                log::warn!("Rejected message on connection {}: {e}", session.id);
                self.stats.write().await.errors += 1;
                ServerMessage::error(e.code(), e.to_string())
            }
        };
        match message.encode() {
            Ok(text) => Some(text),
            Err(e) => {
                log::error!("Could not encode reply for {}: {e}", session.id);
                None
            }
        }
    }

    async fn dispatch(
        &self,
        session: &mut Session,
        raw: &str,
    ) -> Result<Option<ServerMessage>, SyncError> {
        if session.state == SessionState::Closed {
            return Err(SyncError::Closed);
        }

        match Inbound::parse(raw)? {
            Inbound::Message(message) => {
                log::trace!("{} from connection {}", message.kind(), session.id);
                self.dispatch_message(session, message, raw).await
            }
            Inbound::Batch(records) => {
                self.legacy_batch(session, &records, raw).await?;
                Ok(None)
            }
            Inbound::Single(record) => {
                self.legacy_single(session, &record, raw).await?;
                Ok(None)
            }
        }
    }

    async fn dispatch_message(
        &self,
        session: &mut Session,
        message: ClientMessage,
        raw: &str,
    ) -> Result<Option<ServerMessage>, SyncError> {
        match message {
            ClientMessage::Init { user_id, file_id } => {
                self.init(session, &user_id, &file_id).await.map(Some)
            }
            ClientMessage::Update {
                file_id,
                sender_id,
                is_write_permitted,
                updates,
            } => {
                self.prepare_write(session, is_write_permitted, &file_id)
                    .await?;
                self.apply_updates(session, &file_id, sender_id, &updates, raw)
                    .await?;
                Ok(None)
            }
            ClientMessage::RowAdd {
                file_id,
                sender_id,
                is_write_permitted,
                amount,
            } => {
                self.prepare_write(session, is_write_permitted, &file_id)
                    .await?;
                self.grow(session, GrowthKind::RowAdd, &file_id, sender_id, amount)
                    .await?;
                Ok(None)
            }
            ClientMessage::ColAdd {
                file_id,
                sender_id,
                is_write_permitted,
                amount,
            } => {
                self.prepare_write(session, is_write_permitted, &file_id)
                    .await?;
                self.grow(session, GrowthKind::ColAdd, &file_id, sender_id, amount)
                    .await?;
                Ok(None)
            }
            ClientMessage::ChatMessage {
                file_id,
                sender_id,
                sender,
                message,
            } => {
                self.chat(session, &file_id, sender_id, sender, message)
                    .await?;
                Ok(None)
            }
            ClientMessage::ChatHistory { file_id } => {
                let messages = self.backend.cache.chat_history(&file_id).await;
                Ok(Some(ServerMessage::ChatHistory { file_id, messages }))
            }
            ClientMessage::DrawingUpdate {
                file_id,
                sender_id,
                scene,
            } => {
                self.drawing_update(session, &file_id, sender_id, scene, raw)
                    .await?;
                Ok(None)
            }
            ClientMessage::GetDrawingHistory { file_id } => {
                self.drawing_history(&file_id).await.map(Some)
            }
            ClientMessage::SaveDrawing { file_id } => self.save_drawing(&file_id).await.map(Some),
            ClientMessage::VideoOffer { file_id, sender_id }
            | ClientMessage::VideoAnswer { file_id, sender_id }
            | ClientMessage::IceCandidate { file_id, sender_id } => {
                validate_file_id(&file_id)?;
                let message = self.bus_message(session, &file_id, sender_id, raw);
                self.backend.bus.publish(message).await;
                Ok(None)
            }
            ClientMessage::Unknown => {
                log::debug!("Ignoring message of unknown type from {}", session.id);
                Ok(None)
            }
        }
    }

    async fn init(
        &self,
        session: &mut Session,
        user_id: &str,
        file_id: &str,
    ) -> Result<ServerMessage, SyncError> {
        validate_file_id(file_id)?;
        let store = self.backend.store.as_ref();

        if let Some(previous) = self.registry.identify(user_id, session.id).await? {
            log::debug!("User {user_id} moved from connection {previous} to {}", session.id);
        }
        session.user_id = Some(user_id.to_string());
        if session.state == SessionState::Connected {
            session.state = SessionState::Identified;
        }

        // Load before joining so a broken file never gets a subscriber.
        self.backend.cache.hydrate(file_id, store).await?;
        self.registry.subscribe(file_id, session.id).await?;
        session.files.insert(file_id.to_string());
        session.state = SessionState::Subscribed;
        log::info!("Connection {} ({user_id}) joined {file_id}", session.id);

        // Read again after joining; an in-flight flush may have evicted it.
        let data = self.backend.cache.hydrate(file_id, store).await?;
        Ok(ServerMessage::Snapshot {
            file_id: file_id.to_string(),
            data,
        })
    }

    /// Gate for every grid mutation.
    async fn prepare_write(
        &self,
        session: &Session,
        flagged: bool,
        file_id: &str,
    ) -> Result<(), SyncError> {
        validate_file_id(file_id)?;
        if !flagged || !self.policy.can_write(session.user_id(), file_id).await {
            return Err(SyncError::WriteDenied(file_id.to_string()));
        }
        if !session.is_subscribed(file_id) {
            return Err(SyncError::NotSubscribed(file_id.to_string()));
        }
        self.backend
            .cache
            .hydrate(file_id, self.backend.store.as_ref())
            .await?;
        Ok(())
    }

    fn bus_message(
        &self,
        session: &Session,
        file_id: &str,
        sender_id: Option<String>,
        body: &str,
    ) -> BusMessage {
        BusMessage::new(file_id, session.user_id.clone().or(sender_id), body)
            .with_origin(session.id)
    }

    async fn apply_updates(
        &self,
        session: &Session,
        file_id: &str,
        sender_id: Option<String>,
        updates: &[CellUpdate],
        raw: &str,
    ) -> Result<(), SyncError> {
        let commit = self.backend.cache.apply_batch(file_id, updates).await;
        if commit.outcome().applied == 0 {
            let outcome = commit.into_outcome();
            if outcome.failures.is_empty() {
                return Ok(());
            }
            return Err(SyncError::Batch {
                file_id: file_id.to_string(),
                applied: 0,
                failed: outcome.failures.iter().map(|(i, _)| *i).collect(),
            });
        }

        let message = self.bus_message(session, file_id, sender_id, raw);
        let outcome = commit.publish(&self.backend.bus, message).await;
        if outcome.is_complete() {
            return Ok(());
        }
        for (index, error) in &outcome.failures {
            log::warn!("Cell write {index} on {file_id} failed: {error}");
        }
        Err(SyncError::Batch {
            file_id: file_id.to_string(),
            applied: outcome.applied,
            failed: outcome.failures.iter().map(|(i, _)| *i).collect(),
        })
    }

    async fn legacy_batch(
        &self,
        session: &Session,
        records: &[CellUpdateRecord],
        raw: &str,
    ) -> Result<(), SyncError> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        let file_id = first.file_id.clone().unwrap_or_default();
        if records
            .iter()
            .any(|r| r.file_id.as_deref().unwrap_or_default() != file_id)
        {
            return Err(SyncError::MixedBatch);
        }
        let permitted = records.iter().all(|r| r.is_write_permitted);
        self.prepare_write(session, permitted, &file_id).await?;

        let updates: Vec<CellUpdate> = records.iter().map(CellUpdateRecord::update).collect();
        self.apply_updates(session, &file_id, first.sender_id.clone(), &updates, raw)
            .await
    }

    async fn legacy_single(
        &self,
        session: &Session,
        record: &CellUpdateRecord,
        raw: &str,
    ) -> Result<(), SyncError> {
        let file_id = record.file_id.clone().unwrap_or_default();
        self.prepare_write(session, record.is_write_permitted, &file_id)
            .await?;
        let commit = self
            .backend
            .cache
            .set_cell(&file_id, &record.update())
            .await?;
        let message = self.bus_message(session, &file_id, record.sender_id.clone(), raw);
        commit.publish(&self.backend.bus, message).await;
        Ok(())
    }

    async fn grow(
        &self,
        session: &Session,
        kind: GrowthKind,
        file_id: &str,
        sender_id: Option<String>,
        amount: usize,
    ) -> Result<(), SyncError> {
        if amount == 0 {
            return Ok(());
        }
        if amount > self.config.max_growth {
            return Err(SyncError::TooLarge {
                file_id: file_id.to_string(),
                requested: amount,
                limit: self.config.max_growth,
            });
        }
        let cache = &self.backend.cache;
        let commit = match kind {
            GrowthKind::RowAdd => cache.append_rows(file_id, amount).await?,
            GrowthKind::ColAdd => cache.append_columns(file_id, amount).await?,
        };
        let growth = *commit.outcome();
        let sender_id = session.user_id.clone().or(sender_id);
        let record = GrowthRecord {
            kind,
            file_id: file_id.to_string(),
            sender_id: sender_id.clone(),
            start_index: growth.start_index,
            amount: growth.amount,
        };
        let message = BusMessage::json(file_id, sender_id, &record)?.with_origin(session.id);
        commit.publish(&self.backend.bus, message).await;
        log::debug!("{kind:?} x{amount} on {file_id} at {}", growth.start_index);
        Ok(())
    }

    async fn chat(
        &self,
        session: &Session,
        file_id: &str,
        sender_id: Option<String>,
        sender: Option<String>,
        message: String,
    ) -> Result<(), SyncError> {
        validate_file_id(file_id)?;
        let display = sender
            .or_else(|| sender_id.clone())
            .or_else(|| session.user_id.clone())
            .unwrap_or_else(|| "anonymous".to_string());
        let entry = ChatEntry {
            sender: display,
            message,
            timestamp: now_millis(),
        };
        let record = ChatRecord::new(file_id, entry.clone());
        let bus_message =
            BusMessage::json(file_id, session.user_id.clone().or(sender_id), &record)?
                .with_origin(session.id);

        let commit = self.backend.cache.append_chat(file_id, &entry).await?;
        commit.publish(&self.backend.bus, bus_message).await;
        Ok(())
    }

    async fn drawing_update(
        &self,
        session: &Session,
        file_id: &str,
        sender_id: Option<String>,
        scene: Value,
        raw: &str,
    ) -> Result<(), SyncError> {
        validate_file_id(file_id)?;
        let size = serde_json::to_vec(&scene)
            .map_err(ProtocolError::from)?
            .len();
        if size < self.config.min_drawing_bytes {
            log::debug!("Ignoring {size}-byte drawing update on {file_id}");
            return Ok(());
        }
        let message = self.bus_message(session, file_id, sender_id, raw);
        self.backend
            .cache
            .set_drawing(file_id, scene)
            .await
            .publish(&self.backend.bus, message)
            .await;
        Ok(())
    }

    async fn drawing_history(&self, file_id: &str) -> Result<ServerMessage, SyncError> {
        let cache = &self.backend.cache;
        let scene = match cache.drawing(file_id).await {
            Some(scene) => Some(scene),
            None => match self.backend.store.read_drawing(file_id).await? {
                Some(scene) => {
                    cache.warm_drawing(file_id, scene.clone()).await;
                    Some(scene)
                }
                None => None,
            },
        };
        Ok(ServerMessage::DrawingHistory {
            file_id: file_id.to_string(),
            scene,
        })
    }

    async fn save_drawing(&self, file_id: &str) -> Result<ServerMessage, SyncError> {
        let scene = self
            .backend
            .cache
            .drawing(file_id)
            .await
            .ok_or_else(|| SyncError::NoDrawing(file_id.to_string()))?;
        self.backend.store.write_drawing(file_id, &scene).await?;
        log::info!("Saved drawing for {file_id}");
        Ok(ServerMessage::DrawingSaved {
            file_id: file_id.to_string(),
        })
    }

    async fn close_session(&self, session: &mut Session) {
        if session.state == SessionState::Closed {
            return;
        }
        session.state = SessionState::Closed;
        session.files.clear();

        let releases = self.registry.unsubscribe(session.id).await;
        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        for release in releases.into_iter().filter(|r| r.now_empty) {
            let file_id = release.file_id;
            let remaining = self.backend.bus.subscriber_count(&file_id).await;
            if remaining > 0 {
                log::debug!("{file_id} still has editors on {remaining} other servers");
                continue;
            }
            self.flush(&file_id).await;
        }
    }

    /// Reconcile one file. Returns `false` if the latest edits are still
    /// only in the cache.
    async fn flush(&self, file_id: &str) -> bool {
        match self.reconciler.reconcile(file_id).await {
            Ok(FlushOutcome::Flushed { .. }) => {
                self.stats.write().await.flushes += 1;
                true
            }
            Ok(FlushOutcome::NotCached) => true,
            Ok(FlushOutcome::AlreadyRunning) => {
                log::debug!("Flush of {file_id} already in progress");
                false
            }
            Err(e) => {
                log::error!("Flush of {file_id} failed: {e}");
                self.stats.write().await.flush_failures += 1;
                false
            }
        }
    }

    async fn flush_all(&self, file_ids: Vec<String>) -> FlushReport {
        let mut report = FlushReport::default();
        for file_id in file_ids {
            if self.flush(&file_id).await {
                report.flushed.push(file_id);
            } else {
                report.failed.push(file_id);
            }
        }
        report
    }

    async fn sweep(&self) -> FlushReport {
        let mut idle = Vec::new();
        for file_id in self.backend.cache.file_ids().await {
            if self.registry.local_count(&file_id).await == 0
                && self.backend.bus.subscriber_count(&file_id).await == 0
            {
                idle.push(file_id);
            }
        }
        if !idle.is_empty() {
            log::info!("Sweeping {} idle cached grids", idle.len());
        }
        self.flush_all(idle).await
    }

    async fn shutdown(&self) -> FlushReport {
        let file_ids = self.backend.cache.file_ids().await;
        log::info!("Flushing {} cached grids before shutdown", file_ids.len());
        let report = self.flush_all(file_ids).await;
        for file_id in &report.failed {
            log::error!("{file_id} was not flushed; its latest edits may be lost on exit");
        }
        report
    }
}

fn validate_file_id(file_id: &str) -> Result<(), SyncError> {
    if file_id.is_empty() || file_id == UNDEFINED_FILE_ID {
        return Err(SyncError::InvalidFile(file_id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::StaticAcl;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    const FILE: &str = "u1_sheet";

    async fn setup() -> (SyncServer, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.seed(FILE, "1,2\n3,4").await;
        let server = SyncServer::new(ServerConfig::default(), Backend::new(store.clone(), 64));
        (server, store)
    }

    async fn connect(server: &SyncServer) -> (Session, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(32);
        (server.open_session(tx).await, rx)
    }

    async fn joined(server: &SyncServer, user: &str) -> (Session, mpsc::Receiver<Arc<str>>) {
        let (mut session, rx) = connect(server).await;
        let reply = server
            .handle_text(&mut session, &init(user, FILE))
            .await
            .unwrap();
        assert_eq!(json_of(&reply)["type"], "SNAPSHOT");
        (session, rx)
    }

    fn init(user: &str, file: &str) -> String {
        json!({"type": "INIT", "userId": user, "fileId": file}).to_string()
    }

    fn json_of(text: &str) -> Value {
        serde_json::from_str(text).unwrap()
    }

    fn error_code(reply: Option<String>) -> String {
        let v = json_of(&reply.expect("expected a reply"));
        assert_eq!(v["type"], "ERROR");
        v["code"].as_str().unwrap().to_string()
    }

    async fn recv(rx: &mut mpsc::Receiver<Arc<str>>) -> Option<Value> {
        timeout(Duration::from_millis(200), rx.recv())
            .await
            .ok()
            .flatten()
            .map(|frame| json_of(&frame))
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.min_drawing_bytes, 64);
        assert!(config.storage_path.is_none());
        assert_eq!(config.flush.max_attempts, 5);
        assert_eq!(config.max_growth, 1_000);
        assert_eq!(config.grid_limits, GridLimits::default());
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert_eq!(server.stats().await, ServerStats::default());
    }

    #[tokio::test]
    async fn test_init_sends_snapshot_and_subscribes() {
        let (server, _) = setup().await;
        let (mut session, _rx) = connect(&server).await;
        assert_eq!(session.state(), SessionState::Connected);

        let reply = server.handle_text(&mut session, &init("u1", FILE)).await.unwrap();
        assert_eq!(
            json_of(&reply),
            json!({"type": "SNAPSHOT", "fileId": FILE, "data": [["1", "2"], ["3", "4"]]})
        );
        assert_eq!(session.state(), SessionState::Subscribed);
        assert_eq!(session.user_id(), Some("u1"));
        assert_eq!(server.registry().local_count(FILE).await, 1);
    }

    #[tokio::test]
    async fn test_init_failures() {
        let (server, _) = setup().await;
        let (mut session, _rx) = connect(&server).await;

        let reply = server.handle_text(&mut session, &init("u1", "u1_missing")).await;
        assert_eq!(error_code(reply), "LOAD_FAILED");
        assert!(!session.is_subscribed("u1_missing"));
        assert_eq!(server.registry().local_count("u1_missing").await, 0);
        assert!(!server.backend().cache.contains("u1_missing").await);

        let reply = server.handle_text(&mut session, &init("u1", "undefined")).await;
        assert_eq!(error_code(reply), "INVALID_FILE");
    }

    #[tokio::test]
    async fn test_update_fans_out_without_echo() {
        let (server, _) = setup().await;
        let (mut a, mut rx_a) = joined(&server, "alice").await;
        let (_b, mut rx_b) = joined(&server, "bob").await;

        let update = json!({
            "type": "UPDATE", "fileId": FILE, "senderId": "alice", "isWritePermitted": true,
            "updates": [{"row": 0, "col": 0, "value": "5"}]
        });
        assert!(server.handle_text(&mut a, &update.to_string()).await.is_none());

        assert_eq!(recv(&mut rx_b).await, Some(update));
        assert_eq!(recv(&mut rx_a).await, None);
        let grid = server.backend().cache.read(FILE).await.unwrap().unwrap();
        assert_eq!(grid[0][0].to_string(), "5");
    }

    #[tokio::test]
    async fn test_write_gates() {
        let (server, _) = setup().await;
        let (mut a, _rx) = joined(&server, "alice").await;
        let (mut outsider, _rx2) = connect(&server).await;

        let denied = json!({"type": "ROW_ADD", "fileId": FILE, "isWritePermitted": false});
        assert_eq!(
            error_code(server.handle_text(&mut a, &denied.to_string()).await),
            "WRITE_DENIED"
        );

        let undefined = json!({"type": "ROW_ADD", "fileId": "undefined", "isWritePermitted": true});
        assert_eq!(
            error_code(server.handle_text(&mut a, &undefined.to_string()).await),
            "INVALID_FILE"
        );

        let allowed = json!({"type": "ROW_ADD", "fileId": FILE, "isWritePermitted": true});
        assert_eq!(
            error_code(server.handle_text(&mut outsider, &allowed.to_string()).await),
            "NOT_SUBSCRIBED"
        );
        assert_eq!(server.backend().cache.read(FILE).await.unwrap().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_policy_rechecks_flag() {
        let store = Arc::new(MemoryStore::new());
        store.seed(FILE, "a").await;
        let acl = Arc::new(StaticAcl::new());
        let server = SyncServer::with_policy(
            ServerConfig::default(),
            Backend::new(store, 64),
            acl.clone(),
        );
        let (mut guest, _rx) = joined(&server, "guest").await;
        let update = json!({
            "type": "UPDATE", "fileId": FILE, "isWritePermitted": true,
            "updates": [{"row": 0, "col": 0, "value": "hacked"}]
        })
        .to_string();

        assert_eq!(
            error_code(server.handle_text(&mut guest, &update).await),
            "WRITE_DENIED"
        );
        acl.grant(FILE, "guest").await;
        assert!(server.handle_text(&mut guest, &update).await.is_none());
    }

    #[tokio::test]
    async fn test_partial_batch_still_publishes() {
        let (server, _) = setup().await;
        let (mut a, _rx_a) = joined(&server, "alice").await;
        let (_b, mut rx_b) = joined(&server, "bob").await;

        let batch = json!([
            {"row": 0, "col": 0, "value": "x", "fileId": FILE, "isWritePermitted": true},
            {"row": 9, "col": 0, "value": "y", "fileId": FILE, "isWritePermitted": true}
        ]);
        let reply = server.handle_text(&mut a, &batch.to_string()).await;
        assert_eq!(error_code(reply), "PARTIAL_BATCH");
        assert_eq!(recv(&mut rx_b).await, Some(batch));

        let out_of_bounds = json!([
            {"row": 9, "col": 9, "value": "z", "fileId": FILE, "isWritePermitted": true}
        ]);
        let reply = server.handle_text(&mut a, &out_of_bounds.to_string()).await;
        assert_eq!(error_code(reply), "BATCH_FAILED");
        assert_eq!(recv(&mut rx_b).await, None);
    }

    #[tokio::test]
    async fn test_legacy_shapes() {
        let (server, _) = setup().await;
        let (mut a, _rx_a) = joined(&server, "alice").await;

        let single = json!({"row": 1, "col": 1, "value": 8, "fileId": FILE, "isWritePermitted": true});
        assert!(server.handle_text(&mut a, &single.to_string()).await.is_none());
        let grid = server.backend().cache.read(FILE).await.unwrap().unwrap();
        assert_eq!(grid[1][1].to_string(), "8");

        let mixed = json!([
            {"row": 0, "col": 0, "value": "x", "fileId": FILE, "isWritePermitted": true},
            {"row": 0, "col": 0, "value": "x", "fileId": "u1_other", "isWritePermitted": true}
        ]);
        assert_eq!(
            error_code(server.handle_text(&mut a, &mixed.to_string()).await),
            "BAD_MESSAGE"
        );
        assert!(server.handle_text(&mut a, "[]").await.is_none());
    }

    #[tokio::test]
    async fn test_growth_broadcast() {
        let (server, _) = setup().await;
        let (mut a, _rx_a) = joined(&server, "alice").await;
        let (_b, mut rx_b) = joined(&server, "bob").await;

        let col_add = json!({"type": "COL_ADD", "fileId": FILE, "isWritePermitted": true});
        assert!(server.handle_text(&mut a, &col_add.to_string()).await.is_none());
        assert_eq!(
            recv(&mut rx_b).await,
            Some(json!({"type": "COL_ADD", "fileId": FILE, "senderId": "alice", "startIndex": 2, "amount": 1}))
        );

        let none = json!({"type": "ROW_ADD", "fileId": FILE, "isWritePermitted": true, "amount": 0});
        assert!(server.handle_text(&mut a, &none.to_string()).await.is_none());
        assert_eq!(recv(&mut rx_b).await, None);

        let grid = server.backend().cache.read(FILE).await.unwrap().unwrap();
        assert_eq!(grid.len(), 2);
        assert!(grid.iter().all(|row| row.len() == 3));
    }

    #[tokio::test]
    async fn test_chat_and_history() {
        let (server, _) = setup().await;
        let (mut a, _rx_a) = joined(&server, "alice").await;
        let (mut b, mut rx_b) = joined(&server, "bob").await;

        let chat = json!({"type": "CHAT_MESSAGE", "fileId": FILE, "sender": "Alice", "message": "hi"});
        assert!(server.handle_text(&mut a, &chat.to_string()).await.is_none());

        let relayed = recv(&mut rx_b).await.unwrap();
        assert_eq!(relayed["type"], "CHAT_MESSAGE");
        assert_eq!(relayed["sender"], "Alice");
        assert!(relayed["timestamp"].as_u64().unwrap() > 0);

        let history = json!({"type": "CHAT_HISTORY", "fileId": FILE}).to_string();
        let reply = json_of(&server.handle_text(&mut b, &history).await.unwrap());
        assert_eq!(reply["type"], "CHAT_HISTORY");
        assert_eq!(reply["messages"][0]["message"], "hi");
        assert_eq!(recv(&mut rx_b).await, None);
    }

    #[tokio::test]
    async fn test_drawing_lifecycle() {
        let (server, store) = setup().await;
        let (mut a, _rx_a) = joined(&server, "alice").await;
        let (_b, mut rx_b) = joined(&server, "bob").await;

        let tiny = json!({"type": "DRAWING_UPDATE", "fileId": FILE, "scene": {}});
        assert!(server.handle_text(&mut a, &tiny.to_string()).await.is_none());
        assert_eq!(recv(&mut rx_b).await, None);
        assert!(server.backend().cache.drawing(FILE).await.is_none());

        let save = json!({"type": "SAVE_DRAWING", "fileId": FILE}).to_string();
        assert_eq!(error_code(server.handle_text(&mut a, &save).await), "NO_DRAWING");

        let scene = json!({"elements": [{"id": "rect-1", "type": "rectangle", "x": 10, "y": 20}]});
        let update = json!({"type": "DRAWING_UPDATE", "fileId": FILE, "scene": scene});
        assert!(server.handle_text(&mut a, &update.to_string()).await.is_none());
        assert_eq!(recv(&mut rx_b).await, Some(update));

        let reply = json_of(&server.handle_text(&mut a, &save).await.unwrap());
        assert_eq!(reply["type"], "DRAWING_SAVED");
        assert_eq!(store.read_drawing(FILE).await.unwrap(), Some(scene));
    }

    #[tokio::test]
    async fn test_drawing_history_falls_back_to_store() {
        let (server, store) = setup().await;
        let (mut a, _rx) = joined(&server, "alice").await;
        let request = json!({"type": "GET_DRAWING_HISTORY", "fileId": FILE}).to_string();

        let reply = json_of(&server.handle_text(&mut a, &request).await.unwrap());
        assert_eq!(reply, json!({"type": "DRAWING_HISTORY", "fileId": FILE, "scene": null}));

        store.write_drawing(FILE, &json!({"saved": true})).await.unwrap();
        let reply = json_of(&server.handle_text(&mut a, &request).await.unwrap());
        assert_eq!(reply["scene"], json!({"saved": true}));
        assert_eq!(
            server.backend().cache.drawing(FILE).await,
            Some(json!({"saved": true}))
        );
    }

    #[tokio::test]
    async fn test_signaling_is_relayed_verbatim() {
        let (server, _) = setup().await;
        let (mut a, mut rx_a) = joined(&server, "alice").await;
        let (_b, mut rx_b) = joined(&server, "bob").await;

        let offer = json!({"type": "VIDEO_OFFER", "fileId": FILE, "senderId": "alice", "sdp": "v=0"});
        assert!(server.handle_text(&mut a, &offer.to_string()).await.is_none());
        assert_eq!(recv(&mut rx_b).await, Some(offer));
        assert_eq!(recv(&mut rx_a).await, None);
    }

    #[tokio::test]
    async fn test_bad_and_unknown_messages() {
        let (server, _) = setup().await;
        let (mut a, _rx) = joined(&server, "alice").await;

        assert_eq!(error_code(server.handle_text(&mut a, "{oops").await), "BAD_MESSAGE");
        assert!(server
            .handle_text(&mut a, r#"{"type":"CURSOR","fileId":"u1_sheet"}"#)
            .await
            .is_none());
        assert_eq!(server.stats().await.errors, 1);
        assert_eq!(a.state(), SessionState::Subscribed);
    }

    #[tokio::test]
    async fn test_last_close_flushes_and_evicts() {
        let (server, store) = setup().await;
        let (mut a, _rx_a) = joined(&server, "alice").await;
        let (mut b, _rx_b) = joined(&server, "bob").await;
        let update = json!({
            "type": "UPDATE", "fileId": FILE, "isWritePermitted": true,
            "updates": [{"row": 1, "col": 0, "value": "x,y"}]
        });
        server.handle_text(&mut a, &update.to_string()).await;

        server.close_session(&mut a).await;
        assert_eq!(store.write_count(), 0);
        assert!(server.backend().cache.contains(FILE).await);

        server.close_session(&mut b).await;
        assert_eq!(store.file_text(FILE).await.as_deref(), Some("1,2\n\"x,y\",4"));
        assert!(!server.backend().cache.contains(FILE).await);

        let stats = server.stats().await;
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_connections, 2);
        assert_eq!(b.state(), SessionState::Closed);

        let reply = server.handle_text(&mut b, &init("bob", FILE)).await;
        assert_eq!(error_code(reply), "CLOSED");
    }

    #[tokio::test]
    async fn test_flush_waits_for_other_servers() {
        let store = Arc::new(MemoryStore::new());
        store.seed(FILE, "1").await;
        let backend = Backend::new(store.clone(), 64);
        let left = SyncServer::new(ServerConfig::default(), backend.clone());
        let right = SyncServer::new(ServerConfig::default(), backend);

        let (mut a, _rx_a) = joined(&left, "alice").await;
        let (mut b, _rx_b) = joined(&right, "bob").await;

        left.close_session(&mut a).await;
        assert_eq!(store.write_count(), 0);
        assert!(right.backend().cache.contains(FILE).await);

        right.close_session(&mut b).await;
        assert_eq!(store.write_count(), 1);
        assert!(!left.backend().cache.contains(FILE).await);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_cache_warm() {
        let store = Arc::new(MemoryStore::new());
        store.seed(FILE, "1").await;
        let config = ServerConfig {
            flush: FlushPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                evict_on_failure: false,
            },
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config, Backend::new(store.clone(), 64));
        let (mut a, _rx) = joined(&server, "alice").await;

        store.fail_next_writes(5);
        server.close_session(&mut a).await;
        assert!(server.backend().cache.contains(FILE).await);
        assert_eq!(server.stats().await.flush_failures, 1);
    }

    #[tokio::test]
    async fn test_oversized_growth_is_rejected() {
        let (server, _) = setup().await;
        let (mut a, _rx_a) = joined(&server, "alice").await;
        let (_b, mut rx_b) = joined(&server, "bob").await;
        let before = server.backend().cache.read(FILE).await.unwrap();

        for kind in ["ROW_ADD", "COL_ADD"] {
            let huge = json!({"type": kind, "fileId": FILE, "isWritePermitted": true, "amount": u64::MAX});
            let reply = server.handle_text(&mut a, &huge.to_string()).await;
            assert_eq!(error_code(reply), "TOO_LARGE");
        }
        assert_eq!(recv(&mut rx_b).await, None);
        assert_eq!(server.backend().cache.read(FILE).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_growth_stops_at_grid_limits() {
        let store = Arc::new(MemoryStore::new());
        store.seed(FILE, "1,2\n3,4").await;
        let limits = GridLimits {
            max_rows: 3,
            ..GridLimits::default()
        };
        let server = SyncServer::new(
            ServerConfig::default(),
            Backend::with_limits(store, 64, limits),
        );
        let (mut a, _rx) = joined(&server, "alice").await;

        let one = json!({"type": "ROW_ADD", "fileId": FILE, "isWritePermitted": true});
        assert!(server.handle_text(&mut a, &one.to_string()).await.is_none());
        let reply = server.handle_text(&mut a, &one.to_string()).await;
        assert_eq!(error_code(reply), "TOO_LARGE");
        assert_eq!(server.backend().cache.read(FILE).await.unwrap().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_open_sessions() {
        let (server, store) = setup().await;
        let (mut a, _rx) = joined(&server, "alice").await;
        let update = json!({
            "type": "UPDATE", "fileId": FILE, "isWritePermitted": true,
            "updates": [{"row": 0, "col": 1, "value": "kept"}]
        });
        server.handle_text(&mut a, &update.to_string()).await;

        let report = server.shutdown().await;
        assert!(report.is_clean());
        assert_eq!(report.flushed, vec![FILE.to_string()]);
        assert_eq!(store.file_text(FILE).await.as_deref(), Some("1,kept\n3,4"));
        assert!(!server.backend().cache.contains(FILE).await);
        assert_eq!(a.state(), SessionState::Subscribed);
    }

    #[tokio::test]
    async fn test_shutdown_reports_unflushed_grids() {
        let store = Arc::new(MemoryStore::new());
        store.seed(FILE, "1").await;
        let config = ServerConfig {
            flush: FlushPolicy {
                max_attempts: 1,
                initial_backoff: Duration::from_millis(1),
                evict_on_failure: false,
            },
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config, Backend::new(store.clone(), 64));
        let (_a, _rx) = joined(&server, "alice").await;

        store.fail_next_writes(1);
        let report = server.shutdown().await;
        assert_eq!(report.failed, vec![FILE.to_string()]);
        assert!(server.backend().cache.contains(FILE).await);
    }

    #[tokio::test]
    async fn test_sweep_retries_warm_grids() {
        let store = Arc::new(MemoryStore::new());
        store.seed(FILE, "1").await;
        store.seed("u1_open", "2").await;
        let config = ServerConfig {
            flush: FlushPolicy {
                max_attempts: 1,
                initial_backoff: Duration::from_millis(1),
                evict_on_failure: false,
            },
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config, Backend::new(store.clone(), 64));
        let (mut a, _rx_a) = joined(&server, "alice").await;
        let (mut b, _rx_b) = connect(&server).await;
        server.handle_text(&mut b, &init("bob", "u1_open")).await;

        store.fail_next_writes(1);
        server.close_session(&mut a).await;
        assert!(server.backend().cache.contains(FILE).await);

        let report = server.sweep().await;
        assert_eq!(report.flushed, vec![FILE.to_string()]);
        assert!(!server.backend().cache.contains(FILE).await);
        assert_eq!(store.file_text(FILE).await.as_deref(), Some("1"));
        // Grids with editors are left alone.
        assert!(server.backend().cache.contains("u1_open").await);
        assert_eq!(server.stats().await.flushes, 1);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(SyncError::MixedBatch.code(), "BAD_MESSAGE");
        assert_eq!(
            SyncError::Batch { file_id: "f".into(), applied: 1, failed: vec![2] }.code(),
            "PARTIAL_BATCH"
        );
        assert_eq!(SyncError::InvalidFile("".into()).code(), "INVALID_FILE");
        assert_eq!(
            SyncError::TooLarge { file_id: "f".into(), requested: 9, limit: 1 }.code(),
            "TOO_LARGE"
        );
        assert_eq!(
            SyncError::Cache(CacheError::TooLarge { key: "f".into(), rows: 1, columns: 1 }).code(),
            "TOO_LARGE"
        );
        assert_eq!(
            SyncError::from(ProtocolError::BinaryFrame).code(),
            "BAD_MESSAGE"
        );
    }
}
