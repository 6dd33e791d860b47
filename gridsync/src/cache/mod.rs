//! Shared document cache.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  Commit (holds lock)   ┌──────────────────────────────┐
//! │ SyncServer A │ ─────────────────────► │ KvStore                      │
//! └──────────────┘                        │  "<fileId>"         grid     │
//! ┌──────────────┐                        │  "drawing:<fileId>" scene    │
//! │ SyncServer B │ ─────────────────────► │  "chat:<fileId>"    last 100 │
//! └──────────────┘                        └──────────────────────────────┘
//! ```
//!
//! The cache is the source of truth while any editor is connected. It is
//! hydrated from the durable store on first use and evicted by the
//! reconciler after a confirmed flush.
//!
//! Every mutation returns a [`Commit`] that keeps the store locked until it
//! is published or dropped, so a mutation and its fan-out are one step.

pub mod kv;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::bus::Bus;
use crate::grid::{self, Cell, CellUpdate, GridError, Matrix, DEFAULT_COLUMN_COUNT};
use crate::protocol::{BusMessage, ChatEntry, CHAT_HISTORY_LIMIT};
use crate::store::{self, DurableStore, StoreError};

pub use kv::{Command, JsonPath, KvStore, Pipeline, Reply, Txn};

/// Errors from cache commands.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("no cached value for key {0}")]
    NoSuchKey(String),
    #[error("path {path} does not exist in {key}")]
    PathNotFound { key: String, path: String },
    #[error("path {path} in {key} has the wrong type")]
    WrongType { key: String, path: String },
    #[error("cached value for {key} is not a grid: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("growing {key} to {rows}x{columns} exceeds the grid limits")]
    TooLarge {
        key: String,
        rows: usize,
        columns: usize,
    },
}

/// Errors from first-load population of the cache.
#[derive(Debug, Error)]
pub enum HydrationError {
    #[error("no durable content for file {0}")]
    Missing(String),
    #[error("durable content for file {file_id} is malformed: {source}")]
    Malformed {
        file_id: String,
        #[source]
        source: GridError,
    },
    #[error("durable content for file {file_id} is not UTF-8")]
    NotUtf8 { file_id: String },
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// The cached JSON form of a grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedGrid {
    pub data: Matrix,
}

/// Result of applying a batch of cell writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub applied: usize,
    /// Index into the batch and the reason that write failed.
    pub failures: Vec<(usize, CacheError)>,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn is_partial(&self) -> bool {
        self.applied > 0 && !self.failures.is_empty()
    }
}

/// Largest grid structural growth may produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridLimits {
    pub max_rows: usize,
    pub max_columns: usize,
    pub max_cells: usize,
}

impl Default for GridLimits {
    fn default() -> Self {
        Self {
            max_rows: 100_000,
            max_columns: 1_024,
            max_cells: 5_000_000,
        }
    }
}

impl GridLimits {
    /// Check a grid about to grow to `rows` x `columns`. Only the grown
    /// dimension is bounded on its own; the cell count always is.
    fn check_growth(
        &self,
        key: &str,
        rows: usize,
        columns: usize,
        grown: GrowthAxis,
    ) -> Result<(), CacheError> {
        let over_axis = match grown {
            GrowthAxis::Rows => rows > self.max_rows,
            GrowthAxis::Columns => columns > self.max_columns,
        };
        if over_axis || rows.saturating_mul(columns) > self.max_cells {
            return Err(CacheError::TooLarge {
                key: key.to_string(),
                rows,
                columns,
            });
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum GrowthAxis {
    Rows,
    Columns,
}

/// Result of a structural growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Growth {
    /// Index of the first new row or column.
    pub start_index: usize,
    pub amount: usize,
}

/// A mutation that has been applied but not yet released.
///
/// Other cache clients are blocked until this is dropped or published.
pub struct Commit<'a, T> {
    txn: Txn<'a>,
    outcome: T,
}

impl<'a, T> Commit<'a, T> {
    pub fn outcome(&self) -> &T {
        &self.outcome
    }

    /// Publish `message` while the mutation is still exclusive, then release.
    pub async fn publish(self, bus: &Bus, message: BusMessage) -> T {
        let delivered = bus.publish(message).await;
        log::trace!("Committed mutation fanned out to {delivered} subscribers");
        drop(self.txn);
        self.outcome
    }

    /// Release without publishing.
    pub fn into_outcome(self) -> T {
        self.outcome
    }
}

const DRAWING_PREFIX: &str = "drawing:";
const CHAT_PREFIX: &str = "chat:";

/// Path-addressed document cache keyed by file identifier.
#[derive(Default)]
pub struct DocumentCache {
    kv: KvStore,
    limits: GridLimits,
}

impl DocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: GridLimits) -> Self {
        Self {
            kv: KvStore::new(),
            limits,
        }
    }

    pub fn limits(&self) -> &GridLimits {
        &self.limits
    }

    pub fn document_key(file_id: &str) -> String {
        file_id.to_string()
    }

    pub fn drawing_key(file_id: &str) -> String {
        format!("{DRAWING_PREFIX}{file_id}")
    }

    pub fn chat_key(file_id: &str) -> String {
        format!("{CHAT_PREFIX}{file_id}")
    }

    /// Files with a cached grid.
    pub async fn file_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .kv
            .keys()
            .await
            .into_iter()
            .filter(|key| !key.starts_with(DRAWING_PREFIX) && !key.starts_with(CHAT_PREFIX))
            .collect();
        ids.sort();
        ids
    }

    /// Access to the underlying store.
    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    pub async fn contains(&self, file_id: &str) -> bool {
        self.kv.exists(&Self::document_key(file_id)).await
    }

    /// Return the cached grid, loading it from `store` on a miss.
    ///
    /// When two callers race on a miss, the first write wins and both
    /// return the cached value.
    pub async fn hydrate(
        &self,
        file_id: &str,
        store: &dyn DurableStore,
    ) -> Result<Matrix, HydrationError> {
        if let Some(matrix) = self.read(file_id).await? {
            return Ok(matrix);
        }

        let owner = store::owner_of(file_id);
        let bytes = match store.read_file(owner, file_id).await {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound(_)) => {
                return Err(HydrationError::Missing(file_id.to_string()))
            }
            Err(e) => return Err(HydrationError::Store(e)),
        };
        let text = String::from_utf8(bytes).map_err(|_| HydrationError::NotUtf8 {
            file_id: file_id.to_string(),
        })?;
        let data = grid::parse_text(&text).map_err(|source| HydrationError::Malformed {
            file_id: file_id.to_string(),
            source,
        })?;
        let value = encode_grid(&data);

        let key = Self::document_key(file_id);
        let mut txn = self.kv.begin().await;
        if txn.set_if_absent(&key, value) {
            log::info!(
                "Hydrated {file_id} from durable storage ({} rows)",
                data.len()
            );
            return Ok(data);
        }
        let existing = txn
            .get(&key, &JsonPath::root())
            .cloned()
            .ok_or_else(|| CacheError::NoSuchKey(key.clone()))?;
        drop(txn);
        Ok(decode_grid(&key, existing)?)
    }

    /// Write one cell: `$.data[row][col] = value`.
    pub async fn set_cell(
        &self,
        file_id: &str,
        update: &CellUpdate,
    ) -> Result<Commit<'_, ()>, CacheError> {
        let key = Self::document_key(file_id);
        let mut txn = self.kv.begin().await;
        txn.set(&key, &JsonPath::cell(update.row, update.col), cell_value(&update.value))?;
        Ok(Commit { txn, outcome: () })
    }

    /// Apply every write in one pipelined round trip.
    ///
    /// Writes are independent: a failing write (missing document, out of
    /// bounds) leaves the others applied.
    pub async fn apply_batch(
        &self,
        file_id: &str,
        updates: &[CellUpdate],
    ) -> Commit<'_, BatchOutcome> {
        let key = Self::document_key(file_id);
        let pipeline: Pipeline = updates
            .iter()
            .map(|u| Command::set(key.clone(), JsonPath::cell(u.row, u.col), cell_value(&u.value)))
            .collect();

        let mut txn = self.kv.begin().await;
        let mut outcome = BatchOutcome::default();
        for (index, result) in pipeline.run(&mut txn).into_iter().enumerate() {
            match result {
                Ok(_) => outcome.applied += 1,
                Err(e) => outcome.failures.push((index, e)),
            }
        }
        Commit { txn, outcome }
    }

    /// Append `amount` rows as wide as row 0 (or [`DEFAULT_COLUMN_COUNT`]
    /// when the grid has no rows).
    pub async fn append_rows(
        &self,
        file_id: &str,
        amount: usize,
    ) -> Result<Commit<'_, Growth>, CacheError> {
        let key = Self::document_key(file_id);
        let mut txn = self.kv.begin().await;
        let start_index = txn.arr_len(&key, &JsonPath::rows())?;
        let width = if start_index == 0 {
            DEFAULT_COLUMN_COUNT
        } else {
            txn.arr_len(&key, &JsonPath::row(0))?
        };
        self.limits.check_growth(
            &key,
            start_index.saturating_add(amount),
            width,
            GrowthAxis::Rows,
        )?;
        let row = cell_row(width);
        txn.arr_append(&key, &JsonPath::rows(), (0..amount).map(|_| row.clone()))?;
        Ok(Commit {
            txn,
            outcome: Growth {
                start_index,
                amount,
            },
        })
    }

    /// Append `amount` empty cells to every row.
    ///
    /// The row count is read inside the same transaction as the appends, so
    /// concurrent growth on one file is serialized.
    pub async fn append_columns(
        &self,
        file_id: &str,
        amount: usize,
    ) -> Result<Commit<'_, Growth>, CacheError> {
        let key = Self::document_key(file_id);
        let mut txn = self.kv.begin().await;
        let rows = txn.arr_len(&key, &JsonPath::rows())?;
        let start_index = if rows == 0 {
            0
        } else {
            txn.arr_len(&key, &JsonPath::row(0))?
        };
        self.limits.check_growth(
            &key,
            rows,
            start_index.saturating_add(amount),
            GrowthAxis::Columns,
        )?;
        let blank = cell_value(&Cell::empty());
        let pipeline: Pipeline = (0..rows)
            .map(|row| Command::ArrAppend {
                key: key.clone(),
                path: JsonPath::row(row),
                values: vec![blank.clone(); amount],
            })
            .collect();
        // Rows are read under the same lock, so every append targets an
        // existing array.
        for result in pipeline.run(&mut txn) {
            result?;
        }
        Ok(Commit {
            txn,
            outcome: Growth {
                start_index,
                amount,
            },
        })
    }

    /// Non-hydrating read of the grid.
    pub async fn read(&self, file_id: &str) -> Result<Option<Matrix>, CacheError> {
        let key = Self::document_key(file_id);
        match self.kv.get(&key, &JsonPath::root()).await {
            Some(value) => decode_grid(&key, value).map(Some),
            None => Ok(None),
        }
    }

    /// Raw cached JSON, used for compare-and-delete eviction.
    pub async fn read_raw(&self, file_id: &str) -> Option<Value> {
        self.kv
            .get(&Self::document_key(file_id), &JsonPath::root())
            .await
    }

    /// Raw cached JSON together with its decoded grid, read once.
    pub async fn snapshot(&self, file_id: &str) -> Result<Option<(Value, Matrix)>, CacheError> {
        let key = Self::document_key(file_id);
        match self.read_raw(file_id).await {
            Some(value) => {
                let matrix = decode_grid(&key, value.clone())?;
                Ok(Some((value, matrix)))
            }
            None => Ok(None),
        }
    }

    /// Remove the cached grid. Only call after a confirmed durable flush.
    pub async fn evict(&self, file_id: &str) -> bool {
        self.kv
            .begin()
            .await
            .del(&Self::document_key(file_id))
            .is_some()
    }

    /// Remove the cached grid only if it still equals `expected`.
    pub async fn evict_if_unchanged(&self, file_id: &str, expected: &Value) -> bool {
        let key = Self::document_key(file_id);
        let mut txn = self.kv.begin().await;
        if txn.get(&key, &JsonPath::root()) == Some(expected) {
            txn.del(&key);
            true
        } else {
            false
        }
    }

    /// Append to the chat transcript, dropping the oldest entries beyond
    /// [`CHAT_HISTORY_LIMIT`]. Returns the transcript length.
    pub async fn append_chat(
        &self,
        file_id: &str,
        entry: &ChatEntry,
    ) -> Result<Commit<'_, usize>, CacheError> {
        let key = Self::chat_key(file_id);
        let value = serde_json::to_value(entry).map_err(|e| CacheError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        let mut txn = self.kv.begin().await;
        txn.set_if_absent(&key, Value::Array(Vec::new()));
        txn.arr_append(&key, &JsonPath::root(), [value])?;
        let len = txn.arr_keep_last(&key, &JsonPath::root(), CHAT_HISTORY_LIMIT)?;
        Ok(Commit { txn, outcome: len })
    }

    /// The chat transcript, oldest first. Unreadable entries are skipped.
    pub async fn chat_history(&self, file_id: &str) -> Vec<ChatEntry> {
        match self.kv.get(&Self::chat_key(file_id), &JsonPath::root()).await {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|v| serde_json::from_value(v).ok())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Replace the drawing scene. Last full state wins.
    pub async fn set_drawing(&self, file_id: &str, scene: Value) -> Commit<'_, ()> {
        let mut txn = self.kv.begin().await;
        txn.put(&Self::drawing_key(file_id), scene);
        Commit { txn, outcome: () }
    }

    /// Seed the drawing scene from durable metadata unless a live one exists.
    pub async fn warm_drawing(&self, file_id: &str, scene: Value) -> bool {
        self.kv
            .begin()
            .await
            .set_if_absent(&Self::drawing_key(file_id), scene)
    }

    pub async fn drawing(&self, file_id: &str) -> Option<Value> {
        self.kv
            .get(&Self::drawing_key(file_id), &JsonPath::root())
            .await
    }
}

fn cell_value(cell: &Cell) -> Value {
    match cell {
        Cell::Number(n) => Value::Number(n.clone()),
        Cell::Text(s) => Value::String(s.clone()),
    }
}

fn cell_row(width: usize) -> Value {
    Value::Array(grid::blank_row(width).iter().map(cell_value).collect())
}

fn encode_grid(data: &Matrix) -> Value {
    Value::Object(
        [(
            "data".to_string(),
            Value::Array(
                data.iter()
                    .map(|row| Value::Array(row.iter().map(cell_value).collect()))
                    .collect(),
            ),
        )]
        .into_iter()
        .collect(),
    )
}

fn decode_grid(key: &str, value: Value) -> Result<Matrix, CacheError> {
    serde_json::from_value::<CachedGrid>(value)
        .map(|g| g.data)
        .map_err(|e| CacheError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
}
