//! In-memory JSON key/value store with path-addressed commands.
//!
//! Values are JSON documents. Commands address a location inside a document
//! with a [`JsonPath`] such as `$.data[3][7]`, so a single cell edit never
//! rewrites the whole grid.
//!
//! All commands are serialized through one lock, like a single-threaded cache
//! server. A [`Txn`] holds that lock: everything done through it, including a
//! bus publish awaited before the `Txn` is dropped, is observed by other
//! clients as one step. A [`Pipeline`] runs a list of commands in one
//! round trip; each command succeeds or fails on its own and nothing is
//! rolled back.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::{RwLock, RwLockWriteGuard};

use super::CacheError;

/// One step of a [`JsonPath`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// Location inside a JSON document. The empty path is the document root.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JsonPath(Vec<Segment>);

impl JsonPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.0.push(Segment::Key(key.into()));
        self
    }

    pub fn index(mut self, index: usize) -> Self {
        self.0.push(Segment::Index(index));
        self
    }

    /// `$.data`, the row array of a cached grid.
    pub fn rows() -> Self {
        Self::root().key("data")
    }

    /// `$.data[row]`
    pub fn row(row: usize) -> Self {
        Self::rows().index(row)
    }

    /// `$.data[row][col]`
    pub fn cell(row: usize, col: usize) -> Self {
        Self::row(row).index(col)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    fn split_last(&self) -> Option<(&Segment, JsonPath)> {
        self.0
            .split_last()
            .map(|(last, parent)| (last, JsonPath(parent.to_vec())))
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("$")?;
        for segment in &self.0 {
            match segment {
                Segment::Key(k) => write!(f, ".{k}")?,
                Segment::Index(i) => write!(f, "[{i}]")?,
            }
        }
        Ok(())
    }
}

fn resolve<'a>(value: &'a Value, path: &JsonPath) -> Option<&'a Value> {
    path.0.iter().try_fold(value, |v, segment| match segment {
        Segment::Key(k) => v.get(k.as_str()),
        Segment::Index(i) => v.get(*i),
    })
}

fn resolve_mut<'a>(value: &'a mut Value, path: &JsonPath) -> Option<&'a mut Value> {
    path.0.iter().try_fold(value, |v, segment| match segment {
        Segment::Key(k) => v.get_mut(k.as_str()),
        Segment::Index(i) => v.get_mut(*i),
    })
}

/// A single store command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Set {
        key: String,
        path: JsonPath,
        value: Value,
    },
    ArrAppend {
        key: String,
        path: JsonPath,
        values: Vec<Value>,
    },
    ArrLen {
        key: String,
        path: JsonPath,
    },
    Del {
        key: String,
    },
}

/// Result of a successful [`Command`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    Len(usize),
    Deleted(bool),
}

impl Command {
    pub fn set(key: impl Into<String>, path: JsonPath, value: Value) -> Self {
        Command::Set {
            key: key.into(),
            path,
            value,
        }
    }

    fn run(&self, txn: &mut Txn<'_>) -> Result<Reply, CacheError> {
        match self {
            Command::Set { key, path, value } => {
                txn.set(key, path, value.clone()).map(|_| Reply::Ok)
            }
            Command::ArrAppend { key, path, values } => {
                txn.arr_append(key, path, values.iter().cloned()).map(Reply::Len)
            }
            Command::ArrLen { key, path } => txn.arr_len(key, path).map(Reply::Len),
            Command::Del { key } => Ok(Reply::Deleted(txn.del(key).is_some())),
        }
    }
}

/// An ordered list of commands executed in one round trip.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    commands: Vec<Command>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Run every command in order. A failing command does not stop the rest.
    pub fn run(&self, txn: &mut Txn<'_>) -> Vec<Result<Reply, CacheError>> {
        self.commands.iter().map(|c| c.run(txn)).collect()
    }
}

impl FromIterator<Command> for Pipeline {
    fn from_iter<I: IntoIterator<Item = Command>>(iter: I) -> Self {
        Self {
            commands: iter.into_iter().collect(),
        }
    }
}

/// Exclusive access to the store until dropped.
pub struct Txn<'a> {
    entries: RwLockWriteGuard<'a, HashMap<String, Value>>,
}

impl Txn<'_> {
    pub fn exists(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str, path: &JsonPath) -> Option<&Value> {
        self.entries.get(key).and_then(|v| resolve(v, path))
    }

    /// Store `value` as the whole document under `key`.
    pub fn put(&mut self, key: &str, value: Value) {
        self.entries.insert(key.to_string(), value);
    }

    /// Write `value` at `path`. The parent must exist; array indexes must be
    /// in bounds. An empty path replaces (or creates) the whole document.
    pub fn set(&mut self, key: &str, path: &JsonPath, value: Value) -> Result<(), CacheError> {
        let Some((last, parent)) = path.split_last() else {
            self.put(key, value);
            return Ok(());
        };
        let doc = self
            .entries
            .get_mut(key)
            .ok_or_else(|| CacheError::NoSuchKey(key.to_string()))?;
        let target = resolve_mut(doc, &parent).ok_or_else(|| path_not_found(key, path))?;
        match (last, target) {
            (Segment::Key(k), Value::Object(map)) => {
                map.insert(k.clone(), value);
                Ok(())
            }
            (Segment::Index(i), Value::Array(items)) => match items.get_mut(*i) {
                Some(slot) => {
                    *slot = value;
                    Ok(())
                }
                None => Err(path_not_found(key, path)),
            },
            _ => Err(CacheError::WrongType {
                key: key.to_string(),
                path: path.to_string(),
            }),
        }
    }

    /// Store `value` as a new document unless `key` already exists.
    /// Returns whether the value was written.
    pub fn set_if_absent(&mut self, key: &str, value: Value) -> bool {
        if self.entries.contains_key(key) {
            return false;
        }
        self.entries.insert(key.to_string(), value);
        true
    }

    /// Append to the array at `path`, returning its new length.
    pub fn arr_append(
        &mut self,
        key: &str,
        path: &JsonPath,
        values: impl IntoIterator<Item = Value>,
    ) -> Result<usize, CacheError> {
        let items = self.array_mut(key, path)?;
        items.extend(values);
        Ok(items.len())
    }

    pub fn arr_len(&self, key: &str, path: &JsonPath) -> Result<usize, CacheError> {
        let doc = self
            .entries
            .get(key)
            .ok_or_else(|| CacheError::NoSuchKey(key.to_string()))?;
        match resolve(doc, path) {
            Some(Value::Array(items)) => Ok(items.len()),
            Some(_) => Err(CacheError::WrongType {
                key: key.to_string(),
                path: path.to_string(),
            }),
            None => Err(path_not_found(key, path)),
        }
    }

    /// Drop leading elements so at most `keep` remain. Returns the new length.
    pub fn arr_keep_last(
        &mut self,
        key: &str,
        path: &JsonPath,
        keep: usize,
    ) -> Result<usize, CacheError> {
        let items = self.array_mut(key, path)?;
        if items.len() > keep {
            let excess = items.len() - keep;
            items.drain(..excess);
        }
        Ok(items.len())
    }

    pub fn del(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    fn array_mut(&mut self, key: &str, path: &JsonPath) -> Result<&mut Vec<Value>, CacheError> {
        let doc = self
            .entries
            .get_mut(key)
            .ok_or_else(|| CacheError::NoSuchKey(key.to_string()))?;
        match resolve_mut(doc, path) {
            Some(Value::Array(items)) => Ok(items),
            Some(_) => Err(CacheError::WrongType {
                key: key.to_string(),
                path: path.to_string(),
            }),
            None => Err(path_not_found(key, path)),
        }
    }
}

fn path_not_found(key: &str, path: &JsonPath) -> CacheError {
    CacheError::PathNotFound {
        key: key.to_string(),
        path: path.to_string(),
    }
}

/// The key/value store itself.
#[derive(Default)]
pub struct KvStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take exclusive access to the store.
    pub async fn begin(&self) -> Txn<'_> {
        Txn {
            entries: self.entries.write().await,
        }
    }

    /// Run a pipeline in one round trip.
    pub async fn exec(&self, pipeline: &Pipeline) -> Vec<Result<Reply, CacheError>> {
        let mut txn = self.begin().await;
        pipeline.run(&mut txn)
    }

    /// Clone the value at `path`, if any.
    pub async fn get(&self, key: &str, path: &JsonPath) -> Option<Value> {
        let entries = self.entries.read().await;
        entries.get(key).and_then(|v| resolve(v, path)).cloned()
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.entries.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }
}
