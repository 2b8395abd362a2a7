//! Storage collaborator contracts.
//!
//! The daemon treats its database as a black box: schema, UTXO and balance
//! bookkeeping live behind these traits. What the core relies on is the
//! transaction discipline: a handler opens a [`StorageTransaction`], applies
//! all writes, and either commits or rolls the whole batch back. Concrete
//! backends are provided by the embedding binary.
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

use crate::events::{TxId, TxRecord};

#[derive(Error, Debug)]
pub enum StorageError {
    /// The backend rejected or failed an operation.
    #[error("Database error: {0}")]
    Database(String),

    /// A connection to the backend could not be established.
    #[error("Connection error: {0}")]
    Connection(String),
}

/// Vertex upsert payload for `add_or_update_tx`.
#[derive(Debug, Clone, PartialEq)]
pub struct TxUpsert {
    pub tx_id: TxId,
    pub height: Option<u64>,
    pub timestamp: u64,
    pub version: u32,
    pub weight: f64,
}

/// Read access plus transaction creation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Storage: Send + Sync {
    /// Opens a new write transaction.
    async fn begin(&self) -> Result<Box<dyn StorageTransaction>, StorageError>;

    async fn get_transaction_by_id(&self, tx_id: &str)
        -> Result<Option<TxRecord>, StorageError>;

    /// Id of the last fully processed stream event, if any.
    async fn get_last_synced_event(&self) -> Result<Option<u64>, StorageError>;
}

/// A single all-or-nothing write batch.
///
/// A transaction ends with exactly one `commit` or `rollback` call and must
/// not be used afterwards. Dropping a transaction without finishing it must
/// behave like a rollback in any conforming backend.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StorageTransaction: Send {
    async fn get_transaction_by_id(&mut self, tx_id: &str)
        -> Result<Option<TxRecord>, StorageError>;

    async fn add_or_update_tx(&mut self, tx: &TxUpsert) -> Result<(), StorageError>;

    async fn void_transaction(&mut self, tx_id: &str) -> Result<(), StorageError>;

    async fn mark_utxos_as_voided(&mut self, tx_id: &str) -> Result<(), StorageError>;

    async fn cleanup_voided_tx(&mut self, tx_id: &str) -> Result<(), StorageError>;

    async fn get_last_synced_event(&mut self) -> Result<Option<u64>, StorageError>;

    async fn update_last_synced_event(&mut self, event_id: u64) -> Result<(), StorageError>;

    async fn commit(&mut self) -> Result<(), StorageError>;

    async fn rollback(&mut self) -> Result<(), StorageError>;
}
