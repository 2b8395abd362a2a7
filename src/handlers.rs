//! Transactional persistence handlers.
//!
//! One handler per diff outcome plus one for newly accepted vertices. Every
//! handler opens a storage transaction, applies its writes, advances the
//! last-synced event id and commits; any failure rolls the whole batch back
//! before the error is re-raised. The change-detection cache is only updated
//! after a successful commit so a crashed write never poisons it.
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    cache::{fingerprint, TxCache},
    events::{FullNodeEvent, TxId},
    storage::{Storage, StorageError, StorageTransaction, TxUpsert},
};

const BLOCK_VERSION: u32 = 0;
const MERGED_MINED_BLOCK_VERSION: u32 = 3;

fn is_block(version: u32) -> bool {
    version == BLOCK_VERSION || version == MERGED_MINED_BLOCK_VERSION
}

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A vertex-accepted event arrived for a transaction we already persisted.
    #[error("Transaction {0} already in the database")]
    DuplicateTransaction(TxId),

    /// The incoming event id does not advance the stored one.
    #[error("Event {incoming} is not newer than the last synced event {stored}")]
    EventOrderingViolation { incoming: u64, stored: u64 },
}

/// Persists a newly accepted vertex.
pub async fn handle_vertex_accepted(
    storage: &dyn Storage,
    cache: &TxCache,
    event: &FullNodeEvent,
) -> Result<(), HandlerError> {
    let mut txn = storage.begin().await?;
    let res = apply_vertex_accepted(txn.as_mut(), event).await;
    finish(txn, res).await?;

    let data = &event.event.data;
    cache.insert(data.hash.clone(), fingerprint(&data.metadata));
    debug!(hash = %data.hash, event_id = event.event.id, "Persisted accepted vertex");
    Ok(())
}

async fn apply_vertex_accepted(
    txn: &mut dyn StorageTransaction,
    event: &FullNodeEvent,
) -> Result<(), HandlerError> {
    let data = &event.event.data;
    if txn
        .get_transaction_by_id(&data.hash)
        .await?
        .is_some()
    {
        return Err(HandlerError::DuplicateTransaction(data.hash.clone()));
    }

    // Plain transactions have no height until their first confirming block.
    let height = if is_block(data.version) || data.metadata.first_block.is_some() {
        data.metadata.height
    } else {
        None
    };

    txn.add_or_update_tx(&TxUpsert {
        tx_id: data.hash.clone(),
        height,
        timestamp: data.timestamp,
        version: data.version,
        weight: data.weight,
    })
    .await?;
    advance_last_synced(txn, event.event.id).await
}

/// Marks a transaction and its outputs as voided.
pub async fn handle_tx_voided(
    storage: &dyn Storage,
    cache: &TxCache,
    event: &FullNodeEvent,
) -> Result<(), HandlerError> {
    let data = &event.event.data;
    let mut txn = storage.begin().await?;
    let res = async {
        txn.void_transaction(&data.hash).await?;
        txn.mark_utxos_as_voided(&data.hash).await?;
        advance_last_synced(txn.as_mut(), event.event.id).await
    }
    .await;
    finish(txn, res).await?;

    cache.insert(data.hash.clone(), fingerprint(&data.metadata));
    debug!(hash = %data.hash, "Voided tx");
    Ok(())
}

/// Cleans up a transaction that was voided in the database but is valid
/// again on the fullnode.
pub async fn handle_tx_unvoided(
    storage: &dyn Storage,
    cache: &TxCache,
    event: &FullNodeEvent,
) -> Result<(), HandlerError> {
    let data = &event.event.data;
    let mut txn = storage.begin().await?;
    let res = async {
        txn.cleanup_voided_tx(&data.hash).await?;
        advance_last_synced(txn.as_mut(), event.event.id).await
    }
    .await;
    finish(txn, res).await?;

    cache.insert(data.hash.clone(), fingerprint(&data.metadata));
    debug!(hash = %data.hash, "Unvoided tx, database cleaned up");
    Ok(())
}

/// Records the first confirming block (height) of a transaction.
pub async fn handle_tx_first_block(
    storage: &dyn Storage,
    cache: &TxCache,
    event: &FullNodeEvent,
) -> Result<(), HandlerError> {
    let data = &event.event.data;
    let mut txn = storage.begin().await?;
    let res = async {
        let height = if data.metadata.first_block.is_some() { data.metadata.height } else { None };
        txn.add_or_update_tx(&TxUpsert {
            tx_id: data.hash.clone(),
            height,
            timestamp: data.timestamp,
            version: data.version,
            weight: data.weight,
        })
        .await?;
        advance_last_synced(txn.as_mut(), event.event.id).await
    }
    .await;
    finish(txn, res).await?;

    cache.insert(data.hash.clone(), fingerprint(&data.metadata));
    debug!(hash = %data.hash, event_id = event.event.id, "Confirmed tx");
    Ok(())
}

/// Advances the last-synced event id, rejecting non-monotonic updates.
async fn advance_last_synced(
    txn: &mut dyn StorageTransaction,
    incoming: u64,
) -> Result<(), HandlerError> {
    if let Some(stored) = txn.get_last_synced_event().await? {
        if incoming <= stored {
            return Err(HandlerError::EventOrderingViolation { incoming, stored });
        }
    }
    txn.update_last_synced_event(incoming)
        .await?;
    Ok(())
}

/// Commits on success, rolls back on failure and re-raises the error.
async fn finish(
    mut txn: Box<dyn StorageTransaction>,
    res: Result<(), HandlerError>,
) -> Result<(), HandlerError> {
    match res {
        Ok(()) => {
            txn.commit().await?;
            Ok(())
        }
        Err(e) => {
            if let Err(rb) = txn.rollback().await {
                warn!(error = %rb, "Rollback failed after handler error");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        events::{StreamedVertexEvent, TxMetadata, TxRecord, VertexData, VertexEventType},
        storage::{MockStorage, MockStorageTransaction},
    };

    fn accepted_event(hash: &str, event_id: u64, metadata: TxMetadata) -> FullNodeEvent {
        FullNodeEvent {
            stream_id: "s".to_string(),
            peer_id: "p".to_string(),
            network: "mainnet".to_string(),
            event: StreamedVertexEvent {
                id: event_id,
                timestamp: 1_695_655_000,
                kind: VertexEventType::NewVertexAccepted,
                data: VertexData {
                    hash: hash.to_string(),
                    timestamp: 1_695_655_000,
                    version: 1,
                    weight: 17.2,
                    metadata,
                },
            },
            latest_event_id: event_id,
        }
    }

    fn cache() -> TxCache {
        TxCache::new(NonZeroUsize::new(8).unwrap())
    }

    fn storage_with_txn(txn: MockStorageTransaction) -> MockStorage {
        let mut storage = MockStorage::new();
        storage
            .expect_begin()
            .return_once(move || Ok(Box::new(txn)));
        storage
    }

    #[tokio::test]
    async fn test_vertex_accepted_commits_and_updates_cache() {
        let mut txn = MockStorageTransaction::new();
        txn.expect_get_transaction_by_id()
            .returning(|_| Ok(None));
        txn.expect_add_or_update_tx()
            .withf(|up| up.tx_id == "tx1" && up.height.is_none())
            .times(1)
            .returning(|_| Ok(()));
        txn.expect_get_last_synced_event()
            .returning(|| Ok(Some(9)));
        txn.expect_update_last_synced_event()
            .withf(|id| *id == 10)
            .times(1)
            .returning(|_| Ok(()));
        txn.expect_commit().times(1).returning(|| Ok(()));

        let storage = storage_with_txn(txn);
        let cache = cache();
        let event = accepted_event("tx1", 10, TxMetadata::default());

        handle_vertex_accepted(&storage, &cache, &event)
            .await
            .expect("handler failed");
        assert_eq!(cache.get("tx1"), Some(fingerprint(&TxMetadata::default())));
    }

    #[tokio::test]
    async fn test_vertex_accepted_rejects_duplicate_and_rolls_back() {
        let mut txn = MockStorageTransaction::new();
        txn.expect_get_transaction_by_id()
            .returning(|id| {
                Ok(Some(TxRecord { tx_id: id.to_string(), height: None, is_voided: false }))
            });
        txn.expect_rollback()
            .times(1)
            .returning(|| Ok(()));

        let storage = storage_with_txn(txn);
        let cache = cache();
        let event = accepted_event("tx1", 10, TxMetadata::default());

        let err = handle_vertex_accepted(&storage, &cache, &event)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::DuplicateTransaction(id) if id == "tx1"));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_voided_rolls_back_on_mid_transaction_failure() {
        let mut txn = MockStorageTransaction::new();
        txn.expect_void_transaction()
            .returning(|_| Ok(()));
        txn.expect_mark_utxos_as_voided()
            .returning(|_| Err(StorageError::Database("constraint".to_string())));
        txn.expect_rollback()
            .times(1)
            .returning(|| Ok(()));

        let storage = storage_with_txn(txn);
        let cache = cache();
        let event = accepted_event(
            "tx1",
            11,
            TxMetadata { voided_by: vec!["conflict".to_string()], ..Default::default() },
        );

        let err = handle_tx_voided(&storage, &cache, &event)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Storage(_)));
        // cache untouched on failure
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_unvoided_cleans_up_and_commits() {
        let mut txn = MockStorageTransaction::new();
        txn.expect_cleanup_voided_tx()
            .withf(|id| id == "tx1")
            .times(1)
            .returning(|_| Ok(()));
        txn.expect_get_last_synced_event()
            .returning(|| Ok(None));
        txn.expect_update_last_synced_event()
            .returning(|_| Ok(()));
        txn.expect_commit().times(1).returning(|| Ok(()));

        let storage = storage_with_txn(txn);
        let cache = cache();
        let event = accepted_event("tx1", 12, TxMetadata::default());

        handle_tx_unvoided(&storage, &cache, &event)
            .await
            .expect("handler failed");
    }

    #[tokio::test]
    async fn test_first_block_persists_height() {
        let meta = TxMetadata {
            first_block: Some(vec!["b9".to_string()]),
            height: Some(9),
            ..Default::default()
        };
        let mut txn = MockStorageTransaction::new();
        txn.expect_add_or_update_tx()
            .withf(|up| up.height == Some(9))
            .times(1)
            .returning(|_| Ok(()));
        txn.expect_get_last_synced_event()
            .returning(|| Ok(Some(12)));
        txn.expect_update_last_synced_event()
            .withf(|id| *id == 13)
            .returning(|_| Ok(()));
        txn.expect_commit().times(1).returning(|| Ok(()));

        let storage = storage_with_txn(txn);
        let cache = cache();
        let event = accepted_event("tx1", 13, meta);

        handle_tx_first_block(&storage, &cache, &event)
            .await
            .expect("handler failed");
    }

    #[tokio::test]
    async fn test_event_ordering_violation_is_fatal_for_the_event() {
        let mut txn = MockStorageTransaction::new();
        txn.expect_cleanup_voided_tx()
            .returning(|_| Ok(()));
        txn.expect_get_last_synced_event()
            .returning(|| Ok(Some(20)));
        txn.expect_rollback()
            .times(1)
            .returning(|| Ok(()));

        let storage = storage_with_txn(txn);
        let cache = cache();
        let event = accepted_event("tx1", 20, TxMetadata::default());

        let err = handle_tx_unvoided(&storage, &cache, &event)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HandlerError::EventOrderingViolation { incoming: 20, stored: 20 }
        ));
    }
}
