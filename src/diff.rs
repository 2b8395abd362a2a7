//! Metadata diff engine.
//!
//! Given the persisted state of a transaction and the metadata snapshot
//! reported by the fullnode, decides what (if anything) changed. The decision
//! function itself is pure; [`spawn_metadata_diff`] wraps it in a background
//! task that performs the persisted-state lookup and resolves to a
//! [`MetadataDecided`] event for the state machine.
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{
    events::{FullNodeEvent, MetadataDecided, MetadataDiffOutcome, TxMetadata, TxRecord},
    storage::{Storage, StorageError},
};

#[derive(Error, Debug)]
pub enum DiffError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Decides the outcome for a metadata snapshot against the persisted state.
///
/// Precedence is fixed: absence checks first, then voidedness transitions,
/// then first-block confirmation. The voided checks deliberately run before
/// the first-block check; whether both can hold at once for a real
/// transaction is not something this function speculates about.
pub fn metadata_diff(persisted: Option<&TxRecord>, snapshot: &TxMetadata) -> MetadataDiffOutcome {
    let is_voided = !snapshot.voided_by.is_empty();

    let Some(record) = persisted else {
        // No need to persist transactions that arrive already voided.
        if is_voided {
            return MetadataDiffOutcome::Ignore;
        }
        return MetadataDiffOutcome::TxNew;
    };

    if is_voided {
        if !record.is_voided {
            return MetadataDiffOutcome::TxVoided;
        }
        return MetadataDiffOutcome::Ignore;
    }

    if record.is_voided {
        return MetadataDiffOutcome::TxUnvoided;
    }

    let confirmed = snapshot
        .first_block
        .as_ref()
        .is_some_and(|blocks| !blocks.is_empty());
    if confirmed && record.height.is_none() {
        return MetadataDiffOutcome::TxFirstBlock;
    }

    MetadataDiffOutcome::Ignore
}

/// Runs the persisted-state lookup and diff as a background task.
///
/// The resolved [`MetadataDecided`] carries the original event so the state
/// machine can dispatch the persistence handler with full context.
pub fn spawn_metadata_diff<S>(
    storage: Arc<S>,
    event: FullNodeEvent,
) -> JoinHandle<Result<MetadataDecided, DiffError>>
where
    S: Storage + 'static,
{
    tokio::spawn(async move {
        let data = &event.event.data;
        let persisted = storage
            .get_transaction_by_id(&data.hash)
            .await?;
        let outcome = metadata_diff(persisted.as_ref(), &data.metadata);
        debug!(hash = %data.hash, %outcome, "Metadata diff decided");
        Ok(MetadataDecided { outcome, original: event })
    })
}
