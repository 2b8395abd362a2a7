//! Event-classification guards.
//!
//! Pure predicates over `(context, event)` used by the connection state
//! machine to pick a transition. Every guard declares the outer event kind it
//! operates on; being invoked with any other kind is a protocol or
//! programming error and fails with [`GuardError::InvalidEventKind`] rather
//! than silently returning `false`.
use thiserror::Error;

use crate::{
    cache::fingerprint,
    events::{Event, EventKind, FullNodeEvent, MetadataDecided, MetadataDiffOutcome, VertexEventType, WsEvent},
    machine::Context,
};

#[derive(Error, Debug, PartialEq)]
pub enum GuardError {
    /// A guard was invoked with an event of the wrong outer kind.
    #[error("Invalid event type on {guard} guard: {actual}")]
    InvalidEventKind { guard: &'static str, actual: EventKind },
}

type GuardResult = Result<bool, GuardError>;

fn expect_decided<'a>(guard: &'static str, event: &'a Event) -> Result<&'a MetadataDecided, GuardError> {
    match event {
        Event::MetadataDecided(decided) => Ok(decided),
        other => Err(GuardError::InvalidEventKind { guard, actual: other.kind() }),
    }
}

fn expect_fullnode<'a>(guard: &'static str, event: &'a Event) -> Result<&'a FullNodeEvent, GuardError> {
    match event {
        Event::Fullnode(ev) => Ok(ev),
        other => Err(GuardError::InvalidEventKind { guard, actual: other.kind() }),
    }
}

fn expect_websocket(guard: &'static str, event: &Event) -> Result<WsEvent, GuardError> {
    match event {
        Event::Websocket(ev) => Ok(*ev),
        other => Err(GuardError::InvalidEventKind { guard, actual: other.kind() }),
    }
}

/// True iff the diff engine decided the event carries no actionable change.
pub fn metadata_ignore(_ctx: &Context, event: &Event) -> GuardResult {
    let decided = expect_decided("metadata_ignore", event)?;
    Ok(decided.outcome == MetadataDiffOutcome::Ignore)
}

/// True iff the diff engine decided the transaction got voided.
pub fn metadata_voided(_ctx: &Context, event: &Event) -> GuardResult {
    let decided = expect_decided("metadata_voided", event)?;
    Ok(decided.outcome == MetadataDiffOutcome::TxVoided)
}

/// True iff the diff engine decided a previously voided transaction is valid
/// again.
pub fn metadata_unvoided(_ctx: &Context, event: &Event) -> GuardResult {
    let decided = expect_decided("metadata_unvoided", event)?;
    Ok(decided.outcome == MetadataDiffOutcome::TxUnvoided)
}

/// True iff the diff engine decided the transaction is new to us.
pub fn metadata_new_tx(_ctx: &Context, event: &Event) -> GuardResult {
    let decided = expect_decided("metadata_new_tx", event)?;
    Ok(decided.outcome == MetadataDiffOutcome::TxNew)
}

/// True iff the diff engine decided the transaction just got its first
/// confirming block.
pub fn metadata_first_block(_ctx: &Context, event: &Event) -> GuardResult {
    let decided = expect_decided("metadata_first_block", event)?;
    Ok(decided.outcome == MetadataDiffOutcome::TxFirstBlock)
}

/// True iff the inner vertex event reports a metadata change.
pub fn metadata_changed(_ctx: &Context, event: &Event) -> GuardResult {
    let ev = expect_fullnode("metadata_changed", event)?;
    Ok(ev.event.kind == VertexEventType::VertexMetadataChanged)
}

/// True iff the inner vertex event reports a newly accepted vertex.
pub fn vertex_accepted(_ctx: &Context, event: &Event) -> GuardResult {
    let ev = expect_fullnode("vertex_accepted", event)?;
    Ok(ev.event.kind == VertexEventType::NewVertexAccepted)
}

/// True iff the event's peer id differs from the configured expectation.
///
/// The configuration is read fresh on every call so a runtime
/// reconfiguration takes effect immediately.
pub fn invalid_peer_id(ctx: &Context, event: &Event) -> GuardResult {
    let ev = expect_fullnode("invalid_peer_id", event)?;
    Ok(ev.peer_id != ctx.config.read().peer_id)
}

/// True iff the event's network differs from the configured expectation.
pub fn invalid_network(ctx: &Context, event: &Event) -> GuardResult {
    let ev = expect_fullnode("invalid_network", event)?;
    Ok(ev.network != ctx.config.read().network)
}

/// True iff the event's stream id differs from the configured expectation.
///
/// A changed stream id invalidates the event id ordering assumption.
pub fn invalid_stream_id(ctx: &Context, event: &Event) -> GuardResult {
    let ev = expect_fullnode("invalid_stream_id", event)?;
    Ok(ev.stream_id != ctx.config.read().stream_id)
}

/// True iff the transport reported a disconnect.
pub fn websocket_disconnected(_ctx: &Context, event: &Event) -> GuardResult {
    let ev = expect_websocket("websocket_disconnected", event)?;
    Ok(ev == WsEvent::Disconnected)
}

/// True iff the vertex in the event is currently voided.
///
/// For inner vertex types other than the two accepted ones this returns
/// `false` without failing, unlike its sibling guards. Voided vertices we
/// never persisted can be acknowledged without any database work.
pub fn voided(_ctx: &Context, event: &Event) -> GuardResult {
    let ev = expect_fullnode("voided", event)?;
    if !matches!(
        ev.event.kind,
        VertexEventType::VertexMetadataChanged | VertexEventType::NewVertexAccepted
    ) {
        return Ok(false);
    }
    Ok(!ev.event.data.metadata.voided_by.is_empty())
}

/// True iff the cached fingerprint for the vertex equals the one computed
/// from the event.
///
/// Consults the cache fresh on every call; a hash never seen (cold cache)
/// always reads as changed.
pub fn unchanged(ctx: &Context, event: &Event) -> GuardResult {
    let ev = expect_fullnode("unchanged", event)?;
    if !matches!(
        ev.event.kind,
        VertexEventType::VertexMetadataChanged | VertexEventType::NewVertexAccepted
    ) {
        return Ok(false);
    }
    let data = &ev.event.data;
    let cached = match ctx.cache.get(&data.hash) {
        Some(fp) => fp,
        // Not on the cache, it's not unchanged.
        None => return Ok(false),
    };
    Ok(cached == fingerprint(&data.metadata))
}

#[cfg(test)]
mod tests {
    use std::{num::NonZeroUsize, sync::Arc};

    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::{
        cache::TxCache,
        config::{DaemonConfig, SharedConfig},
        events::{StreamedVertexEvent, TxMetadata, VertexData},
    };

    fn test_context() -> Context {
        let config = SharedConfig::new(DaemonConfig {
            network: "mainnet".to_string(),
            peer_id: "peer-1".to_string(),
            stream_id: "stream-1".to_string(),
            cache_size: 8,
        });
        Context::new(config, Arc::new(TxCache::new(NonZeroUsize::new(8).unwrap())))
    }

    fn fullnode_event(kind: VertexEventType, metadata: TxMetadata) -> Event {
        Event::Fullnode(FullNodeEvent {
            stream_id: "stream-1".to_string(),
            peer_id: "peer-1".to_string(),
            network: "mainnet".to_string(),
            event: StreamedVertexEvent {
                id: 1,
                timestamp: 0,
                kind,
                data: VertexData {
                    hash: "tx-hash".to_string(),
                    timestamp: 0,
                    version: 1,
                    weight: 1.0,
                    metadata,
                },
            },
            latest_event_id: 1,
        })
    }

    fn decided_event(outcome: MetadataDiffOutcome) -> Event {
        let Event::Fullnode(original) =
            fullnode_event(VertexEventType::VertexMetadataChanged, TxMetadata::default())
        else {
            unreachable!()
        };
        Event::MetadataDecided(MetadataDecided { outcome, original })
    }

    #[rstest]
    #[case(MetadataDiffOutcome::Ignore)]
    #[case(MetadataDiffOutcome::TxNew)]
    #[case(MetadataDiffOutcome::TxVoided)]
    #[case(MetadataDiffOutcome::TxFirstBlock)]
    fn test_exactly_one_decided_guard_matches(#[case] outcome: MetadataDiffOutcome) {
        let ctx = test_context();
        let event = decided_event(outcome);
        let guards: [(MetadataDiffOutcome, fn(&Context, &Event) -> GuardResult); 4] = [
            (MetadataDiffOutcome::Ignore, metadata_ignore),
            (MetadataDiffOutcome::TxNew, metadata_new_tx),
            (MetadataDiffOutcome::TxVoided, metadata_voided),
            (MetadataDiffOutcome::TxFirstBlock, metadata_first_block),
        ];
        for (expected, guard) in guards {
            assert_eq!(guard(&ctx, &event).unwrap(), expected == outcome);
        }
    }

    #[test]
    fn test_decided_guard_rejects_fullnode_event() {
        let ctx = test_context();
        let event = fullnode_event(VertexEventType::VertexMetadataChanged, TxMetadata::default());
        let err = metadata_ignore(&ctx, &event).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid event type on metadata_ignore guard: FULLNODE_EVENT"
        );
    }

    #[test]
    fn test_vertex_guards_classify_inner_type() {
        let ctx = test_context();
        let changed = fullnode_event(VertexEventType::VertexMetadataChanged, TxMetadata::default());
        let accepted = fullnode_event(VertexEventType::NewVertexAccepted, TxMetadata::default());

        assert!(metadata_changed(&ctx, &changed).unwrap());
        assert!(!metadata_changed(&ctx, &accepted).unwrap());
        assert!(vertex_accepted(&ctx, &accepted).unwrap());
        assert!(!vertex_accepted(&ctx, &changed).unwrap());
    }

    #[test]
    fn test_vertex_guard_rejects_websocket_event() {
        let ctx = test_context();
        let event = Event::Websocket(WsEvent::Connected);
        let err = vertex_accepted(&ctx, &event).unwrap_err();
        assert_eq!(
            err,
            GuardError::InvalidEventKind { guard: "vertex_accepted", actual: EventKind::Websocket }
        );
    }

    #[test]
    fn test_identity_guards_read_config_fresh() {
        let ctx = test_context();
        let event = fullnode_event(VertexEventType::NewVertexAccepted, TxMetadata::default());

        assert!(!invalid_peer_id(&ctx, &event).unwrap());
        assert!(!invalid_network(&ctx, &event).unwrap());
        assert!(!invalid_stream_id(&ctx, &event).unwrap());

        ctx.config.update(|c| {
            c.peer_id = "other-peer".to_string();
            c.network = "testnet".to_string();
            c.stream_id = "other-stream".to_string();
        });

        assert!(invalid_peer_id(&ctx, &event).unwrap());
        assert!(invalid_network(&ctx, &event).unwrap());
        assert!(invalid_stream_id(&ctx, &event).unwrap());
    }

    #[test]
    fn test_websocket_disconnected() {
        let ctx = test_context();
        assert!(websocket_disconnected(&ctx, &Event::Websocket(WsEvent::Disconnected)).unwrap());
        assert!(!websocket_disconnected(&ctx, &Event::Websocket(WsEvent::Connected)).unwrap());

        let event = fullnode_event(VertexEventType::NewVertexAccepted, TxMetadata::default());
        assert_eq!(
            websocket_disconnected(&ctx, &event).unwrap_err(),
            GuardError::InvalidEventKind {
                guard: "websocket_disconnected",
                actual: EventKind::Fullnode
            }
        );
    }

    #[rstest]
    #[case(VertexEventType::VertexMetadataChanged)]
    #[case(VertexEventType::NewVertexAccepted)]
    fn test_voided_reflects_voided_by(#[case] kind: VertexEventType) {
        let ctx = test_context();
        let voided_meta =
            TxMetadata { voided_by: vec!["conflict".to_string()], ..Default::default() };

        assert!(voided(&ctx, &fullnode_event(kind, voided_meta)).unwrap());
        assert!(!voided(&ctx, &fullnode_event(kind, TxMetadata::default())).unwrap());
    }

    #[test]
    fn test_voided_is_false_for_other_vertex_types() {
        let ctx = test_context();
        let meta = TxMetadata { voided_by: vec!["conflict".to_string()], ..Default::default() };
        // deliberate asymmetry: no error here
        assert!(!voided(&ctx, &fullnode_event(VertexEventType::Unknown, meta)).unwrap());
    }

    #[test]
    fn test_unchanged_matches_cached_fingerprint() {
        let ctx = test_context();
        let meta = TxMetadata { height: Some(5), ..Default::default() };
        let event = fullnode_event(VertexEventType::VertexMetadataChanged, meta.clone());

        // cold cache: always changed
        assert!(!unchanged(&ctx, &event).unwrap());

        ctx.cache
            .insert("tx-hash".to_string(), fingerprint(&meta));
        assert!(unchanged(&ctx, &event).unwrap());

        // a different snapshot must read as changed
        let other = fullnode_event(
            VertexEventType::VertexMetadataChanged,
            TxMetadata { height: Some(6), ..Default::default() },
        );
        assert!(!unchanged(&ctx, &other).unwrap());
    }

    #[test]
    fn test_unchanged_is_false_for_other_vertex_types() {
        let ctx = test_context();
        let meta = TxMetadata::default();
        ctx.cache
            .insert("tx-hash".to_string(), fingerprint(&meta));
        let event = fullnode_event(VertexEventType::Unknown, meta);
        assert!(!unchanged(&ctx, &event).unwrap());
    }
}
