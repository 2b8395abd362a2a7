//! Event model for the reconciliation daemon.
//!
//! Three kinds of events flow through the connection state machine: transport
//! lifecycle notifications, events streamed by the fullnode, and the results
//! of the metadata diff engine delivered back to the machine. Exactly one
//! kind is active per value; guards assert the expected kind and fail loudly
//! otherwise.
use std::fmt;

use serde::{Deserialize, Serialize};

pub type TxId = String;
pub type BlockId = String;

/// Top level event union consumed by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Websocket(WsEvent),
    Fullnode(FullNodeEvent),
    MetadataDecided(MetadataDecided),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Websocket(_) => EventKind::Websocket,
            Event::Fullnode(_) => EventKind::Fullnode,
            Event::MetadataDecided(_) => EventKind::MetadataDecided,
        }
    }
}

/// Discriminant of [`Event`], used in guard error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Websocket,
    Fullnode,
    MetadataDecided,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Websocket => "WEBSOCKET_EVENT",
            EventKind::Fullnode => "FULLNODE_EVENT",
            EventKind::MetadataDecided => "METADATA_DECIDED",
        };
        f.write_str(s)
    }
}

/// Transport lifecycle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WsEvent {
    Connected,
    Disconnected,
}

/// An event streamed by the fullnode.
///
/// `stream_id`, `peer_id` and `network` identify the emitting stream and are
/// validated against the configured expectations on every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullNodeEvent {
    pub stream_id: String,
    pub peer_id: String,
    pub network: String,
    pub event: StreamedVertexEvent,
    pub latest_event_id: u64,
}

/// The inner vertex event with its stream-scoped, strictly increasing id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamedVertexEvent {
    pub id: u64,
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub kind: VertexEventType,
    pub data: VertexData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VertexEventType {
    NewVertexAccepted,
    VertexMetadataChanged,
    /// Vertex types this daemon does not act on; they still advance the
    /// last-processed event id.
    #[serde(other)]
    Unknown,
}

/// Vertex payload carried by a fullnode event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VertexData {
    pub hash: TxId,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub weight: f64,
    #[serde(default)]
    pub metadata: TxMetadata,
}

/// The metadata fields this daemon monitors for changes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TxMetadata {
    #[serde(default)]
    pub voided_by: Vec<TxId>,
    #[serde(default)]
    pub first_block: Option<Vec<BlockId>>,
    #[serde(default)]
    pub height: Option<u64>,
}

/// Outcome of the metadata diff engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetadataDiffOutcome {
    Ignore,
    TxNew,
    TxVoided,
    TxUnvoided,
    TxFirstBlock,
}

impl fmt::Display for MetadataDiffOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetadataDiffOutcome::Ignore => "IGNORE",
            MetadataDiffOutcome::TxNew => "TX_NEW",
            MetadataDiffOutcome::TxVoided => "TX_VOIDED",
            MetadataDiffOutcome::TxUnvoided => "TX_UNVOIDED",
            MetadataDiffOutcome::TxFirstBlock => "TX_FIRST_BLOCK",
        };
        f.write_str(s)
    }
}

/// Diff engine result, carrying the original event for context.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataDecided {
    pub outcome: MetadataDiffOutcome,
    pub original: FullNodeEvent,
}

/// Best block pointer as reported by the fullnode or the wallet service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    pub height: u64,
}

/// A downloaded block with the transactions it confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullBlock {
    pub id: BlockId,
    pub height: u64,
    #[serde(default)]
    pub is_voided: bool,
    #[serde(default)]
    pub parents: Vec<TxId>,
    /// Transactions first confirmed by this block, as reported by the
    /// fullnode.
    #[serde(default)]
    pub transactions: Vec<TxId>,
}

/// A downloaded transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullTx {
    pub id: TxId,
    #[serde(default)]
    pub parents: Vec<TxId>,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub weight: f64,
}

/// Persisted transaction state consumed by the metadata diff engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxRecord {
    pub tx_id: TxId,
    pub height: Option<u64>,
    pub is_voided: bool,
}

/// Result emitted by the catch-up synchronizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    BlockSuccess { height: u64, block_id: BlockId, transactions: Vec<TxId> },
    TransactionFailure { block_id: BlockId, tx_id: TxId, message: String },
    Error { block_id: Option<BlockId>, message: String },
    Reorg { message: String },
    Finished,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_event_kind_display() {
        assert_eq!(EventKind::Websocket.to_string(), "WEBSOCKET_EVENT");
        assert_eq!(EventKind::Fullnode.to_string(), "FULLNODE_EVENT");
        assert_eq!(EventKind::MetadataDecided.to_string(), "METADATA_DECIDED");
    }

    #[test]
    fn test_fullnode_event_deserialization() {
        let raw = r#"
        {
            "stream_id": "stream-0",
            "peer_id": "peer-0",
            "network": "testnet",
            "event": {
                "id": 38,
                "timestamp": 1695655000,
                "type": "VERTEX_METADATA_CHANGED",
                "data": {
                    "hash": "000075e15f015dc768065763acd9b563ec002e37182869965ff2c712bed83e1e",
                    "metadata": {
                        "voided_by": ["0000000012a922a6887497bed9c41e5ed7dc7213cae107db295602168266cd02"],
                        "first_block": null,
                        "height": null
                    }
                }
            },
            "latest_event_id": 1345
        }"#;
        let ev: FullNodeEvent = serde_json::from_str(raw).expect("deserialization failed");
        assert_eq!(ev.event.kind, VertexEventType::VertexMetadataChanged);
        assert_eq!(ev.event.data.metadata.voided_by.len(), 1);
        assert_eq!(ev.event.data.metadata.height, None);
        assert_eq!(ev.latest_event_id, 1345);
    }

    #[test]
    fn test_unknown_vertex_type_is_passthrough() {
        let raw = r#"{
            "id": 1,
            "timestamp": 0,
            "type": "LOAD_STARTED",
            "data": {"hash": "00abc"}
        }"#;
        let ev: StreamedVertexEvent = serde_json::from_str(raw).expect("deserialization failed");
        assert_eq!(ev.kind, VertexEventType::Unknown);
    }

    #[test]
    fn test_sync_event_serialization() {
        let ev = SyncEvent::BlockSuccess {
            height: 3,
            block_id: "b3".to_string(),
            transactions: vec!["t1".to_string()],
        };
        let json = serde_json::to_value(&ev).expect("serialization failed");
        assert_eq!(json["type"], "block_success");
        assert_eq!(json["height"], 3);
    }
}
