//! Fullnode HTTP API client.
//!
//! The fullnode is the source of truth for confirmed blockchain state. The
//! catch-up synchronizer uses it to walk missed blocks, the state machine
//! uses it to validate the network identity of a fresh connection.
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::{Client, Url};
use serde::Deserialize;
use thiserror::Error;
use tracing::trace;

use crate::events::{Block, FullBlock, FullTx};

#[derive(Error, Debug)]
pub enum FullNodeError {
    /// The passed fullnode url failed to parse.
    #[error("Failed to parse URL: {0}. Error: {1}")]
    UrlParsing(String, String),

    /// Errors forwarded from the HTTP protocol.
    #[error("Unexpected HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// The fullnode answered but flagged the request as failed.
    #[error("Fullnode replied with an error: {0}")]
    Api(String),

    /// The response from the fullnode could not be parsed.
    #[error("Failed to parse response: {0}")]
    ParseResponse(String),
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait FullNodeClient: Send + Sync {
    /// The fullnode's current best block.
    async fn get_best_block(&self) -> Result<Block, FullNodeError>;

    /// Fetches a block (including its voidedness) by its id.
    async fn get_block_by_tx_id(&self, block_id: &str) -> Result<FullBlock, FullNodeError>;

    /// Downloads the block at the given height.
    async fn download_block_by_height(&self, height: u64) -> Result<FullBlock, FullNodeError>;

    /// Downloads a single transaction.
    async fn download_transaction(&self, tx_id: &str) -> Result<FullTx, FullNodeError>;

    /// Network name the fullnode is running on.
    async fn get_network(&self) -> Result<String, FullNodeError>;
}

#[derive(Deserialize)]
struct ApiEnvelope<T> {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(flatten)]
    payload: Option<T>,
}

impl<T> ApiEnvelope<T> {
    fn into_payload(self) -> Result<T, FullNodeError> {
        if !self.success {
            return Err(FullNodeError::Api(
                self.message
                    .unwrap_or_else(|| "unspecified fullnode error".to_string()),
            ));
        }
        self.payload
            .ok_or_else(|| FullNodeError::ParseResponse("missing payload".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct BestBlockPayload {
    block: Block,
}

#[derive(Debug, Deserialize)]
struct BlockPayload {
    block: FullBlock,
}

#[derive(Debug, Deserialize)]
struct TxPayload {
    tx: FullTx,
}

#[derive(Debug, Deserialize)]
struct VersionPayload {
    network: String,
}

#[derive(Clone)]
pub struct HttpFullNodeClient {
    http_client: Client,
    url: Url,
}

impl HttpFullNodeClient {
    pub fn new(base_url: &str) -> Result<Self, FullNodeError> {
        let url = base_url
            .parse::<Url>()
            .map_err(|e| FullNodeError::UrlParsing(base_url.to_string(), e.to_string()))?;
        Ok(Self { http_client: Client::new(), url })
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, FullNodeError> {
        let url = self
            .url
            .join(path)
            .map_err(|e| FullNodeError::UrlParsing(path.to_string(), e.to_string()))?;
        trace!(%url, "Fullnode request");
        let envelope = self
            .http_client
            .get(url)
            .query(query)
            .send()
            .await?
            .error_for_status()?
            .json::<ApiEnvelope<T>>()
            .await?;
        envelope.into_payload()
    }
}

#[async_trait]
impl FullNodeClient for HttpFullNodeClient {
    async fn get_best_block(&self) -> Result<Block, FullNodeError> {
        let payload: BestBlockPayload = self
            .get_json("v1a/best_block", &[])
            .await?;
        Ok(payload.block)
    }

    async fn get_block_by_tx_id(&self, block_id: &str) -> Result<FullBlock, FullNodeError> {
        let payload: BlockPayload = self
            .get_json("v1a/block", &[("id", block_id.to_string())])
            .await?;
        Ok(payload.block)
    }

    async fn download_block_by_height(&self, height: u64) -> Result<FullBlock, FullNodeError> {
        let payload: BlockPayload = self
            .get_json("v1a/block_at_height", &[("height", height.to_string())])
            .await?;
        Ok(payload.block)
    }

    async fn download_transaction(&self, tx_id: &str) -> Result<FullTx, FullNodeError> {
        let payload: TxPayload = self
            .get_json("v1a/transaction", &[("id", tx_id.to_string())])
            .await?;
        Ok(payload.tx)
    }

    async fn get_network(&self) -> Result<String, FullNodeError> {
        let payload: VersionPayload = self.get_json("v1a/version", &[]).await?;
        Ok(payload.network)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_envelope_rejects_failed_responses() {
        let raw = r#"{"success": false, "message": "Block not found"}"#;
        let envelope: ApiEnvelope<BlockPayload> = serde_json::from_str(raw).unwrap();
        let err = envelope.into_payload().unwrap_err();
        assert_eq!(err.to_string(), "Fullnode replied with an error: Block not found");
    }

    #[test]
    fn test_envelope_extracts_payload() {
        let raw = r#"{
            "success": true,
            "block": {
                "id": "b1",
                "height": 5,
                "is_voided": false,
                "parents": ["b0", "t1", "t2"],
                "transactions": ["t1", "t2"]
            }
        }"#;
        let envelope: ApiEnvelope<BlockPayload> = serde_json::from_str(raw).unwrap();
        let block = envelope.into_payload().unwrap().block;
        assert_eq!(block.height, 5);
        assert_eq!(block.transactions, vec!["t1".to_string(), "t2".to_string()]);
    }
}
