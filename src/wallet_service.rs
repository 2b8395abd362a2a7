//! Wallet-service submission client.
//!
//! The wallet service owns the derived database that the catch-up pass feeds.
//! Submissions are acknowledged or rejected per vertex; a rejection halts the
//! pass (the caller must not continue past a failed submission).
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::{Client, Url};
use serde::Deserialize;
use thiserror::Error;
use tracing::trace;

use crate::events::{Block, FullBlock, FullTx};

#[derive(Error, Debug)]
pub enum WalletServiceError {
    /// The passed wallet-service url failed to parse.
    #[error("Failed to parse URL: {0}. Error: {1}")]
    UrlParsing(String, String),

    /// Errors forwarded from the HTTP protocol.
    #[error("Unexpected HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// The wallet service rejected a submission.
    #[error("Submission rejected: {0}")]
    Rejected(String),
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait WalletServiceClient: Send + Sync {
    /// The wallet service's current best block.
    async fn get_best_block(&self) -> Result<Block, WalletServiceError>;

    /// Submits one transaction; `Err` means the submission was rejected or
    /// never acknowledged.
    async fn send_transaction(&self, tx: &FullTx) -> Result<(), WalletServiceError>;

    /// Submits one block after all of its transactions went through.
    async fn send_block(&self, block: &FullBlock) -> Result<(), WalletServiceError>;
}

#[derive(Deserialize)]
struct SubmitResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct BestBlockResponse {
    block: Block,
}

#[derive(Clone)]
pub struct HttpWalletServiceClient {
    http_client: Client,
    url: Url,
}

impl HttpWalletServiceClient {
    pub fn new(base_url: &str) -> Result<Self, WalletServiceError> {
        let url = base_url
            .parse::<Url>()
            .map_err(|e| WalletServiceError::UrlParsing(base_url.to_string(), e.to_string()))?;
        Ok(Self { http_client: Client::new(), url })
    }

    async fn post_json<B: serde::Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(), WalletServiceError> {
        let url = self
            .url
            .join(path)
            .map_err(|e| WalletServiceError::UrlParsing(path.to_string(), e.to_string()))?;
        trace!(%url, "Wallet service submission");
        let res = self
            .http_client
            .post(url)
            .json(body)
            .send()
            .await?
            .error_for_status()?
            .json::<SubmitResponse>()
            .await?;
        if !res.success {
            return Err(WalletServiceError::Rejected(
                res.message
                    .unwrap_or_else(|| "unspecified rejection".to_string()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl WalletServiceClient for HttpWalletServiceClient {
    async fn get_best_block(&self) -> Result<Block, WalletServiceError> {
        let url = self
            .url
            .join("best_block")
            .map_err(|e| WalletServiceError::UrlParsing("best_block".to_string(), e.to_string()))?;
        let res = self
            .http_client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<BestBlockResponse>()
            .await?;
        Ok(res.block)
    }

    async fn send_transaction(&self, tx: &FullTx) -> Result<(), WalletServiceError> {
        self.post_json("transactions", tx).await
    }

    async fn send_block(&self, block: &FullBlock) -> Result<(), WalletServiceError> {
        self.post_json("blocks", block).await
    }
}
