//! Operations alerting.
//!
//! Fatal and abnormal conditions raise severity-tagged alerts through an
//! external notification collaborator; reorgs additionally trigger an
//! external recovery action. Transport internals are out of scope, the
//! daemon only consumes this contract.
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Failed to deliver alert: {0}")]
    Delivery(String),

    #[error("Reorg recovery invocation failed: {0}")]
    ReorgRecovery(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Minor,
    Major,
    Critical,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait OpsNotifier: Send + Sync {
    async fn add_alert(
        &self,
        title: &str,
        message: &str,
        severity: Severity,
        context: Option<serde_json::Value>,
    ) -> Result<(), NotifyError>;

    /// Kicks off the external reorg-recovery action. The current sync pass
    /// has already halted when this is called.
    async fn invoke_reorg_recovery(&self) -> Result<(), NotifyError>;
}

/// Fallback notifier that routes alerts into the log stream.
///
/// Useful for local runs where no alerting backend is wired up.
pub struct LogNotifier;

#[async_trait]
impl OpsNotifier for LogNotifier {
    async fn add_alert(
        &self,
        title: &str,
        message: &str,
        severity: Severity,
        context: Option<serde_json::Value>,
    ) -> Result<(), NotifyError> {
        error!(?severity, title, message, ?context, "Alert");
        Ok(())
    }

    async fn invoke_reorg_recovery(&self) -> Result<(), NotifyError> {
        warn!("Reorg recovery requested but no recovery backend is configured");
        Ok(())
    }
}
