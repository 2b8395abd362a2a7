//! Catch-up synchronizer.
//!
//! Walks the wallet service from its best block up to the fullnode's best
//! block, one height at a time, submitting every confirmed transaction before
//! the block that confirms it. Progress and terminal conditions are reported
//! over a channel; the pass halts on the first failure so the wallet service
//! is never fed out of order.
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    events::{FullBlock, SyncEvent, TxId},
    fullnode::FullNodeClient,
    notify::{NotifyError, OpsNotifier, Severity},
    wallet_service::WalletServiceClient,
};

/// Emitted verbatim when the wallet service's best block is no longer on the
/// fullnode's best chain.
pub const REORG_DETECTED_MESSAGE: &str = "Our best block was voided, we should reorg.";

#[derive(Error, Debug)]
pub enum SynchronizerError {
    #[error("Catch-up task failed: {0}")]
    TaskFailure(String),

    #[error(transparent)]
    Notify(#[from] NotifyError),
}

/// Drives one catch-up pass between the wallet service and the fullnode.
///
/// At most one pass runs at a time; [`close`](Self::close) cancels the
/// current one and is safe to call when nothing is running.
pub struct CatchupSynchronizer<F, W> {
    fullnode: Arc<F>,
    wallet_service: Arc<W>,
    end_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl<F, W> CatchupSynchronizer<F, W>
where
    F: FullNodeClient + 'static,
    W: WalletServiceClient + 'static,
{
    pub fn new(fullnode: Arc<F>, wallet_service: Arc<W>) -> Self {
        Self { fullnode, wallet_service, end_tx: Arc::new(Mutex::new(None)) }
    }

    /// Starts a pass, cancelling a still-running previous one first.
    ///
    /// The returned receiver yields [`SyncEvent`]s; the pass ends with
    /// exactly one terminal event (`Finished`, `Reorg`, `Error` or
    /// `TransactionFailure`).
    pub fn start(&self) -> (JoinHandle<()>, mpsc::Receiver<SyncEvent>) {
        self.close();

        let (end_tx, end_rx) = oneshot::channel();
        {
            let mut guard = self
                .end_tx
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *guard = Some(end_tx);
        }

        let (event_tx, event_rx) = mpsc::channel(16);
        let fullnode = self.fullnode.clone();
        let wallet_service = self.wallet_service.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = run(fullnode, wallet_service, event_tx) => {}
                _ = end_rx => {
                    debug!("Catch-up pass cancelled");
                }
            }
        });
        (handle, event_rx)
    }

    /// Cancels the current pass, if any. Safe to call repeatedly.
    pub fn close(&self) {
        let end_tx = self
            .end_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(tx) = end_tx {
            // An Err here means the pass already finished on its own.
            let _ = tx.send(());
        }
    }
}

#[instrument(skip_all)]
async fn run<F, W>(fullnode: Arc<F>, wallet_service: Arc<W>, events: mpsc::Sender<SyncEvent>)
where
    F: FullNodeClient,
    W: WalletServiceClient,
{
    let terminal = match run_pass(fullnode.as_ref(), wallet_service.as_ref(), &events).await {
        Ok(()) => SyncEvent::Finished,
        Err(terminal) => terminal,
    };
    // The receiver hanging up just means nobody is listening anymore.
    let _ = events.send(terminal).await;
}

/// One full pass. Returns `Err` with the terminal event on any condition
/// that must halt the pass.
async fn run_pass<F, W>(
    fullnode: &F,
    wallet_service: &W,
    events: &mpsc::Sender<SyncEvent>,
) -> Result<(), SyncEvent>
where
    F: FullNodeClient,
    W: WalletServiceClient,
{
    let collaborator_err =
        |message: String| SyncEvent::Error { block_id: None, message };

    let our_best = wallet_service
        .get_best_block()
        .await
        .map_err(|e| collaborator_err(e.to_string()))?;
    let node_best = fullnode
        .get_best_block()
        .await
        .map_err(|e| collaborator_err(e.to_string()))?;
    let our_best_on_node = fullnode
        .get_block_by_tx_id(&our_best.id)
        .await
        .map_err(|e| collaborator_err(e.to_string()))?;

    if our_best_on_node.is_voided || our_best.height > node_best.height {
        return Err(SyncEvent::Reorg { message: REORG_DETECTED_MESSAGE.to_string() });
    }

    debug!(
        our_height = our_best.height,
        node_height = node_best.height,
        "Starting catch-up pass"
    );

    // Transactions already accepted by the wallet service during this pass.
    // Carried across blocks so a parent confirmed by an earlier height is
    // never re-submitted.
    let mut submitted: HashSet<TxId> = HashSet::new();
    for height in our_best.height + 1..=node_best.height {
        let block = fullnode
            .download_block_by_height(height)
            .await
            .map_err(|e| collaborator_err(e.to_string()))?;

        submit_in_dependency_order(fullnode, wallet_service, &block, &mut submitted).await?;

        wallet_service
            .send_block(&block)
            .await
            .map_err(|e| SyncEvent::Error {
                block_id: Some(block.id.clone()),
                message: e.to_string(),
            })?;

        let _ = events
            .send(SyncEvent::BlockSuccess {
                height: block.height,
                block_id: block.id.clone(),
                transactions: block.transactions.clone(),
            })
            .await;
    }
    Ok(())
}

/// Submits every transaction confirmed by `block`, parents first.
///
/// Only parents confirmed by this same block gate a submission; anything
/// outside the confirmed set is either already persisted or was submitted at
/// an earlier height. Iterative post-order so deep confirmation chains do
/// not recurse.
async fn submit_in_dependency_order<F, W>(
    fullnode: &F,
    wallet_service: &W,
    block: &FullBlock,
    submitted: &mut HashSet<TxId>,
) -> Result<(), SyncEvent>
where
    F: FullNodeClient,
    W: WalletServiceClient,
{
    let confirmed: HashSet<&TxId> = block.transactions.iter().collect();
    let mut downloads = HashMap::new();

    for root in &block.transactions {
        let mut stack = vec![root.clone()];
        while let Some(current) = stack.last().cloned() {
            if submitted.contains(&current) {
                stack.pop();
                continue;
            }
            if !downloads.contains_key(&current) {
                let tx = fullnode
                    .download_transaction(&current)
                    .await
                    .map_err(|e| SyncEvent::Error {
                        block_id: Some(block.id.clone()),
                        message: e.to_string(),
                    })?;
                downloads.insert(current.clone(), tx);
            }
            let tx = &downloads[&current];
            let pending: Vec<TxId> = tx
                .parents
                .iter()
                .filter(|p| confirmed.contains(p) && !submitted.contains(*p))
                .cloned()
                .collect();
            if pending.is_empty() {
                wallet_service
                    .send_transaction(tx)
                    .await
                    .map_err(|e| SyncEvent::TransactionFailure {
                        block_id: block.id.clone(),
                        tx_id: current.clone(),
                        message: e.to_string(),
                    })?;
                submitted.insert(current.clone());
                stack.pop();
            } else {
                stack.extend(pending);
            }
        }
    }
    Ok(())
}

/// Runs catch-up passes to completion and routes their terminal conditions
/// into the alerting backend.
pub struct CatchupDriver<F, W, N> {
    synchronizer: CatchupSynchronizer<F, W>,
    notifier: Arc<N>,
    network: String,
}

impl<F, W, N> CatchupDriver<F, W, N>
where
    F: FullNodeClient + 'static,
    W: WalletServiceClient + 'static,
    N: OpsNotifier,
{
    pub fn new(synchronizer: CatchupSynchronizer<F, W>, notifier: Arc<N>, network: String) -> Self {
        Self { synchronizer, notifier, network }
    }

    fn alert_severity(&self) -> Severity {
        if self.network == "mainnet" {
            Severity::Major
        } else {
            Severity::Minor
        }
    }

    async fn alert(&self, title: &str, message: &str, context: Option<serde_json::Value>) {
        if let Err(e) = self
            .notifier
            .add_alert(title, message, self.alert_severity(), context)
            .await
        {
            warn!(error = %e, "Failed to deliver alert");
        }
    }

    /// Runs one pass and waits for its terminal event.
    pub async fn run_once(&self) -> Result<SyncEvent, SynchronizerError> {
        let (handle, mut events) = self.synchronizer.start();

        let mut terminal = None;
        while let Some(event) = events.recv().await {
            match &event {
                SyncEvent::BlockSuccess { height, block_id, transactions } => {
                    info!(height, block_id, tx_count = transactions.len(), "Block synced");
                    continue;
                }
                SyncEvent::Finished => {
                    info!("Catch-up pass finished");
                }
                SyncEvent::TransactionFailure { block_id, tx_id, message } => {
                    error!(block_id, tx_id, message, "Transaction submission failed");
                    self.alert(
                        "Transaction submission failed",
                        message,
                        Some(serde_json::json!({ "block_id": block_id, "tx_id": tx_id })),
                    )
                    .await;
                }
                SyncEvent::Error { block_id, message } => {
                    error!(?block_id, message, "Catch-up pass failed");
                    self.alert(
                        "Catch-up pass failed",
                        message,
                        Some(serde_json::json!({ "block_id": block_id })),
                    )
                    .await;
                }
                SyncEvent::Reorg { message } => {
                    warn!(message, "Reorg detected");
                    self.alert("Reorg detected", message, None)
                        .await;
                    if let Err(e) = self
                        .notifier
                        .invoke_reorg_recovery()
                        .await
                    {
                        error!(error = %e, "Failed to invoke reorg recovery");
                    }
                }
            }
            terminal = Some(event);
        }

        handle
            .await
            .map_err(|e| SynchronizerError::TaskFailure(e.to_string()))?;
        terminal.ok_or_else(|| {
            SynchronizerError::TaskFailure("pass ended without a terminal event".to_string())
        })
    }

    pub fn close(&self) {
        self.synchronizer.close();
    }
}
