//! Connection state machine.
//!
//! Owns the websocket lifecycle: connect, validate the fullnode's network,
//! process stream events one at a time, and back off linearly on disconnects.
//! Identity violations (wrong peer, stream or network) are fatal; the machine
//! raises a critical alert and stops rather than follow a fullnode it was not
//! configured for.
use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle, time::sleep};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    cache::TxCache,
    config::SharedConfig,
    diff::{spawn_metadata_diff, DiffError},
    events::{Event, FullNodeEvent},
    fullnode::{FullNodeClient, FullNodeError},
    guards::{self, GuardError},
    handlers::{self, HandlerError},
    notify::{OpsNotifier, Severity},
    storage::{Storage, StorageError},
    sync::{CatchupDriver, CatchupSynchronizer},
    transport::{EventSource, TransportError},
    wallet_service::WalletServiceClient,
};

/// Linear backoff increment between reconnection attempts.
pub const BACKOFF_STEP: Duration = Duration::from_secs(1);
/// Attempts after which the backoff delay stops growing.
pub const MAX_BACKOFF_RETRIES: u32 = 10;

#[derive(Error, Debug)]
pub enum MachineError {
    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error("Stream event from unexpected peer: {0}")]
    InvalidPeerId(String),

    #[error("Stream event from unexpected stream: {0}")]
    InvalidStreamId(String),

    #[error("Fullnode network {actual} does not match configured {expected}")]
    NetworkMismatch { expected: String, actual: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Diff(#[from] DiffError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    FullNode(#[from] FullNodeError),

    #[error("Background task failed: {0}")]
    TaskFailure(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Connecting,
    Reconnecting,
    Connected(ConnectedState),
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectedState {
    ValidatingNetwork,
    Idle,
    HandlingMetadataChanged,
    HandlingVertexAccepted,
}

/// Mutable state shared between the machine and its guards.
pub struct Context {
    pub config: SharedConfig,
    pub cache: Arc<TxCache>,
    /// Id of the last event recorded and acknowledged this session.
    pub last_event_id: Option<u64>,
    /// Consecutive reconnection attempts since the last healthy connection.
    pub retry_attempt: u32,
}

impl Context {
    pub fn new(config: SharedConfig, cache: Arc<TxCache>) -> Self {
        Self { config, cache, last_event_id: None, retry_attempt: 0 }
    }
}

/// Delay before reconnection attempt `retry_attempt`.
pub fn backoff_delay(retry_attempt: u32) -> Duration {
    BACKOFF_STEP * retry_attempt.min(MAX_BACKOFF_RETRIES)
}

pub struct SyncMachine<S, F, W, N, T> {
    ctx: Context,
    state: MachineState,
    storage: Arc<S>,
    fullnode: Arc<F>,
    notifier: Arc<N>,
    source: Arc<T>,
    driver: Arc<CatchupDriver<F, W, N>>,
    events: Option<mpsc::Receiver<Event>>,
    catchup_task: Option<JoinHandle<()>>,
}

impl<S, F, W, N, T> SyncMachine<S, F, W, N, T>
where
    S: Storage + 'static,
    F: FullNodeClient + 'static,
    W: WalletServiceClient + 'static,
    N: OpsNotifier + 'static,
    T: EventSource,
{
    pub fn new(
        config: SharedConfig,
        storage: Arc<S>,
        fullnode: Arc<F>,
        wallet_service: Arc<W>,
        notifier: Arc<N>,
        source: Arc<T>,
    ) -> Self {
        let snapshot = config.read();
        let capacity =
            NonZeroUsize::new(snapshot.cache_size).unwrap_or(NonZeroUsize::MIN);
        let driver = Arc::new(CatchupDriver::new(
            CatchupSynchronizer::new(fullnode.clone(), wallet_service),
            notifier.clone(),
            snapshot.network,
        ));
        Self {
            ctx: Context::new(config, Arc::new(TxCache::new(capacity))),
            state: MachineState::Connecting,
            storage,
            fullnode,
            notifier,
            source,
            driver,
            events: None,
            catchup_task: None,
        }
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Runs until a fatal condition stops the machine.
    ///
    /// Transient failures (handshake errors, disconnects) reconnect with
    /// backoff and never surface here.
    #[instrument(skip(self))]
    pub async fn run(&mut self) -> Result<(), MachineError> {
        let res = self.run_inner().await;
        if let Err(error) = &res {
            self.state = MachineState::Errored;
            error!(%error, "Sync machine errored");
            if let Err(e) = self
                .notifier
                .add_alert("Sync daemon errored", &error.to_string(), Severity::Critical, None)
                .await
            {
                warn!(error = %e, "Failed to deliver alert");
            }
        }
        self.stop_catchup().await;
        if let Err(error) = self.source.close().await {
            debug!(%error, "Failed to close event source");
        }
        res
    }

    async fn run_inner(&mut self) -> Result<(), MachineError> {
        loop {
            match self.state {
                MachineState::Connecting => self.connect_source().await?,
                MachineState::Reconnecting => self.backoff().await,
                MachineState::Connected(ConnectedState::ValidatingNetwork) => {
                    self.validate_network().await?
                }
                MachineState::Connected(_) => self.next_event().await?,
                MachineState::Errored => return Ok(()),
            }
        }
    }

    async fn connect_source(&mut self) -> Result<(), MachineError> {
        if self.ctx.last_event_id.is_none() {
            self.ctx.last_event_id = self
                .storage
                .get_last_synced_event()
                .await?;
        }
        match self
            .source
            .connect(self.ctx.last_event_id)
            .await
        {
            Ok(events) => {
                self.events = Some(events);
                self.state = MachineState::Connected(ConnectedState::ValidatingNetwork);
            }
            Err(error) => {
                warn!(%error, "Failed to connect to event stream");
                self.state = MachineState::Reconnecting;
            }
        }
        Ok(())
    }

    async fn backoff(&mut self) {
        self.events = None;
        self.ctx.retry_attempt += 1;
        let delay = backoff_delay(self.ctx.retry_attempt);
        debug!(attempt = self.ctx.retry_attempt, ?delay, "Backing off before reconnecting");
        sleep(delay).await;
        self.state = MachineState::Connecting;
    }

    /// Confirms the fullnode serves the configured network before any event
    /// is processed. Validation failure is fatal, there is no point retrying
    /// against a fullnode we cannot trust.
    async fn validate_network(&mut self) -> Result<(), MachineError> {
        let actual = self.fullnode.get_network().await?;
        let expected = self.ctx.config.read().network;
        if actual != expected {
            return Err(MachineError::NetworkMismatch { expected, actual });
        }
        info!(network = %actual, "Fullnode network validated");
        self.ctx.retry_attempt = 0;
        self.start_catchup().await;
        self.state = MachineState::Connected(ConnectedState::Idle);
        Ok(())
    }

    async fn next_event(&mut self) -> Result<(), MachineError> {
        let Some(events) = self.events.as_mut() else {
            self.state = MachineState::Reconnecting;
            return Ok(());
        };
        match events.recv().await {
            Some(event) => self.dispatch(event).await,
            None => {
                // The transport task is gone without a disconnect frame.
                self.events = None;
                self.stop_catchup().await;
                self.state = MachineState::Reconnecting;
                Ok(())
            }
        }
    }

    async fn dispatch(&mut self, event: Event) -> Result<(), MachineError> {
        match event {
            Event::Websocket(_) => {
                if guards::websocket_disconnected(&self.ctx, &event)? {
                    info!("Event stream disconnected");
                    self.events = None;
                    self.stop_catchup().await;
                    self.state = MachineState::Reconnecting;
                }
                Ok(())
            }
            Event::Fullnode(_) => self.dispatch_fullnode(event).await,
            Event::MetadataDecided(_) => {
                // Diff results are awaited inline, the stream must not
                // produce them.
                warn!("Ignoring metadata decision from the event stream");
                Ok(())
            }
        }
    }

    async fn dispatch_fullnode(&mut self, event: Event) -> Result<(), MachineError> {
        let Event::Fullnode(ref ev) = event else { return Ok(()) };

        if guards::invalid_peer_id(&self.ctx, &event)? {
            return Err(MachineError::InvalidPeerId(ev.peer_id.clone()));
        }
        if guards::invalid_stream_id(&self.ctx, &event)? {
            return Err(MachineError::InvalidStreamId(ev.stream_id.clone()));
        }
        if guards::invalid_network(&self.ctx, &event)? {
            return Err(MachineError::NetworkMismatch {
                expected: self.ctx.config.read().network,
                actual: ev.network.clone(),
            });
        }

        let event_id = ev.event.id;
        if guards::unchanged(&self.ctx, &event)? {
            trace!(event_id, hash = %ev.event.data.hash, "Metadata unchanged, acking");
            self.record_and_ack(event_id).await;
            self.state = MachineState::Connected(ConnectedState::Idle);
            return Ok(());
        }

        // Events are recorded and acknowledged at classification time; the
        // database's own last-synced id only advances when a handler commits.
        self.record_and_ack(event_id).await;
        if guards::metadata_changed(&self.ctx, &event)? {
            self.state = MachineState::Connected(ConnectedState::HandlingMetadataChanged);
            let Event::Fullnode(ev) = event else { unreachable!() };
            self.handle_metadata_changed(ev).await?;
        } else if guards::vertex_accepted(&self.ctx, &event)? {
            self.state = MachineState::Connected(ConnectedState::HandlingVertexAccepted);
            let Event::Fullnode(ev) = event else { unreachable!() };
            self.handle_vertex_accepted(ev).await?;
        } else {
            trace!(event_id, "Ignoring unhandled vertex event type");
        }
        self.state = MachineState::Connected(ConnectedState::Idle);
        Ok(())
    }

    async fn handle_metadata_changed(&mut self, ev: FullNodeEvent) -> Result<(), MachineError> {
        let decided = spawn_metadata_diff(self.storage.clone(), ev)
            .await
            .map_err(|e| MachineError::TaskFailure(e.to_string()))??;
        let event = Event::MetadataDecided(decided);

        if guards::metadata_ignore(&self.ctx, &event)? {
            return Ok(());
        }
        let storage = self.storage.as_ref();
        let cache = self.ctx.cache.as_ref();
        if guards::metadata_voided(&self.ctx, &event)? {
            let Event::MetadataDecided(decided) = &event else { unreachable!() };
            handlers::handle_tx_voided(storage, cache, &decided.original).await?;
        } else if guards::metadata_unvoided(&self.ctx, &event)? {
            let Event::MetadataDecided(decided) = &event else { unreachable!() };
            handlers::handle_tx_unvoided(storage, cache, &decided.original).await?;
        } else if guards::metadata_new_tx(&self.ctx, &event)? {
            let Event::MetadataDecided(decided) = &event else { unreachable!() };
            handlers::handle_vertex_accepted(storage, cache, &decided.original).await?;
        } else if guards::metadata_first_block(&self.ctx, &event)? {
            let Event::MetadataDecided(decided) = &event else { unreachable!() };
            handlers::handle_tx_first_block(storage, cache, &decided.original).await?;
        }
        Ok(())
    }

    async fn handle_vertex_accepted(&mut self, ev: FullNodeEvent) -> Result<(), MachineError> {
        let event = Event::Fullnode(ev);
        if guards::voided(&self.ctx, &event)? {
            // A vertex that arrives already voided was never persisted.
            trace!("Skipping voided vertex");
            return Ok(());
        }
        let Event::Fullnode(ev) = event else { unreachable!() };
        handlers::handle_vertex_accepted(self.storage.as_ref(), &self.ctx.cache, &ev).await?;
        Ok(())
    }

    /// Records the event id locally and acknowledges it upstream.
    ///
    /// Ack failures are not fatal; a broken connection surfaces as a
    /// disconnect on the event channel.
    async fn record_and_ack(&mut self, event_id: u64) {
        self.ctx.last_event_id = Some(event_id);
        if let Err(error) = self.source.ack(event_id).await {
            warn!(%error, event_id, "Failed to acknowledge event");
        }
    }

    /// Starts a catch-up pass, stopping a still-running one first so at most
    /// one pass exists at any time.
    async fn start_catchup(&mut self) {
        self.stop_catchup().await;
        let driver = self.driver.clone();
        self.catchup_task = Some(tokio::spawn(async move {
            if let Err(error) = driver.run_once().await {
                error!(%error, "Catch-up pass failed to run");
            }
        }));
    }

    async fn stop_catchup(&mut self) {
        if let Some(task) = self.catchup_task.take() {
            self.driver.close();
            if let Err(error) = task.await {
                debug!(%error, "Catch-up task ended abnormally");
            }
        }
    }
}
