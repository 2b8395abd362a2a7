//! # Vertex Indexer
//!
//! Reconciliation core of a wallet-service indexing daemon. The daemon
//! follows a fullnode's vertex event stream over a websocket, decides for
//! every event whether the persisted state needs to change, and applies those
//! changes transactionally. A separate catch-up pass walks missed blocks when
//! the daemon falls behind and detects chain reorganizations.
//!
//! The moving parts:
//!
//! - [`machine`]: the connection state machine driving the event loop,
//!   reconnection backoff and identity validation.
//! - [`guards`]: pure predicates the machine uses to classify events.
//! - [`diff`]: the metadata diff engine deciding what changed for a vertex.
//! - [`cache`]: a bounded LRU of metadata fingerprints used to skip events
//!   that carry no observable change.
//! - [`handlers`]: transactional persistence of each decided change.
//! - [`sync`]: the block-by-block catch-up synchronizer with reorg detection.
//! - [`transport`], [`fullnode`], [`wallet_service`], [`notify`], [`storage`]:
//!   the collaborator seams (websocket stream, HTTP APIs, alerting, database).
pub mod cache;
pub mod cli;
pub mod config;
pub mod diff;
pub mod events;
pub mod fullnode;
pub mod guards;
pub mod handlers;
pub mod machine;
pub mod notify;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod wallet_service;

pub use cache::TxCache;
pub use config::{DaemonConfig, SharedConfig};
pub use fullnode::HttpFullNodeClient;
pub use machine::SyncMachine;
pub use sync::{CatchupDriver, CatchupSynchronizer};
pub use transport::WsEventSource;
pub use wallet_service::HttpWalletServiceClient;
