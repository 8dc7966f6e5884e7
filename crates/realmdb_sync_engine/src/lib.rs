//! # realmdb sync engine
//!
//! Keeps local realms in sync with a server.
//!
//! This crate provides:
//! - [`SyncManager`]: one sync client thread and a session per realm file
//! - [`SyncSession`]: lifecycle, progress, connection state and waits
//! - Flexible sync subscriptions ([`SubscriptionSet`],
//!   [`MutableSubscriptionSet`])
//! - Client reset in manual, discard and recover modes
//! - A transport abstraction with an in-process [`MockTransport`]
//!
//! ## Architecture
//!
//! Every session is driven by a state machine on the sync client thread.
//! Local commits are captured as changesets and uploaded; server changes
//! are integrated with a sync-origin commit so they are never uploaded
//! back. A download acknowledges the uploads the server integrated.
//!
//! Flexible sync sets go through `Pending`, `Bootstrapping` and
//! `AwaitingMark` to `Complete`. A set becomes active only once its
//! bootstrap is in the realm and the server has answered a mark sent
//! after it.
//!
//! Callbacks run on the realm's scheduler when it has one, otherwise on
//! the sync client thread.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod driver;
mod error;
mod error_info;
mod history;
mod manager;
mod progress;
mod session;
mod subscriptions;
mod transport;
mod user;

pub use config::{
    AfterResetCallback, BeforeResetCallback, ClientResyncMode, ErrorHandler, InitialSubscriptions,
    ReconnectMode, ResumptionDelay, StopPolicy, SyncClientConfig, SyncConfig, SyncMode,
};
pub use error::{SyncError, SyncResult};
pub use error_info::{SyncErrorInfo, ORIGINAL_FILE_PATH_KEY, RECOVERY_FILE_PATH_KEY};
pub use manager::{FileAction, SyncManager};
pub use progress::{Progress, ProgressCallback, ProgressDirection};
pub use session::{ConnectionState, ConnectionStateCallback, SessionState, SyncSession};
pub use subscriptions::{MutableSubscriptionSet, Subscription, SubscriptionSet, SubscriptionSetState};
pub use transport::{ConnectParams, MockTransport, SyncConnection, SyncTransport};
pub use user::{SyncUser, TokenUser, UserState};
