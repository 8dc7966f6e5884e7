//! # realmdb sync server
//!
//! Reference server for realmdb synchronization.
//!
//! The server keeps one realm per partition value plus one realm for
//! flexible sync, each with an in-memory history of integrated changesets.
//! It:
//! - Hands out client file identities and checks them on bind
//! - Validates HMAC-signed access tokens
//! - Integrates uploads and forwards them to other sessions
//! - Bootstraps new clients and new subscription sets
//! - Reverts writes outside a session's subscriptions or permissions with
//!   compensating write errors
//!
//! Test hooks take the server offline, forget a realm's history to force
//! client resets, and inject protocol errors.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod config;
mod error;
mod handler;
mod history;
mod server;

pub use auth::{AuthConfig, TokenValidator};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use server::{ServerConnection, SyncServer};
