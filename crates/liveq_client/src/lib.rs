//! # liveq Client
//!
//! Reactive client-side sync engine for liveq.
//!
//! This crate provides:
//! - Connection lifecycle state machine with backoff-governed reconnect
//! - Versioned query-result protocol (transitions extend exact versions)
//! - Query subscriptions as async streams of consistent snapshots
//! - Optimistic updates layered over server-confirmed results
//! - Mutation ordering (callers observe their own writes)
//! - Credential lifecycle with paused traffic during token switches
//! - Websocket transport abstraction
//!
//! ## Architecture
//!
//! One background worker task owns all sync state and serializes every
//! state change; handles communicate with it over channels, so no locks
//! guard the sync state. The transport lives behind the [`Connector`]
//! trait and the whole engine runs over in-memory channels in tests.
//!
//! ## Key Invariants
//!
//! - Transitions apply only when they extend the current version exactly
//! - Every snapshot is consistent at a single state version
//! - Mutations resolve only after their effects are locally visible
//! - Optimistic writes retire in FIFO order as mutations confirm
//! - Transport failures recover via reconnect, never as caller errors

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod backoff;
mod client;
mod config;
mod error;
mod optimistic;
mod query_set;
mod remote_query_set;
mod requests;
mod results;
mod socket;
mod state;
mod subscription;
mod transport;
mod worker;

pub use auth::{AuthController, AuthState, FetchOutcome, TokenFetcher};
pub use backoff::{Backoff, CloseReason};
pub use client::SyncClient;
pub use config::{AuthChangeCallback, ClientConfig, ServerDisconnectCallback};
pub use error::{ClientError, ClientResult};
pub use optimistic::{LocalQueryStore, OptimisticOverlay, OptimisticUpdate};
pub use query_set::SubscriptionManager;
pub use remote_query_set::{RemoteQuerySet, RemoteResult};
pub use requests::RequestTracker;
pub use results::{FunctionResult, QueryResults};
pub use socket::{ManagerEvent, PauseState, ResumeOutcome, SocketManager};
pub use state::BaseClient;
pub use subscription::{QuerySetSubscription, QuerySubscription};
pub use transport::{
    close_code, is_ordinary_close, loopback, Connection, Connector, LoopbackConnector, ServerEnd,
    SocketEvent,
};
