//! Result types shared across the engine.

use liveq_protocol::QueryToken;
use std::collections::BTreeMap;

/// The outcome of a server function: a value or an application error.
///
/// Application errors travel as ordinary results, not as transport
/// failures; they settle only the request that raised them.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionResult {
    /// The function returned a value.
    Value(serde_json::Value),
    /// The function threw an error.
    ErrorMessage(String),
}

/// A consistent snapshot of every locally-known query result, keyed by
/// query token.
///
/// Absence means "no confirmed value yet", not null. Snapshots include
/// optimistic overrides, so a token may appear here without ever having
/// been subscribed.
pub type QueryResults = BTreeMap<QueryToken, FunctionResult>;
