//! The server-confirmed query results, gated by a monotonic version.

use crate::error::{ClientError, ClientResult};
use liveq_protocol::{LogLines, QueryId, StateModification, StateVersion};
use std::collections::BTreeMap;

/// A server-confirmed result for one query id.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResult {
    /// The value, or the error message the query failed with.
    pub result: Result<serde_json::Value, String>,
    /// Log output of the execution that produced the result.
    pub log_lines: LogLines,
}

/// The mapping from query id to last-known server result.
///
/// Transitions apply only when they extend the current version exactly;
/// anything else is a protocol violation that forces a fresh
/// connection rather than a silent desync.
#[derive(Debug)]
pub struct RemoteQuerySet {
    version: StateVersion,
    results: BTreeMap<QueryId, RemoteResult>,
}

impl RemoteQuerySet {
    /// Creates an empty set at the initial version.
    pub fn new() -> Self {
        Self {
            version: StateVersion::initial(),
            results: BTreeMap::new(),
        }
    }

    /// The current confirmed version.
    pub fn version(&self) -> StateVersion {
        self.version
    }

    /// The confirmed result for a query id, if any.
    pub fn get(&self, query_id: QueryId) -> Option<&RemoteResult> {
        self.results.get(&query_id)
    }

    /// Applies a transition, advancing to `end_version`.
    ///
    /// Rejects without mutating state unless `start_version` equals the
    /// current version exactly. Updates for ids outside the registered
    /// query set are still applied: the server's view of the query set
    /// can lag the client's most recent subscription message.
    pub fn apply_transition(
        &mut self,
        start_version: StateVersion,
        end_version: StateVersion,
        modifications: Vec<StateModification>,
    ) -> ClientResult<()> {
        if start_version != self.version {
            return Err(ClientError::VersionMismatch {
                expected: self.version,
                actual: start_version,
            });
        }
        for modification in modifications {
            match modification {
                StateModification::QueryUpdated {
                    query_id,
                    value,
                    log_lines,
                    journal: _,
                } => {
                    self.results.insert(
                        query_id,
                        RemoteResult {
                            result: Ok(value),
                            log_lines,
                        },
                    );
                }
                StateModification::QueryFailed {
                    query_id,
                    error_message,
                    log_lines,
                } => {
                    self.results.insert(
                        query_id,
                        RemoteResult {
                            result: Err(error_message),
                            log_lines,
                        },
                    );
                }
                StateModification::QueryRemoved { query_id } => {
                    // Removal deletes the stored result; it is not a
                    // transition to a loading state.
                    self.results.remove(&query_id);
                }
            }
        }
        self.version = end_version;
        Ok(())
    }
}

impl Default for RemoteQuerySet {
    fn default() -> Self {
        Self::new()
    }
}
