//! Wire messages exchanged over the sync socket.
//!
//! Messages are JSON objects tagged by a `type` field. Exactly one
//! message travels per socket frame, in FIFO order within a socket
//! epoch.

use crate::error::ProtocolResult;
use crate::types::{
    AuthToken, FunctionArgs, FunctionPath, LogLines, QueryId, RequestId, SessionId, StateVersion,
    Timestamp,
};
use serde::{Deserialize, Serialize};

/// A query registered with the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    /// Client-allocated id for this query.
    pub query_id: QueryId,
    /// Path of the query function.
    pub path: FunctionPath,
    /// Arguments to the query function.
    pub args: FunctionArgs,
}

/// A single change to the registered query set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum QuerySetModification {
    /// Start tracking a query.
    Add(Query),
    /// Stop tracking a query.
    Remove {
        /// Id of the query to drop.
        query_id: QueryId,
    },
}

/// A message from the client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Opens a logical session on a fresh socket.
    Connect {
        /// Stable id for the logical session, preserved across reconnects.
        session_id: SessionId,
        /// Number of sockets opened for this session so far.
        connection_count: u32,
        /// Why the previous socket closed, for server-side diagnostics.
        last_close_reason: String,
        /// Highest timestamp of a confirmed mutation, if any.
        max_observed_timestamp: Option<Timestamp>,
    },
    /// Applies a batch of changes to the registered query set.
    ModifyQuerySet {
        /// Query-set version the batch was computed against.
        base_version: u64,
        /// Query-set version after the batch.
        new_version: u64,
        /// The net Add/Remove set.
        modifications: Vec<QuerySetModification>,
    },
    /// Invokes a mutation function.
    Mutation {
        /// Correlates the eventual response.
        request_id: RequestId,
        /// Path of the mutation function.
        path: FunctionPath,
        /// Arguments to the mutation function.
        args: FunctionArgs,
    },
    /// Invokes an action function.
    Action {
        /// Correlates the eventual response.
        request_id: RequestId,
        /// Path of the action function.
        path: FunctionPath,
        /// Arguments to the action function.
        args: FunctionArgs,
    },
    /// Presents a credential for subsequent function calls.
    Authenticate {
        /// Identity version the credential was computed against.
        base_version: u64,
        /// The credential itself.
        #[serde(flatten)]
        token: AuthToken,
    },
}

/// A single change to a query's server-confirmed result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum StateModification {
    /// The query produced a new value.
    QueryUpdated {
        /// Id of the updated query.
        query_id: QueryId,
        /// The new result value.
        value: serde_json::Value,
        /// Log output of the execution.
        #[serde(default)]
        log_lines: LogLines,
        /// Opaque pagination journal, echoed back on resubscribe.
        #[serde(default)]
        journal: Option<String>,
    },
    /// The query failed.
    QueryFailed {
        /// Id of the failed query.
        query_id: QueryId,
        /// The error message.
        error_message: String,
        /// Log output of the execution.
        #[serde(default)]
        log_lines: LogLines,
    },
    /// The query was dropped from the server's set.
    ///
    /// Removal deletes the stored result entirely; it is not the same
    /// as setting the result to a loading state.
    QueryRemoved {
        /// Id of the removed query.
        query_id: QueryId,
    },
}

impl StateModification {
    /// Returns the query id this modification applies to.
    pub fn query_id(&self) -> QueryId {
        match self {
            StateModification::QueryUpdated { query_id, .. }
            | StateModification::QueryFailed { query_id, .. }
            | StateModification::QueryRemoved { query_id } => *query_id,
        }
    }
}

/// A message from the server to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Advances the connection version and carries per-query changes.
    Transition {
        /// Version the transition extends. Must match the client's
        /// current version exactly.
        start_version: StateVersion,
        /// Version after the transition.
        end_version: StateVersion,
        /// Per-query result changes.
        modifications: Vec<StateModification>,
    },
    /// Settles an outstanding mutation.
    MutationResponse {
        /// Id of the settled request.
        request_id: RequestId,
        /// Whether the mutation committed.
        success: bool,
        /// Return value, present on success.
        #[serde(default)]
        result: Option<serde_json::Value>,
        /// Error message, present on failure.
        #[serde(default)]
        error: Option<String>,
        /// Commit timestamp, present on success.
        #[serde(default)]
        ts: Option<Timestamp>,
        /// Log output of the execution.
        #[serde(default)]
        log_lines: LogLines,
    },
    /// Settles an outstanding action.
    ActionResponse {
        /// Id of the settled request.
        request_id: RequestId,
        /// Whether the action completed.
        success: bool,
        /// Return value, present on success.
        #[serde(default)]
        result: Option<serde_json::Value>,
        /// Error message, present on failure.
        #[serde(default)]
        error: Option<String>,
        /// Log output of the execution.
        #[serde(default)]
        log_lines: LogLines,
    },
    /// Rejects a presented credential.
    AuthError {
        /// Why the credential was rejected.
        error: String,
        /// Identity version the rejected `Authenticate` carried, when
        /// the server can attribute it.
        #[serde(default)]
        base_version: Option<u64>,
    },
    /// Keeps the connection's inactivity timer alive.
    Ping,
}

impl ClientMessage {
    /// Encodes the message as a JSON text frame.
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a message from a JSON text frame.
    pub fn decode(frame: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(frame)?)
    }
}

impl ServerMessage {
    /// Encodes the message as a JSON text frame.
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a message from a JSON text frame.
    pub fn decode(frame: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use proptest::prelude::*;
    use serde_json::json;

    fn sample_query() -> Query {
        Query {
            query_id: QueryId::new(0),
            path: "messages:list".parse().unwrap(),
            args: btreemap! { "channel".to_string() => json!(1) },
        }
    }

    #[test]
    fn connect_wire_shape() {
        let msg = ClientMessage::Connect {
            session_id: SessionId::nil(),
            connection_count: 2,
            last_close_reason: "ClientInactivity".into(),
            max_observed_timestamp: Some(Timestamp(17)),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "Connect");
        assert_eq!(value["connectionCount"], 2);
        assert_eq!(value["maxObservedTimestamp"], 17);
    }

    #[test]
    fn modify_query_set_roundtrip() {
        let msg = ClientMessage::ModifyQuerySet {
            base_version: 0,
            new_version: 1,
            modifications: vec![
                QuerySetModification::Add(sample_query()),
                QuerySetModification::Remove {
                    query_id: QueryId::new(3),
                },
            ],
        };
        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn authenticate_flattens_token() {
        let msg = ClientMessage::Authenticate {
            base_version: 4,
            token: AuthToken::User("jwt".into()),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "Authenticate");
        assert_eq!(value["baseVersion"], 4);
        assert_eq!(value["tokenType"], "User");
        assert_eq!(value["value"], "jwt");
    }

    #[test]
    fn transition_roundtrip() {
        let msg = ServerMessage::Transition {
            start_version: StateVersion::initial(),
            end_version: StateVersion {
                query_set: 1,
                identity: 0,
                ts: Timestamp(100),
            },
            modifications: vec![
                StateModification::QueryUpdated {
                    query_id: QueryId::new(0),
                    value: json!("X"),
                    log_lines: LogLines(vec!["ran".into()]),
                    journal: None,
                },
                StateModification::QueryRemoved {
                    query_id: QueryId::new(1),
                },
            ],
        };
        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn transition_timestamp_is_integer() {
        let msg = ServerMessage::Transition {
            start_version: StateVersion::initial(),
            end_version: StateVersion {
                query_set: 0,
                identity: 0,
                ts: Timestamp(9007199254740993),
            },
            modifications: vec![],
        };
        // 2^53 + 1 is not representable as an f64; an exact integer
        // encoding must preserve it.
        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        let ServerMessage::Transition { end_version, .. } = decoded else {
            panic!("wrong variant");
        };
        assert_eq!(end_version.ts, Timestamp(9007199254740993));
    }

    #[test]
    fn mutation_response_defaults() {
        let frame = r#"{"type":"MutationResponse","requestId":7,"success":false,"error":"boom"}"#;
        let decoded = ServerMessage::decode(frame).unwrap();
        let ServerMessage::MutationResponse {
            request_id,
            success,
            result,
            error,
            ts,
            log_lines,
        } = decoded
        else {
            panic!("wrong variant");
        };
        assert_eq!(request_id, RequestId::new(7));
        assert!(!success);
        assert_eq!(result, None);
        assert_eq!(error.as_deref(), Some("boom"));
        assert_eq!(ts, None);
        assert!(log_lines.0.is_empty());
    }

    #[test]
    fn ping_roundtrip() {
        let decoded = ServerMessage::decode(r#"{"type":"Ping"}"#).unwrap();
        assert_eq!(decoded, ServerMessage::Ping);
    }

    proptest! {
        #[test]
        fn server_message_roundtrip(
            query_set in 0u64..1000,
            identity in 0u64..10,
            ts in any::<i64>(),
            query_id in 0u32..100,
        ) {
            let msg = ServerMessage::Transition {
                start_version: StateVersion { query_set, identity, ts: Timestamp(ts) },
                end_version: StateVersion {
                    query_set,
                    identity,
                    ts: Timestamp(ts.saturating_add(1)),
                },
                modifications: vec![StateModification::QueryFailed {
                    query_id: QueryId::new(query_id),
                    error_message: "overflow".into(),
                    log_lines: LogLines::default(),
                }],
            };
            let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, msg);
        }
    }
}
