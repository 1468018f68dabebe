//! Core protocol types.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A server timestamp.
///
/// Transmitted as a fixed-width signed integer so that equality and
/// ordering comparisons are exact. Never a floating-point number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// The minimum timestamp, used as the initial value of a session.
    pub const MIN: Timestamp = Timestamp(i64::MIN);

    /// Returns the next timestamp, if one exists.
    pub fn succ(self) -> Option<Timestamp> {
        self.0.checked_add(1).map(Timestamp)
    }
}

impl From<i64> for Timestamp {
    fn from(ts: i64) -> Self {
        Timestamp(ts)
    }
}

/// The version of a connection's synced state.
///
/// Each field is monotonically non-decreasing within a logical session.
/// Socket reconnects preserve the version; only a brand-new session
/// resets it to [`StateVersion::initial`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateVersion {
    /// Version of the registered query set.
    pub query_set: u64,
    /// Version of the authenticated identity.
    pub identity: u64,
    /// Server timestamp the state is consistent at.
    pub ts: Timestamp,
}

impl StateVersion {
    /// The version every new logical session starts at.
    pub fn initial() -> Self {
        Self {
            query_set: 0,
            identity: 0,
            ts: Timestamp(0),
        }
    }
}

/// Identifies a query on the active connection.
///
/// Allocated by the client's subscription manager; small, non-negative,
/// and never reused while a reference to it is outstanding.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct QueryId(u32);

impl QueryId {
    /// Creates a query id from its raw value.
    pub fn new(id: u32) -> Self {
        QueryId(id)
    }

    /// Returns the raw id.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies an outgoing mutation or action request.
///
/// Strictly increasing within a logical session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    /// Creates a request id from its raw value.
    pub fn new(id: u64) -> Self {
        RequestId(id)
    }

    /// Returns the raw id.
    pub fn get(self) -> u64 {
        self.0
    }

    /// Returns the next request id.
    pub fn next(self) -> RequestId {
        RequestId(self.0 + 1)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a logical client session across socket reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    /// Generates a fresh random session id.
    pub fn generate() -> Self {
        SessionId(uuid::Uuid::new_v4())
    }

    /// The all-zero session id, for tests.
    pub fn nil() -> Self {
        SessionId(uuid::Uuid::nil())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Arguments to a server function, keyed by parameter name.
///
/// A `BTreeMap` keeps serialization order deterministic, which query
/// token canonicalization relies on.
pub type FunctionArgs = BTreeMap<String, serde_json::Value>;

/// A path to a server function, `module` or `module:function`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FunctionPath(String);

impl FunctionPath {
    /// Returns the path as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for FunctionPath {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty()
            || s.chars().any(char::is_whitespace)
            || s.matches(':').count() > 1
            || s.starts_with(':')
            || s.ends_with(':')
        {
            return Err(ProtocolError::InvalidFunctionPath(s.to_string()));
        }
        Ok(FunctionPath(s.to_string()))
    }
}

impl TryFrom<String> for FunctionPath {
    type Error = ProtocolError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<FunctionPath> for String {
    fn from(path: FunctionPath) -> String {
        path.0
    }
}

impl fmt::Display for FunctionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stable key identifying a (function path, arguments) pair.
///
/// Tokens are independent of wire-level query ids: a token may hold a
/// locally-visible value without ever having been sent to the server.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryToken(String);

impl QueryToken {
    /// Derives the canonical token for a (path, args) pair.
    ///
    /// `FunctionArgs` serializes with sorted keys, so equal pairs always
    /// produce byte-identical tokens.
    pub fn new(path: &FunctionPath, args: &FunctionArgs) -> Self {
        let canonical_args =
            serde_json::to_string(args).expect("FunctionArgs is always serializable");
        QueryToken(format!("{}:{}", path, canonical_args))
    }

    /// Returns the token as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An authentication credential presented to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tokenType", content = "value")]
pub enum AuthToken {
    /// No credential; the connection is unauthenticated.
    None,
    /// An end-user credential from an identity provider.
    User(String),
    /// A deployment admin credential.
    Admin(String),
}

/// Log lines produced by a server function execution.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogLines(pub Vec<String>);

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use serde_json::json;

    #[test]
    fn timestamp_is_wire_integer() {
        let ts = Timestamp(1715980547440);
        assert_eq!(serde_json::to_string(&ts).unwrap(), "1715980547440");

        let back: Timestamp = serde_json::from_str("1715980547440").unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn timestamp_succ() {
        assert_eq!(Timestamp(5).succ(), Some(Timestamp(6)));
        assert_eq!(Timestamp(i64::MAX).succ(), None);
    }

    #[test]
    fn state_version_initial() {
        let v = StateVersion::initial();
        assert_eq!(v.query_set, 0);
        assert_eq!(v.identity, 0);
        assert_eq!(v.ts, Timestamp(0));
    }

    #[test]
    fn function_path_parse() {
        assert!("messages:list".parse::<FunctionPath>().is_ok());
        assert!("messages".parse::<FunctionPath>().is_ok());

        assert!("".parse::<FunctionPath>().is_err());
        assert!("a b".parse::<FunctionPath>().is_err());
        assert!("a:b:c".parse::<FunctionPath>().is_err());
        assert!(":list".parse::<FunctionPath>().is_err());
        assert!("messages:".parse::<FunctionPath>().is_err());
    }

    #[test]
    fn query_token_canonical() {
        let path: FunctionPath = "messages:list".parse().unwrap();
        let args1 = btreemap! {
            "a".to_string() => json!(1),
            "b".to_string() => json!(2),
        };
        let mut args2 = FunctionArgs::new();
        args2.insert("b".to_string(), json!(2));
        args2.insert("a".to_string(), json!(1));

        assert_eq!(QueryToken::new(&path, &args1), QueryToken::new(&path, &args2));
    }

    #[test]
    fn query_token_distinguishes_args() {
        let path: FunctionPath = "messages:list".parse().unwrap();
        let a = QueryToken::new(&path, &btreemap! { "x".to_string() => json!(1) });
        let b = QueryToken::new(&path, &btreemap! { "x".to_string() => json!(2) });
        assert_ne!(a, b);
    }

    #[test]
    fn auth_token_wire_shape() {
        let token = AuthToken::User("jwt".into());
        let encoded = serde_json::to_value(&token).unwrap();
        assert_eq!(encoded, json!({ "tokenType": "User", "value": "jwt" }));

        let none = serde_json::to_value(&AuthToken::None).unwrap();
        assert_eq!(none, json!({ "tokenType": "None" }));
    }
}
