//! # liveq Protocol
//!
//! Wire protocol types and JSON codec for the liveq sync client.
//!
//! This crate provides:
//! - Versioned-state types (`StateVersion`, `Timestamp`, `QueryId`)
//! - Client→server and server→client message variants
//! - JSON encoding/decoding with exact integer timestamps
//!
//! ## Key Invariants
//!
//! - Timestamps are 64-bit signed integers on the wire, never floats
//! - A `Transition`'s `start_version` must equal the receiver's current
//!   version exactly; enforcement lives in the client crate
//! - Query tokens are canonical: equal (path, args) pairs always
//!   produce byte-identical tokens

mod error;
mod messages;
mod types;

pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    ClientMessage, Query, QuerySetModification, ServerMessage, StateModification,
};
pub use types::{
    AuthToken, FunctionArgs, FunctionPath, LogLines, QueryId, QueryToken, RequestId, SessionId,
    StateVersion, Timestamp,
};
