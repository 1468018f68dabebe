//! The subscription manager: token to query-id bookkeeping and the
//! pending Add/Remove diff.

use liveq_protocol::{
    ClientMessage, FunctionArgs, FunctionPath, Query, QueryId, QuerySetModification, QueryToken,
};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug)]
struct TrackedQuery {
    query: Query,
    refcount: usize,
}

/// Reference-counts the (function, args) pairs the application cares
/// about and computes the minimal diff to send to the server.
///
/// Diffs are batched: add/remove calls between flushes collapse to the
/// net modification set, so a token subscribed and unsubscribed before
/// a flush produces no network traffic at all.
#[derive(Debug)]
pub struct SubscriptionManager {
    next_query_id: u32,
    version: u64,
    queries: BTreeMap<QueryToken, TrackedQuery>,
    pending_adds: BTreeSet<QueryToken>,
    pending_removes: BTreeSet<QueryId>,
}

impl SubscriptionManager {
    /// Creates an empty manager at query-set version zero.
    pub fn new() -> Self {
        Self {
            next_query_id: 0,
            version: 0,
            queries: BTreeMap::new(),
            pending_adds: BTreeSet::new(),
            pending_removes: BTreeSet::new(),
        }
    }

    /// The client's current query-set version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Adds a subscriber for a (path, args) pair, allocating a query id
    /// and queueing an `Add` when the refcount transitions 0 to 1.
    pub fn subscribe(&mut self, path: FunctionPath, args: FunctionArgs) -> (QueryToken, QueryId) {
        let token = QueryToken::new(&path, &args);
        if let Some(tracked) = self.queries.get_mut(&token) {
            tracked.refcount += 1;
            return (token, tracked.query.query_id);
        }
        // Ids are never reused while a reference is outstanding; a
        // resubscribe after a pending remove gets a fresh id.
        let query_id = QueryId::new(self.next_query_id);
        self.next_query_id += 1;
        self.queries.insert(
            token.clone(),
            TrackedQuery {
                query: Query {
                    query_id,
                    path,
                    args,
                },
                refcount: 1,
            },
        );
        self.pending_adds.insert(token.clone());
        (token, query_id)
    }

    /// Drops a subscriber, queueing a `Remove` when the refcount
    /// transitions 1 to 0. Unknown tokens are ignored.
    pub fn unsubscribe(&mut self, token: &QueryToken) {
        let Some(tracked) = self.queries.get_mut(token) else {
            return;
        };
        tracked.refcount -= 1;
        if tracked.refcount > 0 {
            return;
        }
        let query_id = tracked.query.query_id;
        self.queries.remove(token);
        if self.pending_adds.remove(token) {
            // Never sent; the add and the remove cancel out.
            return;
        }
        self.pending_removes.insert(query_id);
    }

    /// Drains the pending diff into one `ModifyQuerySet`, tagged with
    /// the version it was computed against. Returns `None` when there
    /// is nothing to send.
    pub fn flush(&mut self) -> Option<ClientMessage> {
        if self.pending_adds.is_empty() && self.pending_removes.is_empty() {
            return None;
        }
        let mut modifications = Vec::new();
        for query_id in std::mem::take(&mut self.pending_removes) {
            modifications.push(QuerySetModification::Remove { query_id });
        }
        for token in std::mem::take(&mut self.pending_adds) {
            if let Some(tracked) = self.queries.get(&token) {
                modifications.push(QuerySetModification::Add(tracked.query.clone()));
            }
        }
        let base_version = self.version;
        self.version += 1;
        Some(ClientMessage::ModifyQuerySet {
            base_version,
            new_version: self.version,
            modifications,
        })
    }

    /// Replaces the pending diff with the full desired subscription
    /// set, for replay after a reconnect.
    pub fn restart(&mut self) {
        self.pending_removes.clear();
        self.pending_adds = self.queries.keys().cloned().collect();
    }

    /// The token registered for a query id, if any.
    pub fn token_for_id(&self, query_id: QueryId) -> Option<&QueryToken> {
        self.queries
            .iter()
            .find(|(_, tracked)| tracked.query.query_id == query_id)
            .map(|(token, _)| token)
    }

    /// The query id registered for a token, if any.
    pub fn id_for_token(&self, token: &QueryToken) -> Option<QueryId> {
        self.queries.get(token).map(|tracked| tracked.query.query_id)
    }

    /// Iterates the live (token, id) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&QueryToken, QueryId)> {
        self.queries
            .iter()
            .map(|(token, tracked)| (token, tracked.query.query_id))
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}
