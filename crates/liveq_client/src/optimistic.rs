//! The optimistic overlay: locally-predicted query values layered over
//! the server-confirmed view.

use crate::results::{FunctionResult, QueryResults};
use liveq_protocol::{FunctionArgs, FunctionPath, QueryToken, RequestId};
use std::collections::BTreeMap;

/// A closure that predicts the effect of a mutation on local query
/// values, run synchronously at mutation-send time.
pub type OptimisticUpdate = Box<dyn FnOnce(&mut LocalQueryStore<'_>) + Send>;

#[derive(Debug)]
struct OptimisticLayer {
    request_id: RequestId,
    // `None` masks the token to a loading state; `Some` overrides it.
    writes: BTreeMap<QueryToken, Option<serde_json::Value>>,
}

/// The local view an [`OptimisticUpdate`] closure reads and writes.
///
/// Reads see all previously-applied layers and the server-confirmed
/// results beneath them. Writes land in the layer under construction
/// and become visible to snapshots as soon as the closure returns.
pub struct LocalQueryStore<'a> {
    server: &'a QueryResults,
    below: &'a [OptimisticLayer],
    writes: &'a mut BTreeMap<QueryToken, Option<serde_json::Value>>,
}

impl LocalQueryStore<'_> {
    /// The current locally-visible value for a (path, args) pair.
    ///
    /// Returns `None` when the query is loading, masked, or has failed.
    pub fn get_query(&self, path: &FunctionPath, args: &FunctionArgs) -> Option<serde_json::Value> {
        let token = QueryToken::new(path, args);
        if let Some(write) = self.writes.get(&token) {
            return write.clone();
        }
        for layer in self.below.iter().rev() {
            if let Some(write) = layer.writes.get(&token) {
                return write.clone();
            }
        }
        match self.server.get(&token) {
            Some(FunctionResult::Value(value)) => Some(value.clone()),
            Some(FunctionResult::ErrorMessage(_)) | None => None,
        }
    }

    /// Overrides the locally-visible value for a (path, args) pair.
    ///
    /// `None` marks the token as loading. The token does not need to be
    /// subscribed; unsubscribed tokens are visible in snapshots too.
    pub fn set_query(
        &mut self,
        path: &FunctionPath,
        args: &FunctionArgs,
        value: Option<serde_json::Value>,
    ) {
        self.writes.insert(QueryToken::new(path, args), value);
    }
}

/// The ordered stack of optimistic layers, one per in-flight mutation
/// that supplied an update.
///
/// Layers retire in FIFO order as their mutations complete; retired
/// writes that the confirming transition did not re-assert simply
/// revert to the server view.
#[derive(Debug, Default)]
pub struct OptimisticOverlay {
    layers: Vec<OptimisticLayer>,
}

impl OptimisticOverlay {
    /// Creates an empty overlay.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no layer is outstanding.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Runs an update closure against the given server view, recording
    /// its writes as a new topmost layer. Returns the tokens the
    /// closure touched.
    pub fn apply(
        &mut self,
        request_id: RequestId,
        update: OptimisticUpdate,
        server: &QueryResults,
    ) -> Vec<QueryToken> {
        let mut writes = BTreeMap::new();
        {
            let mut store = LocalQueryStore {
                server,
                below: &self.layers,
                writes: &mut writes,
            };
            update(&mut store);
        }
        let touched = writes.keys().cloned().collect();
        self.layers.push(OptimisticLayer { request_id, writes });
        touched
    }

    /// Drops the layer recorded for a completed request, if any.
    /// Returns the tokens whose visible value may have changed.
    pub fn retire(&mut self, request_id: RequestId) -> Vec<QueryToken> {
        let Some(index) = self
            .layers
            .iter()
            .position(|layer| layer.request_id == request_id)
        else {
            return Vec::new();
        };
        let layer = self.layers.remove(index);
        layer.writes.into_keys().collect()
    }

    /// Drops every layer, returning all affected tokens. Used when the
    /// logical session ends.
    pub fn clear(&mut self) -> Vec<QueryToken> {
        let mut touched: Vec<QueryToken> = self
            .layers
            .drain(..)
            .flat_map(|layer| layer.writes.into_keys())
            .collect();
        touched.sort();
        touched.dedup();
        touched
    }

    /// Merges the overlay onto a server snapshot, oldest layer first.
    ///
    /// A `None` write deletes the token from the snapshot (loading is
    /// absence, not null). A `Some` write inserts or overrides it, even
    /// for tokens the server has never heard of.
    pub fn view(&self, server: &QueryResults) -> QueryResults {
        let mut merged = server.clone();
        for layer in &self.layers {
            for (token, write) in &layer.writes {
                match write {
                    Some(value) => {
                        merged.insert(token.clone(), FunctionResult::Value(value.clone()));
                    }
                    None => {
                        merged.remove(token);
                    }
                }
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use serde_json::json;

    fn path(s: &str) -> FunctionPath {
        s.parse().unwrap()
    }

    fn token(s: &str) -> QueryToken {
        QueryToken::new(&path(s), &FunctionArgs::new())
    }

    fn set(s: &str, value: serde_json::Value) -> OptimisticUpdate {
        let path = path(s);
        Box::new(move |store| store.set_query(&path, &FunctionArgs::new(), Some(value)))
    }

    #[test]
    fn write_is_visible_in_view() {
        let mut overlay = OptimisticOverlay::new();
        let server = QueryResults::new();
        let touched = overlay.apply(RequestId::new(0), set("counters:get", json!(5)), &server);

        assert_eq!(touched, vec![token("counters:get")]);
        let view = overlay.view(&server);
        assert_eq!(
            view.get(&token("counters:get")),
            Some(&FunctionResult::Value(json!(5)))
        );
    }

    #[test]
    fn unsubscribed_token_appears_in_view() {
        // The written token exists only in the overlay; no server
        // result, no subscription.
        let mut overlay = OptimisticOverlay::new();
        let server = QueryResults::new();
        overlay.apply(RequestId::new(0), set("drafts:list", json!([])), &server);
        assert!(overlay.view(&server).contains_key(&token("drafts:list")));
    }

    #[test]
    fn read_sees_earlier_layers_and_server() {
        let mut overlay = OptimisticOverlay::new();
        let server = btreemap! {
            token("counters:get") => FunctionResult::Value(json!(1)),
        };
        overlay.apply(RequestId::new(0), set("counters:get", json!(2)), &server);

        let p = path("counters:get");
        overlay.apply(
            RequestId::new(1),
            Box::new(move |store| {
                let current = store.get_query(&p, &FunctionArgs::new()).unwrap();
                let bumped = current.as_i64().unwrap() + 1;
                store.set_query(&p, &FunctionArgs::new(), Some(json!(bumped)));
            }),
            &server,
        );

        assert_eq!(
            overlay.view(&server).get(&token("counters:get")),
            Some(&FunctionResult::Value(json!(3)))
        );
    }

    #[test]
    fn none_write_masks_server_value() {
        let mut overlay = OptimisticOverlay::new();
        let server = btreemap! {
            token("counters:get") => FunctionResult::Value(json!(1)),
        };
        let p = path("counters:get");
        overlay.apply(
            RequestId::new(0),
            Box::new(move |store| store.set_query(&p, &FunctionArgs::new(), None)),
            &server,
        );

        // Loading is absence, not null.
        assert!(!overlay.view(&server).contains_key(&token("counters:get")));
    }

    #[test]
    fn retire_reverts_to_server_view() {
        let mut overlay = OptimisticOverlay::new();
        let server = btreemap! {
            token("counters:get") => FunctionResult::Value(json!(1)),
        };
        overlay.apply(RequestId::new(0), set("counters:get", json!(99)), &server);

        let touched = overlay.retire(RequestId::new(0));
        assert_eq!(touched, vec![token("counters:get")]);
        assert_eq!(
            overlay.view(&server).get(&token("counters:get")),
            Some(&FunctionResult::Value(json!(1)))
        );
        assert!(overlay.is_empty());
    }

    #[test]
    fn retire_unknown_request_is_a_no_op() {
        let mut overlay = OptimisticOverlay::new();
        assert!(overlay.retire(RequestId::new(7)).is_empty());
    }

    #[test]
    fn later_layer_survives_earlier_retire() {
        let mut overlay = OptimisticOverlay::new();
        let server = QueryResults::new();
        overlay.apply(RequestId::new(0), set("counters:get", json!(1)), &server);
        overlay.apply(RequestId::new(1), set("counters:get", json!(2)), &server);

        overlay.retire(RequestId::new(0));
        assert_eq!(
            overlay.view(&server).get(&token("counters:get")),
            Some(&FunctionResult::Value(json!(2)))
        );
    }

    #[test]
    fn error_results_read_as_loading() {
        let mut overlay = OptimisticOverlay::new();
        let server = btreemap! {
            token("counters:get") => FunctionResult::ErrorMessage("boom".into()),
        };
        let p = path("counters:get");
        overlay.apply(
            RequestId::new(0),
            Box::new(move |store| {
                assert_eq!(store.get_query(&p, &FunctionArgs::new()), None);
            }),
            &server,
        );
    }

    #[test]
    fn clear_drops_everything() {
        let mut overlay = OptimisticOverlay::new();
        let server = QueryResults::new();
        overlay.apply(RequestId::new(0), set("a:x", json!(1)), &server);
        overlay.apply(RequestId::new(1), set("b:y", json!(2)), &server);

        let touched = overlay.clear();
        assert_eq!(touched.len(), 2);
        assert!(overlay.view(&server).is_empty());
    }
}
