//! Tracks in-flight mutations and actions and the mutation-ordering
//! watermark.

use crate::error::{ClientError, ClientResult};
use crate::results::FunctionResult;
use liveq_protocol::{ClientMessage, FunctionArgs, FunctionPath, RequestId, Timestamp};
use std::collections::BTreeMap;
use tokio::sync::oneshot;

#[derive(Debug)]
enum PendingState {
    /// Sent (or queued); no response yet.
    AwaitingResponse,
    /// Mutation committed; waiting for a transition covering its
    /// timestamp before resolving, so the caller observes its own write.
    AwaitingTransition {
        result: FunctionResult,
        ts: Timestamp,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Mutation,
    Action,
}

#[derive(Debug)]
struct PendingRequest {
    kind: RequestKind,
    path: FunctionPath,
    args: FunctionArgs,
    sender: oneshot::Sender<ClientResult<FunctionResult>>,
    state: PendingState,
}

/// Allocates request ids and settles mutation/action futures in the
/// order the protocol guarantees.
///
/// A successful mutation resolves only after a transition at or past
/// its commit timestamp has been applied; failed mutations and all
/// actions settle as soon as their response arrives.
#[derive(Debug, Default)]
pub struct RequestTracker {
    next_request_id: RequestId,
    pending: BTreeMap<RequestId, PendingRequest>,
    max_observed_timestamp: Option<Timestamp>,
}

impl RequestTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// The highest mutation timestamp this session has confirmed.
    pub fn max_observed_timestamp(&self) -> Option<Timestamp> {
        self.max_observed_timestamp
    }

    /// Registers a mutation, returning its wire message and the
    /// receiver its outcome will resolve through.
    pub fn register_mutation(
        &mut self,
        path: FunctionPath,
        args: FunctionArgs,
    ) -> (
        RequestId,
        ClientMessage,
        oneshot::Receiver<ClientResult<FunctionResult>>,
    ) {
        self.register(RequestKind::Mutation, path, args)
    }

    /// Registers an action, returning its wire message and the receiver
    /// its outcome will resolve through.
    pub fn register_action(
        &mut self,
        path: FunctionPath,
        args: FunctionArgs,
    ) -> (
        RequestId,
        ClientMessage,
        oneshot::Receiver<ClientResult<FunctionResult>>,
    ) {
        self.register(RequestKind::Action, path, args)
    }

    fn register(
        &mut self,
        kind: RequestKind,
        path: FunctionPath,
        args: FunctionArgs,
    ) -> (
        RequestId,
        ClientMessage,
        oneshot::Receiver<ClientResult<FunctionResult>>,
    ) {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.next();
        let (sender, receiver) = oneshot::channel();
        let message = match kind {
            RequestKind::Mutation => ClientMessage::Mutation {
                request_id,
                path: path.clone(),
                args: args.clone(),
            },
            RequestKind::Action => ClientMessage::Action {
                request_id,
                path: path.clone(),
                args: args.clone(),
            },
        };
        self.pending.insert(
            request_id,
            PendingRequest {
                kind,
                path,
                args,
                sender,
                state: PendingState::AwaitingResponse,
            },
        );
        (request_id, message, receiver)
    }

    /// Handles a `MutationResponse`. Returns true when the request
    /// settled immediately (a failure), so the caller can retire its
    /// optimistic layer.
    pub fn mutation_response(
        &mut self,
        request_id: RequestId,
        success: bool,
        result: Option<serde_json::Value>,
        error: Option<String>,
        ts: Option<Timestamp>,
    ) -> bool {
        if !self.pending.contains_key(&request_id) {
            tracing::warn!(%request_id, "mutation response for unknown request");
            return false;
        }
        if !success {
            let message = error.unwrap_or_else(|| "mutation failed".to_string());
            let request = self.pending.remove(&request_id).expect("present above");
            let _ = request
                .sender
                .send(Ok(FunctionResult::ErrorMessage(message)));
            return true;
        }
        let ts = ts.unwrap_or(Timestamp::MIN);
        self.advance_watermark(ts);
        let request = self.pending.get_mut(&request_id).expect("present above");
        request.state = PendingState::AwaitingTransition {
            result: FunctionResult::Value(result.unwrap_or(serde_json::Value::Null)),
            ts,
        };
        false
    }

    /// Handles an `ActionResponse`, settling the request immediately.
    pub fn action_response(
        &mut self,
        request_id: RequestId,
        success: bool,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        let Some(request) = self.pending.remove(&request_id) else {
            tracing::warn!(%request_id, "action response for unknown request");
            return;
        };
        let outcome = if success {
            FunctionResult::Value(result.unwrap_or(serde_json::Value::Null))
        } else {
            FunctionResult::ErrorMessage(error.unwrap_or_else(|| "action failed".to_string()))
        };
        let _ = request.sender.send(Ok(outcome));
    }

    /// Records that a transition at `ts` has been applied. Resolves
    /// every committed mutation whose timestamp is now covered and
    /// returns their ids, in request order.
    ///
    /// The watermark tracks confirmed mutations only; a query-only
    /// transition leaves it alone.
    pub fn observe_ts(&mut self, ts: Timestamp) -> Vec<RequestId> {
        let completed: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, request)| {
                matches!(
                    request.state,
                    PendingState::AwaitingTransition { ts: commit_ts, .. } if commit_ts <= ts
                )
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &completed {
            let request = self.pending.remove(id).expect("id collected above");
            let PendingState::AwaitingTransition { result, .. } = request.state else {
                unreachable!("filtered on AwaitingTransition");
            };
            let _ = request.sender.send(Ok(result));
        }
        completed
    }

    fn advance_watermark(&mut self, ts: Timestamp) {
        if self.max_observed_timestamp.is_none_or(|max| ts > max) {
            self.max_observed_timestamp = Some(ts);
        }
    }

    /// Produces the messages to replay on a fresh socket: every
    /// mutation still awaiting its response, in request order.
    ///
    /// Mutations already awaiting a transition keep waiting; the new
    /// socket's transitions cover them. In-flight actions are not
    /// idempotent and are rejected instead.
    pub fn resend_mutations(&mut self) -> Vec<ClientMessage> {
        let action_ids: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, request)| {
                request.kind == RequestKind::Action
                    && matches!(request.state, PendingState::AwaitingResponse)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in action_ids {
            let request = self.pending.remove(&id).expect("id collected above");
            let _ = request
                .sender
                .send(Err(ClientError::ConnectionLost("an action".to_string())));
        }

        self.pending
            .iter()
            .filter(|(_, request)| {
                request.kind == RequestKind::Mutation
                    && matches!(request.state, PendingState::AwaitingResponse)
            })
            .map(|(id, request)| ClientMessage::Mutation {
                request_id: *id,
                path: request.path.clone(),
                args: request.args.clone(),
            })
            .collect()
    }

    /// Rejects every pending request. Called when the client shuts
    /// down for good.
    pub fn shutdown(&mut self) {
        for (_, request) in std::mem::take(&mut self.pending) {
            let _ = request.sender.send(Err(ClientError::ClientClosed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(s: &str) -> FunctionPath {
        s.parse().unwrap()
    }

    #[test]
    fn mutation_resolves_only_after_covering_transition() {
        let mut tracker = RequestTracker::new();
        let (id, _, mut receiver) =
            tracker.register_mutation(path("messages:send"), FunctionArgs::new());

        let settled =
            tracker.mutation_response(id, true, Some(json!("ok")), None, Some(Timestamp(100)));
        assert!(!settled);
        assert!(receiver.try_recv().is_err());

        // A transition short of the commit timestamp does not resolve.
        assert!(tracker.observe_ts(Timestamp(99)).is_empty());
        assert!(receiver.try_recv().is_err());

        let completed = tracker.observe_ts(Timestamp(100));
        assert_eq!(completed, vec![id]);
        assert_eq!(
            receiver.try_recv().unwrap().unwrap(),
            FunctionResult::Value(json!("ok"))
        );
    }

    #[test]
    fn failed_mutation_settles_immediately() {
        let mut tracker = RequestTracker::new();
        let (id, _, mut receiver) =
            tracker.register_mutation(path("messages:send"), FunctionArgs::new());

        let settled = tracker.mutation_response(id, false, None, Some("conflict".into()), None);
        assert!(settled);
        assert_eq!(
            receiver.try_recv().unwrap().unwrap(),
            FunctionResult::ErrorMessage("conflict".into())
        );
    }

    #[test]
    fn action_settles_on_response() {
        let mut tracker = RequestTracker::new();
        let (id, _, mut receiver) =
            tracker.register_action(path("email:send"), FunctionArgs::new());

        tracker.action_response(id, true, Some(json!(true)), None);
        assert_eq!(
            receiver.try_recv().unwrap().unwrap(),
            FunctionResult::Value(json!(true))
        );
    }

    #[test]
    fn watermark_advances_only_on_confirmed_mutations() {
        let mut tracker = RequestTracker::new();

        // Query-only transitions never touch the watermark.
        tracker.observe_ts(Timestamp(50));
        assert_eq!(tracker.max_observed_timestamp(), None);

        let (id, _, _receiver) =
            tracker.register_mutation(path("messages:send"), FunctionArgs::new());
        tracker.mutation_response(id, true, None, None, Some(Timestamp(80)));
        assert_eq!(tracker.max_observed_timestamp(), Some(Timestamp(80)));

        // An older commit never moves it backward.
        let (id2, _, _receiver2) =
            tracker.register_mutation(path("messages:send"), FunctionArgs::new());
        tracker.mutation_response(id2, true, None, None, Some(Timestamp(20)));
        assert_eq!(tracker.max_observed_timestamp(), Some(Timestamp(80)));

        tracker.observe_ts(Timestamp(200));
        assert_eq!(tracker.max_observed_timestamp(), Some(Timestamp(80)));
    }

    #[test]
    fn request_ids_strictly_increase() {
        let mut tracker = RequestTracker::new();
        let (id1, _, _r1) = tracker.register_mutation(path("a:b"), FunctionArgs::new());
        let (id2, _, _r2) = tracker.register_action(path("c:d"), FunctionArgs::new());
        assert!(id2 > id1);
    }

    #[test]
    fn resend_replays_unanswered_mutations_and_rejects_actions() {
        let mut tracker = RequestTracker::new();
        let (m1, _, _r1) = tracker.register_mutation(path("a:b"), FunctionArgs::new());
        let (m2, _, _r2) = tracker.register_mutation(path("c:d"), FunctionArgs::new());
        let (a1, _, mut action_receiver) =
            tracker.register_action(path("e:f"), FunctionArgs::new());

        // m2 already committed and awaits its transition.
        tracker.mutation_response(m2, true, None, None, Some(Timestamp(10)));

        let resent = tracker.resend_mutations();
        assert_eq!(resent.len(), 1);
        assert!(
            matches!(&resent[0], ClientMessage::Mutation { request_id, .. } if *request_id == m1)
        );

        let err = action_receiver.try_recv().unwrap().unwrap_err();
        assert!(matches!(err, ClientError::ConnectionLost(_)));
        let _ = a1;
    }

    #[test]
    fn shutdown_rejects_everything() {
        let mut tracker = RequestTracker::new();
        let (_, _, mut r1) = tracker.register_mutation(path("a:b"), FunctionArgs::new());
        let (_, _, mut r2) = tracker.register_action(path("c:d"), FunctionArgs::new());

        tracker.shutdown();
        assert!(matches!(
            r1.try_recv().unwrap(),
            Err(ClientError::ClientClosed)
        ));
        assert!(matches!(
            r2.try_recv().unwrap(),
            Err(ClientError::ClientClosed)
        ));
    }
}
