//! The synchronous core of the engine: every piece of sync state and
//! the rules for advancing it, with no sockets or tasks in sight.

use crate::auth::AuthController;
use crate::error::ClientResult;
use crate::optimistic::{OptimisticOverlay, OptimisticUpdate};
use crate::query_set::SubscriptionManager;
use crate::remote_query_set::RemoteQuerySet;
use crate::requests::RequestTracker;
use crate::results::{FunctionResult, QueryResults};
use liveq_protocol::{
    ClientMessage, FunctionArgs, FunctionPath, QueryId, QueryToken, ServerMessage, Timestamp,
};
use std::collections::VecDeque;
use tokio::sync::oneshot;

/// The sync engine's state, advanced one message or request at a time.
///
/// Methods that change any locally-visible query value return a fresh
/// [`QueryResults`] snapshot for the caller to broadcast; `None` means
/// nothing a watcher could observe has changed.
#[derive(Default)]
pub struct BaseClient {
    remote: RemoteQuerySet,
    subscriptions: SubscriptionManager,
    overlay: OptimisticOverlay,
    requests: RequestTracker,
    auth: AuthController,
    outgoing: VecDeque<ClientMessage>,
}

impl BaseClient {
    /// Creates an empty client at the initial state version.
    pub fn new() -> Self {
        Self::default()
    }

    /// The highest confirmed mutation timestamp, for `Connect`.
    pub fn max_observed_timestamp(&self) -> Option<Timestamp> {
        self.requests.max_observed_timestamp()
    }

    /// The auth controller, for the worker's fetch orchestration.
    pub fn auth(&self) -> &AuthController {
        &self.auth
    }

    /// Registers interest in a query. The returned token keys every
    /// subsequent snapshot.
    pub fn subscribe(&mut self, path: FunctionPath, args: FunctionArgs) -> (QueryToken, QueryId) {
        self.subscriptions.subscribe(path, args)
    }

    /// Drops one registration of a token.
    pub fn unsubscribe(&mut self, token: &QueryToken) {
        self.subscriptions.unsubscribe(token);
    }

    /// Queues a mutation. When an optimistic update is supplied and its
    /// writes change the visible state, the new snapshot comes back for
    /// immediate broadcast.
    pub fn mutation(
        &mut self,
        path: FunctionPath,
        args: FunctionArgs,
        optimistic: Option<OptimisticUpdate>,
    ) -> (
        oneshot::Receiver<ClientResult<FunctionResult>>,
        Option<QueryResults>,
    ) {
        let (request_id, message, receiver) = self.requests.register_mutation(path, args);
        let notify = optimistic.and_then(|update| {
            let server = self.server_view();
            let touched = self.overlay.apply(request_id, update, &server);
            (!touched.is_empty()).then(|| self.latest_results())
        });
        self.outgoing.push_back(message);
        (receiver, notify)
    }

    /// Queues an action.
    pub fn action(
        &mut self,
        path: FunctionPath,
        args: FunctionArgs,
    ) -> oneshot::Receiver<ClientResult<FunctionResult>> {
        let (_, message, receiver) = self.requests.register_action(path, args);
        self.outgoing.push_back(message);
        receiver
    }

    /// Marks an auth fetch as started.
    pub fn begin_auth_fetch(&mut self) {
        self.auth.begin_fetch();
    }

    /// Consumes a finished auth fetch. A produced `Authenticate` jumps
    /// the queue so it precedes any traffic buffered during the pause.
    /// Returns the authenticated flag to report.
    pub fn finish_auth_fetch(&mut self, token: Option<String>) -> bool {
        let outcome = self.auth.finish_fetch(token);
        if let Some(message) = outcome.message {
            self.outgoing.push_front(message);
        }
        outcome.authenticated
    }

    /// Withdraws the credential.
    pub fn clear_auth(&mut self) {
        let message = self.auth.clear();
        self.outgoing.push_front(message);
    }

    /// Handles a server `AuthError`. Returns true when the worker
    /// should start a forced-refresh fetch.
    pub fn observe_auth_error(&mut self, error: &str) -> bool {
        self.auth.auth_error(error)
    }

    /// Applies one server message.
    ///
    /// Returns the snapshot to broadcast, when the message changed
    /// anything visible. Version mismatches surface as errors so the
    /// worker can force a reconnect instead of desyncing.
    pub fn receive_message(&mut self, message: ServerMessage) -> ClientResult<Option<QueryResults>> {
        match message {
            ServerMessage::Transition {
                start_version,
                end_version,
                modifications,
            } => {
                self.remote
                    .apply_transition(start_version, end_version, modifications)?;
                self.auth.observe_identity(end_version.identity);
                for request_id in self.requests.observe_ts(end_version.ts) {
                    self.overlay.retire(request_id);
                }
                Ok(Some(self.latest_results()))
            }
            ServerMessage::MutationResponse {
                request_id,
                success,
                result,
                error,
                ts,
                log_lines: _,
            } => {
                let failed_now = self
                    .requests
                    .mutation_response(request_id, success, result, error, ts);
                if failed_now && !self.overlay.retire(request_id).is_empty() {
                    // The failed mutation's optimistic writes revert.
                    return Ok(Some(self.latest_results()));
                }
                Ok(None)
            }
            ServerMessage::ActionResponse {
                request_id,
                success,
                result,
                error,
                log_lines: _,
            } => {
                self.requests
                    .action_response(request_id, success, result, error);
                Ok(None)
            }
            // Handled upstream by the worker; inert here.
            ServerMessage::AuthError { .. } | ServerMessage::Ping => Ok(None),
        }
    }

    /// The locally-visible result for a token, if any.
    pub fn local_query_result(&self, token: &QueryToken) -> Option<FunctionResult> {
        self.latest_results().get(token).cloned()
    }

    /// The full locally-visible snapshot: confirmed results for every
    /// registered token, with optimistic writes layered on top.
    pub fn latest_results(&self) -> QueryResults {
        self.overlay.view(&self.server_view())
    }

    fn server_view(&self) -> QueryResults {
        let mut view = QueryResults::new();
        for (token, query_id) in self.subscriptions.iter() {
            if let Some(remote) = self.remote.get(query_id) {
                let result = match &remote.result {
                    Ok(value) => FunctionResult::Value(value.clone()),
                    Err(message) => FunctionResult::ErrorMessage(message.clone()),
                };
                view.insert(token.clone(), result);
            }
        }
        view
    }

    /// The next frame to put on the wire, folding in any pending
    /// query-set diff. `None` when fully flushed.
    pub fn pop_next_message(&mut self) -> Option<ClientMessage> {
        if let Some(message) = self.subscriptions.flush() {
            self.outgoing.push_back(message);
        }
        self.outgoing.pop_front()
    }

    /// Puts a popped message back at the head of the queue, for when
    /// the socket refused it.
    pub fn requeue_front(&mut self, message: ClientMessage) {
        self.outgoing.push_front(message);
    }

    /// Rebuilds the outgoing queue for a fresh socket: the full live
    /// query set plus every unanswered mutation. Unsent `Authenticate`
    /// messages survive; everything else superseded is dropped.
    pub fn resend_ongoing_queries_mutations(&mut self) {
        self.outgoing
            .retain(|message| matches!(message, ClientMessage::Authenticate { .. }));
        self.subscriptions.restart();
        for message in self.requests.resend_mutations() {
            self.outgoing.push_back(message);
        }
    }

    /// Rejects everything pending and drops optimistic state. The
    /// client is done.
    pub fn shutdown(&mut self) {
        self.requests.shutdown();
        self.overlay.clear();
    }
}
