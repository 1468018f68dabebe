//! The single event-driven task that owns all sync state.
//!
//! Everything mutable lives here: the base client, the transport state
//! machine, and any in-flight auth fetch. Handles talk to the worker
//! over an unbounded request channel and hear back through oneshots and
//! the snapshot broadcast, so no locks guard the sync state.

use crate::auth::TokenFetcher;
use crate::config::{AuthChangeCallback, ClientConfig};
use crate::error::ClientResult;
use crate::optimistic::OptimisticUpdate;
use crate::results::{FunctionResult, QueryResults};
use crate::socket::{ManagerEvent, ResumeOutcome, SocketManager};
use crate::state::BaseClient;
use crate::transport::Connector;
use futures::future::BoxFuture;
use liveq_protocol::{
    ClientMessage, FunctionArgs, FunctionPath, QueryToken, ServerMessage, SessionId,
};
use tokio::sync::{broadcast, mpsc, oneshot};

/// A request from a client handle.
pub(crate) enum ClientRequest {
    /// Register interest in a query.
    Subscribe {
        path: FunctionPath,
        args: FunctionArgs,
        result: oneshot::Sender<(QueryToken, Option<FunctionResult>)>,
    },
    /// Release one registration of a token.
    Unsubscribe { token: QueryToken },
    /// Run a mutation, optionally with an optimistic update.
    Mutation {
        path: FunctionPath,
        args: FunctionArgs,
        update: Option<OptimisticUpdate>,
        result: oneshot::Sender<oneshot::Receiver<ClientResult<FunctionResult>>>,
    },
    /// Run an action.
    Action {
        path: FunctionPath,
        args: FunctionArgs,
        result: oneshot::Sender<oneshot::Receiver<ClientResult<FunctionResult>>>,
    },
    /// Install a credential fetcher and authenticate with it.
    SetAuth { fetcher: Box<dyn TokenFetcher> },
    /// Withdraw the credential.
    ClearAuth,
    /// Read the locally-visible value for a token.
    LocalQueryResult {
        token: QueryToken,
        result: oneshot::Sender<Option<FunctionResult>>,
    },
    /// Close the socket and stay offline until `Restart`.
    Stop,
    /// Reconnect after a `Stop`.
    Restart,
}

pub(crate) struct Worker<C: Connector> {
    base: BaseClient,
    manager: SocketManager<C>,
    requests: mpsc::UnboundedReceiver<ClientRequest>,
    snapshots: broadcast::Sender<QueryResults>,
    session_id: SessionId,
    fetcher: Option<Box<dyn TokenFetcher>>,
    auth_fetch: Option<BoxFuture<'static, Option<String>>>,
    on_auth_change: Option<AuthChangeCallback>,
}

impl<C: Connector> Worker<C> {
    pub(crate) fn new(
        connector: C,
        config: &ClientConfig,
        requests: mpsc::UnboundedReceiver<ClientRequest>,
        snapshots: broadcast::Sender<QueryResults>,
    ) -> Self {
        Self {
            base: BaseClient::new(),
            manager: SocketManager::new(connector, config),
            requests,
            snapshots,
            session_id: SessionId::generate(),
            fetcher: None,
            auth_fetch: None,
            on_auth_change: config.on_auth_change.clone(),
        }
    }

    /// Runs until every client handle is dropped.
    pub(crate) async fn run(mut self) {
        tracing::debug!(session_id = %self.session_id, "sync worker started");
        self.manager.open();
        loop {
            self.flush();
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => break,
                },
                event = self.manager.next_event() => self.handle_event(event),
                token = async { self.auth_fetch.as_mut().expect("guarded by branch condition").await },
                        if self.auth_fetch.is_some() => {
                    self.auth_fetch = None;
                    self.finish_auth(token);
                }
            }
        }
        self.base.shutdown();
        self.manager.terminate();
        tracing::debug!(session_id = %self.session_id, "sync worker finished");
    }

    /// Drains the outgoing queue onto the socket while it accepts
    /// frames. Query-set diffs fold in as part of the drain.
    fn flush(&mut self) {
        while self.manager.can_send() {
            let Some(message) = self.base.pop_next_message() else {
                return;
            };
            match message.encode() {
                Ok(frame) => {
                    if !self.manager.send(frame) {
                        self.base.requeue_front(message);
                        return;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "dropping unencodable message");
                }
            }
        }
    }

    fn handle_request(&mut self, request: ClientRequest) {
        match request {
            ClientRequest::Subscribe { path, args, result } => {
                let (token, _) = self.base.subscribe(path, args);
                let initial = self.base.local_query_result(&token);
                let _ = result.send((token, initial));
            }
            ClientRequest::Unsubscribe { token } => {
                self.base.unsubscribe(&token);
            }
            ClientRequest::Mutation {
                path,
                args,
                update,
                result,
            } => {
                let (receiver, notify) = self.base.mutation(path, args, update);
                if let Some(snapshot) = notify {
                    self.broadcast(snapshot);
                }
                let _ = result.send(receiver);
            }
            ClientRequest::Action { path, args, result } => {
                let _ = result.send(self.base.action(path, args));
            }
            ClientRequest::SetAuth { fetcher } => {
                self.fetcher = Some(fetcher);
                self.start_auth_fetch(false);
            }
            ClientRequest::ClearAuth => {
                self.fetcher = None;
                self.auth_fetch = None;
                self.base.clear_auth();
                self.notify_auth(false);
                self.resume_socket();
            }
            ClientRequest::LocalQueryResult { token, result } => {
                let _ = result.send(self.base.local_query_result(&token));
            }
            ClientRequest::Stop => self.manager.stop(),
            ClientRequest::Restart => {
                self.manager.restart();
                if self.auth_fetch.is_some() {
                    self.manager.pause();
                }
            }
        }
    }

    fn handle_event(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::Opened => self.on_opened(),
            // The open work is deferred until the pause lifts.
            ManagerEvent::OpenedPaused => {}
            ManagerEvent::Incoming(frame) => self.handle_frame(&frame),
            // A reconnect dial that races an in-flight token fetch must
            // come up paused, or query traffic would precede the
            // pending Authenticate.
            ManagerEvent::Dialing => {
                if self.auth_fetch.is_some() {
                    self.manager.pause();
                }
            }
            ManagerEvent::Closed => {}
        }
    }

    /// A socket just became usable: establish the session, then replay
    /// the full query set and unanswered mutations.
    fn on_opened(&mut self) {
        let connect = ClientMessage::Connect {
            session_id: self.session_id,
            connection_count: self.manager.connection_count(),
            last_close_reason: self.manager.last_close_reason().to_string(),
            max_observed_timestamp: self.base.max_observed_timestamp(),
        };
        match connect.encode() {
            Ok(frame) => {
                self.manager.send(frame);
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to encode Connect");
            }
        }
        self.base.resend_ongoing_queries_mutations();
    }

    fn handle_frame(&mut self, frame: &str) {
        let message = match ServerMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable server message, reconnecting");
                self.manager.force_reconnect("ParseError");
                return;
            }
        };
        match message {
            ServerMessage::Ping => {}
            ServerMessage::AuthError { error, base_version } => {
                tracing::debug!(?base_version, "auth rejected");
                if self.base.observe_auth_error(&error) && self.fetcher.is_some() {
                    self.start_auth_fetch(true);
                } else {
                    self.notify_auth(false);
                    self.resume_socket();
                }
            }
            message => {
                let is_transition = matches!(message, ServerMessage::Transition { .. });
                match self.base.receive_message(message) {
                    Ok(Some(snapshot)) => {
                        if is_transition {
                            // Synced past whatever caused the last
                            // reconnect.
                            self.manager.mark_synced();
                        }
                        self.broadcast(snapshot);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "protocol violation, reconnecting");
                        self.manager.force_reconnect("ProtocolViolation");
                    }
                }
            }
        }
    }

    /// Pauses traffic and kicks off a token fetch; the result lands
    /// back in the select loop.
    fn start_auth_fetch(&mut self, force_refresh: bool) {
        let Some(fetcher) = self.fetcher.as_mut() else {
            return;
        };
        self.manager.pause();
        self.base.begin_auth_fetch();
        self.auth_fetch = Some(fetcher.fetch_token(force_refresh));
    }

    fn finish_auth(&mut self, token: Option<String>) {
        let authenticated = self.base.finish_auth_fetch(token);
        self.notify_auth(authenticated);
        self.resume_socket();
    }

    fn resume_socket(&mut self) {
        match self.manager.resume() {
            ResumeOutcome::FiredOpen => self.on_opened(),
            // The flush at the top of the loop handles the rest.
            ResumeOutcome::FiredResume | ResumeOutcome::NoOp => {}
        }
    }

    fn notify_auth(&self, authenticated: bool) {
        if let Some(callback) = &self.on_auth_change {
            callback(authenticated);
        }
    }

    fn broadcast(&self, snapshot: QueryResults) {
        // Err means no live subscribers, which is fine.
        let _ = self.snapshots.send(snapshot);
    }
}
