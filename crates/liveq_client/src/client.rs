//! The public handle to the sync engine.

use crate::auth::TokenFetcher;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::optimistic::OptimisticUpdate;
use crate::results::{FunctionResult, QueryResults};
use crate::subscription::{QuerySetSubscription, QuerySubscription};
use crate::transport::Connector;
use crate::worker::{ClientRequest, Worker};
use futures::StreamExt;
use liveq_protocol::{FunctionArgs, FunctionPath, QueryToken};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::BroadcastStream;

// Slow watchers skip to the newest snapshot past this depth.
const SNAPSHOT_CHANNEL_CAPACITY: usize = 128;

struct WorkerHandle(tokio::task::JoinHandle<()>);

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A cloneable handle to one logical sync session.
///
/// All handles share a single background worker; the session ends when
/// the last handle is dropped, rejecting any still-pending requests.
#[derive(Clone)]
pub struct SyncClient {
    requests: mpsc::UnboundedSender<ClientRequest>,
    snapshots: broadcast::Sender<QueryResults>,
    _worker: Arc<WorkerHandle>,
}

impl SyncClient {
    /// Spawns the sync worker over the given transport.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_connector<C: Connector>(connector: C, config: ClientConfig) -> Self {
        let (requests, request_receiver) = mpsc::unbounded_channel();
        let (snapshots, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        let worker = Worker::new(connector, &config, request_receiver, snapshots.clone());
        let handle = tokio::spawn(worker.run());
        Self {
            requests,
            snapshots,
            _worker: Arc::new(WorkerHandle(handle)),
        }
    }

    /// Subscribes to a query, returning a stream of its results.
    ///
    /// The stream yields the locally-known value immediately when one
    /// exists, then every subsequent change. Equal consecutive values
    /// are suppressed.
    pub async fn subscribe(
        &self,
        path: &str,
        args: FunctionArgs,
    ) -> ClientResult<QuerySubscription> {
        let path: FunctionPath = path.parse()?;
        // Created before the request so no snapshot can slip between
        // registration and the first poll.
        let snapshots = BroadcastStream::new(self.snapshots.subscribe());
        let (result, receiver) = oneshot::channel();
        self.requests
            .send(ClientRequest::Subscribe { path, args, result })
            .map_err(|_| ClientError::ClientClosed)?;
        let (token, initial) = receiver.await.map_err(|_| ClientError::ClientClosed)?;
        Ok(QuerySubscription::new(
            token,
            initial,
            snapshots,
            self.requests.clone(),
        ))
    }

    /// Runs a query once, resolving with its first available result.
    pub async fn query(&self, path: &str, args: FunctionArgs) -> ClientResult<FunctionResult> {
        let mut subscription = self.subscribe(path, args).await?;
        subscription.next().await.ok_or(ClientError::ClientClosed)
    }

    /// Runs a mutation, resolving once the result is reflected in the
    /// local query view.
    pub async fn mutation(&self, path: &str, args: FunctionArgs) -> ClientResult<FunctionResult> {
        self.mutation_inner(path, args, None).await
    }

    /// Runs a mutation with an optimistic update that predicts its
    /// effect on local query values until the server confirms.
    pub async fn mutation_with_optimistic_update(
        &self,
        path: &str,
        args: FunctionArgs,
        update: OptimisticUpdate,
    ) -> ClientResult<FunctionResult> {
        self.mutation_inner(path, args, Some(update)).await
    }

    async fn mutation_inner(
        &self,
        path: &str,
        args: FunctionArgs,
        update: Option<OptimisticUpdate>,
    ) -> ClientResult<FunctionResult> {
        let path: FunctionPath = path.parse()?;
        let (result, receiver) = oneshot::channel();
        self.requests
            .send(ClientRequest::Mutation {
                path,
                args,
                update,
                result,
            })
            .map_err(|_| ClientError::ClientClosed)?;
        let outcome = receiver.await.map_err(|_| ClientError::ClientClosed)?;
        outcome.await.map_err(|_| ClientError::ClientClosed)?
    }

    /// Runs an action, resolving with its response.
    pub async fn action(&self, path: &str, args: FunctionArgs) -> ClientResult<FunctionResult> {
        let path: FunctionPath = path.parse()?;
        let (result, receiver) = oneshot::channel();
        self.requests
            .send(ClientRequest::Action { path, args, result })
            .map_err(|_| ClientError::ClientClosed)?;
        let outcome = receiver.await.map_err(|_| ClientError::ClientClosed)?;
        outcome.await.map_err(|_| ClientError::ClientClosed)?
    }

    /// Installs a credential fetcher and authenticates the connection
    /// with it. Query traffic pauses until the fetch settles.
    pub fn set_auth(&self, fetcher: impl TokenFetcher + 'static) -> ClientResult<()> {
        self.requests
            .send(ClientRequest::SetAuth {
                fetcher: Box::new(fetcher),
            })
            .map_err(|_| ClientError::ClientClosed)
    }

    /// Withdraws the credential.
    pub fn clear_auth(&self) -> ClientResult<()> {
        self.requests
            .send(ClientRequest::ClearAuth)
            .map_err(|_| ClientError::ClientClosed)
    }

    /// Watches every locally-known result as one stream of snapshots.
    pub fn watch_all(&self) -> QuerySetSubscription {
        QuerySetSubscription::new(BroadcastStream::new(self.snapshots.subscribe()))
    }

    /// Reads the locally-visible value for a token without subscribing.
    pub async fn local_query_result(
        &self,
        token: &QueryToken,
    ) -> ClientResult<Option<FunctionResult>> {
        let (result, receiver) = oneshot::channel();
        self.requests
            .send(ClientRequest::LocalQueryResult {
                token: token.clone(),
                result,
            })
            .map_err(|_| ClientError::ClientClosed)?;
        receiver.await.map_err(|_| ClientError::ClientClosed)
    }

    /// Closes the socket and stays offline until [`SyncClient::restart`].
    /// Subscriptions and pending state survive.
    pub fn stop(&self) -> ClientResult<()> {
        self.requests
            .send(ClientRequest::Stop)
            .map_err(|_| ClientError::ClientClosed)
    }

    /// Reconnects after a [`SyncClient::stop`].
    pub fn restart(&self) -> ClientResult<()> {
        self.requests
            .send(ClientRequest::Restart)
            .map_err(|_| ClientError::ClientClosed)
    }
}
