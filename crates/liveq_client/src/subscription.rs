//! Stream handles returned to subscribers.

use crate::results::{FunctionResult, QueryResults};
use crate::worker::ClientRequest;
use futures::Stream;
use liveq_protocol::QueryToken;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

/// A live feed of one query's results.
///
/// Yields the locally-known value at subscription time (if any), then
/// every change to the query's visible value, optimistic writes
/// included. Values that did not change are filtered out. Dropping the
/// handle releases the subscription; the server stops computing the
/// query once the last subscriber is gone.
pub struct QuerySubscription {
    token: QueryToken,
    initial: Option<FunctionResult>,
    last: Option<FunctionResult>,
    snapshots: BroadcastStream<QueryResults>,
    requests: mpsc::UnboundedSender<ClientRequest>,
}

impl QuerySubscription {
    pub(crate) fn new(
        token: QueryToken,
        initial: Option<FunctionResult>,
        snapshots: BroadcastStream<QueryResults>,
        requests: mpsc::UnboundedSender<ClientRequest>,
    ) -> Self {
        Self {
            token,
            initial,
            last: None,
            snapshots,
            requests,
        }
    }

    /// The token identifying the subscribed query.
    pub fn token(&self) -> &QueryToken {
        &self.token
    }
}

impl Stream for QuerySubscription {
    type Item = FunctionResult;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(initial) = this.initial.take() {
            this.last = Some(initial.clone());
            return Poll::Ready(Some(initial));
        }
        loop {
            match Pin::new(&mut this.snapshots).poll_next(cx) {
                Poll::Ready(Some(Ok(snapshot))) => {
                    let current = snapshot.get(&this.token).cloned();
                    if current != this.last {
                        let changed = current.clone();
                        this.last = current;
                        // A token reverting to loading has no value to
                        // yield; the next confirmed value will.
                        if let Some(value) = changed {
                            return Poll::Ready(Some(value));
                        }
                    }
                }
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    // Snapshots are self-contained, so skipping stale
                    // ones loses no information.
                    tracing::debug!(skipped, "subscription lagged behind snapshots");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for QuerySubscription {
    fn drop(&mut self) {
        let _ = self.requests.send(ClientRequest::Unsubscribe {
            token: self.token.clone(),
        });
    }
}

/// A live feed of whole result snapshots, one per change batch.
///
/// Each item is the complete token-keyed view at one instant; slow
/// consumers skip straight to the newest snapshot.
pub struct QuerySetSubscription {
    snapshots: BroadcastStream<QueryResults>,
}

impl QuerySetSubscription {
    pub(crate) fn new(snapshots: BroadcastStream<QueryResults>) -> Self {
        Self { snapshots }
    }
}

impl Stream for QuerySetSubscription {
    type Item = QueryResults;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match Pin::new(&mut this.snapshots).poll_next(cx) {
                Poll::Ready(Some(Ok(snapshot))) => return Poll::Ready(Some(snapshot)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    tracing::debug!(skipped, "watcher lagged behind snapshots");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
