//! The transport state machine.
//!
//! Owns one physical socket at a time and converts a flaky
//! bidirectional stream into a clean open/closed lifecycle with
//! automatic backoff-governed reconnection and an application-level
//! inactivity timeout.
//!
//! The state is a single owned tagged variant; every transition
//! replaces the whole value, so impossible combinations ("ready but no
//! socket") cannot be represented. Closing drops the connection and its
//! event receiver together, so a close event from a replaced socket
//! epoch can never re-trigger reconnect logic.

use crate::backoff::{Backoff, CloseReason};
use crate::config::{ClientConfig, ServerDisconnectCallback};
use crate::transport::{close_code, is_ordinary_close, Connection, Connector, SocketEvent};
use futures::future::BoxFuture;
use std::future;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::ClientResult;

/// Whether outgoing traffic on a live socket is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseState {
    /// Traffic flows normally.
    No,
    /// Paused after the open callback already fired.
    Yes,
    /// Became ready while paused; the open callback is deferred until
    /// the first resume.
    Uninitialized,
}

/// The socket lifecycle.
enum SocketState {
    /// No socket; a reconnect may be scheduled.
    Disconnected,
    /// A dial is in flight.
    Connecting { paused: bool },
    /// The socket is open.
    Ready {
        connection: Connection,
        paused: PauseState,
    },
    /// Closed on purpose; no reconnect until `restart`.
    Stopped,
    /// Shut down for good.
    Terminated,
}

impl SocketState {
    fn name(&self) -> &'static str {
        match self {
            SocketState::Disconnected => "disconnected",
            SocketState::Connecting { .. } => "connecting",
            SocketState::Ready { .. } => "ready",
            SocketState::Stopped => "stopped",
            SocketState::Terminated => "terminated",
        }
    }
}

/// A lifecycle event surfaced to the worker.
#[derive(Debug, PartialEq, Eq)]
pub enum ManagerEvent {
    /// The socket became ready; the open callback should fire.
    Opened,
    /// The socket became ready while paused; the open callback is
    /// deferred to the first resume.
    OpenedPaused,
    /// An inbound text frame.
    Incoming(String),
    /// The socket closed or the dial failed; a reconnect is scheduled.
    Closed,
    /// The reconnect delay elapsed and a new dial started.
    Dialing,
}

/// What a `resume` call did.
#[derive(Debug, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The deferred open callback should fire now.
    FiredOpen,
    /// Queued traffic should be flushed now.
    FiredResume,
    /// Nothing to do (flag cleared, or resume was a no-op).
    NoOp,
}

/// The transport state machine.
pub struct SocketManager<C: Connector> {
    connector: C,
    state: SocketState,
    connect_fut: Option<BoxFuture<'static, ClientResult<Connection>>>,
    reconnect_due: Option<Instant>,
    backoff: Backoff,
    heartbeat_timeout: Duration,
    client_close_base: Duration,
    last_activity: Instant,
    connection_count: u32,
    last_close_reason: String,
    on_server_disconnect: Option<ServerDisconnectCallback>,
}

impl<C: Connector> SocketManager<C> {
    /// Creates a manager in the `disconnected` state.
    pub fn new(connector: C, config: &ClientConfig) -> Self {
        Self {
            connector,
            state: SocketState::Disconnected,
            connect_fut: None,
            reconnect_due: None,
            backoff: Backoff::new(config.max_backoff),
            heartbeat_timeout: config.heartbeat_timeout,
            client_close_base: config.client_close_base_backoff,
            last_activity: Instant::now(),
            connection_count: 0,
            last_close_reason: "InitialConnect".to_string(),
            on_server_disconnect: config.on_server_disconnect.clone(),
        }
    }

    /// Starts the first dial. Only valid while `disconnected`.
    pub fn open(&mut self) {
        if matches!(self.state, SocketState::Disconnected) {
            self.start_connect(false);
        }
    }

    fn start_connect(&mut self, paused: bool) {
        self.reconnect_due = None;
        self.connect_fut = Some(self.connector.connect());
        self.state = SocketState::Connecting { paused };
    }

    /// Waits for and returns the next lifecycle event.
    ///
    /// Cancel-safe: the in-flight dial lives in the manager, inbound
    /// frames stay queued in the connection, and deadlines are
    /// recomputed from stored instants.
    pub async fn next_event(&mut self) -> ManagerEvent {
        let heartbeat_due = self.last_activity + self.heartbeat_timeout;
        match &mut self.state {
            SocketState::Disconnected => match self.reconnect_due {
                Some(due) => {
                    tokio::time::sleep_until(due).await;
                    // The dial starts unpaused; the worker re-pauses on
                    // the Dialing event if a token fetch is in flight.
                    self.start_connect(false);
                    ManagerEvent::Dialing
                }
                None => future::pending().await,
            },
            SocketState::Connecting { paused } => {
                let paused = *paused;
                let result = match self.connect_fut.as_mut() {
                    Some(fut) => fut.await,
                    None => future::pending().await,
                };
                self.connect_fut = None;
                match result {
                    Ok(connection) => {
                        self.connection_count += 1;
                        self.last_activity = Instant::now();
                        let pause = if paused {
                            PauseState::Uninitialized
                        } else {
                            PauseState::No
                        };
                        self.state = SocketState::Ready {
                            connection,
                            paused: pause,
                        };
                        tracing::debug!(
                            connection_count = self.connection_count,
                            "socket ready"
                        );
                        if paused {
                            ManagerEvent::OpenedPaused
                        } else {
                            ManagerEvent::Opened
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "dial failed");
                        self.schedule_reconnect(CloseReason::Unknown, "ConnectFailed".to_string());
                        ManagerEvent::Closed
                    }
                }
            }
            SocketState::Ready { connection, .. } => {
                enum Step {
                    Event(Option<SocketEvent>),
                    HeartbeatTimeout,
                }
                let step = tokio::select! {
                    ev = connection.incoming.recv() => Step::Event(ev),
                    _ = tokio::time::sleep_until(heartbeat_due) => Step::HeartbeatTimeout,
                };
                match step {
                    Step::Event(Some(SocketEvent::Message(frame))) => {
                        self.last_activity = Instant::now();
                        ManagerEvent::Incoming(frame)
                    }
                    Step::Event(Some(SocketEvent::Closed { code, reason })) => {
                        self.handle_remote_close(code, reason);
                        ManagerEvent::Closed
                    }
                    Step::Event(None) => {
                        self.handle_remote_close(close_code::ABNORMAL, None);
                        ManagerEvent::Closed
                    }
                    Step::HeartbeatTimeout => {
                        tracing::warn!(
                            timeout = ?self.heartbeat_timeout,
                            "no inbound traffic within the heartbeat window, reconnecting"
                        );
                        self.force_reconnect("InactivityTimeout");
                        ManagerEvent::Closed
                    }
                }
            }
            SocketState::Stopped | SocketState::Terminated => future::pending().await,
        }
    }

    fn handle_remote_close(&mut self, code: u16, reason: Option<String>) {
        if !is_ordinary_close(code) {
            tracing::warn!(code, reason = ?reason, "socket closed abnormally");
            if let (Some(callback), Some(reason)) = (&self.on_server_disconnect, &reason) {
                callback(reason);
            }
        }
        let reason_string = reason.unwrap_or_else(|| format!("ServerClose:{code}"));
        let classified = CloseReason::classify(&reason_string);
        self.schedule_reconnect(classified, reason_string);
    }

    fn schedule_reconnect(&mut self, classified: CloseReason, reason: String) {
        if matches!(
            self.state,
            SocketState::Stopped | SocketState::Terminated
        ) {
            return;
        }
        self.state = SocketState::Disconnected;
        self.connect_fut = None;
        let base = if classified == CloseReason::Client {
            self.client_close_base
        } else {
            classified.base_backoff()
        };
        let delay = self.backoff.fail(base, &mut rand::thread_rng());
        tracing::debug!(
            reason = %reason,
            failures = self.backoff.failures(),
            delay = ?delay,
            "scheduling reconnect"
        );
        self.last_close_reason = reason;
        self.reconnect_due = Some(Instant::now() + delay);
    }

    /// Closes the current socket (if any) from the client side and
    /// schedules a quick reconnect.
    ///
    /// Used for heartbeat timeouts and protocol violations. Has no
    /// effect while stopped or terminated.
    pub fn force_reconnect(&mut self, reason: &str) {
        match self.state {
            SocketState::Connecting { .. } | SocketState::Ready { .. }
            | SocketState::Disconnected => {
                self.schedule_reconnect(CloseReason::Client, reason.to_string());
            }
            SocketState::Stopped | SocketState::Terminated => {}
        }
    }

    /// Flags the live or in-flight socket as paused. No-op in any other
    /// state.
    pub fn pause(&mut self) {
        match &mut self.state {
            SocketState::Connecting { paused } => *paused = true,
            SocketState::Ready { paused, .. } => {
                if *paused == PauseState::No {
                    *paused = PauseState::Yes;
                }
            }
            _ => {}
        }
    }

    /// Clears the pause flag and reports what the worker should do.
    pub fn resume(&mut self) -> ResumeOutcome {
        match &mut self.state {
            SocketState::Connecting { paused } => {
                *paused = false;
                ResumeOutcome::NoOp
            }
            SocketState::Ready { paused, .. } => match *paused {
                PauseState::Uninitialized => {
                    *paused = PauseState::No;
                    ResumeOutcome::FiredOpen
                }
                PauseState::Yes => {
                    *paused = PauseState::No;
                    ResumeOutcome::FiredResume
                }
                PauseState::No => ResumeOutcome::NoOp,
            },
            _ => ResumeOutcome::NoOp,
        }
    }

    /// Transmits a frame if the socket is ready and unpaused.
    ///
    /// Returns false otherwise; callers rely on the protocol's own
    /// version-based resend-on-reconnect rather than on delivery.
    pub fn send(&mut self, frame: String) -> bool {
        match &self.state {
            SocketState::Ready {
                connection,
                paused: PauseState::No,
            } => connection.outgoing.send(frame).is_ok(),
            _ => false,
        }
    }

    /// True if a send would currently be transmitted.
    pub fn can_send(&self) -> bool {
        matches!(
            self.state,
            SocketState::Ready {
                paused: PauseState::No,
                ..
            }
        )
    }

    /// Closes the socket and suppresses reconnection until `restart`.
    pub fn stop(&mut self) {
        if matches!(self.state, SocketState::Terminated) {
            return;
        }
        tracing::debug!(from = self.state.name(), "socket stopped");
        self.state = SocketState::Stopped;
        self.connect_fut = None;
        self.reconnect_due = None;
        self.last_close_reason = "ClientStop".to_string();
    }

    /// Dials again after a `stop`.
    pub fn restart(&mut self) {
        if matches!(self.state, SocketState::Stopped) {
            self.start_connect(false);
        }
    }

    /// Shuts the transport down for good. Irreversible.
    pub fn terminate(&mut self) {
        tracing::debug!(from = self.state.name(), "socket terminated");
        self.state = SocketState::Terminated;
        self.connect_fut = None;
        self.reconnect_due = None;
    }

    /// Resets the backoff counter once the connection has synced past
    /// the point of the last reconnect.
    pub fn mark_synced(&mut self) {
        self.backoff.reset();
    }

    /// Number of sockets opened so far.
    pub fn connection_count(&self) -> u32 {
        self.connection_count
    }

    /// Why the previous socket closed.
    pub fn last_close_reason(&self) -> &str {
        &self.last_close_reason
    }

    /// Current state name, for logging.
    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }
}
