//! Reconnect backoff with per-reason base delays.

use rand::Rng;
use std::time::Duration;

/// Classification of why the previous socket closed.
///
/// Server-overload and maintenance reasons carry their own base
/// backoff; a client-initiated close implies no server problem and
/// reconnects almost immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed the socket itself (heartbeat timeout,
    /// protocol violation, programmatic restart).
    Client,
    /// The server reported an internal error.
    InternalServerError,
    /// The server timed out internally.
    SystemTimeoutError,
    /// The server's subscription worker is at capacity.
    SubscriptionsWorkerFullError,
    /// The server's committer is at capacity.
    CommitterFullError,
    /// The server's function executor is at capacity.
    ExecuteFullError,
    /// The server is shedding load.
    TooManyConcurrentRequests,
    /// An upstream provider is rate limiting the server.
    AwsTooManyRequestsException,
    /// Anything else, including closes with no reason at all.
    Unknown,
}

impl CloseReason {
    /// Classifies a machine-readable close reason string.
    pub fn classify(reason: &str) -> Self {
        match reason {
            "InternalServerError" => Self::InternalServerError,
            "SystemTimeoutError" => Self::SystemTimeoutError,
            "SubscriptionsWorkerFullError" => Self::SubscriptionsWorkerFullError,
            "CommitterFullError" => Self::CommitterFullError,
            "ExecuteFullError" => Self::ExecuteFullError,
            "TooManyConcurrentRequests" => Self::TooManyConcurrentRequests,
            "AwsTooManyRequestsException" => Self::AwsTooManyRequestsException,
            _ => Self::Unknown,
        }
    }

    /// Base reconnect delay for this close reason.
    pub fn base_backoff(self) -> Duration {
        match self {
            Self::Client => Duration::from_millis(100),
            Self::InternalServerError | Self::SystemTimeoutError | Self::Unknown => {
                Duration::from_millis(1000)
            }
            Self::SubscriptionsWorkerFullError
            | Self::CommitterFullError
            | Self::ExecuteFullError
            | Self::TooManyConcurrentRequests
            | Self::AwsTooManyRequestsException => Duration::from_millis(3000),
        }
    }
}

/// Exponential reconnect backoff.
///
/// The delay doubles per consecutive failure from a per-reason base,
/// capped at `max`, then jittered by ±50%. The failure counter resets
/// once the connection has synced past the point of the last
/// reconnect.
#[derive(Debug)]
pub struct Backoff {
    max: Duration,
    failures: u32,
}

impl Backoff {
    /// Creates a backoff with the given delay cap.
    pub fn new(max: Duration) -> Self {
        Self { max, failures: 0 }
    }

    /// Records a failure and returns the delay before the next attempt.
    pub fn fail(&mut self, base: Duration, rng: &mut impl Rng) -> Duration {
        let uncapped = base.saturating_mul(2u32.saturating_pow(self.failures));
        let capped = uncapped.min(self.max);
        self.failures = self.failures.saturating_add(1);
        capped.mul_f64(0.5 + rng.gen::<f64>())
    }

    /// Resets the failure counter.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Number of consecutive failures recorded since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    fn no_jitter_rng() -> StepRng {
        // gen::<f64>() from the zero step rng is 0.0, so the jitter
        // factor is exactly 0.5.
        StepRng::new(0, 0)
    }

    #[test]
    fn classification_table() {
        assert_eq!(
            CloseReason::classify("InternalServerError").base_backoff(),
            Duration::from_millis(1000)
        );
        assert_eq!(
            CloseReason::classify("CommitterFullError").base_backoff(),
            Duration::from_millis(3000)
        );
        assert_eq!(
            CloseReason::classify("SomeNewError").base_backoff(),
            Duration::from_millis(1000)
        );
        assert_eq!(
            CloseReason::Client.base_backoff(),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut rng = no_jitter_rng();
        let mut backoff = Backoff::new(Duration::from_millis(16000));
        let base = Duration::from_millis(1000);

        // Jitter factor is a fixed 0.5 with the mock rng, so the
        // pre-jitter delays are 1000, 2000, 4000, 8000, 16000, 16000.
        assert_eq!(backoff.fail(base, &mut rng), Duration::from_millis(500));
        assert_eq!(backoff.fail(base, &mut rng), Duration::from_millis(1000));
        assert_eq!(backoff.fail(base, &mut rng), Duration::from_millis(2000));
        assert_eq!(backoff.fail(base, &mut rng), Duration::from_millis(4000));
        assert_eq!(backoff.fail(base, &mut rng), Duration::from_millis(8000));
        assert_eq!(backoff.fail(base, &mut rng), Duration::from_millis(8000));
    }

    #[test]
    fn backoff_reset() {
        let mut rng = no_jitter_rng();
        let mut backoff = Backoff::new(Duration::from_millis(16000));
        let base = Duration::from_millis(100);

        backoff.fail(base, &mut rng);
        backoff.fail(base, &mut rng);
        assert_eq!(backoff.failures(), 2);

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.fail(base, &mut rng), Duration::from_millis(50));
    }

    #[test]
    fn jitter_within_half_to_three_halves() {
        let mut rng = rand::thread_rng();
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let mut backoff = Backoff::new(Duration::from_millis(16000));
            let delay = backoff.fail(base, &mut rng);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(1500));
        }
    }
}
