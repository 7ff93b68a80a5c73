//! Transport abstraction
//!
//! A [`Transport`] delivers a [`MirrorRequest`] to a target and returns its
//! [`MirrorResponse`], or a communication-class error if no response arrived
//! in time. Retries are layered on top by [`send_with_retry`] so that every
//! caller (forwards and resync pushes alike) follows the same policy.

use crate::message::{MirrorRequest, MirrorResponse};
use async_trait::async_trait;
use mirrorfs_common::config::MirroringConfig;
use mirrorfs_common::{Error, Result, TargetId};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Something that executes requests addressed to local targets
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: MirrorRequest) -> MirrorResponse;
}

/// Delivers requests to (possibly remote) targets
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request and wait at most `timeout` for its response
    async fn send(
        &self,
        target: TargetId,
        request: MirrorRequest,
        timeout: Duration,
    ) -> Result<MirrorResponse>;
}

/// Bounded retries with exponential backoff.
///
/// `retries` is the number of additional attempts after the first one, so
/// `retries == 0` means exactly one attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub const fn from_config(config: &MirroringConfig) -> Self {
        Self {
            retries: config.forward_retries,
            timeout: Duration::from_millis(config.forward_timeout_ms),
            backoff_base: Duration::from_millis(config.retry_backoff_base_ms),
            backoff_max: Duration::from_millis(config.retry_backoff_max_ms),
        }
    }

    /// Sleep before retry number `attempt` (0-based)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&MirroringConfig::default())
    }
}

/// Send `request`, retrying communication failures according to `policy`.
///
/// Only communication-class errors are retried; a response carrying an
/// application error is returned as is.
pub async fn send_with_retry(
    transport: &dyn Transport,
    target: TargetId,
    request: &MirrorRequest,
    policy: &RetryPolicy,
) -> Result<MirrorResponse> {
    let mut attempt = 0;
    loop {
        match transport.send(target, request.clone(), policy.timeout).await {
            Ok(response) => return Ok(response),
            Err(e) if e.is_communication() && attempt < policy.retries => {
                let delay = policy.backoff(attempt);
                debug!(
                    target_id = %target,
                    attempt = attempt + 1,
                    "send failed ({}), retrying in {:?}",
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// In-process transport: hands requests straight to registered handlers.
///
/// Targets can be marked unreachable to simulate an outage.
#[derive(Default)]
pub struct LocalTransport {
    handlers: RwLock<HashMap<TargetId, Arc<dyn RequestHandler>>>,
    unreachable: RwLock<HashSet<TargetId>>,
}

impl LocalTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, target: TargetId, handler: Arc<dyn RequestHandler>) {
        self.handlers.write().insert(target, handler);
    }

    pub fn set_reachable(&self, target: TargetId, reachable: bool) {
        let mut unreachable = self.unreachable.write();
        if reachable {
            unreachable.remove(&target);
        } else {
            unreachable.insert(target);
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(
        &self,
        target: TargetId,
        request: MirrorRequest,
        timeout: Duration,
    ) -> Result<MirrorResponse> {
        if self.unreachable.read().contains(&target) {
            return Err(Error::communication(format!("target {target} is unreachable")));
        }
        let handler = self
            .handlers
            .read()
            .get(&target)
            .cloned()
            .ok_or_else(|| Error::communication(format!("no route to target {target}")))?;

        tokio::time::timeout(timeout, handler.handle(request))
            .await
            .map_err(|_| Error::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ForwardOutcome;
    use crate::op::{OpReply, Operation};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Transport for Flaky {
        async fn send(
            &self,
            _target: TargetId,
            _request: MirrorRequest,
            _timeout: Duration,
        ) -> Result<MirrorResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Timeout);
            }
            Ok(MirrorResponse::ok(OpReply::Done, ForwardOutcome::NotRequired))
        }
    }

    fn policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            timeout: Duration::from_millis(50),
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
        }
    }

    fn ping() -> MirrorRequest {
        MirrorRequest::local(TargetId(2), Operation::Ping)
    }

    #[tokio::test]
    async fn test_zero_retries_means_one_attempt() {
        let flaky = Flaky {
            failures_left: AtomicU32::new(5),
            calls: AtomicU32::new(0),
        };
        let err = send_with_retry(&flaky, TargetId(2), &ping(), &policy(0))
            .await
            .unwrap_err();
        assert!(err.is_communication());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let flaky = Flaky {
            failures_left: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        };
        send_with_retry(&flaky, TargetId(2), &ping(), &policy(2))
            .await
            .unwrap();
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);

        let flaky = Flaky {
            failures_left: AtomicU32::new(10),
            calls: AtomicU32::new(0),
        };
        assert!(send_with_retry(&flaky, TargetId(2), &ping(), &policy(3))
            .await
            .is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let p = policy(0);
        assert_eq!(p.backoff(0), Duration::from_millis(1));
        assert_eq!(p.backoff(1), Duration::from_millis(2));
        assert_eq!(p.backoff(5), Duration::from_millis(4));
        assert_eq!(p.backoff(40), Duration::from_millis(4));
    }

    #[tokio::test]
    async fn test_local_transport_unreachable() {
        let transport = LocalTransport::new();
        let err = transport
            .send(TargetId(9), ping(), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.is_communication());

        transport.set_reachable(TargetId(9), false);
        transport.set_reachable(TargetId(9), true);
        assert!(transport.unreachable.read().is_empty());
    }
}
