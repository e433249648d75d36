//! Delivery Dispatcher: send one transformed message with retry and backoff.
//!
//! Every attempt is returned in the report so the caller can hand them to the
//! analytics collector in source order. Cancellation aborts both the in-flight
//! send and any backoff sleep.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::app::retry::RetryPolicy;
use crate::config::RetryConfig;
use crate::domain::{
    AttemptOutcome, ChannelRef, DeliveryAttempt, DeliveryError, DeliveryOutcome, DeliveryResult,
    Message, TaskId,
};
use crate::ports::{Clock, IdGenerator, MessagingPlatform};

/// Result of `Dispatcher::send`: the outcome plus every attempt made.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReport {
    pub outcome: DeliveryOutcome,
    pub attempts: Vec<DeliveryAttempt>,
}

pub struct Dispatcher {
    platform: Arc<dyn MessagingPlatform>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    max_attempts: u32,
}

impl Dispatcher {
    pub fn new(
        platform: Arc<dyn MessagingPlatform>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        retry: &RetryConfig,
    ) -> Self {
        Self {
            platform,
            ids,
            clock,
            policy: retry.policy(),
            max_attempts: retry.max_attempts.max(1),
        }
    }

    fn attempt(
        &self,
        task_id: TaskId,
        message: &Message,
        n: u32,
        outcome: AttemptOutcome,
        error: Option<&DeliveryError>,
    ) -> DeliveryAttempt {
        let attempt = DeliveryAttempt::new(
            self.ids.generate_attempt_id(),
            task_id,
            message.id.clone(),
            n,
            outcome,
            self.clock.now(),
        );
        match error {
            Some(DeliveryError::Transient(e) | DeliveryError::Permanent(e)) => {
                attempt.with_error(e.clone())
            }
            None => attempt,
        }
    }

    /// Deliver `message` to `dest`.
    ///
    /// Transient failures are retried up to the attempt budget; the last one is
    /// recorded as a permanent failure. A permanent platform error stops at once.
    pub async fn send(
        &self,
        task_id: TaskId,
        dest: &ChannelRef,
        message: &Message,
        cancel: &CancellationToken,
    ) -> DeliveryReport {
        let mut attempts = Vec::new();

        for n in 1..=self.max_attempts {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return DeliveryReport { outcome: DeliveryOutcome::Cancelled, attempts };
                }
                result = self.platform.send_message(dest, &message.payload) => result,
            };

            let error = match result {
                DeliveryResult::Success => {
                    attempts.push(self.attempt(task_id, message, n, AttemptOutcome::Success, None));
                    debug!(message_id = %message.id, attempts = n, "delivered");
                    return DeliveryReport {
                        outcome: DeliveryOutcome::Delivered { attempts: n },
                        attempts,
                    };
                }
                DeliveryResult::TransientError(e) if n < self.max_attempts => {
                    DeliveryError::Transient(e)
                }
                DeliveryResult::TransientError(e) | DeliveryResult::PermanentError(e) => {
                    DeliveryError::Permanent(e)
                }
            };

            if let DeliveryError::Permanent(e) = &error {
                attempts.push(self.attempt(
                    task_id,
                    message,
                    n,
                    AttemptOutcome::PermanentFailure,
                    Some(&error),
                ));
                warn!(message_id = %message.id, attempts = n, error = %e, "delivery failed permanently");
                return DeliveryReport {
                    outcome: DeliveryOutcome::PermanentFailure {
                        attempts: n,
                        error: e.clone(),
                    },
                    attempts,
                };
            }

            attempts.push(self.attempt(
                task_id,
                message,
                n,
                AttemptOutcome::TransientFailure,
                Some(&error),
            ));
            let delay = self.policy.next_delay(n);
            debug!(message_id = %message.id, attempt = n, ?delay, error = %error, "retrying");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return DeliveryReport { outcome: DeliveryOutcome::Cancelled, attempts };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        // max_attempts >= 1, so the loop always returns
        DeliveryReport {
            outcome: DeliveryOutcome::Cancelled,
            attempts,
        }
    }
}

/// Sliding window of permanent failures for auto-pause.
#[derive(Debug)]
pub struct FailureWindow {
    window: Duration,
    threshold: usize,
    hits: VecDeque<Instant>,
}

impl FailureWindow {
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            window,
            threshold,
            hits: VecDeque::new(),
        }
    }

    /// Record one permanent failure. Returns the count inside the window.
    pub fn record(&mut self, now: Instant) -> usize {
        self.hits.push_back(now);
        while let Some(&oldest) = self.hits.front() {
            if now.duration_since(oldest) > self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        self.hits.len()
    }

    pub fn exceeded(&self) -> bool {
        self.hits.len() > self.threshold
    }

    pub fn clear(&mut self) {
        self.hits.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Payload;
    use crate::impls::{DestinationBehavior, InMemoryPlatform};
    use crate::ports::{SystemClock, UlidGenerator};
    use chrono::Utc;
    use ulid::Ulid;

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 1,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    fn setup(behavior: DestinationBehavior, max_attempts: u32) -> (Arc<InMemoryPlatform>, Dispatcher) {
        let platform = Arc::new(InMemoryPlatform::new());
        platform.set_behavior(ChannelRef::new("dest"), behavior);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let dispatcher = Dispatcher::new(
            platform.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
            clock,
            &fast_retry(max_attempts),
        );
        (platform, dispatcher)
    }

    fn message() -> Message {
        Message::new("m-1", Payload::text("hello"), Utc::now())
    }

    fn task_id() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    fn outcomes(report: &DeliveryReport) -> Vec<AttemptOutcome> {
        report.attempts.iter().map(|a| a.outcome).collect()
    }

    #[tokio::test]
    async fn success_on_first_try() {
        let (platform, dispatcher) = setup(DestinationBehavior::AlwaysOk, 3);
        let report = dispatcher
            .send(task_id(), &ChannelRef::new("dest"), &message(), &CancellationToken::new())
            .await;
        assert_eq!(report.outcome, DeliveryOutcome::Delivered { attempts: 1 });
        assert_eq!(outcomes(&report), vec![AttemptOutcome::Success]);
        assert_eq!(platform.delivered(&ChannelRef::new("dest")).len(), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let behavior = DestinationBehavior::FailFirst {
            n: 2,
            error: "flood wait".into(),
        };
        let (_, dispatcher) = setup(behavior, 3);
        let report = dispatcher
            .send(task_id(), &ChannelRef::new("dest"), &message(), &CancellationToken::new())
            .await;
        assert_eq!(report.outcome, DeliveryOutcome::Delivered { attempts: 3 });
        assert_eq!(
            outcomes(&report),
            vec![
                AttemptOutcome::TransientFailure,
                AttemptOutcome::TransientFailure,
                AttemptOutcome::Success
            ]
        );
        let numbers: Vec<u32> = report.attempts.iter().map(|a| a.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn always_transient_ends_as_permanent_after_exactly_n_attempts() {
        let (platform, dispatcher) =
            setup(DestinationBehavior::AlwaysTransient("timeout".into()), 3);
        let report = dispatcher
            .send(task_id(), &ChannelRef::new("dest"), &message(), &CancellationToken::new())
            .await;
        assert_eq!(
            report.outcome,
            DeliveryOutcome::PermanentFailure {
                attempts: 3,
                error: "timeout".into()
            }
        );
        assert_eq!(
            outcomes(&report),
            vec![
                AttemptOutcome::TransientFailure,
                AttemptOutcome::TransientFailure,
                AttemptOutcome::PermanentFailure
            ]
        );
        assert_eq!(platform.send_calls(&ChannelRef::new("dest")), 3);
        assert!(report.attempts.iter().all(|a| a.error.as_deref() == Some("timeout")));
    }

    #[tokio::test]
    async fn permanent_error_stops_immediately() {
        let (platform, dispatcher) =
            setup(DestinationBehavior::AlwaysPermanent("chat not found".into()), 3);
        let report = dispatcher
            .send(task_id(), &ChannelRef::new("dest"), &message(), &CancellationToken::new())
            .await;
        assert!(matches!(
            report.outcome,
            DeliveryOutcome::PermanentFailure { attempts: 1, .. }
        ));
        assert_eq!(platform.send_calls(&ChannelRef::new("dest")), 1);
    }

    #[tokio::test]
    async fn cancellation_aborts_backoff() {
        let platform = Arc::new(InMemoryPlatform::new());
        platform.set_behavior(
            ChannelRef::new("dest"),
            DestinationBehavior::AlwaysTransient("busy".into()),
        );
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let slow = RetryConfig {
            max_attempts: 3,
            base_delay_ms: 60_000,
            multiplier: 1.0,
            jitter: 0.0,
        };
        let dispatcher = Dispatcher::new(
            platform.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
            clock,
            &slow,
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            dispatcher.send(task_id(), &ChannelRef::new("dest"), &message(), &cancel),
        )
        .await
        .unwrap();
        assert_eq!(report.outcome, DeliveryOutcome::Cancelled);
        assert_eq!(report.attempts.len(), 1);
    }

    #[test]
    fn failure_window_forgets_old_failures() {
        let mut window = FailureWindow::new(Duration::from_secs(60), 2);
        let t0 = Instant::now();
        assert_eq!(window.record(t0), 1);
        assert_eq!(window.record(t0 + Duration::from_secs(10)), 2);
        assert!(!window.exceeded());
        assert_eq!(window.record(t0 + Duration::from_secs(20)), 3);
        assert!(window.exceeded());

        // first two fall out of the window
        assert_eq!(window.record(t0 + Duration::from_secs(75)), 2);
        assert!(!window.exceeded());
    }
}
