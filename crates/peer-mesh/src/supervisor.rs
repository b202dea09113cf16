use std::collections::HashMap;
use std::future::poll_fn;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use tokio_util::time::{DelayQueue, delay_queue};

use crate::negotiation::PeerLink;
use crate::protocol::PeerId;

pub const DEFAULT_RETRY_CEILING: u32 = 5;

/// Delay between a link failure and the renegotiation it triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    None,
    Fixed(Duration),
    /// Doubles per attempt starting at `base`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_RETRY_CEILING,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(500),
                max: Duration::from_secs(8),
            },
        }
    }
}

impl RetryPolicy {
    /// Retries without waiting.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::None,
        }
    }

    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if attempt <= self.max_retries {
            RetryDecision::Retry {
                attempt,
                delay: self.backoff.delay(attempt),
            }
        } else {
            RetryDecision::Abandon { attempts: attempt }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32, delay: Duration },
    Abandon { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkHealth {
    #[default]
    Healthy,
    Retrying {
        attempt: u32,
    },
    Abandoned,
}

/// Tracks failed links and schedules their renegotiation.
///
/// A failure bumps the link's retry count; up to the ceiling the peer is
/// renegotiated (after the policy's delay), past it the peer is abandoned and
/// never retried again unless it re-announces itself.
pub struct ReconnectionSupervisor {
    policy: RetryPolicy,
    health: HashMap<PeerId, LinkHealth>,
    pending: DelayQueue<PeerId>,
    keys: HashMap<PeerId, delay_queue::Key>,
}

impl ReconnectionSupervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            health: HashMap::new(),
            pending: DelayQueue::new(),
            keys: HashMap::new(),
        }
    }

    pub fn health(&self, peer_id: &str) -> LinkHealth {
        self.health.get(peer_id).copied().unwrap_or_default()
    }

    pub fn is_abandoned(&self, peer_id: &str) -> bool {
        self.health(peer_id) == LinkHealth::Abandoned
    }

    pub fn on_connected(&mut self, link: &mut PeerLink) {
        link.reset_retries();
        self.cancel(link.peer_id());
        self.health.remove(link.peer_id());
    }

    pub fn on_failed(&mut self, link: &mut PeerLink) -> RetryDecision {
        let peer_id = link.peer_id().to_string();
        if self.is_abandoned(&peer_id) {
            return RetryDecision::Abandon {
                attempts: link.retry_count(),
            };
        }
        let attempt = link.record_failure();
        let decision = self.policy.decide(attempt);
        match decision {
            RetryDecision::Retry { attempt, delay } => {
                tracing::info!(
                    target = "mesh",
                    peer_id = %peer_id,
                    attempt,
                    max_retries = self.policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "link failed; scheduling renegotiation"
                );
                self.health
                    .insert(peer_id.clone(), LinkHealth::Retrying { attempt });
                if !delay.is_zero() {
                    self.schedule(peer_id, delay);
                }
            }
            RetryDecision::Abandon { attempts } => {
                tracing::warn!(
                    target = "mesh",
                    peer_id = %peer_id,
                    attempts,
                    "retry ceiling exceeded; abandoning peer"
                );
                self.cancel(&peer_id);
                self.health.insert(peer_id, LinkHealth::Abandoned);
            }
        }
        decision
    }

    /// Clears an abandoned verdict after the peer announced itself again.
    pub fn reinstate(&mut self, link: Option<&mut PeerLink>, peer_id: &str) -> bool {
        let was_abandoned = self.is_abandoned(peer_id);
        self.forget(peer_id);
        if let Some(link) = link {
            link.reset_retries();
        }
        was_abandoned
    }

    /// Drops everything known about a peer that left.
    pub fn forget(&mut self, peer_id: &str) {
        self.cancel(peer_id);
        self.health.remove(peer_id);
    }

    pub fn cancel(&mut self, peer_id: &str) -> bool {
        match self.keys.remove(peer_id) {
            Some(key) => self.pending.try_remove(&key).is_some(),
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.keys.clear();
        self.health.clear();
    }

    /// Waits for the next scheduled renegotiation. Pends forever when nothing
    /// is scheduled, so it can sit in a `select!` next to other sources.
    pub async fn next_due(&mut self) -> PeerId {
        poll_fn(|cx| match self.poll_due(cx) {
            Poll::Ready(Some(peer_id)) => Poll::Ready(peer_id),
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        })
        .await
    }

    /// Returns a renegotiation whose delay has already elapsed, if any.
    pub fn poll_due_now(&mut self) -> Option<PeerId> {
        let mut cx = Context::from_waker(Waker::noop());
        match self.poll_due(&mut cx) {
            Poll::Ready(peer_id) => peer_id,
            Poll::Pending => None,
        }
    }

    fn poll_due(&mut self, cx: &mut Context<'_>) -> Poll<Option<PeerId>> {
        match self.pending.poll_expired(cx) {
            Poll::Ready(Some(expired)) => {
                let peer_id = expired.into_inner();
                self.keys.remove(&peer_id);
                Poll::Ready(Some(peer_id))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn schedule(&mut self, peer_id: PeerId, delay: Duration) {
        self.cancel(&peer_id);
        let key = self.pending.insert(peer_id.clone(), delay);
        self.keys.insert(peer_id, key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use crate::media::LocalMedia;
    use crate::mock::MockNetwork;
    use crate::negotiation::NegotiationController;

    async fn controller_with_link(peer_id: &str) -> NegotiationController {
        let network = MockNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connector: Arc<dyn crate::connection::PeerConnector> = network.connector("alice");
        let mut controller = NegotiationController::new("alice", connector, tx);
        controller
            .initiate(peer_id, &LocalMedia::new("mic"))
            .await
            .expect("initiate");
        controller
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(3),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(500));
        assert_eq!(backoff.delay(2), Duration::from_secs(1));
        assert_eq!(backoff.delay(3), Duration::from_secs(2));
        assert_eq!(backoff.delay(4), Duration::from_secs(3));
        assert_eq!(backoff.delay(40), Duration::from_secs(3));
    }

    #[test]
    fn policy_retries_up_to_the_ceiling_then_abandons() {
        let policy = RetryPolicy::immediate(DEFAULT_RETRY_CEILING);
        for attempt in 1..=5 {
            assert_eq!(
                policy.decide(attempt),
                RetryDecision::Retry {
                    attempt,
                    delay: Duration::ZERO
                }
            );
        }
        assert_eq!(policy.decide(6), RetryDecision::Abandon { attempts: 6 });
    }

    #[tokio::test]
    async fn sixth_consecutive_failure_abandons_the_peer() {
        let mut controller = controller_with_link("bob").await;
        let mut supervisor = ReconnectionSupervisor::new(RetryPolicy::immediate(5));
        let link = controller.link_mut("bob").expect("link");

        for attempt in 1..=5 {
            assert!(matches!(
                supervisor.on_failed(link),
                RetryDecision::Retry { attempt: a, .. } if a == attempt
            ));
        }
        assert_eq!(supervisor.on_failed(link), RetryDecision::Abandon { attempts: 6 });
        assert!(supervisor.is_abandoned("bob"));
        // An abandoned peer never climbs further.
        assert_eq!(supervisor.on_failed(link), RetryDecision::Abandon { attempts: 6 });
        assert_eq!(supervisor.health("bob"), LinkHealth::Abandoned);
    }

    #[tokio::test]
    async fn connection_resets_the_retry_budget() {
        let mut controller = controller_with_link("bob").await;
        let mut supervisor = ReconnectionSupervisor::new(RetryPolicy::immediate(5));
        let link = controller.link_mut("bob").expect("link");

        supervisor.on_failed(link);
        supervisor.on_failed(link);
        assert_eq!(link.retry_count(), 2);
        supervisor.on_connected(link);
        assert_eq!(link.retry_count(), 0);
        assert_eq!(supervisor.health("bob"), LinkHealth::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_retry_fires_after_backoff_and_can_be_cancelled() {
        let mut controller = controller_with_link("bob").await;
        let policy = RetryPolicy {
            max_retries: 5,
            backoff: Backoff::Fixed(Duration::from_secs(2)),
        };
        let mut supervisor = ReconnectionSupervisor::new(policy);

        supervisor.on_failed(controller.link_mut("bob").expect("link"));
        assert!(supervisor.keys.contains_key("bob"));
        assert_eq!(supervisor.poll_due_now(), None);

        tokio::time::advance(Duration::from_millis(2_001)).await;
        assert_eq!(supervisor.next_due().await, "bob");
        assert!(supervisor.keys.is_empty());

        supervisor.on_failed(controller.link_mut("bob").expect("link"));
        assert!(supervisor.cancel("bob"));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(supervisor.poll_due_now(), None);
    }
}
