/// Readiness-gated message delivery with exponential backoff

use crate::config::RetryPolicy;
use crate::readiness::{ReadinessTracker, ReadyTarget};
use crate::transport::{DeliveryOutcome, MessageBus, Sleeper, TabId};
use futures::future::join_all;
use serde_json::Value;
use std::rc::Rc;

#[derive(Clone)]
pub struct ReliableSender {
    bus: Rc<dyn MessageBus>,
    sleeper: Rc<dyn Sleeper>,
    readiness: ReadinessTracker,
    readiness_policy: RetryPolicy,
    auth_policy: RetryPolicy,
}

impl ReliableSender {
    pub fn new(
        bus: Rc<dyn MessageBus>,
        sleeper: Rc<dyn Sleeper>,
        readiness: ReadinessTracker,
        readiness_policy: RetryPolicy,
        auth_policy: RetryPolicy,
    ) -> Self {
        Self {
            bus,
            sleeper,
            readiness,
            readiness_policy,
            auth_policy,
        }
    }

    pub fn readiness(&self) -> &ReadinessTracker {
        &self.readiness
    }

    /// Send once the target has announced itself.
    ///
    /// While the target is not ready (or a send to it fails) the sender waits
    /// `base * 2^attempt` ms, capped, and tries again. After `max_attempts`
    /// waits the last outcome is returned; this never errors and never hangs.
    pub async fn send_with_readiness_check(
        &self,
        target: ReadyTarget,
        message: &Value,
        max_attempts: u32,
    ) -> DeliveryOutcome {
        let mut last = DeliveryOutcome::NoReceiver;

        for attempt in 0..=max_attempts {
            if self.readiness.is_ready(target) {
                last = self.send_to(target, message).await;
                if last.is_delivered() {
                    return last;
                }
                log::debug!("Send to {:?} not delivered (attempt {}): {:?}", target, attempt + 1, last);
            }

            if attempt == max_attempts {
                break;
            }
            self.sleeper.sleep(self.readiness_policy.delay_for(attempt)).await;
        }

        log::debug!("Giving up on {:?} after {} attempts", target, max_attempts);
        last
    }

    /// `send_with_readiness_check` using the configured attempt count
    pub async fn send(&self, target: ReadyTarget, message: &Value) -> DeliveryOutcome {
        self.send_with_readiness_check(target, message, self.readiness_policy.max_attempts)
            .await
    }

    /// Push an auth-state change to every tab and the runtime.
    ///
    /// Each tab gets its own retry loop (ignoring readiness) so one slow tab
    /// doesn't hold up the others.
    pub async fn send_auth_state(
        &self,
        tabs: &[TabId],
        message: &Value,
    ) -> Vec<(TabId, DeliveryOutcome)> {
        let runtime = self.bus.send_runtime(message);
        let per_tab = join_all(tabs.iter().map(|tab| self.send_to_tab_with_retries(*tab, message)));

        let (runtime_outcome, outcomes) = futures::join!(runtime, per_tab);
        if !runtime_outcome.is_delivered() {
            log::debug!("Auth state not delivered to runtime: {:?}", runtime_outcome);
        }

        tabs.iter().copied().zip(outcomes).collect()
    }

    async fn send_to_tab_with_retries(&self, tab: TabId, message: &Value) -> DeliveryOutcome {
        let mut outcome = self.bus.send_to_tab(tab, message).await;

        for retry in 0..self.auth_policy.max_attempts {
            if outcome.is_delivered() {
                break;
            }
            self.sleeper.sleep(self.auth_policy.delay_for(retry)).await;
            outcome = self.bus.send_to_tab(tab, message).await;
        }

        if !outcome.is_delivered() {
            log::warn!("Auth state not delivered to tab {}: {:?}", tab, outcome);
        }
        outcome
    }

    async fn send_to(&self, target: ReadyTarget, message: &Value) -> DeliveryOutcome {
        match target {
            ReadyTarget::Tab(tab) => self.bus.send_to_tab(tab, message).await,
            ReadyTarget::Popup | ReadyTarget::Background => self.bus.send_runtime(message).await,
        }
    }
}
