//! Background sweeps.
//!
//! Two independent periodic loops, not request-triggered: the retry sweep
//! re-attempts queued messages on an exponential schedule, and the timeout
//! sweep expires pending messages past their age limit. Each tick is also
//! callable directly so tests can drive the sweeps without timers.

use super::{MessageBus, RetryEntry};
use crate::observability::BusEvent;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::info;

pub const RETRY_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
pub const TIMEOUT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

impl MessageBus {
    /// Start both sweeps. The returned handles run until aborted or the
    /// runtime shuts down.
    pub fn start_sweeps(self: &Arc<Self>) -> (JoinHandle<()>, JoinHandle<()>) {
        let retry = {
            let bus = Arc::clone(self);
            tokio::spawn(async move {
                let mut interval = time::interval(RETRY_SWEEP_INTERVAL);
                loop {
                    interval.tick().await;
                    bus.run_retry_sweep_once().await;
                }
            })
        };
        let timeout = {
            let bus = Arc::clone(self);
            tokio::spawn(async move {
                let mut interval = time::interval(TIMEOUT_SWEEP_INTERVAL);
                loop {
                    interval.tick().await;
                    bus.run_timeout_sweep_once();
                }
            })
        };
        (retry, timeout)
    }

    /// One retry-sweep tick: re-attempt every due entry below the retry cap.
    pub async fn run_retry_sweep_once(&self) {
        let now = Instant::now();
        let due: Vec<RetryEntry> = {
            let mut state = self.state.lock();
            let mut due = Vec::new();
            let mut keep = Vec::with_capacity(state.retry_queue.len());
            for entry in state.retry_queue.drain(..) {
                if entry.next_attempt <= now && entry.retry_count < self.config.max_retries {
                    due.push(entry);
                } else {
                    keep.push(entry);
                }
            }
            state.retry_queue = keep;
            due
        };

        for mut entry in due {
            self.state.lock().stats.retries_attempted_total += 1;
            let result = self
                .deliver_direct(entry.message.clone(), entry.retry_count, false)
                .await;
            let message_id = entry.message.metadata.request_id.clone();

            if result.success {
                {
                    let mut state = self.state.lock();
                    state.stats.retries_succeeded_total += 1;
                    if let Some(queue) = state.pending.get_mut(&entry.message.recipient) {
                        queue.retain(|pending| pending.metadata.request_id != message_id);
                    }
                    state.pending.retain(|_, queue| !queue.is_empty());
                }
                info!(message_id = %message_id, attempts = entry.retry_count + 1, "queued message delivered on retry");
                self.observer.record_event(&BusEvent::MessageRetrySuccess {
                    message_id,
                    attempts: entry.retry_count + 1,
                });
                continue;
            }

            entry.retry_count += 1;
            if entry.retry_count >= self.config.max_retries {
                self.state.lock().stats.retries_exhausted_total += 1;
                self.observer.record_event(&BusEvent::MessageRetryFailed {
                    message_id,
                    attempts: entry.retry_count,
                });
            } else {
                let delay = self
                    .config
                    .retry_delay_ms
                    .saturating_mul(2u64.saturating_pow(entry.retry_count));
                entry.next_attempt = Instant::now() + Duration::from_millis(delay);
                self.state.lock().retry_queue.push(entry);
            }
        }
    }

    /// One timeout-sweep tick: drop pending messages older than the
    /// configured timeout, measured from `metadata.timestamp`.
    pub fn run_timeout_sweep_once(&self) {
        let cutoff = Utc::now().timestamp_millis() - self.config.message_timeout_ms as i64;
        let expired_by_agent: Vec<(String, usize)> = {
            let mut state = self.state.lock();
            let mut expired_by_agent = Vec::new();
            for (agent, queue) in &mut state.pending {
                let before = queue.len();
                queue.retain(|message| message.metadata.timestamp >= cutoff);
                let expired = before - queue.len();
                if expired > 0 {
                    expired_by_agent.push((agent.clone(), expired));
                }
            }
            let total: usize = expired_by_agent.iter().map(|(_, count)| count).sum();
            state.stats.messages_expired_total += total as u64;
            state.pending.retain(|_, queue| !queue.is_empty());
            expired_by_agent
        };

        for (agent, expired) in expired_by_agent {
            self.observer
                .record_event(&BusEvent::MessagesTimeout { agent, expired });
        }
    }
}
