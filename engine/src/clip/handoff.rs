use std::collections::{HashSet, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lane_replay_common::config::StorageConfig;
use lane_replay_common::LaneId;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::Clip;
use crate::stats::PipelineStats;

/// Ids of stored clips remembered for idempotency.
const DELIVERED_MEMORY: usize = 4_096;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("storage rejected clip: {0}")]
    Rejected(String),
    #[error("encoding failed: {0}")]
    Encode(String),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// External storage/encoding collaborator.
///
/// Must be idempotent on `clip.id`: the dispatcher retries after failures,
/// and a retry of a clip that was in fact stored has to succeed.
#[async_trait]
pub trait ClipSink: Send + Sync {
    async fn accept(&self, clip: &Clip) -> Result<(), SinkError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

/// Bounded exponential backoff between sink attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, given `attempt` failures so far.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl From<&StorageConfig> for RetryPolicy {
    fn from(config: &StorageConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// A clip the sink never accepted, reported on the alert channel.
#[derive(Debug, Clone)]
pub struct ClipFailure {
    pub clip_id: String,
    pub lane_id: LaneId,
    pub attempts: u32,
    pub error: String,
}

/// Drains the handoff queue into the sink, retrying each clip per the
/// policy. Exhausted clips go to the alert channel; the pipeline carries on.
pub struct HandoffDispatcher {
    sink: Arc<dyn ClipSink>,
    policy: RetryPolicy,
    alerts: mpsc::Sender<ClipFailure>,
    stats: Arc<PipelineStats>,
    delivered: HashSet<String>,
    delivered_order: VecDeque<String>,
}

impl HandoffDispatcher {
    pub fn new(
        sink: Arc<dyn ClipSink>,
        policy: RetryPolicy,
        alerts: mpsc::Sender<ClipFailure>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            sink,
            policy,
            alerts,
            stats,
            delivered: HashSet::new(),
            delivered_order: VecDeque::new(),
        }
    }

    /// Runs until the queue's senders are all dropped and it is empty.
    pub async fn run(mut self, mut clips: mpsc::Receiver<Clip>) {
        info!(sink = self.sink.name(), max_attempts = self.policy.max_attempts, "clip handoff started");
        while let Some(clip) = clips.recv().await {
            self.deliver(clip).await;
        }
        info!("clip handoff stopped");
    }

    async fn deliver(&mut self, clip: Clip) {
        if self.delivered.contains(&clip.id) {
            info!(clip = %clip.id, "clip already stored, skipping");
            return;
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.sink.accept(&clip).await {
                Ok(()) => {
                    self.stats.clips_stored.fetch_add(1, Ordering::Relaxed);
                    info!(clip = %clip.id, attempt, frames = clip.frame_count(), "clip stored");
                    self.remember(clip.id);
                    return;
                }
                Err(e) if attempt >= self.policy.max_attempts => {
                    self.stats.clips_failed.fetch_add(1, Ordering::Relaxed);
                    error!(clip = %clip.id, attempts = attempt, error = %e, "clip storage failed, giving up");
                    let failure = ClipFailure {
                        clip_id: clip.id.clone(),
                        lane_id: clip.event.lane_id.clone(),
                        attempts: attempt,
                        error: e.to_string(),
                    };
                    if self.alerts.try_send(failure).is_err() {
                        error!(clip = %clip.id, "alert channel unavailable, failure only logged");
                    }
                    return;
                }
                Err(e) => {
                    self.stats.handoff_retries.fetch_add(1, Ordering::Relaxed);
                    let delay = self.policy.backoff(attempt);
                    warn!(clip = %clip.id, attempt, error = %e, "clip storage failed, retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn remember(&mut self, clip_id: String) {
        if self.delivered.insert(clip_id.clone()) {
            self.delivered_order.push_back(clip_id);
            if self.delivered_order.len() > DELIVERED_MEMORY {
                if let Some(oldest) = self.delivered_order.pop_front() {
                    self.delivered.remove(&oldest);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventId};
    use chrono::Utc;
    use lane_replay_capture::TimeRange;
    use lane_replay_common::{EventKind, SessionId};
    use parking_lot::Mutex;

    /// Fails the first `failures` calls, then accepts.
    struct FlakySink {
        failures: Mutex<u32>,
        accepted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ClipSink for FlakySink {
        async fn accept(&self, clip: &Clip) -> Result<(), SinkError> {
            {
                let mut failures = self.failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(SinkError::Rejected("bucket unavailable".into()));
                }
            }
            self.accepted.lock().push(clip.id.clone());
            Ok(())
        }
    }

    fn clip(id: &str) -> Clip {
        Clip {
            id: id.to_string(),
            event: Event {
                id: EventId::new(&SessionId::new("s-1"), 0, 1, EventKind::EndOfDelivery),
                session_id: SessionId::new("s-1"),
                lane_id: LaneId::new("lane-1"),
                kind: EventKind::EndOfDelivery,
                ts_ms: 0,
                confidence: 1.0,
                frame_set_id: 1,
                span_start_ms: None,
            },
            window: TimeRange::new(0, 100),
            cameras: Vec::new(),
            extracted_at: Utc::now(),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(150),
        }
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let p = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(8_000),
        };
        let delays: Vec<u128> = (1..=7).map(|a| p.backoff(a).as_millis()).collect();
        assert_eq!(delays, vec![500, 1_000, 2_000, 4_000, 8_000, 8_000, 8_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_accepted() {
        let sink = Arc::new(FlakySink {
            failures: Mutex::new(2),
            accepted: Mutex::new(Vec::new()),
        });
        let stats = Arc::new(PipelineStats::default());
        let (alert_tx, mut alert_rx) = mpsc::channel(4);
        let dispatcher = HandoffDispatcher::new(sink.clone(), policy(), alert_tx, Arc::clone(&stats));
        let (tx, rx) = mpsc::channel(4);
        tx.send(clip("c-1")).await.unwrap();
        // Same id again: must not reach the sink twice.
        tx.send(clip("c-1")).await.unwrap();
        drop(tx);
        dispatcher.run(rx).await;

        assert_eq!(*sink.accepted.lock(), vec!["c-1".to_string()]);
        assert_eq!(stats.handoff_retries.load(Ordering::Relaxed), 2);
        assert_eq!(stats.clips_stored.load(Ordering::Relaxed), 1);
        assert!(alert_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_clip_is_reported_and_queue_continues() {
        let sink = Arc::new(FlakySink {
            failures: Mutex::new(3),
            accepted: Mutex::new(Vec::new()),
        });
        let stats = Arc::new(PipelineStats::default());
        let (alert_tx, mut alert_rx) = mpsc::channel(4);
        let dispatcher = HandoffDispatcher::new(sink.clone(), policy(), alert_tx, Arc::clone(&stats));
        let (tx, rx) = mpsc::channel(4);
        tx.send(clip("doomed")).await.unwrap();
        tx.send(clip("fine")).await.unwrap();
        drop(tx);
        dispatcher.run(rx).await;

        let failure = alert_rx.recv().await.unwrap();
        assert_eq!(failure.clip_id, "doomed");
        assert_eq!(failure.attempts, 3);
        assert_eq!(*sink.accepted.lock(), vec!["fine".to_string()]);
        assert_eq!(stats.clips_failed.load(Ordering::Relaxed), 1);
    }
}
