use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lane_replay_common::config::CameraConfig;
use lane_replay_common::{CameraId, Frame, FrameNotice, PipelineClock};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::buffer::RingWriter;
use crate::source::{CaptureError, CaptureSource, CapturedFrame};

/// Fan-out channel for frame-available notices from every camera.
#[derive(Clone)]
pub struct NoticeBus {
    tx: broadcast::Sender<FrameNotice>,
}

impl NoticeBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FrameNotice> {
        self.tx.subscribe()
    }

    /// Publish a notice. Having no subscribers is normal (no lanes yet).
    pub fn publish(&self, notice: FrameNotice) -> usize {
        self.tx.send(notice).unwrap_or(0)
    }
}

/// Capture counters shared by all ingestion units.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub frames_captured: AtomicU64,
    pub capture_failures: AtomicU64,
    pub frames_rejected: AtomicU64,
}

/// Retry policy for consecutive capture failures.
#[derive(Debug, Clone, Copy)]
pub struct IngestTiming {
    pub stall_timeout: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
}

impl From<&CameraConfig> for IngestTiming {
    fn from(config: &CameraConfig) -> Self {
        Self {
            stall_timeout: Duration::from_millis(config.stall_timeout_ms),
            retry_initial: Duration::from_millis(config.retry_initial_ms),
            retry_max: Duration::from_millis(config.retry_max_ms),
        }
    }
}

/// Long-lived loop for one camera: pull, stamp, store, notify.
///
/// Only the capture source can make it wait. A failing or stalled source
/// produces no notices, which is how the synchronizer learns the camera is
/// stale.
pub struct IngestionUnit {
    camera_id: CameraId,
    source: Box<dyn CaptureSource>,
    writer: RingWriter,
    bus: NoticeBus,
    clock: PipelineClock,
    timing: IngestTiming,
    stats: Arc<IngestStats>,
    next_seq: u64,
    last_ts: i64,
}

impl IngestionUnit {
    pub fn new(
        source: Box<dyn CaptureSource>,
        writer: RingWriter,
        bus: NoticeBus,
        clock: PipelineClock,
        timing: IngestTiming,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            camera_id: writer.camera_id().clone(),
            next_seq: writer.last_seq().map_or(1, |seq| seq + 1),
            last_ts: writer.last_ts().unwrap_or(i64::MIN),
            source,
            writer,
            bus,
            clock,
            timing,
            stats,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(camera = %self.camera_id, source = self.source.name(), "ingestion started");
        let mut backoff = self.timing.retry_initial;
        let mut consecutive_failures: u32 = 0;

        loop {
            let pulled = tokio::select! {
                _ = shutdown.changed() => break,
                pulled = tokio::time::timeout(self.timing.stall_timeout, self.source.next_frame()) => pulled,
            };
            let result = match pulled {
                Ok(result) => result,
                Err(_) => Err(CaptureError::Stalled(self.timing.stall_timeout)),
            };

            match result {
                Ok(captured) => {
                    consecutive_failures = 0;
                    backoff = self.timing.retry_initial;
                    self.ingest(captured);
                }
                Err(e) => {
                    consecutive_failures += 1;
                    self.stats.capture_failures.fetch_add(1, Ordering::Relaxed);
                    // First failure retries at once; repeats back off.
                    if consecutive_failures == 1 {
                        warn!(camera = %self.camera_id, error = %e, "capture failed, retrying");
                        continue;
                    }
                    warn!(
                        camera = %self.camera_id,
                        error = %e,
                        consecutive_failures,
                        "capture failed, retrying in {:?}",
                        backoff
                    );
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.timing.retry_max);
                }
            }
        }
        info!(camera = %self.camera_id, "ingestion stopped");
    }

    /// Stamp a captured frame, write it to the ring and publish its notice.
    pub fn ingest(&mut self, captured: CapturedFrame) -> Option<FrameNotice> {
        // Keep timestamps non-decreasing even if a source reports arrival
        // instants slightly out of order.
        let ts = self.clock.ms_at(captured.captured_at).max(self.last_ts);
        let seq = self.next_seq;
        let mut frame = Frame::new(
            self.camera_id.clone(),
            ts,
            seq,
            captured.format,
            captured.payload,
        );
        frame.detections = captured.detections;

        match self.writer.write(frame) {
            Ok(stored) => {
                self.next_seq += 1;
                self.last_ts = ts;
                self.stats.frames_captured.fetch_add(1, Ordering::Relaxed);
                let notice = stored.notice();
                let receivers = self.bus.publish(notice.clone());
                debug!(camera = %self.camera_id, seq, ts, receivers, "frame ingested");
                Some(notice)
            }
            Err(e) => {
                self.stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(camera = %self.camera_id, error = %e, "ring buffer rejected frame");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{RingBufferStore, TimeRange};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    /// Replays a fixed list of outcomes, then idles forever.
    struct ScriptedSource {
        script: VecDeque<Result<&'static [u8], ()>>,
        gap: Duration,
    }

    #[async_trait]
    impl CaptureSource for ScriptedSource {
        async fn next_frame(&mut self) -> Result<CapturedFrame, CaptureError> {
            tokio::time::sleep(self.gap).await;
            match self.script.pop_front() {
                Some(Ok(bytes)) => Ok(CapturedFrame::jpeg(Bytes::from_static(bytes))),
                Some(Err(())) => Err(CaptureError::Connect("camera glitch".into())),
                None => std::future::pending().await,
            }
        }
    }

    fn timing() -> IngestTiming {
        IngestTiming {
            stall_timeout: Duration::from_millis(500),
            retry_initial: Duration::from_millis(50),
            retry_max: Duration::from_millis(200),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stores_and_notifies_across_transient_failures() {
        let clock = PipelineClock::new();
        let store = Arc::new(RingBufferStore::new(10_000, 1_000));
        let cam = CameraId::new("cam-a");
        let writer = store.register(&cam, 30.0).unwrap();
        let bus = NoticeBus::new(64);
        let mut notices = bus.subscribe();
        let stats = Arc::new(IngestStats::default());

        let source = ScriptedSource {
            script: VecDeque::from(vec![Ok(&b"one"[..]), Err(()), Err(()), Ok(&b"two"[..])]),
            gap: Duration::from_millis(33),
        };
        let unit = IngestionUnit::new(
            Box::new(source),
            writer,
            bus.clone(),
            clock,
            timing(),
            Arc::clone(&stats),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(unit.run(shutdown_rx));

        let first = notices.recv().await.unwrap();
        let second = notices.recv().await.unwrap();
        assert_eq!((first.seq, second.seq), (1, 2));
        assert!(second.captured_at_ms > first.captured_at_ms);
        assert_eq!(stats.capture_failures.load(Ordering::Relaxed), 2);

        let frames = store.read(&cam, TimeRange::new(0, i64::MAX));
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].payload.as_ref(), b"two");

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_source_emits_nothing_and_counts_failures() {
        let clock = PipelineClock::new();
        let store = RingBufferStore::new(10_000, 1_000);
        let writer = store.register(&CameraId::new("cam-b"), 30.0).unwrap();
        let bus = NoticeBus::new(8);
        let mut notices = bus.subscribe();
        let stats = Arc::new(IngestStats::default());
        let source = ScriptedSource {
            script: VecDeque::new(),
            gap: Duration::ZERO,
        };
        let unit = IngestionUnit::new(Box::new(source), writer, bus, clock, timing(), Arc::clone(&stats));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(unit.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(notices.try_recv().is_err());
        assert!(stats.capture_failures.load(Ordering::Relaxed) >= 2);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn timestamps_never_regress() {
        let clock = PipelineClock::new();
        let store = RingBufferStore::new(10_000, 1_000);
        let writer = store.register(&CameraId::new("cam-c"), 30.0).unwrap();
        let stats = Arc::new(IngestStats::default());
        let source = ScriptedSource {
            script: VecDeque::new(),
            gap: Duration::ZERO,
        };
        let mut unit = IngestionUnit::new(
            Box::new(source),
            writer,
            NoticeBus::new(8),
            clock,
            timing(),
            stats,
        );
        tokio::time::advance(Duration::from_millis(100)).await;
        let late = CapturedFrame::jpeg(Bytes::from_static(b"late"));
        let mut early = CapturedFrame::jpeg(Bytes::from_static(b"early"));
        early.captured_at = Instant::now() - Duration::from_millis(40);

        let a = unit.ingest(late).unwrap();
        let b = unit.ingest(early).unwrap();
        assert_eq!(a.captured_at_ms, 100);
        assert_eq!(b.captured_at_ms, 100);
        assert_eq!(b.seq, a.seq + 1);
    }
}
