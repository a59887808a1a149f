//! Deliveries through the real pipeline: two cameras, scripted detections,
//! a recording storage sink. Runs on paused time.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lane_replay_capture::{CaptureError, CaptureSource, CapturedFrame, TimeRange};
use lane_replay_common::config::Config;
use lane_replay_common::{CameraId, EventKind, LaneId, SessionId};
use lane_replay_engine::clip::{Clip, ClipFailure, ClipSink, Coverage, SinkError};
use lane_replay_engine::detect::ScriptedBackend;
use lane_replay_engine::{Pipeline, SessionCommand};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};

/// 25 fps JPEG camera; frame n is captured at n * 40ms. With a limit the
/// camera goes silent after that many frames.
struct TickSource {
    ticker: Interval,
    produced: u64,
    limit: Option<u64>,
}

impl TickSource {
    fn boxed() -> Box<dyn CaptureSource> {
        Self::silent_after(None)
    }

    fn silent_after(limit: Option<u64>) -> Box<dyn CaptureSource> {
        Box::new(Self {
            ticker: tokio::time::interval(Duration::from_millis(40)),
            produced: 0,
            limit,
        })
    }
}

#[async_trait]
impl CaptureSource for TickSource {
    async fn next_frame(&mut self) -> Result<CapturedFrame, CaptureError> {
        if self.limit.is_some_and(|limit| self.produced >= limit) {
            return std::future::pending().await;
        }
        self.ticker.tick().await;
        self.produced += 1;
        Ok(CapturedFrame {
            payload: Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]),
            format: lane_replay_common::PayloadFormat::Jpeg,
            captured_at: Instant::now(),
            detections: None,
        })
    }
}

struct RecordingSink {
    clips: mpsc::UnboundedSender<Clip>,
}

#[async_trait]
impl ClipSink for RecordingSink {
    async fn accept(&self, clip: &Clip) -> Result<(), SinkError> {
        let _ = self.clips.send(clip.clone());
        Ok(())
    }
}

fn config(triggers: &str) -> Config {
    Config::from_toml(&format!(
        r#"
        [[cameras]]
        id = "left"
        mode = "synthetic"
        fps = 25.0

        [[cameras]]
        id = "right"
        mode = "synthetic"
        fps = 25.0

        [[lanes]]
        id = "lane-7"
        cameras = ["left", "right"]

        [detection]
        workers = 1
        timeout_ms = 60000

        [clips]
        triggers = {triggers}
        "#
    ))
    .unwrap()
}

/// Ball leaves the hand at 8.0s, reaches the deck at 8.8s, pins are knocked
/// around 9.0s and still from 9.12s.
const DELIVERY: &str = r#"[
    {"from_ms": 8000, "to_ms": 8760,
     "entities": [{"kind": "ball", "position": {"x": 0.5, "y": 0.5}, "confidence": 0.9}]},
    {"from_ms": 8800, "to_ms": 8960,
     "entities": [{"kind": "ball", "position": {"x": 0.5, "y": 0.95}, "confidence": 0.9}]},
    {"from_ms": 8800, "to_ms": 8999,
     "entities": [{"kind": "pin", "position": {"x": 0.50, "y": 0.95}, "confidence": 0.9}]},
    {"from_ms": 9000, "to_ms": 9039,
     "entities": [{"kind": "pin", "position": {"x": 0.52, "y": 0.95}, "confidence": 0.9}]},
    {"from_ms": 9040, "to_ms": 9079,
     "entities": [{"kind": "pin", "position": {"x": 0.55, "y": 0.96}, "confidence": 0.9}]},
    {"from_ms": 9080, "to_ms": 60000,
     "entities": [{"kind": "pin", "position": {"x": 0.60, "y": 0.97}, "confidence": 0.9}]}
]"#;

/// A bowler steps up at 1.0s and walks off; the approach times out. The
/// bowler returns at 10.0s and releases at 11.0s; the rest of the delivery
/// runs three seconds after `DELIVERY`'s.
const APPROACH_THEN_DELIVERY: &str = r#"[
    {"from_ms": 1000, "to_ms": 1960,
     "entities": [{"kind": "bowler", "position": {"x": 0.5, "y": 0.1}, "confidence": 0.9}]},
    {"from_ms": 10000, "to_ms": 10960,
     "entities": [{"kind": "bowler", "position": {"x": 0.5, "y": 0.1}, "confidence": 0.9}]},
    {"from_ms": 11000, "to_ms": 11760,
     "entities": [{"kind": "ball", "position": {"x": 0.5, "y": 0.5}, "confidence": 0.9}]},
    {"from_ms": 11800, "to_ms": 11960,
     "entities": [{"kind": "ball", "position": {"x": 0.5, "y": 0.95}, "confidence": 0.9}]},
    {"from_ms": 11800, "to_ms": 11999,
     "entities": [{"kind": "pin", "position": {"x": 0.50, "y": 0.95}, "confidence": 0.9}]},
    {"from_ms": 12000, "to_ms": 12039,
     "entities": [{"kind": "pin", "position": {"x": 0.52, "y": 0.95}, "confidence": 0.9}]},
    {"from_ms": 12040, "to_ms": 12079,
     "entities": [{"kind": "pin", "position": {"x": 0.55, "y": 0.96}, "confidence": 0.9}]},
    {"from_ms": 12080, "to_ms": 60000,
     "entities": [{"kind": "pin", "position": {"x": 0.60, "y": 0.97}, "confidence": 0.9}]}
]"#;

struct Run {
    pipeline: Pipeline,
    alerts: mpsc::Receiver<ClipFailure>,
    clips: mpsc::UnboundedReceiver<Clip>,
    lane: LaneId,
}

async fn start(
    script: &str,
    triggers: &str,
    right: Box<dyn CaptureSource>,
    session: &str,
) -> Run {
    let backend = Arc::new(ScriptedBackend::from_json(script).unwrap());
    let (clips_tx, clips) = mpsc::unbounded_channel();
    let sink = Arc::new(RecordingSink { clips: clips_tx });
    let sources: HashMap<CameraId, Box<dyn CaptureSource>> = [
        (CameraId::new("left"), TickSource::boxed()),
        (CameraId::new("right"), right),
    ]
    .into_iter()
    .collect();

    let (mut pipeline, alerts) = Pipeline::start(config(triggers), backend, sink, sources).unwrap();
    let lane = LaneId::new("lane-7");
    pipeline
        .apply(SessionCommand::StartSession {
            lane: lane.clone(),
            session: SessionId::new(session),
        })
        .await
        .unwrap();
    Run {
        pipeline,
        alerts,
        clips,
        lane,
    }
}

impl Run {
    async fn next_clips(&mut self, n: usize) -> Vec<Clip> {
        let mut clips = Vec::new();
        while clips.len() < n {
            let clip = tokio::time::timeout(Duration::from_secs(30), self.clips.recv())
                .await
                .expect("clips within 30s of pipeline time")
                .unwrap();
            clips.push(clip);
        }
        clips
    }

    /// End the session, stop the pipeline and check nothing else came out.
    async fn finish(mut self) -> Arc<lane_replay_engine::stats::PipelineStats> {
        let stats = Arc::clone(self.pipeline.stats());
        self.pipeline
            .apply(SessionCommand::EndSession { lane: self.lane.clone() })
            .await
            .unwrap();
        self.pipeline.shutdown().await;
        assert!(self.alerts.try_recv().is_err());
        // Exactly one clip per triggering event.
        assert!(self.clips.try_recv().is_err());
        stats
    }
}

#[tokio::test(start_paused = true)]
async fn delivery_produces_release_and_replay_clips() {
    let mut run = start(DELIVERY, r#"["release", "end-of-delivery"]"#, TickSource::boxed(), "bowler-42").await;
    let clips = run.next_clips(2).await;

    let release = &clips[0];
    assert_eq!(release.event.kind, EventKind::Release);
    assert_eq!(release.event.ts_ms, 8_000);
    assert!(release.id.starts_with("bowler-42-"), "{}", release.id);
    assert!(release.id.ends_with("-1-release"), "{}", release.id);
    assert_eq!((release.window.start_ms, release.window.end_ms), (5_000, 10_000));

    let replay = &clips[1];
    assert_eq!(replay.event.kind, EventKind::EndOfDelivery);
    assert_eq!(replay.event.ts_ms, 9_120);
    assert_eq!(replay.event.span_start_ms, Some(8_000));
    assert_eq!((replay.window.start_ms, replay.window.end_ms), (5_000, 11_120));
    assert!(!replay.is_partial());
    let cameras: Vec<&str> = replay.cameras.iter().map(|c| c.camera_id.as_str()).collect();
    assert_eq!(cameras, vec!["left", "right"]);
    for camera in &replay.cameras {
        assert_eq!(camera.coverage, Coverage::Complete);
        // 5000..=11120 at 40ms steps.
        assert_eq!(camera.frames.len(), 154);
        assert!(camera
            .frames
            .windows(2)
            .all(|w| w[0].seq < w[1].seq));
    }

    // The lane is back to idle and waiting for the next delivery.
    let status = run.pipeline.lane_status(&run.lane).unwrap();
    assert_eq!(status.cycle, 2);

    let stats = run.finish().await;
    assert_eq!(stats.clips_stored.load(Ordering::Relaxed), 2);
    assert_eq!(stats.clips_partial.load(Ordering::Relaxed), 0);
    // release, pin-impact, end-of-delivery
    assert_eq!(stats.events.load(Ordering::Relaxed), 3);
    assert_eq!(stats.degraded_frame_sets.load(Ordering::Relaxed), 0);
}

#[tokio::test(start_paused = true)]
async fn observed_approach_opens_the_replay() {
    let mut run = start(
        APPROACH_THEN_DELIVERY,
        r#"["end-of-delivery"]"#,
        TickSource::boxed(),
        "bowler-7",
    )
    .await;
    let clips = run.next_clips(1).await;

    let replay = &clips[0];
    assert_eq!(replay.event.kind, EventKind::EndOfDelivery);
    assert_eq!(replay.event.ts_ms, 12_120);
    // Back-dated to the first frame the bowler was seen on the approach.
    assert_eq!(replay.event.span_start_ms, Some(10_000));
    // The abandoned first approach used up cycle 1 without an event.
    assert!(replay.id.ends_with("-2-end-of-delivery"), "{}", replay.id);
    assert_eq!((replay.window.start_ms, replay.window.end_ms), (7_000, 14_120));
    assert!(!replay.is_partial());
    for camera in &replay.cameras {
        // 7000..=14120 at 40ms steps.
        assert_eq!(camera.frames.len(), 179);
    }
    assert_eq!(run.pipeline.lane_status(&run.lane).unwrap().cycle, 3);

    let stats = run.finish().await;
    assert_eq!(stats.clips_stored.load(Ordering::Relaxed), 1);
    // approach-start, release, pin-impact, end-of-delivery
    assert_eq!(stats.events.load(Ordering::Relaxed), 4);
}

#[tokio::test(start_paused = true)]
async fn silent_camera_degrades_the_lane_and_the_clip() {
    // The right camera delivers frames 0..=5960ms and then nothing.
    let mut run = start(
        DELIVERY,
        r#"["end-of-delivery"]"#,
        TickSource::silent_after(Some(150)),
        "bowler-42",
    )
    .await;
    let clips = run.next_clips(1).await;

    let replay = &clips[0];
    assert_eq!(replay.event.kind, EventKind::EndOfDelivery);
    assert_eq!(replay.event.ts_ms, 9_120);
    assert_eq!(replay.event.span_start_ms, Some(8_000));
    assert!(replay.is_partial());

    let left = &replay.cameras[0];
    assert_eq!(left.camera_id.as_str(), "left");
    assert_eq!(left.coverage, Coverage::Complete);
    assert_eq!(left.frames.len(), 154);

    let right = &replay.cameras[1];
    assert_eq!(right.camera_id.as_str(), "right");
    assert_eq!(right.frames.len(), 25);
    assert_eq!(
        right.coverage,
        Coverage::Partial {
            missing: vec![TimeRange::new(5_960, 11_120)]
        }
    );

    assert!(run.pipeline.lane_status(&run.lane).unwrap().degraded);

    let stats = run.finish().await;
    assert_eq!(stats.clips_stored.load(Ordering::Relaxed), 1);
    assert_eq!(stats.clips_partial.load(Ordering::Relaxed), 1);
    assert!(stats.degraded_frame_sets.load(Ordering::Relaxed) > 0);
}
