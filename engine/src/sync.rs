use std::collections::{HashMap, VecDeque};

use lane_replay_common::config::SyncConfig;
use lane_replay_common::{CameraId, FrameNotice, LaneId};
use tracing::{debug, info, warn};

/// Time-aligned frames from one lane's cameras, referenced by notice (never
/// by payload). Immutable once emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSet {
    /// Per-lane, strictly increasing.
    pub id: u64,
    pub lane_id: LaneId,
    pub frames: Vec<FrameNotice>,
    /// Assigned cameras that contributed no frame.
    pub missing: Vec<CameraId>,
    pub degraded: bool,
}

impl FrameSet {
    /// Earliest capture time among the members.
    pub fn reference_ts(&self) -> i64 {
        self.frames
            .iter()
            .map(|f| f.captured_at_ms)
            .min()
            .unwrap_or_default()
    }

    pub fn spread_ms(&self) -> i64 {
        let max = self.frames.iter().map(|f| f.captured_at_ms).max();
        max.map_or(0, |max| max - self.reference_ts())
    }

    pub fn frame(&self, camera_id: &CameraId) -> Option<&FrameNotice> {
        self.frames.iter().find(|f| &f.camera_id == camera_id)
    }
}

#[derive(Debug, Default)]
struct CameraTrack {
    pending: VecDeque<FrameNotice>,
    /// Highest sequence number already placed in a frame set for this lane.
    consumed_seq: Option<u64>,
    last_seen_ms: Option<i64>,
    last_included_ms: Option<i64>,
}

impl CameraTrack {
    fn accepts(&self, seq: u64) -> bool {
        let above_consumed = self.consumed_seq.map_or(true, |c| seq > c);
        let above_pending = self.pending.back().map_or(true, |n| seq > n.seq);
        above_consumed && above_pending
    }

    fn consume(&mut self, seq: u64, now_ms: i64) {
        self.consumed_seq = Some(seq);
        self.last_included_ms = Some(now_ms);
        while self.pending.front().is_some_and(|n| n.seq <= seq) {
            self.pending.pop_front();
        }
    }
}

/// Per-lane frame synchronizer.
///
/// Staleness is judged on the lane's data clock (the newest capture time seen
/// from any of its cameras), so a silent camera is noticed as soon as the
/// others move past the grace period.
pub struct Synchronizer {
    lane_id: LaneId,
    cameras: Vec<CameraId>,
    tracks: HashMap<CameraId, CameraTrack>,
    tolerance_ms: i64,
    grace_ms: i64,
    max_pending: usize,
    next_id: u64,
    lane_now_ms: i64,
    started_ms: Option<i64>,
    degraded: bool,
}

impl Synchronizer {
    pub fn new(lane_id: LaneId, cameras: Vec<CameraId>, config: &SyncConfig) -> Self {
        let mut sync = Self {
            lane_id,
            cameras: Vec::new(),
            tracks: HashMap::new(),
            tolerance_ms: config.tolerance_ms,
            grace_ms: config.grace_ms,
            max_pending: config.max_pending.max(1),
            next_id: 1,
            lane_now_ms: i64::MIN,
            started_ms: None,
            degraded: false,
        };
        sync.reassign(cameras);
        sync
    }

    pub fn cameras(&self) -> &[CameraId] {
        &self.cameras
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Replace the camera assignment. All per-camera state is dropped; frame
    /// set ids keep counting.
    pub fn reassign(&mut self, cameras: Vec<CameraId>) {
        self.tracks = cameras
            .iter()
            .map(|c| (c.clone(), CameraTrack::default()))
            .collect();
        self.cameras = cameras;
        self.started_ms = None;
        self.lane_now_ms = i64::MIN;
        self.degraded = false;
    }

    /// Feed one frame-available notice. Returns the frame sets that became
    /// complete, oldest first.
    pub fn on_notice(&mut self, notice: FrameNotice) -> Vec<FrameSet> {
        let max_pending = self.max_pending;
        let Some(track) = self.tracks.get_mut(&notice.camera_id) else {
            return Vec::new();
        };
        if !track.accepts(notice.seq) {
            debug!(lane = %self.lane_id, camera = %notice.camera_id, seq = notice.seq, "stale notice ignored");
            return Vec::new();
        }
        let ts = notice.captured_at_ms;
        track.last_seen_ms = Some(ts);
        track.pending.push_back(notice);
        if track.pending.len() > max_pending {
            track.pending.pop_front();
        }
        self.lane_now_ms = self.lane_now_ms.max(ts);
        self.started_ms.get_or_insert(ts);

        let mut emitted = Vec::new();
        while let Some(set) = self.try_emit() {
            emitted.push(set);
        }
        emitted
    }

    /// Whether the camera has reported within the grace period. A camera
    /// never heard from is given the grace period from the lane's first notice.
    fn responsive(&self, camera_id: &CameraId) -> bool {
        let since = self.tracks[camera_id].last_seen_ms.or(self.started_ms);
        since.is_some_and(|t| self.lane_now_ms - t <= self.grace_ms)
    }

    /// Whether the camera has been left out of frame sets for longer than the
    /// grace period, whether silent or out of step with the others.
    fn lagging(&self, camera_id: &CameraId) -> bool {
        let since = self.tracks[camera_id].last_included_ms.or(self.started_ms);
        since.map_or(true, |t| self.lane_now_ms - t > self.grace_ms)
    }

    fn try_emit(&mut self) -> Option<FrameSet> {
        let responsive: Vec<CameraId> = self
            .cameras
            .iter()
            .filter(|c| self.responsive(c))
            .cloned()
            .collect();
        if let Some(chosen) = self.align(&responsive) {
            return Some(self.emit(chosen));
        }

        let mut keeping_up: Vec<CameraId> = responsive
            .iter()
            .filter(|c| !self.lagging(c))
            .cloned()
            .collect();
        if keeping_up.is_empty() {
            // Nobody has been in a set for a while: follow whoever drives the
            // data clock.
            keeping_up = responsive
                .iter()
                .filter(|c| self.tracks[*c].last_seen_ms == Some(self.lane_now_ms))
                .cloned()
                .collect();
        }
        if keeping_up.len() < responsive.len() {
            if let Some(chosen) = self.align(&keeping_up) {
                return Some(self.emit(chosen));
            }
        }
        None
    }

    /// Best alignment of one pending notice per camera: smallest spread within
    /// tolerance, earliest on ties.
    fn align(&self, cameras: &[CameraId]) -> Option<Vec<FrameNotice>> {
        if cameras.is_empty() || cameras.iter().any(|c| self.tracks[c].pending.is_empty()) {
            return None;
        }
        let lists: Vec<&VecDeque<FrameNotice>> =
            cameras.iter().map(|c| &self.tracks[c].pending).collect();
        let mut best: Option<(i64, i64, Vec<usize>)> = None;
        let mut picks = Vec::with_capacity(lists.len());
        search(&lists, self.tolerance_ms, &mut picks, i64::MAX, i64::MIN, &mut best);
        best.map(|(_, _, idx)| {
            idx.iter()
                .zip(&lists)
                .map(|(&i, list)| list[i].clone())
                .collect()
        })
    }

    fn emit(&mut self, frames: Vec<FrameNotice>) -> FrameSet {
        let now = self.lane_now_ms;
        for notice in &frames {
            if let Some(track) = self.tracks.get_mut(&notice.camera_id) {
                track.consume(notice.seq, now);
            }
        }
        let missing: Vec<CameraId> = self
            .cameras
            .iter()
            .filter(|c| !frames.iter().any(|f| &f.camera_id == *c))
            .cloned()
            .collect();
        let degraded = !missing.is_empty();
        if degraded != self.degraded {
            if degraded {
                warn!(lane = %self.lane_id, missing = ?missing, "lane degraded to partial frame sets");
            } else {
                info!(lane = %self.lane_id, "all cameras back in sync");
            }
            self.degraded = degraded;
        }

        let set = FrameSet {
            id: self.next_id,
            lane_id: self.lane_id.clone(),
            frames,
            missing,
            degraded,
        };
        self.next_id += 1;
        debug!(lane = %self.lane_id, set = set.id, ts = set.reference_ts(), spread = set.spread_ms(), "frame set emitted");
        set
    }
}

fn search(
    lists: &[&VecDeque<FrameNotice>],
    tolerance_ms: i64,
    picks: &mut Vec<usize>,
    lo: i64,
    hi: i64,
    best: &mut Option<(i64, i64, Vec<usize>)>,
) {
    let depth = picks.len();
    if depth == lists.len() {
        let spread = hi - lo;
        let better = match best {
            Some((s, start, _)) => (spread, lo) < (*s, *start),
            None => true,
        };
        if better {
            *best = Some((spread, lo, picks.clone()));
        }
        return;
    }
    for (i, notice) in lists[depth].iter().enumerate() {
        let ts = notice.captured_at_ms;
        let (lo, hi) = (lo.min(ts), hi.max(ts));
        if hi - lo > tolerance_ms {
            continue;
        }
        picks.push(i);
        search(lists, tolerance_ms, picks, lo, hi, best);
        picks.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn config() -> SyncConfig {
        SyncConfig {
            tolerance_ms: 20,
            grace_ms: 500,
            max_pending: 8,
        }
    }

    fn notice(camera: &str, seq: u64, ts: i64) -> FrameNotice {
        FrameNotice {
            camera_id: CameraId::new(camera),
            captured_at_ms: ts,
            seq,
        }
    }

    fn two_camera_sync() -> Synchronizer {
        Synchronizer::new(
            LaneId::new("lane-1"),
            vec![CameraId::new("a"), CameraId::new("b")],
            &config(),
        )
    }

    #[test]
    fn emits_exactly_one_set_per_aligned_cluster() {
        let mut sync = two_camera_sync();
        let mut sets = Vec::new();
        for i in 0..50u64 {
            let ts = i as i64 * 33;
            sets.extend(sync.on_notice(notice("a", i + 1, ts)));
            sets.extend(sync.on_notice(notice("b", i + 1, ts + 3)));
        }
        assert_eq!(sets.len(), 50);

        let mut used = HashSet::new();
        for (i, set) in sets.iter().enumerate() {
            assert_eq!(set.id, i as u64 + 1);
            assert!(!set.degraded);
            assert_eq!(set.frames.len(), 2);
            assert!(set.spread_ms() <= 20);
            for f in &set.frames {
                assert!(used.insert((f.camera_id.clone(), f.seq)), "frame reused");
            }
        }
    }

    #[test]
    fn frames_outside_tolerance_do_not_align() {
        let mut sync = two_camera_sync();
        assert!(sync.on_notice(notice("a", 1, 100)).is_empty());
        assert!(sync.on_notice(notice("b", 1, 150)).is_empty());
        let sets = sync.on_notice(notice("a", 2, 140));
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].reference_ts(), 140);
    }

    #[test]
    fn picks_alignment_with_smallest_spread() {
        let mut sync = two_camera_sync();
        sync.on_notice(notice("b", 1, 95));
        sync.on_notice(notice("b", 2, 102));
        let sets = sync.on_notice(notice("a", 1, 100));
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].frame(&CameraId::new("b")).unwrap().seq, 2);
        // b:1 is behind the consumed watermark now
        assert!(sync.on_notice(notice("b", 1, 95)).is_empty());
    }

    #[test]
    fn silent_camera_degrades_lane_after_grace() {
        let mut sync = two_camera_sync();
        let mut sets = Vec::new();
        for i in 0..10u64 {
            let ts = i as i64 * 40;
            sets.extend(sync.on_notice(notice("a", i + 1, ts)));
            sets.extend(sync.on_notice(notice("b", i + 1, ts)));
        }
        assert_eq!(sets.len(), 10);

        // b goes quiet at 360ms; a keeps going.
        let mut degraded = Vec::new();
        for i in 10..40u64 {
            degraded.extend(sync.on_notice(notice("a", i + 1, i as i64 * 40)));
        }
        assert!(!degraded.is_empty(), "lane stalled instead of degrading");
        assert!(degraded.iter().all(|s| s.degraded && s.frames.len() == 1));
        assert_eq!(degraded[0].missing, vec![CameraId::new("b")]);
        // The backlog flushed on degrading starts after b's last frame.
        assert!(degraded[0].reference_ts() > 360);
        assert!(sync.is_degraded());
    }

    #[test]
    fn recovers_full_sets_when_camera_returns() {
        let mut sync = two_camera_sync();
        for i in 0..30u64 {
            sync.on_notice(notice("a", i + 1, i as i64 * 40));
        }
        assert!(sync.is_degraded());
        let sets = sync.on_notice(notice("b", 1, 29 * 40 + 40));
        assert!(sets.is_empty());
        let sets = sync.on_notice(notice("a", 31, 30 * 40));
        assert_eq!(sets.len(), 1);
        assert!(!sets[0].degraded);
        assert!(!sync.is_degraded());
    }

    #[test]
    fn out_of_step_camera_is_excluded_after_grace() {
        let mut sync = two_camera_sync();
        let mut sets = Vec::new();
        // b reports steadily, but 400ms behind a: further back than a's
        // pending notices reach, yet inside the silence grace period.
        for i in 0..40u64 {
            let ts = i as i64 * 40;
            sets.extend(sync.on_notice(notice("a", i + 1, ts)));
            sets.extend(sync.on_notice(notice("b", i + 1, ts - 400)));
        }
        assert!(!sets.is_empty());
        assert!(sets.iter().all(|s| s.degraded && s.frame(&CameraId::new("a")).is_some()));
    }

    #[test]
    fn duplicate_and_unknown_notices_are_ignored() {
        let mut sync = two_camera_sync();
        sync.on_notice(notice("a", 1, 0));
        assert_eq!(sync.on_notice(notice("b", 1, 0)).len(), 1);
        assert!(sync.on_notice(notice("a", 1, 0)).is_empty());
        assert!(sync.on_notice(notice("b", 1, 0)).is_empty());
        assert!(sync.on_notice(notice("z", 1, 0)).is_empty());
    }

    #[test]
    fn reassignment_resets_camera_state() {
        let mut sync = two_camera_sync();
        sync.on_notice(notice("a", 1, 0));
        sync.reassign(vec![CameraId::new("c")]);
        assert_eq!(sync.cameras(), &[CameraId::new("c")]);
        let sets = sync.on_notice(notice("c", 7, 10));
        assert_eq!(sets.len(), 1);
        assert!(!sets[0].degraded);
        assert!(sync.on_notice(notice("a", 2, 20)).is_empty());
    }
}
