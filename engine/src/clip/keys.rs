use chrono::{DateTime, Utc};

fn date_str(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

/// Ids come from cameras and the session service; keep them path-safe.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Key for one camera's footage of a clip.
/// e.g. "replays/lane-3/2026-10-18/bowler-42-5120-1-end-of-delivery_lane3-left.mp4"
pub fn camera_clip_key(
    prefix: &str,
    lane_id: &str,
    extracted_at: &DateTime<Utc>,
    clip_id: &str,
    camera_id: &str,
) -> String {
    format!(
        "{prefix}{lane}/{date}/{clip}_{camera}.mp4",
        lane = sanitize(lane_id),
        date = date_str(extracted_at),
        clip = sanitize(clip_id),
        camera = sanitize(camera_id),
    )
}

/// Key for the clip manifest, written last; its presence marks the clip as
/// stored.
/// e.g. "replays/lane-3/2026-10-18/bowler-42-5120-1-end-of-delivery.json"
pub fn manifest_key(prefix: &str, lane_id: &str, extracted_at: &DateTime<Utc>, clip_id: &str) -> String {
    format!(
        "{prefix}{lane}/{date}/{clip}.json",
        lane = sanitize(lane_id),
        date = date_str(extracted_at),
        clip = sanitize(clip_id),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_key_format() {
        // 2026-02-18T09:30:00.000Z
        let at = Utc.timestamp_millis_opt(1_771_407_000_000).unwrap();

        let k = camera_clip_key("replays/", "lane-3", &at, "s-1-0-1-end-of-delivery", "left");
        assert_eq!(k, "replays/lane-3/2026-02-18/s-1-0-1-end-of-delivery_left.mp4");

        let m = manifest_key("replays/", "lane-3", &at, "s-1-0-1-end-of-delivery");
        assert!(m.ends_with(".json"));
        assert_eq!(&k[..k.rfind('/').unwrap()], &m[..m.rfind('/').unwrap()]);
    }

    #[test]
    fn test_ids_are_sanitized() {
        let at = Utc.timestamp_millis_opt(0).unwrap();
        let k = camera_clip_key("", "lane 3/../x", &at, "clip", "cam:1");
        assert_eq!(k, "lane_3_.._x/1970-01-01/clip_cam_1.mp4");
    }
}
