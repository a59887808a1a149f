use bytes::Bytes;

use crate::detection::Entity;
use crate::ids::CameraId;

/// Encoding of the bytes carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    /// One JPEG image (MJPEG streams, snapshot polling).
    Jpeg,
    /// Uncompressed pixels, as produced by the synthetic source.
    Raw { width: u32, height: u32 },
}

/// One timestamped image from one camera.
///
/// Frames are shared as `Arc<Frame>` between the ring buffer, the detection
/// adapter and clip extraction. Nothing mutates a frame after capture.
#[derive(Debug, Clone)]
pub struct Frame {
    pub camera_id: CameraId,
    /// Pipeline clock milliseconds at capture.
    pub captured_at_ms: i64,
    /// Per-camera sequence number, strictly increasing.
    pub seq: u64,
    pub format: PayloadFormat,
    pub payload: Bytes,
    /// Entities computed on-camera, when the source provides them.
    pub detections: Option<Vec<Entity>>,
}

impl Frame {
    pub fn new(
        camera_id: CameraId,
        captured_at_ms: i64,
        seq: u64,
        format: PayloadFormat,
        payload: Bytes,
    ) -> Self {
        Self {
            camera_id,
            captured_at_ms,
            seq,
            format,
            payload,
            detections: None,
        }
    }

    pub fn with_detections(mut self, detections: Vec<Entity>) -> Self {
        self.detections = Some(detections);
        self
    }

    /// The lightweight notification published for this frame.
    pub fn notice(&self) -> FrameNotice {
        FrameNotice {
            camera_id: self.camera_id.clone(),
            captured_at_ms: self.captured_at_ms,
            seq: self.seq,
        }
    }
}

/// "Frame available" notification. Carries identity and time only, never the
/// payload, so fan-out to every lane stays cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameNotice {
    pub camera_id: CameraId,
    pub captured_at_ms: i64,
    pub seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::EntityKind;

    #[test]
    fn notice_mirrors_frame_identity() {
        let frame = Frame::new(
            CameraId::new("cam-a"),
            1_250,
            42,
            PayloadFormat::Jpeg,
            Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xE0]),
        );
        let notice = frame.notice();
        assert_eq!(notice.camera_id, CameraId::new("cam-a"));
        assert_eq!(notice.captured_at_ms, 1_250);
        assert_eq!(notice.seq, 42);
    }

    #[test]
    fn on_camera_detections_ride_along() {
        let frame = Frame::new(
            CameraId::new("cam-a"),
            0,
            1,
            PayloadFormat::Raw { width: 2, height: 1 },
            Bytes::from_static(&[0, 0, 0, 0, 0, 0]),
        )
        .with_detections(vec![Entity::new(EntityKind::Pin, 0.5, 0.95, 0.9)]);
        assert_eq!(frame.format, PayloadFormat::Raw { width: 2, height: 1 });
        assert_eq!(frame.detections.as_ref().map(Vec::len), Some(1));
    }
}
