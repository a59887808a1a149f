use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use lane_replay_common::config::StorageConfig;
use lane_replay_common::PayloadFormat;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::handoff::{ClipSink, SinkError};
use super::keys::{camera_clip_key, manifest_key};
use super::{CameraClip, Clip, Coverage};

/// Storage collaborator that encodes each camera's frames to MP4 with ffmpeg
/// and writes a JSON manifest beside them.
///
/// Outputs are written to a temporary name and renamed into place, and the
/// manifest goes last, so an existing manifest means the clip is complete.
pub struct FfmpegClipSink {
    output_dir: PathBuf,
    prefix: String,
    codec: String,
    crf: u32,
    preset: String,
    fps: f64,
}

#[derive(Serialize)]
struct Manifest<'a> {
    clip_id: &'a str,
    lane_id: &'a str,
    session_id: &'a str,
    event: &'static str,
    event_ts_ms: i64,
    confidence: f32,
    window_start_ms: i64,
    window_end_ms: i64,
    partial: bool,
    extracted_at: String,
    cameras: Vec<ManifestCamera<'a>>,
}

#[derive(Serialize)]
struct ManifestCamera<'a> {
    camera_id: &'a str,
    key: Option<String>,
    frames: usize,
    coverage: &'static str,
    missing_ms: i64,
}

impl FfmpegClipSink {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            prefix: config.prefix.clone(),
            codec: config.codec.clone(),
            crf: config.crf,
            preset: config.preset.clone(),
            fps: config.fps,
        }
    }

    async fn encode_camera(&self, camera: &CameraClip, path: &Path) -> Result<(), SinkError> {
        let Some(first) = camera.frames.first() else {
            return Ok(());
        };
        let format = first.format;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension("mp4.part");
        let args = ffmpeg_args(format, &self.codec, self.crf, &self.preset, self.fps, &tmp_path);

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SinkError::Encode(format!("failed to spawn ffmpeg: {e}")))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SinkError::Encode("could not get ffmpeg stdin handle".into()))?;

        let mut written = 0usize;
        for frame in &camera.frames {
            if frame.format != format {
                warn!(camera = %camera.camera_id, seq = frame.seq, "frame format changed mid-clip, skipping frame");
                continue;
            }
            if let Err(e) = stdin.write_all(&frame.payload).await {
                let _ = child.kill().await;
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(SinkError::Encode(format!("failed to write frame to ffmpeg stdin: {e}")));
            }
            written += 1;
        }
        // Close stdin so ffmpeg knows there are no more frames.
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SinkError::Encode(format!("failed to wait for ffmpeg: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(camera = %camera.camera_id, stderr = %stderr, "ffmpeg exited with error");
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(SinkError::Encode(stderr.into_owned()));
        }
        tokio::fs::rename(&tmp_path, path).await?;
        debug!(camera = %camera.camera_id, frames = written, path = %path.display(), "camera clip encoded");
        Ok(())
    }
}

#[async_trait]
impl ClipSink for FfmpegClipSink {
    async fn accept(&self, clip: &Clip) -> Result<(), SinkError> {
        let lane = clip.event.lane_id.as_str();
        let manifest_path = self
            .output_dir
            .join(manifest_key(&self.prefix, lane, &clip.extracted_at, &clip.id));
        if tokio::fs::try_exists(&manifest_path).await? {
            debug!(clip = %clip.id, "clip manifest exists, nothing to do");
            return Ok(());
        }

        let mut cameras = Vec::with_capacity(clip.cameras.len());
        for camera in &clip.cameras {
            let key = (!camera.frames.is_empty()).then(|| {
                camera_clip_key(
                    &self.prefix,
                    lane,
                    &clip.extracted_at,
                    &clip.id,
                    camera.camera_id.as_str(),
                )
            });
            if let Some(key) = &key {
                let path = self.output_dir.join(key);
                // Left over from an attempt that failed after this camera.
                if !tokio::fs::try_exists(&path).await? {
                    self.encode_camera(camera, &path).await?;
                }
            }
            let (coverage, missing_ms): (&'static str, i64) = match &camera.coverage {
                Coverage::Complete => ("complete", 0),
                Coverage::Partial { missing } => {
                    ("partial", missing.iter().map(|r| r.duration_ms()).sum())
                }
                Coverage::Empty => ("empty", clip.window.duration_ms()),
            };
            cameras.push(ManifestCamera {
                camera_id: camera.camera_id.as_str(),
                key,
                frames: camera.frames.len(),
                coverage,
                missing_ms,
            });
        }

        let manifest = Manifest {
            clip_id: &clip.id,
            lane_id: lane,
            session_id: clip.event.session_id.as_str(),
            event: clip.event.kind.as_str(),
            event_ts_ms: clip.event.ts_ms,
            confidence: clip.event.confidence,
            window_start_ms: clip.window.start_ms,
            window_end_ms: clip.window.end_ms,
            partial: clip.is_partial(),
            extracted_at: clip.extracted_at.to_rfc3339(),
            cameras,
        };
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| SinkError::Rejected(format!("manifest serialization failed: {e}")))?;
        if let Some(parent) = manifest_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = manifest_path.with_extension("json.part");
        tokio::fs::write(&tmp_path, json).await?;
        tokio::fs::rename(&tmp_path, &manifest_path).await?;

        info!(clip = %clip.id, path = %manifest_path.display(), "clip written");
        Ok(())
    }

    fn name(&self) -> &str {
        "ffmpeg"
    }
}

fn ffmpeg_args(
    format: PayloadFormat,
    codec: &str,
    crf: u32,
    preset: &str,
    fps: f64,
    output: &Path,
) -> Vec<String> {
    let vcodec = match codec {
        "h265" => "libx265",
        _ => "libx264",
    };
    let mut args: Vec<String> = match format {
        PayloadFormat::Jpeg => vec!["-f".into(), "image2pipe".into(), "-vcodec".into(), "mjpeg".into()],
        PayloadFormat::Raw { width, height } => vec![
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "gray".into(),
            "-s".into(),
            format!("{width}x{height}"),
        ],
    };
    args.extend([
        "-r".into(),
        fps.to_string(),
        "-i".into(),
        "pipe:0".into(),
        "-c:v".into(),
        vcodec.into(),
        "-preset".into(),
        preset.into(),
        "-crf".into(),
        crf.to_string(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-movflags".into(),
        "+faststart".into(),
        "-f".into(),
        "mp4".into(),
        "-y".into(),
        output.display().to_string(),
    ]);
    args
}

/// Check whether ffmpeg is available on PATH. Logs a warning if not found.
pub async fn check_ffmpeg_available() {
    match Command::new("ffmpeg").arg("-version").output().await {
        Ok(out) if out.status.success() => {
            debug!("ffmpeg is available");
        }
        Ok(_) => {
            warn!("ffmpeg returned non-zero for -version; clip encoding may fail");
        }
        Err(e) => {
            warn!(
                error = %e,
                "ffmpeg not found on PATH; clips will fail to store. \
                 Install ffmpeg with libx264/libx265 support."
            );
        }
    }
}
