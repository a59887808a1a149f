use std::time::Duration;
use tokio::time::Instant;

/// Process-wide monotonic clock. Every timestamp in the pipeline is
/// milliseconds since `origin`, so capture stamps, staleness checks, event
/// timeouts and clip windows are directly comparable.
#[derive(Debug, Clone, Copy)]
pub struct PipelineClock {
    origin: Instant,
}

impl PipelineClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.ms_at(Instant::now())
    }

    /// Milliseconds since origin for an instant observed by a capture source.
    /// Instants before the origin clamp to zero.
    pub fn ms_at(&self, instant: Instant) -> i64 {
        instant
            .checked_duration_since(self.origin)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// Instant corresponding to a pipeline timestamp, for `sleep_until`.
    pub fn instant_at(&self, ms: i64) -> Instant {
        self.origin + Duration::from_millis(ms.max(0) as u64)
    }
}

impl Default for PipelineClock {
    fn default() -> Self {
        Self::new()
    }
}
