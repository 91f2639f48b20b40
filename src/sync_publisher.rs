//! Sync Publisher (C4): publishes per-frame `(frame_number, trigger_time,
//! trigger_type)` samples to a time-synchronized outbound stream at wire
//! rate (§4.4).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Config;
use crate::frame::{FrameEvent, TriggerState};

const T_DRAIN: Duration = Duration::from_secs(2);
const T_MARK: Duration = Duration::from_secs(1);

/// Shared annotation applied to every outbound sample: the most recent
/// trigger's type and clock time, reverting to `None`/`0.0` `T_MARK` after
/// it was last set (§4.5.1, §4.6 `trigger()`).
#[derive(Default)]
struct AnnotationInner {
    state: TriggerState,
    trigger_time: f64,
    generation: u64,
}

#[derive(Clone)]
pub struct TriggerAnnotation(Arc<std::sync::Mutex<AnnotationInner>>);

impl TriggerAnnotation {
    pub fn new() -> Self {
        TriggerAnnotation(Arc::new(std::sync::Mutex::new(AnnotationInner::default())))
    }

    /// Marks outbound samples with `state` as of clock time `now`, reverting
    /// to `None` after `T_MARK` unless superseded by another call first.
    pub fn mark(&self, state: TriggerState, now: f64) {
        let generation = {
            let mut inner = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            inner.state = state;
            inner.trigger_time = now;
            inner.generation += 1;
            inner.generation
        };
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(T_MARK).await;
            let mut inner = this.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if inner.generation == generation {
                inner.state = TriggerState::None;
                inner.trigger_time = 0.0;
            }
        });
    }

    /// Sets the annotation and holds it indefinitely (no auto-revert),
    /// for the duration of an active recording session (§4.5.2).
    pub fn hold(&self, state: TriggerState, now: f64) {
        let mut inner = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.state = state;
        inner.trigger_time = now;
        inner.generation += 1;
    }

    /// Clears the annotation immediately (used when a recording session
    /// ends, per the Stopping -> Idle transition's 1s delay).
    pub fn clear_after(&self, delay: Duration) {
        let generation = {
            let mut inner = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            inner.generation += 1;
            inner.generation
        };
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut inner = this.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if inner.generation == generation {
                inner.state = TriggerState::None;
                inner.trigger_time = 0.0;
            }
        });
    }

    pub fn snapshot(&self) -> (f64, TriggerState) {
        let inner = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        (inner.trigger_time, inner.state)
    }
}

/// Status counters surfaced in the status snapshot (§6).
#[derive(Default)]
pub struct SyncStats {
    pub connected: AtomicBool,
    pub samples_sent: AtomicU64,
    pub dropped: AtomicU64,
    /// `frame_number` of the most recently published sample, for
    /// `lsl_status.last_sample`'s `f` component (§6). 0 before anything has
    /// been published.
    pub last_frame_number: AtomicU64,
}

/// Handle used by Frame Ingest to enqueue samples; cheap to clone.
#[derive(Clone)]
pub struct SyncPublisherHandle {
    tx: mpsc::Sender<FrameEvent>,
    annotation: TriggerAnnotation,
    stats: Arc<SyncStats>,
}

impl SyncPublisherHandle {
    pub fn annotation(&self) -> &TriggerAnnotation {
        &self.annotation
    }

    pub fn stats(&self) -> &Arc<SyncStats> {
        &self.stats
    }

    /// Current `(trigger_time, trigger_state)` annotation, as seen by the
    /// status snapshot and the public `status()` call.
    pub fn annotation_snapshot(&self) -> (f64, TriggerState) {
        self.annotation.snapshot()
    }

    /// Non-blocking enqueue; drops the newest sample and counts it if the
    /// channel is saturated (§4.4 back-pressure policy).
    pub fn publish(&self, event: FrameEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

trait Outlet: Send {
    fn push(&mut self, sample: [f64; 3]) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

struct LslOutlet(lsl::StreamOutlet);

impl Outlet for LslOutlet {
    fn push(&mut self, sample: [f64; 3]) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.0.push_sample(&sample)?;
        Ok(())
    }
}

/// No-op outlet used when the sync-bus library is unavailable or its
/// outlet fails to open; keeps the rest of the pipeline running (§4.4
/// Startup, S5).
struct NullOutlet;

impl Outlet for NullOutlet {
    fn push(&mut self, _sample: [f64; 3]) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}

fn open_outlet(config: &Config) -> (Box<dyn Outlet>, bool) {
    let source_id = config
        .sync_source_id
        .clone()
        .unwrap_or_else(|| format!("imx296-capture-{}", std::process::id()));
    let info = match lsl::StreamInfo::new(
        &config.sync_stream_name,
        "VideoEvents",
        3,
        config.fps as f64,
        lsl::ChannelFormat::Double64,
        &source_id,
    ) {
        Ok(i) => i,
        Err(e) => {
            warn!(error = %e, "sync bus unavailable; publisher degraded to no-op");
            return (Box::new(NullOutlet), false);
        }
    };
    match lsl::StreamOutlet::new(&info, 0, 360) {
        Ok(o) => (Box::new(LslOutlet(o)), true),
        Err(e) => {
            warn!(error = %e, "sync bus outlet failed to open; publisher degraded to no-op");
            (Box::new(NullOutlet), false)
        }
    }
}

/// Spawns the dedicated sync-publisher worker and returns a handle for
/// Frame Ingest to enqueue samples on.
pub fn spawn(config: &Config, shutdown_rx: base::shutdown::Receiver) -> SyncPublisherHandle {
    let (tx, mut rx) = mpsc::channel::<FrameEvent>(4096);
    let annotation = TriggerAnnotation::new();
    let stats = Arc::new(SyncStats::default());

    let (mut outlet, connected) = open_outlet(config);
    stats.connected.store(connected, Ordering::Relaxed);

    let handle = SyncPublisherHandle {
        tx,
        annotation: annotation.clone(),
        stats: stats.clone(),
    };

    tokio::spawn(async move {
        let mut shutdown = shutdown_rx.as_future();
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let (trigger_time, trigger_state) = annotation.snapshot();
                    let sample = [
                        event.frame_number as f64,
                        trigger_time,
                        trigger_state.channel_value(),
                    ];
                    if outlet.push(sample).is_ok() {
                        stats.samples_sent.fetch_add(1, Ordering::Relaxed);
                        stats.last_frame_number.store(event.frame_number, Ordering::Relaxed);
                    }
                }
            }
        }
        // Drain whatever arrived just before shutdown, bounded by T_DRAIN.
        let drain_deadline = tokio::time::Instant::now() + T_DRAIN;
        while tokio::time::Instant::now() < drain_deadline {
            match tokio::time::timeout(Duration::from_millis(50), rx.recv()).await {
                Ok(Some(event)) => {
                    let (trigger_time, trigger_state) = annotation.snapshot();
                    let sample = [
                        event.frame_number as f64,
                        trigger_time,
                        trigger_state.channel_value(),
                    ];
                    let _ = outlet.push(sample);
                }
                _ => break,
            }
        }
        info!("sync publisher drained and shut down");
    });

    handle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotation_defaults_to_none() {
        let a = TriggerAnnotation::new();
        let (t, s) = a.snapshot();
        assert_eq!(t, 0.0);
        assert_eq!(s, TriggerState::None);
    }

    #[tokio::test(start_paused = true)]
    async fn annotation_reverts_after_mark_duration() {
        let a = TriggerAnnotation::new();
        a.mark(TriggerState::Remote, 5.0);
        let (t, s) = a.snapshot();
        assert_eq!(s, TriggerState::Remote);
        assert_eq!(t, 5.0);

        tokio::time::advance(Duration::from_millis(1100)).await;
        tokio::task::yield_now().await;
        let (t, s) = a.snapshot();
        assert_eq!(s, TriggerState::None);
        assert_eq!(t, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn later_mark_supersedes_earlier_revert() {
        let a = TriggerAnnotation::new();
        a.mark(TriggerState::Keyboard, 1.0);
        tokio::time::advance(Duration::from_millis(500)).await;
        a.mark(TriggerState::Remote, 1.5);
        tokio::time::advance(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;
        // First mark's revert fires around t=1.0s (too late to matter); the
        // second mark's revert hasn't fired yet at t=1.1s total.
        let (_t, s) = a.snapshot();
        assert_eq!(s, TriggerState::Remote);
    }
}
