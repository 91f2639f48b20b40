//! Status snapshot (§3, §6): a versioned, fixed-schema structure rewritten
//! atomically to a well-known path at ≥1 Hz for a companion dashboard to
//! read. A byproduct, never a source of truth for the core's own state.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use base::clock::Clocks;
use serde::Serialize;
use tracing::warn;

use crate::frame::TriggerState;
use crate::recorder::{Recorder, RecorderState};
use crate::ring::RingBuffer;
use crate::sync_publisher::SyncStats;

#[derive(Serialize)]
pub struct LslStatus {
    pub connected: bool,
    pub samples_sent: u64,
    pub samples_per_second: f64,
    pub last_sample: [f64; 3],
}

#[derive(Serialize)]
pub struct BufferStatus {
    pub current_size: usize,
    pub max_size: usize,
    pub utilization_percent: f64,
    pub oldest_frame_age: f64,
}

#[derive(Serialize)]
pub struct RecordingStatus {
    pub active: bool,
    pub current_file: Option<String>,
    pub frames_recorded: u64,
    pub duration: f64,
}

#[derive(Serialize)]
pub struct TriggerStatus {
    pub last_trigger_type: String,
    pub last_trigger_time: f64,
    pub trigger_count: u64,
}

#[derive(Serialize)]
pub struct SystemInfo {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_usage_percent: f64,
}

#[derive(Serialize)]
pub struct Snapshot {
    pub service_running: bool,
    pub uptime: f64,
    pub lsl_status: LslStatus,
    pub buffer_status: BufferStatus,
    pub recording_status: RecordingStatus,
    pub trigger_status: TriggerStatus,
    pub system_info: SystemInfo,
}

/// Builds one point-in-time snapshot from the live components. Cheap
/// enough to call at up to a few Hz; the ring snapshot it takes is O(N)
/// but N is bounded (≤1500 by default).
#[allow(clippy::too_many_arguments)]
pub fn build<C: Clocks>(
    clocks: &C,
    started_at: f64,
    ring: &std::sync::Mutex<RingBuffer>,
    sync_stats: &SyncStats,
    recorder: &Recorder<C>,
    last_trigger: (TriggerState, f64),
) -> Snapshot {
    let now = clocks.now();
    let ring = ring.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let current_size = ring.len();
    let max_size = ring.capacity();
    let oldest_frame_age = ring.oldest_age(now).unwrap_or(0.0);
    drop(ring);

    let samples_sent = sync_stats.samples_sent.load(Ordering::Relaxed);
    let last_frame_number = sync_stats.last_frame_number.load(Ordering::Relaxed);
    let uptime = now - started_at;

    Snapshot {
        service_running: true,
        uptime,
        lsl_status: LslStatus {
            connected: sync_stats.connected.load(Ordering::Relaxed),
            samples_sent,
            samples_per_second: if uptime > 0.0 {
                samples_sent as f64 / uptime
            } else {
                0.0
            },
            last_sample: [last_frame_number as f64, last_trigger.1, last_trigger.0.channel_value()],
        },
        buffer_status: BufferStatus {
            current_size,
            max_size,
            utilization_percent: if max_size > 0 {
                100.0 * current_size as f64 / max_size as f64
            } else {
                0.0
            },
            oldest_frame_age,
        },
        recording_status: {
            let active = recorder.state() == RecorderState::Recording;
            let session = recorder.active_session();
            RecordingStatus {
                active,
                current_file: session
                    .as_ref()
                    .and_then(|s| s.output_file.as_ref())
                    .map(|p| p.display().to_string()),
                frames_recorded: session.as_ref().map(|s| s.frames_recorded).unwrap_or(0),
                duration: session.as_ref().map(|s| s.duration_secs).unwrap_or(0.0),
            }
        },
        trigger_status: TriggerStatus {
            last_trigger_type: last_trigger.0.to_string(),
            last_trigger_time: last_trigger.1,
            trigger_count: recorder.trigger_count(),
        },
        system_info: SystemInfo {
            cpu_percent: 0.0,
            memory_percent: 0.0,
            disk_usage_percent: 0.0,
        },
    }
}

/// Rewrites `path` atomically: write to a `.tmp` sibling, then rename.
pub fn write_atomic(path: &std::path::Path, snapshot: &Snapshot) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    let body = serde_json::to_vec_pretty(snapshot).expect("Snapshot always serializes");
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)
}

/// Spawns the status-writer worker: rewrites the snapshot at least once
/// per `period` until shutdown (§5 worker list item 6).
pub fn spawn<C: Clocks>(
    path: PathBuf,
    period: Duration,
    clocks: Arc<C>,
    started_at: f64,
    ring: Arc<std::sync::Mutex<RingBuffer>>,
    sync_stats: Arc<SyncStats>,
    recorder: Arc<Recorder<C>>,
    last_trigger: Arc<dyn Fn() -> (TriggerState, f64) + Send + Sync>,
    shutdown_rx: base::shutdown::Receiver,
) {
    tokio::spawn(async move {
        let mut shutdown = shutdown_rx.as_future();
        loop {
            let snapshot = build(
                clocks.as_ref(),
                started_at,
                &ring,
                &sync_stats,
                &recorder,
                last_trigger(),
            );
            if let Err(e) = write_atomic(&path, &snapshot) {
                warn!(error = %e, path = %path.display(), "failed to write status snapshot");
            }
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(period) => {}
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;
    use chrono::Utc;

    #[test]
    fn builds_consistent_buffer_fields() {
        let clocks = SimulatedClocks::new(Utc::now());
        clocks.advance(5.0);
        let mut ring = RingBuffer::new(4);
        ring.push(crate::frame::FrameEvent {
            frame_number: 1,
            capture_time: 1.0,
            source: crate::frame::FrameSource::AgentStdout,
        });
        let ring = std::sync::Mutex::new(ring);
        let stats = SyncStats::default();
        let annotation = crate::sync_publisher::TriggerAnnotation::new();
        let recorder = Recorder::new(
            super_test_config(),
            Arc::new(clocks.clone()),
            annotation,
            Arc::new(std::sync::Mutex::new(RingBuffer::new(4))),
        );
        let snap = build(&clocks, 0.0, &ring, &stats, &recorder, (TriggerState::None, 0.0));
        assert_eq!(snap.buffer_status.current_size, 1);
        assert_eq!(snap.buffer_status.max_size, 4);
        assert_eq!(snap.buffer_status.utilization_percent, 25.0);
    }

    fn super_test_config() -> crate::config::Config {
        crate::config::Config::from_yaml("width: 400\nheight: 400\nfps: 100\n").unwrap()
    }
}
