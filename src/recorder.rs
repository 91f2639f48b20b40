//! Trigger Arbiter + Recorder (C5): a single state machine serializing
//! start/stop commands from every source, owning the encoder subprocess
//! lifecycle and the pre-trigger ring dump (§4.5).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base::clock::Clocks;
use chrono::Utc;
use derive_more::Display;
use tokio::process::Command as TokioCommand;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::frame::{FrameEvent, TriggerState};
use crate::ingest::probe_output_file;
use crate::ring::RingBuffer;
use crate::sync_publisher::TriggerAnnotation;

/// Caller-facing error variants for the public API (§7 "State" taxon);
/// kept distinct from `base::ErrorKind` because callers match on these by
/// name.
#[derive(Clone, Debug, Display, PartialEq)]
pub enum RecorderError {
    #[display("a recording is already in progress")]
    AlreadyRecording,
    #[display("no recording is in progress")]
    NotRecording,
    #[display("the camera agent is not available")]
    AgentUnavailable,
    #[display("failed to spawn the encoder process")]
    EncoderSpawnFailed,
    #[display("the camera agent exited with code {code}")]
    AgentExited { code: i32 },
}

impl std::error::Error for RecorderError {}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RecorderState {
    Idle,
    Arming,
    Recording,
    Stopping,
}

/// Statistics reported to the caller on `stop_recording` and to the status
/// snapshot on completion (§3 Lifecycle, §4.6).
#[derive(Clone, Debug)]
pub struct Stats {
    pub session_id: u128,
    pub frames_recorded: u64,
    pub output_file: Option<PathBuf>,
    pub output_bytes: u64,
    pub duration_secs: f64,
}

struct Session {
    id: u128,
    started_at: f64,
    started_at_utc: chrono::DateTime<Utc>,
    requested_duration: Option<f64>,
    output_stem: PathBuf,
    prebuffer_path: PathBuf,
    first_frame_number_during_record: Option<u64>,
    last_frame_number_during_record: Option<u64>,
    frames_observed_during_record: u64,
    stop_tx: Option<oneshot::Sender<()>>,
}

struct Inner {
    state: RecorderState,
    session: Option<Session>,
}

/// Hard wall-clock timeout on the encoder `wait`, per §4.5.4.
fn encoder_wait_timeout(requested_duration: Option<f64>) -> Duration {
    let secs = (requested_duration.unwrap_or(0.0) + 10.0).max(30.0);
    Duration::from_secs_f64(secs)
}

pub struct Recorder<C: Clocks> {
    config: Config,
    clocks: Arc<C>,
    annotation: TriggerAnnotation,
    ring: Arc<std::sync::Mutex<RingBuffer>>,
    inner: base::Mutex<Inner>,
    agent_available: AtomicBool,
    trigger_count: AtomicU64,
    next_id: AtomicU64,
}

pub type RecorderHandle<C = base::clock::RealClocks> = Arc<Recorder<C>>;

impl<C: Clocks> Recorder<C> {
    pub fn new(
        config: Config,
        clocks: Arc<C>,
        annotation: TriggerAnnotation,
        ring: Arc<std::sync::Mutex<RingBuffer>>,
    ) -> Arc<Self> {
        Arc::new(Recorder {
            config,
            clocks,
            annotation,
            ring,
            inner: base::Mutex::new(Inner {
                state: RecorderState::Idle,
                session: None,
            }),
            agent_available: AtomicBool::new(true),
            trigger_count: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn state(&self) -> RecorderState {
        self.inner.lock().state
    }

    pub fn trigger_count(&self) -> u64 {
        self.trigger_count.load(Ordering::Relaxed)
    }

    /// Point-in-time view of the active session, if any, for the status
    /// snapshot (§6 `recording_status`).
    pub fn active_session(&self) -> Option<Stats> {
        let inner = self.inner.lock();
        let session = inner.session.as_ref()?;
        Some(Stats {
            session_id: session.id,
            frames_recorded: session.frames_observed_during_record,
            output_file: probe_output_file(&session.output_stem),
            output_bytes: 0,
            duration_secs: self.clocks.now() - session.started_at,
        })
    }

    /// Marks the agent as having exited; future `start_recording` calls
    /// fail with `AgentUnavailable` until `mark_agent_available` is called
    /// (S4).
    pub fn mark_agent_unavailable(&self, code: i32) {
        self.agent_available.store(false, Ordering::Release);
        warn!(code, "camera agent unavailable for new recordings");
    }

    pub fn mark_agent_available(&self) {
        self.agent_available.store(true, Ordering::Release);
    }

    /// Called by Frame Ingest's fan-out worker on every accepted frame
    /// (§4.2 fan-out step 3). Advances Arming -> Recording on the first
    /// frame observed after arming, and otherwise updates the recording
    /// frame counters.
    pub fn observe_frame(self: &Arc<Self>, event: FrameEvent) {
        let mut inner = self.inner.lock();
        if inner.state == RecorderState::Arming {
            inner.state = RecorderState::Recording;
            if let Some(session) = inner.session.as_mut() {
                session.started_at = event.capture_time;
                session.first_frame_number_during_record = Some(event.frame_number);
            }
            info!(frame_number = event.frame_number, "recording armed session is now recording");
        }
        if inner.state == RecorderState::Recording {
            if let Some(session) = inner.session.as_mut() {
                session.frames_observed_during_record += 1;
                session.last_frame_number_during_record = Some(event.frame_number);
            }
        }
    }

    fn new_session_id(&self) -> u128 {
        let counter = self.next_id.fetch_add(1, Ordering::Relaxed) as u128;
        let pid = std::process::id() as u128;
        (pid << 64) | counter
    }

    /// Idle -> Arming (§4.5.2). Picks the output paths, dumps the
    /// pre-trigger ring, and spawns the recording-dedicated encoder
    /// process.
    pub async fn start_recording(
        self: &Arc<Self>,
        duration: Option<f64>,
        source: TriggerState,
    ) -> Result<u128, RecorderError> {
        {
            let mut inner = self.inner.lock();
            if inner.state != RecorderState::Idle {
                return Err(RecorderError::AlreadyRecording);
            }
            if !self.agent_available.load(Ordering::Acquire) {
                return Err(RecorderError::AgentUnavailable);
            }
            inner.state = RecorderState::Arming;
        }

        let (now, wall) = self.clocks.wall();
        let id = self.new_session_id();
        let day_dir = self
            .config
            .recordings_root
            .join(wall.format("%Y_%m_%d").to_string())
            .join("video");
        let stamp = wall.format("%Y_%m_%d_%H_%M_%S").to_string();
        if let Err(e) = std::fs::create_dir_all(&day_dir) {
            error!(error = %e, "failed to create recording directory");
            self.revert_to_idle_after_failure();
            return Err(RecorderError::EncoderSpawnFailed);
        }
        let output_stem = day_dir.join(&stamp);
        let prebuffer_path = day_dir.join(format!("{stamp}_buffer.txt"));

        if let Err(e) = self.dump_prebuffer(&prebuffer_path, id, now) {
            error!(error = %e, "failed to write pre-trigger buffer sidecar");
        }

        let stop_tx = match self.spawn_encoder(&output_stem, duration) {
            Ok((tx, rx, child)) => {
                self.supervise(id, child, duration, rx);
                tx
            }
            Err(e) => {
                warn!(error = %e, "encoder spawn failed");
                self.revert_to_idle_after_failure();
                return Err(RecorderError::EncoderSpawnFailed);
            }
        };

        {
            let mut inner = self.inner.lock();
            inner.session = Some(Session {
                id,
                started_at: now,
                started_at_utc: wall,
                requested_duration: duration,
                output_stem,
                prebuffer_path,
                first_frame_number_during_record: None,
                last_frame_number_during_record: None,
                frames_observed_during_record: 0,
                stop_tx: Some(stop_tx),
            });
        }

        self.trigger_count.fetch_add(1, Ordering::Relaxed);
        self.annotation.hold(source, now);
        Ok(id)
    }

    fn revert_to_idle_after_failure(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        inner.state = RecorderState::Idle;
        inner.session = None;
        drop(inner);
        self.annotation.clear_after(Duration::from_secs(1));
    }

    fn dump_prebuffer(
        &self,
        path: &Path,
        session_id: u128,
        now: f64,
    ) -> std::io::Result<()> {
        let snapshot = self.ring.lock().unwrap_or_else(std::sync::PoisonError::into_inner).snapshot();
        let oldest_age = snapshot
            .first()
            .map(|f| now - f.capture_time)
            .unwrap_or(0.0);
        use std::fmt::Write as _;
        let mut body = String::new();
        writeln!(body, "# Pre-trigger buffer frames for {session_id}").ok();
        writeln!(
            body,
            "# Captured before trigger; 1 line per frame: <frame_number> <capture_time_s>"
        )
        .ok();
        writeln!(
            body,
            "# Buffer duration: {oldest_age} s, frames: {}",
            snapshot.len()
        )
        .ok();
        for f in &snapshot {
            writeln!(body, "{} {}", f.frame_number, f.capture_time).ok();
        }
        std::fs::write(path, body)
    }

    /// Spawns the recording-dedicated agent invocation (this core's only
    /// concrete handle on §4.5.4's "encoder subprocess"; see DESIGN.md for
    /// why it reuses the agent binary rather than a second undocumented
    /// one) with an output path, and returns a stop-signal channel plus the
    /// child handle.
    fn spawn_encoder(
        &self,
        output_stem: &Path,
        duration: Option<f64>,
    ) -> std::io::Result<(oneshot::Sender<()>, oneshot::Receiver<()>, tokio::process::Child)> {
        let mut cmd = TokioCommand::new(&self.config.agent_path);
        cmd.arg(self.config.width.to_string())
            .arg(self.config.height.to_string())
            .arg(self.config.fps.to_string());
        if let Some(d) = duration {
            cmd.arg(((d * 1000.0) as u64).to_string());
        } else {
            cmd.arg("0");
        }
        if let Some(exposure) = self.config.exposure_us {
            cmd.arg(exposure.to_string());
        }
        cmd.arg(output_stem);
        cmd.env("STREAM_LSL", "1");
        cmd.env("cam1", "1");
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::null());
        let child = cmd.spawn()?;
        let (tx, rx) = oneshot::channel();
        Ok((tx, rx, child))
    }

    /// Supervises the encoder child: waits (with the §4.5.4 hard timeout),
    /// reacts to an explicit stop signal, and drives Recording -> Stopping
    /// -> Idle.
    fn supervise(
        self: &Arc<Self>,
        session_id: u128,
        mut child: tokio::process::Child,
        duration: Option<f64>,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        let this = self.clone();
        let timeout = encoder_wait_timeout(duration);
        let duration_timer = duration.map(Duration::from_secs_f64);
        tokio::spawn(async move {
            let reaped = tokio::select! {
                status = child.wait() => Some(status),
                _ = &mut stop_rx => {
                    let _ = child.start_kill();
                    None
                }
                _ = async {
                    if let Some(d) = duration_timer { tokio::time::sleep(d).await } else { std::future::pending().await }
                } => {
                    let _ = child.start_kill();
                    None
                }
            };
            this.enter_stopping(session_id);
            let status = match reaped {
                Some(Ok(s)) => Some(s),
                Some(Err(e)) => {
                    error!(error = %e, "error waiting on encoder process");
                    None
                }
                None => match tokio::time::timeout(timeout, child.wait()).await {
                    Ok(Ok(s)) => Some(s),
                    Ok(Err(e)) => {
                        error!(error = %e, "error waiting on encoder process after stop");
                        None
                    }
                    Err(_) => {
                        warn!("encoder did not exit within timeout; killing");
                        let _ = child.kill().await;
                        None
                    }
                },
            };
            this.finish(session_id, status.and_then(|s| s.code()));
        });
    }

    fn enter_stopping(self: &Arc<Self>, session_id: u128) {
        let mut inner = self.inner.lock();
        if inner.session.as_ref().map(|s| s.id) == Some(session_id) {
            inner.state = RecorderState::Stopping;
        }
    }

    fn finish(self: &Arc<Self>, session_id: u128, exit_code: Option<i32>) {
        let mut inner = self.inner.lock();
        let Some(session) = inner.session.take().filter(|s| s.id == session_id) else {
            return;
        };
        inner.state = RecorderState::Idle;
        drop(inner);

        let output_file = probe_output_file(&session.output_stem);
        let output_bytes = output_file
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0);
        let stats = Stats {
            session_id: session.id,
            frames_recorded: session.frames_observed_during_record,
            output_file,
            output_bytes,
            duration_secs: self.clocks.now() - session.started_at,
        };
        info!(
            session_id = session.id,
            frames_recorded = stats.frames_recorded,
            output_bytes = %base::strutil::encode_size(stats.output_bytes as i64),
            exit_code,
            "recording session finished"
        );
        if let Some(code) = exit_code {
            if code != 0 {
                warn!(code, "encoder exited nonzero");
                self.mark_agent_unavailable(code);
            }
        }
        // Revert TriggerState to None after a 1s delay so trailing frames
        // still carry the attribution (§4.5.2).
        self.annotation.clear_after(Duration::from_secs(1));
        let _ = session.started_at_utc;
    }

    /// Recording|Arming -> Stopping (§4.5.2): `StopRecording` or duration
    /// elapsed both funnel through here by signalling the supervisor.
    pub fn stop_recording(&self) -> Result<(), RecorderError> {
        let mut inner = self.inner.lock();
        match inner.state {
            RecorderState::Idle => Err(RecorderError::NotRecording),
            RecorderState::Stopping => Ok(()),
            RecorderState::Arming | RecorderState::Recording => {
                if let Some(session) = inner.session.as_mut() {
                    if let Some(tx) = session.stop_tx.take() {
                        let _ = tx.send(());
                    }
                }
                Ok(())
            }
        }
    }

    pub fn trigger(&self, source: TriggerState) {
        self.trigger_count.fetch_add(1, Ordering::Relaxed);
        self.annotation.mark(source, self.clocks.now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameSource;
    use base::clock::SimulatedClocks;

    fn test_config() -> Config {
        Config {
            width: 400,
            height: 400,
            fps: 100,
            exposure_us: None,
            // A long-running, argument-tolerant stand-in for the camera
            // agent so tests can observe the Arming/Recording states
            // before the child exits.
            agent_path: PathBuf::from("/usr/bin/yes"),
            agent_env: Default::default(),
            markers_path: PathBuf::from("/tmp/does-not-exist-markers.txt"),
            ring_capacity: 10,
            sync_stream_name: "IMX296Camera".into(),
            sync_source_id: None,
            recordings_root: std::env::temp_dir().join(format!("imx296-test-{}", std::process::id())),
            status_path: std::env::temp_dir().join("imx296_status_test.json"),
            status_period_secs: 1.0,
            remote_server: None,
            remote_topic: None,
            remote_poll_interval_secs: 1.0,
            keyboard_enabled: false,
        }
    }

    #[tokio::test]
    async fn rejects_reentrant_start() {
        let clocks = Arc::new(SimulatedClocks::new(Utc::now()));
        let ring = Arc::new(std::sync::Mutex::new(RingBuffer::new(10)));
        let annotation = TriggerAnnotation::new();
        let recorder = Recorder::new(test_config(), clocks, annotation, ring);
        let r1 = recorder.start_recording(Some(5.0), TriggerState::Keyboard).await;
        assert!(r1.is_ok());
        let r2 = recorder.start_recording(Some(5.0), TriggerState::Keyboard).await;
        assert_eq!(r2, Err(RecorderError::AlreadyRecording));
    }

    #[tokio::test]
    async fn stop_recording_when_idle_errors() {
        let clocks = Arc::new(SimulatedClocks::new(Utc::now()));
        let ring = Arc::new(std::sync::Mutex::new(RingBuffer::new(10)));
        let annotation = TriggerAnnotation::new();
        let recorder = Recorder::new(test_config(), clocks, annotation, ring);
        assert_eq!(recorder.stop_recording(), Err(RecorderError::NotRecording));
    }

    #[tokio::test]
    async fn agent_unavailable_blocks_start() {
        let clocks = Arc::new(SimulatedClocks::new(Utc::now()));
        let ring = Arc::new(std::sync::Mutex::new(RingBuffer::new(10)));
        let annotation = TriggerAnnotation::new();
        let recorder = Recorder::new(test_config(), clocks, annotation, ring);
        recorder.mark_agent_unavailable(137);
        let r = recorder.start_recording(None, TriggerState::Remote).await;
        assert_eq!(r, Err(RecorderError::AgentUnavailable));
    }

    #[tokio::test]
    async fn observe_frame_transitions_arming_to_recording() {
        let clocks = Arc::new(SimulatedClocks::new(Utc::now()));
        let ring = Arc::new(std::sync::Mutex::new(RingBuffer::new(10)));
        let annotation = TriggerAnnotation::new();
        let recorder = Recorder::new(test_config(), clocks, annotation, ring);
        recorder.start_recording(Some(5.0), TriggerState::Keyboard).await.unwrap();
        assert_eq!(recorder.state(), RecorderState::Arming);
        recorder.observe_frame(FrameEvent {
            frame_number: 1001,
            capture_time: 10.0,
            source: FrameSource::AgentStdout,
        });
        assert_eq!(recorder.state(), RecorderState::Recording);
    }

    /// §8 round-trip property: the sidecar's data-line count equals the
    /// Ring's `len()` at trigger time.
    #[tokio::test]
    async fn sidecar_line_count_matches_ring_len_at_trigger_time() {
        let wall0 = Utc::now();
        let clocks = Arc::new(SimulatedClocks::new(wall0));
        let ring = Arc::new(std::sync::Mutex::new(RingBuffer::new(10)));
        {
            let mut r = ring.lock().unwrap();
            for n in 1..=7u64 {
                r.push(FrameEvent {
                    frame_number: n,
                    capture_time: n as f64 * 0.01,
                    source: FrameSource::AgentStdout,
                });
            }
        }
        let annotation = TriggerAnnotation::new();
        let mut config = test_config();
        config.recordings_root =
            std::env::temp_dir().join(format!("imx296-test-sidecar-{}", std::process::id()));
        let recorder = Recorder::new(config.clone(), clocks, annotation, ring.clone());
        recorder
            .start_recording(Some(5.0), TriggerState::Keyboard)
            .await
            .unwrap();

        let day_dir = config
            .recordings_root
            .join(wall0.format("%Y_%m_%d").to_string())
            .join("video");
        let stamp = wall0.format("%Y_%m_%d_%H_%M_%S").to_string();
        let sidecar = day_dir.join(format!("{stamp}_buffer.txt"));
        let contents = std::fs::read_to_string(&sidecar).unwrap();
        let data_lines = contents.lines().filter(|l| !l.starts_with('#')).count();
        assert_eq!(data_lines, ring.lock().unwrap().len());
        assert_eq!(data_lines, 7);
    }
}
