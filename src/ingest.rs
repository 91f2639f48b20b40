//! Frame Ingest (C2): spawns and supervises the camera agent, parses its
//! two output channels into `FrameEvent`s, deduplicates, and fans each
//! accepted event out to the Ring, the Sync Publisher, and the Recorder's
//! frame counter (§4.2).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base::clock::Clocks;
use base::{Error, ErrorKind};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::frame::{FrameEvent, FrameSource};
use crate::recorder::RecorderHandle;
use crate::ring::RingBuffer;
use crate::sync_publisher::SyncPublisherHandle;

/// Why Frame Ingest stopped accepting frames.
#[derive(Debug)]
pub enum IngestExit {
    /// The agent exited on its own with the given code.
    AgentExited(i32),
    /// The agent could not be spawned at all.
    SpawnFailed(Error),
    /// Ingest was asked to stop (shutdown, or a new session starting).
    Stopped,
}

/// Handle to a running ingest session. Dropping it does not stop the
/// workers; call `stop()` or await `wait()` for that.
pub struct IngestHandle {
    shutdown: tokio::sync::Mutex<Option<base::shutdown::Sender>>,
    exit_rx: tokio::sync::Mutex<Option<tokio::sync::oneshot::Receiver<IngestExit>>>,
    last_emitted: Arc<AtomicU64>,
}

impl IngestHandle {
    /// Returns the highest `frame_number` accepted so far, or 0 if none.
    pub fn last_emitted_frame_number(&self) -> u64 {
        self.last_emitted.load(Ordering::Acquire)
    }

    /// Requests that ingest workers stop and waits (bounded by the caller)
    /// for the exit reason.
    pub async fn wait(&self) -> IngestExit {
        let rx = self.exit_rx.lock().await.take();
        match rx {
            Some(rx) => rx.await.unwrap_or(IngestExit::Stopped),
            None => IngestExit::Stopped,
        }
    }

    /// Requests that every ingest worker stop. Dropping the shutdown sender
    /// is what the reaper task (see `spawn`) watches to kill the continuous
    /// camera-agent subprocess, so the agent is never left orphaned on
    /// `Core::shutdown` (§5 orderly teardown).
    pub async fn stop(&self) {
        drop(self.shutdown.lock().await.take());
    }
}

/// One raw candidate observation, tagged with provenance, before
/// deduplication.
struct Candidate {
    frame_number: u64,
    capture_time: f64,
    source: FrameSource,
}

fn parse_frame_data_line(line: &str) -> Option<(u64, f64)> {
    let rest = line.strip_prefix("FRAME_DATA:")?;
    let mut parts = rest.splitn(2, ':');
    let n: u64 = parts.next()?.parse().ok()?;
    let t: f64 = parts.next()?.parse().ok()?;
    Some((n, t))
}

fn parse_marker_line(line: &str) -> Option<(u64, f64)> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    // Header lines are prefixed with non-digit text (e.g. "Starting",
    // "CONFIG", "ERROR"); data lines are "<uint> <float>".
    let mut parts = trimmed.split_whitespace();
    let n: u64 = parts.next()?.parse().ok()?;
    let t: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((n, t))
}

/// Spawns the camera agent and the two parsing workers, fanning accepted
/// frames out to `ring`, `sync`, and (when recording) `recorder`.
pub fn spawn<C: Clocks>(
    config: &Config,
    clocks: Arc<C>,
    ring: Arc<std::sync::Mutex<RingBuffer>>,
    sync: SyncPublisherHandle,
    recorder: RecorderHandle<C>,
) -> Result<Arc<IngestHandle>, Error> {
    // Frame Ingest's agent instance runs continuously from `start()` with no
    // output path: it exists only to emit frame metadata, so the Ring stays
    // populated before any recording is ever requested. The Recorder spawns
    // a second, recording-dedicated agent instance (see `recorder::spawn_encoder`).
    let mut cmd = Command::new(&config.agent_path);
    cmd.arg(config.width.to_string())
        .arg(config.height.to_string())
        .arg(config.fps.to_string());
    cmd.env("STREAM_LSL", "1");
    for (k, v) in &config.agent_env {
        cmd.env(k, v);
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| {
        Error::new(ErrorKind::Unavailable, e)
    })?;

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let (cand_tx, cand_rx) = mpsc::channel::<Candidate>(1024);
    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();

    let t_stall = Duration::from_secs_f64((1.0f64).max(10.0 / config.fps as f64));

    // Ingest-stdout worker: blocks on child stdout lines.
    {
        let cand_tx = cand_tx.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut shutdown = shutdown_rx.as_future();
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => break,
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(l)) => {
                                if let Some((n, t)) = parse_frame_data_line(&l) {
                                    let _ = cand_tx.send(Candidate {
                                        frame_number: n,
                                        capture_time: t,
                                        source: FrameSource::AgentStdout,
                                    }).await;
                                }
                                // Non-FRAME_DATA lines are agent logs; ignored.
                            }
                            Ok(None) => break,
                            Err(e) => {
                                debug!(error = %e, "agent stdout read error");
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    // Stderr is log-only; drain it so the child never blocks on a full pipe.
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(l)) = lines.next_line().await {
            debug!(agent_stderr = %l, "camera agent");
        }
    });

    // Ingest-markers worker: polls the markers file for appended lines.
    {
        let cand_tx = cand_tx.clone();
        let shutdown_rx = shutdown_rx.clone();
        let markers_path = config.markers_path.clone();
        tokio::spawn(markers_worker(markers_path, cand_tx, shutdown_rx));
    }

    // Fan-out worker: dedups against last_emitted_frame_number, then pushes
    // into the ring, publishes to the sync bus, and updates the recorder.
    let last_emitted = Arc::new(AtomicU64::new(0));
    {
        let last_emitted = last_emitted.clone();
        let clocks = clocks.clone();
        tokio::spawn(fan_out_worker(
            cand_rx, ring, sync, recorder, last_emitted, t_stall, clocks,
        ));
    }

    // Reaper: waits on the child, but kills it first if shutdown is
    // requested before the agent exits on its own, so `stop()`/`shutdown()`
    // actually terminates the continuous camera-agent subprocess (§5).
    {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut shutdown = shutdown_rx.as_future();
            let reason = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    IngestExit::Stopped
                }
                status = child.wait() => match status {
                    Ok(s) => IngestExit::AgentExited(s.code().unwrap_or(-1)),
                    Err(e) => IngestExit::SpawnFailed(Error::new(ErrorKind::Internal, e)),
                },
            };
            let _ = exit_tx.send(reason);
        });
    }

    Ok(Arc::new(IngestHandle {
        shutdown: tokio::sync::Mutex::new(Some(shutdown_tx)),
        exit_rx: tokio::sync::Mutex::new(Some(exit_rx)),
        last_emitted,
    }))
}

async fn markers_worker(
    path: PathBuf,
    tx: mpsc::Sender<Candidate>,
    shutdown_rx: base::shutdown::Receiver,
) {
    // Markers-file open timeout at startup: 5s; if it never appears, create
    // an empty one and continue (the agent may simply be slow to start).
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !path.exists() {
        if tokio::time::Instant::now() >= deadline {
            if let Some(parent) = path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            let _ = tokio::fs::File::create(&path).await;
            break;
        }
        if shutdown_rx.check().is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let mut offset: u64 = 0;
    let mut shutdown = shutdown_rx.as_future();
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => return,
            _ = tokio::time::sleep(Duration::from_millis(5)) => {}
        }
        let Ok(meta) = tokio::fs::metadata(&path).await else {
            continue;
        };
        if meta.len() <= offset {
            continue;
        }
        use tokio::io::{AsyncReadExt, AsyncSeekExt};
        let Ok(mut f) = tokio::fs::File::open(&path).await else {
            continue;
        };
        if f.seek(std::io::SeekFrom::Start(offset)).await.is_err() {
            continue;
        }
        let mut buf = Vec::new();
        if f.read_to_end(&mut buf).await.is_err() {
            continue;
        }
        offset += buf.len() as u64;
        let text = String::from_utf8_lossy(&buf);
        for line in text.lines() {
            if let Some((n, t)) = parse_marker_line(line) {
                let _ = tx
                    .send(Candidate {
                        frame_number: n,
                        capture_time: t,
                        source: FrameSource::MarkersFile,
                    })
                    .await;
            }
        }
    }
}

async fn fan_out_worker<C: Clocks>(
    mut cand_rx: mpsc::Receiver<Candidate>,
    ring: Arc<std::sync::Mutex<RingBuffer>>,
    sync: SyncPublisherHandle,
    recorder: RecorderHandle<C>,
    last_emitted: Arc<AtomicU64>,
    t_stall: Duration,
    clocks: Arc<C>,
) {
    loop {
        let candidate = match tokio::time::timeout(t_stall, cand_rx.recv()).await {
            Ok(Some(c)) => c,
            Ok(None) => break,
            Err(_elapsed) => {
                warn!("no new frame for {:?}; agent may have stalled", t_stall);
                continue;
            }
        };

        // Dedup: emit iff strictly greater than the last accepted number.
        let prev = last_emitted.load(Ordering::Acquire);
        if candidate.frame_number <= prev {
            continue;
        }
        // A single fan-out worker is the only writer; `last_emitted` is an
        // atomic only so `IngestHandle::last_emitted_frame_number` can read
        // it from other tasks without a lock.
        last_emitted.store(candidate.frame_number, Ordering::Release);

        let event = FrameEvent {
            frame_number: candidate.frame_number,
            capture_time: candidate.capture_time,
            source: candidate.source,
        };

        ring.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(event);
        sync.publish(event);
        recorder.observe_frame(event);
        let _ = &clocks; // reserved for future stall-duration tuning
    }
}

/// Extracts `<stem>.mkv` or `<stem>.mp4`, whichever exists, given the
/// extensionless path the Recorder passed the encoder (spec §9).
pub fn probe_output_file(stem: &Path) -> Option<PathBuf> {
    for ext in ["mkv", "mp4"] {
        let candidate = stem.with_extension(ext);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_frame_data_line() {
        assert_eq!(
            parse_frame_data_line("FRAME_DATA:42:0.420"),
            Some((42, 0.420))
        );
        assert_eq!(parse_frame_data_line("some log line"), None);
    }

    #[test]
    fn parses_marker_line() {
        assert_eq!(parse_marker_line("42 0.420"), Some((42, 0.420)));
        assert_eq!(parse_marker_line("Starting camera"), None);
        assert_eq!(parse_marker_line("CONFIG width=400"), None);
        assert_eq!(parse_marker_line(""), None);
    }

    #[test]
    fn probe_output_file_prefers_mkv() {
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("session");
        std::fs::write(stem.with_extension("mkv"), b"x").unwrap();
        std::fs::write(stem.with_extension("mp4"), b"x").unwrap();
        assert_eq!(probe_output_file(&stem), Some(stem.with_extension("mkv")));
    }

    #[test]
    fn probe_output_file_falls_back_to_mp4() {
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("session");
        std::fs::write(stem.with_extension("mp4"), b"x").unwrap();
        assert_eq!(probe_output_file(&stem), Some(stem.with_extension("mp4")));
    }

    #[test]
    fn probe_output_file_none_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("session");
        assert_eq!(probe_output_file(&stem), None);
    }

    /// S2: the same `frame_number` arriving on both channels within
    /// milliseconds of each other yields exactly one accepted `FrameEvent`.
    #[tokio::test]
    async fn dedup_keeps_first_observed_and_drops_duplicate() {
        let config = Config::from_yaml("width: 400\nheight: 400\nfps: 100\n").unwrap();
        let clocks = Arc::new(base::clock::SimulatedClocks::new(chrono::Utc::now()));
        let ring = Arc::new(std::sync::Mutex::new(RingBuffer::new(10)));
        let (_shutdown_tx, shutdown_rx) = base::shutdown::channel();
        let sync = crate::sync_publisher::spawn(&config, shutdown_rx);
        let recorder = crate::recorder::Recorder::new(
            config,
            clocks.clone(),
            sync.annotation().clone(),
            ring.clone(),
        );

        let (cand_tx, cand_rx) = mpsc::channel::<Candidate>(8);
        let last_emitted = Arc::new(AtomicU64::new(0));
        let worker = tokio::spawn(fan_out_worker(
            cand_rx,
            ring.clone(),
            sync,
            recorder,
            last_emitted.clone(),
            Duration::from_millis(50),
            clocks,
        ));

        cand_tx
            .send(Candidate { frame_number: 42, capture_time: 0.420, source: FrameSource::AgentStdout })
            .await
            .unwrap();
        cand_tx
            .send(Candidate { frame_number: 42, capture_time: 0.420, source: FrameSource::MarkersFile })
            .await
            .unwrap();
        drop(cand_tx);
        worker.await.unwrap();

        assert_eq!(ring.lock().unwrap().len(), 1);
        assert_eq!(last_emitted.load(Ordering::Acquire), 42);
    }

    /// Out-of-order (`<=` the last accepted number) candidates are dropped,
    /// never just the exact duplicate (§4.2 "Out-of-order arrivals").
    #[tokio::test]
    async fn stale_frame_number_is_dropped_not_just_exact_duplicate() {
        let config = Config::from_yaml("width: 400\nheight: 400\nfps: 100\n").unwrap();
        let clocks = Arc::new(base::clock::SimulatedClocks::new(chrono::Utc::now()));
        let ring = Arc::new(std::sync::Mutex::new(RingBuffer::new(10)));
        let (_shutdown_tx, shutdown_rx) = base::shutdown::channel();
        let sync = crate::sync_publisher::spawn(&config, shutdown_rx);
        let recorder = crate::recorder::Recorder::new(
            config,
            clocks.clone(),
            sync.annotation().clone(),
            ring.clone(),
        );

        let (cand_tx, cand_rx) = mpsc::channel::<Candidate>(8);
        let last_emitted = Arc::new(AtomicU64::new(0));
        let worker = tokio::spawn(fan_out_worker(
            cand_rx,
            ring.clone(),
            sync,
            recorder,
            last_emitted.clone(),
            Duration::from_millis(50),
            clocks,
        ));

        cand_tx
            .send(Candidate { frame_number: 10, capture_time: 0.10, source: FrameSource::AgentStdout })
            .await
            .unwrap();
        cand_tx
            .send(Candidate { frame_number: 9, capture_time: 0.09, source: FrameSource::MarkersFile })
            .await
            .unwrap();
        drop(cand_tx);
        worker.await.unwrap();

        let snap = ring.lock().unwrap().snapshot();
        assert_eq!(snap.iter().map(|e| e.frame_number).collect::<Vec<_>>(), vec![10]);
    }
}
