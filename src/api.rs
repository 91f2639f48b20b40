//! The public API surface (§4.6): one `Core` value owning all lifecycle
//! state, handed to every worker as a capability rather than reached via
//! global mutable singletons (§9 "Global mutable singletons").

use std::sync::Arc;
use std::time::Duration;

use base::clock::Clocks;
use base::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Config;
use crate::frame::TriggerState;
use crate::ingest::{self, IngestExit};
use crate::recorder::{Recorder, RecorderError};
use crate::ring::RingBuffer;
use crate::status;
use crate::sync_publisher::{self, SyncPublisherHandle};
use crate::trigger;

/// Boots and owns every worker (§5): Frame Ingest, the Ring, the Sync
/// Publisher, the Recorder, the trigger sources, and the status writer.
/// `shutdown()` is a method on this value, not a module-scope flag.
pub struct Core<C: Clocks> {
    config: Config,
    clocks: Arc<C>,
    ring: Arc<std::sync::Mutex<RingBuffer>>,
    sync: SyncPublisherHandle,
    recorder: Arc<Recorder<C>>,
    ingest: Arc<ingest::IngestHandle>,
    shutdown_tx: std::sync::Mutex<Option<base::shutdown::Sender>>,
    started_at: f64,
    command_rx: tokio::sync::Mutex<Option<mpsc::Receiver<trigger::Attributed>>>,
}

impl<C: Clocks> Core<C> {
    /// Boots ingest + ring + publisher and every supporting worker
    /// (§4.6 `start`).
    pub async fn start(config: Config, clocks: Arc<C>) -> Result<Arc<Self>, Error> {
        let started_at = clocks.now();
        let ring = Arc::new(std::sync::Mutex::new(RingBuffer::new(config.ring_capacity)));
        let (shutdown_tx, shutdown_rx) = base::shutdown::channel();

        let sync = sync_publisher::spawn(&config, shutdown_rx.clone());
        let recorder = Recorder::new(
            config.clone(),
            clocks.clone(),
            sync.annotation().clone(),
            ring.clone(),
        );

        let ingest = ingest::spawn(&config, clocks.clone(), ring.clone(), sync.clone(), recorder.clone())?;

        let (command_tx, command_rx) = mpsc::channel(64);
        if config.keyboard_enabled {
            trigger::spawn_keyboard(command_tx.clone(), shutdown_rx.clone());
        }
        if let (Some(server), Some(topic)) = (config.remote_server.clone(), config.remote_topic.clone()) {
            trigger::spawn_remote(
                server,
                topic,
                Duration::from_secs_f64(config.remote_poll_interval_secs),
                command_tx,
                shutdown_rx.clone(),
            );
        }

        let core = Arc::new(Core {
            config: config.clone(),
            clocks: clocks.clone(),
            ring: ring.clone(),
            sync: sync.clone(),
            recorder: recorder.clone(),
            ingest,
            shutdown_tx: std::sync::Mutex::new(Some(shutdown_tx)),
            started_at,
            command_rx: tokio::sync::Mutex::new(Some(command_rx)),
        });

        status::spawn(
            config.status_path.clone(),
            Duration::from_secs_f64(config.status_period_secs),
            clocks,
            started_at,
            ring,
            sync.stats().clone(),
            recorder,
            {
                let sync = core.sync.clone();
                Arc::new(move || {
                    let (t, s) = sync.annotation_snapshot();
                    (s, t)
                })
            },
            shutdown_rx,
        );

        core.clone().spawn_command_loop();

        Ok(core)
    }

    /// Drains commands from every trigger source and applies them to the
    /// Recorder, serializing them through its own internal lock (§4.5.2).
    fn spawn_command_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut rx = self.command_rx.lock().await.take().expect("command loop runs once");
            while let Some(attributed) = rx.recv().await {
                self.apply(attributed).await;
            }
        });
    }

    async fn apply(&self, attributed: trigger::Attributed) {
        match attributed.command {
            trigger::Command::StartRecording { duration } => {
                match self.recorder.start_recording(duration, attributed.source).await {
                    Ok(id) => info!(session_id = id, "recording started"),
                    Err(e) => warn!(error = %e, "start_recording failed"),
                }
            }
            trigger::Command::StopRecording => {
                if let Err(e) = self.recorder.stop_recording() {
                    warn!(error = %e, "stop_recording failed");
                }
            }
            trigger::Command::Status => {
                info!(state = ?self.recorder.state(), "status requested");
            }
        }
    }

    pub async fn start_recording(
        &self,
        duration: Option<f64>,
        source: TriggerState,
    ) -> Result<u128, RecorderError> {
        self.recorder.start_recording(duration, source).await
    }

    pub fn stop_recording(&self) -> Result<(), RecorderError> {
        self.recorder.stop_recording()
    }

    /// Marks the next outbound sync samples with `source` for 1s, then
    /// reverts (§4.6 `trigger`).
    pub fn trigger(&self, source: TriggerState) {
        self.recorder.trigger(source);
    }

    pub fn status(&self) -> status::Snapshot {
        let (t, s) = self.sync.annotation_snapshot();
        status::build(
            self.clocks.as_ref(),
            self.started_at,
            &self.ring,
            self.sync.stats(),
            &self.recorder,
            (s, t),
        )
    }

    /// Orderly teardown; idempotent (§4.6 `shutdown`, §8 round-trip
    /// property).
    pub async fn shutdown(&self) {
        self.ingest.stop().await;
        // Dropping the sender is what actually signals every worker;
        // `take()` makes a second call a no-op (§8 idempotence property).
        let sender = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        drop(sender);
    }

    /// Reports why Frame Ingest stopped, marking the Recorder unavailable
    /// for new sessions on a nonzero agent exit (§4.2 failure model, S4).
    pub async fn watch_ingest(self: &Arc<Self>) {
        let exit = self.ingest.wait().await;
        match exit {
            IngestExit::AgentExited(code) => {
                self.recorder.mark_agent_unavailable(code);
                warn!(code, "camera agent exited");
            }
            IngestExit::SpawnFailed(e) => {
                self.recorder.mark_agent_unavailable(-1);
                warn!(error = %e, "camera agent failed to spawn");
            }
            IngestExit::Stopped => {}
        }
    }
}
