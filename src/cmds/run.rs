//! Subcommand that boots the capture engine and runs it until a shutdown
//! signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use base::clock::RealClocks;
use base::Error;
use bpaf::Bpaf;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use imx296_capture::{Config, Core};

/// Runs the capture engine until SIGINT or SIGTERM.
#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    /// Path to the service's YAML configuration file.
    #[bpaf(long, argument("PATH"))]
    config: PathBuf,

    /// The number of worker threads used by the asynchronous runtime.
    /// Defaults to the number of cores on the system.
    #[bpaf(long, argument("WORKER_THREADS"))]
    worker_threads: Option<usize>,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config = Config::load(&args.config)?;

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(n) = args.worker_threads {
        builder.worker_threads(n);
    }
    let rt = builder.build().map_err(|e| {
        Error::new(base::ErrorKind::Internal, e)
    })?;

    rt.block_on(async move {
        let clocks = Arc::new(RealClocks {});
        let core = Core::start(config, clocks).await?;

        let mut sigint = signal(SignalKind::interrupt()).map_err(Error::from)?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(Error::from)?;

        let exit_code = tokio::select! {
            _ = sigint.recv() => {
                info!("received SIGINT; shutting down");
                130
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM; shutting down");
                0
            }
            () = core.watch_ingest() => {
                info!("camera agent is no longer producing frames; shutting down");
                1
            }
        };

        core.shutdown().await;
        Ok(exit_code)
    })
}
