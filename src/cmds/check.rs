//! Subcommand to validate a configuration file without starting any
//! workers.

use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;

use imx296_capture::config::Config;

/// Validates a configuration file and exits.
#[derive(Bpaf, Debug)]
#[bpaf(command("check"))]
pub struct Args {
    /// Path to the service's YAML configuration file.
    #[bpaf(long, argument("PATH"))]
    config: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    match Config::load(&args.config) {
        Ok(config) => {
            println!(
                "{}: ok ({}x{} @ {} fps)",
                args.config.display(),
                config.width,
                config.height,
                config.fps
            );
            Ok(0)
        }
        Err(e) => {
            eprintln!("{}: {}", args.config.display(), e.chain());
            Ok(1)
        }
    }
}
