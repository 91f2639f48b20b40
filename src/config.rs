//! Service configuration, loaded from a YAML file given on the command
//! line. Per spec §9 Open Questions, there is no built-in default
//! resolution or frame rate: `width`, `height`, and `fps` are mandatory and
//! loading fails closed (`ErrorKind::InvalidArgument`) if any is absent.

use std::path::{Path, PathBuf};

use base::{Error, ErrorKind};
use serde::Deserialize;

fn default_markers_path() -> PathBuf {
    PathBuf::from("./output/camera_markers.txt")
}

fn default_ring_capacity() -> usize {
    1500
}

fn default_stream_name() -> String {
    "IMX296Camera".to_string()
}

fn default_recordings_root() -> PathBuf {
    PathBuf::from("recordings")
}

fn default_status_path() -> PathBuf {
    PathBuf::from("/dev/shm/imx296_status.json")
}

fn default_status_period_secs() -> f64 {
    1.0
}

fn default_poll_interval_secs() -> f64 {
    1.0
}

fn default_agent_path() -> PathBuf {
    PathBuf::from("camera_agent")
}

/// Sensor and pipeline configuration, deserialized from the service's YAML
/// config file. Fields with no sensible universal default (`width`,
/// `height`, `fps`) are required.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Sensor crop width, in pixels. Required; no default (spec §9).
    pub width: u32,

    /// Sensor crop height, in pixels. Required; no default (spec §9).
    pub height: u32,

    /// Capture frame rate. Required; no default (spec §9).
    pub fps: u32,

    /// Exposure time in microseconds, passed through to the agent.
    pub exposure_us: Option<u32>,

    /// Path to the camera agent executable.
    #[serde(default = "default_agent_path")]
    pub agent_path: PathBuf,

    /// Extra environment variables to set on the agent process, beyond the
    /// fixed `STREAM_LSL=1` always set by Frame Ingest.
    #[serde(default)]
    pub agent_env: std::collections::BTreeMap<String, String>,

    /// Path to the markers file the agent appends frame records to.
    #[serde(default = "default_markers_path")]
    pub markers_path: PathBuf,

    /// Ring buffer capacity, in frames.
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,

    /// Sync bus stream name (§4.4).
    #[serde(default = "default_stream_name")]
    pub sync_stream_name: String,

    /// Sync bus source identifier; defaults to a process-derived value if
    /// absent, assigned at `start()` time rather than here.
    pub sync_source_id: Option<String>,

    /// Root directory under which `recordings/YYYY_MM_DD/video/...` is
    /// created.
    #[serde(default = "default_recordings_root")]
    pub recordings_root: PathBuf,

    /// Path the status snapshot is atomically rewritten to.
    #[serde(default = "default_status_path")]
    pub status_path: PathBuf,

    /// Minimum period, in seconds, between status snapshot writes.
    #[serde(default = "default_status_period_secs")]
    pub status_period_secs: f64,

    /// Push-notification long-poll server base URL. `None` disables the
    /// remote trigger source entirely.
    pub remote_server: Option<String>,

    /// Push-notification topic to subscribe to.
    #[serde(default)]
    pub remote_topic: Option<String>,

    /// Long-poll retry interval on network error (`2 x` this per spec
    /// §4.5.1) and reconnect pacing.
    #[serde(default = "default_poll_interval_secs")]
    pub remote_poll_interval_secs: f64,

    /// Whether the keyboard trigger source should run (disabled when not
    /// attached to an interactive terminal).
    #[serde(default)]
    pub keyboard_enabled: bool,
}

impl Config {
    /// Parses a `Config` from YAML text, failing closed (rather than
    /// substituting a default) if a mandatory field is missing.
    pub fn from_yaml(text: &str) -> Result<Config, Error> {
        serde_yaml::from_str(text)
            .map_err(|e| Error::new(ErrorKind::InvalidArgument, e))
            .and_then(|c: Config| c.validate())
    }

    pub fn load(path: &Path) -> Result<Config, Error> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    fn validate(self) -> Result<Config, Error> {
        if self.width == 0 || self.width % 2 != 0 {
            return Err(Error::msg(
                ErrorKind::InvalidArgument,
                format!("width must be a positive even number, got {}", self.width),
            ));
        }
        if self.height == 0 || self.height % 2 != 0 {
            return Err(Error::msg(
                ErrorKind::InvalidArgument,
                format!("height must be a positive even number, got {}", self.height),
            ));
        }
        if self.fps == 0 {
            return Err(Error::msg(ErrorKind::InvalidArgument, "fps must be nonzero"));
        }
        if self.ring_capacity == 0 {
            return Err(Error::msg(
                ErrorKind::InvalidArgument,
                "ring_capacity must be positive",
            ));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fps_fails_closed() {
        let yaml = "width: 400\nheight: 400\n";
        let err = Config::from_yaml(yaml).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn minimal_valid_config_loads() {
        let yaml = "width: 400\nheight: 400\nfps: 100\n";
        let c = Config::from_yaml(yaml).unwrap();
        assert_eq!(c.width, 400);
        assert_eq!(c.ring_capacity, 1500);
        assert_eq!(c.sync_stream_name, "IMX296Camera");
    }

    #[test]
    fn odd_width_rejected() {
        let yaml = "width: 401\nheight: 400\nfps: 100\n";
        let err = Config::from_yaml(yaml).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
