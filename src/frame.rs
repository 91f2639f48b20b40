//! The data model shared by every worker: frame events, trigger attribution,
//! and the handful of small value types that flow across channel
//! boundaries.

use std::fmt;

/// Provenance of a `FrameEvent`, used only to deduplicate when both the
/// agent's stdout and its markers file are active for the same frame.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FrameSource {
    AgentStdout,
    MarkersFile,
}

/// One `(frame_number, capture_time)` observation from the camera agent.
///
/// `frame_number` is monotonically increasing from 1 within a single agent
/// session; `capture_time` is Clock seconds and never decreases between
/// distinct frames of that session (§3 I1, I2).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FrameEvent {
    pub frame_number: u64,
    pub capture_time: f64,
    pub source: FrameSource,
}

/// Attribution carried on every outbound sync sample, identifying which
/// trigger source (if any) most recently fired.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum TriggerState {
    #[default]
    None,
    Keyboard,
    Remote,
}

impl TriggerState {
    /// The wire encoding used on the sync bus's third channel (§4.4).
    pub fn channel_value(self) -> f64 {
        match self {
            TriggerState::None => 0.0,
            TriggerState::Keyboard => 1.0,
            TriggerState::Remote => 2.0,
        }
    }
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TriggerState::None => "none",
            TriggerState::Keyboard => "keyboard",
            TriggerState::Remote => "remote",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_channel_values() {
        assert_eq!(TriggerState::None.channel_value(), 0.0);
        assert_eq!(TriggerState::Keyboard.channel_value(), 1.0);
        assert_eq!(TriggerState::Remote.channel_value(), 2.0);
    }
}
