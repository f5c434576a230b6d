//! State enumerations shared by events and the engine core
//!
//! The engine core owns the transition rules; these types only name the
//! states so that events can be serialized and consumed outside the runtime.

use serde::{Deserialize, Serialize};

/// Engine load state
///
/// `Idle → Preparing → Ready`, with any backend error moving to `Failed`.
/// `Failed` is terminal until the engine is configured again.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    /// No source prepared
    Idle,
    /// Waiting for the backend to signal readiness
    Preparing,
    /// Backend signalled readiness for the current request
    Ready,
    /// Backend reported an error
    Failed,
}

impl std::fmt::Display for LoadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadState::Idle => write!(f, "idle"),
            LoadState::Preparing => write!(f, "preparing"),
            LoadState::Ready => write!(f, "ready"),
            LoadState::Failed => write!(f, "failed"),
        }
    }
}

/// Engine playback state
///
/// `Stopped → Playing ⇄ Paused → Stopped`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackState::Stopped => write!(f, "stopped"),
            PlaybackState::Playing => write!(f, "playing"),
            PlaybackState::Paused => write!(f, "paused"),
        }
    }
}

/// Why the pool tore an engine down
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Least-recently-used idle entry replaced to make room
    LeastRecentlyUsed,
    /// Idle longer than the configured idle timeout
    IdleTimeout,
    /// Pool cleared by the host
    Cleared,
    /// Backend failed while being reset to idle
    ResetFailed,
    /// Oldest idle entry of a fingerprint already holding its maximum
    FingerprintLimit,
}

impl std::fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionReason::LeastRecentlyUsed => write!(f, "lru"),
            EvictionReason::IdleTimeout => write!(f, "idle-timeout"),
            EvictionReason::Cleared => write!(f, "cleared"),
            EvictionReason::ResetFailed => write!(f, "reset-failed"),
            EvictionReason::FingerprintLimit => write!(f, "fingerprint-limit"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_states_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&LoadState::Preparing).unwrap(), "\"preparing\"");
        assert_eq!(serde_json::to_string(&PlaybackState::Paused).unwrap(), "\"paused\"");
        assert_eq!(
            serde_json::to_string(&EvictionReason::IdleTimeout).unwrap(),
            "\"idle_timeout\""
        );
    }

    #[test]
    fn test_display_matches_serde_names() {
        assert_eq!(LoadState::Ready.to_string(), "ready");
        assert_eq!(PlaybackState::Stopped.to_string(), "stopped");
    }
}
