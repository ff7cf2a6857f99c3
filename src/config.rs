use serde::{Deserialize, Serialize};

use crate::stream::ReassemblyPolicy;

const DEFAULT_MAX_QUEUED_BYTES: usize = 1024 * 1024;
const DEFAULT_MAX_QUEUED_SEGMENTS: usize = 3072;

/// Per-flow stream settings, handed over by the configuration layer when a
/// flow is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Which stack's overlap behavior to reproduce.
    pub policy: ReassemblyPolicy,
    /// Out-of-order bytes retained per direction; 0 disables the limit.
    pub max_queued_bytes: usize,
    /// Out-of-order fragments retained per direction; 0 disables the limit.
    pub max_queued_segments: usize,
    /// Honor negotiated window scaling.
    pub window_scale: bool,
    /// Record negotiated MSS.
    pub mss: bool,
    /// Refuse to pick up flows whose handshake was not seen.
    pub require_3whs: bool,
    /// Mark evasion-class events as alerts.
    pub alert_on_evasion: bool,
    /// Inspection policy context this flow belongs to.
    pub policy_id: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            policy: ReassemblyPolicy::default(),
            max_queued_bytes: DEFAULT_MAX_QUEUED_BYTES,
            max_queued_segments: DEFAULT_MAX_QUEUED_SEGMENTS,
            window_scale: true,
            mss: true,
            require_3whs: false,
            alert_on_evasion: false,
            policy_id: 0,
        }
    }
}

impl StreamConfig {
    #[must_use]
    pub fn with_policy(policy: ReassemblyPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let config: StreamConfig =
            serde_json::from_str(r#"{"policy": "linux", "max_queued_segments": 4}"#).unwrap();

        assert_eq!(config.policy, ReassemblyPolicy::Linux);
        assert_eq!(config.max_queued_segments, 4);
        assert_eq!(config.max_queued_bytes, DEFAULT_MAX_QUEUED_BYTES);
        assert!(config.window_scale);
        assert!(!config.require_3whs);
    }

    #[test]
    fn test_unknown_policy_is_rejected() {
        assert!(serde_json::from_str::<StreamConfig>(r#"{"policy": "plan9"}"#).is_err());
    }
}
