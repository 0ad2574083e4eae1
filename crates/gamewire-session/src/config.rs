use std::path::Path;
use std::time::Duration;

use gamewire_frame::{FrameConfig, DEFAULT_MAX_FRAME, MIN_FRAME_LEN};
use gamewire_loop::{LoopOptions, WaitStrategy, DEFAULT_BATCH_SIZE, DEFAULT_RING_SIZE};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Session runtime configuration.
///
/// Deserializes from camelCase JSON; every field is optional and falls back
/// to its default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Close a session after this long without inbound traffic.
    pub session_timeout_ms: u64,
    /// Initiators ping after this long without outbound traffic.
    pub heartbeat_interval_ms: u64,
    /// Drop links that have not finished the handshake within this window.
    pub handshake_timeout_ms: u64,
    /// Default deadline for asynchronous calls.
    pub rpc_callback_timeout_ms: u64,
    /// Deadline for synchronous calls.
    pub sync_rpc_timeout_ms: u64,
    /// Task ring capacity per event loop. Must be a power of two.
    pub ring_buffer_size: usize,
    /// Tasks processed between housekeeping passes.
    pub task_batch_size: usize,
    pub wait_strategy: WaitStrategy,
    /// Number of event loops sessions are spread over.
    pub loop_threads: usize,
    pub max_frame_size: usize,
    /// Stamp and track sequence/ack so a session can resume on a new link.
    pub ordered_delivery: bool,
    /// Sent-but-unacknowledged messages kept for retransmission.
    pub max_unacked_messages: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: 30_000,
            heartbeat_interval_ms: 10_000,
            handshake_timeout_ms: 5_000,
            rpc_callback_timeout_ms: 15_000,
            sync_rpc_timeout_ms: 5_000,
            ring_buffer_size: DEFAULT_RING_SIZE,
            task_batch_size: DEFAULT_BATCH_SIZE,
            wait_strategy: WaitStrategy::TimeoutBlock,
            loop_threads: 1,
            max_frame_size: DEFAULT_MAX_FRAME,
            ordered_delivery: true,
            max_unacked_messages: 4096,
        }
    }
}

impl SessionConfig {
    /// Load and validate a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            SessionError::InvalidConfig(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_json_str(&raw)
    }

    /// Parse and validate a JSON config document.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("sessionTimeoutMs", self.session_timeout_ms),
            ("heartbeatIntervalMs", self.heartbeat_interval_ms),
            ("handshakeTimeoutMs", self.handshake_timeout_ms),
            ("rpcCallbackTimeoutMs", self.rpc_callback_timeout_ms),
            ("syncRpcTimeoutMs", self.sync_rpc_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(SessionError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if !self.ring_buffer_size.is_power_of_two() {
            return Err(SessionError::InvalidConfig(format!(
                "ringBufferSize must be a power of two, got {}",
                self.ring_buffer_size
            )));
        }
        if self.task_batch_size == 0 {
            return Err(SessionError::InvalidConfig(
                "taskBatchSize must be greater than zero".to_string(),
            ));
        }
        if self.loop_threads == 0 {
            return Err(SessionError::InvalidConfig(
                "loopThreads must be at least 1".to_string(),
            ));
        }
        if self.max_frame_size <= MIN_FRAME_LEN || self.max_frame_size > u32::MAX as usize {
            return Err(SessionError::InvalidConfig(format!(
                "maxFrameSize out of range: {}",
                self.max_frame_size
            )));
        }
        if self.max_unacked_messages == 0 {
            return Err(SessionError::InvalidConfig(
                "maxUnackedMessages must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn rpc_callback_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_callback_timeout_ms)
    }

    pub fn sync_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_rpc_timeout_ms)
    }

    /// Event loop options derived from this config.
    pub fn loop_options(&self) -> LoopOptions {
        LoopOptions {
            ring_size: self.ring_buffer_size,
            batch_size: self.task_batch_size,
            wait_strategy: self.wait_strategy,
            ..LoopOptions::default()
        }
    }

    /// Frame codec settings for session links.
    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_frame_size: self.max_frame_size,
            ..FrameConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SessionConfig::default();
        config.validate().expect("defaults should validate");
        assert_eq!(config.session_timeout(), Duration::from_secs(30));
        assert_eq!(config.loop_options().ring_size, 8192);
    }

    #[test]
    fn parses_camel_case_with_defaults() {
        let config = SessionConfig::from_json_str(
            r#"{"sessionTimeoutMs": 1000, "waitStrategy": "spin-sleep", "ringBufferSize": 1024}"#,
        )
        .expect("config should parse");
        assert_eq!(config.session_timeout_ms, 1000);
        assert_eq!(config.wait_strategy, WaitStrategy::SpinSleep);
        assert_eq!(config.ring_buffer_size, 1024);
        assert_eq!(config.sync_rpc_timeout_ms, 5000);
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = SessionConfig::from_json_str(r#"{"sessionTimeout": 5}"#).unwrap_err();
        assert!(matches!(err, SessionError::Json(_)));
    }

    #[test]
    fn rejects_bad_values() {
        let bad = [
            r#"{"ringBufferSize": 1000}"#,
            r#"{"taskBatchSize": 0}"#,
            r#"{"rpcCallbackTimeoutMs": 0}"#,
            r#"{"loopThreads": 0}"#,
            r#"{"maxFrameSize": 4}"#,
        ];
        for raw in bad {
            let err = SessionConfig::from_json_str(raw).unwrap_err();
            assert!(
                matches!(err, SessionError::InvalidConfig(_)),
                "{raw} should be rejected, got {err:?}"
            );
        }
    }

    #[test]
    fn loads_from_file() {
        let path = std::env::temp_dir().join(format!(
            "gamewire-config-{}-{}.json",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::write(&path, r#"{"loopThreads": 2, "orderedDelivery": false}"#)
            .expect("config file should be writable");
        let config = SessionConfig::from_json_file(&path).expect("config file should load");
        assert_eq!(config.loop_threads, 2);
        assert!(!config.ordered_delivery);
        let _ = std::fs::remove_file(&path);
    }
}
