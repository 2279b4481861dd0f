//! Configuration management for capture, ingestion, and clustering tuning
//!
//! This module provides runtime configuration loading from JSON files,
//! enabling parameter changes without recompilation. Capture tool invocation,
//! polling cadence, clustering parameters, and stream buffering can all be
//! adjusted via the config file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub capture: CaptureConfig,
    pub ingest: IngestConfig,
    pub clustering: ClusteringConfig,
    pub streaming: StreamingConfig,
    pub http: HttpConfig,
}

/// Capture subprocess configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Capture tool executable
    pub command: String,
    /// Base arguments passed before the per-session output flag
    pub args: Vec<String>,
    /// Flag used to point the tool at the session pcap file
    pub pcap_flag: String,
    /// Directory under which per-session directories are created
    pub base_dir: String,
    /// Stdout lines starting with this marker are routed to the packet stream
    pub packet_marker: String,
    /// Grace period between SIGTERM and SIGKILL in milliseconds
    pub grace_period_ms: u64,
    /// Number of trailing stderr lines retained for failure diagnostics
    pub stderr_tail_lines: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            command: "scat".to_string(),
            args: vec!["-t".to_string(), "qc".to_string(), "-u".to_string()],
            pcap_flag: "--pcap-file".to_string(),
            base_dir: "./captures".to_string(),
            packet_marker: "PKT|".to_string(),
            grace_period_ms: 5_000,
            stderr_tail_lines: 20,
        }
    }
}

/// Device polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Polling interval in milliseconds
    pub interval_ms: u64,
    /// Per-query timeout in milliseconds
    pub query_timeout_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            query_timeout_ms: 5_000,
        }
    }
}

/// Clustering engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    /// Default number of zones when a stream does not request one
    pub default_k: usize,
    /// Periodic clustering trigger interval in milliseconds
    pub tick_interval_ms: u64,
    /// Iteration cap for a single k-means run
    pub max_iterations: usize,
    /// Squared centroid displacement below which iteration stops
    pub epsilon: f64,
    /// Seed for deterministic k-means++ initialization
    pub seed: u64,
    /// Retention cap on the per-session point set
    pub max_points: usize,
    /// Restarts per k when sweeping the elbow curve
    pub elbow_restarts: u64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            default_k: 4,
            tick_interval_ms: 3_000,
            max_iterations: 100,
            epsilon: 1e-9,
            seed: 0x5eed_cafe,
            max_points: 10_000,
            elbow_restarts: 3,
        }
    }
}

/// Stream fan-out configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Per-subscriber buffer for log and packet line streams
    pub line_buffer: usize,
    /// Keep-alive heartbeat interval for idle SSE streams, in seconds
    pub heartbeat_secs: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            line_buffer: 1_024,
            heartbeat_secs: 30,
        }
    }
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file
    ///
    /// Missing file or invalid JSON falls back to defaults rather than
    /// failing startup; the reason is logged.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    log::info!("[Config] Loaded configuration from {:?}", path.as_ref());
                    config
                }
                Err(err) => {
                    log::warn!(
                        "[Config] Failed to parse JSON from {:?}: {}. Using defaults.",
                        path.as_ref(),
                        err
                    );
                    AppConfig::default()
                }
            },
            Err(err) => {
                log::info!(
                    "[Config] No config file at {:?} ({}). Using defaults.",
                    path.as_ref(),
                    err
                );
                AppConfig::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = AppConfig::default();
        assert_eq!(config.ingest.interval_ms, 1_000);
        assert_eq!(config.ingest.query_timeout_ms, 5_000);
        assert_eq!(config.clustering.default_k, 4);
        assert_eq!(config.clustering.tick_interval_ms, 3_000);
        assert_eq!(config.clustering.max_iterations, 100);
        assert_eq!(config.streaming.heartbeat_secs, 30);
        assert_eq!(config.capture.grace_period_ms, 5_000);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = AppConfig::load_from_file("/nonexistent/drivetrace.json");
        assert_eq!(config.clustering.default_k, 4);
    }

    #[test]
    fn test_partial_config_merges_with_defaults() {
        let json = r#"{ "clustering": { "default_k": 6 } }"#;
        let config: AppConfig = serde_json::from_str(json).expect("partial config");
        assert_eq!(config.clustering.default_k, 6);
        assert_eq!(config.clustering.max_iterations, 100);
        assert_eq!(config.ingest.interval_ms, 1_000);
    }
}
