//! Shared test doubles for the integration suite.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use drivetrace::api::{CellularData, DeviceIdentity, GpsData};
use drivetrace::config::{AppConfig, CaptureConfig, ClusteringConfig, IngestConfig};
use drivetrace::device::DeviceLink;
use drivetrace::error::DeviceError;

/// Scripted device: walks north at a fixed step per GPS query, with
/// switchable reachability.
pub struct MockDeviceLink {
    pub device_id: String,
    pub reachable: AtomicBool,
    queries: AtomicU64,
}

impl MockDeviceLink {
    pub fn new(device_id: &str) -> Arc<Self> {
        Arc::new(Self {
            device_id: device_id.to_string(),
            reachable: AtomicBool::new(true),
            queries: AtomicU64::new(0),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DeviceError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DeviceError::Unreachable {
                device_id: self.device_id.clone(),
            })
        }
    }
}

impl DeviceLink for MockDeviceLink {
    fn list_devices(&self) -> BoxFuture<'_, Result<Vec<String>, DeviceError>> {
        async move {
            self.check()?;
            Ok(vec![self.device_id.clone()])
        }
        .boxed()
    }

    fn cellular_data<'a>(
        &'a self,
        _device_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<CellularData>, DeviceError>> {
        async move {
            self.check()?;
            Ok(Some(CellularData {
                rsrp: -88.0,
                rsrq: -10.0,
                sinr: 14.0,
                rat: "LTE".to_string(),
                cell_id: "27447297".to_string(),
                pci: 261,
            }))
        }
        .boxed()
    }

    fn gps_data<'a>(
        &'a self,
        _device_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<GpsData>, DeviceError>> {
        async move {
            self.check()?;
            let step = self.queries.fetch_add(1, Ordering::SeqCst);
            Ok(Some(GpsData {
                lat: 48.8500 + step as f64 * 1e-5,
                lon: 2.3500,
                accuracy: 3.0,
            }))
        }
        .boxed()
    }

    fn device_identity<'a>(
        &'a self,
        _device_id: &'a str,
    ) -> BoxFuture<'a, Result<DeviceIdentity, DeviceError>> {
        async move {
            self.check()?;
            Ok(DeviceIdentity {
                model: "Pixel 8".to_string(),
                firmware: "AP1A.240305".to_string(),
            })
        }
        .boxed()
    }
}

/// Engine config with a stub shell capture tool and fast test cadences.
pub fn test_config(base_dir: &std::path::Path, capture_script: &str) -> AppConfig {
    AppConfig {
        capture: CaptureConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), capture_script.to_string()],
            // The stub ignores the appended pcap path; "--" keeps sh from
            // parsing it as an option.
            pcap_flag: "--".to_string(),
            base_dir: base_dir.to_string_lossy().into_owned(),
            grace_period_ms: 2_000,
            ..CaptureConfig::default()
        },
        ingest: IngestConfig {
            interval_ms: 20,
            query_timeout_ms: 500,
        },
        clustering: ClusteringConfig {
            tick_interval_ms: 50,
            ..ClusteringConfig::default()
        },
        ..AppConfig::default()
    }
}
