use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, the timestamp base for every DTO.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Lifecycle state of a capture session
///
/// Transitions: Created -> Capturing -> Stopping -> {Completed, Failed}.
/// Completed and Failed are terminal and immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Created,
    Capturing,
    Stopping,
    Completed,
    Failed,
}

impl SessionStatus {
    /// Terminal states admit no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

/// A capture session bound to one physical device
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Session {
    pub id: u64,
    pub device_id: String,
    pub device_model: String,
    pub firmware: String,
    pub status: SessionStatus,
    /// Epoch milliseconds at session creation
    pub start_time: u64,
    /// Epoch milliseconds at the terminal transition
    pub end_time: Option<u64>,
    pub session_dir: String,
    pub artifacts: Vec<Artifact>,
    /// Diagnostic detail for Failed sessions (exit code, stderr tail)
    pub failure: Option<String>,
}

/// Cellular reading extracted from the device radio stack
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CellularData {
    /// Reference signal received power in dBm
    pub rsrp: f64,
    /// Reference signal received quality in dB
    pub rsrq: f64,
    /// Signal-to-interference-plus-noise ratio in dB
    pub sinr: f64,
    /// Radio access technology (e.g. "LTE", "NR")
    pub rat: String,
    pub cell_id: String,
    pub pci: u32,
}

/// GPS fix from the device location service
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GpsData {
    pub lat: f64,
    pub lon: f64,
    /// Horizontal accuracy in meters
    pub accuracy: f64,
}

/// One merged polling result from the device
///
/// Either half may be absent when the device was transiently unreadable;
/// a sample is never dropped solely because one half is missing.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DeviceSample {
    pub timestamp: u64,
    pub cellular: Option<CellularData>,
    pub gps: Option<GpsData>,
}

/// Model and firmware identity of an attached device
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DeviceIdentity {
    pub model: String,
    pub firmware: String,
}

/// Clustering input: a georeferenced RF measurement
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Point {
    pub timestamp: u64,
    pub lat: f64,
    pub lon: f64,
    pub rsrp: f64,
    pub rsrq: f64,
    pub sinr: f64,
}

impl Point {
    /// Derive a point from a sample; requires both halves present.
    pub fn from_sample(sample: &DeviceSample) -> Option<Self> {
        let cellular = sample.cellular.as_ref()?;
        let gps = sample.gps.as_ref()?;
        Some(Point {
            timestamp: sample.timestamp,
            lat: gps.lat,
            lon: gps.lon,
            rsrp: cellular.rsrp,
            rsrq: cellular.rsrq,
            sinr: cellular.sinr,
        })
    }
}

/// Network quality band classified from average RSRP
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl SignalQuality {
    /// Classify average RSRP into a quality band.
    ///
    /// Boundaries are inclusive on the higher band: -80 dBm is Excellent,
    /// -95 is Good, -110 is Fair, anything weaker is Poor.
    pub fn from_rsrp(rsrp: f64) -> Self {
        if rsrp >= -80.0 {
            SignalQuality::Excellent
        } else if rsrp >= -95.0 {
            SignalQuality::Good
        } else if rsrp >= -110.0 {
            SignalQuality::Fair
        } else {
            SignalQuality::Poor
        }
    }
}

/// One clustered quality zone
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Zone {
    pub cluster_id: usize,
    pub centroid_lat: f64,
    pub centroid_lon: f64,
    pub point_count: usize,
    pub quality: SignalQuality,
    pub avg_rsrp: f64,
    pub avg_rsrq: f64,
    pub avg_sinr: f64,
}

/// One clustering result published to subscribers
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ClusterUpdate {
    /// Strictly increasing within a session; consumers may use it to
    /// detect and discard stale or duplicate frames.
    pub update_id: u64,
    pub timestamp: u64,
    pub zones: Vec<Zone>,
    pub total_points: usize,
}

/// Kind of raw capture artifact written to the session directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactKind {
    Pcap,
    DiagLog,
}

/// A finalized capture artifact, read-only once recorded
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Artifact {
    pub id: u64,
    pub session_id: u64,
    pub kind: ArtifactKind,
    pub path: String,
    pub size_bytes: u64,
}

/// Elbow-method diagnostics over the session point set
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ElbowResult {
    /// Total within-cluster inertia for k = 1..=max_k, non-increasing
    pub inertia: Vec<f64>,
    /// Chosen k at the point of maximum curvature
    pub optimal_k: usize,
}

/// Aggregate RF metrics extracted from an offline capture
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct KpiSummary {
    pub samples: usize,
    pub avg_rsrp: f64,
    pub avg_rsrq: f64,
    pub avg_sinr: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_boundaries_inclusive_on_higher_band() {
        assert_eq!(SignalQuality::from_rsrp(-80.0), SignalQuality::Excellent);
        assert_eq!(SignalQuality::from_rsrp(-81.0), SignalQuality::Good);
        assert_eq!(SignalQuality::from_rsrp(-95.0), SignalQuality::Good);
        assert_eq!(SignalQuality::from_rsrp(-96.0), SignalQuality::Fair);
        assert_eq!(SignalQuality::from_rsrp(-110.0), SignalQuality::Fair);
        assert_eq!(SignalQuality::from_rsrp(-111.0), SignalQuality::Poor);
    }

    #[test]
    fn test_point_requires_both_halves() {
        let cellular = CellularData {
            rsrp: -90.0,
            rsrq: -11.0,
            sinr: 12.0,
            rat: "LTE".to_string(),
            cell_id: "123456".to_string(),
            pci: 42,
        };
        let gps = GpsData {
            lat: 48.85,
            lon: 2.35,
            accuracy: 4.0,
        };

        let full = DeviceSample {
            timestamp: 1,
            cellular: Some(cellular.clone()),
            gps: Some(gps.clone()),
        };
        let point = Point::from_sample(&full).expect("both halves present");
        assert_eq!(point.lat, 48.85);
        assert_eq!(point.rsrp, -90.0);

        let no_gps = DeviceSample {
            timestamp: 2,
            cellular: Some(cellular),
            gps: None,
        };
        assert!(Point::from_sample(&no_gps).is_none());

        let no_cell = DeviceSample {
            timestamp: 3,
            cellular: None,
            gps: Some(gps),
        };
        assert!(Point::from_sample(&no_cell).is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SessionStatus::Created.is_terminal());
        assert!(!SessionStatus::Capturing.is_terminal());
        assert!(!SessionStatus::Stopping.is_terminal());
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
    }
}
