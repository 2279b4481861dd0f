// Public value types shared across the engine and the presentation layer

mod types;

pub use types::{
    epoch_ms, Artifact, ArtifactKind, CellularData, ClusterUpdate, DeviceIdentity, DeviceSample,
    ElbowResult, GpsData, KpiSummary, Point, Session, SessionStatus, SignalQuality, Zone,
};
