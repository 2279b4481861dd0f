// Offline extraction port
//
// Decoding a raw capture into structured points is an external concern; the
// engine consumes already-extracted traces through this port to seed a
// cluster session from a previously completed capture. The reference
// implementation reads the JSON-lines point dumps the extraction toolchain
// writes next to the capture.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::api::{KpiSummary, Point};

/// Port to the offline trace extraction toolchain
pub trait OfflineExtractor: Send + Sync {
    /// Georeferenced RF points extracted from a completed capture.
    fn extract_gps_points(&self, path: &Path) -> std::io::Result<Vec<Point>>;

    /// Aggregate RF metrics over the same trace.
    fn extract_kpi_summary(&self, path: &Path) -> std::io::Result<KpiSummary> {
        let points = self.extract_gps_points(path)?;
        Ok(summarize(&points))
    }
}

/// Reads one JSON point object per line, skipping unparsable lines.
pub struct JsonlExtractor;

impl OfflineExtractor for JsonlExtractor {
    fn extract_gps_points(&self, path: &Path) -> std::io::Result<Vec<Point>> {
        let reader = BufReader::new(File::open(path)?);
        let mut points = Vec::new();
        let mut skipped = 0usize;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Point>(&line) {
                Ok(point) => points.push(point),
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            log::warn!(
                "[Extract] Skipped {} unparsable lines in {:?}",
                skipped,
                path
            );
        }
        Ok(points)
    }
}

fn summarize(points: &[Point]) -> KpiSummary {
    if points.is_empty() {
        return KpiSummary {
            samples: 0,
            avg_rsrp: 0.0,
            avg_rsrq: 0.0,
            avg_sinr: 0.0,
        };
    }
    let n = points.len() as f64;
    KpiSummary {
        samples: points.len(),
        avg_rsrp: points.iter().map(|p| p.rsrp).sum::<f64>() / n,
        avg_rsrq: points.iter().map(|p| p.rsrq).sum::<f64>() / n,
        avg_sinr: points.iter().map(|p| p.sinr).sum::<f64>() / n,
    }
}
