// DeviceLink: port to the device under test
//
// The engine only ever talks to a device through this trait; the production
// implementation shells out to adb and scrapes the radio registry and
// location service dumps. Absent readings are `Ok(None)` — a device that is
// attached but has no LTE registration or GPS fix is not an error.

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::process::Command;

use crate::api::{CellularData, DeviceIdentity, GpsData};
use crate::error::DeviceError;

/// Query interface to a connected test device
pub trait DeviceLink: Send + Sync {
    /// Serial numbers of attached devices
    fn list_devices(&self) -> BoxFuture<'_, Result<Vec<String>, DeviceError>>;

    /// Current cellular reading, or None when the radio is unreadable
    fn cellular_data<'a>(
        &'a self,
        device_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<CellularData>, DeviceError>>;

    /// Current GPS fix, or None without one
    fn gps_data<'a>(
        &'a self,
        device_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<GpsData>, DeviceError>>;

    /// Model and firmware identity
    fn device_identity<'a>(
        &'a self,
        device_id: &'a str,
    ) -> BoxFuture<'a, Result<DeviceIdentity, DeviceError>>;
}

/// adb-backed DeviceLink
///
/// Cellular data comes from `dumpsys telephony.registry`, GPS from
/// `dumpsys location`, identity from `getprop`.
pub struct AdbDeviceLink {
    adb_path: String,
}

impl AdbDeviceLink {
    pub fn new(adb_path: impl Into<String>) -> Self {
        Self {
            adb_path: adb_path.into(),
        }
    }

    async fn run_adb(&self, args: &[&str]) -> Result<String, DeviceError> {
        let output = Command::new(&self.adb_path)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| DeviceError::CommandFailed {
                detail: format!("{} {}: {}", self.adb_path, args.join(" "), err),
            })?;

        if !output.status.success() {
            return Err(DeviceError::CommandFailed {
                detail: format!(
                    "{} {} exited with {:?}",
                    self.adb_path,
                    args.join(" "),
                    output.status.code()
                ),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn getprop(&self, device_id: &str, prop: &str) -> Option<String> {
        self.run_adb(&["-s", device_id, "shell", "getprop", prop])
            .await
            .ok()
            .map(|out| out.trim().to_string())
            .filter(|out| !out.is_empty())
    }
}

impl DeviceLink for AdbDeviceLink {
    fn list_devices(&self) -> BoxFuture<'_, Result<Vec<String>, DeviceError>> {
        async move {
            let output = self.run_adb(&["devices"]).await?;
            let devices = output
                .lines()
                .filter(|line| line.ends_with("\tdevice"))
                .filter_map(|line| line.split('\t').next())
                .map(|serial| serial.to_string())
                .collect();
            Ok(devices)
        }
        .boxed()
    }

    fn cellular_data<'a>(
        &'a self,
        device_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<CellularData>, DeviceError>> {
        async move {
            let output = self
                .run_adb(&["-s", device_id, "shell", "dumpsys", "telephony.registry"])
                .await?;
            Ok(parse_cellular(&output))
        }
        .boxed()
    }

    fn gps_data<'a>(
        &'a self,
        device_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<GpsData>, DeviceError>> {
        async move {
            let output = self
                .run_adb(&["-s", device_id, "shell", "dumpsys", "location"])
                .await?;
            Ok(parse_gps(&output))
        }
        .boxed()
    }

    fn device_identity<'a>(
        &'a self,
        device_id: &'a str,
    ) -> BoxFuture<'a, Result<DeviceIdentity, DeviceError>> {
        async move {
            let model = self
                .getprop(device_id, "ro.product.model")
                .await
                .unwrap_or_else(|| "Unknown".to_string());
            let firmware = self
                .getprop(device_id, "ro.build.display.id")
                .await
                .unwrap_or_else(|| "Unknown".to_string());
            Ok(DeviceIdentity { model, firmware })
        }
        .boxed()
    }
}

/// Extract the first `key<number>` occurrence as f64.
fn extract_number(output: &str, key: &str) -> Option<f64> {
    let start = output.find(key)? + key.len();
    let rest = &output[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit() && c != '-' && c != '.')
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

fn extract_string(output: &str, key: &str) -> Option<String> {
    let start = output.find(key)? + key.len();
    let rest = &output[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    Some(rest[..end].to_string())
}

/// Parse a `dumpsys telephony.registry` dump.
///
/// A reading without an RSRP field means the radio is not registered and
/// yields None. Secondary fields fall back to the conventional floor values
/// when absent.
pub(crate) fn parse_cellular(output: &str) -> Option<CellularData> {
    let rsrp = extract_number(output, "rsrp=")?;
    let rsrq = extract_number(output, "rsrq=").unwrap_or(-20.0);
    let sinr = extract_number(output, "rssnr=").unwrap_or(-10.0);
    let cell_id = extract_string(output, "mCi=").unwrap_or_else(|| "Unknown".to_string());
    let pci = extract_number(output, "mPci=").map(|v| v as u32).unwrap_or(0);

    // Bare "NR" substrings appear in plain LTE dumps (mNrState=NONE, ENDC),
    // so only a registered NR signal or identity block counts.
    let rat = if output.contains("CellSignalStrengthNr") || output.contains("CellIdentityNr") {
        "NR"
    } else {
        "LTE"
    };

    Some(CellularData {
        rsrp,
        rsrq,
        sinr,
        rat: rat.to_string(),
        cell_id,
        pci,
    })
}

/// Parse a `dumpsys location` dump.
///
/// Prefers the gps provider, falls back to fused with an estimated
/// accuracy. No provider line means no fix. Accuracy keys on the `hAcc=`
/// field of modern dumps, with the legacy `acc=` as a fallback.
pub(crate) fn parse_gps(output: &str) -> Option<GpsData> {
    for (provider, default_accuracy) in [("Location[gps ", None), ("Location[fused ", Some(10.0))] {
        let Some(start) = output.find(provider) else {
            continue;
        };
        let rest = &output[start + provider.len()..];
        let entry = rest.split(']').next().unwrap_or(rest);

        let mut coords = entry.split(|c: char| c == ',' || c.is_whitespace());
        let lat: f64 = match coords.next().and_then(|v| v.parse().ok()) {
            Some(v) => v,
            None => continue,
        };
        let lon: f64 = match coords.next().and_then(|v| v.parse().ok()) {
            Some(v) => v,
            None => continue,
        };

        let accuracy = extract_number(entry, "hAcc=")
            .or_else(|| extract_number(entry, "acc="))
            .or(default_accuracy)
            .unwrap_or(0.0);

        return Some(GpsData { lat, lon, accuracy });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    // Real LTE dumps carry incidental NR mentions (mNrState=NONE, ENDC)
    // that must not flip the RAT.
    const TELEPHONY_DUMP: &str = "mSignalStrength=SignalStrength: 99 0 -120 -160 -120 -1 -1 99 \
        CellSignalStrengthLte: rssi=-89 rsrp=-118 rsrq=-16 rssnr=-2 cqi=4 ta=1 level=1 \
        mCellIdentity=CellIdentityLte{ mCi=27447297 mPci=261 mTac=20511 mEarfcn=6300 } \
        mNrState=NONE mEnDcAvailable=false";

    const TELEPHONY_DUMP_NR: &str = "mSignalStrength=SignalStrength: \
        CellSignalStrengthNr: ssRsrp=-92 ssRsrq=-11 ssSinr=13 level=3 \
        mCellIdentity=CellIdentityNr{ mPci=412 mTac=8011 mNrArfcn=632628 } \
        rsrp=-92 rsrq=-11 rssnr=13 mCi=99887766";

    const LOCATION_DUMP: &str = "last location=Location[gps 48.858370,2.294481 hAcc=4.5 \
        et=+5d4h13m4s188ms alt=35.2 vel=13.1 bear=274.0 acc=4.5]";

    const FUSED_DUMP: &str = "fused: Location[fused 37.421998,-122.084000 hAcc=12.0 \
        et=+1d2h3m4s5ms alt=5.0]";

    #[test]
    fn test_parse_cellular_reading() {
        let data = parse_cellular(TELEPHONY_DUMP).expect("registered radio");
        assert_eq!(data.rsrp, -118.0);
        assert_eq!(data.rsrq, -16.0);
        assert_eq!(data.sinr, -2.0);
        assert_eq!(data.cell_id, "27447297");
        assert_eq!(data.pci, 261);
        assert_eq!(data.rat, "LTE");
    }

    #[test]
    fn test_parse_cellular_without_registration() {
        assert!(parse_cellular("mServiceState=OUT_OF_SERVICE").is_none());
    }

    #[test]
    fn test_incidental_nr_mentions_stay_lte() {
        let data = parse_cellular(TELEPHONY_DUMP).expect("registered radio");
        assert_eq!(data.rat, "LTE");
    }

    #[test]
    fn test_registered_nr_block_is_nr() {
        let data = parse_cellular(TELEPHONY_DUMP_NR).expect("registered radio");
        assert_eq!(data.rat, "NR");
        assert_eq!(data.rsrp, -92.0);
        assert_eq!(data.pci, 412);
    }

    #[test]
    fn test_parse_gps_provider() {
        let fix = parse_gps(LOCATION_DUMP).expect("gps fix");
        assert!((fix.lat - 48.858370).abs() < 1e-9);
        assert!((fix.lon - 2.294481).abs() < 1e-9);
        assert_eq!(fix.accuracy, 4.5);
    }

    #[test]
    fn test_parse_gps_falls_back_to_fused() {
        let fix = parse_gps(FUSED_DUMP).expect("fused fix");
        assert!((fix.lat - 37.421998).abs() < 1e-9);
        assert!((fix.lon + 122.084000).abs() < 1e-9);
        assert_eq!(fix.accuracy, 12.0);
    }

    #[test]
    fn test_fused_without_accuracy_uses_estimate() {
        let dump = "Location[fused 37.421998,-122.084000 et=+1d2h3m4s5ms]";
        let fix = parse_gps(dump).expect("fused fix");
        assert_eq!(fix.accuracy, 10.0);
    }

    #[test]
    fn test_modern_gps_dump_with_hacc_only() {
        let dump = "Location[gps 48.858370,2.294481 hAcc=6.5 et=+2h1m3s alt=30.1 vAcc=9.0]";
        let fix = parse_gps(dump).expect("gps fix");
        assert_eq!(fix.accuracy, 6.5);
    }

    #[test]
    fn test_parse_gps_without_fix() {
        assert!(parse_gps("no providers running").is_none());
    }

    #[test]
    fn test_negative_coordinates() {
        let dump = "Location[gps -33.865143,151.209900 acc=8.0]";
        let fix = parse_gps(dump).expect("southern hemisphere fix");
        assert!(fix.lat < 0.0);
        assert!(fix.lon > 0.0);
    }
}
