//! Battery readings from `/sys/class/power_supply`.
//!
//! UPS HATs and laptop batteries that have a kernel fuel-gauge driver expose
//! the same attribute files, so no register-level access is needed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Default sysfs root for power supplies.
pub const POWER_SUPPLY_ROOT: &str = "/sys/class/power_supply";

/// One reading of a battery supply.
#[derive(Debug, Clone, PartialEq)]
pub struct BatteryReading {
    /// Battery voltage in volts (0.0 when the driver does not report it).
    pub voltage: f64,
    /// State of charge in percent, clamped to 0..=100.
    pub capacity_percent: f64,
    /// Whether the battery reports `Charging` or `Full`.
    pub is_charging: bool,
    /// Whether any mains/USB supply next to the battery reports `online`.
    /// `None` when the system exposes no such supply.
    pub external_power: Option<bool>,
}

/// Find the first supply whose `type` is `Battery` under `root`.
///
/// # Errors
///
/// Returns an error if `root` cannot be listed.
pub fn find_battery(root: &Path) -> io::Result<Option<PathBuf>> {
    let mut entries = fs::read_dir(root)?
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .collect::<Vec<_>>();
    entries.sort();

    Ok(entries
        .into_iter()
        .find(|p| read_trimmed(&p.join("type")).is_some_and(|t| t == "Battery")))
}

/// Read the battery at `battery` (a directory such as
/// `/sys/class/power_supply/BAT0`).
///
/// External power is derived from sibling supplies of type `Mains` or `USB`.
///
/// # Errors
///
/// Returns an error if the `capacity` attribute is missing or unparseable.
pub fn read_battery(battery: &Path) -> io::Result<BatteryReading> {
    let capacity_raw = read_trimmed(&battery.join("capacity")).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} has no capacity attribute", battery.display()),
        )
    })?;
    let capacity: f64 = capacity_raw.parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid capacity value: {capacity_raw}"),
        )
    })?;

    // voltage_now is reported in microvolts
    let voltage = read_trimmed(&battery.join("voltage_now"))
        .and_then(|v| v.parse::<f64>().ok())
        .map_or(0.0, |uv| uv / 1_000_000.0);

    let is_charging = read_trimmed(&battery.join("status"))
        .is_some_and(|s| s == "Charging" || s == "Full");

    let external_power = battery.parent().and_then(external_power_online);

    Ok(BatteryReading {
        voltage,
        capacity_percent: capacity.clamp(0.0, 100.0),
        is_charging,
        external_power,
    })
}

fn external_power_online(root: &Path) -> Option<bool> {
    let supplies = fs::read_dir(root).ok()?;
    let mut seen = false;
    for entry in supplies.filter_map(std::result::Result::ok) {
        let path = entry.path();
        match read_trimmed(&path.join("type")).as_deref() {
            Some("Mains" | "USB") => {
                seen = true;
                if read_trimmed(&path.join("online")).is_some_and(|v| v == "1") {
                    return Some(true);
                }
            }
            _ => {}
        }
    }
    seen.then_some(false)
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}
