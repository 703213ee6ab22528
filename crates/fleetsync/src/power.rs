//! Power event monitoring.
//!
//! Tracks battery state over periodic samples and tells the orchestrator
//! when the unit must flush and shut down. Critical is terminal: once
//! reached, only a process restart leaves it.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// One battery reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PowerSample {
    /// Battery voltage in volts.
    pub voltage: f64,
    /// State of charge, 0-100.
    pub capacity_percent: f64,
    /// Whether the battery is charging.
    pub is_charging: bool,
    /// Whether external (vehicle/mains) power is present, if known.
    pub external_power: Option<bool>,
}

impl PowerSample {
    fn is_powered(&self) -> bool {
        self.is_charging || self.external_power == Some(true)
    }
}

/// Battery tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerTier {
    /// Enough charge.
    Normal,
    /// At or below the low threshold.
    Low,
    /// At or below the critical threshold on battery; shutdown in progress.
    Critical,
}

impl std::fmt::Display for PowerTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Low => write!(f, "low"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Something the orchestrator may need to react to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PowerEvent {
    /// Entered the low tier.
    BatteryLow {
        /// Capacity at the transition.
        capacity_percent: f64,
    },
    /// Left the low tier after power came back.
    BatteryRecovered {
        /// Capacity at the transition.
        capacity_percent: f64,
    },
    /// Entered the critical tier; shut down now.
    Critical {
        /// Capacity at the transition.
        capacity_percent: f64,
    },
    /// External supply disappeared.
    ExternalPowerLost,
    /// External supply came back.
    ExternalPowerRestored,
}

/// Tier boundaries, in percent. Both are inclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerThresholds {
    /// Low tier boundary.
    pub low_percent: f64,
    /// Critical tier boundary.
    pub critical_percent: f64,
}

impl Default for PowerThresholds {
    fn default() -> Self {
        Self {
            low_percent: 20.0,
            critical_percent: 5.0,
        }
    }
}

#[derive(Debug)]
struct PowerState {
    tier: PowerTier,
    external_power: Option<bool>,
}

/// Battery tier state machine.
#[derive(Debug)]
pub struct PowerMonitor {
    thresholds: PowerThresholds,
    state: Mutex<PowerState>,
}

impl PowerMonitor {
    /// Create a monitor in the `Normal` tier.
    #[must_use]
    pub fn new(thresholds: PowerThresholds) -> Self {
        Self {
            thresholds,
            state: Mutex::new(PowerState {
                tier: PowerTier::Normal,
                external_power: None,
            }),
        }
    }

    /// Current tier.
    #[must_use]
    pub fn tier(&self) -> PowerTier {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tier
    }

    /// Feed one sample and return the events it causes.
    pub fn observe(&self, sample: &PowerSample) -> Vec<PowerEvent> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut events = Vec::new();

        if let Some(now) = sample.external_power {
            match state.external_power {
                Some(true) if !now => events.push(PowerEvent::ExternalPowerLost),
                Some(false) if now => events.push(PowerEvent::ExternalPowerRestored),
                _ => {}
            }
            state.external_power = Some(now);
        }

        if state.tier == PowerTier::Critical {
            return events;
        }

        let capacity = sample.capacity_percent;
        let powered = sample.is_powered();
        let next = if capacity <= self.thresholds.critical_percent && !powered {
            PowerTier::Critical
        } else if capacity <= self.thresholds.low_percent {
            PowerTier::Low
        } else if state.tier == PowerTier::Low && !powered {
            PowerTier::Low
        } else {
            PowerTier::Normal
        };

        if next != state.tier {
            events.push(match next {
                PowerTier::Critical => PowerEvent::Critical {
                    capacity_percent: capacity,
                },
                PowerTier::Low => PowerEvent::BatteryLow {
                    capacity_percent: capacity,
                },
                PowerTier::Normal => PowerEvent::BatteryRecovered {
                    capacity_percent: capacity,
                },
            });
            state.tier = next;
        }
        events
    }

    /// Sample `source` every `interval` and forward events until cancelled.
    ///
    /// Sampling errors are logged and skipped. Returns after forwarding a
    /// `Critical` event, since nothing further can change.
    ///
    /// # Errors
    ///
    /// Currently infallible; the signature matches other supervised tasks.
    pub async fn run(
        &self,
        source: &dyn PowerSource,
        interval: Duration,
        events: &mpsc::Sender<PowerEvent>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let sample = match source.sample().await {
                Ok(sample) => sample,
                Err(e) => {
                    warn!(source = source.name(), error = %e, "Power sample failed");
                    continue;
                }
            };
            debug!(
                capacity = sample.capacity_percent,
                voltage = sample.voltage,
                charging = sample.is_charging,
                "Power sample"
            );

            for event in self.observe(&sample) {
                log_event(&event);
                if events.send(event).await.is_err() {
                    return Ok(());
                }
                if matches!(event, PowerEvent::Critical { .. }) {
                    return Ok(());
                }
            }
        }
    }
}

fn log_event(event: &PowerEvent) {
    match event {
        PowerEvent::BatteryLow { capacity_percent } => {
            warn!(capacity = capacity_percent, "Battery low");
        }
        PowerEvent::BatteryRecovered { capacity_percent } => {
            info!(capacity = capacity_percent, "Battery recovered");
        }
        PowerEvent::Critical { capacity_percent } => {
            error!(capacity = capacity_percent, "Battery critical, shutting down");
        }
        PowerEvent::ExternalPowerLost => warn!("External power lost, running on battery"),
        PowerEvent::ExternalPowerRestored => info!("External power restored"),
    }
}

/// Somewhere battery samples come from.
#[async_trait]
pub trait PowerSource: Send + Sync + std::fmt::Debug {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Take one sample.
    ///
    /// # Errors
    ///
    /// Returns an error if the hardware cannot be read.
    async fn sample(&self) -> Result<PowerSample>;
}

/// Battery readings from `/sys/class/power_supply`.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone)]
pub struct SysfsPowerSource {
    battery: std::path::PathBuf,
}

#[cfg(target_os = "linux")]
impl SysfsPowerSource {
    /// Use the battery directory at `battery`.
    #[must_use]
    pub fn new(battery: impl Into<std::path::PathBuf>) -> Self {
        Self {
            battery: battery.into(),
        }
    }

    /// Find the first battery under the system power supply root.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be listed or has no battery.
    pub fn detect() -> Result<Self> {
        Self::detect_in(std::path::Path::new(fleetsync_linux::POWER_SUPPLY_ROOT))
    }

    /// Find the first battery under `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if `root` cannot be listed or has no battery.
    pub fn detect_in(root: &std::path::Path) -> Result<Self> {
        fleetsync_linux::find_battery(root)?
            .map(Self::new)
            .ok_or_else(|| {
                crate::error::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no battery found under {}", root.display()),
                ))
            })
    }
}

#[cfg(target_os = "linux")]
#[async_trait]
impl PowerSource for SysfsPowerSource {
    fn name(&self) -> &'static str {
        "sysfs"
    }

    async fn sample(&self) -> Result<PowerSample> {
        let reading = fleetsync_linux::read_battery(&self.battery)?;
        Ok(PowerSample {
            voltage: reading.voltage,
            capacity_percent: reading.capacity_percent,
            is_charging: reading.is_charging,
            external_power: reading.external_power,
        })
    }
}
