//! Per-fertilizer sensor monitoring: polls each channel's node in the store,
//! classifies the soil, raises a dry-soil alert and toggles the channel's
//! fertilizer pump.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::config::FertilizerEntry;
use crate::error::ControllerError;
use crate::state::{EventKind, SharedState};
use crate::store::StateStore;

/// One snapshot of a fertilizer node. Field aliases are the keys the field
/// device writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FertilizerReading {
    /// Percent; higher is drier.
    #[serde(alias = "kelembapan")]
    pub soil_moisture: Option<f64>,
    /// mg/kg
    pub nitrogen: Option<f64>,
    /// mg/kg
    #[serde(alias = "fospor")]
    pub phosphorus: Option<f64>,
    /// mg/kg
    #[serde(alias = "kalium")]
    pub potassium: Option<f64>,
    /// °C
    #[serde(alias = "suhu")]
    pub soil_temperature: Option<f64>,
    #[serde(alias = "pompa")]
    pub pump_on: Option<bool>,
}

impl FertilizerReading {
    pub fn from_store(value: &Value) -> Result<Self, serde_json::Error> {
        match value {
            Value::Null => Ok(Self::default()),
            other => Self::deserialize(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SoilStatus {
    Dry,
    Moist,
    Wet,
}

impl SoilStatus {
    pub fn classify(moisture: f64) -> Self {
        if moisture > 70.0 {
            Self::Dry
        } else if moisture > 30.0 {
            Self::Moist
        } else {
            Self::Wet
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct FertilizerMonitor {
    channels: Arc<Vec<FertilizerEntry>>,
    store: Arc<dyn StateStore>,
    shared: SharedState,
}

impl FertilizerMonitor {
    pub fn new(
        channels: Vec<FertilizerEntry>,
        store: Arc<dyn StateStore>,
        shared: SharedState,
    ) -> Self {
        Self {
            channels: Arc::new(channels),
            store,
            shared,
        }
    }

    /// Fetch every channel once. A failing channel is logged and skipped so
    /// one bad node does not hide the others.
    pub async fn poll_once(&self) {
        for ch in self.channels.iter() {
            if let Err(e) = self.poll_channel(ch).await {
                warn!(channel = %ch.id, "fertilizer poll failed: {e}");
                let mut st = self.shared.write().await;
                st.notify(EventKind::Error, format!("{}: {e}", ch.name));
            }
        }
    }

    async fn poll_channel(&self, ch: &FertilizerEntry) -> anyhow::Result<()> {
        let value = self.store.get(&ch.path).await?;
        let reading = FertilizerReading::from_store(&value)?;
        let dry = reading
            .soil_moisture
            .is_some_and(|m| m > ch.dry_alert_threshold);

        let mut st = self.shared.write().await;
        if st.record_fertilizer(&ch.id, &ch.name, reading.clone(), dry) {
            info!(
                channel = %ch.id,
                moisture = ?reading.soil_moisture,
                threshold = ch.dry_alert_threshold,
                "soil dry alert"
            );
            st.notify(
                EventKind::Fertilizer,
                format!(
                    "{}: soil is dry ({:.0}%), water the plants",
                    ch.name,
                    reading.soil_moisture.unwrap_or_default()
                ),
            );
        }
        Ok(())
    }

    /// Flip the channel's pump flag. The current value is read from the
    /// store, not the cache, and the cache changes only after the write lands.
    pub async fn toggle_pump(&self, id: &str) -> Result<bool, ControllerError> {
        let ch = self
            .channels
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| ControllerError::UnknownFertilizer(id.to_string()))?;

        let pump_path = format!("{}/pompa", ch.path);
        let current = self.store.get(&pump_path).await?.as_bool().unwrap_or(false);
        let next = !current;
        self.store.put(&pump_path, &Value::Bool(next)).await?;

        info!(channel = %ch.id, on = next, "fertilizer pump toggled");
        let mut st = self.shared.write().await;
        st.record_fertilizer_pump(&ch.id, next);
        st.notify(
            EventKind::Pump,
            format!("{} pump {}", ch.name, if next { "ON" } else { "OFF" }),
        );
        Ok(next)
    }
}

/// Poll all channels forever. Intended to be `tokio::spawn`-ed from main.
pub async fn run(monitor: FertilizerMonitor, poll_interval: Duration) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        channels = monitor.channels.len(),
        poll_sec = poll_interval.as_secs(),
        "fertilizer monitor started"
    );

    loop {
        ticker.tick().await;
        monitor.poll_once().await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
