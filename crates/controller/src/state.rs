use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::fertilizer::{FertilizerReading, SoilStatus};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

pub fn new_shared() -> SharedState {
    Arc::new(RwLock::new(SystemState::new()))
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Ephemeral view of the controller for the UI: last fertilizer readings,
/// store reachability and a bounded log of notifications.
pub struct SystemState {
    pub started_at: Instant,
    pub store_reachable: bool,
    pub fertilizer: BTreeMap<String, FertilizerState>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct FertilizerState {
    pub name: String,
    pub reading: FertilizerReading,
    pub soil_status: Option<SoilStatus>,
    pub dry_alert: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

#[derive(Clone, Debug, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AutoTriggerSucceeded,
    AutoTriggerFailed,
    ManualError,
    Pump,
    Scheduler,
    Fertilizer,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            store_reachable: false,
            fertilizer: BTreeMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record a notification for the UI collaborator.
    pub fn notify(&mut self, kind: EventKind, detail: impl Into<String>) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail: detail.into(),
        });
    }

    /// Store the latest reading of a fertilizer channel. Returns `true` when
    /// the channel just crossed into the dry-alert state.
    pub fn record_fertilizer(
        &mut self,
        id: &str,
        name: &str,
        reading: FertilizerReading,
        dry: bool,
    ) -> bool {
        let was_dry = self.fertilizer.get(id).is_some_and(|f| f.dry_alert);
        let soil_status = reading.soil_moisture.map(SoilStatus::classify);
        self.fertilizer.insert(
            id.to_string(),
            FertilizerState {
                name: name.to_string(),
                reading,
                soil_status,
                dry_alert: dry,
                last_updated: OffsetDateTime::now_utc(),
            },
        );
        dry && !was_dry
    }

    /// Update the cached pump flag of a fertilizer channel after a confirmed
    /// store write.
    pub fn record_fertilizer_pump(&mut self, id: &str, on: bool) {
        if let Some(f) = self.fertilizer.get_mut(id) {
            f.reading.pump_on = Some(on);
            f.last_updated = OffsetDateTime::now_utc();
        }
    }

    /// Events of one kind, oldest first.
    #[cfg(test)]
    pub fn events_of(&self, kind: EventKind) -> Vec<&SystemEvent> {
        self.events.iter().filter(|e| e.kind == kind).collect()
    }

    /// Newest first, as served by the status endpoint.
    pub fn recent_events(&self) -> Vec<SystemEvent> {
        self.events.iter().rev().cloned().collect()
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
