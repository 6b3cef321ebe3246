//! Irrigation pump controller. The pump itself is a boolean in the remote
//! store; the field device switches the relay when that flag changes.
//!
//! ```text
//! Idle ──start(d)──▶ Watering ──stop() / d minutes elapsed──▶ Idle
//! ```
//!
//! Local state only changes after the store confirms the write. The auto-stop
//! timer is an owned task handle; at most one exists at a time.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::error::ControllerError;
use crate::state::{EventKind, SharedState};
use crate::store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpState {
    Idle,
    Watering,
}

#[derive(Debug, Clone, Serialize)]
pub struct WateringSession {
    #[serde(skip)]
    id: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub duration_min: NonZeroU32,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PumpController {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn StateStore>,
    pump_path: String,
    clock: Arc<dyn Clock>,
    shared: SharedState,
    slot: Mutex<Slot>,
}

struct Slot {
    state: PumpState,
    /// `None` while watering means another actor switched the pump on.
    session: Option<WateringSession>,
    auto_stop: Option<JoinHandle<()>>,
    next_session_id: u64,
    /// Set by `shutdown`; no new session starts afterwards.
    shut_down: bool,
}

impl Slot {
    fn go_idle(&mut self) {
        self.state = PumpState::Idle;
        self.session = None;
        if let Some(timer) = self.auto_stop.take() {
            timer.abort();
        }
    }
}

impl PumpController {
    pub fn new(
        store: Arc<dyn StateStore>,
        pump_path: String,
        clock: Arc<dyn Clock>,
        shared: SharedState,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                pump_path,
                clock,
                shared,
                slot: Mutex::new(Slot {
                    state: PumpState::Idle,
                    session: None,
                    auto_stop: None,
                    next_session_id: 0,
                    shut_down: false,
                }),
            }),
        }
    }

    pub async fn state(&self) -> PumpState {
        self.inner.slot.lock().await.state
    }

    pub async fn session(&self) -> Option<WateringSession> {
        self.inner.slot.lock().await.session.clone()
    }

    /// Switch the pump on for `duration_min` minutes.
    pub async fn start(&self, duration_min: NonZeroU32) -> Result<(), ControllerError> {
        let mut slot = self.inner.slot.lock().await;
        if slot.shut_down {
            return Err(ControllerError::ControllerConflict("pump controller is shut down"));
        }
        if slot.state == PumpState::Watering {
            return Err(ControllerError::ControllerConflict("pump is already watering"));
        }

        self.inner
            .store
            .put(&self.inner.pump_path, &Value::Bool(true))
            .await?;

        slot.next_session_id += 1;
        let id = slot.next_session_id;
        slot.state = PumpState::Watering;
        slot.session = Some(WateringSession {
            id,
            started_at: self.inner.clock.now(),
            duration_min,
        });

        let this = self.clone();
        let delay = Duration::from_secs(u64::from(duration_min.get()) * 60);
        slot.auto_stop = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.expire(id).await;
        }));
        drop(slot);

        info!(duration_min = duration_min.get(), "pump started");
        self.record(EventKind::Pump, format!("watering started for {duration_min} min"))
            .await;
        Ok(())
    }

    /// Switch the pump off. A no-op when already idle.
    pub async fn stop(&self) -> Result<(), ControllerError> {
        let mut slot = self.inner.slot.lock().await;
        if slot.state == PumpState::Idle {
            return Ok(());
        }

        self.inner
            .store
            .put(&self.inner.pump_path, &Value::Bool(false))
            .await?;

        slot.go_idle();
        drop(slot);

        info!("pump stopped");
        self.record(EventKind::Pump, "watering stopped").await;
        Ok(())
    }

    /// Auto-stop for session `id`. Runs inside the auto-stop task, so it
    /// detaches its own handle instead of aborting it.
    async fn expire(&self, id: u64) {
        let mut slot = self.inner.slot.lock().await;
        let Some(session) = slot.session.clone().filter(|s| s.id == id) else {
            return;
        };
        // Detach: dropping our own handle must not cancel this task.
        slot.auto_stop.take();

        if let Err(e) = self
            .inner
            .store
            .put(&self.inner.pump_path, &Value::Bool(false))
            .await
        {
            error!("auto-stop failed, pump still on: {e}");
            drop(slot);
            self.record(
                EventKind::Error,
                format!("auto-stop failed, pump still on: {e}"),
            )
            .await;
            return;
        }

        slot.go_idle();
        drop(slot);

        info!(duration_min = session.duration_min.get(), "pump auto-stopped");
        self.record(
            EventKind::Pump,
            format!("watering finished after {} min", session.duration_min),
        )
        .await;
    }

    /// Re-read the pump flag from the store and reconcile the local cache
    /// with changes made by other actors.
    pub async fn refresh(&self) -> Result<PumpState, ControllerError> {
        let mut slot = self.inner.slot.lock().await;
        let remote_on = self
            .inner
            .store
            .get(&self.inner.pump_path)
            .await?
            .as_bool()
            .unwrap_or(false);

        match (slot.state, remote_on) {
            (PumpState::Idle, true) => {
                warn!("pump switched on by another actor");
                slot.state = PumpState::Watering;
                drop(slot);
                self.record(EventKind::Pump, "pump switched on externally").await;
                Ok(PumpState::Watering)
            }
            (PumpState::Watering, false) => {
                warn!("pump switched off by another actor");
                slot.go_idle();
                drop(slot);
                self.record(EventKind::Pump, "pump switched off externally").await;
                Ok(PumpState::Idle)
            }
            (state, _) => Ok(state),
        }
    }

    /// Refuse new sessions and cancel the auto-stop timer. A session started
    /// here is stopped on a best-effort basis so the pump is not left running
    /// unattended.
    pub async fn shutdown(&self) {
        let ours = {
            let mut slot = self.inner.slot.lock().await;
            slot.shut_down = true;
            slot.session.is_some()
        };
        if ours {
            if let Err(e) = self.stop().await {
                error!("could not stop pump during shutdown: {e}");
            }
        }
        let mut slot = self.inner.slot.lock().await;
        if let Some(timer) = slot.auto_stop.take() {
            timer.abort();
        }
    }

    async fn record(&self, kind: EventKind, detail: impl Into<String>) {
        let mut st = self.inner.shared.write().await;
        st.notify(kind, detail);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
