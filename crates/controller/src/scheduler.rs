//! Automatic irrigation scheduler: arms a one-shot timer for the next daily
//! target and starts the pump when it fires.
//!
//! The scheduler only decides *when*; pump safety (confirm-then-commit,
//! auto-stop) lives in [`PumpController`]. Mode and schedule are shared with
//! other actors through the store, so both are re-read on every refresh.
//!
//! ```text
//! Unarmed ──mode=automatic──▶ Armed(t) ──timer fires──▶ Armed(t')
//!    ▲                           │
//!    └──────mode=manual──────────┘
//! ```

use std::future::Future;
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::error::ControllerError;
use crate::pump::{PumpController, PumpState};
use crate::schedule::{next_trigger, DailySchedule};
use crate::state::{EventKind, SharedState};
use crate::store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Manual,
    Automatic,
}

impl Mode {
    /// Anything but `"manual"` (including an unset node) means automatic.
    pub fn from_store(value: &Value) -> Self {
        match value.as_str() {
            Some("manual") => Self::Manual,
            _ => Self::Automatic,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Automatic => "automatic",
        }
    }
}

/// Store paths and defaults the scheduler works with.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub mode_path: String,
    pub schedule_path: String,
    pub default_schedule: DailySchedule,
    pub default_duration: NonZeroU32,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct IrrigationScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    settings: SchedulerSettings,
    store: Arc<dyn StateStore>,
    pump: PumpController,
    clock: Arc<dyn Clock>,
    shared: SharedState,
    slot: Mutex<Slot>,
}

struct Slot {
    mode: Mode,
    schedule: DailySchedule,
    armed: Option<Armed>,
    /// Bumped on every arm; a timer only acts if its generation is current.
    generation: u64,
    shut_down: bool,
}

struct Armed {
    trigger_at: OffsetDateTime,
    generation: u64,
    timer: JoinHandle<()>,
}

impl Slot {
    fn disarm(&mut self) {
        if let Some(armed) = self.armed.take() {
            armed.timer.abort();
        }
    }
}

impl IrrigationScheduler {
    /// Starts in manual mode and unarmed until the first refresh or
    /// explicit mode change.
    pub fn new(
        settings: SchedulerSettings,
        store: Arc<dyn StateStore>,
        pump: PumpController,
        clock: Arc<dyn Clock>,
        shared: SharedState,
    ) -> Self {
        let schedule = settings.default_schedule.clone();
        Self {
            inner: Arc::new(Inner {
                settings,
                store,
                pump,
                clock,
                shared,
                slot: Mutex::new(Slot {
                    mode: Mode::Manual,
                    schedule,
                    armed: None,
                    generation: 0,
                    shut_down: false,
                }),
            }),
        }
    }

    pub async fn mode(&self) -> Mode {
        self.inner.slot.lock().await.mode
    }

    pub async fn schedule(&self) -> DailySchedule {
        self.inner.slot.lock().await.schedule.clone()
    }

    pub async fn next_trigger(&self) -> Option<OffsetDateTime> {
        self.inner
            .slot
            .lock()
            .await
            .armed
            .as_ref()
            .map(|a| a.trigger_at)
    }

    /// Next trigger as local `HH:MM`, for display.
    pub async fn next_trigger_display(&self) -> Option<String> {
        let at = self.next_trigger().await?;
        at.format(format_description!("[hour]:[minute]")).ok()
    }

    /// Apply a mode/schedule pair. Manual disarms; automatic (re)arms for the
    /// next target after `now`, replacing any previous timer.
    pub async fn on_mode_or_schedule_changed(
        &self,
        mode: Mode,
        schedule: DailySchedule,
        now: OffsetDateTime,
    ) {
        let mut slot = self.inner.slot.lock().await;
        slot.mode = mode;
        slot.schedule = schedule;
        slot.disarm();

        if slot.shut_down {
            return;
        }
        match mode {
            Mode::Manual => {
                info!("automatic watering disarmed");
            }
            Mode::Automatic => {
                let at = self.arm(&mut slot, now);
                info!(trigger_at = %at, schedule = %slot.schedule, "automatic watering armed");
            }
        }
    }

    /// Write the mode to the store, then apply it locally. On a failed write
    /// the previous mode stays in effect.
    pub async fn set_mode(&self, mode: Mode) -> Result<(), ControllerError> {
        self.inner
            .store
            .put(&self.inner.settings.mode_path, &Value::from(mode.as_str()))
            .await?;

        let schedule = self.schedule().await;
        self.on_mode_or_schedule_changed(mode, schedule, self.inner.clock.now())
            .await;

        let mut st = self.inner.shared.write().await;
        st.notify(EventKind::Scheduler, format!("mode set to {}", mode.as_str()));
        Ok(())
    }

    /// Re-read mode, schedule and pump state from the store. Re-arms only
    /// when something changed or automatic mode lost its timer.
    pub async fn refresh(&self) -> Result<(), ControllerError> {
        let result = self.try_refresh().await;
        let mut st = self.inner.shared.write().await;
        st.store_reachable = !matches!(result, Err(ControllerError::StoreUnavailable(_)));
        result
    }

    async fn try_refresh(&self) -> Result<(), ControllerError> {
        let store = &self.inner.store;
        let settings = &self.inner.settings;
        let (mode_value, schedule_value) = tokio::try_join!(
            store.get(&settings.mode_path),
            store.get(&settings.schedule_path),
        )?;
        self.inner.pump.refresh().await?;

        let mode = Mode::from_store(&mode_value);
        let current = self.schedule().await;
        let schedule = match DailySchedule::from_store(&schedule_value) {
            Ok(Some(remote)) => remote,
            Ok(None) => settings.default_schedule.clone(),
            Err(e) => {
                warn!("ignoring remote schedule: {e}");
                let mut st = self.inner.shared.write().await;
                st.notify(EventKind::Error, format!("remote schedule ignored: {e}"));
                current.clone()
            }
        };

        let needs_arm = {
            let slot = self.inner.slot.lock().await;
            slot.mode != mode
                || slot.schedule != schedule
                || (mode == Mode::Automatic && slot.armed.is_none())
        };
        if needs_arm {
            self.on_mode_or_schedule_changed(mode, schedule, self.inner.clock.now())
                .await;
        }
        Ok(())
    }

    /// Cancel the pending trigger. No timer fires after this returns.
    pub async fn shutdown(&self) {
        let mut slot = self.inner.slot.lock().await;
        slot.shut_down = true;
        slot.disarm();
        info!("scheduler shut down");
    }

    // -----------------------------------------------------------------------
    // Timer
    // -----------------------------------------------------------------------

    fn arm(&self, slot: &mut Slot, now: OffsetDateTime) -> OffsetDateTime {
        slot.disarm();
        slot.generation += 1;

        let trigger_at = next_trigger(now, &slot.schedule);
        let delay = Duration::try_from(trigger_at - now).unwrap_or_default();
        let timer = tokio::spawn(self.clone().timer(slot.generation, delay));

        slot.armed = Some(Armed {
            trigger_at,
            generation: slot.generation,
            timer,
        });
        trigger_at
    }

    // Boxed so the fire → arm → timer → fire cycle has a nameable type.
    fn timer(self, generation: u64, delay: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            self.fire(generation).await;
        })
    }

    async fn fire(&self, generation: u64) {
        // Claim the timer. Once taken, a later disarm cannot abort the
        // trigger half-way through a store write.
        {
            let mut slot = self.inner.slot.lock().await;
            match &slot.armed {
                Some(a) if a.generation == generation => {}
                _ => return,
            }
            slot.armed.take();
            if slot.mode != Mode::Automatic || slot.shut_down {
                return;
            }
        }

        self.trigger().await;

        let mut slot = self.inner.slot.lock().await;
        if slot.mode == Mode::Automatic && slot.armed.is_none() && !slot.shut_down {
            let at = self.arm(&mut slot, self.inner.clock.now());
            info!(trigger_at = %at, "next automatic watering");
        }
    }

    async fn trigger(&self) {
        let pump = &self.inner.pump;

        // The local flag may be stale; ask the store first.
        let state = match pump.refresh().await {
            Ok(state) => state,
            Err(e) => {
                error!("automatic watering skipped, pump state unknown: {e}");
                self.notify(
                    EventKind::AutoTriggerFailed,
                    format!("automatic watering failed: {e}"),
                )
                .await;
                return;
            }
        };

        if state == PumpState::Watering {
            info!("automatic watering skipped, pump already running");
            self.notify(
                EventKind::Scheduler,
                "automatic watering skipped, pump already running",
            )
            .await;
            return;
        }

        // Teardown may have begun while the pump state was being read.
        if self.inner.slot.lock().await.shut_down {
            info!("automatic watering dropped, scheduler shut down");
            return;
        }

        let duration = self.inner.settings.default_duration;
        match pump.start(duration).await {
            Ok(()) => {
                info!(duration_min = duration.get(), "automatic watering started");
                self.notify(
                    EventKind::AutoTriggerSucceeded,
                    format!("automatic watering started for {duration} min"),
                )
                .await;
            }
            Err(e) => {
                error!("automatic watering failed: {e}");
                self.notify(
                    EventKind::AutoTriggerFailed,
                    format!("automatic watering failed: {e}"),
                )
                .await;
            }
        }
    }

    async fn notify(&self, kind: EventKind, detail: impl Into<String>) {
        let mut st = self.inner.shared.write().await;
        st.notify(kind, detail);
    }
}

/// Refresh from the store forever. Intended to be `tokio::spawn`-ed from main.
pub async fn run(scheduler: IrrigationScheduler, poll_interval: Duration) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(poll_sec = poll_interval.as_secs(), "scheduler poll loop started");

    loop {
        ticker.tick().await;
        if let Err(e) = scheduler.refresh().await {
            warn!("scheduler refresh failed: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::state::new_shared;
    use crate::store::memory::MemoryStore;
    use serde_json::json;
    use time::macros::datetime;

    const PUMP: &str = "PompaPenyiramanAir/pompa";
    const MODE: &str = "PompaPenyiramanAir/Mode";
    const SCHEDULE: &str = "PompaPenyiramanAir/WaktuPenyiraman";

    struct Fixture {
        scheduler: IrrigationScheduler,
        pump: PumpController,
        store: Arc<MemoryStore>,
        shared: SharedState,
    }

    /// Wall clock starts at 08:00 (+07:00); targets 07:00, 12:00, 17:00;
    /// watering lasts 5 minutes.
    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let shared = new_shared();
        let clock: Arc<dyn Clock> = Arc::new(TestClock::at(datetime!(2024-06-01 08:00 +7)));
        let pump = PumpController::new(
            store.clone(),
            PUMP.to_string(),
            Arc::clone(&clock),
            shared.clone(),
        );
        let settings = SchedulerSettings {
            mode_path: MODE.to_string(),
            schedule_path: SCHEDULE.to_string(),
            default_schedule: DailySchedule::default(),
            default_duration: NonZeroU32::new(5).unwrap(),
        };
        let scheduler = IrrigationScheduler::new(
            settings,
            store.clone(),
            pump.clone(),
            clock,
            shared.clone(),
        );
        Fixture {
            scheduler,
            pump,
            store,
            shared,
        }
    }

    fn hours(h: u64) -> Duration {
        Duration::from_secs(h * 3600)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    async fn automatic(f: &Fixture) {
        f.scheduler
            .on_mode_or_schedule_changed(
                Mode::Automatic,
                DailySchedule::default(),
                datetime!(2024-06-01 08:00 +7),
            )
            .await;
    }

    // -- Mode parsing ---------------------------------------------------------

    #[test]
    fn mode_from_store_defaults_to_automatic() {
        assert_eq!(Mode::from_store(&json!("manual")), Mode::Manual);
        assert_eq!(Mode::from_store(&json!("automatic")), Mode::Automatic);
        assert_eq!(Mode::from_store(&Value::Null), Mode::Automatic);
        assert_eq!(Mode::from_store(&json!(true)), Mode::Automatic);
    }

    // -- Arming ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn automatic_arms_next_target() {
        let f = fixture();
        automatic(&f).await;

        assert_eq!(
            f.scheduler.next_trigger().await,
            Some(datetime!(2024-06-01 12:00 +7))
        );
        assert_eq!(f.scheduler.next_trigger_display().await.as_deref(), Some("12:00"));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_is_unarmed() {
        let f = fixture();
        f.scheduler
            .on_mode_or_schedule_changed(
                Mode::Manual,
                DailySchedule::default(),
                datetime!(2024-06-01 08:00 +7),
            )
            .await;

        assert_eq!(f.scheduler.next_trigger().await, None);
        assert_eq!(f.scheduler.next_trigger_display().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn switching_to_manual_cancels_armed_timer() {
        let f = fixture();
        automatic(&f).await;
        f.scheduler
            .on_mode_or_schedule_changed(
                Mode::Manual,
                DailySchedule::default(),
                datetime!(2024-06-01 08:00 +7),
            )
            .await;

        tokio::time::sleep(hours(10)).await;
        settle().await;

        assert!(f.store.writes_to(PUMP).is_empty());
        assert_eq!(f.pump.state().await, PumpState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_previous_timer() {
        let f = fixture();
        automatic(&f).await;
        automatic(&f).await;
        automatic(&f).await;

        tokio::time::sleep(hours(4) + Duration::from_secs(1)).await;
        settle().await;

        assert_eq!(f.store.writes_to(PUMP), vec![json!(true)]);
    }

    // -- Firing ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn firing_starts_pump_and_rearms() {
        let f = fixture();
        automatic(&f).await;

        tokio::time::sleep(hours(4) + Duration::from_secs(1)).await;
        settle().await;

        assert_eq!(f.pump.state().await, PumpState::Watering);
        assert_eq!(
            f.scheduler.next_trigger().await,
            Some(datetime!(2024-06-01 17:00 +7))
        );
        let st = f.shared.read().await;
        assert_eq!(st.events_of(EventKind::AutoTriggerSucceeded).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_stop_follows_auto_start() {
        let f = fixture();
        automatic(&f).await;

        tokio::time::sleep(hours(4) + Duration::from_secs(6 * 60)).await;
        settle().await;

        assert_eq!(f.pump.state().await, PumpState::Idle);
        assert_eq!(f.store.writes_to(PUMP), vec![json!(true), json!(false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn runs_every_target_across_midnight() {
        let f = fixture();
        automatic(&f).await;

        // 08:00 day 1 → 08:00 day 2 covers 12:00, 17:00 and 07:00.
        tokio::time::sleep(hours(24)).await;
        settle().await;

        let st = f.shared.read().await;
        assert_eq!(st.events_of(EventKind::AutoTriggerSucceeded).len(), 3);
        drop(st);
        assert_eq!(
            f.scheduler.next_trigger().await,
            Some(datetime!(2024-06-02 12:00 +7))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn firing_while_watering_is_skipped() {
        let f = fixture();
        automatic(&f).await;
        f.pump.start(NonZeroU32::new(600).unwrap()).await.unwrap();

        tokio::time::sleep(hours(4) + Duration::from_secs(1)).await;
        settle().await;

        assert_eq!(f.store.writes_to(PUMP), vec![json!(true)]);
        assert_eq!(
            f.scheduler.next_trigger().await,
            Some(datetime!(2024-06-01 17:00 +7))
        );
        let st = f.shared.read().await;
        assert!(st.events_of(EventKind::AutoTriggerSucceeded).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn firing_checks_store_not_just_cache() {
        let f = fixture();
        automatic(&f).await;
        // The field device switched the pump on moments before 12:00.
        f.store.set_external(PUMP, json!(true));

        tokio::time::sleep(hours(4) + Duration::from_secs(1)).await;
        settle().await;

        assert!(f.store.writes_to(PUMP).is_empty());
        assert_eq!(f.pump.session().await.map(|s| s.duration_min.get()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_start_notifies_and_rearms() {
        let f = fixture();
        automatic(&f).await;
        f.store.fail_puts(true);

        tokio::time::sleep(hours(4) + Duration::from_secs(1)).await;
        settle().await;

        assert_eq!(f.pump.state().await, PumpState::Idle);
        assert_eq!(
            f.scheduler.next_trigger().await,
            Some(datetime!(2024-06-01 17:00 +7))
        );
        let st = f.shared.read().await;
        assert_eq!(st.events_of(EventKind::AutoTriggerFailed).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_pump_state_notifies_failure() {
        let f = fixture();
        automatic(&f).await;
        f.store.fail_gets(true);

        tokio::time::sleep(hours(4) + Duration::from_secs(1)).await;
        settle().await;

        assert!(f.store.writes().is_empty());
        let st = f.shared.read().await;
        assert_eq!(st.events_of(EventKind::AutoTriggerFailed).len(), 1);
    }

    // -- set_mode -------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn set_mode_writes_store_then_arms() {
        let f = fixture();

        f.scheduler.set_mode(Mode::Automatic).await.unwrap();

        assert_eq!(f.store.writes_to(MODE), vec![json!("automatic")]);
        assert_eq!(f.scheduler.mode().await, Mode::Automatic);
        assert_eq!(
            f.scheduler.next_trigger().await,
            Some(datetime!(2024-06-01 12:00 +7))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn set_mode_failure_keeps_previous_mode() {
        let f = fixture();
        automatic(&f).await;
        f.store.fail_puts(true);

        let err = f.scheduler.set_mode(Mode::Manual).await.unwrap_err();

        assert!(matches!(err, ControllerError::StoreUnavailable(_)));
        assert_eq!(f.scheduler.mode().await, Mode::Automatic);
        assert!(f.scheduler.next_trigger().await.is_some());
    }

    // -- refresh --------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn refresh_applies_remote_mode_and_schedule() {
        let f = fixture();
        f.store.set_external(MODE, json!("automatic"));
        f.store.set_external(SCHEDULE, json!(["09:30", "15:00"]));

        f.scheduler.refresh().await.unwrap();

        assert_eq!(f.scheduler.mode().await, Mode::Automatic);
        assert_eq!(
            f.scheduler.next_trigger().await,
            Some(datetime!(2024-06-01 09:30 +7))
        );
        assert!(f.shared.read().await.store_reachable);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_unchanged_keeps_timer() {
        let f = fixture();
        f.store.set_external(MODE, json!("automatic"));
        f.scheduler.refresh().await.unwrap();
        let first = f.scheduler.next_trigger().await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        f.scheduler.refresh().await.unwrap();

        assert_eq!(f.scheduler.next_trigger().await, first);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_remote_manual_disarms() {
        let f = fixture();
        automatic(&f).await;
        f.store.set_external(MODE, json!("manual"));

        f.scheduler.refresh().await.unwrap();

        assert_eq!(f.scheduler.mode().await, Mode::Manual);
        assert_eq!(f.scheduler.next_trigger().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_ignores_malformed_remote_schedule() {
        let f = fixture();
        f.store.set_external(MODE, json!("automatic"));
        f.store.set_external(SCHEDULE, json!("whenever"));

        f.scheduler.refresh().await.unwrap();

        assert_eq!(f.scheduler.schedule().await, DailySchedule::default());
        let st = f.shared.read().await;
        assert_eq!(st.events_of(EventKind::Error).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_failure_marks_store_unreachable() {
        let f = fixture();
        f.store.fail_gets(true);

        assert!(f.scheduler.refresh().await.is_err());
        assert!(!f.shared.read().await.store_reachable);
    }

    // -- shutdown -------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn nothing_fires_after_shutdown() {
        let f = fixture();
        automatic(&f).await;
        f.scheduler.shutdown().await;

        tokio::time::sleep(hours(24)).await;
        settle().await;

        assert!(f.store.writes().is_empty());
        assert_eq!(f.scheduler.next_trigger().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_inflight_trigger_leaves_pump_off() {
        let f = fixture();
        automatic(&f).await;
        f.store.slow_gets(Duration::from_secs(1));

        // The trigger fires at 12:00 and is still waiting on the pump read.
        tokio::time::sleep(hours(4) + Duration::from_millis(500)).await;
        settle().await;
        f.scheduler.shutdown().await;
        f.pump.shutdown().await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;

        assert!(f.store.writes().is_empty(), "writes: {:?}", f.store.writes());
        assert_eq!(f.pump.state().await, PumpState::Idle);
        assert_eq!(f.scheduler.next_trigger().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn cannot_rearm_after_shutdown() {
        let f = fixture();
        f.scheduler.shutdown().await;
        automatic(&f).await;
        assert_eq!(f.scheduler.next_trigger().await, None);
    }
}
