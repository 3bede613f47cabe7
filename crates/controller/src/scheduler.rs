//! Scheduling: weekly sequence triggers, the periodic auto-water
//! sweep, and the optional daily moisture check.
//!
//! Triggers are one task per enabled schedule, rebuilt from scratch by
//! `reload()` whenever a schedule changes; there is no incremental
//! bookkeeping to get out of sync. A schedule that points at a deleted
//! sequence stays registered but logs and skips when it fires.
//!
//! All three paths go through the actuator, so the single-active-zone
//! rule and winter mode apply to scheduled watering exactly as they do
//! to manual starts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{Datelike, Local, NaiveDateTime};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::actuator::{start_with_auto_off, ZoneActuator, MAX_RUN_MINUTES};
use crate::db::{Db, Schedule};
use crate::decision;
use crate::error::ControlError;
use crate::sequence;
use crate::timers::TimerRegistry;
use crate::weather::WeatherService;

/// How often the auto-water sweep re-examines zones with readings.
const SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Gap between zones in the daily check, on top of the watering time.
const DAILY_ZONE_PAUSE: Duration = Duration::from_secs(2 * 60);

const DEFAULT_DAILY_TIME: &str = "04:00";

/// Rain probability (percent) above which the daily check stays dry.
/// Unlike schedule skipping this looks at the probability alone.
const DAILY_RAIN_LIMIT: i64 = 70;

const MINUTE: Duration = Duration::from_secs(60);

/// Cheap to clone; all clones share the same task registry.
#[derive(Clone)]
pub struct Scheduler {
    db: Db,
    weather: Arc<WeatherService>,
    actuator: Arc<ZoneActuator>,
    timers: Arc<TimerRegistry>,
    tasks: Arc<Tasks>,
}

#[derive(Default)]
struct Tasks {
    triggers: Mutex<HashMap<i64, JoinHandle<()>>>,
    daily: Mutex<Option<JoinHandle<()>>>,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

// ---------------------------------------------------------------------------
// Pure time helpers
// ---------------------------------------------------------------------------

/// Parse "HH:MM" into (hour, minute).
pub(crate) fn parse_time(time: &str) -> Option<(u32, u32)> {
    let (h, m) = time.split_once(':')?;
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    if hour < 24 && minute < 60 {
        Some((hour, minute))
    } else {
        None
    }
}

/// Next datetime strictly after `now` that falls on one of `days`
/// (0 = Sunday .. 6 = Saturday) at hour:minute local civil time.
pub(crate) fn next_occurrence(
    now: NaiveDateTime,
    days: &[u8],
    hour: u32,
    minute: u32,
) -> Option<NaiveDateTime> {
    if days.is_empty() {
        return None;
    }
    for offset in 0..=7u64 {
        let date = now.date() + chrono::Days::new(offset);
        if !days.contains(&(date.weekday().num_days_from_sunday() as u8)) {
            continue;
        }
        let candidate = date.and_hms_opt(hour, minute, 0)?;
        if candidate > now {
            return Some(candidate);
        }
    }
    None
}

fn until(next: NaiveDateTime, now: NaiveDateTime) -> Duration {
    (next - now).to_std().unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

impl Scheduler {
    pub fn new(
        db: Db,
        weather: Arc<WeatherService>,
        actuator: Arc<ZoneActuator>,
        timers: Arc<TimerRegistry>,
    ) -> Self {
        Self {
            db,
            weather,
            actuator,
            timers,
            tasks: Arc::new(Tasks::default()),
        }
    }

    // -- Weekly schedule triggers -------------------------------------------

    /// Rebuild every trigger from the database. Called at startup and
    /// after any schedule create/update/delete.
    pub async fn reload(&self) -> Result<usize> {
        {
            let mut triggers = self.tasks.triggers.lock().unwrap();
            for (_, handle) in triggers.drain() {
                handle.abort();
            }
        }

        let schedules = self.db.enabled_schedules().await?;
        let mut registered = 0;
        for schedule in schedules {
            let days = match schedule.parsed_days() {
                Ok(d) if !d.is_empty() => d,
                Ok(_) => {
                    warn!(schedule = schedule.id, "schedule has no days, not registered");
                    continue;
                }
                Err(e) => {
                    warn!(schedule = schedule.id, "schedule skipped: {e:#}");
                    continue;
                }
            };
            let Some((hour, minute)) = parse_time(&schedule.time) else {
                warn!(
                    schedule = schedule.id,
                    time = %schedule.time,
                    "schedule has malformed time, not registered"
                );
                continue;
            };

            let id = schedule.id;
            let handle = self.spawn_trigger(schedule, days, hour, minute);
            self.tasks.triggers.lock().unwrap().insert(id, handle);
            registered += 1;
        }

        info!(registered, "schedule triggers reloaded");
        Ok(registered)
    }

    fn spawn_trigger(
        &self,
        schedule: Schedule,
        days: Vec<u8>,
        hour: u32,
        minute: u32,
    ) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                let now = Local::now().naive_local();
                let Some(next) = next_occurrence(now, &days, hour, minute) else {
                    warn!(schedule = schedule.id, "no next occurrence, trigger stops");
                    return;
                };
                debug!(schedule = schedule.id, %next, "trigger armed");
                sleep(until(next, now)).await;
                scheduler.fire(&schedule).await;
            }
        })
    }

    /// Run one due schedule: winter and rain gates first, then the
    /// referenced sequence in a background task.
    pub(crate) async fn fire(&self, schedule: &Schedule) {
        let label = schedule.name.as_deref().unwrap_or("unnamed");

        if self.actuator.winter().is_enabled() {
            info!(schedule = schedule.id, label, "schedule skipped, winter mode");
            return;
        }
        if self.weather.should_skip().await {
            info!(schedule = schedule.id, label, "schedule skipped, rain expected");
            return;
        }

        let sequence = match self.db.get_sequence(schedule.sequence_id).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                warn!(
                    schedule = schedule.id,
                    sequence = schedule.sequence_id,
                    "schedule references a deleted sequence, skipped"
                );
                return;
            }
            Err(e) => {
                warn!(schedule = schedule.id, "sequence lookup failed: {e:#}");
                return;
            }
        };

        let steps = match sequence.parsed_steps() {
            Ok(s) => s,
            Err(e) => {
                warn!(schedule = schedule.id, "sequence unusable: {e:#}");
                return;
            }
        };

        info!(
            schedule = schedule.id,
            label,
            sequence = %sequence.name,
            steps = steps.len(),
            "schedule fired"
        );
        tokio::spawn(sequence::run(Arc::clone(&self.actuator), steps));
    }

    pub fn trigger_count(&self) -> usize {
        self.tasks.triggers.lock().unwrap().len()
    }

    // -- Auto-water sweep ----------------------------------------------------

    /// Periodic sweep over zones with known moisture. The first sweep
    /// runs one full interval after startup, not immediately.
    pub fn spawn_sweep_loop(&self) {
        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                sleep(SWEEP_INTERVAL).await;
                scheduler.auto_water_sweep().await;
            }
        });
        if let Some(old) = self.tasks.sweep.lock().unwrap().replace(handle) {
            old.abort();
        }
    }

    /// One sweep pass: every auto-water zone with a reading gets a
    /// fresh decision. A busy conflict means some zone is already
    /// watering; later zones get their turn on the next pass.
    pub async fn auto_water_sweep(&self) {
        if self.actuator.winter().is_enabled() {
            debug!("sweep skipped, winter mode");
            return;
        }
        let zones = match self.db.zones_with_moisture().await {
            Ok(z) => z,
            Err(e) => {
                warn!("sweep zone query failed: {e:#}");
                return;
            }
        };
        let weather = self.weather.current().await;

        for zone in zones
            .iter()
            .filter(|z| z.enabled && z.auto_water_enabled && !z.is_active)
        {
            let decision = decision::decide(zone, weather.as_ref(), self.weather.rain_threshold());
            if !decision.should_water {
                debug!(zone = zone.id, reason = %decision.reason, "sweep: not watering");
                continue;
            }
            let minutes = decision.duration_min.unwrap_or(zone.default_duration);
            match start_with_auto_off(&self.actuator, &self.timers, zone.id, minutes).await {
                Ok(_) => {
                    info!(zone = zone.id, minutes, reason = %decision.reason, "sweep: watering");
                }
                Err(ControlError::ZoneBusy { name }) => {
                    info!(zone = zone.id, busy = %name, "sweep: deferred to next pass");
                }
                Err(e) => warn!(zone = zone.id, "sweep start failed: {e}"),
            }
        }
    }

    // -- Daily check ---------------------------------------------------------

    /// (Re)arm the daily check from the settings table. Disabled or
    /// absent settings leave no task running.
    pub async fn reschedule_daily_check(&self) {
        if let Some(old) = self.tasks.daily.lock().unwrap().take() {
            old.abort();
        }

        let enabled = matches!(
            self.db.get_setting("daily_check_enabled").await,
            Ok(Some(v)) if v == "1" || v.eq_ignore_ascii_case("true")
        );
        if !enabled {
            info!("daily check disabled");
            return;
        }

        let time = match self.db.get_setting("daily_check_time").await {
            Ok(Some(t)) => t,
            _ => DEFAULT_DAILY_TIME.to_string(),
        };
        let Some((hour, minute)) = parse_time(&time) else {
            warn!(%time, "daily check time malformed, not armed");
            return;
        };

        info!(%time, "daily check armed");
        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            let every_day: Vec<u8> = (0..7).collect();
            loop {
                let now = Local::now().naive_local();
                let Some(next) = next_occurrence(now, &every_day, hour, minute) else {
                    return;
                };
                sleep(until(next, now)).await;
                scheduler.daily_check().await;
            }
        });
        *self.tasks.daily.lock().unwrap() = Some(handle);
    }

    /// Water every enabled zone that is at or below its threshold (or
    /// has no reading at all), one at a time, highest priority first.
    pub async fn daily_check(&self) {
        self.daily_check_with(MINUTE, DAILY_ZONE_PAUSE).await
    }

    /// Durations are injectable so tests run in milliseconds.
    async fn daily_check_with(&self, minute: Duration, pause: Duration) {
        if self.actuator.winter().is_enabled() {
            info!("daily check skipped, winter mode");
            return;
        }
        if let Some(w) = self.weather.current().await {
            if w.rain_today > DAILY_RAIN_LIMIT {
                info!(rain = w.rain_today, "daily check skipped, rain expected");
                return;
            }
        }

        let zones = match self.db.enabled_zones_by_priority().await {
            Ok(z) => z,
            Err(e) => {
                warn!("daily check zone query failed: {e:#}");
                return;
            }
        };

        info!(zones = zones.len(), "daily check started");
        for zone in zones {
            if let Some(moisture) = zone.moisture {
                if moisture > zone.moisture_threshold {
                    debug!(zone = zone.id, moisture, "daily check: moist enough");
                    continue;
                }
            }

            let watering = minute * zone.default_duration.clamp(1, MAX_RUN_MINUTES) as u32;
            match self.actuator.set_zone_state(zone.id, true).await {
                Ok(_) => {
                    info!(zone = zone.id, "daily check: watering");
                    let act = Arc::clone(&self.actuator);
                    let id = zone.id;
                    self.timers.arm(id, watering, async move {
                        if let Err(e) = act.set_zone_state(id, false).await {
                            warn!(zone = id, "daily check auto-off failed: {e}");
                        }
                    });
                    // Let the zone finish (plus soak-in gap) before the
                    // next one starts.
                    sleep(watering + pause).await;
                }
                Err(e) => warn!(zone = zone.id, "daily check start failed: {e}"),
            }
        }
        info!("daily check finished");
    }

    // -- Shutdown ------------------------------------------------------------

    /// Stop every background task. Active zones are deliberately left
    /// running; their auto-off lives in the timer registry, which the
    /// caller cancels separately.
    pub fn shutdown(&self) {
        for (_, handle) in self.tasks.triggers.lock().unwrap().drain() {
            handle.abort();
        }
        if let Some(handle) = self.tasks.daily.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.tasks.sweep.lock().unwrap().take() {
            handle.abort();
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
