//! Zone actuation: the single gate through which every zone start and
//! stop flows.
//!
//! The check-act-write sequence (read active zone, command relay,
//! commit state) is held under one async mutex, so concurrent start
//! attempts from schedules, sweeps, MQTT commands and the API resolve
//! to exactly one winner; later attempts fail with a Conflict naming
//! the running zone.
//!
//! Relay delivery is best-effort by policy: local state is
//! authoritative even when the backend is flaky, so a relay failure is
//! logged and the state transition still commits.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::db::{Db, Zone};
use crate::error::ControlError;
use crate::mqtt::StatusPublisher;
use crate::notify::{Event, Notifier};
use crate::relay::RelayBackend;

// ---------------------------------------------------------------------------
// Winter mode
// ---------------------------------------------------------------------------

/// Process-wide override: while enabled, every zone start is rejected
/// before any other logic runs.
#[derive(Clone, Default)]
pub struct WinterMode {
    inner: Arc<RwLock<WinterState>>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct WinterState {
    pub enabled: bool,
    pub activated_at: Option<DateTime<Utc>>,
}

impl WinterMode {
    pub fn is_enabled(&self) -> bool {
        self.inner.read().unwrap().enabled
    }

    pub fn state(&self) -> WinterState {
        self.inner.read().unwrap().clone()
    }

    pub fn set(&self, enabled: bool) -> WinterState {
        let mut st = self.inner.write().unwrap();
        st.enabled = enabled;
        st.activated_at = if enabled { Some(Utc::now()) } else { None };
        st.clone()
    }

    /// Restore persisted state without re-stamping activated_at.
    pub fn restore(&self, enabled: bool, activated_at: Option<DateTime<Utc>>) {
        let mut st = self.inner.write().unwrap();
        st.enabled = enabled;
        st.activated_at = activated_at;
    }
}

// ---------------------------------------------------------------------------
// Actuator
// ---------------------------------------------------------------------------

pub struct ZoneActuator {
    db: Db,
    relay: RelayBackend,
    notifier: Notifier,
    winter: WinterMode,
    status: Option<StatusPublisher>,
    /// Serializes the check-act-write sequence across all callers.
    gate: Mutex<()>,
}

impl ZoneActuator {
    pub fn new(
        db: Db,
        relay: RelayBackend,
        notifier: Notifier,
        winter: WinterMode,
        status: Option<StatusPublisher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            relay,
            notifier,
            winter,
            status,
            gate: Mutex::new(()),
        })
    }

    pub fn winter(&self) -> &WinterMode {
        &self.winter
    }

    #[cfg(test)]
    pub(crate) fn relay_for_tests(&self) -> &RelayBackend {
        &self.relay
    }

    /// Turn a zone on or off. Errors are terminal for the call;
    /// callers must not retry automatically.
    pub async fn set_zone_state(&self, zone_id: i64, on: bool) -> Result<Zone, ControlError> {
        if on && self.winter.is_enabled() {
            return Err(ControlError::WinterLock);
        }

        let _guard = self.gate.lock().await;

        let zone = self
            .db
            .get_zone(zone_id)
            .await?
            .ok_or(ControlError::ZoneNotFound(zone_id))?;

        if on {
            if let Some((_, name)) = self.db.active_zone_other_than(zone_id).await? {
                return Err(ControlError::ZoneBusy { name });
            }
        }

        // Best-effort physical command; local truth is authoritative.
        if let Err(e) = self.relay.set_output(&zone.relay_output, on).await {
            warn!(zone = zone_id, "relay command failed: {e:#}");
        }

        self.db.set_zone_active(zone_id, on).await?;

        // Re-read so callers see the committed row (is_active and the
        // last_watered stamp), not the pre-commit snapshot.
        let zone = self
            .db
            .get_zone(zone_id)
            .await?
            .ok_or(ControlError::ZoneNotFound(zone_id))?;

        if let Some(status) = &self.status {
            status.publish_zone_status(zone_id, on).await;
        }
        self.notifier.publish(Event::ZoneUpdate {
            zone_id,
            is_active: on,
        });

        info!(
            zone = zone_id,
            name = %zone.name,
            "zone {}",
            if on { "started" } else { "stopped" }
        );
        Ok(zone)
    }

    /// Turn off every active zone. Returns how many were stopped.
    /// Callers are responsible for cancelling timers first.
    pub async fn stop_all(&self) -> Result<usize, ControlError> {
        let ids = self.db.active_zone_ids().await?;
        for &id in &ids {
            self.set_zone_state(id, false).await?;
        }
        Ok(ids.len())
    }
}

/// Upper bound on a single watering run. Durations come in unchecked
/// over MQTT and from the database; anything longer is clamped.
pub(crate) const MAX_RUN_MINUTES: i64 = 24 * 60;

/// Start a zone and arm its auto-off timer in one step. The shared
/// entry point for MQTT commands, API starts and scheduler runs.
pub async fn start_with_auto_off(
    actuator: &Arc<ZoneActuator>,
    timers: &Arc<crate::timers::TimerRegistry>,
    zone_id: i64,
    minutes: i64,
) -> Result<Zone, ControlError> {
    let zone = actuator.set_zone_state(zone_id, true).await?;
    let act = Arc::clone(actuator);
    timers.arm(
        zone_id,
        std::time::Duration::from_secs(minutes.clamp(1, MAX_RUN_MINUTES) as u64 * 60),
        async move {
            if let Err(e) = act.set_zone_state(zone_id, false).await {
                warn!(zone = zone_id, "auto-off failed: {e}");
            }
        },
    );
    Ok(zone)
}

// ===========================================================================
// Tests
// ===========================================================================
