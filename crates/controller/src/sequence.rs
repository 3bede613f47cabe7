//! Sequence runner: waters an ordered list of (zone, duration) steps
//! strictly one after another, with a short pause between steps.
//!
//! A failed step (conflict, unknown zone) is logged and the run moves
//! on; one zone must not take down the rest of the sequence. Callers
//! spawn the run and return immediately. Two overlapping runs are not
//! serialized here; the actuator's single-active-zone rule makes the
//! loser fail fast instead of queueing.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::actuator::{ZoneActuator, MAX_RUN_MINUTES};
use crate::db::SequenceStep;

/// Pause between consecutive steps.
pub const STEP_PAUSE: Duration = Duration::from_secs(2);

const MINUTE: Duration = Duration::from_secs(60);

pub async fn run(actuator: Arc<ZoneActuator>, steps: Vec<SequenceStep>) {
    run_with(actuator, steps, MINUTE, STEP_PAUSE).await
}

/// Durations are injectable so tests run in milliseconds.
async fn run_with(
    actuator: Arc<ZoneActuator>,
    steps: Vec<SequenceStep>,
    minute: Duration,
    pause: Duration,
) {
    info!(steps = steps.len(), "sequence started");

    for step in steps {
        match actuator.set_zone_state(step.zone_id, true).await {
            Ok(_) => {
                sleep(minute * step.duration.clamp(0, MAX_RUN_MINUTES) as u32).await;
                if let Err(e) = actuator.set_zone_state(step.zone_id, false).await {
                    warn!(zone = step.zone_id, "failed to stop sequence step: {e}");
                }
            }
            Err(e) => {
                warn!(zone = step.zone_id, "sequence step skipped: {e}");
            }
        }
        sleep(pause).await;
    }

    info!("sequence finished");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::WinterMode;
    use crate::db::Db;
    use crate::notify::Notifier;
    use crate::relay::{MockRelay, RelayBackend};

    async fn test_actuator() -> Arc<ZoneActuator> {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.init_schema().await.unwrap();
        ZoneActuator::new(
            db,
            RelayBackend::Mock(MockRelay::new()),
            Notifier::new(),
            WinterMode::default(),
            None,
        )
    }

    fn relay_calls(actuator: &ZoneActuator) -> Vec<(String, bool)> {
        // Test-only peek through the actuator at the mock relay.
        match actuator.relay_for_tests() {
            RelayBackend::Mock(mock) => mock.calls.lock().unwrap().clone(),
            _ => panic!("expected mock relay"),
        }
    }

    fn step(zone_id: i64, duration: i64) -> SequenceStep {
        SequenceStep { zone_id, duration }
    }

    #[tokio::test]
    async fn steps_run_strictly_in_order() {
        let act = test_actuator().await;
        let t0 = std::time::Instant::now();

        run_with(
            Arc::clone(&act),
            vec![step(1, 1), step(2, 1)],
            Duration::from_millis(30),
            Duration::from_millis(25),
        )
        .await;

        // Each zone fully on/off before the next starts.
        assert_eq!(
            relay_calls(&act),
            vec![
                ("IrrigationValve1".to_string(), true),
                ("IrrigationValve1".to_string(), false),
                ("IrrigationValve2".to_string(), true),
                ("IrrigationValve2".to_string(), false),
            ]
        );
        // Two durations plus two inter-step pauses.
        assert!(t0.elapsed() >= Duration::from_millis(2 * 30 + 2 * 25));
    }

    #[tokio::test]
    async fn next_step_waits_for_pause() {
        let act = test_actuator().await;

        let runner = tokio::spawn(run_with(
            Arc::clone(&act),
            vec![step(1, 1), step(2, 1)],
            Duration::from_millis(30),
            Duration::from_millis(100),
        ));

        // Step 1 done, but still inside the inter-step pause.
        sleep(Duration::from_millis(60)).await;
        let calls = relay_calls(&act);
        assert_eq!(calls.len(), 2, "zone 2 must not start during the pause");

        runner.await.unwrap();
        assert_eq!(relay_calls(&act).len(), 4);
    }

    #[tokio::test]
    async fn failed_step_does_not_abort_sequence() {
        let act = test_actuator().await;
        // Zone 5 already running: step 1 will conflict, step 5 is the
        // same zone and restarts fine.
        act.set_zone_state(5, true).await.unwrap();

        run_with(
            Arc::clone(&act),
            vec![step(1, 1), step(5, 1)],
            Duration::from_millis(10),
            Duration::from_millis(5),
        )
        .await;

        let calls = relay_calls(&act);
        // Initial start of 5, then the step's own on/off. Zone 1 never
        // reached the relay.
        assert!(!calls.iter().any(|(ch, _)| ch == "IrrigationValve1"));
        assert_eq!(calls.last().unwrap(), &("IrrigationValve5".to_string(), false));
    }

    #[tokio::test]
    async fn unknown_zone_step_skipped() {
        let act = test_actuator().await;

        run_with(
            Arc::clone(&act),
            vec![step(99, 1), step(1, 1)],
            Duration::from_millis(10),
            Duration::from_millis(5),
        )
        .await;

        let calls = relay_calls(&act);
        assert_eq!(
            calls,
            vec![
                ("IrrigationValve1".to_string(), true),
                ("IrrigationValve1".to_string(), false),
            ]
        );
    }

    #[tokio::test]
    async fn oversized_step_duration_is_clamped() {
        let act = test_actuator().await;

        // Stored as i64; a bogus value must not overflow the sleep math
        // or stall the run.
        run_with(
            Arc::clone(&act),
            vec![step(1, i64::MAX)],
            Duration::from_micros(1),
            Duration::from_millis(1),
        )
        .await;

        assert_eq!(
            relay_calls(&act),
            vec![
                ("IrrigationValve1".to_string(), true),
                ("IrrigationValve1".to_string(), false),
            ]
        );
    }

    #[tokio::test]
    async fn empty_sequence_completes_immediately() {
        let act = test_actuator().await;
        run_with(
            Arc::clone(&act),
            vec![],
            Duration::from_millis(10),
            Duration::from_millis(5),
        )
        .await;
        assert!(relay_calls(&act).is_empty());
    }
}
