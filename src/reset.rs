//! Daily candle-history reset at IST midnight.

use crate::core::state::AppState;
use crate::snapshot;
use chrono::{FixedOffset, Utc};
use tokio::time::{sleep, Duration};
use tracing::info;

const POLL_INTERVAL: Duration = Duration::from_secs(300);

fn today_ist() -> chrono::NaiveDate {
    let offset = FixedOffset::east_opt(5 * 3600 + 30 * 60).expect("IST offset is always valid");
    Utc::now().with_timezone(&offset).date_naive()
}

/// Run once at startup (before the restore pass) so the first call only
/// seeds `last_reset_date` without wiping candles that are about to be
/// restored from snapshot.
pub async fn check_once(state: &AppState) {
    let today = today_ist();
    let mut last = state.last_reset_date.lock().expect("reset date lock poisoned");
    if last.is_none() {
        *last = Some(today);
    }
}

/// Background task: poll every 300s, resetting on an IST-midnight crossing.
pub async fn run(state: AppState) {
    loop {
        sleep(POLL_INTERVAL).await;
        maybe_reset(&state).await;
    }
}

async fn maybe_reset(state: &AppState) {
    let today = today_ist();
    let should_reset = {
        let last = state.last_reset_date.lock().expect("reset date lock poisoned");
        matches!(*last, Some(prev) if prev != today)
    };

    if !should_reset {
        return;
    }

    info!("IST midnight crossed; resetting candle history");
    state.registry.reset_all();
    if let Err(e) = snapshot::clear_all(&state.config.snapshot_dir).await {
        tracing::warn!(error = %e, "failed to clear snapshot directory during daily reset");
    }

    let mut last = state.last_reset_date.lock().expect("reset date lock poisoned");
    *last = Some(today);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::AppConfig;
    use crate::engine::registry::Instrument;
    use crate::engine::TickInput;

    #[tokio::test]
    async fn first_call_only_seeds_date_without_reset() {
        let state = AppState::new(AppConfig::from_env().unwrap());
        check_once(&state).await;
        assert!(state.last_reset_date.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn reset_clears_engine_candles_when_date_differs() {
        let state = AppState::new(AppConfig::from_env().unwrap());
        state
            .registry
            .subscribe(
                Instrument {
                    symbol: "NIFTY".into(),
                    security_id: 1,
                    exchange_segment: 1,
                },
                10,
            )
            .unwrap();
        {
            let mut engine = state.registry.engine_mut("NIFTY").unwrap();
            engine.process_tick(
                TickInput {
                    ltp: 100.0,
                    bid: 0.0,
                    ask: 0.0,
                    ltq: 1.0,
                    ts_ms: 0,
                    cumulative_volume: None,
                    oi: None,
                },
                60_000,
                1000,
                500,
            );
        }
        let yesterday = today_ist().pred_opt().unwrap();
        *state.last_reset_date.lock().unwrap() = Some(yesterday);

        maybe_reset(&state).await;

        let engine = state.registry.engine("NIFTY").unwrap();
        assert_eq!(engine.closed_candles().len(), 0);
        assert_eq!(engine.cvd, 0.0);
        assert_eq!(*state.last_reset_date.lock().unwrap(), Some(today_ist()));
    }
}
