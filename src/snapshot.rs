//! Periodic atomic persistence of closed candles, and startup restore.

use crate::core::error::AppError;
use crate::core::state::AppState;
use chrono::{FixedOffset, TimeZone, Utc};
use std::path::{Path, PathBuf};
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

const FIRST_WRITE_DELAY: Duration = Duration::from_secs(60);
const WRITE_INTERVAL: Duration = Duration::from_secs(300);

fn ist_offset() -> FixedOffset {
    FixedOffset::east_opt(5 * 3600 + 30 * 60).expect("IST offset is always valid")
}

/// Most recent IST midnight, expressed as a unix-ms boundary.
pub fn last_ist_midnight_ms() -> i64 {
    let offset = ist_offset();
    let now_ist = Utc::now().with_timezone(&offset);
    let midnight = offset
        .from_local_datetime(&now_ist.date_naive().and_hms_opt(0, 0, 0).unwrap())
        .single()
        .expect("local midnight is unambiguous in a fixed offset zone");
    midnight.timestamp_millis()
}

fn symbol_path(dir: &str, symbol: &str) -> PathBuf {
    Path::new(dir).join(format!("{symbol}.json"))
}

async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), AppError> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Write every engine's closed candles to `{SNAPSHOT_DIR}/{SYMBOL}.json`.
pub async fn write_all(state: &AppState) -> Result<(), AppError> {
    tokio::fs::create_dir_all(&state.config.snapshot_dir).await?;
    for symbol in state.registry.symbols() {
        let Some(engine) = state.registry.engine(&symbol) else {
            continue;
        };
        let candles = engine.closed_candle_snapshots(state.config.imbalance_ratio);
        drop(engine);

        let bytes = serde_json::to_vec(&candles)?;
        let path = symbol_path(&state.config.snapshot_dir, &symbol);
        atomic_write(&path, &bytes).await?;
    }
    Ok(())
}

/// Background task: write snapshots 60s after startup, then every 300s.
pub async fn run(state: AppState) {
    sleep(FIRST_WRITE_DELAY).await;
    loop {
        if let Err(e) = write_all(&state).await {
            warn!(error = %e, "snapshot write failed");
        }
        sleep(WRITE_INTERVAL).await;
    }
}

/// Restore closed candles for every currently-registered symbol, keeping
/// only candles at or after the most recent IST midnight. Call after
/// engines are instantiated and after the initial daily-reset check.
pub async fn restore_all(state: &AppState) {
    let cutoff = last_ist_midnight_ms();
    for symbol in state.registry.symbols() {
        let path = symbol_path(&state.config.snapshot_dir, &symbol);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(_) => continue,
        };
        let candles: Vec<crate::engine::CandleSnapshot> = match serde_json::from_slice(&bytes) {
            Ok(c) => c,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "failed to parse snapshot file; skipping");
                continue;
            }
        };
        let kept: Vec<_> = candles.into_iter().filter(|c| c.open_time >= cutoff).collect();
        if kept.is_empty() {
            continue;
        }
        if let Some(mut engine) = state.registry.engine_mut(&symbol) {
            let count = kept.len();
            engine.restore_from_snapshots(kept, state.config.max_candles_per_symbol);
            info!(symbol = %symbol, candles = count, "restored snapshot");
        }
    }
}

/// Delete every snapshot file in the snapshot directory (daily reset path).
pub async fn clear_all(dir: &str) -> Result<(), AppError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.path().extension().map(|e| e == "json").unwrap_or(false) {
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::AppConfig;
    use crate::engine::registry::Instrument;

    #[tokio::test]
    async fn write_then_restore_round_trips_closed_candles() {
        let dir = std::env::temp_dir().join(format!("footprint-snap-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let mut config = AppConfig::from_env().unwrap();
        config.snapshot_dir = dir.to_string_lossy().to_string();
        let state = AppState::new(config);

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

        let now = last_ist_midnight_ms() + 60_000;
        {
            let mut engine = state.registry.engine_mut("NIFTY").unwrap();
            engine.process_tick(
                crate::engine::TickInput {
                    ltp: 100.0,
                    bid: 0.0,
                    ask: 0.0,
                    ltq: 10.0,
                    ts_ms: now,
                    cumulative_volume: None,
                    oi: None,
                },
                60_000,
                1000,
                500,
            );
            engine.process_tick(
                crate::engine::TickInput {
                    ltp: 101.0,
                    bid: 0.0,
                    ask: 0.0,
                    ltq: 5.0,
                    ts_ms: now + 60_000,
                    cumulative_volume: None,
                    oi: None,
                },
                60_000,
                1000,
                500,
            );
        }

        write_all(&state).await.unwrap();

        let config2 = {
            let mut c = AppConfig::from_env().unwrap();
            c.snapshot_dir = dir.to_string_lossy().to_string();
            c
        };
        let state2 = AppState::new(config2);
        state2
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
        restore_all(&state2).await;

        let engine = state2.registry.engine("NIFTY").unwrap();
        assert_eq!(engine.closed_candles().len(), 1);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn restore_drops_candles_before_today() {
        let dir = std::env::temp_dir().join(format!("footprint-snap-old-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let stale = crate::engine::CandleSnapshot {
            open_time: 0,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            buy_vol: 1.0,
            sell_vol: 0.0,
            delta: 1.0,
            delta_min: 0.0,
            delta_max: 1.0,
            initiative: crate::engine::Side::Buy,
            oi: None,
            oi_change: None,
            closed: true,
            cvd: 1.0,
            levels: vec![],
        };
        let path = dir.join("NIFTY.json");
        tokio::fs::write(&path, serde_json::to_vec(&vec![stale]).unwrap())
            .await
            .unwrap();

        let mut config = AppConfig::from_env().unwrap();
        config.snapshot_dir = dir.to_string_lossy().to_string();
        let state = AppState::new(config);
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

        restore_all(&state).await;
        let engine = state.registry.engine("NIFTY").unwrap();
        assert_eq!(engine.closed_candles().len(), 0);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
