use crate::core::state::AppState;
use crate::engine::TickInput;
use crate::ingest::decode::RawTick;

/// Route one decoded tick to its symbol's engine, then rate-gate a
/// broadcast. Drops the tick silently if its security id has no
/// subscription, or if `ltp` is non-positive.
pub fn route_tick(state: &AppState, raw: RawTick) -> Option<String> {
    if raw.ltp <= 0.0 {
        return None;
    }
    let symbol = state.registry.symbol_for_security_id(raw.security_id)?;
    let mut engine = state.registry.engine_mut(&symbol)?;

    let tick = TickInput {
        ltp: raw.ltp as f64,
        bid: 0.0,
        ask: 0.0,
        ltq: raw.ltq as f64,
        ts_ms: raw.ts_ms,
        cumulative_volume: raw.cumulative_volume.map(|v| v as f64),
        oi: raw.oi.map(|v| v as f64),
    };

    engine.process_tick(
        tick,
        state.candle_ms(),
        state.config.max_candles_per_symbol,
        state.config.max_levels_per_candle,
    );
    drop(engine);

    Some(symbol)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::AppConfig;
    use crate::engine::registry::Instrument;

    fn test_state() -> AppState {
        let config = AppConfig::from_env().unwrap();
        AppState::new(config)
    }

    #[test]
    fn drops_tick_for_unknown_security_id() {
        let state = test_state();
        let raw = RawTick {
            security_id: 99,
            ltp: 100.0,
            ts_ms: 0,
            ltq: 1.0,
            cumulative_volume: None,
            oi: None,
        };
        assert_eq!(route_tick(&state, raw), None);
    }

    #[test]
    fn drops_tick_with_non_positive_ltp() {
        let state = test_state();
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
        let raw = RawTick {
            security_id: 1,
            ltp: 0.0,
            ts_ms: 0,
            ltq: 1.0,
            cumulative_volume: None,
            oi: None,
        };
        assert_eq!(route_tick(&state, raw), None);
    }

    #[test]
    fn routes_known_tick_into_engine() {
        let state = test_state();
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
        let raw = RawTick {
            security_id: 1,
            ltp: 100.0,
            ts_ms: 0,
            ltq: 5.0,
            cumulative_volume: None,
            oi: None,
        };
        assert_eq!(route_tick(&state, raw), Some("NIFTY".to_string()));
        let engine = state.registry.engine("NIFTY").unwrap();
        assert_eq!(engine.tick_count, 1);
    }
}
