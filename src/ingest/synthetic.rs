//! Process-internal synthetic feed, used whenever upstream credentials are
//! absent. Feeds the same engine pipeline as the live feed so downstream
//! consumers see an identical contract.

use crate::core::state::AppState;
use crate::engine::TickInput;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::{sleep, Duration};

const ROTATION_BATCH: usize = 40;
const TICK_INTERVAL: Duration = Duration::from_millis(250);
const SIGMA: f64 = 5.0;
const SPREAD: f64 = 0.5;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// Standard-normal sample via Box-Muller, avoiding a dependency on `rand_distr`
/// for a single distribution.
fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

/// Runs until credentials appear (checked once per rotation), generating
/// ticks for every registered symbol on a Gaussian random walk.
pub async fn run_until_credentials(state: &AppState) {
    let mut rng = StdRng::from_entropy();
    let mut last_price: HashMap<String, f64> = HashMap::new();

    while !state.has_credentials() {
        let symbols = state.registry.symbols();
        if symbols.is_empty() {
            sleep(TICK_INTERVAL).await;
            continue;
        }

        for batch in symbols.chunks(ROTATION_BATCH) {
            if state.has_credentials() {
                return;
            }
            for symbol in batch {
                let base = *last_price.entry(symbol.clone()).or_insert(100.0);
                let walked = (base + standard_normal(&mut rng) * SIGMA).max(0.05);
                last_price.insert(symbol.clone(), walked);

                let bid = (walked - SPREAD).max(0.0);
                let ask = walked + SPREAD;
                let qty = rng.gen_range(50.0..=500.0);

                if let Some(mut engine) = state.registry.engine_mut(symbol) {
                    engine.process_tick(
                        TickInput {
                            ltp: walked,
                            bid,
                            ask,
                            ltq: qty,
                            ts_ms: now_ms(),
                            cumulative_volume: None,
                            oi: None,
                        },
                        state.candle_ms(),
                        state.config.max_candles_per_symbol,
                        state.config.max_levels_per_candle,
                    );
                    drop(engine);
                    crate::broadcast::maybe_broadcast(state, symbol);
                }
            }
            sleep(TICK_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_normal_is_finite_and_bounded() {
        let mut rng = StdRng::from_entropy();
        for _ in 0..1000 {
            let v = standard_normal(&mut rng);
            assert!(v.is_finite());
            assert!(v.abs() < 10.0);
        }
    }
}
