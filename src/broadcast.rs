//! Rate-gated fan-out of engine snapshots to connected viewer sockets.

use crate::core::state::AppState;
use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt};
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::{sleep, Duration};
use tracing::debug;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// Called after every engine update. Serializes and sends the snapshot to
/// all viewers at most once per `BROADCAST_MIN_INTERVAL` per symbol.
pub fn maybe_broadcast(state: &AppState, symbol: &str) {
    if !state.should_broadcast(symbol, now_ms()) {
        return;
    }

    let Some(engine) = state.registry.engine(symbol) else {
        return;
    };
    let snapshot = engine.get_state(
        state.config.broadcast_candles_limit,
        state.config.imbalance_ratio,
    );
    drop(engine);

    let payload = json!({"type": "orderflow", "data": snapshot});
    let Ok(text) = serde_json::to_string(&payload) else {
        return;
    };

    // send() only errors when there are no receivers (no viewers connected);
    // that's routine, not a fault.
    let _ = state.viewer_tx.send(text.into());
}

/// Send every engine's current snapshot directly to a newly-connected
/// viewer's write half, spacing sends so a large symbol set doesn't arrive
/// as one burst. Stops early if the socket closes.
pub async fn send_initial_snapshot<S>(state: &AppState, sink: &mut S)
where
    S: Sink<Message> + Unpin,
{
    for symbol in state.registry.symbols() {
        let Some(engine) = state.registry.engine(&symbol) else {
            continue;
        };
        let snapshot = engine.get_state(
            state.config.broadcast_candles_limit,
            state.config.imbalance_ratio,
        );
        drop(engine);

        let payload = json!({"type": "orderflow", "data": snapshot});
        match serde_json::to_string(&payload) {
            Ok(text) => {
                if sink.send(Message::Text(text)).await.is_err() {
                    debug!(symbol = %symbol, "viewer disconnected during initial snapshot send");
                    return;
                }
            }
            Err(e) => debug!(symbol = %symbol, error = %e, "failed to serialize initial snapshot"),
        }
        sleep(Duration::from_millis(20)).await;
    }
}
