use axum::{
    routing::{delete, get, post},
    Router,
};

pub fn router() -> Router<crate::core::AppState> {
    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/subscribe", post(subscribe::subscribe))
        .route("/api/subscribe/:symbol", delete(subscribe::unsubscribe))
        .route("/api/state/:symbol", get(state::get_state))
        .route("/api/settings", get(settings::get_settings).post(settings::update_settings))
        .route("/api/credentials", post(credentials::update_credentials))
        .route("/ws", get(viewer_ws::handler))
}

mod health {
    use axum::{extract::State, Json};
    use serde_json::json;

    use crate::core::AppState;

    pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
        let last_reset = state
            .last_reset_date
            .lock()
            .expect("reset date lock poisoned")
            .map(|d| d.to_string());

        Json(json!({
            "status": "ok",
            "engines": state.registry.len(),
            "mode": if state.has_credentials() { "live" } else { "demo" },
            "last_reset_date": last_reset,
            "viewers": state.viewer_tx.receiver_count(),
        }))
    }
}

mod subscribe {
    use axum::{
        extract::{Path, State},
        http::StatusCode,
        Json,
    };
    use serde::Deserialize;
    use serde_json::json;

    use crate::core::{AppError, AppState};
    use crate::engine::registry::Instrument;

    #[derive(Debug, Deserialize)]
    pub struct SubscribeRequest {
        pub symbol: String,
        pub security_id: u32,
        #[serde(default = "default_segment")]
        pub exchange_segment: u8,
    }

    fn default_segment() -> u8 {
        2 // NSE_FNO
    }

    pub async fn subscribe(
        State(state): State<AppState>,
        Json(req): Json<SubscribeRequest>,
    ) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
        let symbol = req.symbol.trim().to_ascii_uppercase();
        if symbol.is_empty() {
            return Err((StatusCode::BAD_REQUEST, "symbol must not be empty".to_string()));
        }

        let instrument = Instrument {
            symbol: symbol.clone(),
            security_id: req.security_id,
            exchange_segment: req.exchange_segment,
        };
        state
            .registry
            .subscribe(instrument.clone(), state.config.max_engines)
            .map_err(|e| match e {
                AppError::CapacityReached(n) => (StatusCode::SERVICE_UNAVAILABLE, format!("capacity reached ({n})")),
                e => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            })?;
        // No receiver (idle or synthetic mode) just means there's no live
        // socket to send a delta on yet; the next connect picks it up.
        let _ = state.instrument_added.send(instrument);

        Ok(Json(json!({"status": "subscribed", "symbol": symbol})))
    }

    pub async fn unsubscribe(
        State(state): State<AppState>,
        Path(symbol): Path<String>,
    ) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
        let symbol = symbol.trim().to_ascii_uppercase();
        state
            .registry
            .unsubscribe(&symbol)
            .map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))?;
        Ok(Json(json!({"status": "unsubscribed", "symbol": symbol})))
    }
}

mod state {
    use axum::{
        extract::{Path, State},
        http::StatusCode,
        Json,
    };

    use crate::core::AppState;
    use crate::engine::EngineSnapshot;

    pub async fn get_state(
        State(state): State<AppState>,
        Path(symbol): Path<String>,
    ) -> Result<Json<EngineSnapshot>, (StatusCode, String)> {
        let symbol = symbol.trim().to_ascii_uppercase();
        let engine = state
            .registry
            .engine(&symbol)
            .ok_or((StatusCode::NOT_FOUND, "symbol not subscribed".to_string()))?;
        Ok(Json(engine.get_state(state.config.broadcast_candles_limit, state.config.imbalance_ratio)))
    }
}

mod settings {
    use axum::{extract::State, http::StatusCode, Json};
    use serde::{Deserialize, Serialize};

    use crate::core::AppState;

    #[derive(Debug, Serialize)]
    pub struct SettingsResponse {
        candle_seconds: u64,
        imbalance_ratio: f64,
    }

    #[derive(Debug, Deserialize)]
    pub struct SettingsUpdate {
        candle_seconds: u64,
    }

    pub async fn get_settings(State(state): State<AppState>) -> Json<SettingsResponse> {
        Json(SettingsResponse {
            candle_seconds: state.candle_seconds(),
            imbalance_ratio: state.config.imbalance_ratio,
        })
    }

    pub async fn update_settings(
        State(state): State<AppState>,
        Json(req): Json<SettingsUpdate>,
    ) -> Result<Json<SettingsResponse>, (StatusCode, String)> {
        state
            .set_candle_seconds(req.candle_seconds)
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
        Ok(Json(SettingsResponse {
            candle_seconds: state.candle_seconds(),
            imbalance_ratio: state.config.imbalance_ratio,
        }))
    }
}

mod credentials {
    use axum::{extract::State, Json};
    use serde::{Deserialize, Serialize};

    use crate::core::AppState;

    #[derive(Debug, Deserialize)]
    pub struct CredentialsUpdate {
        pub client_id: String,
        pub access_token: String,
    }

    #[derive(Debug, Serialize)]
    pub struct CredentialsResponse {
        status: &'static str,
    }

    /// Refresh upstream credentials and wake a session stuck in auth
    /// backoff so it retries immediately with the new token.
    pub async fn update_credentials(
        State(state): State<AppState>,
        Json(req): Json<CredentialsUpdate>,
    ) -> Json<CredentialsResponse> {
        state.set_credentials(req.client_id, req.access_token);
        Json(CredentialsResponse { status: "updated" })
    }
}

mod viewer_ws {
    use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
    use axum::extract::State;
    use axum::response::IntoResponse;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use tracing::{debug, info};

    use crate::broadcast;
    use crate::core::AppState;

    pub async fn handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
        ws.on_upgrade(move |socket| handle_socket(socket, state))
    }

    async fn handle_socket(socket: WebSocket, state: AppState) {
        let (mut sink, mut stream) = socket.split();
        let mut rx = state.viewer_tx.subscribe();

        info!(viewers = state.viewer_tx.receiver_count(), "viewer connected");

        broadcast::send_initial_snapshot(&state, &mut sink).await;

        loop {
            tokio::select! {
                broadcast_msg = rx.recv() => {
                    match broadcast_msg {
                        Ok(text) => {
                            if sink.send(Message::Text(text.to_string())).await.is_err() {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Text(txt))) => {
                            if let Ok(v) = serde_json::from_str::<serde_json::Value>(&txt) {
                                if v.get("type").and_then(|t| t.as_str()) == Some("ping") {
                                    let _ = sink.send(Message::Text(json!({"type": "pong"}).to_string())).await;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(error = %e, "viewer socket read error");
                            break;
                        }
                    }
                }
            }
        }

        info!(viewers = state.viewer_tx.receiver_count().saturating_sub(1), "viewer disconnected");
    }
}
