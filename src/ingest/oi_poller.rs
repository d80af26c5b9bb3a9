//! Periodic REST open-interest poller. The upstream market-feed socket
//! carries OI for derivatives inconsistently, so this fills the gap by
//! polling the quote endpoint per exchange segment.

use crate::core::state::AppState;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

const SEGMENT_RATE_LIMIT: Duration = Duration::from_secs(1);

/// Map the legacy segment name some instrument lists still carry to the
/// REST API's current variant.
fn normalize_segment(segment: &str) -> String {
    if segment == "NSE_FO" {
        "NSE_FNO".to_string()
    } else {
        segment.to_string()
    }
}

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    #[serde(default)]
    data: HashMap<String, HashMap<String, QuoteEntry>>,
}

#[derive(Debug, Deserialize)]
struct QuoteEntry {
    #[serde(default)]
    oi: Option<f64>,
}

fn client_for(state: &AppState) -> Option<Client> {
    let creds = state.credentials.read().expect("credentials lock poisoned");
    let client_id = creds.client_id.clone()?;
    let access_token = creds.access_token.clone()?;
    drop(creds);

    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert("access-token", access_token.parse().ok()?);
    headers.insert("client-id", client_id.parse().ok()?);
    Client::builder()
        .timeout(Duration::from_secs(10))
        .default_headers(headers)
        .build()
        .ok()
}

/// Background task: poll every `OI_POLL_SEC` seconds.
pub async fn run(state: AppState) {
    loop {
        sleep(state.config.oi_poll_interval).await;
        if !state.has_credentials() {
            continue;
        }
        if let Err(e) = poll_once(&state).await {
            warn!(error = %e, "OI poll failed");
        }
    }
}

async fn poll_once(state: &AppState) -> Result<(), crate::core::error::AppError> {
    let Some(client) = client_for(state) else {
        return Ok(());
    };

    let instruments = state.registry.instruments();
    let mut by_segment: HashMap<String, Vec<u32>> = HashMap::new();
    for inst in &instruments {
        let segment = normalize_segment(crate::ingest::session_segment_name(inst.exchange_segment));
        by_segment.entry(segment).or_default().push(inst.security_id);
    }

    for (segment, ids) in by_segment {
        let url = format!("{}/marketfeed/quote", state.config.upstream_rest_base);
        let body = json!({ segment.clone(): ids });

        let resp = client.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            warn!(segment = %segment, status = %resp.status(), "OI poll segment request failed");
            sleep(SEGMENT_RATE_LIMIT).await;
            continue;
        }

        let parsed: QuoteResponse = resp.json().await?;
        if let Some(entries) = parsed.data.get(&segment) {
            for (security_id_str, entry) in entries {
                let Some(oi) = entry.oi.filter(|v| *v > 0.0) else {
                    continue;
                };
                let Ok(security_id) = security_id_str.parse::<u32>() else {
                    continue;
                };
                let Some(symbol) = state.registry.symbol_for_security_id(security_id) else {
                    continue;
                };
                if let Some(mut engine) = state.registry.engine_mut(&symbol) {
                    engine.update_oi(oi);
                    drop(engine);
                    crate::broadcast::maybe_broadcast(state, &symbol);
                } else {
                    debug!(symbol = %symbol, "OI update for symbol with no engine");
                }
            }
        }

        sleep(SEGMENT_RATE_LIMIT).await;
    }

    Ok(())
}
