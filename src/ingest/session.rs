//! Upstream market-feed session manager: owns at most one outbound socket,
//! subscribes registered instruments, and reconnects with backoff.

use crate::core::state::AppState;
use crate::engine::registry::Instrument;
use crate::ingest::{decode, router, synthetic};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const SUBSCRIBE_CHUNK: usize = 100;
const AUTH_BACKOFF_FLOOR: Duration = Duration::from_secs(5);
const AUTH_BACKOFF_CAP: Duration = Duration::from_secs(1800);
const ERROR_BACKOFF: Duration = Duration::from_secs(5);
const IDLE_RETRY: Duration = Duration::from_millis(500);

/// Run the session loop forever. Exits only if the process is shutting
/// down; all transient failures are retried internally.
pub async fn run(state: AppState) {
    let mut auth_backoff = AUTH_BACKOFF_FLOOR;

    loop {
        if state.registry.is_empty() {
            sleep(IDLE_RETRY).await;
            continue;
        }

        if !state.has_credentials() {
            info!("no upstream credentials; running synthetic feed");
            synthetic::run_until_credentials(&state).await;
            continue;
        }

        match run_once(&state).await {
            Ok(()) => {
                auth_backoff = AUTH_BACKOFF_FLOOR;
            }
            Err(SessionError::Auth(msg)) => {
                warn!(error = %msg, backoff_s = auth_backoff.as_secs(), "upstream auth failure");
                tokio::select! {
                    _ = sleep(auth_backoff) => {
                        auth_backoff = (auth_backoff * 2).min(AUTH_BACKOFF_CAP);
                    }
                    _ = state.token_updated.notified() => {
                        info!("token rendezvous signaled; resuming immediately");
                        auth_backoff = AUTH_BACKOFF_FLOOR;
                    }
                }
            }
            Err(SessionError::Other(msg)) => {
                warn!(error = %msg, "upstream session error; retrying");
                sleep(ERROR_BACKOFF).await;
            }
        }
    }
}

enum SessionError {
    Auth(String),
    Other(String),
}

fn classify_error(text: &str) -> SessionError {
    let lower = text.to_ascii_lowercase();
    let is_auth = lower.contains("401")
        || lower.contains("403")
        || lower.contains("unauthorized")
        || lower.contains("invalid token")
        || lower.contains("token expired")
        || lower.contains("authentication failed")
        || lower.contains("rejected");
    if is_auth {
        SessionError::Auth(text.to_string())
    } else {
        SessionError::Other(text.to_string())
    }
}

async fn run_once(state: &AppState) -> Result<(), SessionError> {
    let (client_id, access_token) = {
        let creds = state.credentials.read().expect("credentials lock poisoned");
        (
            creds.client_id.clone().unwrap_or_default(),
            creds.access_token.clone().unwrap_or_default(),
        )
    };

    let url = format!(
        "{}?version=2&token={}&clientId={}&authType=2",
        state.config.upstream_ws_url,
        urlencoding::encode(&access_token),
        urlencoding::encode(&client_id),
    );

    info!(engines = state.registry.len(), "connecting upstream market feed");
    let (ws_stream, _resp) = tokio_tungstenite::connect_async(&url)
        .await
        .map_err(|e| classify_error(&e.to_string()))?;

    let (mut write, mut read) = ws_stream.split();

    // Subscribe before taking the instrument snapshot so nothing registered
    // in between is missed; a duplicate subscribe request is harmless.
    let mut new_instruments = state.instrument_added.subscribe();
    let instruments = state.registry.instruments();
    send_subscription(&mut write, &instruments, 17).await?;

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Binary(bin))) => {
                        if let Some(raw) = decode::decode_frame(&bin) {
                            if let Some(symbol) = router::route_tick(state, raw) {
                                crate::broadcast::maybe_broadcast(state, &symbol);
                            }
                        }
                    }
                    Some(Ok(Message::Text(txt))) => {
                        debug!(message = %txt, "upstream text frame");
                    }
                    Some(Ok(Message::Ping(p))) => {
                        write
                            .send(Message::Pong(p))
                            .await
                            .map_err(|e| SessionError::Other(e.to_string()))?;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                        info!(reason = %reason, "upstream closed connection");
                        return if reason.is_empty() {
                            Ok(())
                        } else {
                            Err(classify_error(&reason))
                        };
                    }
                    Some(Err(e)) => return Err(classify_error(&e.to_string())),
                    Some(_) => {}
                    None => return Ok(()),
                }
            }
            added = new_instruments.recv() => {
                match added {
                    Ok(instrument) => {
                        info!(symbol = %instrument.symbol, "sending subscription delta for newly added instrument");
                        send_subscription(&mut write, std::slice::from_ref(&instrument), 17).await?;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => continue,
                }
            }
        }
    }
}

/// Send instrument subscriptions in batches, pacing each batch so the
/// upstream isn't hit with one oversized message.
async fn send_subscription(
    write: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    instruments: &[Instrument],
    request_code: u8,
) -> Result<(), SessionError> {
    for chunk in instruments.chunks(SUBSCRIBE_CHUNK) {
        let list: Vec<_> = chunk
            .iter()
            .map(|i| {
                json!({
                    "ExchangeSegment": crate::ingest::session_segment_name(i.exchange_segment),
                    "SecurityId": i.security_id.to_string(),
                })
            })
            .collect();
        let packet = json!({
            "RequestCode": request_code,
            "InstrumentCount": chunk.len(),
            "InstrumentList": list,
        });
        write
            .send(Message::Text(packet.to_string()))
            .await
            .map_err(|e| SessionError::Other(e.to_string()))?;
        sleep(Duration::from_millis(100)).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_auth_keywords() {
        assert!(matches!(classify_error("401 Unauthorized"), SessionError::Auth(_)));
        assert!(matches!(classify_error("Token Expired"), SessionError::Auth(_)));
        assert!(matches!(classify_error("connection reset"), SessionError::Other(_)));
    }
}
