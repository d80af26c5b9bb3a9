use super::config::AppConfig;
use crate::engine::registry::{EngineRegistry, Instrument};
use chrono::NaiveDate;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{broadcast, Notify};

/// Mutable upstream credentials, separate from the rest of `AppConfig` so a
/// `/api/settings` update (or an operator-supplied token refresh) can swap
/// them without touching anything else.
#[derive(Debug, Default)]
pub struct Credentials {
    pub client_id: Option<String>,
    pub access_token: Option<String>,
}

/// One message fanned out to every connected viewer socket.
pub type BroadcastMessage = Arc<str>;

/// Process-wide state, held behind `Arc` and passed into axum handlers via
/// the `State` extractor and into spawned tasks via plain clones.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<EngineRegistry>,
    pub credentials: Arc<RwLock<Credentials>>,

    /// Last IST calendar date a reset ran for; guards against double resets
    /// and lets the scheduler recover after a restart mid-day.
    pub last_reset_date: Arc<Mutex<Option<NaiveDate>>>,

    /// Per-symbol last-broadcast timestamp (unix ms), enforcing
    /// `BROADCAST_MIN_INTERVAL` independently per symbol.
    pub last_broadcast: Arc<DashMapMs>,

    /// Fan-out channel for viewer sockets; each connection subscribes its
    /// own receiver and prunes itself on send failure.
    pub viewer_tx: broadcast::Sender<BroadcastMessage>,

    /// Set whenever the token-update endpoint writes new credentials, so
    /// a session in auth backoff wakes immediately instead of waiting out
    /// the rest of its sleep.
    pub token_updated: Arc<Notify>,

    /// Fan-out of instruments subscribed while a session is already
    /// connected, so the upstream socket gets a paced subscription delta
    /// instead of waiting for the next reconnect to pick them up.
    pub instrument_added: broadcast::Sender<Instrument>,

    /// Runtime-adjustable candle width, independent of `config.candle_seconds`
    /// so a `/api/settings` update doesn't require mutating `AppConfig`
    /// itself. Seeded from config at startup.
    candle_seconds: Arc<AtomicU64>,
}

/// Thin alias so `last_broadcast` reads as a purpose-built type rather than
/// a bare `DashMap`.
pub type DashMapMs = dashmap::DashMap<String, i64>;

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let (viewer_tx, _rx) = broadcast::channel(1024);
        let (instrument_added, _rx2) = broadcast::channel(256);
        let candle_seconds = Arc::new(AtomicU64::new(config.candle_seconds));
        Self {
            credentials: Arc::new(RwLock::new(Credentials {
                client_id: config.upstream_client_id.clone(),
                access_token: config.upstream_access_token.clone(),
            })),
            config: Arc::new(config),
            registry: Arc::new(EngineRegistry::new()),
            last_reset_date: Arc::new(Mutex::new(None)),
            last_broadcast: Arc::new(DashMapMs::new()),
            viewer_tx,
            token_updated: Arc::new(Notify::new()),
            instrument_added,
            candle_seconds,
        }
    }

    pub fn candle_seconds(&self) -> u64 {
        self.candle_seconds.load(Ordering::Relaxed)
    }

    pub fn candle_ms(&self) -> i64 {
        (self.candle_seconds() * 1000) as i64
    }

    /// Apply a runtime `CANDLE_SECONDS` change: reject values outside
    /// `CANDLE_OPTIONS`, otherwise swap the width and drop in-flight candle
    /// boundaries so the next tick starts a fresh bucket at the new width.
    pub fn set_candle_seconds(&self, seconds: u64) -> Result<(), crate::core::error::AppError> {
        if !super::config::CANDLE_OPTIONS.contains(&seconds) {
            return Err(crate::core::error::AppError::InvalidEnv(
                "CANDLE_SECONDS",
                seconds.to_string(),
            ));
        }
        self.candle_seconds.store(seconds, Ordering::Relaxed);
        self.registry.clear_all_candles();
        Ok(())
    }

    pub fn has_credentials(&self) -> bool {
        let creds = self.credentials.read().expect("credentials lock poisoned");
        creds.client_id.is_some() && creds.access_token.is_some()
    }

    /// Write new upstream credentials and wake any session currently
    /// waiting out an auth backoff.
    pub fn set_credentials(&self, client_id: String, access_token: String) {
        let mut creds = self.credentials.write().expect("credentials lock poisoned");
        creds.client_id = Some(client_id);
        creds.access_token = Some(access_token);
        drop(creds);
        self.token_updated.notify_waiters();
    }

    /// Rate-gate a broadcast for `symbol`; returns `true` if the caller
    /// should actually send (and updates the stored timestamp to `now_ms`).
    pub fn should_broadcast(&self, symbol: &str, now_ms: i64) -> bool {
        let min_gap = self.config.broadcast_min_interval.as_millis() as i64;
        match self.last_broadcast.get(symbol) {
            Some(last) if now_ms - *last < min_gap => false,
            _ => {
                self.last_broadcast.insert(symbol.to_string(), now_ms);
                true
            }
        }
    }
}
