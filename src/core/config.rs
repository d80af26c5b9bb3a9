use super::error::AppError;
use std::time::Duration;

/// Candle durations accepted by `CANDLE_SECONDS` (1,5,10,15,30,45,60,120 min).
pub const CANDLE_OPTIONS: [u64; 8] = [60, 300, 600, 900, 1800, 2700, 3600, 7200];

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,

    pub candle_seconds: u64,
    pub imbalance_ratio: f64,
    pub max_candles_per_symbol: usize,
    pub broadcast_candles_limit: usize,
    pub max_levels_per_candle: usize,
    pub max_engines: usize,
    /// Accepted for config-surface parity with `GC_INTERVAL_TICKS`; the
    /// interval it gated (a forced tracing-GC pass) has no Rust analogue,
    /// since per-candle/per-level pruning here is inline, not batched.
    #[allow(dead_code)]
    pub gc_interval_ticks: u64,
    pub broadcast_min_interval: Duration,
    pub oi_poll_interval: Duration,
    pub snapshot_dir: String,

    pub upstream_client_id: Option<String>,
    pub upstream_access_token: Option<String>,
    pub upstream_ws_url: String,
    pub upstream_rest_base: String,

    pub instrument_csv_path: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let server_addr = env_or("SERVER_ADDR", "127.0.0.1:8080");

        let candle_seconds = env_parse_default("CANDLE_SECONDS", 60u64)?;
        if !CANDLE_OPTIONS.contains(&candle_seconds) {
            return Err(AppError::InvalidEnv(
                "CANDLE_SECONDS",
                format!("{candle_seconds} not in {CANDLE_OPTIONS:?}"),
            ));
        }

        let imbalance_ratio = env_parse_default("IMBALANCE_RATIO", 3.0f64)?;
        let max_candles_per_symbol = env_parse_default("MAX_CANDLES_PER_SYMBOL", 1000usize)?;
        let broadcast_candles_limit = env_parse_default("BROADCAST_CANDLES_LIMIT", 1000usize)?;
        let max_levels_per_candle = env_parse_default("MAX_LEVELS_PER_CANDLE", 500usize)?;
        let max_engines = env_parse_default("MAX_ENGINES", 1000usize)?;
        let gc_interval_ticks = env_parse_default("GC_INTERVAL_TICKS", 10_000u64)?;
        let broadcast_min_interval_s = env_parse_default("BROADCAST_MIN_INTERVAL", 0.1f64)?;
        let oi_poll_s = env_parse_default("OI_POLL_SEC", 10u64)?;
        let snapshot_dir = env_or("SNAPSHOT_DIR", "/data/snapshots");

        let upstream_client_id = std::env::var("UPSTREAM_CLIENT_ID")
            .ok()
            .filter(|s| !s.trim().is_empty());
        let upstream_access_token = std::env::var("UPSTREAM_ACCESS_TOKEN")
            .ok()
            .filter(|s| !s.trim().is_empty());
        let upstream_ws_url = env_or("UPSTREAM_WS_URL", "wss://api-feed.dhan.co");
        let upstream_rest_base = env_or("UPSTREAM_REST_BASE", "https://api.dhan.co/v2");

        let instrument_csv_path = std::env::var("INSTRUMENT_CSV_PATH")
            .ok()
            .filter(|s| !s.trim().is_empty());

        Ok(Self {
            server_addr,
            candle_seconds,
            imbalance_ratio,
            max_candles_per_symbol,
            broadcast_candles_limit,
            max_levels_per_candle,
            max_engines,
            gc_interval_ticks,
            broadcast_min_interval: Duration::from_secs_f64(broadcast_min_interval_s),
            oi_poll_interval: Duration::from_secs(oi_poll_s),
            snapshot_dir,
            upstream_client_id,
            upstream_access_token,
            upstream_ws_url,
            upstream_rest_base,
            instrument_csv_path,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse an env var with a default, tagging parse failures with `key`.
///
/// `key` must be a `'static` literal passed at each call site (env var names
/// are always literals here), so the error can hold it without an owned copy.
fn env_parse_default<T>(key: &'static str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
{
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::InvalidEnv(key, v)),
        _ => Ok(default),
    }
}
