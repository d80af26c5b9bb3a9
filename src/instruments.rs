//! Optional startup auto-subscribe from a CSV instrument list. Only NSE
//! futures and MCX commodity rows are picked up; other rows are ignored.

use crate::core::error::AppError;
use crate::core::state::AppState;
use crate::engine::registry::Instrument;
use csv::ReaderBuilder;
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct StockRow {
    symbol: String,
    security_id: String,
    #[serde(default)]
    exchange: String,
    #[serde(default)]
    segment: String,
    #[serde(default)]
    instrument: String,
}

fn segment_for(row: &StockRow) -> Option<u8> {
    let exch = row.exchange.trim().to_ascii_uppercase();
    let instr = row.instrument.trim().to_ascii_uppercase();
    let seg = row.segment.trim().to_ascii_uppercase();

    if exch == "MCX" {
        return Some(4); // MCX_COMM
    }
    if exch == "NSE" && (instr.contains("FUT") || seg == "D") {
        return Some(2); // NSE_FNO
    }
    None
}

/// Load `path` and subscribe every matching row, up to `MAX_ENGINES`. A
/// missing file is not an error; auto-subscribe is optional.
pub async fn auto_subscribe(state: &AppState, path: &str) -> Result<(), AppError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path, "instrument CSV not found; skipping auto-subscribe");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(bytes.as_slice());
    let mut count = 0usize;
    for record in reader.deserialize::<StockRow>() {
        let row: StockRow = record?;
        let symbol = row.symbol.trim().to_ascii_uppercase();
        let security_id_str = row.security_id.trim().to_string();
        if symbol.is_empty() || security_id_str.is_empty() {
            continue;
        }
        let Some(exchange_segment) = segment_for(&row) else {
            continue;
        };
        let Ok(security_id) = security_id_str.parse::<u32>() else {
            continue;
        };

        match state.registry.subscribe(
            Instrument {
                symbol,
                security_id,
                exchange_segment,
            },
            state.config.max_engines,
        ) {
            Ok(()) => count += 1,
            Err(AppError::CapacityReached(_)) => break,
            Err(e) => return Err(e),
        }
    }

    info!(count, path, "auto-subscribed instruments from CSV");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::AppConfig;

    #[tokio::test]
    async fn subscribes_only_matching_rows() {
        let dir = std::env::temp_dir().join(format!("footprint-csv-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("stock_list.csv");
        tokio::fs::write(
            &path,
            "symbol,security_id,exchange,segment,instrument\n\
             NIFTY,1001,NSE,D,FUTIDX\n\
             GOLD,2001,MCX,,FUTCOM\n\
             RELIANCE,3001,NSE,E,EQ\n",
        )
        .await
        .unwrap();

        let state = AppState::new(AppConfig::from_env().unwrap());
        auto_subscribe(&state, path.to_str().unwrap()).await.unwrap();

        assert_eq!(state.registry.len(), 2);
        assert!(state.registry.engine("NIFTY").is_some());
        assert!(state.registry.engine("GOLD").is_some());
        assert!(state.registry.engine("RELIANCE").is_none());

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn missing_file_is_not_an_error() {
        let state = AppState::new(AppConfig::from_env().unwrap());
        auto_subscribe(&state, "/nonexistent/path.csv").await.unwrap();
        assert_eq!(state.registry.len(), 0);
    }
}
