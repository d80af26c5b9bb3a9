use super::SymbolEngine;
use crate::core::error::AppError;
use dashmap::DashMap;
use dashmap::mapref::one::{Ref, RefMut};

/// Everything needed to route a decoded tick back to its symbol and, for
/// Dhan-style feeds, to re-subscribe after a reconnect.
#[derive(Debug, Clone)]
pub struct Instrument {
    pub symbol: String,
    pub security_id: u32,
    pub exchange_segment: u8,
}

/// Concurrent symbol -> engine map, guarded against unbounded growth by
/// `max_engines`. Mirrors the teacher's dashmap-backed tick store, generalized
/// to hold footprint engines instead of raw tick buffers.
#[derive(Debug, Default)]
pub struct EngineRegistry {
    engines: DashMap<String, SymbolEngine>,
    instruments: DashMap<String, Instrument>,
    by_security_id: DashMap<u32, String>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Register a symbol for ingestion, creating its engine if absent.
    /// Returns `CapacityReached` if `max_engines` would be exceeded.
    pub fn subscribe(&self, instrument: Instrument, max_engines: usize) -> Result<(), AppError> {
        if !self.engines.contains_key(&instrument.symbol) && self.engines.len() >= max_engines {
            return Err(AppError::CapacityReached(max_engines));
        }
        self.engines
            .entry(instrument.symbol.clone())
            .or_insert_with(|| SymbolEngine::new(&instrument.symbol));
        self.by_security_id
            .insert(instrument.security_id, instrument.symbol.clone());
        self.instruments.insert(instrument.symbol.clone(), instrument);
        Ok(())
    }

    pub fn unsubscribe(&self, symbol: &str) -> Result<(), AppError> {
        let (_, instrument) = self
            .instruments
            .remove(symbol)
            .ok_or_else(|| AppError::UnknownSymbol(symbol.to_string()))?;
        self.by_security_id.remove(&instrument.security_id);
        self.engines.remove(symbol);
        Ok(())
    }

    pub fn symbol_for_security_id(&self, security_id: u32) -> Option<String> {
        self.by_security_id.get(&security_id).map(|s| s.clone())
    }

    pub fn engine(&self, symbol: &str) -> Option<Ref<'_, String, SymbolEngine>> {
        self.engines.get(symbol)
    }

    pub fn engine_mut(&self, symbol: &str) -> Option<RefMut<'_, String, SymbolEngine>> {
        self.engines.get_mut(symbol)
    }

    /// Snapshot of subscribed symbols, taken once and handed to callers
    /// instead of holding a live iterator over the map while broadcasting.
    pub fn symbols(&self) -> Vec<String> {
        self.instruments.iter().map(|e| e.key().clone()).collect()
    }

    pub fn instruments(&self) -> Vec<Instrument> {
        self.instruments.iter().map(|e| e.value().clone()).collect()
    }

    /// Daily reset: wipe candle history on every engine, keep identity and
    /// subscriptions.
    pub fn reset_all(&self) {
        for mut entry in self.engines.iter_mut() {
            entry.value_mut().reset();
        }
    }

    /// Runtime `CANDLE_SECONDS` change: drop in-flight candle boundaries so
    /// the next tick starts a fresh bucket at the new width.
    pub fn clear_all_candles(&self) {
        for mut entry in self.engines.iter_mut() {
            entry.value_mut().clear_candles();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(symbol: &str, id: u32) -> Instrument {
        Instrument {
            symbol: symbol.to_string(),
            security_id: id,
            exchange_segment: 1,
        }
    }

    #[test]
    fn capacity_reached_blocks_new_symbol() {
        let reg = EngineRegistry::new();
        reg.subscribe(inst("A", 1), 1).unwrap();
        let err = reg.subscribe(inst("B", 2), 1).unwrap_err();
        assert!(matches!(err, AppError::CapacityReached(1)));
    }

    #[test]
    fn resubscribe_same_symbol_does_not_hit_capacity() {
        let reg = EngineRegistry::new();
        reg.subscribe(inst("A", 1), 1).unwrap();
        reg.subscribe(inst("A", 1), 1).unwrap();
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn unsubscribe_unknown_symbol_errors() {
        let reg = EngineRegistry::new();
        let err = reg.unsubscribe("A").unwrap_err();
        assert!(matches!(err, AppError::UnknownSymbol(_)));
    }

    #[test]
    fn security_id_lookup_round_trips() {
        let reg = EngineRegistry::new();
        reg.subscribe(inst("A", 42), 10).unwrap();
        assert_eq!(reg.symbol_for_security_id(42).as_deref(), Some("A"));
        reg.unsubscribe("A").unwrap();
        assert_eq!(reg.symbol_for_security_id(42), None);
    }
}
