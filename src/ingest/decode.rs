//! Binary market-feed frame decoding. See the dhan-style little-endian
//! 8-byte-header layout this mirrors.

/// One normalized tick extracted from a binary frame, keyed by the numeric
/// `security_id` the router maps back to a symbol.
#[derive(Debug, Clone, Copy)]
pub struct RawTick {
    pub security_id: u32,
    pub ltp: f32,
    pub ts_ms: i64,
    pub ltq: f32,
    pub cumulative_volume: Option<f32>,
    pub oi: Option<f32>,
}

#[inline(always)]
fn read_u8(data: &[u8], off: &mut usize) -> u8 {
    let v = data[*off];
    *off += 1;
    v
}

#[inline(always)]
fn read_u16_le(data: &[u8], off: &mut usize) -> u16 {
    let v = u16::from_le_bytes([data[*off], data[*off + 1]]);
    *off += 2;
    v
}

#[inline(always)]
fn read_u32_le(data: &[u8], off: &mut usize) -> u32 {
    let v = u32::from_le_bytes(data[*off..*off + 4].try_into().unwrap());
    *off += 4;
    v
}

#[inline(always)]
fn read_i16_le(data: &[u8], off: &mut usize) -> i16 {
    let v = i16::from_le_bytes([data[*off], data[*off + 1]]);
    *off += 2;
    v
}

#[inline(always)]
fn read_f32_le(data: &[u8], off: &mut usize) -> f32 {
    let v = f32::from_le_bytes(data[*off..*off + 4].try_into().unwrap());
    *off += 4;
    v
}

struct Header {
    feed_code: u8,
    msg_len: u16,
    #[allow(dead_code)]
    exchange_segment: u8,
    security_id: u32,
}

fn normalize_ts(raw_seconds: u32) -> i64 {
    raw_seconds as i64 * 1000
}

/// Decode one binary frame into a tick, if it is a recognized feed kind.
/// Unknown or malformed frames return `None` and are dropped by the caller
/// without aborting the session.
pub fn decode_frame(data: &[u8]) -> Option<RawTick> {
    if data.len() < 8 {
        return None;
    }
    let mut off = 0usize;
    let header = Header {
        feed_code: read_u8(data, &mut off),
        msg_len: read_u16_le(data, &mut off),
        exchange_segment: read_u8(data, &mut off),
        security_id: read_u32_le(data, &mut off),
    };
    let payload = &data[8..];

    match header.feed_code {
        // Ticker
        2 => {
            if payload.len() < 8 {
                return None;
            }
            let mut p = 0;
            let ltp = read_f32_le(payload, &mut p);
            let ts_raw = read_u32_le(payload, &mut p);
            Some(RawTick {
                security_id: header.security_id,
                ltp,
                ts_ms: normalize_ts(ts_raw),
                ltq: 0.0,
                cumulative_volume: None,
                oi: None,
            })
        }
        // Quote
        4 => {
            if payload.len() < 42 {
                return None;
            }
            let mut p = 0;
            let ltp = read_f32_le(payload, &mut p);
            let ltq = read_i16_le(payload, &mut p);
            let ltt = read_u32_le(payload, &mut p);
            let _atp = read_f32_le(payload, &mut p);
            let volume = read_u32_le(payload, &mut p);
            let _total_sell_qty = read_u32_le(payload, &mut p);
            let _total_buy_qty = read_u32_le(payload, &mut p);
            let _day_open = read_f32_le(payload, &mut p);
            let _day_close = read_f32_le(payload, &mut p);
            let _day_high = read_f32_le(payload, &mut p);
            let _day_low = read_f32_le(payload, &mut p);

            let oi = if header.msg_len as usize >= 54 && payload.len() >= p + 4 {
                let raw_oi = read_u32_le(payload, &mut p);
                if raw_oi > 0 && raw_oi <= 100_000_000 {
                    Some(raw_oi as f32)
                } else {
                    None
                }
            } else {
                None
            };

            Some(RawTick {
                security_id: header.security_id,
                ltp,
                ts_ms: normalize_ts(ltt),
                ltq: ltq.max(0) as f32,
                cumulative_volume: Some(volume as f32),
                oi,
            })
        }
        _ => None,
    }
}
