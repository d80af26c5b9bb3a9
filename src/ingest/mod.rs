pub mod decode;
pub mod oi_poller;
pub mod router;
pub mod session;
pub mod synthetic;

/// Map the registry's numeric exchange-segment byte to the upstream's
/// REST/WS segment name. Shared by the session manager (WS subscribe
/// payloads) and the OI poller (REST grouping).
pub fn session_segment_name(segment: u8) -> &'static str {
    match segment {
        1 => "NSE_EQ",
        2 => "NSE_FNO",
        3 => "BSE_EQ",
        4 => "MCX_COMM",
        _ => "NSE_FNO",
    }
}
