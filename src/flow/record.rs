use serde::{Deserialize, Serialize};
use std::fmt;

use super::address::int_to_ip;

/// Endpoint address of a flow.
///
/// IPv4 addresses are kept packed, IPv6 ones are carried as the literal text
/// found in the input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlowAddr {
    V4(u32),
    V6(String),
}

impl FlowAddr {
    /// Text stored in the address column: the decimal value for IPv4,
    /// the literal for IPv6.
    pub fn to_storage(&self) -> String {
        match self {
            Self::V4(packed) => packed.to_string(),
            Self::V6(literal) => literal.clone(),
        }
    }

    pub fn from_storage(value: &str) -> Self {
        match value.parse::<u32>() {
            Ok(packed) => Self::V4(packed),
            Err(_) => Self::V6(value.to_owned()),
        }
    }
}

impl fmt::Display for FlowAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::V4(packed) => write!(f, "{}", int_to_ip(*packed)),
            Self::V6(literal) => write!(f, "{}", literal),
        }
    }
}

/// Directional 4-tuple identifying fragments of the same flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: FlowAddr,
    pub src_port: u16,
    pub dst: FlowAddr,
    pub dst_port: u16,
}

/// One bidirectional flow as summarized by the conversation table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub src: FlowAddr,
    pub src_port: u16,
    pub dst: FlowAddr,
    pub dst_port: u16,
    #[serde(rename = "npackets_src")]
    pub packets_src: u64,
    #[serde(rename = "nbytes_src")]
    pub bytes_src: u64,
    #[serde(rename = "npackets_dst")]
    pub packets_dst: u64,
    #[serde(rename = "nbytes_dst")]
    pub bytes_dst: u64,
    #[serde(rename = "npackets_total")]
    pub packets_total: u64,
    #[serde(rename = "nbytes_total")]
    pub bytes_total: u64,
    #[serde(rename = "start")]
    pub start_ms: i64,
    #[serde(rename = "duration")]
    pub duration_ms: u64,
}

impl FlowRecord {
    pub fn key(&self) -> FlowKey {
        FlowKey {
            src: self.src.clone(),
            src_port: self.src_port,
            dst: self.dst.clone(),
            dst_port: self.dst_port,
        }
    }

    pub fn end_ms(&self) -> i64 {
        self.start_ms + self.duration_ms as i64
    }

    /// Bytes per second, zero for flows without duration.
    pub fn rate(&self) -> f64 {
        if self.duration_ms == 0 {
            return 0.0;
        }
        self.bytes_total as f64 / (self.duration_ms as f64 / 1000.0)
    }

    /// Renders the record back into the 14 token layout it was parsed from,
    /// with every byte count expressed in plain `bytes`.
    pub fn to_line(&self) -> String {
        format!(
            "{}:{} <-> {}:{} {} {} bytes {} {} bytes {} {} bytes {} {}",
            self.src,
            self.src_port,
            self.dst,
            self.dst_port,
            self.packets_src,
            self.bytes_src,
            self.packets_dst,
            self.bytes_dst,
            self.packets_total,
            self.bytes_total,
            millis_to_seconds(self.start_ms),
            millis_to_seconds(self.duration_ms as i64),
        )
    }
}

/// Seconds with six decimals pointing at the middle of the millisecond, so
/// the float reading of the parser truncates back to `ms`.
fn millis_to_seconds(ms: i64) -> String {
    let sign = if ms < 0 { "-" } else { "" };
    let ms = ms.unsigned_abs();
    format!("{}{},{:03}500", sign, ms / 1000, ms % 1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(FlowAddr::V4(167_772_161), "167772161"; "ipv4 stored as its integer")]
    #[test_case(FlowAddr::V6("2001:db8::1".to_owned()), "2001:db8::1"; "ipv6 stored verbatim")]
    fn test_storage_text(addr: FlowAddr, expected: &str) {
        assert_eq!(addr.to_storage(), expected);
        assert_eq!(FlowAddr::from_storage(expected), addr);
    }

    #[test_case(0, 0, 0.0; "no duration")]
    #[test_case(2_048, 2_000, 1_024.0; "two seconds")]
    #[test_case(1_000, 500, 2_000.0; "half a second")]
    fn test_rate(bytes_total: u64, duration_ms: u64, expected: f64) {
        let record = FlowRecord {
            src: FlowAddr::V4(1),
            src_port: 1,
            dst: FlowAddr::V4(2),
            dst_port: 2,
            packets_src: 0,
            bytes_src: 0,
            packets_dst: 0,
            bytes_dst: 0,
            packets_total: 0,
            bytes_total,
            start_ms: 0,
            duration_ms,
        };
        assert_eq!(record.rate(), expected);
    }

    #[test_case(71_916, "71,916500"; "seconds and millis")]
    #[test_case(5, "0,005500"; "padded millis")]
    #[test_case(-1_500, "-1,500500"; "negative")]
    fn test_millis_to_seconds(ms: i64, expected: &str) {
        assert_eq!(millis_to_seconds(ms), expected);
    }
}
