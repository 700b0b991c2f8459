use log::debug;

use super::address::ip_to_int;
use super::errors::ParseError;
use super::record::{FlowAddr, FlowRecord};

const TOKENS_PER_LINE: usize = 14;
const BIDIRECTIONAL_MARKER: &str = "<->";

/// Outcome of parsing a single line.
///
/// `Ipv6Skipped` is an expected outcome when IPv6 is not allowed, the caller
/// has to match on it before touching any flow field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    Flow(FlowRecord),
    Ipv6Skipped,
}

/// Parses one line of the conversation table.
///
/// ```text
/// 23.36.44.166:443 <-> 163.33.141.15:52079  0 0 bytes  36136 2385012 bytes  36136 2385012 bytes 0,000000  71,916941
/// ```
pub fn parse(line: &str, allow_ipv6: bool) -> Result<ParsedLine, ParseError> {
    let tokens = line.split_whitespace().collect::<Vec<&str>>();
    if tokens.len() != TOKENS_PER_LINE {
        return Err(ParseError::Malformed(format!(
            "expected {} tokens, got {}",
            TOKENS_PER_LINE,
            tokens.len()
        )));
    }
    if tokens[1] != BIDIRECTIONAL_MARKER {
        return Err(ParseError::Malformed(format!(
            "expected '{}' between endpoints, got '{}'",
            BIDIRECTIONAL_MARKER, tokens[1]
        )));
    }

    if !allow_ipv6 && (looks_like_ipv6(tokens[0]) || looks_like_ipv6(tokens[2])) {
        return Ok(ParsedLine::Ipv6Skipped);
    }

    let (src, src_port) = parse_endpoint(tokens[0])?;
    let (dst, dst_port) = parse_endpoint(tokens[2])?;

    Ok(ParsedLine::Flow(FlowRecord {
        src,
        src_port,
        dst,
        dst_port,
        packets_src: parse_count(tokens[3])?,
        bytes_src: adjust_bytes(parse_count(tokens[4])?, tokens[5])?,
        packets_dst: parse_count(tokens[6])?,
        bytes_dst: adjust_bytes(parse_count(tokens[7])?, tokens[8])?,
        packets_total: parse_count(tokens[9])?,
        bytes_total: adjust_bytes(parse_count(tokens[10])?, tokens[11])?,
        start_ms: time_to_millis(tokens[12])?,
        duration_ms: duration_to_millis(tokens[13])?,
    }))
}

/// An endpoint with more than one colon cannot be `ipv4:port`.
fn looks_like_ipv6(endpoint: &str) -> bool {
    endpoint.split(':').count() > 2
}

/// Splits `address:port` on the last colon, so IPv6 literals keep theirs.
fn parse_endpoint(endpoint: &str) -> Result<(FlowAddr, u16), ParseError> {
    let (address, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| ParseError::Endpoint(endpoint.to_owned()))?;
    if address.is_empty() {
        return Err(ParseError::Endpoint(endpoint.to_owned()));
    }

    let port = port
        .parse::<u16>()
        .map_err(|e| ParseError::Number(format!("port '{port}': {e}")))?;

    let address = if address.contains(':') {
        FlowAddr::V6(address.to_owned())
    } else {
        FlowAddr::V4(ip_to_int(address)?)
    };

    Ok((address, port))
}

fn parse_count(token: &str) -> Result<u64, ParseError> {
    token
        .parse::<u64>()
        .map_err(|e| ParseError::Number(format!("'{token}': {e}")))
}

fn unit_exponent(unit: &str) -> Option<u32> {
    match unit {
        "bytes" => Some(0),
        "kB" => Some(1),
        "MB" => Some(2),
        "GB" => Some(3),
        "TB" => Some(4),
        _ => None,
    }
}

/// Expands a magnitude-suffixed byte count, base 1024.
///
/// Unknown suffixes leave the value untouched.
pub fn adjust_bytes(value: u64, unit: &str) -> Result<u64, ParseError> {
    let exponent = match unit_exponent(unit) {
        Some(e) => e,
        None => {
            debug!("unknown byte unit '{unit}', keeping {value} as is");
            return Ok(value);
        }
    };

    1024u64
        .checked_pow(exponent)
        .and_then(|multiplier| value.checked_mul(multiplier))
        .ok_or_else(|| ParseError::Overflow(format!("{value} {unit}")))
}

/// Largest time magnitude accepted, in milliseconds. Keeps every start,
/// end and timeline shift well inside `i64`.
pub const MAX_TIME_MS: f64 = 9_007_199_254_740_992.0;

/// Converts seconds written with a decimal comma into whole milliseconds:
/// the text is read as an `f64`, scaled by 1000 and truncated toward zero.
///
/// Float reading means `1,005` yields 1004, the same value every other tool
/// reading these tables computes.
pub fn time_to_millis(token: &str) -> Result<i64, ParseError> {
    let invalid = || ParseError::Number(format!("time '{token}'"));

    let normalized = token.replace(',', ".");
    let unsigned = normalized.strip_prefix('-').unwrap_or(&normalized);
    if !unsigned.bytes().any(|b| b.is_ascii_digit())
        || !unsigned.bytes().all(|b| b.is_ascii_digit() || b == b'.')
    {
        return Err(invalid());
    }

    let seconds = normalized.parse::<f64>().map_err(|_| invalid())?;
    let millis = (seconds * 1000.0).trunc();
    if millis.abs() > MAX_TIME_MS {
        return Err(ParseError::Overflow(format!("time '{token}'")));
    }

    Ok(millis as i64)
}

fn duration_to_millis(token: &str) -> Result<u64, ParseError> {
    let millis = time_to_millis(token)?;
    u64::try_from(millis).map_err(|_| ParseError::Number(format!("negative duration '{token}'")))
}
