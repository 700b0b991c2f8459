use std::net::Ipv4Addr;

use super::errors::ParseError;

/// Packs a dotted-quad address into a big-endian `u32`.
///
/// Exactly four decimal octets are accepted. An octet above 255 is reported
/// as [`ParseError::OctetOutOfRange`] rather than being wrapped or clamped.
pub fn ip_to_int(addr: &str) -> Result<u32, ParseError> {
    let octets = addr.split('.').collect::<Vec<&str>>();
    if octets.len() != 4 {
        return Err(ParseError::Address(addr.to_owned()));
    }

    let mut packed: u32 = 0;
    for octet in octets {
        if octet.is_empty() || !octet.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::Address(addr.to_owned()));
        }

        let value = octet
            .parse::<u32>()
            .map_err(|_| ParseError::OctetOutOfRange(addr.to_owned()))?;
        if value > 255 {
            return Err(ParseError::OctetOutOfRange(addr.to_owned()));
        }

        packed = (packed << 8) | value;
    }

    Ok(packed)
}

pub fn int_to_ip(packed: u32) -> String {
    Ipv4Addr::from(packed).to_string()
}
