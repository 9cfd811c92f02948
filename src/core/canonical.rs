//! Value canonicalization
//!
//! The same semantic value can be written several ways: `10.0.0.1` and
//! `10.0.0.1/32`, `1024:2048` and `1024-2048`, `RELATED,ESTABLISHED` and
//! `ESTABLISHED,RELATED`, `warning` and `4`. Desired rules and dumped rules are
//! both run through these functions so that comparisons between them do not
//! depend on representation.

use crate::core::error::{Error, Result};
use crate::core::property::Family;
use ipnetwork::IpNetwork;

/// Separator between the bounds of a port range in canonical form
pub const RANGE_SEPARATOR: char = '-';

/// Separator between the bounds of a port range as the rule engine writes it
pub const WIRE_RANGE_SEPARATOR: char = ':';

/// Level the LOG target uses when `--log-level` is omitted
pub const DEFAULT_LOG_LEVEL: &str = "4";

/// Rewrites an address literal to CIDR notation of its network.
///
/// A bare host gets the full-length prefix (`/32` or `/128`); host bits under
/// a shorter prefix are cleared, as the kernel does.
///
/// # Errors
///
/// Returns [`Error::InvalidAddress`] if the literal does not parse or belongs
/// to a different family than `family`.
pub fn canonical_address(value: &str, family: Family) -> Result<String> {
    let invalid = |reason: String| Error::InvalidAddress {
        value: value.to_string(),
        reason,
    };

    let net: IpNetwork = value
        .trim()
        .parse()
        .map_err(|e| invalid(format!("{e}")))?;

    match (family, &net) {
        (Family::Ipv4, IpNetwork::V4(_)) | (Family::Ipv6, IpNetwork::V6(_)) => {}
        (Family::Ipv4, IpNetwork::V6(_)) => {
            return Err(invalid("IPv6 address in an IPv4 rule".to_string()));
        }
        (Family::Ipv6, IpNetwork::V4(_)) => {
            return Err(invalid("IPv4 address in an IPv6 rule".to_string()));
        }
        (Family::Ethernet, _) => {
            return Err(invalid("ethernet rules carry no IP addresses".to_string()));
        }
    }

    let network = IpNetwork::new(net.network(), net.prefix()).map_err(|e| invalid(format!("{e}")))?;
    Ok(network.to_string())
}

/// Splits a comma-separated port list and normalizes range separators.
///
/// Accepts both `:` (dump form) and `-` (declared form) inside an element.
pub fn split_port_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| p.replace(WIRE_RANGE_SEPARATOR, &RANGE_SEPARATOR.to_string()))
        .collect()
}

/// Validates one declared port element (`22` or `1024-2048`) and returns it in
/// canonical form.
///
/// # Errors
///
/// Returns [`Error::Validation`] for non-numeric ports, port 0, or inverted ranges.
pub fn canonical_port(element: &str) -> Result<String> {
    let element = element
        .trim()
        .replace(WIRE_RANGE_SEPARATOR, &RANGE_SEPARATOR.to_string());

    let parse = |p: &str| -> Result<u16> {
        let port: u16 = p
            .parse()
            .map_err(|_| Error::validation("port", format!("'{p}' is not a port number")))?;
        crate::validators::validate_port(port).map_err(|m| Error::validation("port", m))
    };

    match element.split_once(RANGE_SEPARATOR) {
        Some((low, high)) => {
            let (low, high) = crate::validators::validate_port_range(parse(low)?, parse(high)?)
                .map_err(|m| Error::validation("port", m))?;
            Ok(format!("{low}{RANGE_SEPARATOR}{high}"))
        }
        None => Ok(parse(&element)?.to_string()),
    }
}

/// Rewrites a canonical port element into the engine's range syntax
pub fn port_to_wire(element: &str) -> String {
    element.replace(RANGE_SEPARATOR, &WIRE_RANGE_SEPARATOR.to_string())
}

/// Sorts a connection-state set so equivalent sets compare equal
pub fn canonical_states<I, S>(states: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = states
        .into_iter()
        .flat_map(|s| {
            s.as_ref()
                .split(',')
                .map(|t| t.trim().to_uppercase())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
        })
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Interprets a declared switch value (`true`/`false`)
///
/// # Errors
///
/// Returns [`Error::Validation`] for anything else.
pub fn canonical_switch(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" => Ok(true),
        "false" | "no" => Ok(false),
        other => Err(Error::validation(
            "switch",
            format!("expected true or false, got '{other}'"),
        )),
    }
}

/// Maps a syslog level name to the number the LOG target stores.
///
/// # Errors
///
/// Returns [`Error::Validation`] for unknown names and out-of-range numbers.
pub fn canonical_log_level(value: &str) -> Result<String> {
    let value = value.trim().to_lowercase();
    let level = match value.as_str() {
        "emerg" | "panic" => 0,
        "alert" => 1,
        "crit" => 2,
        "err" | "error" => 3,
        "warn" | "warning" => 4,
        "not" | "notice" => 5,
        "info" => 6,
        "debug" => 7,
        n => match n.parse::<u8>() {
            Ok(level) if level <= 7 => level,
            _ => {
                return Err(Error::validation(
                    "log_level",
                    format!("unable to determine log level from '{value}'"),
                ));
            }
        },
    };
    Ok(level.to_string())
}

/// Maps an ICMP type name to its number for the given family.
///
/// Numeric values pass through unchanged.
///
/// # Errors
///
/// Returns [`Error::Validation`] for `any` and for unknown names.
pub fn canonical_icmp(value: &str, family: Family) -> Result<String> {
    let value = value.trim().to_lowercase();
    if value == "any" {
        return Err(Error::validation(
            "icmp",
            "'any' is not valid; omit the icmp property instead",
        ));
    }
    if value.parse::<u8>().is_ok() {
        return Ok(value);
    }

    let number = match family {
        Family::Ipv4 => match value.as_str() {
            "echo-reply" => Some(0),
            "destination-unreachable" => Some(3),
            "source-quench" => Some(4),
            "redirect" => Some(5),
            "echo-request" => Some(8),
            "router-advertisement" => Some(9),
            "router-solicitation" => Some(10),
            "time-exceeded" => Some(11),
            "parameter-problem" => Some(12),
            "timestamp-request" => Some(13),
            "timestamp-reply" => Some(14),
            "address-mask-request" => Some(17),
            "address-mask-reply" => Some(18),
            _ => None,
        },
        Family::Ipv6 => match value.as_str() {
            "destination-unreachable" => Some(1),
            "packet-too-big" | "too-big" => Some(2),
            "time-exceeded" => Some(3),
            "parameter-problem" => Some(4),
            "echo-request" => Some(128),
            "echo-reply" => Some(129),
            "router-solicitation" => Some(133),
            "router-advertisement" => Some(134),
            "neighbour-solicitation" | "neighbor-solicitation" => Some(135),
            "neighbour-advertisement" | "neighbor-advertisement" => Some(136),
            "redirect" => Some(137),
            _ => None,
        },
        Family::Ethernet => None,
    };

    number
        .map(|n: u16| n.to_string())
        .ok_or_else(|| Error::validation("icmp", format!("cannot work out icmp type '{value}'")))
}

fn parse_hex32(value: &str) -> Option<u32> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse::<u32>().ok(),
    }
}

/// Normalizes a MARK value (`mark` or `mark/mask`, decimal or hex).
///
/// Current iptables always stores a mask, so a missing one becomes
/// `0xffffffff`; `legacy` installations take a bare mark and no mask.
///
/// # Errors
///
/// Returns [`Error::Validation`] for values outside 32 bits, a trailing slash
/// with no mask, or a mask in legacy mode.
pub fn canonical_set_mark(value: &str, legacy: bool) -> Result<String> {
    let bad = |m: &str| Error::validation("set_mark", format!("{m} (got '{value}')"));

    let (mark, mask) = match value.split_once('/') {
        Some((mark, mask)) => {
            if mask.trim().is_empty() {
                return Err(bad("MARK mask must follow the slash"));
            }
            (mark, Some(mask))
        }
        None => (value, None),
    };

    let mark = parse_hex32(mark)
        .ok_or_else(|| bad("MARK value must be integer or hex between 0 and 0xffffffff"))?;

    if legacy {
        if mask.is_some() {
            return Err(bad("this iptables version does not support masks on MARK rules"));
        }
        return Ok(format!("{mark:#x}"));
    }

    let mask = match mask {
        Some(m) => parse_hex32(m)
            .ok_or_else(|| bad("MARK mask must be integer or hex between 0 and 0xffffffff"))?,
        None => u32::MAX,
    };
    Ok(format!("{mark:#x}/{mask:#x}"))
}
