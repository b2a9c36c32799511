// SPDX-License-Identifier: Apache-2.0

//! IP anonymization for the `requestmonitor.anonymizeIPs` config key.

use std::net::IpAddr;

/// Zeroes the last octet of an IPv4 address or the last 80 bits of an IPv6
/// address. Falls back to returning the input unchanged if it does not
/// parse as an IP (callers should not fail a request over a malformed
/// client-IP header).
pub fn anonymize_ip(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let [a, b, c, _] = v4.octets();
            format!("{a}.{b}.{c}.0")
        }
        Ok(IpAddr::V6(v6)) => {
            let mut segments = v6.segments();
            for segment in segments.iter_mut().skip(3) {
                *segment = 0;
            }
            let anon = std::net::Ipv6Addr::from(segments);
            anon.to_string()
        }
        Err(_) => ip.to_string(),
    }
}
